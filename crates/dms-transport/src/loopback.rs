//! In-process device network.
//!
//! Every device attached to a [`LoopbackNetwork`] gets its own
//! [`LoopbackTransport`]. Sessions opened between devices are routed through
//! the network, and all listener callbacks run on one worker thread owned by
//! the network, the way a real session substrate delivers them.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::traits::{
    SessionAttribute, SessionId, SessionListener, SessionTransport, TransportError, OPEN_SUCCESS,
};

/// `on_session_opened` result when the peer has no matching session server.
pub const OPEN_NO_PEER_SERVER: i32 = -2;

#[derive(Clone)]
struct Route {
    listener: Arc<dyn SessionListener>,
    peer: SessionId,
}

enum Delivery {
    Opened { session_id: SessionId, result: i32 },
    Closed { session_id: SessionId },
    Bytes { session_id: SessionId, data: Bytes },
}

struct Event {
    listener: Arc<dyn SessionListener>,
    delivery: Delivery,
}

/// Shared state of the simulated network.
///
/// The network holds every registered listener strongly, and a listener
/// usually owns the [`LoopbackTransport`] that points back here. Each
/// device must call `remove_session_server` (the session manager does so
/// on shutdown) to break that cycle; otherwise the network and its
/// delivery thread outlive every handle.
pub struct LoopbackNetwork {
    /// (device id, session name) -> registered listener
    servers: DashMap<(String, String), Arc<dyn SessionListener>>,
    /// Local session id -> listener on this end and session id on the other end
    routes: DashMap<SessionId, Route>,
    next_session_id: AtomicI32,
    events: mpsc::UnboundedSender<Event>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackNetwork {
    /// Create a network and start its delivery thread.
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let worker = std::thread::Builder::new()
            .name("loopback-transport".into())
            .spawn(move || {
                while let Some(event) = rx.blocking_recv() {
                    match event.delivery {
                        Delivery::Opened { session_id, result } => {
                            event.listener.on_session_opened(session_id, result);
                        }
                        Delivery::Closed { session_id } => event.listener.on_session_closed(session_id),
                        Delivery::Bytes { session_id, data } => {
                            event.listener.on_bytes_received(session_id, &data)
                        }
                    }
                }
            })
            .ok();
        if worker.is_none() {
            warn!("failed to spawn loopback delivery thread");
        }

        Arc::new(Self {
            servers: DashMap::new(),
            routes: DashMap::new(),
            next_session_id: AtomicI32::new(1),
            events: tx,
            worker: Mutex::new(worker),
        })
    }

    /// Attach a device and get its transport handle.
    pub fn attach(self: &Arc<Self>, device_id: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            device_id: device_id.into(),
            network: Arc::clone(self),
        }
    }

    /// Number of session ends currently routed.
    pub fn open_sessions(&self) -> usize {
        self.routes.len()
    }

    /// Whether the delivery thread is running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    fn enqueue(&self, listener: Arc<dyn SessionListener>, delivery: Delivery) {
        if self.events.send(Event { listener, delivery }).is_err() {
            debug!("loopback delivery thread gone, dropping event");
        }
    }

    fn allocate(&self) -> SessionId {
        SessionId(self.next_session_id.fetch_add(1, Ordering::SeqCst))
    }

    fn has_device(&self, device_id: &str) -> bool {
        self.servers.iter().any(|entry| entry.key().0 == device_id)
    }
}

/// One device's view of the [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    device_id: String,
    network: Arc<LoopbackNetwork>,
}

impl LoopbackTransport {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn server(&self, device_id: &str, session_name: &str) -> Option<Arc<dyn SessionListener>> {
        self.network
            .servers
            .get(&(device_id.to_string(), session_name.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl SessionTransport for LoopbackTransport {
    fn create_session_server(
        &self,
        _module_name: &str,
        session_name: &str,
        listener: Arc<dyn SessionListener>,
    ) -> Result<(), TransportError> {
        let key = (self.device_id.clone(), session_name.to_string());
        if self.network.servers.contains_key(&key) {
            return Err(TransportError::ServerExists(session_name.to_string()));
        }
        self.network.servers.insert(key, listener);
        debug!(device = %self.device_id, session_name, "session server created");
        Ok(())
    }

    fn remove_session_server(&self, _module_name: &str, session_name: &str) -> Result<(), TransportError> {
        let key = (self.device_id.clone(), session_name.to_string());
        let Some((_, listener)) = self.network.servers.remove(&key) else {
            return Err(TransportError::NoServer(session_name.to_string()));
        };
        // Drop any routes still pointing at the removed listener.
        self.network
            .routes
            .retain(|_, route| !Arc::ptr_eq(&route.listener, &listener));
        Ok(())
    }

    fn open_session(
        &self,
        own_session_name: &str,
        peer_session_name: &str,
        peer_device_id: &str,
        _module_name: &str,
        _attr: &SessionAttribute,
    ) -> Result<SessionId, TransportError> {
        let local_listener = self
            .server(&self.device_id, own_session_name)
            .ok_or_else(|| TransportError::NoServer(own_session_name.to_string()))?;
        if !self.network.has_device(peer_device_id) {
            return Err(TransportError::PeerUnreachable(peer_device_id.to_string()));
        }

        let local_id = self.network.allocate();
        let Some(remote_listener) = self.server(peer_device_id, peer_session_name) else {
            self.network.enqueue(
                local_listener,
                Delivery::Opened {
                    session_id: local_id,
                    result: OPEN_NO_PEER_SERVER,
                },
            );
            return Ok(local_id);
        };

        let remote_id = self.network.allocate();
        self.network.routes.insert(
            local_id,
            Route {
                listener: Arc::clone(&local_listener),
                peer: remote_id,
            },
        );
        self.network.routes.insert(
            remote_id,
            Route {
                listener: Arc::clone(&remote_listener),
                peer: local_id,
            },
        );

        self.network.enqueue(
            remote_listener,
            Delivery::Opened {
                session_id: remote_id,
                result: OPEN_SUCCESS,
            },
        );
        self.network.enqueue(
            local_listener,
            Delivery::Opened {
                session_id: local_id,
                result: OPEN_SUCCESS,
            },
        );
        Ok(local_id)
    }

    fn send_bytes(&self, session_id: SessionId, data: &[u8]) -> Result<(), TransportError> {
        let peer = self
            .network
            .routes
            .get(&session_id)
            .map(|route| route.peer)
            .ok_or(TransportError::InvalidSession(session_id))?;
        let listener = self
            .network
            .routes
            .get(&peer)
            .map(|route| Arc::clone(&route.listener))
            .ok_or(TransportError::InvalidSession(peer))?;

        self.network.enqueue(
            listener,
            Delivery::Bytes {
                session_id: peer,
                data: Bytes::copy_from_slice(data),
            },
        );
        Ok(())
    }

    fn close_session(&self, session_id: SessionId) {
        let Some((_, route)) = self.network.routes.remove(&session_id) else {
            return;
        };
        if let Some((peer_id, peer_route)) = self.network.routes.remove(&route.peer) {
            self.network
                .enqueue(peer_route.listener, Delivery::Closed { session_id: peer_id });
        }
    }
}
