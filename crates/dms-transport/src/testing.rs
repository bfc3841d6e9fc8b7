//! Scripted transport for unit tests.
//!
//! `MockSessionTransport` records every adapter call and never delivers
//! callbacks on its own; tests drive `on_session_opened` and friends through
//! the `deliver_*` helpers, which keeps state-machine tests deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use crate::traits::{SessionAttribute, SessionId, SessionListener, SessionTransport, TransportError};

/// One recorded adapter call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    CreateServer { module_name: String, session_name: String },
    RemoveServer { module_name: String, session_name: String },
    Open { peer_device_id: String, peer_session_name: String },
    Send { session_id: SessionId, data: Vec<u8> },
    Close { session_id: SessionId },
}

/// Mock transport for testing
pub struct MockSessionTransport {
    calls: Mutex<Vec<TransportCall>>,
    servers: Mutex<HashMap<String, Arc<dyn SessionListener>>>,
    next_session_id: AtomicI32,
    fail_open: AtomicBool,
    fail_send: AtomicBool,
    packet_loss: f64,
}

impl MockSessionTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            servers: Mutex::new(HashMap::new()),
            next_session_id: AtomicI32::new(1),
            fail_open: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            packet_loss: 0.0,
        }
    }

    /// Configure simulated send loss (0.0 - 1.0)
    pub fn with_packet_loss(mut self, loss: f64) -> Self {
        self.packet_loss = loss.clamp(0.0, 1.0);
        self
    }

    /// Make subsequent `open_session` calls fail synchronously.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `send_bytes` calls fail.
    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Number of `open_session` calls so far.
    pub fn open_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, TransportCall::Open { .. }))
            .count()
    }

    /// Payloads written with `send_bytes`.
    pub fn sent(&self) -> Vec<(SessionId, Vec<u8>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Send { session_id, data } => Some((*session_id, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Session ids passed to `close_session`.
    pub fn closed(&self) -> Vec<SessionId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Close { session_id } => Some(*session_id),
                _ => None,
            })
            .collect()
    }

    /// Id that the most recent successful `open_session` returned.
    pub fn last_opened(&self) -> Option<SessionId> {
        let next = self.next_session_id.load(Ordering::SeqCst);
        (next > 1).then(|| SessionId(next - 1))
    }

    /// Clear recorded calls
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn listener(&self, session_name: &str) -> Option<Arc<dyn SessionListener>> {
        self.servers.lock().get(session_name).cloned()
    }

    /// Deliver `on_session_opened` to the listener registered for `session_name`.
    pub fn deliver_opened(&self, session_name: &str, session_id: SessionId, result: i32) -> Option<i32> {
        self.listener(session_name)
            .map(|l| l.on_session_opened(session_id, result))
    }

    /// Deliver `on_bytes_received`.
    pub fn deliver_bytes(&self, session_name: &str, session_id: SessionId, data: &[u8]) {
        if let Some(listener) = self.listener(session_name) {
            listener.on_bytes_received(session_id, data);
        }
    }

    /// Deliver `on_session_closed`.
    pub fn deliver_closed(&self, session_name: &str, session_id: SessionId) {
        if let Some(listener) = self.listener(session_name) {
            listener.on_session_closed(session_id);
        }
    }
}

impl Default for MockSessionTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTransport for MockSessionTransport {
    fn create_session_server(
        &self,
        module_name: &str,
        session_name: &str,
        listener: Arc<dyn SessionListener>,
    ) -> Result<(), TransportError> {
        let mut servers = self.servers.lock();
        if servers.contains_key(session_name) {
            return Err(TransportError::ServerExists(session_name.to_string()));
        }
        servers.insert(session_name.to_string(), listener);
        self.calls.lock().push(TransportCall::CreateServer {
            module_name: module_name.to_string(),
            session_name: session_name.to_string(),
        });
        Ok(())
    }

    fn remove_session_server(&self, module_name: &str, session_name: &str) -> Result<(), TransportError> {
        if self.servers.lock().remove(session_name).is_none() {
            return Err(TransportError::NoServer(session_name.to_string()));
        }
        self.calls.lock().push(TransportCall::RemoveServer {
            module_name: module_name.to_string(),
            session_name: session_name.to_string(),
        });
        Ok(())
    }

    fn open_session(
        &self,
        _own_session_name: &str,
        peer_session_name: &str,
        peer_device_id: &str,
        _module_name: &str,
        _attr: &SessionAttribute,
    ) -> Result<SessionId, TransportError> {
        self.calls.lock().push(TransportCall::Open {
            peer_device_id: peer_device_id.to_string(),
            peer_session_name: peer_session_name.to_string(),
        });
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::PeerUnreachable(peer_device_id.to_string()));
        }
        Ok(SessionId(self.next_session_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn send_bytes(&self, session_id: SessionId, data: &[u8]) -> Result<(), TransportError> {
        self.calls.lock().push(TransportCall::Send {
            session_id,
            data: data.to_vec(),
        });
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidSession(session_id));
        }

        let should_drop = {
            let mut rng = rand::thread_rng();
            rng.gen::<f64>() < self.packet_loss
        };
        if should_drop {
            return Err(TransportError::Other("Packet lost".to_string()));
        }
        Ok(())
    }

    fn close_session(&self, session_id: SessionId) {
        self.calls.lock().push(TransportCall::Close { session_id });
    }
}
