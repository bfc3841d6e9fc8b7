//! Request dispatch.
//!
//! Transport callbacks and API calls never do protocol work themselves; they
//! post a [`Request`] to a bounded queue and return. A single [`Dispatcher`]
//! task drains the queue, decodes packets, runs permission checks and sends
//! replies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use dms_proto::{DmsMessage, StartAbilityReply, StartAbilityRequest, MAX_PACKET_SIZE};
use dms_transport::SessionId;

use crate::ability::{AbilityLauncher, Want};
use crate::errors::{codes, DmsError, DmsResult};
use crate::permission::{CallerInfo, PermissionCheckInfo, PermissionVerifier};
use crate::session::{CompletionListener, SessionManager};

// ============================================================================
// Requests
// ============================================================================

/// Kind of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    BytesReceived,
    SessionOpen,
    SessionClose,
    StartRemoteAbility,
}

/// Unit of work for the dispatcher.
pub enum Request {
    /// Packet received on a session; the dispatcher owns the buffer.
    BytesReceived { session_id: SessionId, payload: Bytes },
    /// A peer opened a session to us.
    SessionOpened { session_id: SessionId },
    SessionClosed { session_id: SessionId },
    StartRemoteAbility {
        want: Want,
        caller: CallerInfo,
        listener: Arc<dyn CompletionListener>,
    },
}

impl Request {
    pub fn message_id(&self) -> MessageId {
        match self {
            Request::BytesReceived { .. } => MessageId::BytesReceived,
            Request::SessionOpened { .. } => MessageId::SessionOpen,
            Request::SessionClosed { .. } => MessageId::SessionClose,
            Request::StartRemoteAbility { .. } => MessageId::StartRemoteAbility,
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::BytesReceived { session_id, payload } => f
                .debug_struct("BytesReceived")
                .field("session_id", session_id)
                .field("len", &payload.len())
                .finish(),
            Request::SessionOpened { session_id } => {
                f.debug_struct("SessionOpened").field("session_id", session_id).finish()
            }
            Request::SessionClosed { session_id } => {
                f.debug_struct("SessionClosed").field("session_id", session_id).finish()
            }
            Request::StartRemoteAbility { want, caller, .. } => f
                .debug_struct("StartRemoteAbility")
                .field("want", want)
                .field("caller", caller)
                .finish_non_exhaustive(),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics for dispatch operations.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Requests submitted to the queue
    pub received: AtomicU64,
    /// Requests handled by the dispatcher
    pub dispatched: AtomicU64,
    /// Requests dropped because the queue was full or closed
    pub dropped: AtomicU64,
    /// Packets that failed to decode
    pub decode_failures: AtomicU64,
    /// Start requests refused by the permission check
    pub permission_denials: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            permission_denials: self.permission_denials.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of dispatch statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub decode_failures: u64,
    pub permission_denials: u64,
}

// ============================================================================
// Queue
// ============================================================================

/// Producer side of the dispatch queue. Cheap to clone.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Request>,
    stats: Arc<DispatchStats>,
}

impl DispatchHandle {
    /// Queue a request without blocking. Returns `false` if it was dropped.
    pub fn submit(&self, request: Request) -> bool {
        DispatchStats::inc(&self.stats.received);
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                DispatchStats::inc(&self.stats.dropped);
                debug!(kind = ?request.message_id(), "dispatch queue full, dropping request");
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                DispatchStats::inc(&self.stats.dropped);
                debug!(kind = ?request.message_id(), "dispatcher stopped, dropping request");
                false
            }
        }
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }
}

/// Create a dispatch queue holding at most `depth` requests.
pub fn channel(depth: usize) -> (DispatchHandle, mpsc::Receiver<Request>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let handle = DispatchHandle {
        tx,
        stats: Arc::new(DispatchStats::new()),
    };
    (handle, rx)
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Consumer side of the dispatch queue.
pub struct Dispatcher {
    rx: mpsc::Receiver<Request>,
    stats: Arc<DispatchStats>,
    session: Arc<SessionManager>,
    verifier: Arc<PermissionVerifier>,
    launcher: Arc<dyn AbilityLauncher>,
}

impl Dispatcher {
    pub fn new(
        rx: mpsc::Receiver<Request>,
        handle: &DispatchHandle,
        session: Arc<SessionManager>,
        verifier: Arc<PermissionVerifier>,
        launcher: Arc<dyn AbilityLauncher>,
    ) -> Self {
        Self {
            rx,
            stats: Arc::clone(&handle.stats),
            session,
            verifier,
            launcher,
        }
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Drain the queue until `shutdown` flips to `true` or every
    /// [`DispatchHandle`] is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }

    /// Handle everything currently queued. Returns the number handled.
    pub fn try_drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(request) = self.rx.try_recv() {
            self.handle(request);
            handled += 1;
        }
        handled
    }

    /// Handle a single request.
    pub fn handle(&self, request: Request) {
        DispatchStats::inc(&self.stats.dispatched);
        match request {
            Request::BytesReceived { session_id, payload } => self.on_packet(session_id, &payload),
            Request::SessionOpened { session_id } => {
                debug!(session_id = %session_id, "peer opened session");
            }
            Request::SessionClosed { session_id } => {
                debug!(session_id = %session_id, "session closed");
            }
            Request::StartRemoteAbility {
                want,
                caller,
                listener,
            } => {
                if let Err(e) = self.start_remote(&want, &caller, Arc::clone(&listener)) {
                    warn!(device = %want.device_id, error = %e, "remote ability start failed");
                    listener.on_complete(Err(e));
                }
            }
        }
    }

    fn on_packet(&self, session_id: SessionId, packet: &[u8]) {
        match DmsMessage::decode(packet) {
            Ok(DmsMessage::StartAbility(request)) => self.on_start_request(session_id, request),
            Ok(DmsMessage::StartAbilityReply(reply)) => {
                let outcome = DmsError::from_code(reply.result_code);
                if !self.session.complete(session_id, outcome) {
                    debug!(session_id = %session_id, "reply for untracked session dropped");
                }
            }
            Err(e) => {
                DispatchStats::inc(&self.stats.decode_failures);
                warn!(session_id = %session_id, error = %e, "failed to decode packet");
            }
        }
    }

    fn on_start_request(&self, session_id: SessionId, request: StartAbilityRequest) {
        let info = PermissionCheckInfo {
            callee_bundle_name: request.callee_bundle_name.clone(),
            caller_signature: request.caller_signature,
        };
        let result = self.verifier.check_remote_permission(&info).and_then(|()| {
            self.launcher
                .start_ability_from_remote(&request.callee_bundle_name, &request.callee_ability_name)
        });

        let code = match &result {
            Ok(()) => codes::SUCCESS,
            Err(e) => {
                if matches!(e, DmsError::PermissionMismatch | DmsError::UnauthorizedCaller) {
                    DispatchStats::inc(&self.stats.permission_denials);
                }
                warn!(
                    session_id = %session_id,
                    bundle = %request.callee_bundle_name,
                    error = %e,
                    "remote start refused"
                );
                e.code()
            }
        };

        let sent = StartAbilityReply::new(code)
            .encode()
            .map_err(DmsError::from)
            .and_then(|reply| self.session.send_reply(session_id, &reply));
        if let Err(e) = sent {
            warn!(session_id = %session_id, error = %e, "failed to send start reply");
        }
    }

    /// Native callers resolve their identity from a file, so the lookup
    /// leaves the async worker on a multi-thread runtime. On a
    /// current-thread runtime it runs inline; the store holds one short
    /// file per native uid.
    fn start_remote(
        &self,
        want: &Want,
        caller: &CallerInfo,
        listener: Arc<dyn CompletionListener>,
    ) -> DmsResult<()> {
        let identity = run_blocking(|| self.verifier.get_app_id(caller, MAX_PACKET_SIZE));
        let signature = match identity {
            Ok(identity) => identity.signature().to_string(),
            Err(e) => {
                warn!(uid = caller.uid, error = %e, "caller identity unavailable, sending empty signature");
                String::new()
            }
        };
        let packet =
            StartAbilityRequest::new(&want.bundle_name, &want.ability_name, Some(signature)).encode()?;
        self.session.send_message(&packet, &want.device_id, listener)
    }
}

fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PermissionConfig, SessionConfig};
    use crate::harness::{install_app, RecordingLauncher};
    use crate::registry::{InMemoryRegistry, RegistryEndpoints};
    use dms_transport::{MockSessionTransport, OPEN_SUCCESS};
    use parking_lot::Mutex;

    const SESSION: &str = "com.huawei.harmonyos.foundation.dms";

    struct Fixture {
        transport: Arc<MockSessionTransport>,
        registry: Arc<InMemoryRegistry>,
        launcher: Arc<RecordingLauncher>,
        session: Arc<SessionManager>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        fixture_with(PermissionConfig::default())
    }

    fn fixture_with(permission: PermissionConfig) -> Fixture {
        let transport = Arc::new(MockSessionTransport::new());
        let registry = Arc::new(InMemoryRegistry::new());
        let launcher = Arc::new(RecordingLauncher::default());
        let (handle, rx) = channel(8);
        let session = Arc::new(SessionManager::new(
            transport.clone(),
            handle.clone(),
            SessionConfig::default(),
        ));
        session.initialize().unwrap();
        let verifier = Arc::new(PermissionVerifier::new(
            &permission,
            RegistryEndpoints::shared(registry.clone()),
        ));
        let dispatcher = Dispatcher::new(rx, &handle, session.clone(), verifier, launcher.clone());
        Fixture {
            transport,
            registry,
            launcher,
            session,
            dispatcher,
        }
    }

    fn reply_code(data: &[u8]) -> u16 {
        match DmsMessage::decode(data).unwrap() {
            DmsMessage::StartAbilityReply(reply) => reply.result_code,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    fn inbound(fx: &mut Fixture, signature: Option<&str>) -> u16 {
        let packet = StartAbilityRequest::new("com.app", "Main", signature.map(str::to_string))
            .encode()
            .unwrap();
        fx.transport.deliver_bytes(SESSION, SessionId(40), &packet);
        assert_eq!(fx.dispatcher.try_drain(), 1);
        let sent = fx.transport.sent();
        let (id, data) = sent.last().unwrap();
        assert_eq!(*id, SessionId(40));
        reply_code(data)
    }

    #[test]
    fn test_authorized_request_starts_ability() {
        let mut fx = fixture();
        install_app(&fx.registry, "com.app", 10_010, "SIG123");

        assert_eq!(inbound(&mut fx, Some("SIG123")), codes::SUCCESS);
        assert_eq!(fx.launcher.started(), vec![("com.app".to_string(), "Main".to_string())]);
    }

    #[test]
    fn test_mismatched_request_is_refused() {
        let mut fx = fixture();
        install_app(&fx.registry, "com.app", 10_010, "SIG123");

        assert_eq!(inbound(&mut fx, Some("SIG999")), codes::PERMISSION_MISMATCH);
        assert!(fx.launcher.started().is_empty());
        assert_eq!(fx.dispatcher.stats().snapshot().permission_denials, 1);
    }

    #[test]
    fn test_unknown_callee_reports_lookup_failure() {
        let mut fx = fixture();
        assert_eq!(inbound(&mut fx, Some("SIG123")), codes::BUNDLE_LOOKUP_FAILURE);
    }

    #[test]
    fn test_garbage_is_counted() {
        let mut fx = fixture();
        fx.transport.deliver_bytes(SESSION, SessionId(3), &[0xFF, 0x01, 0x00]);
        fx.dispatcher.try_drain();
        assert_eq!(fx.dispatcher.stats().snapshot().decode_failures, 1);
        assert!(fx.transport.sent().is_empty());
    }

    #[test]
    fn test_reply_completes_tracked_session() {
        let mut fx = fixture();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let listener: Arc<dyn CompletionListener> =
            Arc::new(move |r: DmsResult<()>| sink.lock().push(r));

        fx.session.send_message(b"req", "peer", listener).unwrap();
        let id = fx.transport.last_opened().unwrap();
        fx.transport.deliver_opened(SESSION, id, OPEN_SUCCESS);

        let reply = StartAbilityReply::new(codes::PERMISSION_MISMATCH).encode().unwrap();
        // a reply on some other session is ignored
        fx.transport.deliver_bytes(SESSION, SessionId(99), &reply);
        fx.transport.deliver_bytes(SESSION, id, &reply);
        fx.dispatcher.try_drain();

        assert_eq!(*outcomes.lock(), vec![Err(DmsError::PermissionMismatch)]);
        assert!(!fx.session.is_busy());
    }

    #[test]
    fn test_start_remote_ability_sends_caller_signature() {
        let mut fx = fixture();
        install_app(&fx.registry, "com.caller", 10_020, "CALLERSIG");

        let listener: Arc<dyn CompletionListener> = Arc::new(|_r: DmsResult<()>| {});
        fx.dispatcher.handle(Request::StartRemoteAbility {
            want: Want::new("peer", "com.app", "Main"),
            caller: CallerInfo::new(10_020),
            listener,
        });
        let id = fx.transport.last_opened().unwrap();
        fx.transport.deliver_opened(SESSION, id, OPEN_SUCCESS);

        let sent = fx.transport.sent();
        match DmsMessage::decode(&sent[0].1).unwrap() {
            DmsMessage::StartAbility(request) => {
                assert_eq!(request.callee_bundle_name, "com.app");
                assert_eq!(request.callee_ability_name, "Main");
                assert_eq!(request.caller_signature.as_deref(), Some("CALLERSIG"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.dispatcher.try_drain(), 0);
    }

    #[test]
    fn test_start_remote_ability_reports_busy() {
        let fx = fixture();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let listener: Arc<dyn CompletionListener> =
            Arc::new(move |r: DmsResult<()>| sink.lock().push(r));

        let first: Arc<dyn CompletionListener> = Arc::new(|_r: DmsResult<()>| {});
        fx.session.send_message(b"occupied", "peer", first).unwrap();
        fx.dispatcher.handle(Request::StartRemoteAbility {
            want: Want::new("peer", "com.app", "Main"),
            caller: CallerInfo::new(10_020),
            listener,
        });
        assert_eq!(*outcomes.lock(), vec![Err(DmsError::Busy)]);
    }

    fn sent_signature(fx: &Fixture) -> Option<String> {
        let id = fx.transport.last_opened().unwrap();
        fx.transport.deliver_opened(SESSION, id, OPEN_SUCCESS);
        match DmsMessage::decode(&fx.transport.sent()[0].1).unwrap() {
            DmsMessage::StartAbility(request) => request.caller_signature,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_native_caller_identity_on_multi_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("uid_7_appid"), b"native-svc").unwrap();
        let fx = fixture_with(PermissionConfig {
            native_appid_dir: dir.path().to_path_buf(),
            ..PermissionConfig::default()
        });

        let listener: Arc<dyn CompletionListener> = Arc::new(|_r: DmsResult<()>| {});
        fx.dispatcher.handle(Request::StartRemoteAbility {
            want: Want::new("peer", "com.app", "Main"),
            caller: CallerInfo::new(7),
            listener,
        });
        assert_eq!(sent_signature(&fx).as_deref(), Some("native-svc"));
    }

    #[tokio::test]
    async fn test_native_caller_identity_on_current_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("uid_7_appid"), b"native-svc").unwrap();
        let fx = fixture_with(PermissionConfig {
            native_appid_dir: dir.path().to_path_buf(),
            ..PermissionConfig::default()
        });

        let listener: Arc<dyn CompletionListener> = Arc::new(|_r: DmsResult<()>| {});
        fx.dispatcher.handle(Request::StartRemoteAbility {
            want: Want::new("peer", "com.app", "Main"),
            caller: CallerInfo::new(7),
            listener,
        });
        assert_eq!(sent_signature(&fx).as_deref(), Some("native-svc"));
    }
}
