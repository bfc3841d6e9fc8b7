//! Transport adapter and session callback traits.

use std::fmt;
use std::sync::Arc;

/// `on_session_opened` result reported for a successfully opened session.
pub const OPEN_SUCCESS: i32 = 0;

/// Opaque, non-negative handle of an open session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub i32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload kind carried by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DataType {
    #[default]
    Bytes,
    Message,
}

/// Attributes passed when opening a session.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionAttribute {
    pub data_type: DataType,
}

/// Callbacks delivered by the transport on its own thread.
///
/// Implementations are registered once per session server and stay fixed for
/// the server's lifetime.
pub trait SessionListener: Send + Sync {
    /// A session (outbound or inbound) finished opening. `result` is
    /// [`OPEN_SUCCESS`] or a transport-specific failure code.
    fn on_session_opened(&self, session_id: SessionId, result: i32) -> i32;

    /// The session was closed by either side.
    fn on_session_closed(&self, session_id: SessionId);

    /// Bytes arrived on the session. `data` is only valid for the call.
    fn on_bytes_received(&self, session_id: SessionId, data: &[u8]);

    /// Message-typed payloads are not used by the scheduler.
    fn on_message_received(&self, _session_id: SessionId, _data: &[u8]) {}
}

/// Device-to-device session transport.
///
/// Contract: callbacks are never invoked synchronously from inside
/// `open_session`, `send_bytes` or `close_session`; they are delivered on a
/// transport-owned thread.
pub trait SessionTransport: Send + Sync {
    /// Register `listener` for sessions named `session_name`.
    fn create_session_server(
        &self,
        module_name: &str,
        session_name: &str,
        listener: Arc<dyn SessionListener>,
    ) -> Result<(), TransportError>;

    /// Unregister the session server created by `create_session_server`.
    fn remove_session_server(&self, module_name: &str, session_name: &str) -> Result<(), TransportError>;

    /// Start opening a session to `peer_device_id`. Completion is reported
    /// through `on_session_opened`.
    fn open_session(
        &self,
        own_session_name: &str,
        peer_session_name: &str,
        peer_device_id: &str,
        module_name: &str,
        attr: &SessionAttribute,
    ) -> Result<SessionId, TransportError>;

    /// Write bytes on an open session.
    fn send_bytes(&self, session_id: SessionId, data: &[u8]) -> Result<(), TransportError>;

    /// Close a session. Unknown ids are ignored.
    fn close_session(&self, session_id: SessionId);
}

/// Transport adapter errors.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("session server already exists: {0}")]
    ServerExists(String),

    #[error("no session server named {0}")]
    NoServer(String),

    #[error("peer device unreachable: {0}")]
    PeerUnreachable(String),

    #[error("invalid session {0}")]
    InvalidSession(SessionId),

    #[error("transport error: {0}")]
    Other(String),
}
