//! Session manager.
//!
//! DMS keeps exactly one outbound session slot per process. A send attempt
//! occupies the slot from `open_session` until the peer answers, the attempt
//! fails, or a later caller preempts it after the busy timeout. The session
//! id, the busy flag and the completion listener of the slot always change
//! together, under one lock, so a callback belonging to a superseded session
//! can never reach the listener of the current one.
//!
//! ```text
//! Idle -> Opening -> Open -> Sending -> Idle
//!            |                  |
//!            +---- failure -----+---> Idle (listener gets the error)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use dms_transport::{SessionAttribute, SessionId, SessionListener, SessionTransport, OPEN_SUCCESS};

use crate::config::SessionConfig;
use crate::dispatch::{DispatchHandle, Request};
use crate::errors::{DmsError, DmsResult};
use crate::sync::{Clock, OpenSignal, SystemClock};

/// Receives the final outcome of an asynchronous send attempt.
pub trait CompletionListener: Send + Sync {
    fn on_complete(&self, result: DmsResult<()>);
}

impl<F> CompletionListener for F
where
    F: Fn(DmsResult<()>) + Send + Sync,
{
    fn on_complete(&self, result: DmsResult<()>) {
        self(result)
    }
}

/// Externally visible phase of the session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Open,
    Sending,
}

enum Completion {
    Listener(Arc<dyn CompletionListener>),
    /// A thread blocked in `send_message_blocking`.
    Waiter,
}

struct Released {
    session_id: Option<SessionId>,
    completion: Option<Completion>,
}

impl Released {
    fn notify(self, result: DmsResult<()>) {
        if let Some(Completion::Listener(listener)) = self.completion {
            listener.on_complete(result);
        }
    }
}

struct Slot {
    session_id: Option<SessionId>,
    state: SessionState,
    busy: bool,
    started_at: Option<Instant>,
    completion: Option<Completion>,
    payload: Bytes,
    target: String,
    /// Bumped on every new attempt.
    attempt: u64,
}

impl Slot {
    fn new() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            busy: false,
            started_at: None,
            completion: None,
            payload: Bytes::new(),
            target: String::new(),
            attempt: 0,
        }
    }

    /// Reset to idle, handing back what the caller must close and notify.
    fn release(&mut self) -> Released {
        self.busy = false;
        self.state = SessionState::Idle;
        self.started_at = None;
        self.payload = Bytes::new();
        self.target.clear();
        Released {
            session_id: self.session_id.take(),
            completion: self.completion.take(),
        }
    }
}

/// Owner of the single session slot.
///
/// One instance is shared (`Arc`) between API callers and the transport,
/// which holds it as the [`SessionListener`] of the session server.
pub struct SessionManager {
    transport: Arc<dyn SessionTransport>,
    dispatcher: DispatchHandle,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    slot: Mutex<Slot>,
    open_signal: OpenSignal,
    initialized: AtomicBool,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        dispatcher: DispatchHandle,
        config: SessionConfig,
    ) -> Self {
        Self::with_clock(transport, dispatcher, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<dyn SessionTransport>,
        dispatcher: DispatchHandle,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            clock,
            config,
            slot: Mutex::new(Slot::new()),
            open_signal: OpenSignal::new(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register the session server. Calling it again is a no-op.
    pub fn initialize(self: &Arc<Self>) -> DmsResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener: Arc<dyn SessionListener> = Arc::clone(self) as Arc<dyn SessionListener>;
        if let Err(e) = self.transport.create_session_server(
            &self.config.module_name,
            &self.config.session_name,
            listener,
        ) {
            self.initialized.store(false, Ordering::SeqCst);
            warn!(error = %e, "failed to create session server");
            return Err(e.into());
        }
        info!(
            module = %self.config.module_name,
            session = %self.config.session_name,
            "session server created"
        );
        Ok(())
    }

    /// Close any tracked session and remove the session server.
    pub fn shutdown(&self) -> DmsResult<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.close();
        self.transport
            .remove_session_server(&self.config.module_name, &self.config.session_name)?;
        info!("session server removed");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().busy
    }

    pub fn state(&self) -> SessionState {
        self.slot.lock().state
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.slot.lock().session_id
    }

    /// Send `payload` to `target_device_id`. Returns once the session open
    /// has been started; the outcome is reported through `listener`.
    ///
    /// The listener is not invoked when this returns an error.
    pub fn send_message(
        &self,
        payload: &[u8],
        target_device_id: &str,
        listener: Arc<dyn CompletionListener>,
    ) -> DmsResult<()> {
        self.begin_attempt(payload, target_device_id, Completion::Listener(listener))
            .map(|_| ())
    }

    /// Send `payload` and wait for the session to open, for at most the
    /// configured open-wait timeout. The payload is written whether or not
    /// the open callback arrived in time.
    pub fn send_message_blocking(&self, payload: &[u8], target_device_id: &str) -> DmsResult<()> {
        let attempt = self.begin_attempt(payload, target_device_id, Completion::Waiter)?;
        if !self.open_signal.wait_for(self.config.open_wait_timeout()) {
            warn!(target = target_device_id, "session open not confirmed in time, sending anyway");
        }

        let mut slot = self.slot.lock();
        let session_id = match slot.session_id {
            Some(id) if slot.busy && slot.attempt == attempt => id,
            _ => return Err(DmsError::failure("session attempt was superseded")),
        };
        slot.state = SessionState::Sending;
        if let Err(e) = self.transport.send_bytes(session_id, &slot.payload) {
            slot.release();
            drop(slot);
            warn!(session_id = %session_id, error = %e, "send failed");
            self.transport.close_session(session_id);
            return Err(e.into());
        }
        // The slot frees up; the session stays tracked until the reply or
        // the peer's close.
        slot.busy = false;
        slot.started_at = None;
        slot.completion = None;
        slot.payload = Bytes::new();
        slot.state = SessionState::Open;
        Ok(())
    }

    fn begin_attempt(
        &self,
        payload: &[u8],
        target_device_id: &str,
        completion: Completion,
    ) -> DmsResult<u64> {
        if payload.is_empty() || payload.len() > self.config.max_payload_size {
            return Err(DmsError::invalid(format!(
                "payload length {} outside 1..={}",
                payload.len(),
                self.config.max_payload_size
            )));
        }
        if target_device_id.is_empty() {
            return Err(DmsError::invalid("empty target device id"));
        }
        if !self.is_initialized() {
            return Err(DmsError::failure("session server not initialized"));
        }

        let mut slot = self.slot.lock();
        let mut preempted = None;
        if !slot.busy {
            // A blocking send leaves its session tracked until the reply.
            if let Some(id) = slot.session_id.take() {
                debug!(session_id = %id, "closing lingering session");
                self.transport.close_session(id);
            }
        } else {
            let elapsed = slot
                .started_at
                .map(|start| self.clock.elapsed_since(start))
                .unwrap_or_default();
            if elapsed < self.config.busy_timeout() {
                debug!(elapsed_ms = elapsed.as_millis() as u64, "session busy");
                return Err(DmsError::Busy);
            }
            let stale = slot.release();
            if let Some(id) = stale.session_id {
                warn!(session_id = %id, elapsed_s = elapsed.as_secs(), "preempting stale session");
                self.transport.close_session(id);
            }
            preempted = Some(stale);
        }

        if matches!(completion, Completion::Waiter) {
            self.open_signal.reset();
        }
        slot.busy = true;
        slot.state = SessionState::Opening;
        slot.started_at = Some(self.clock.now());
        slot.completion = Some(completion);
        slot.payload = Bytes::copy_from_slice(payload);
        slot.target = target_device_id.to_string();
        slot.attempt += 1;
        let attempt = slot.attempt;

        let opened = self.transport.open_session(
            &self.config.session_name,
            &self.config.session_name,
            target_device_id,
            &self.config.module_name,
            &SessionAttribute::default(),
        );
        let result = match opened {
            Ok(id) => {
                debug!(session_id = %id, target = target_device_id, "opening session");
                slot.session_id = Some(id);
                Ok(attempt)
            }
            Err(e) => {
                warn!(target = target_device_id, error = %e, "open session failed");
                slot.release();
                Err(e.into())
            }
        };
        drop(slot);

        if let Some(stale) = preempted {
            stale.notify(Err(DmsError::failure("session timed out")));
        }
        result
    }

    /// Finish the tracked attempt with the peer's answer. Returns `false`
    /// when `session_id` is not the tracked session.
    pub fn complete(&self, session_id: SessionId, outcome: DmsResult<()>) -> bool {
        let released = {
            let mut slot = self.slot.lock();
            if slot.session_id != Some(session_id) {
                debug!(session_id = %session_id, "completion for untracked session");
                return false;
            }
            slot.release()
        };
        self.transport.close_session(session_id);
        debug!(session_id = %session_id, ok = outcome.is_ok(), "session attempt complete");
        released.notify(outcome);
        true
    }

    /// Write `data` on a peer-initiated session. The slot is not involved.
    pub fn send_reply(&self, session_id: SessionId, data: &[u8]) -> DmsResult<()> {
        self.transport.send_bytes(session_id, data)?;
        Ok(())
    }

    /// Close the tracked session. A pending listener is dropped without
    /// being invoked.
    pub fn close(&self) {
        let released = self.slot.lock().release();
        if let Some(id) = released.session_id {
            debug!(session_id = %id, "closing session");
            self.transport.close_session(id);
        }
    }

    fn fail_attempt(&self, released: Released, reason: &str) {
        if let Some(id) = released.session_id {
            self.transport.close_session(id);
        }
        released.notify(Err(DmsError::failure(reason)));
    }
}

impl SessionListener for SessionManager {
    fn on_session_opened(&self, session_id: SessionId, result: i32) -> i32 {
        let mut slot = self.slot.lock();
        if !slot.busy || slot.session_id != Some(session_id) {
            drop(slot);
            if result == OPEN_SUCCESS {
                self.dispatcher.submit(Request::SessionOpened { session_id });
            } else {
                debug!(session_id = %session_id, result, "ignoring open callback for untracked session");
            }
            return OPEN_SUCCESS;
        }

        if matches!(slot.completion, Some(Completion::Waiter)) {
            if result == OPEN_SUCCESS {
                slot.state = SessionState::Open;
            }
            drop(slot);
            self.open_signal.notify();
            return OPEN_SUCCESS;
        }

        if result != OPEN_SUCCESS {
            let released = slot.release();
            drop(slot);
            warn!(session_id = %session_id, result, "session open failed");
            self.fail_attempt(released, "session open failed");
            return OPEN_SUCCESS;
        }

        slot.state = SessionState::Open;
        match self.transport.send_bytes(session_id, &slot.payload) {
            Ok(()) => {
                slot.state = SessionState::Sending;
                debug!(session_id = %session_id, len = slot.payload.len(), "payload sent");
            }
            Err(e) => {
                let released = slot.release();
                drop(slot);
                warn!(session_id = %session_id, error = %e, "send failed");
                self.fail_attempt(released, "send failed");
            }
        }
        OPEN_SUCCESS
    }

    fn on_session_closed(&self, session_id: SessionId) {
        let interrupted = {
            let mut slot = self.slot.lock();
            if slot.session_id != Some(session_id) {
                None
            } else if slot.busy {
                Some(slot.release())
            } else {
                slot.session_id = None;
                slot.state = SessionState::Idle;
                None
            }
        };
        if let Some(released) = interrupted {
            warn!(session_id = %session_id, "session closed by peer before reply");
            released.notify(Err(DmsError::failure("session closed by peer")));
        }
        self.dispatcher.submit(Request::SessionClosed { session_id });
    }

    fn on_bytes_received(&self, session_id: SessionId, data: &[u8]) {
        if data.is_empty() || data.len() > self.config.max_payload_size {
            debug!(session_id = %session_id, len = data.len(), "dropping out-of-range delivery");
            return;
        }
        let payload = Bytes::copy_from_slice(data);
        if !self.dispatcher.submit(Request::BytesReceived { session_id, payload }) {
            debug!(session_id = %session_id, "dispatcher queue full, delivery dropped");
        }
    }
}
