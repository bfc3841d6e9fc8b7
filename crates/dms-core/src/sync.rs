//! Timing and cross-thread signalling helpers for the session manager.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Time elapsed since `start`, zero if `start` is in the future.
    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// One-shot completion signal between the transport thread and a waiting
/// caller. At most one waiter exists at a time.
#[derive(Debug, Default)]
pub struct OpenSignal {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl OpenSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arm the signal before a new wait.
    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    /// Wake the waiter, or let the next wait return immediately.
    pub fn notify(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_one();
    }

    /// Block until notified or `timeout` elapses. Returns whether the signal
    /// fired.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                break;
            }
        }
        *signalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(61));
        assert_eq!(clock.elapsed_since(start), Duration::from_secs(61));
        assert_eq!(clock.elapsed_since(start + Duration::from_secs(100)), Duration::ZERO);
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let signal = Arc::new(OpenSignal::new());
        let notifier = Arc::clone(&signal);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });
        assert!(signal.wait_for(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_signal_times_out() {
        let signal = OpenSignal::new();
        let started = Instant::now();
        assert!(!signal.wait_for(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let signal = OpenSignal::new();
        signal.notify();
        assert!(signal.wait_for(Duration::ZERO));
        signal.reset();
        assert!(!signal.wait_for(Duration::from_millis(1)));
    }
}
