//! Cooperative shutdown signalling
//!
//! Background loops wait on a [`ShutdownSignal`] between ticks instead
//! of sleeping, so a stop request interrupts the wait immediately
//! rather than after the current interval runs out.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct ShutdownSignal {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the signal and wakes every waiter. Idempotent.
    pub fn signal(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.condvar.notify_all();
    }

    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }

    /// Blocks until the signal fires or `timeout` elapses. Returns
    /// whether the signal has fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.condvar.wait_until(&mut signalled, deadline).timed_out() {
                return *signalled;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out_without_signal() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!signal.is_signalled());
    }

    #[test]
    fn test_signal_wakes_waiter_early() {
        let signal = Arc::new(ShutdownSignal::new());
        let waker = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.signal();
        });
        let start = Instant::now();
        assert!(signal.wait_timeout(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_after_signal_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.signal();
        signal.signal();
        assert!(signal.is_signalled());
        assert!(signal.wait_timeout(Duration::from_secs(30)));
    }
}
