//! Time sources for the control loop.
//!
//! The manager reads the clock before and after each phase of a tick and
//! suspends in exactly one [`Clock::sleep`] per iteration. Tests and the
//! simulator use [`ManualClock`], which advances instantly when slept on.

use crate::manager::ManagerHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time plus an interruptible sleep.
pub trait Clock: Send {
    /// Time since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    /// Sleep for `duration`, returning early once `handle` is terminated.
    fn sleep(&self, duration: Duration, handle: &ManagerHandle);
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration, handle: &ManagerHandle) {
        handle.wait_for_termination(duration);
    }
}

/// Clock that only moves when told to, or when slept on.
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos().min(u64::MAX as u128) as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration, handle: &ManagerHandle) {
        if !handle.is_terminated() {
            self.advance(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let shared = clock.clone();
        let handle = ManagerHandle::new();

        clock.sleep(Duration::from_millis(250), &handle);
        assert_eq!(shared.now(), Duration::from_millis(250));

        handle.terminate();
        clock.sleep(Duration::from_secs(5), &handle);
        assert_eq!(shared.now(), Duration::from_millis(250));
    }

    #[test]
    fn test_system_clock_sleep_interrupted_by_terminate() {
        let clock = SystemClock::new();
        let handle = ManagerHandle::new();
        let remote = handle.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.terminate();
        });

        let before = clock.now();
        clock.sleep(Duration::from_secs(30), &handle);
        assert!(clock.now() - before < Duration::from_secs(10));
        t.join().unwrap();
    }
}
