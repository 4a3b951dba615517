//! Cooperative shutdown signal shared by every thread of one connection instance.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct SignalState {
    quit: bool,
    /// Bumped by [`QuitSignal::wake`] so timed waits return early.
    pulses: u64,
}

/// Monotonic quit flag with a timed wait.
///
/// Once [`set`](QuitSignal::set) it stays set for the lifetime of the instance.
/// Loops use [`wait_timeout`](QuitSignal::wait_timeout) instead of sleeping so
/// they notice shutdown as soon as it happens.
#[derive(Debug, Clone, Default)]
pub struct QuitSignal {
    inner: Arc<(Mutex<SignalState>, Condvar)>,
}

impl QuitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the flag and release every waiter.
    pub fn set(&self) {
        let mut state = self.lock();
        state.quit = true;
        self.inner.1.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.lock().quit
    }

    /// Release current waiters without setting the flag.
    pub fn wake(&self) {
        let mut state = self.lock();
        state.pulses = state.pulses.wrapping_add(1);
        self.inner.1.notify_all();
    }

    /// Block for at most `timeout`, returning early on `set` or `wake`.
    ///
    /// Returns `true` if the flag is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        if guard.quit {
            return true;
        }
        let pulse = guard.pulses;
        let (guard, _) = self
            .inner
            .1
            .wait_timeout_while(guard, timeout, |s| !s.quit && s.pulses == pulse)
            .unwrap_or_else(PoisonError::into_inner);
        guard.quit
    }

    /// Whether two handles refer to the same signal.
    pub fn same_as(&self, other: &QuitSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_set_is_monotonic() {
        let quit = QuitSignal::new();
        assert!(!quit.is_set());
        quit.set();
        quit.wake();
        assert!(quit.is_set());
        assert!(quit.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_times_out_when_unset() {
        let quit = QuitSignal::new();
        let start = Instant::now();
        assert!(!quit.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_set_releases_waiter_early() {
        let quit = QuitSignal::new();
        let waiter = quit.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let set = waiter.wait_timeout(Duration::from_secs(10));
            (set, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        quit.set();
        let (set, elapsed) = handle.join().unwrap();
        assert!(set);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wake_releases_without_setting() {
        let quit = QuitSignal::new();
        let waiter = quit.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        quit.wake();
        assert!(!handle.join().unwrap());
        assert!(!quit.is_set());
    }

    #[test]
    fn test_clones_share_state() {
        let a = QuitSignal::new();
        let b = a.clone();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&QuitSignal::new()));
        b.set();
        assert!(a.is_set());
    }
}
