use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Interruptible stop flag for the setup thread.
///
/// The host may unload the fix (DLL detach, process exit) while setup is
/// still polling for the game module; triggering the signal ends any pending
/// wait immediately.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn trigger(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.wake.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` unless triggered first.
    ///
    /// Returns `true` if shutdown was triggered before or during the wait.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            stopped = self
                .wake
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
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
    fn test_starts_clear() {
        assert!(!ShutdownSignal::new().is_shutdown());
    }

    #[test]
    fn test_wait_runs_full_duration() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.wait(Duration::from_millis(40)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_trigger_wakes_every_waiter() {
        let signal = Arc::new(ShutdownSignal::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = Arc::clone(&signal);
                thread::spawn(move || {
                    let start = Instant::now();
                    (signal.wait(Duration::from_secs(10)), start.elapsed())
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        signal.trigger();

        for waiter in waiters {
            let (stopped, elapsed) = waiter.join().unwrap();
            assert!(stopped);
            assert!(elapsed < Duration::from_secs(2));
        }
    }

    #[test]
    fn test_wait_after_trigger_returns_at_once() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let start = Instant::now();
        assert!(signal.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(signal.is_shutdown());
    }
}
