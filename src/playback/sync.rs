//! Counting semaphore for thread wakeups
//!
//! The worker, notifier and collector park on one of these; the render
//! callback signals them. `signal()` is an atomic increment plus a condvar
//! notify with no lock held, so the real-time thread never blocks on it.
//! Every wait is bounded by a timeout, which also covers the benign race
//! where a signal lands between the permit check and the park.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct Semaphore {
    permits: AtomicUsize,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Semaphore {
            permits: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Add a permit and wake one waiter. Safe from the render callback.
    pub fn signal(&self) {
        self.permits.fetch_add(1, Ordering::Release);
        self.cv.notify_one();
    }

    /// Consume a permit, waiting up to `timeout` for one to arrive.
    ///
    /// Returns true if a permit was consumed, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.try_acquire() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap();
        loop {
            if self.try_acquire() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return self.try_acquire();
            }
            let (g, result) = self.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if result.timed_out() {
                return self.try_acquire();
            }
        }
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.permits.load(Ordering::Acquire);
        while current > 0 {
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_signal_before_wait() {
        let sem = Semaphore::new();
        sem.signal();
        assert!(sem.wait_timeout(Duration::from_millis(1)));
        // Permit consumed; next wait times out
        assert!(!sem.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_times_out_without_signal() {
        let sem = Semaphore::new();
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_signal_wakes_parked_waiter() {
        let sem = Arc::new(Semaphore::new());
        let signaller = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                sem.signal();
            })
        };

        assert!(sem.wait_timeout(Duration::from_secs(5)));
        signaller.join().unwrap();
    }

    #[test]
    fn test_permits_accumulate() {
        let sem = Semaphore::new();
        sem.signal();
        sem.signal();
        sem.signal();
        assert!(sem.wait_timeout(Duration::from_millis(1)));
        assert!(sem.wait_timeout(Duration::from_millis(1)));
        assert!(sem.wait_timeout(Duration::from_millis(1)));
        assert!(!sem.wait_timeout(Duration::from_millis(1)));
    }
}
