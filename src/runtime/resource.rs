//! File-descriptor budgeting
//!
//! Extractors obtain handles through [`FdLimiter`] so that a wide parallel
//! sweep over thousands of source files cannot exhaust the process fd
//! table. Permits release on drop; shutdown is just dropping the limiter.

use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug)]
pub struct FdLimiter {
    available: Mutex<usize>,
    freed: Condvar,
    capacity: usize,
}

/// RAII permit for one open descriptor.
pub struct FdPermit {
    limiter: Arc<FdLimiter>,
}

impl FdLimiter {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(capacity.max(1)),
            freed: Condvar::new(),
            capacity: capacity.max(1),
        })
    }

    /// Block until a permit is available.
    pub fn acquire(self: &Arc<Self>) -> FdPermit {
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *available == 0 {
            available = self
                .freed
                .wait(available)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *available -= 1;
        FdPermit {
            limiter: Arc::clone(self),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for FdPermit {
    fn drop(&mut self) {
        let mut available = self
            .limiter
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *available += 1;
        self.limiter.freed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn permits_release_on_drop() {
        let limiter = FdLimiter::new(2);
        let a = limiter.acquire();
        let _b = limiter.acquire();
        drop(a);
        // A third acquire must succeed without blocking forever.
        let _c = limiter.acquire();
    }

    #[test]
    fn concurrent_holders_never_exceed_capacity() {
        let limiter = FdLimiter::new(4);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    let _permit = limiter.acquire();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(2));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 4);
    }
}
