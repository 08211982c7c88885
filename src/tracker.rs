//! Per-sandbox atomic slot tracker — the only mechanism gating concurrent
//! dispatch to a sandbox. No other part of the system may call into a
//! sandbox's underlying container directly for request dispatch.

use std::sync::atomic::{AtomicU32, Ordering};

/// At-most-`max` concurrent holders. Holders acquire one slot with
/// [`try_acquire`](Self::try_acquire) and return it with
/// [`release`](Self::release).
///
/// Release on a zero counter is a silent no-op, so crash recovery of lease
/// owners (which never persists in-flight leases) cannot underflow.
#[derive(Debug)]
pub struct Tracker {
    used: AtomicU32,
    max: u32,
}

impl Tracker {
    /// Create a tracker with the given maximum concurrent slots and zero
    /// in use.
    pub fn new(max: u32) -> Self {
        Self {
            used: AtomicU32::new(0),
            max,
        }
    }

    /// Atomically increment `used` iff `used < max`. Linearizable.
    /// Returns `true` on success.
    pub fn try_acquire(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                if used < self.max {
                    Some(used + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Atomically decrement `used`, saturating at zero. Idempotent.
    pub fn release(&self) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(1))
            });
    }

    /// Current number of held slots.
    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    /// Maximum concurrent slots.
    pub fn max(&self) -> u32 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_up_to_max_then_fails() {
        let tracker = Tracker::new(2);
        assert!(tracker.try_acquire());
        assert!(tracker.try_acquire());
        assert!(!tracker.try_acquire());
        assert_eq!(tracker.used(), 2);
    }

    #[test]
    fn release_frees_a_slot() {
        let tracker = Tracker::new(1);
        assert!(tracker.try_acquire());
        assert!(!tracker.try_acquire());
        tracker.release();
        assert!(tracker.try_acquire());
    }

    #[test]
    fn release_on_zero_is_a_no_op() {
        let tracker = Tracker::new(3);
        tracker.release();
        tracker.release();
        assert_eq!(tracker.used(), 0);
    }

    #[test]
    fn zero_max_never_acquires() {
        let tracker = Tracker::new(0);
        assert!(!tracker.try_acquire());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_never_exceeds_max() {
        let tracker = Arc::new(Tracker::new(10));
        let mut handles = Vec::new();
        for _ in 0..200 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move { tracker.try_acquire() }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        assert_eq!(tracker.used(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn acquire_then_release_always_settles_at_zero() {
        let tracker = Arc::new(Tracker::new(5));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                if tracker.try_acquire() {
                    tracker.release();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(tracker.used(), 0);
    }
}
