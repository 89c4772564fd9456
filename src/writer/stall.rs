//! Backpressure for indexing threads.
//!
//! Indexing threads block in [`StallControl::wait_if_stalled`] while the
//! flush controller reports more memory in use than flushes can release
//! quickly. Waits re-check the condition at least once a second, and every
//! stall recomputation wakes all waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::{Condvar, Mutex};

const STALL_RECHECK: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct StallState {
    num_waiting: usize,
    was_stalled: bool,
}

#[derive(Debug, Default)]
pub struct StallControl {
    stalled: AtomicBool,
    state: Mutex<StallState>,
    changed: Condvar,
}

impl StallControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the new stall state and wake every waiter.
    pub fn update_stalled(&self, stalled: bool) {
        let mut state = self.state.lock();
        if self.stalled.swap(stalled, Ordering::AcqRel) != stalled {
            trace!("DWFC: stalled={stalled} waiting={}", state.num_waiting);
            if stalled {
                state.was_stalled = true;
            }
        }
        self.changed.notify_all();
    }

    /// Block while stalled, for at most one re-check interval.
    pub fn wait_if_stalled(&self) {
        self.wait_if_stalled_for(STALL_RECHECK);
    }

    /// Block while stalled, giving up after `timeout`.
    ///
    /// Returns `true` if the caller is free to proceed, `false` if the
    /// timeout elapsed while still stalled.
    pub fn wait_if_stalled_for(&self, timeout: Duration) -> bool {
        if !self.is_stalled() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.num_waiting += 1;
        while self.is_stalled() {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.num_waiting -= 1;
        !self.is_stalled()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn num_waiting(&self) -> usize {
        self.state.lock().num_waiting
    }

    pub fn has_blocked(&self) -> bool {
        self.num_waiting() > 0
    }

    /// Whether a stall was ever entered.
    pub fn was_stalled(&self) -> bool {
        self.state.lock().was_stalled
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_not_stalled_returns_immediately() {
        let control = StallControl::new();
        assert!(control.wait_if_stalled_for(Duration::from_secs(10)));
        assert!(!control.was_stalled());
    }

    #[test]
    fn test_stalled_wait_times_out() {
        let control = StallControl::new();
        control.update_stalled(true);
        assert!(!control.wait_if_stalled_for(Duration::from_millis(20)));
        assert!(control.was_stalled());
        assert!(!control.has_blocked());
    }

    #[test]
    fn test_unstall_releases_waiters() {
        let control = Arc::new(StallControl::new());
        control.update_stalled(true);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let control = Arc::clone(&control);
                thread::spawn(move || control.wait_if_stalled_for(Duration::from_secs(30)))
            })
            .collect();
        while control.num_waiting() < 3 {
            thread::yield_now();
        }
        control.update_stalled(false);
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }
}
