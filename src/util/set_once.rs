//! One-shot atomic flags.

use std::sync::atomic::{AtomicBool, Ordering};

/// A flag that moves from unset to set exactly once.
#[derive(Debug, Default)]
pub struct SetOnce {
    flag: AtomicBool,
}

impl SetOnce {
    pub const fn new() -> Self {
        SetOnce {
            flag: AtomicBool::new(false),
        }
    }

    /// Set the flag.
    ///
    /// # Panics
    ///
    /// Panics if the flag was already set.
    pub fn set(&self, what: &str) {
        let first = self.try_set();
        assert!(first, "{what} can only be set once");
    }

    /// Set the flag, returning `true` if this call was the one that set it.
    pub fn try_set(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn get(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
