use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{IrisError, Result};

/// Counts the documents of the whole index against a hard ceiling.
///
/// Buffered documents reserve a slot before they are indexed and release it
/// when their buffer aborts or when deletes drop them.
#[derive(Debug)]
pub struct DocumentLimiter {
    max_docs: u64,
    pending: AtomicU64,
}

impl DocumentLimiter {
    pub fn new(max_docs: u64) -> Self {
        DocumentLimiter {
            max_docs,
            pending: AtomicU64::new(0),
        }
    }

    /// Reserve `count` documents, failing without side effects if that
    /// would exceed the limit.
    pub fn reserve(&self, count: u64) -> Result<()> {
        let reserved = self.pending.fetch_add(count, Ordering::AcqRel) + count;
        if reserved > self.max_docs {
            self.pending.fetch_sub(count, Ordering::AcqRel);
            return Err(IrisError::capacity(format!(
                "number of documents in the index cannot exceed {}",
                self.max_docs
            )));
        }
        Ok(())
    }

    pub fn release(&self, count: u64) {
        let prev = self.pending.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(prev >= count, "released more documents than reserved");
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn max_docs(&self) -> u64 {
        self.max_docs
    }
}
