//! Flush policies decide which buffers become flush pending.
//!
//! A policy is consulted by the flush controller after every document batch
//! and every delete-only operation, while the controller's lock is held. It
//! acts only through the [`FlushControlView`] it is handed.

use std::fmt::Debug;
use std::sync::Arc;

use log::debug;

use crate::writer::per_thread::SegmentBuffer;

/// The part of the flush controller a policy may read and change.
pub trait FlushControlView {
    /// Bytes of buffers that are not flush pending.
    fn active_bytes(&self) -> i64;

    /// Bytes used by buffered deletes that are not yet applied.
    fn delete_bytes_used(&self) -> i64;

    /// Mark `buffer` flush pending; no-op for buffers already pending or empty.
    fn set_flush_pending(&mut self, buffer: &Arc<SegmentBuffer>);

    /// Ask the next indexing thread to apply all buffered deletes.
    fn set_apply_all_deletes(&mut self);

    /// The registered buffer with the most committed bytes that is not yet
    /// pending and holds documents.
    fn find_largest_non_pending_writer(&self) -> Option<Arc<SegmentBuffer>>;
}

pub trait FlushPolicy: Send + Sync + Debug {
    /// Called after a buffer changed, or with `None` after a delete-only
    /// operation.
    fn on_change(&self, control: &mut dyn FlushControlView, buffer: Option<&Arc<SegmentBuffer>>);
}

/// Flushes by buffered document count, by RAM, or both.
///
/// * With a document limit, a buffer holding that many documents is marked
///   pending.
/// * With a RAM limit, buffered deletes alone above the limit request that
///   all deletes are applied, and active bytes plus deletes above the limit
///   mark the largest non-pending buffer.
#[derive(Debug, Clone)]
pub struct FlushByRamOrCountsPolicy {
    ram_buffer_size_mb: Option<f64>,
    max_buffered_docs: Option<usize>,
}

impl FlushByRamOrCountsPolicy {
    pub fn new(ram_buffer_size_mb: Option<f64>, max_buffered_docs: Option<usize>) -> Self {
        FlushByRamOrCountsPolicy {
            ram_buffer_size_mb,
            max_buffered_docs,
        }
    }

    fn ram_limit(&self) -> Option<i64> {
        self.ram_buffer_size_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as i64)
    }

    fn flush_deletes(&self, control: &mut dyn FlushControlView) {
        control.set_apply_all_deletes();
        debug!(
            "FP: force apply deletes bytes={} limit={:?} MB",
            control.delete_bytes_used(),
            self.ram_buffer_size_mb
        );
    }

    fn flush_active_bytes(&self, control: &mut dyn FlushControlView) {
        debug!(
            "FP: trigger flush: active_bytes={} delete_bytes={} vs ram_buffer={:?} MB",
            control.active_bytes(),
            control.delete_bytes_used(),
            self.ram_buffer_size_mb
        );
        if let Some(largest) = control.find_largest_non_pending_writer() {
            control.set_flush_pending(&largest);
        }
    }
}

impl FlushPolicy for FlushByRamOrCountsPolicy {
    fn on_change(&self, control: &mut dyn FlushControlView, buffer: Option<&Arc<SegmentBuffer>>) {
        if let (Some(buffer), Some(max_docs)) = (buffer, self.max_buffered_docs)
            && buffer.num_docs_in_ram() as usize >= max_docs
        {
            control.set_flush_pending(buffer);
            return;
        }
        let Some(limit) = self.ram_limit() else {
            return;
        };
        let active = control.active_bytes();
        let deletes = control.delete_bytes_used();
        if deletes >= limit && active >= limit && buffer.is_some() {
            self.flush_deletes(control);
            self.flush_active_bytes(control);
        } else if deletes >= limit {
            self.flush_deletes(control);
        } else if active + deletes >= limit {
            self.flush_active_bytes(control);
        }
    }
}
