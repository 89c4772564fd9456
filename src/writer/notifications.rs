use std::collections::BTreeSet;

use crate::error::{IrisError, Result};
use crate::writer::segment::SegmentInfo;

/// Callbacks from the ingestion core to the writer that owns it.
///
/// Implementations are invoked while flushes are in progress, possibly from
/// several indexing threads at once, so they should only record the event
/// and do the work later, outside of any ingestion lock.
pub trait FlushNotifications: Send + Sync {
    /// Files that a flush produced but that are not part of any segment.
    fn delete_unused_files(&self, files: &BTreeSet<String>);

    /// A segment flush failed; its files are garbage.
    fn flush_failed(&self, info: &SegmentInfo);

    /// One or more flushes finished and their tickets may be publishable.
    fn after_segments_flushed(&self) -> Result<()>;

    /// A buffer hit an aborting error.
    fn on_tragic_event(&self, error: &IrisError, location: &str);

    /// Deletes were frozen into a ticket of their own.
    fn on_deletes_applied(&self);

    /// Flush tickets pile up faster than they are published.
    fn on_ticket_backlog(&self);
}
