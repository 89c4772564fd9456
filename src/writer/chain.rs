//! Contract between a segment buffer and the pipeline that encodes its fields.

use std::fmt::Debug;

use crate::data::Document;
use crate::error::Result;
use crate::storage::Storage;
use crate::writer::buffered_updates::BufferedUpdates;
use crate::writer::segment::{DocMap, LiveDocs};

/// Everything an indexing chain needs to write one segment.
pub struct SegmentWriteState<'a> {
    pub storage: &'a dyn Storage,
    pub segment_name: &'a str,
    pub max_doc: u32,
    /// Updates buffered privately by the flushing buffer. Term deletes are
    /// resolved by the chain against its in-memory postings.
    pub segment_updates: &'a BufferedUpdates,
    /// Set when documents of this segment are deleted at flush.
    pub live_docs: Option<LiveDocs>,
    pub del_count_on_flush: u32,
}

impl SegmentWriteState<'_> {
    /// Mark `doc` deleted, creating the live docs on first use.
    pub fn delete_doc(&mut self, doc: u32) {
        let max_doc = self.max_doc;
        let live_docs = self.live_docs.get_or_insert_with(|| LiveDocs::new(max_doc));
        if live_docs.delete(doc) {
            self.del_count_on_flush += 1;
        }
    }
}

/// Encodes the documents of one in-memory segment.
///
/// Each buffer owns exactly one chain, and calls into it only while the
/// buffer lock is held or after the buffer was checked out for flushing.
/// Errors classified as aborting by [`IrisError::is_aborting`] discard the
/// whole buffer; any other error only deletes the affected documents.
///
/// [`IrisError::is_aborting`]: crate::error::IrisError::is_aborting
pub trait IndexingChain: Send + Debug {
    fn process_document(&mut self, doc_id: u32, doc: &Document) -> Result<()>;

    /// Write the segment files; returns a doc map if documents were reordered.
    fn flush(&mut self, state: &mut SegmentWriteState<'_>) -> Result<Option<DocMap>>;

    /// Discard all in-memory state.
    fn abort(&mut self) -> Result<()>;

    fn ram_bytes_used(&self) -> usize;
}

/// Creates one chain per segment buffer.
pub trait IndexingChainFactory: Send + Sync + Debug {
    fn create(&self, segment_name: &str) -> Box<dyn IndexingChain>;
}
