//! The writer around the ingestion core.
//!
//! [`IndexWriter`] owns a [`DocumentsWriter`] and everything the core only
//! talks to through narrow interfaces: the storage, the document limiter,
//! the update stream and the resolver that applies published deletes.
//!
//! Notifications from the core are queued as events and processed by the
//! calling thread once the operation that caused them returns, so no
//! ingestion lock is held while files are deleted or tickets published.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::data::Document;
use crate::error::{IrisError, Result};
use crate::storage::Storage;
use crate::writer::config::IndexWriterConfig;
use crate::writer::delete_queue::{QueueNode, SeqNo, SeqNumber, UpdateItem};
use crate::writer::documents_writer::DocumentsWriter;
use crate::writer::limiter::DocumentLimiter;
use crate::writer::notifications::FlushNotifications;
use crate::writer::segment::SegmentInfo;
use crate::writer::term::{DocValuesUpdate, QueryRef, Term};
use crate::writer::ticket_queue::PublishedTicket;
use crate::writer::updates_stream::{BufferedUpdatesStream, NoopResolver, UpdatesResolver};

#[derive(Debug)]
enum WriterEvent {
    DeleteFiles(BTreeSet<String>),
    FlushFailed(SegmentInfo),
    PublishSegments { forced: bool },
    ApplyPackets,
}

/// Records notifications for later processing.
#[derive(Debug, Default)]
struct EventQueue {
    events: Mutex<VecDeque<WriterEvent>>,
    tragedy: Mutex<Option<IrisError>>,
}

impl EventQueue {
    fn push(&self, event: WriterEvent) {
        self.events.lock().push_back(event);
    }

    fn pop(&self) -> Option<WriterEvent> {
        self.events.lock().pop_front()
    }

    fn tragedy(&self) -> Option<IrisError> {
        self.tragedy.lock().clone()
    }
}

impl FlushNotifications for EventQueue {
    fn delete_unused_files(&self, files: &BTreeSet<String>) {
        self.push(WriterEvent::DeleteFiles(files.clone()));
    }

    fn flush_failed(&self, info: &SegmentInfo) {
        self.push(WriterEvent::FlushFailed(info.clone()));
    }

    fn after_segments_flushed(&self) -> Result<()> {
        self.push(WriterEvent::PublishSegments { forced: false });
        Ok(())
    }

    fn on_tragic_event(&self, error: &IrisError, location: &str) {
        warn!("IW: hit tragic error in {location}: {error}");
        self.tragedy.lock().get_or_insert_with(|| error.clone());
    }

    fn on_deletes_applied(&self) {
        self.push(WriterEvent::PublishSegments { forced: true });
    }

    fn on_ticket_backlog(&self) {
        self.push(WriterEvent::PublishSegments { forced: true });
    }
}

/// A published segment and the delete generation it was published with.
#[derive(Debug, Clone)]
pub struct PublishedSegment {
    pub info: SegmentInfo,
    /// Packets with a higher generation apply to this segment.
    pub buffered_deletes_gen: u64,
}

pub struct IndexWriter {
    storage: Arc<dyn Storage>,
    documents_writer: DocumentsWriter,
    events: Arc<EventQueue>,
    updates_stream: Arc<BufferedUpdatesStream>,
    resolver: Arc<dyn UpdatesResolver>,
    limiter: Arc<DocumentLimiter>,
    segments: Mutex<Vec<PublishedSegment>>,
    full_flush_lock: Mutex<()>,
    closed: AtomicBool,
}

impl IndexWriter {
    /// Open a writer that drops published deletes unresolved.
    pub fn new(config: IndexWriterConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        Self::with_resolver(config, storage, Arc::new(NoopResolver))
    }

    /// Open a writer that hands published deletes to `resolver`.
    ///
    /// Segment names continue after the highest segment already in
    /// `storage`.
    pub fn with_resolver(
        config: IndexWriterConfig,
        storage: Arc<dyn Storage>,
        resolver: Arc<dyn UpdatesResolver>,
    ) -> Result<Self> {
        config.validate()?;
        let next_segment = next_segment_number(storage.as_ref(), &config.segment_prefix)?;
        let events = Arc::new(EventQueue::default());
        let updates_stream = Arc::new(BufferedUpdatesStream::new());
        let limiter = Arc::new(DocumentLimiter::new(config.max_docs));
        let documents_writer = DocumentsWriter::new(
            &config,
            Arc::clone(&storage),
            Arc::clone(&limiter),
            Arc::clone(&updates_stream),
            Arc::clone(&events) as Arc<dyn FlushNotifications>,
            Arc::new(AtomicU64::new(next_segment)),
        )?;
        info!("IW: open writer {config:?} next_segment={next_segment}");
        Ok(IndexWriter {
            storage,
            documents_writer,
            events,
            updates_stream,
            resolver,
            limiter,
            segments: Mutex::new(Vec::new()),
            full_flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if let Some(tragedy) = self.events.tragedy() {
            return Err(IrisError::already_closed(format!(
                "this writer hit an unrecoverable error: {tragedy}"
            )));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(IrisError::already_closed("this writer is closed"));
        }
        Ok(())
    }

    pub fn add_document(&self, doc: Document) -> Result<SeqNumber> {
        self.add_documents(&[doc])
    }

    /// Add `docs` as one block; they end up adjacent in one segment.
    pub fn add_documents(&self, docs: &[Document]) -> Result<SeqNumber> {
        self.update_documents_with(docs, None)
    }

    /// Replace every document matching `term` with `doc`.
    pub fn update_document(&self, term: Term, doc: Document) -> Result<SeqNumber> {
        self.update_documents(term, &[doc])
    }

    /// Replace every document matching `term` with the block `docs`.
    pub fn update_documents(&self, term: Term, docs: &[Document]) -> Result<SeqNumber> {
        let node = QueueNode::new(UpdateItem::Term(term));
        self.update_documents_with(docs, Some(node))
    }

    fn update_documents_with(
        &self,
        docs: &[Document],
        delete_node: Option<Arc<QueueNode>>,
    ) -> Result<SeqNumber> {
        self.ensure_open()?;
        let result = self.documents_writer.update_documents(docs, delete_node);
        self.finish_operation(result)
    }

    pub fn delete_documents(&self, terms: Vec<Term>) -> Result<SeqNumber> {
        self.ensure_open()?;
        let result = self.documents_writer.delete_terms(terms);
        self.finish_operation(result)
    }

    pub fn delete_by_query(&self, queries: Vec<QueryRef>) -> Result<SeqNumber> {
        self.ensure_open()?;
        let result = self.documents_writer.delete_queries(queries);
        self.finish_operation(result)
    }

    pub fn update_numeric_doc_value(
        &self,
        term: Term,
        field: impl Into<String>,
        value: i64,
    ) -> Result<SeqNumber> {
        self.update_doc_values(vec![DocValuesUpdate::numeric(term, field, value)])
    }

    pub fn update_binary_doc_value(
        &self,
        term: Term,
        field: impl Into<String>,
        value: Vec<u8>,
    ) -> Result<SeqNumber> {
        self.update_doc_values(vec![DocValuesUpdate::binary(term, field, value)])
    }

    pub fn update_doc_values(&self, updates: Vec<DocValuesUpdate>) -> Result<SeqNumber> {
        self.ensure_open()?;
        if updates.is_empty() {
            return Err(IrisError::invalid_argument("no doc values updates given"));
        }
        let result = self.documents_writer.update_doc_values(updates);
        self.finish_operation(result)
    }

    fn finish_operation(&self, result: Result<SeqNo>) -> Result<SeqNumber> {
        match result {
            Ok(seq_no) => {
                if seq_no.flagged {
                    self.process_events()?;
                }
                Ok(seq_no.value)
            }
            Err(e) => {
                // events of a failed operation still need handling
                if let Err(event_err) = self.process_events() {
                    warn!("IW: processing events after failure failed: {event_err}");
                }
                Err(e)
            }
        }
    }

    /// Handle every queued event.
    pub fn process_events(&self) -> Result<()> {
        while let Some(event) = self.events.pop() {
            debug!("IW: process event {event:?}");
            match event {
                WriterEvent::DeleteFiles(files) => self.delete_files(&files),
                WriterEvent::FlushFailed(info) => {
                    let mut files = info.files.clone();
                    files.insert(info.meta_file_name());
                    self.delete_files(&files);
                }
                WriterEvent::PublishSegments { forced } => {
                    self.publish_flushed_segments(forced)?;
                }
                WriterEvent::ApplyPackets => {
                    self.updates_stream.apply_all(self.resolver.as_ref())?;
                }
            }
        }
        Ok(())
    }

    fn delete_files(&self, files: &BTreeSet<String>) {
        for file in files {
            if !self.storage.file_exists(file) {
                continue;
            }
            if let Err(e) = self.storage.delete_file(file) {
                warn!("IW: failed to delete {file}: {e}");
            }
        }
    }

    /// Publish every complete flush ticket in order.
    pub fn publish_flushed_segments(&self, forced: bool) -> Result<usize> {
        let published = self
            .documents_writer
            .purge_flush_tickets(forced, |ticket| self.publish_ticket(ticket))?;
        if published > 0 {
            self.events.push(WriterEvent::ApplyPackets);
        }
        Ok(published)
    }

    fn publish_ticket(&self, ticket: PublishedTicket) -> Result<()> {
        if let Some(global) = ticket.frozen_updates.filter(|p| p.any()) {
            self.updates_stream.push(global);
        }
        let Some(segment) = ticket.segment else {
            debug!("IW: published ticket {:?} without segment", ticket.id);
            return Ok(());
        };
        let buffered_deletes_gen = match segment.segment_updates {
            Some(packet) => self.updates_stream.push(packet),
            None => {
                // nothing private to apply, so the generation is done already
                let next_gen = self.updates_stream.next_gen();
                self.updates_stream.finished_segment(next_gen);
                next_gen
            }
        };
        debug!(
            "IW: publish segment {} max_doc={} del_count={} gen={buffered_deletes_gen}",
            segment.info.name, segment.info.max_doc, segment.del_count
        );
        self.segments.lock().push(PublishedSegment {
            info: segment.info,
            buffered_deletes_gen,
        });
        Ok(())
    }

    /// Flush every buffered document and publish the resulting segments.
    ///
    /// Returns the sequence number up to which all operations are
    /// contained in published segments or packets.
    pub fn flush(&self) -> Result<SeqNumber> {
        self.ensure_open()?;
        let seq_no = self.full_flush()?;
        self.process_events()?;
        self.updates_stream.apply_all(self.resolver.as_ref())?;
        Ok(seq_no)
    }

    fn full_flush(&self) -> Result<SeqNumber> {
        let _full_flush = self.full_flush_lock.lock();
        let result = self
            .documents_writer
            .flush_all_threads()
            .and_then(|seq_no| {
                self.publish_flushed_segments(true)?;
                Ok(seq_no)
            });
        let finished = self.documents_writer.finish_full_flush(result.is_ok());
        let seq_no = result?;
        finished?;
        debug!("IW: full flush done at seq_no={}", seq_no.value);
        Ok(seq_no.value)
    }

    /// Discard everything that was not published yet and close.
    pub fn rollback(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("IW: rollback");
        let result = self
            .documents_writer
            .lock_and_abort_all()
            .map(|aborted| aborted.release());
        self.events.events.lock().clear();
        self.documents_writer.close();
        result
    }

    /// Flush, apply all published deletes and close.
    ///
    /// A writer that hit a tragic error is rolled back instead.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(tragedy) = self.events.tragedy() {
            warn!("IW: close after tragic error, rolling back: {tragedy}");
            return self.rollback();
        }
        let flushed = self.flush();
        if let Err(e) = &flushed {
            warn!("IW: flush on close failed: {e}");
            self.rollback()?;
            return flushed.map(|_| ());
        }
        self.closed.store(true, Ordering::Release);
        self.documents_writer.close();
        info!("IW: closed with {} segments", self.segments.lock().len());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The first aborting error, after which the writer refuses work.
    pub fn tragic_error(&self) -> Option<IrisError> {
        self.events.tragedy()
    }

    pub fn segments(&self) -> Vec<PublishedSegment> {
        self.segments.lock().clone()
    }

    /// Live documents in published segments.
    pub fn num_docs(&self) -> u64 {
        self.segments
            .lock()
            .iter()
            .map(|s| s.info.live_doc_count() as u64)
            .sum()
    }

    pub fn num_docs_in_ram(&self) -> i64 {
        self.documents_writer.num_docs_in_ram()
    }

    /// Documents reserved against `max_docs`, buffered or published.
    pub fn pending_num_docs(&self) -> u64 {
        self.limiter.pending()
    }

    pub fn ram_bytes_used(&self) -> i64 {
        self.documents_writer.flush_control().ram_bytes_used()
    }

    pub fn has_pending_changes(&self) -> bool {
        self.documents_writer.any_changes() || self.updates_stream.any()
    }

    pub fn max_completed_sequence_number(&self) -> SeqNumber {
        self.documents_writer.max_completed_sequence_number()
    }

    pub fn documents_writer(&self) -> &DocumentsWriter {
        &self.documents_writer
    }

    pub fn updates_stream(&self) -> &Arc<BufferedUpdatesStream> {
        &self.updates_stream
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }
}

impl fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriter")
            .field("documents_writer", &self.documents_writer)
            .field("segments", &self.segments.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One past the highest segment number with a `.meta` file in `storage`.
fn next_segment_number(storage: &dyn Storage, prefix: &str) -> Result<u64> {
    let mut next = 0;
    for file in storage.list_files()? {
        let Some(number) = file
            .strip_suffix(".meta")
            .and_then(|name| name.strip_prefix(prefix))
            .and_then(|rest| rest.strip_prefix('_'))
        else {
            continue;
        };
        if let Ok(n) = number.parse::<u64>() {
            next = next.max(n + 1);
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_next_segment_number() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        assert_eq!(next_segment_number(&storage, "segment").unwrap(), 0);
        for name in ["segment_000004.meta", "segment_000011.cfs", "other_000020.meta", "segment_x.meta"] {
            let mut out = storage.create_output(name).unwrap();
            out.close().unwrap();
        }
        assert_eq!(next_segment_number(&storage, "segment").unwrap(), 5);
    }

    #[test]
    fn test_tragedy_keeps_first_error() {
        let events = EventQueue::default();
        events.on_tragic_event(&IrisError::aborting("first"), "test");
        events.on_tragic_event(&IrisError::aborting("second"), "test");
        let tragedy = events.tragedy().unwrap();
        assert!(tragedy.to_string().contains("first"));
    }

    #[test]
    fn test_notifications_become_events() {
        let events = EventQueue::default();
        events.after_segments_flushed().unwrap();
        events.on_ticket_backlog();
        events.delete_unused_files(&BTreeSet::from(["a.post".to_string()]));
        assert!(matches!(events.pop(), Some(WriterEvent::PublishSegments { forced: false })));
        assert!(matches!(events.pop(), Some(WriterEvent::PublishSegments { forced: true })));
        assert!(matches!(events.pop(), Some(WriterEvent::DeleteFiles(files)) if files.len() == 1));
        assert!(events.pop().is_none());
    }
}
