//! The ingestion façade.
//!
//! [`DocumentsWriter`] routes document batches to per-thread buffers and
//! global deletes to the active delete queue generation. Threads that index
//! also flush: a batch that makes its buffer pending flushes it right away,
//! and while threads are stalled or flushes are queued every indexing
//! thread first helps with the pending flushes.
//!
//! Flushed segments and frozen deletes go through the ticket queue; the
//! caller publishes them in ticket order through
//! [`DocumentsWriter::purge_flush_tickets`]. A full flush
//! ([`DocumentsWriter::flush_all_threads`]) swaps the delete queue and
//! flushes every buffer of the old generation; buffers of the new
//! generation keep indexing concurrently but are not published until
//! [`DocumentsWriter::finish_full_flush`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::data::Document;
use crate::error::{IrisError, Result};
use crate::storage::Storage;
use crate::writer::config::IndexWriterConfig;
use crate::writer::delete_queue::{DeleteQueue, QueueNode, SeqNo, SeqNumber};
use crate::writer::flush_control::FlushControl;
use crate::writer::limiter::DocumentLimiter;
use crate::writer::notifications::FlushNotifications;
use crate::writer::per_thread::{BufferGuard, FlushingBuffer, SegmentBuffer};
use crate::writer::pool::{BufferFactory, BufferPool};
use crate::writer::term::{DocValuesUpdate, QueryRef, Term};
use crate::writer::ticket_queue::{FlushTicketQueue, PublishedTicket};
use crate::writer::updates_stream::BufferedUpdatesStream;

/// Name of the `n`-th segment created with `prefix`.
pub fn segment_name(prefix: &str, n: u64) -> String {
    format!("{prefix}_{n:06}")
}

pub struct DocumentsWriter {
    delete_queue: Arc<RwLock<Arc<DeleteQueue>>>,
    pool: Arc<BufferPool>,
    flush_control: FlushControl,
    ticket_queue: FlushTicketQueue,
    notifications: Arc<dyn FlushNotifications>,
    limiter: Arc<DocumentLimiter>,
    check_pending_flush_on_update: bool,
    ram_buffer_size_mb: Option<f64>,
    // serializes deletes, full-flush marking and aborts
    sync: Mutex<()>,
    pending_changes_in_full_flush: AtomicBool,
    closed: AtomicBool,
}

impl DocumentsWriter {
    /// Create a writer whose buffers name their segments from
    /// `segment_counter`.
    pub fn new(
        config: &IndexWriterConfig,
        storage: Arc<dyn Storage>,
        limiter: Arc<DocumentLimiter>,
        updates_stream: Arc<BufferedUpdatesStream>,
        notifications: Arc<dyn FlushNotifications>,
        segment_counter: Arc<AtomicU64>,
    ) -> Result<Self> {
        config.validate()?;
        let delete_queue = Arc::new(RwLock::new(Arc::new(DeleteQueue::new())));
        let factory = Self::buffer_factory(
            config,
            storage,
            Arc::clone(&limiter),
            Arc::clone(&delete_queue),
            segment_counter,
        );
        let pool = Arc::new(BufferPool::new(factory));
        let flush_control = FlushControl::new(
            config,
            Arc::clone(&pool),
            Arc::clone(&delete_queue),
            updates_stream,
        );
        Ok(DocumentsWriter {
            delete_queue,
            pool,
            flush_control,
            ticket_queue: FlushTicketQueue::new(),
            notifications,
            limiter,
            check_pending_flush_on_update: config.check_pending_flush_on_update,
            ram_buffer_size_mb: config.ram_buffer_size_mb,
            sync: Mutex::new(()),
            pending_changes_in_full_flush: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn buffer_factory(
        config: &IndexWriterConfig,
        storage: Arc<dyn Storage>,
        limiter: Arc<DocumentLimiter>,
        delete_queue: Arc<RwLock<Arc<DeleteQueue>>>,
        segment_counter: Arc<AtomicU64>,
    ) -> BufferFactory {
        let chain_factory = config.chain_factory_or_default();
        let prefix = config.segment_prefix.clone();
        let use_compound_file = config.use_compound_file;
        Box::new(move || -> Result<Arc<SegmentBuffer>> {
            let name = segment_name(&prefix, segment_counter.fetch_add(1, Ordering::AcqRel));
            let queue = Arc::clone(&*delete_queue.read());
            Ok(SegmentBuffer::new(
                name.as_str(),
                queue,
                Arc::clone(&limiter),
                Arc::clone(&storage),
                chain_factory.create(&name),
                use_compound_file,
            ))
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IrisError::already_closed("this DocumentsWriter is closed"));
        }
        Ok(())
    }

    /// Index `docs` as one batch.
    ///
    /// With a `delete_node` the batch atomically replaces what the node
    /// deletes. The result is flagged when the call flushed segments,
    /// applied deletes or otherwise produced events for the caller.
    pub fn update_documents(
        &self,
        docs: &[Document],
        delete_node: Option<Arc<QueueNode>>,
    ) -> Result<SeqNo> {
        let has_events = self.pre_update()?;

        let mut guard = self.flush_control.obtain_and_lock()?;
        if let Err(e) = self.ensure_open() {
            self.release(guard);
            return Err(e);
        }
        let docs_before = guard.num_docs();
        let result = guard.process_documents(docs, delete_node, self.notifications.as_ref());
        if guard.buffer().is_aborted() {
            // the documents buffered before this batch are gone too
            self.flush_control.subtract_flushed_num_docs(docs_before);
            self.flush_control.do_on_abort(&mut guard);
        } else {
            self.flush_control
                .add_buffered_docs((guard.num_docs() - docs_before) as i64);
        }
        let (seq_no, flushing) = match result {
            Ok(seq_no) => (seq_no, self.flush_control.do_after_document(&mut guard)),
            Err(e) => {
                self.release(guard);
                return Err(e);
            }
        };
        self.release(guard);

        let has_events = self.post_update(flushing, has_events)?;
        Ok(SeqNo::new(seq_no).flag_if(has_events))
    }

    /// Return a leased buffer to the pool, unless it is leaving the pool.
    fn release(&self, guard: BufferGuard) {
        let buffer = guard.buffer();
        if !guard.is_live()
            || buffer.is_flush_pending()
            || buffer.is_aborted()
            || buffer.delete_queue().is_advanced()
        {
            // a stale buffer stays registered for the full flush to collect
            drop(guard);
        } else {
            self.pool.mark_as_free_and_unlock(guard);
        }
    }

    fn pre_update(&self) -> Result<bool> {
        self.ensure_open()?;
        let mut has_events = false;
        while self.flush_control.any_stalled_threads()
            || (self.check_pending_flush_on_update && self.flush_control.num_queued_flushes() > 0)
        {
            // help out flushing so stalled threads can go on
            if let Some(flushing) = self.flush_control.next_pending_flush() {
                has_events |= self.do_flush(flushing)?;
            } else if self.flush_control.any_stalled_threads()
                && let Some(flushing) = self.flush_control.checkout_largest_non_pending_writer()
            {
                has_events |= self.do_flush(flushing)?;
            } else {
                // wait once for a running flush to release memory, then
                // proceed even if still stalled
                self.flush_control.wait_if_stalled();
                break;
            }
        }
        Ok(has_events)
    }

    fn post_update(&self, flushing: Option<FlushingBuffer>, mut has_events: bool) -> Result<bool> {
        has_events |= self.apply_all_deletes()?;
        if let Some(flushing) = flushing {
            has_events |= self.do_flush(flushing)?;
        } else if self.check_pending_flush_on_update
            && let Some(flushing) = self.flush_control.next_pending_flush()
        {
            has_events |= self.do_flush(flushing)?;
        }
        Ok(has_events)
    }

    pub fn delete_terms(&self, terms: Vec<Term>) -> Result<SeqNo> {
        self.apply_delete_or_update(|queue| queue.add_delete_terms(terms))
    }

    pub fn delete_queries(&self, queries: Vec<QueryRef>) -> Result<SeqNo> {
        self.apply_delete_or_update(|queue| queue.add_delete_queries(queries))
    }

    pub fn update_doc_values(&self, updates: Vec<DocValuesUpdate>) -> Result<SeqNo> {
        self.apply_delete_or_update(|queue| queue.add_doc_values_updates(updates))
    }

    fn apply_delete_or_update<F>(&self, op: F) -> Result<SeqNo>
    where
        F: FnOnce(&DeleteQueue) -> Result<SeqNumber>,
    {
        // the queue must not be swapped while the update is appended, or a
        // full flush could miss it
        let _sync = self.sync.lock();
        self.ensure_open()?;
        let queue = self.flush_control.delete_queue();
        let seq_no = op(&queue)?;
        self.flush_control.do_on_delete();
        let applied = self.apply_all_deletes()?;
        Ok(SeqNo::new(seq_no).flag_if(applied))
    }

    /// Freeze the global deletes into a ticket of their own if the flush
    /// policy asked for it.
    fn apply_all_deletes(&self) -> Result<bool> {
        let queue = self.flush_control.delete_queue();
        // never during a full flush: the frozen deletes must not overtake
        // the segments of the old generation
        if !self.flush_control.is_full_flush()
            && queue.is_open()
            && self.flush_control.get_and_reset_apply_all_deletes()
            && self.ticket_queue.add_deletes(&queue)?
        {
            self.notifications.on_deletes_applied();
            return Ok(true);
        }
        Ok(false)
    }

    /// Flush `flushing` and then every further pending buffer, until none
    /// is left or the ticket queue backs up.
    fn do_flush(&self, flushing: FlushingBuffer) -> Result<bool> {
        let mut next = Some(flushing);
        let mut has_events = false;
        while let Some(mut flushing) = next.take() {
            debug_assert!(!flushing.buffer().has_flushed());
            has_events = true;
            let result = self.flush_buffer(&mut flushing);
            self.flush_control.do_after_flush(flushing.buffer());
            result?;

            if self.ticket_queue.ticket_count() >= self.pool.size() {
                // the publishing thread can't keep up with the flushing ones
                debug!(
                    "DW: ticket backlog of {} tickets for {} buffers",
                    self.ticket_queue.ticket_count(),
                    self.pool.size()
                );
                self.notifications.on_ticket_backlog();
                break;
            }
            next = self.flush_control.next_pending_flush();
        }

        if has_events {
            self.notifications.after_segments_flushed()?;
        }

        // deletes alone using more than half the RAM buffer would cause a
        // long tail of tiny flushes
        if let Some(mb) = self.ram_buffer_size_mb
            && self.flush_control.delete_bytes_used() as f64 > 1024.0 * 1024.0 * mb / 2.0
        {
            has_events = true;
            if !self.apply_all_deletes()? {
                debug!(
                    "DW: force apply deletes after flush bytes_used={} vs ram_buffer={mb} MB",
                    self.flush_control.delete_bytes_used()
                );
                self.notifications.on_deletes_applied();
            }
        }
        Ok(has_events)
    }

    fn flush_buffer(&self, flushing: &mut FlushingBuffer) -> Result<()> {
        let num_docs = flushing.num_docs();
        let ticket = match self.ticket_queue.add_flush_ticket(flushing) {
            Ok(ticket) => ticket,
            Err(e) => {
                self.flush_control.subtract_flushed_num_docs(num_docs);
                if let Err(abort_err) = flushing.abort() {
                    warn!("DW: abort of {} failed: {abort_err}", flushing.segment_name());
                }
                return Err(e);
            }
        };

        let result = flushing.flush(self.notifications.as_ref());
        self.flush_control.subtract_flushed_num_docs(num_docs);
        if !flushing.pending_files_to_delete().is_empty() {
            self.notifications
                .delete_unused_files(flushing.pending_files_to_delete());
        }
        match result {
            Ok(Some(segment)) => {
                self.ticket_queue.add_segment(ticket, segment);
                Ok(())
            }
            Ok(None) => {
                // aborted meanwhile; the ticket still carries frozen deletes
                self.ticket_queue.mark_ticket_failed(ticket);
                Ok(())
            }
            Err(e) => {
                self.notifications.flush_failed(flushing.segment_info());
                self.ticket_queue.mark_ticket_failed(ticket);
                Err(e)
            }
        }
    }

    /// Flush the next pending buffer, or the largest one if none is pending.
    pub fn flush_one_buffer(&self) -> Result<bool> {
        let flushing = self
            .flush_control
            .next_pending_flush()
            .or_else(|| self.flush_control.checkout_largest_non_pending_writer());
        match flushing {
            Some(flushing) => self.do_flush(flushing),
            None => Ok(false),
        }
    }

    /// Flush every buffer of the current generation.
    ///
    /// Must be followed by [`DocumentsWriter::finish_full_flush`], also on
    /// error. The result is the old generation's max sequence number,
    /// flagged if anything was flushed. Concurrent callers queue up: each
    /// waits until the running full flush has finished.
    pub fn flush_all_threads(&self) -> Result<SeqNo> {
        let (flushing_queue, seq_no) = loop {
            self.flush_control.wait_for_full_flush();
            let _sync = self.sync.lock();
            if self.flush_control.is_full_flush() {
                // another caller started one between the wait and the lock
                continue;
            }
            self.pending_changes_in_full_flush
                .store(self.any_changes(), Ordering::Release);
            let flushing_queue = self.flush_control.delete_queue();
            let seq_no = self.flush_control.mark_for_full_flush();
            break (flushing_queue, seq_no);
        };
        debug!(
            "DW: start full flush of gen={} max_seq_no={seq_no}",
            flushing_queue.generation()
        );

        let result = self.flush_old_generation(&flushing_queue);
        // every buffer of the old generation drained into the ticket queue
        if result.is_ok() || !flushing_queue.any_changes() {
            flushing_queue.close();
        }
        let anything_flushed = result?;
        Ok(SeqNo::new(seq_no).flag_if(anything_flushed))
    }

    fn flush_old_generation(&self, flushing_queue: &DeleteQueue) -> Result<bool> {
        let mut anything_flushed = false;
        while let Some(flushing) = self.flush_control.next_pending_flush() {
            debug_assert!(std::ptr::eq(
                Arc::as_ptr(flushing.buffer().delete_queue()),
                flushing_queue
            ));
            anything_flushed |= self.do_flush(flushing)?;
        }
        // concurrent flushes of the old generation may still be running
        self.flush_control.wait_for_flush();
        if !anything_flushed && flushing_queue.any_changes() {
            trace!(
                "DW: flush naked frozen global deletes of gen={}",
                flushing_queue.generation()
            );
            self.ticket_queue.add_deletes(flushing_queue)?;
        }
        debug_assert!(!flushing_queue.any_changes());
        Ok(anything_flushed)
    }

    /// End a full flush, releasing buffers that were blocked by it.
    pub fn finish_full_flush(&self, success: bool) -> Result<()> {
        // cleared first: the next queued full flush sets it on wake up
        self.pending_changes_in_full_flush
            .store(false, Ordering::Release);
        if success {
            self.flush_control.finish_full_flush();
        } else {
            self.flush_control.abort_full_flushes();
        }
        // applying deletes is blocked while the full flush runs
        self.apply_all_deletes()?;
        Ok(())
    }

    /// Discard every buffered document and every global update that was
    /// not frozen yet. All buffers are aborted even if some fail; the
    /// first failure is returned.
    pub fn abort(&self) -> Result<()> {
        let _sync = self.sync.lock();
        info!("DW: abort");
        self.flush_control.delete_queue().clear();
        let mut first_error = None;
        for mut guard in self.pool.filter_and_lock(|_| true) {
            if let Err(e) = self.abort_buffer(&mut guard) {
                first_error.get_or_insert(e);
            }
        }
        self.flush_control.abort_pending_flushes();
        self.flush_control.wait_for_flush();
        debug_assert_eq!(self.pool.size(), 0, "buffers survived the abort");
        info!("DW: done abort success={}", first_error.is_none());
        first_error.map_or(Ok(()), Err)
    }

    fn abort_buffer(&self, guard: &mut BufferGuard) -> Result<()> {
        self.flush_control.subtract_flushed_num_docs(guard.num_docs());
        let result = guard.abort();
        self.flush_control.do_on_abort(guard);
        result
    }

    /// Abort everything and keep new buffers out until the returned handle
    /// is released.
    ///
    /// Tickets still queued are dropped; their segments release their
    /// documents from the limiter.
    pub fn lock_and_abort_all(&self) -> Result<AbortedBuffers> {
        let _sync = self.sync.lock();
        info!("DW: lock_and_abort_all");
        self.ticket_queue.force_purge(|ticket| {
            if let Some(segment) = ticket.segment {
                self.limiter.release(segment.info.max_doc as u64);
            }
            Ok(())
        })?;

        let queue = self.flush_control.delete_queue();
        queue.clear();
        self.pool.lock_new_writers();
        // released on every path from here on
        let mut aborted = AbortedBuffers {
            pool: Arc::clone(&self.pool),
            guards: Vec::new(),
            released: false,
        };
        aborted.guards = self.pool.filter_and_lock(|_| true);
        // aborting checks the buffers out, so count them first
        let num_buffers = aborted.guards.len() as u64;
        let mut first_error = None;
        for guard in &mut aborted.guards {
            if let Err(e) = self.abort_buffer(guard) {
                first_error.get_or_insert(e);
            }
        }
        queue.clear();
        // one number for every operation that may have raced into a buffer
        queue.skip_sequence_numbers(num_buffers + 1);
        self.flush_control.abort_pending_flushes();
        self.flush_control.wait_for_flush();
        info!(
            "DW: finished lock_and_abort_all success={}",
            first_error.is_none()
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(aborted),
        }
    }

    /// Publish complete tickets from the head of the ticket queue. Without
    /// `forced` the call returns at once if another thread is publishing.
    pub fn purge_flush_tickets<C>(&self, forced: bool, consumer: C) -> Result<usize>
    where
        C: FnMut(PublishedTicket) -> Result<()>,
    {
        if forced {
            self.ticket_queue.force_purge(consumer)
        } else {
            self.ticket_queue.try_purge(consumer)
        }
    }

    /// Whether anything is buffered, frozen or in flight.
    pub fn any_changes(&self) -> bool {
        // changes may sit in the ticket queue between flush and publication
        self.flush_control.num_docs_in_ram() != 0
            || self.any_deletions()
            || self.ticket_queue.has_tickets()
            || self.pending_changes_in_full_flush.load(Ordering::Acquire)
    }

    pub fn any_deletions(&self) -> bool {
        self.flush_control.delete_queue().any_changes()
    }

    pub fn num_docs_in_ram(&self) -> i64 {
        self.flush_control.num_docs_in_ram()
    }

    pub fn max_completed_sequence_number(&self) -> SeqNumber {
        self.flush_control.delete_queue().max_completed_seq_no()
    }

    pub fn delete_queue(&self) -> Arc<DeleteQueue> {
        Arc::clone(&*self.delete_queue.read())
    }

    pub fn flush_control(&self) -> &FlushControl {
        &self.flush_control
    }

    pub fn ticket_queue(&self) -> &FlushTicketQueue {
        &self.ticket_queue
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse new work and release stalled threads.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.flush_control.set_closed();
        self.pool.close();
    }
}

impl fmt::Debug for DocumentsWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentsWriter")
            .field("delete_queue", &self.delete_queue())
            .field("flush_control", &self.flush_control)
            .field("ticket_queue", &self.ticket_queue)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Buffers locked by [`DocumentsWriter::lock_and_abort_all`].
///
/// New buffers are locked out until this is released, explicitly or on
/// drop; releasing happens exactly once.
pub struct AbortedBuffers {
    pool: Arc<BufferPool>,
    guards: Vec<BufferGuard>,
    released: bool,
}

impl AbortedBuffers {
    pub fn num_aborted(&self) -> usize {
        self.guards.len()
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        info!("DW: unlock after abort of {} buffers", self.guards.len());
        self.pool.unlock_new_writers();
        self.guards.clear();
    }
}

impl Drop for AbortedBuffers {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for AbortedBuffers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortedBuffers")
            .field("aborted", &self.guards.len())
            .field("released", &self.released)
            .finish()
    }
}
