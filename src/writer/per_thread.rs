//! Per-thread segment buffers.
//!
//! A [`SegmentBuffer`] owns one in-progress in-memory segment. Indexing
//! threads lease a buffer from the pool and get a [`BufferGuard`], which is
//! the only way to reach the buffer's private state: exactly one batch is
//! processed per buffer at a time. Once a buffer is checked out for flushing
//! its state moves into a [`FlushingBuffer`] and the lock is released, so the
//! flush I/O runs without any shared lock held.
//!
//! Life cycle: `Active -> FlushPending -> Flushing -> {Flushed | Aborted}`.
//! Flush pending and aborted are one-shot flags; there is no way back.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, trace, warn};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::data::Document;
use crate::error::{IrisError, Result};
use crate::storage::Storage;
use crate::storage::tracking::TrackingStorage;
use crate::util::set_once::SetOnce;
use crate::writer::buffered_updates::BufferedUpdates;
use crate::writer::chain::{IndexingChain, SegmentWriteState};
use crate::writer::compound::write_compound;
use crate::writer::delete_queue::{DeleteQueue, DeleteSlice, QueueNode, SeqNumber};
use crate::writer::frozen_updates::FrozenBufferedUpdates;
use crate::writer::limiter::DocumentLimiter;
use crate::writer::notifications::FlushNotifications;
use crate::writer::segment::{FlushedSegment, LiveDocs, SegmentInfo};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// State only reachable through the buffer lock, or owned by the flushing
/// thread after checkout.
pub(crate) struct BufferState {
    chain: Box<dyn IndexingChain>,
    delete_slice: DeleteSlice,
    pending_updates: BufferedUpdates,
    num_docs: u32,
    segment_info: SegmentInfo,
    files_to_delete: BTreeSet<String>,
}

impl BufferState {
    fn ram_bytes_used(&self) -> usize {
        self.pending_updates.ram_bytes_used() + self.chain.ram_bytes_used()
    }

    fn index_documents(&mut self, buffer: &SegmentBuffer, docs: &[Document]) -> Result<()> {
        for doc in docs {
            buffer.limiter.reserve(1)?;
            let doc_id = self.num_docs;
            self.num_docs += 1;
            buffer.num_docs_in_ram.store(self.num_docs, Ordering::Release);
            self.chain.process_document(doc_id, doc)?;
        }
        Ok(())
    }

    fn finish_documents(
        &mut self,
        queue: &DeleteQueue,
        delete_node: Option<Arc<QueueNode>>,
        doc_id_upto: u32,
    ) -> Result<SeqNumber> {
        // Apply deletes only up to the docs that were in RAM before this
        // batch; the batch itself is too new to be hit by them.
        match delete_node {
            Some(node) => {
                let seq_no = queue.add(Arc::clone(&node), &mut self.delete_slice)?;
                debug_assert!(
                    self.delete_slice.is_tail(&node),
                    "expected the delete node as the tail item"
                );
                self.delete_slice.apply(&mut self.pending_updates, doc_id_upto);
                Ok(seq_no)
            }
            None => {
                let seq_no = queue.update_slice(&mut self.delete_slice)?;
                if seq_no.flagged {
                    self.delete_slice.apply(&mut self.pending_updates, doc_id_upto);
                } else {
                    self.delete_slice.reset();
                }
                Ok(seq_no.value)
            }
        }
    }

    /// Mark the last `count` documents deleted.
    fn delete_last_docs(&mut self, count: u32) {
        for doc_id in self.num_docs - count..self.num_docs {
            self.pending_updates.add_doc_id(doc_id);
        }
    }

    fn abort(&mut self, buffer: &SegmentBuffer) -> Result<()> {
        if !buffer.aborted.try_set() {
            return Ok(());
        }
        debug!("DWPT: now abort {}", buffer.segment_name);
        buffer.limiter.release(self.num_docs as u64);
        let result = self.chain.abort();
        self.pending_updates.clear();
        result
    }
}

/// One in-progress segment, shared between the pool, the flush controller
/// and the thread currently holding its lock.
pub struct SegmentBuffer {
    id: u64,
    segment_name: String,
    delete_queue: Arc<DeleteQueue>,
    limiter: Arc<DocumentLimiter>,
    storage: Arc<dyn Storage>,
    use_compound_file: bool,
    flush_pending: SetOnce,
    aborted: SetOnce,
    has_flushed: SetOnce,
    last_committed_bytes: AtomicI64,
    num_docs_in_ram: AtomicU32,
    // `Some` exactly while the buffer is registered with the pool
    state: Arc<Mutex<Option<BufferState>>>,
}

impl SegmentBuffer {
    pub fn new(
        segment_name: impl Into<String>,
        delete_queue: Arc<DeleteQueue>,
        limiter: Arc<DocumentLimiter>,
        storage: Arc<dyn Storage>,
        chain: Box<dyn IndexingChain>,
        use_compound_file: bool,
    ) -> Arc<Self> {
        let segment_name = segment_name.into();
        let state = BufferState {
            chain,
            delete_slice: delete_queue.new_slice(),
            pending_updates: BufferedUpdates::new(segment_name.clone()),
            num_docs: 0,
            segment_info: SegmentInfo::new(segment_name.clone(), 0, false),
            files_to_delete: BTreeSet::new(),
        };
        trace!(
            "DWPT: init seg={} delete queue gen={}",
            segment_name,
            delete_queue.generation()
        );
        Arc::new(SegmentBuffer {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            segment_name,
            delete_queue,
            limiter,
            storage,
            use_compound_file,
            flush_pending: SetOnce::new(),
            aborted: SetOnce::new(),
            has_flushed: SetOnce::new(),
            last_committed_bytes: AtomicI64::new(0),
            num_docs_in_ram: AtomicU32::new(0),
            state: Arc::new(Mutex::new(Some(state))),
        })
    }

    /// Block until the buffer lock is free.
    pub fn lock(self: &Arc<Self>) -> BufferGuard {
        BufferGuard {
            state: self.state.lock_arc(),
            buffer: Arc::clone(self),
        }
    }

    pub fn try_lock(self: &Arc<Self>) -> Option<BufferGuard> {
        self.state.try_lock_arc().map(|state| BufferGuard {
            state,
            buffer: Arc::clone(self),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    pub fn delete_queue(&self) -> &Arc<DeleteQueue> {
        &self.delete_queue
    }

    pub fn is_flush_pending(&self) -> bool {
        self.flush_pending.get()
    }

    pub(crate) fn set_flush_pending(&self) {
        self.flush_pending.set("flush pending");
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.get()
    }

    pub fn has_flushed(&self) -> bool {
        self.has_flushed.get()
    }

    /// Bytes last credited to the flush controller for this buffer.
    pub fn last_committed_bytes(&self) -> i64 {
        self.last_committed_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn commit_last_bytes_used(&self, delta: i64) {
        self.last_committed_bytes.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn num_docs_in_ram(&self) -> u32 {
        self.num_docs_in_ram.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SegmentBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentBuffer")
            .field("id", &self.id)
            .field("segment", &self.segment_name)
            .field("queue_generation", &self.delete_queue.generation())
            .field("num_docs_in_ram", &self.num_docs_in_ram())
            .field("last_committed_bytes", &self.last_committed_bytes())
            .field("flush_pending", &self.is_flush_pending())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Proof that the caller holds a buffer's lock.
pub struct BufferGuard {
    buffer: Arc<SegmentBuffer>,
    state: ArcMutexGuard<RawMutex, Option<BufferState>>,
}

impl BufferGuard {
    pub fn buffer(&self) -> &Arc<SegmentBuffer> {
        &self.buffer
    }

    /// Whether the buffer still holds its state, i.e. was not checked out.
    pub fn is_live(&self) -> bool {
        self.state.is_some()
    }

    fn state_mut(&mut self) -> &mut BufferState {
        match self.state.as_mut() {
            Some(state) => state,
            None => panic!("buffer {} was already checked out", self.buffer.segment_name),
        }
    }

    pub fn num_docs(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.num_docs)
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.state.as_ref().map_or(0, BufferState::ram_bytes_used)
    }

    /// Bytes used now minus the bytes last committed to the controller.
    pub fn commit_last_bytes_used_delta(&self) -> i64 {
        self.ram_bytes_used() as i64 - self.buffer.last_committed_bytes()
    }

    /// Index a batch of documents, then catch up with the delete queue.
    ///
    /// With a `delete_node` the batch replaces whatever the node deletes: the
    /// node is appended and becomes this buffer's slice tail, and is applied
    /// to the documents buffered before the batch only.
    ///
    /// A non-aborting failure marks every document of the batch deleted and
    /// leaves the buffer usable. An aborting failure discards the buffer.
    pub fn process_documents(
        &mut self,
        docs: &[Document],
        delete_node: Option<Arc<QueueNode>>,
        notifications: &dyn FlushNotifications,
    ) -> Result<SeqNumber> {
        debug_assert!(
            !self.buffer.is_aborted(),
            "buffer hit an aborting error but is still indexing"
        );
        let buffer = Arc::clone(&self.buffer);
        let state = self.state_mut();
        let docs_in_ram_before = state.num_docs;

        let result = match state.index_documents(&buffer, docs) {
            Ok(()) => state.finish_documents(&buffer.delete_queue, delete_node, docs_in_ram_before),
            Err(e) => {
                if !e.is_aborting() {
                    state.delete_last_docs(state.num_docs - docs_in_ram_before);
                }
                Err(e)
            }
        };

        if let Err(e) = &result
            && e.is_aborting()
            && !buffer.is_aborted()
        {
            if let Err(abort_err) = state.abort(&buffer) {
                warn!("DWPT: abort of {} failed: {abort_err}", buffer.segment_name);
            }
            notifications.on_tragic_event(e, "process_documents");
        }
        result
    }

    /// Discard every buffered document.
    pub fn abort(&mut self) -> Result<()> {
        let buffer = Arc::clone(&self.buffer);
        match self.state.as_mut() {
            Some(state) => state.abort(&buffer),
            None => Ok(()),
        }
    }

    /// Move the state out for flushing; the buffer is unregistered afterwards.
    pub(crate) fn checkout(&mut self) -> FlushingBuffer {
        let state = self.state_mut();
        debug_assert!(state.delete_slice.is_empty() || state.num_docs > 0);
        let state = match self.state.take() {
            Some(state) => state,
            None => unreachable!(),
        };
        FlushingBuffer {
            buffer: Arc::clone(&self.buffer),
            state,
        }
    }

    /// Drop the state of a buffer that is being retired without a flush.
    pub(crate) fn retire(&mut self) {
        self.state.take();
    }
}

impl fmt::Debug for BufferGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferGuard")
            .field("buffer", &self.buffer)
            .field("live", &self.is_live())
            .finish()
    }
}

/// A buffer checked out for flushing, owned by the thread that flushes it.
pub struct FlushingBuffer {
    buffer: Arc<SegmentBuffer>,
    state: BufferState,
}

impl FlushingBuffer {
    pub fn buffer(&self) -> &Arc<SegmentBuffer> {
        &self.buffer
    }

    pub fn segment_name(&self) -> &str {
        &self.buffer.segment_name
    }

    pub fn num_docs(&self) -> u32 {
        self.state.num_docs
    }

    pub fn segment_info(&self) -> &SegmentInfo {
        &self.state.segment_info
    }

    /// Files written during flush that are not part of the sealed segment.
    pub fn pending_files_to_delete(&self) -> &BTreeSet<String> {
        &self.state.files_to_delete
    }

    /// Freeze the global updates known when this flush starts and drain
    /// this buffer's slice up to the same point.
    ///
    /// Every global update older than the returned packet is now either in
    /// the packet or in this buffer's private updates, so deletes and the
    /// segment are ordered consistently.
    pub fn prepare_flush(&mut self) -> Result<Option<Arc<FrozenBufferedUpdates>>> {
        debug_assert!(self.state.num_docs > 0);
        let BufferState {
            delete_slice,
            pending_updates,
            num_docs,
            ..
        } = &mut self.state;
        let global_updates = self.buffer.delete_queue.freeze_global_buffer(Some(delete_slice))?;
        delete_slice.apply(pending_updates, *num_docs);
        debug_assert!(delete_slice.is_empty());
        Ok(global_updates)
    }

    /// Write the segment. Returns `None` if the buffer was aborted.
    ///
    /// Any error aborts the buffer; files it wrote are left to the caller's
    /// cleanup.
    pub fn flush(
        &mut self,
        notifications: &dyn FlushNotifications,
    ) -> Result<Option<FlushedSegment>> {
        assert!(
            self.buffer.is_flush_pending(),
            "flushing a buffer that is not flush pending"
        );
        debug_assert!(self.state.num_docs > 0);
        debug_assert!(
            self.state.delete_slice.is_empty(),
            "all deletes must be applied in prepare_flush"
        );

        let result = self.flush_segment();
        if let Err(e) = &result
            && !self.buffer.is_aborted()
        {
            if let Err(abort_err) = self.state.abort(&self.buffer) {
                warn!("DWPT: abort of {} failed: {abort_err}", self.buffer.segment_name);
            }
            notifications.on_tragic_event(e, "flush");
        }
        self.buffer.has_flushed.set("has flushed");
        result
    }

    fn flush_segment(&mut self) -> Result<Option<FlushedSegment>> {
        let started = Instant::now();
        let start_mb = self.state.ram_bytes_used() as f64 / 1024.0 / 1024.0;
        let state = &mut self.state;
        state.segment_info.max_doc = state.num_docs;

        // apply delete-by-doc-id now; those only come from failed documents
        let deleted = state.pending_updates.take_delete_doc_ids();
        let mut live_docs = None;
        let mut del_count = 0;
        if !deleted.is_empty() {
            let mut live = LiveDocs::new(state.num_docs);
            for doc_id in deleted {
                live.delete(doc_id);
            }
            del_count = live.num_deleted();
            live_docs = Some(live);
        }

        if self.buffer.is_aborted() {
            debug!("DWPT: flush: skip because aborting is set");
            return Ok(None);
        }

        debug!(
            "DWPT: flush postings as segment {} num_docs={}",
            state.segment_info.name, state.num_docs
        );
        let tracking = TrackingStorage::new(Arc::clone(&self.buffer.storage));
        let mut write_state = SegmentWriteState {
            storage: &tracking,
            segment_name: &state.segment_info.name,
            max_doc: state.num_docs,
            segment_updates: &state.pending_updates,
            live_docs,
            del_count_on_flush: del_count,
        };
        let sort_map = state.chain.flush(&mut write_state)?;
        let live_docs = write_state.live_docs.take();

        // term deletes were resolved against the postings while writing them
        state.pending_updates.clear_delete_terms();
        state.segment_info.files = tracking.created_files();

        let segment_updates = if state.pending_updates.num_query_deletes() == 0
            && state.pending_updates.num_field_updates() == 0
        {
            state.pending_updates.clear();
            None
        } else {
            Some(Arc::new(FrozenBufferedUpdates::new(
                &state.pending_updates,
                Some(state.segment_info.name.clone()),
            )))
        };

        let live_docs = match (&sort_map, live_docs) {
            (Some(map), Some(live)) => Some(live.remap(map)),
            (_, live) => live,
        };
        let mut segment = FlushedSegment::new(
            state.segment_info.clone(),
            segment_updates,
            live_docs,
            sort_map,
        );
        self.seal_flushed_segment(&mut segment)?;
        self.state.segment_info = segment.info.clone();

        let size_mb = segment.info.size_in_bytes(self.buffer.storage.as_ref())? as f64 / 1024.0 / 1024.0;
        debug!(
            "DWPT: flushed {}: {} docs, {} deleted, ram {:.3} MB, new segment {:.3} MB, took {:?}",
            segment.info.name,
            segment.info.max_doc,
            segment.del_count,
            start_mb,
            size_mb,
            started.elapsed()
        );
        Ok(Some(segment))
    }

    fn seal_flushed_segment(&mut self, segment: &mut FlushedSegment) -> Result<()> {
        let storage = self.buffer.storage.as_ref();
        let info = &mut segment.info;

        if self.buffer.use_compound_file {
            let original_files = info.files.clone();
            info.files = write_compound(storage, &info.name, &original_files)?;
            self.state.files_to_delete.extend(original_files);
            info.use_compound_file = true;
        }

        // live docs go after the compound file so they are never packed
        if let Some(live_docs) = &segment.live_docs {
            debug_assert!(segment.del_count > 0);
            info.del_count = segment.del_count;
            info.del_gen = 1;
            let file = info
                .live_docs_file_name()
                .ok_or_else(|| IrisError::internal("live docs without a delete generation"))?;
            live_docs.write(storage, &file)?;
        }

        let meta = info.meta_file_name();
        info.files.insert(meta);
        info.write(storage)?;
        Ok(())
    }

    /// Discard the buffered documents of a queued or blocked flush.
    pub fn abort(&mut self) -> Result<()> {
        self.state.abort(&self.buffer)
    }
}

impl fmt::Debug for FlushingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushingBuffer")
            .field("buffer", &self.buffer)
            .field("num_docs", &self.state.num_docs)
            .finish()
    }
}
