//! The global delete/update sequencing queue.
//!
//! [`DeleteQueue`] is a non-blocking linked pending-deletes queue. In contrast
//! to other queue implementations it only maintains a tail and never a head.
//! Every [`SegmentBuffer`](crate::writer::per_thread::SegmentBuffer) owns a
//! [`DeleteSlice`] with its own private head and tail into this list; the
//! queue itself owns one more slice for the global buffered updates.
//!
//! Each indexing thread updates its slice after a document batch. Deletes are
//! appended to the queue's tail and stay reachable only from the slices that
//! have not drained past them yet, so nodes are released as soon as the last
//! slice moves on.
//!
//! A delete that is appended during a document batch must not affect the
//! documents of that batch. Before a buffer applies its slice it records the
//! number of documents it held before the batch started and bounds every
//! drained update by it. Each document is therefore only affected by deletes
//! that entered the queue after the batch that produced it.
//!
//! Every queue belongs to a generation. A full flush advances the queue once:
//! the old generation fixes its maximum sequence number and the new one
//! starts past a reserved gap.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log::trace;
use parking_lot::Mutex;

use crate::error::{IrisError, Result};
use crate::util::set_once::SetOnce;
use crate::writer::buffered_updates::BufferedUpdates;
use crate::writer::frozen_updates::FrozenBufferedUpdates;
use crate::writer::term::{DocValuesUpdate, MAX_DOC_ID_UPTO, QueryRef, Term};

/// A sequence number handed out by the delete queue.
pub type SeqNumber = u64;

/// A sequence number plus a flag telling the caller that something happened
/// on the side: new operations reached a slice, or a write triggered flushes
/// or applied deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqNo {
    pub value: SeqNumber,
    pub flagged: bool,
}

impl SeqNo {
    pub const fn new(value: SeqNumber) -> Self {
        SeqNo {
            value,
            flagged: false,
        }
    }

    pub const fn flagged(value: SeqNumber) -> Self {
        SeqNo {
            value,
            flagged: true,
        }
    }

    /// Same value, flagged when `flag` is set.
    pub fn flag_if(self, flag: bool) -> Self {
        SeqNo {
            value: self.value,
            flagged: self.flagged || flag,
        }
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.flagged {
            write!(f, "-{}", self.value)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

/// Payload of a queue node.
#[derive(Debug)]
pub enum UpdateItem {
    /// Delete-by-term that accompanies a document update.
    Term(Term),
    Terms(Vec<Term>),
    Queries(Vec<QueryRef>),
    DocValues(Vec<DocValuesUpdate>),
}

impl UpdateItem {
    fn apply(&self, updates: &mut BufferedUpdates, doc_id_upto: u32) {
        match self {
            UpdateItem::Term(term) => updates.add_term(term.clone(), doc_id_upto),
            UpdateItem::Terms(terms) => {
                for term in terms {
                    updates.add_term(term.clone(), doc_id_upto);
                }
            }
            UpdateItem::Queries(queries) => {
                for query in queries {
                    updates.add_query(Arc::clone(query), doc_id_upto);
                }
            }
            UpdateItem::DocValues(dv_updates) => {
                for update in dv_updates {
                    updates.add_doc_values_update(update.clone(), doc_id_upto);
                }
            }
        }
    }

    pub fn is_delete(&self) -> bool {
        !matches!(self, UpdateItem::DocValues(_))
    }
}

/// An immutable queue entry whose `next` link is set once by the appender.
pub struct QueueNode {
    // `None` only for the sentinel a queue starts with.
    item: Option<UpdateItem>,
    next: OnceLock<Arc<QueueNode>>,
}

impl QueueNode {
    pub fn new(item: UpdateItem) -> Arc<Self> {
        Arc::new(QueueNode {
            item: Some(item),
            next: OnceLock::new(),
        })
    }

    fn sentinel() -> Arc<Self> {
        Arc::new(QueueNode {
            item: None,
            next: OnceLock::new(),
        })
    }

    pub fn item(&self) -> Option<&UpdateItem> {
        self.item.as_ref()
    }

    fn apply(&self, updates: &mut BufferedUpdates, doc_id_upto: u32) {
        if let Some(item) = &self.item {
            item.apply(updates, doc_id_upto);
        }
    }
}

impl fmt::Debug for QueueNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueNode")
            .field("item", &self.item)
            .field("linked", &self.next.get().is_some())
            .finish()
    }
}

impl Drop for QueueNode {
    // Unlink iteratively so a long drained chain doesn't recurse on drop.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// A private `(head, tail]` window into the delete queue.
#[derive(Clone)]
pub struct DeleteSlice {
    head: Arc<QueueNode>,
    tail: Arc<QueueNode>,
}

impl DeleteSlice {
    fn new(current_tail: Arc<QueueNode>) -> Self {
        DeleteSlice {
            head: Arc::clone(&current_tail),
            tail: current_tail,
        }
    }

    /// Apply every node after the head up to and including the tail, then
    /// collapse the slice.
    pub fn apply(&mut self, updates: &mut BufferedUpdates, doc_id_upto: u32) {
        if self.is_empty() {
            return;
        }
        let mut current = Arc::clone(&self.head);
        loop {
            current = match current.next.get() {
                Some(next) => Arc::clone(next),
                None => panic!("slice tail must be reachable from its head"),
            };
            current.apply(updates, doc_id_upto);
            if Arc::ptr_eq(&current, &self.tail) {
                break;
            }
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        self.head = Arc::clone(&self.tail);
    }

    pub fn is_empty(&self) -> bool {
        Arc::ptr_eq(&self.head, &self.tail)
    }

    /// Whether `node` is the tail of this slice.
    pub fn is_tail(&self, node: &Arc<QueueNode>) -> bool {
        Arc::ptr_eq(&self.tail, node)
    }
}

impl fmt::Debug for DeleteSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteSlice")
            .field("empty", &self.is_empty())
            .finish()
    }
}

struct GlobalBuffer {
    slice: DeleteSlice,
    updates: BufferedUpdates,
}

/// The sequencing queue of one generation.
pub struct DeleteQueue {
    generation: u64,
    start_seq_no: SeqNumber,
    // max completed seq no of the generation this one replaced
    previous_max_seq_no: SeqNumber,
    // the append lock; appends, slice updates and advancing serialize here
    tail: Mutex<Arc<QueueNode>>,
    // the freeze lock, always taken before `tail`
    global: Mutex<GlobalBuffer>,
    global_bytes_used: AtomicUsize,
    global_term_deletes: AtomicUsize,
    next_seq_no: AtomicU64,
    max_seq_no: AtomicU64,
    advanced: SetOnce,
    closed: AtomicBool,
}

impl Default for DeleteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleteQueue {
    pub fn new() -> Self {
        // seq numbers start at 1; 0 means "nothing happened yet"
        Self::with_generation(0, 1, 0)
    }

    fn with_generation(generation: u64, start_seq_no: SeqNumber, previous_max_seq_no: SeqNumber) -> Self {
        let sentinel = QueueNode::sentinel();
        DeleteQueue {
            generation,
            start_seq_no,
            previous_max_seq_no,
            tail: Mutex::new(Arc::clone(&sentinel)),
            global: Mutex::new(GlobalBuffer {
                slice: DeleteSlice::new(sentinel),
                updates: BufferedUpdates::new("global"),
            }),
            global_bytes_used: AtomicUsize::new(0),
            global_term_deletes: AtomicUsize::new(0),
            next_seq_no: AtomicU64::new(start_seq_no),
            max_seq_no: AtomicU64::new(SeqNumber::MAX),
            advanced: SetOnce::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn add_delete_terms(&self, terms: Vec<Term>) -> Result<SeqNumber> {
        let seq_no = self.append(QueueNode::new(UpdateItem::Terms(terms)))?;
        self.try_apply_global_slice()?;
        Ok(seq_no)
    }

    pub fn add_delete_queries(&self, queries: Vec<QueryRef>) -> Result<SeqNumber> {
        let seq_no = self.append(QueueNode::new(UpdateItem::Queries(queries)))?;
        self.try_apply_global_slice()?;
        Ok(seq_no)
    }

    pub fn add_doc_values_updates(&self, updates: Vec<DocValuesUpdate>) -> Result<SeqNumber> {
        let seq_no = self.append(QueueNode::new(UpdateItem::DocValues(updates)))?;
        self.try_apply_global_slice()?;
        Ok(seq_no)
    }

    /// Append `node` and make it the tail of `slice`.
    ///
    /// Several threads may add the same delete concurrently; whoever appends
    /// last owns the tail its own slice ends at, so exactly one of the
    /// updates observes the others.
    pub fn add(&self, node: Arc<QueueNode>, slice: &mut DeleteSlice) -> Result<SeqNumber> {
        let seq_no = self.append(Arc::clone(&node))?;
        slice.tail = node;
        debug_assert!(!slice.is_empty(), "slice head and tail must differ after add");
        self.try_apply_global_slice()?;
        Ok(seq_no)
    }

    fn append(&self, node: Arc<QueueNode>) -> Result<SeqNumber> {
        let mut tail = self.tail.lock();
        self.ensure_open()?;
        assert!(
            !Arc::ptr_eq(&tail, &node) && node.next.get().is_none(),
            "queue node can only be appended once"
        );
        if tail.next.set(Arc::clone(&node)).is_err() {
            panic!("queue tail must not have a successor");
        }
        *tail = node;
        Ok(self.next_sequence_number())
    }

    /// A zero-length slice positioned at the current tail.
    pub fn new_slice(&self) -> DeleteSlice {
        DeleteSlice::new(Arc::clone(&*self.tail.lock()))
    }

    /// Move the slice tail to the current tail. The returned number is
    /// flagged when the tail moved, meaning the slice must be applied.
    pub fn update_slice(&self, slice: &mut DeleteSlice) -> Result<SeqNo> {
        let tail = self.tail.lock();
        self.ensure_open()?;
        let seq_no = self.next_sequence_number();
        if !Arc::ptr_eq(&slice.tail, &tail) {
            slice.tail = Arc::clone(&tail);
            return Ok(SeqNo::flagged(seq_no));
        }
        Ok(SeqNo::new(seq_no))
    }

    /// Same as [`DeleteQueue::update_slice`] without consuming a sequence
    /// number; returns `true` if the slice tail moved.
    fn update_slice_no_seq_no(&self, slice: &mut DeleteSlice) -> bool {
        let tail = self.tail.lock();
        if !Arc::ptr_eq(&slice.tail, &tail) {
            slice.tail = Arc::clone(&tail);
            return true;
        }
        false
    }

    /// Drain new nodes into the global buffer unless another thread holds
    /// the freeze lock. Losing the race is fine: the winner or a later call
    /// picks the nodes up.
    pub fn try_apply_global_slice(&self) -> Result<()> {
        if let Some(mut global) = self.global.try_lock() {
            self.ensure_open()?;
            let GlobalBuffer { slice, updates } = &mut *global;
            if self.update_slice_no_seq_no(slice) {
                slice.apply(updates, MAX_DOC_ID_UPTO);
                self.publish_global_stats(updates);
            }
        }
        Ok(())
    }

    /// Snapshot every global update known so far.
    ///
    /// When a caller slice is given its tail moves to the frozen tail, so the
    /// caller and the global buffer agree on which nodes the packet covers.
    pub fn freeze_global_buffer(
        &self,
        caller_slice: Option<&mut DeleteSlice>,
    ) -> Result<Option<Arc<FrozenBufferedUpdates>>> {
        let mut global = self.global.lock();
        self.ensure_open()?;
        let current_tail = Arc::clone(&*self.tail.lock());
        if let Some(slice) = caller_slice {
            slice.tail = Arc::clone(&current_tail);
        }
        Ok(self.freeze_global_buffer_locked(&mut global, current_tail))
    }

    /// Freeze unless the queue is already closed.
    pub fn maybe_freeze_global_buffer(&self) -> Option<Arc<FrozenBufferedUpdates>> {
        let mut global = self.global.lock();
        if self.closed.load(Ordering::Acquire) {
            debug_assert!(!self.any_changes_locked(&global), "closed queue has changes");
            return None;
        }
        let current_tail = Arc::clone(&*self.tail.lock());
        self.freeze_global_buffer_locked(&mut global, current_tail)
    }

    fn freeze_global_buffer_locked(
        &self,
        global: &mut GlobalBuffer,
        current_tail: Arc<QueueNode>,
    ) -> Option<Arc<FrozenBufferedUpdates>> {
        let GlobalBuffer { slice, updates } = global;
        if !slice.is_tail(&current_tail) {
            slice.tail = current_tail;
            slice.apply(updates, MAX_DOC_ID_UPTO);
        }
        let packet = if updates.any() {
            let packet = FrozenBufferedUpdates::new(updates, None);
            updates.clear();
            trace!("DW: froze global updates gen={} {:?}", self.generation, packet);
            Some(Arc::new(packet))
        } else {
            None
        };
        self.publish_global_stats(updates);
        packet
    }

    fn publish_global_stats(&self, updates: &BufferedUpdates) {
        self.global_bytes_used
            .store(updates.ram_bytes_used(), Ordering::Release);
        self.global_term_deletes
            .store(updates.num_term_deletes(), Ordering::Release);
    }

    /// Whether any update is buffered or not yet drained into the global buffer.
    pub fn any_changes(&self) -> bool {
        let global = self.global.lock();
        self.any_changes_locked(&global)
    }

    fn any_changes_locked(&self, global: &GlobalBuffer) -> bool {
        // tail can't move while we're here as long as no append races; a race
        // shows up as a slice whose tail lags the queue tail
        global.updates.any() || !global.slice.is_empty() || !global.slice.is_tail(&self.tail.lock())
    }

    /// Drop every buffered global update and fast-forward the global slice.
    pub fn clear(&self) {
        let mut global = self.global.lock();
        let current_tail = Arc::clone(&*self.tail.lock());
        global.slice = DeleteSlice::new(current_tail);
        global.updates.clear();
        self.publish_global_stats(&global.updates);
    }

    pub fn num_global_term_deletes(&self) -> usize {
        self.global_term_deletes.load(Ordering::Acquire)
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.global_bytes_used.load(Ordering::Acquire)
    }

    fn next_sequence_number(&self) -> SeqNumber {
        let seq_no = self.next_seq_no.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            seq_no <= self.max_seq_no.load(Ordering::Acquire),
            "seq_no={seq_no} exceeds max_seq_no"
        );
        seq_no
    }

    pub fn last_sequence_number(&self) -> SeqNumber {
        self.next_seq_no.load(Ordering::Acquire) - 1
    }

    /// Insert a gap so numbers possibly handed out by racing operations are
    /// never reused.
    pub fn skip_sequence_numbers(&self, jump: u64) {
        self.next_seq_no.fetch_add(jump, Ordering::AcqRel);
    }

    /// The highest sequence number known to be completed, falling back to
    /// the previous generation while this one handed none out.
    pub fn max_completed_seq_no(&self) -> SeqNumber {
        if self.start_seq_no < self.next_seq_no.load(Ordering::Acquire) {
            self.last_sequence_number()
        } else {
            self.previous_max_seq_no
        }
    }

    /// `SeqNumber::MAX` until the queue was advanced.
    pub fn max_seq_no(&self) -> SeqNumber {
        self.max_seq_no.load(Ordering::Acquire)
    }

    /// Close this generation to advancement and create its successor.
    ///
    /// `max_num_pending_ops` numbers are reserved for operations that raced
    /// in against this generation; the new generation starts past them.
    ///
    /// # Panics
    ///
    /// Panics if the queue was already advanced.
    pub fn advance_queue(&self, max_num_pending_ops: u64) -> DeleteQueue {
        let _tail = self.tail.lock();
        self.advanced.set("queue advance");
        let seq_no = self.last_sequence_number() + max_num_pending_ops + 1;
        self.max_seq_no.store(seq_no, Ordering::Release);
        trace!(
            "DW: advance delete queue gen={} max_seq_no={}",
            self.generation, seq_no
        );
        DeleteQueue::with_generation(self.generation + 1, seq_no + 1, seq_no)
    }

    pub fn is_advanced(&self) -> bool {
        self.advanced.get()
    }

    /// Close the queue; every change must have been frozen or cleared.
    ///
    /// # Panics
    ///
    /// Panics if unresolved changes remain.
    pub fn close(&self) {
        let global = self.global.lock();
        assert!(
            !self.any_changes_locked(&global),
            "can't close delete queue unless all changes are applied"
        );
        let _tail = self.tail.lock();
        self.closed.store(true, Ordering::Release);
        let max_seq_no = self.max_seq_no.load(Ordering::Acquire);
        debug_assert!(
            self.next_seq_no.load(Ordering::Acquire) <= max_seq_no,
            "max_seq_no must be greater than the current seq_no"
        );
        if max_seq_no != SeqNumber::MAX {
            self.next_seq_no.store(max_seq_no + 1, Ordering::Release);
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IrisError::already_closed("delete queue is already closed"));
        }
        Ok(())
    }
}

impl fmt::Debug for DeleteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteQueue")
            .field("generation", &self.generation)
            .field("next_seq_no", &self.next_seq_no.load(Ordering::Relaxed))
            .field("max_seq_no", &self.max_seq_no.load(Ordering::Relaxed))
            .field("advanced", &self.advanced.get())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
