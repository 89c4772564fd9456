//! Flush controller: RAM accounting, flush selection and stalling.
//!
//! The controller tracks the bytes of active buffers and of buffers that
//! are pending or flushing, consults the flush policy after every change
//! and hands checked-out buffers to the threads that flush them. During a
//! full flush, buffers of the new generation that become pending are
//! blocked until the full flush finishes so they are never published
//! before the segments of the old generation.
//!
//! Threads are stalled once the accounted bytes exceed twice the RAM
//! buffer while flushes could still release enough memory. Stalling is the
//! only thing that keeps indexing from outrunning slow flushes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{IrisError, Result};
use crate::writer::config::IndexWriterConfig;
use crate::writer::delete_queue::{DeleteQueue, SeqNumber};
use crate::writer::flush_policy::{FlushControlView, FlushPolicy};
use crate::writer::per_thread::{BufferGuard, FlushingBuffer, SegmentBuffer};
use crate::writer::pool::BufferPool;
use crate::writer::stall::StallControl;
use crate::writer::updates_stream::BufferedUpdatesStream;

/// Accounting granularity ceiling.
const MAX_RAM_BUFFER_GRANULARITY: i64 = 16 * 1024;

const MB: f64 = 1024.0 * 1024.0;

#[derive(Default)]
struct ControlState {
    active_bytes: i64,
    flush_bytes: i64,
    num_pending: usize,
    num_docs_since_stalled: usize,
    full_flush: bool,
    full_flush_mark_done: bool,
    flush_queue: VecDeque<FlushingBuffer>,
    blocked_flushes: VecDeque<FlushingBuffer>,
    flushing_writers: Vec<Arc<SegmentBuffer>>,
    peak_active_bytes: i64,
    peak_flush_bytes: i64,
    peak_net_bytes: i64,
    peak_delta: i64,
    stall_start: Option<Instant>,
    closed: bool,
}

impl ControlState {
    fn net_bytes(&self) -> i64 {
        self.active_bytes + self.flush_bytes
    }

    fn update_peaks(&mut self, delta: i64) {
        self.peak_active_bytes = self.peak_active_bytes.max(self.active_bytes);
        self.peak_flush_bytes = self.peak_flush_bytes.max(self.flush_bytes);
        self.peak_net_bytes = self.peak_net_bytes.max(self.net_bytes());
        self.peak_delta = self.peak_delta.max(delta);
    }

    fn remove_flushing(&mut self, buffer: &Arc<SegmentBuffer>) -> bool {
        match self
            .flushing_writers
            .iter()
            .position(|b| Arc::ptr_eq(b, buffer))
        {
            Some(index) => {
                self.flushing_writers.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

pub struct FlushControl {
    state: Mutex<ControlState>,
    flush_done: Condvar,
    stall_control: StallControl,
    pool: Arc<BufferPool>,
    delete_queue: Arc<RwLock<Arc<DeleteQueue>>>,
    updates_stream: Arc<BufferedUpdatesStream>,
    policy: Arc<dyn FlushPolicy>,
    ram_buffer_size_mb: Option<f64>,
    max_buffered_docs: Option<usize>,
    hard_limit_mb: u64,
    hard_max_bytes_per_buffer: i64,
    num_docs_in_ram: AtomicI64,
    apply_all_deletes: AtomicBool,
}

impl FlushControl {
    /// `delete_queue` holds the active queue generation; it is replaced on
    /// every full flush.
    pub fn new(
        config: &IndexWriterConfig,
        pool: Arc<BufferPool>,
        delete_queue: Arc<RwLock<Arc<DeleteQueue>>>,
        updates_stream: Arc<BufferedUpdatesStream>,
    ) -> Self {
        FlushControl {
            state: Mutex::new(ControlState::default()),
            flush_done: Condvar::new(),
            stall_control: StallControl::new(),
            pool,
            delete_queue,
            updates_stream,
            policy: config.flush_policy_or_default(),
            ram_buffer_size_mb: config.ram_buffer_size_mb,
            max_buffered_docs: config.max_buffered_docs,
            hard_limit_mb: config.ram_per_thread_hard_limit_mb,
            hard_max_bytes_per_buffer: config.ram_per_thread_hard_limit_bytes(),
            num_docs_in_ram: AtomicI64::new(0),
            apply_all_deletes: AtomicBool::new(false),
        }
    }

    /// The active delete queue generation.
    pub fn delete_queue(&self) -> Arc<DeleteQueue> {
        Arc::clone(&*self.delete_queue.read())
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    // No more than ~0.1% of the RAM buffer, and at most 16 KiB.
    fn ram_buffer_granularity(&self) -> i64 {
        let mb = self.ram_buffer_size_mb.unwrap_or(self.hard_limit_mb as f64);
        ((mb * 1024.0) as i64).min(MAX_RAM_BUFFER_GRANULARITY)
    }

    fn stall_limit_bytes(&self) -> i64 {
        self.ram_buffer_size_mb
            .map_or(i64::MAX, |mb| (2.0 * mb * MB) as i64)
    }

    /// Account for the batch just processed on `guard`'s buffer.
    ///
    /// Returns the buffer checked out for flushing if it became pending;
    /// the guard no longer holds any state in that case.
    pub fn do_after_document(&self, guard: &mut BufferGuard) -> Option<FlushingBuffer> {
        let delta = guard.commit_last_bytes_used_delta();
        if self.max_buffered_docs.is_none() && delta < self.ram_buffer_granularity() {
            // no tally changed, so the last stall decision still holds; the
            // uncommitted delta accumulates until it passes the granularity
            return None;
        }

        let buffer = Arc::clone(guard.buffer());
        let mut state = self.state.lock();
        // committed under the lock: set_flush_pending reads it without the buffer lock
        buffer.commit_last_bytes_used(delta);
        if buffer.is_flush_pending() {
            state.flush_bytes += delta;
            debug_assert!(state.flush_bytes >= 0, "flush_bytes: {}", state.flush_bytes);
        } else {
            state.active_bytes += delta;
            debug_assert!(state.active_bytes >= 0, "active_bytes: {}", state.active_bytes);
            self.policy.on_change(
                &mut LockedControl {
                    control: self,
                    state: &mut state,
                },
                Some(&buffer),
            );
            if !buffer.is_flush_pending()
                && guard.ram_bytes_used() as i64 > self.hard_max_bytes_per_buffer
            {
                debug!(
                    "DWFC: {} exceeds the per buffer hard limit of {} MB",
                    buffer.segment_name(),
                    self.hard_limit_mb
                );
                self.set_flush_pending_locked(&mut state, &buffer);
            }
        }
        state.update_peaks(delta);

        let flushing = self.checkout_locked(&mut state, guard, false);
        let stalled = self.update_stall_state(&mut state);
        if stalled {
            state.num_docs_since_stalled += 1;
        } else {
            state.num_docs_since_stalled = 0;
        }
        debug_assert!(self.memory_bound_holds_locked(&state), "{}", self.describe(&state));
        flushing
    }

    /// Mark `buffer` flush pending and move its bytes to the flush tally.
    ///
    /// Buffers without documents are left alone; buffers already pending
    /// are ignored.
    pub fn set_flush_pending(&self, buffer: &Arc<SegmentBuffer>) {
        let mut state = self.state.lock();
        if !buffer.is_flush_pending() {
            self.set_flush_pending_locked(&mut state, buffer);
        }
    }

    fn set_flush_pending_locked(&self, state: &mut ControlState, buffer: &Arc<SegmentBuffer>) {
        debug_assert!(!buffer.is_flush_pending());
        // no assertion on the doc count: the buffer may have aborted meanwhile
        if buffer.num_docs_in_ram() > 0 {
            buffer.set_flush_pending();
            let bytes = buffer.last_committed_bytes();
            state.flush_bytes += bytes;
            state.active_bytes -= bytes;
            state.num_pending += 1;
            trace!(
                "DWFC: {} flush pending with {:.3} MB",
                buffer.segment_name(),
                bytes as f64 / MB
            );
        }
    }

    fn checkout_locked(
        &self,
        state: &mut ControlState,
        guard: &mut BufferGuard,
        mark_pending: bool,
    ) -> Option<FlushingBuffer> {
        let buffer = Arc::clone(guard.buffer());
        if state.full_flush {
            if buffer.is_flush_pending() {
                self.checkout_and_block(state, guard);
                return self.poll_flush_queue(state);
            }
        } else {
            if mark_pending {
                debug_assert!(!buffer.is_flush_pending());
                self.set_flush_pending_locked(state, &buffer);
            }
            if buffer.is_flush_pending() {
                return Some(self.check_out_for_flush(state, guard));
            }
        }
        None
    }

    fn checkout_and_block(&self, state: &mut ControlState, guard: &mut BufferGuard) {
        let buffer = Arc::clone(guard.buffer());
        debug_assert!(buffer.is_flush_pending(), "can not block a non-pending buffer");
        debug_assert!(state.full_flush, "can not block outside of a full flush");
        state.num_pending -= 1;
        let checked_out = self.pool.checkout(&buffer);
        debug_assert!(checked_out, "blocked buffer was not registered");
        trace!("DWFC: block flush of {} until the full flush finishes", buffer.segment_name());
        state.blocked_flushes.push_back(guard.checkout());
    }

    fn check_out_for_flush(&self, state: &mut ControlState, guard: &mut BufferGuard) -> FlushingBuffer {
        let buffer = Arc::clone(guard.buffer());
        debug_assert!(buffer.is_flush_pending());
        debug_assert!(
            !state.flushing_writers.iter().any(|b| Arc::ptr_eq(b, &buffer)),
            "buffer is already flushing"
        );
        state.flushing_writers.push(Arc::clone(&buffer));
        state.num_pending -= 1;
        let checked_out = self.pool.checkout(&buffer);
        debug_assert!(checked_out, "flushing buffer was not registered");
        let flushing = guard.checkout();
        self.update_stall_state(state);
        flushing
    }

    fn poll_flush_queue(&self, state: &mut ControlState) -> Option<FlushingBuffer> {
        let next = state.flush_queue.pop_front();
        if next.is_some() {
            self.update_stall_state(state);
        }
        next
    }

    /// Take one queued flush, or check out a pending buffer no thread holds.
    pub fn next_pending_flush(&self) -> Option<FlushingBuffer> {
        let (num_pending, full_flush) = {
            let mut state = self.state.lock();
            if let Some(next) = self.poll_flush_queue(&mut state) {
                return Some(next);
            }
            (state.num_pending, state.full_flush)
        };
        // a full flush queues everything it wants flushed
        if num_pending > 0 && !full_flush {
            for buffer in self.pool.buffers() {
                if !buffer.is_flush_pending() {
                    continue;
                }
                if let Some(mut guard) = buffer.try_lock()
                    && guard.is_live()
                {
                    let mut state = self.state.lock();
                    return self.checkout_locked(&mut state, &mut guard, false);
                }
            }
        }
        None
    }

    /// The registered buffer with the most committed bytes among those that
    /// are neither pending nor empty.
    pub fn find_largest_non_pending_writer(&self) -> Option<Arc<SegmentBuffer>> {
        let mut largest = None;
        let mut max_ram = 0;
        let mut count = 0;
        for buffer in self.pool.buffers() {
            if buffer.is_flush_pending() || buffer.is_aborted() || buffer.num_docs_in_ram() == 0 {
                continue;
            }
            count += 1;
            let ram = buffer.last_committed_bytes();
            if ram > max_ram {
                max_ram = ram;
                largest = Some(buffer);
            }
        }
        trace!("DWFC: {count} buffers are candidates, largest uses {max_ram} bytes");
        largest
    }

    /// Check out the largest buffer for flushing, marking it pending.
    pub fn checkout_largest_non_pending_writer(&self) -> Option<FlushingBuffer> {
        let largest = self.find_largest_non_pending_writer()?;
        // locked briefly to swap it out, bypassing the pool's free list
        let mut guard = largest.lock();
        if !guard.is_live() {
            return None;
        }
        let mut state = self.state.lock();
        let mark_pending = !largest.is_flush_pending();
        let flushing = self.checkout_locked(&mut state, &mut guard, mark_pending);
        self.update_stall_state(&mut state);
        flushing
    }

    /// Lease a buffer bound to the active delete queue generation.
    ///
    /// Buffers of an advanced generation are left for the running full
    /// flush to collect.
    pub fn obtain_and_lock(&self) -> Result<BufferGuard> {
        loop {
            if self.state.lock().closed {
                return Err(IrisError::already_closed("flush control is closed"));
            }
            let guard = self.pool.get_and_lock()?;
            if Arc::ptr_eq(guard.buffer().delete_queue(), &self.delete_queue()) {
                return Ok(guard);
            }
            debug_assert!(
                {
                    let state = self.state.lock();
                    state.full_flush && !state.full_flush_mark_done
                },
                "leased a stale buffer outside of a full flush"
            );
            drop(guard);
        }
    }

    /// Start a full flush.
    ///
    /// Advances the delete queue, reserving one sequence number per
    /// registered buffer, and queues every buffer of the old generation
    /// that holds documents. Returns the old generation's max sequence
    /// number.
    ///
    /// # Panics
    ///
    /// Panics if a full flush is already running; callers serialize on
    /// [`FlushControl::wait_for_full_flush`].
    pub fn mark_for_full_flush(&self) -> SeqNumber {
        let (flushing_queue, seq_no) = {
            let mut state = self.state.lock();
            assert!(!state.full_flush, "full flush is already running");
            assert!(
                !state.full_flush_mark_done,
                "full flush collection marker is still set"
            );
            state.full_flush = true;
            // no new buffers while the generation changes
            self.pool.lock_new_writers();
            let max_num_pending_ops = self.pool.size() as u64;
            let mut active = self.delete_queue.write();
            let flushing_queue = Arc::clone(&*active);
            let next_queue = flushing_queue.advance_queue(max_num_pending_ops);
            let seq_no = flushing_queue.max_seq_no();
            *active = Arc::new(next_queue);
            drop(active);
            self.pool.unlock_new_writers();
            (flushing_queue, seq_no)
        };
        info!(
            "DWFC: start full flush of gen={} max_seq_no={}",
            flushing_queue.generation(),
            seq_no
        );

        let mut full_flush_buffers = Vec::new();
        for mut guard in self
            .pool
            .filter_and_lock(|b| Arc::ptr_eq(b.delete_queue(), &flushing_queue))
        {
            if guard.num_docs() > 0 {
                let mut state = self.state.lock();
                let buffer = Arc::clone(guard.buffer());
                if !buffer.is_flush_pending() {
                    self.set_flush_pending_locked(&mut state, &buffer);
                }
                full_flush_buffers.push(self.check_out_for_flush(&mut state, &mut guard));
            } else {
                // leased concurrently and never used; drop it on the floor
                let checked_out = self.pool.checkout(guard.buffer());
                debug_assert!(checked_out);
                guard.retire();
            }
        }

        let mut state = self.state.lock();
        // pending buffers of the old generation may have been blocked meanwhile
        self.prune_blocked_queue(&mut state, &flushing_queue);
        state.flush_queue.extend(full_flush_buffers);
        self.update_stall_state(&mut state);
        state.full_flush_mark_done = true;
        debug!(
            "DWFC: full flush queued {} buffers, {} blocked",
            state.flush_queue.len(),
            state.blocked_flushes.len()
        );
        seq_no
    }

    fn prune_blocked_queue(&self, state: &mut ControlState, flushing_queue: &Arc<DeleteQueue>) {
        let mut remaining = VecDeque::with_capacity(state.blocked_flushes.len());
        while let Some(blocked) = state.blocked_flushes.pop_front() {
            if Arc::ptr_eq(blocked.buffer().delete_queue(), flushing_queue) {
                // pending was already decremented when the buffer was blocked
                state.flushing_writers.push(Arc::clone(blocked.buffer()));
                state.flush_queue.push_back(blocked);
            } else {
                remaining.push_back(blocked);
            }
        }
        state.blocked_flushes = remaining;
    }

    /// Release buffers blocked by the full flush.
    pub fn finish_full_flush(&self) {
        let mut state = self.state.lock();
        assert!(state.full_flush, "no full flush is running");
        debug_assert!(state.flush_queue.is_empty(), "flush queue must be drained");
        debug_assert!(state.flushing_writers.is_empty(), "flushes must have finished");
        if !state.blocked_flushes.is_empty() {
            let active = self.delete_queue();
            self.prune_blocked_queue(&mut state, &active);
            debug_assert!(state.blocked_flushes.is_empty());
        }
        state.full_flush = false;
        state.full_flush_mark_done = false;
        self.update_stall_state(&mut state);
        self.flush_done.notify_all();
        info!("DWFC: finished full flush");
    }

    /// Abort every queued and blocked flush and end the full flush.
    pub fn abort_full_flushes(&self) {
        self.abort_pending_flushes();
        let mut state = self.state.lock();
        state.full_flush = false;
        state.full_flush_mark_done = false;
        self.flush_done.notify_all();
        info!("DWFC: aborted full flush");
    }

    /// Abort every queued and blocked flush; failures are swallowed.
    ///
    /// The buffers are collected under the control lock and aborted after
    /// releasing it.
    pub fn abort_pending_flushes(&self) {
        let mut aborting: Vec<FlushingBuffer> = {
            let mut state = self.state.lock();
            let mut aborting: Vec<_> = state.flush_queue.drain(..).collect();
            let blocked: Vec<_> = state.blocked_flushes.drain(..).collect();
            for flushing in &blocked {
                // flushing for the accounting in do_after_flush
                state.flushing_writers.push(Arc::clone(flushing.buffer()));
            }
            aborting.extend(blocked);
            aborting
        };
        for flushing in &mut aborting {
            self.subtract_flushed_num_docs(flushing.num_docs());
            if let Err(e) = flushing.abort() {
                warn!("DWFC: abort of {} failed: {e}", flushing.segment_name());
            }
        }
        let mut state = self.state.lock();
        for flushing in &aborting {
            self.do_after_flush_locked(&mut state, flushing.buffer());
        }
        self.update_stall_state(&mut state);
    }

    /// Release the accounting of a finished or failed flush.
    pub fn do_after_flush(&self, buffer: &Arc<SegmentBuffer>) {
        let mut state = self.state.lock();
        self.do_after_flush_locked(&mut state, buffer);
    }

    fn do_after_flush_locked(&self, state: &mut ControlState, buffer: &Arc<SegmentBuffer>) {
        let removed = state.remove_flushing(buffer);
        debug_assert!(removed, "{} was not flushing", buffer.segment_name());
        state.flush_bytes -= buffer.last_committed_bytes();
        debug_assert!(self.memory_bound_holds_locked(state), "{}", self.describe(state));
        self.update_stall_state(state);
        self.flush_done.notify_all();
    }

    /// Block until no full flush is running.
    pub fn wait_for_full_flush(&self) {
        let mut state = self.state.lock();
        while state.full_flush {
            self.flush_done.wait(&mut state);
        }
    }

    /// Block until no flush is in progress.
    pub fn wait_for_flush(&self) {
        let mut state = self.state.lock();
        while !state.flushing_writers.is_empty() {
            self.flush_done.wait(&mut state);
        }
    }

    /// Reverse the accounting of an aborted buffer and unregister it.
    pub fn do_on_abort(&self, guard: &mut BufferGuard) {
        let buffer = Arc::clone(guard.buffer());
        {
            let mut state = self.state.lock();
            let bytes = buffer.last_committed_bytes();
            if buffer.is_flush_pending() {
                state.flush_bytes -= bytes;
                state.num_pending -= 1;
            } else {
                state.active_bytes -= bytes;
            }
            self.update_stall_state(&mut state);
            let checked_out = self.pool.checkout(&buffer);
            debug_assert!(checked_out, "aborted buffer was not registered");
        }
        guard.retire();
    }

    /// Give the flush policy a chance to react to a delete-only operation.
    pub fn do_on_delete(&self) {
        let mut state = self.state.lock();
        self.policy.on_change(
            &mut LockedControl {
                control: self,
                state: &mut state,
            },
            None,
        );
    }

    fn update_stall_state(&self, state: &mut ControlState) -> bool {
        let limit = self.stall_limit_bytes();
        // never stall if the pending and running flushes can't release
        // enough memory to end the stall
        let stall = state.net_bytes() > limit && state.active_bytes < limit && !state.closed;
        if stall != self.stall_control.is_stalled() {
            if stall {
                debug!(
                    "DWFC: now stalling flushes: net_bytes={:.1} MB flush_bytes={:.1} MB full_flush={}",
                    state.net_bytes() as f64 / MB,
                    state.flush_bytes as f64 / MB,
                    state.full_flush
                );
                state.stall_start = Some(Instant::now());
            } else {
                debug!(
                    "DWFC: done stalling flushes after {:?}: net_bytes={:.1} MB flush_bytes={:.1} MB full_flush={}",
                    state.stall_start.take().map(|start| start.elapsed()),
                    state.net_bytes() as f64 / MB,
                    state.flush_bytes as f64 / MB,
                    state.full_flush
                );
            }
        }
        self.stall_control.update_stalled(stall);
        stall
    }

    /// Whether `active + flushing` stays below the worst case the stall
    /// control allows.
    pub fn memory_bound_holds(&self) -> bool {
        let state = self.state.lock();
        self.memory_bound_holds_locked(&state)
    }

    fn memory_bound_holds_locked(&self, state: &ControlState) -> bool {
        let Some(mb) = self.ram_buffer_size_mb else {
            return true;
        };
        let ram_buffer_bytes = (mb * MB) as i64;
        // docs much larger than the buffer can't be bounded at all
        if state.peak_delta >= ram_buffer_bytes >> 1 {
            return true;
        }
        let in_flight =
            (state.num_pending + state.flushing_writers.len() + state.blocked_flushes.len()) as i64;
        let expected = 2 * ram_buffer_bytes
            + in_flight * state.peak_delta
            + state.num_docs_since_stalled as i64 * state.peak_delta;
        state.net_bytes() <= expected
    }

    fn describe(&self, state: &ControlState) -> String {
        format!(
            "active_bytes={} flush_bytes={} pending={} flushing={} blocked={} peak_delta={} \
             peak_net_bytes={} peak_active_bytes={} peak_flush_bytes={} ram_buffer={:?} MB",
            state.active_bytes,
            state.flush_bytes,
            state.num_pending,
            state.flushing_writers.len(),
            state.blocked_flushes.len(),
            state.peak_delta,
            state.peak_net_bytes,
            state.peak_active_bytes,
            state.peak_flush_bytes,
            self.ram_buffer_size_mb
        )
    }

    /// Stop stalling for good; stalled threads are released.
    pub fn set_closed(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.update_stall_state(&mut state);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn wait_if_stalled(&self) {
        self.stall_control.wait_if_stalled();
    }

    /// Wait while stalled, for at most `timeout`; returns `false` if still
    /// stalled when giving up.
    pub fn wait_if_stalled_for(&self, timeout: Duration) -> bool {
        self.stall_control.wait_if_stalled_for(timeout)
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stall_control.is_stalled()
    }

    pub fn stall_control(&self) -> &StallControl {
        &self.stall_control
    }

    pub fn set_apply_all_deletes(&self) {
        self.apply_all_deletes.store(true, Ordering::Release);
    }

    pub fn get_and_reset_apply_all_deletes(&self) -> bool {
        self.apply_all_deletes.swap(false, Ordering::AcqRel)
    }

    pub fn get_apply_all_deletes(&self) -> bool {
        self.apply_all_deletes.load(Ordering::Acquire)
    }

    /// Bytes of deletes buffered globally plus those published but not yet
    /// applied.
    pub fn delete_bytes_used(&self) -> i64 {
        self.delete_queue().ram_bytes_used() as i64 + self.updates_stream.ram_bytes_used()
    }

    pub fn num_global_term_deletes(&self) -> usize {
        self.delete_queue().num_global_term_deletes() + self.updates_stream.num_terms()
    }

    pub fn ram_bytes_used(&self) -> i64 {
        self.delete_bytes_used() + self.net_bytes()
    }

    pub fn active_bytes(&self) -> i64 {
        self.state.lock().active_bytes
    }

    pub fn flush_bytes(&self) -> i64 {
        self.state.lock().flush_bytes
    }

    pub fn net_bytes(&self) -> i64 {
        self.state.lock().net_bytes()
    }

    pub fn peak_delta(&self) -> i64 {
        self.state.lock().peak_delta
    }

    pub fn num_pending(&self) -> usize {
        self.state.lock().num_pending
    }

    pub fn num_queued_flushes(&self) -> usize {
        self.state.lock().flush_queue.len()
    }

    pub fn num_blocked_flushes(&self) -> usize {
        self.state.lock().blocked_flushes.len()
    }

    pub fn num_flushing(&self) -> usize {
        self.state.lock().flushing_writers.len()
    }

    pub fn is_full_flush(&self) -> bool {
        self.state.lock().full_flush
    }

    pub fn add_buffered_docs(&self, count: i64) {
        self.num_docs_in_ram.fetch_add(count, Ordering::AcqRel);
    }

    pub fn subtract_flushed_num_docs(&self, count: u32) {
        let prev = self.num_docs_in_ram.fetch_sub(count as i64, Ordering::AcqRel);
        debug_assert!(prev >= count as i64, "more docs flushed than buffered");
    }

    /// Documents buffered in RAM, including those being flushed.
    pub fn num_docs_in_ram(&self) -> i64 {
        self.num_docs_in_ram.load(Ordering::Acquire)
    }
}

impl fmt::Debug for FlushControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FlushControl")
            .field("active_bytes", &state.active_bytes)
            .field("flush_bytes", &state.flush_bytes)
            .field("num_pending", &state.num_pending)
            .field("queued", &state.flush_queue.len())
            .field("blocked", &state.blocked_flushes.len())
            .field("flushing", &state.flushing_writers.len())
            .field("full_flush", &state.full_flush)
            .field("stalled", &self.stall_control.is_stalled())
            .field("closed", &state.closed)
            .finish()
    }
}

/// The controller as seen by the flush policy while its lock is held.
struct LockedControl<'a> {
    control: &'a FlushControl,
    state: &'a mut ControlState,
}

impl FlushControlView for LockedControl<'_> {
    fn active_bytes(&self) -> i64 {
        self.state.active_bytes
    }

    fn delete_bytes_used(&self) -> i64 {
        self.control.delete_bytes_used()
    }

    fn set_flush_pending(&mut self, buffer: &Arc<SegmentBuffer>) {
        if !buffer.is_flush_pending() {
            self.control.set_flush_pending_locked(self.state, buffer);
        }
    }

    fn set_apply_all_deletes(&mut self) {
        self.control.set_apply_all_deletes();
    }

    fn find_largest_non_pending_writer(&self) -> Option<Arc<SegmentBuffer>> {
        self.control.find_largest_non_pending_writer()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::sync::{OnceLock, Weak};
    use std::thread;

    use super::*;
    use crate::data::Document;
    use crate::storage::Storage;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use crate::writer::chain::{IndexingChain, IndexingChainFactory, SegmentWriteState};
    use crate::writer::limiter::DocumentLimiter;
    use crate::writer::notifications::FlushNotifications;
    use crate::writer::segment::{DocMap, SegmentInfo};

    struct Quiet;

    impl FlushNotifications for Quiet {
        fn delete_unused_files(&self, _files: &BTreeSet<String>) {}
        fn flush_failed(&self, _info: &SegmentInfo) {}
        fn after_segments_flushed(&self) -> Result<()> {
            Ok(())
        }
        fn on_tragic_event(&self, _error: &IrisError, _location: &str) {}
        fn on_deletes_applied(&self) {}
        fn on_ticket_backlog(&self) {}
    }

    struct Fixture {
        control: Arc<FlushControl>,
        limiter: Arc<DocumentLimiter>,
    }

    impl Fixture {
        fn new(config: IndexWriterConfig) -> Self {
            let queue = Arc::new(RwLock::new(Arc::new(DeleteQueue::new())));
            let limiter = Arc::new(DocumentLimiter::new(1_000_000));
            let storage: Arc<dyn Storage> =
                Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
            let chains = config.chain_factory_or_default();
            let counter = AtomicU64::new(0);
            let factory = {
                let queue = Arc::clone(&queue);
                let limiter = Arc::clone(&limiter);
                move || -> Result<Arc<SegmentBuffer>> {
                    let name = format!("s{}", counter.fetch_add(1, Ordering::SeqCst));
                    Ok(SegmentBuffer::new(
                        name.clone(),
                        Arc::clone(&*queue.read()),
                        Arc::clone(&limiter),
                        Arc::clone(&storage),
                        chains.create(&name),
                        false,
                    ))
                }
            };
            let pool = Arc::new(BufferPool::new(Box::new(factory)));
            let control = FlushControl::new(
                &config,
                pool,
                queue,
                Arc::new(BufferedUpdatesStream::new()),
            );
            Fixture {
                control: Arc::new(control),
                limiter,
            }
        }

        fn index(&self, guard: &mut BufferGuard, doc: &Document) -> Option<FlushingBuffer> {
            guard.process_documents(std::slice::from_ref(doc), None, &Quiet).unwrap();
            self.control.do_after_document(guard)
        }
    }

    /// Counts the aborts that find the control lock free.
    #[derive(Debug)]
    struct LockCheckingChain {
        inner: Box<dyn IndexingChain>,
        control: Arc<OnceLock<Weak<FlushControl>>>,
        unlocked_aborts: Arc<AtomicUsize>,
    }

    impl IndexingChain for LockCheckingChain {
        fn process_document(&mut self, doc_id: u32, doc: &Document) -> Result<()> {
            self.inner.process_document(doc_id, doc)
        }

        fn flush(&mut self, state: &mut SegmentWriteState<'_>) -> Result<Option<DocMap>> {
            self.inner.flush(state)
        }

        fn abort(&mut self) -> Result<()> {
            if let Some(control) = self.control.get().and_then(Weak::upgrade)
                && control.state.try_lock().is_some()
            {
                self.unlocked_aborts.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.abort()
        }

        fn ram_bytes_used(&self) -> usize {
            self.inner.ram_bytes_used()
        }
    }

    #[derive(Debug)]
    struct LockCheckingChainFactory {
        inner: Arc<dyn IndexingChainFactory>,
        control: Arc<OnceLock<Weak<FlushControl>>>,
        unlocked_aborts: Arc<AtomicUsize>,
    }

    impl IndexingChainFactory for LockCheckingChainFactory {
        fn create(&self, segment_name: &str) -> Box<dyn IndexingChain> {
            Box::new(LockCheckingChain {
                inner: self.inner.create(segment_name),
                control: Arc::clone(&self.control),
                unlocked_aborts: Arc::clone(&self.unlocked_aborts),
            })
        }
    }

    /// A document with `terms` unique terms.
    fn doc(seed: usize, terms: usize) -> Document {
        let text: Vec<String> = (0..terms).map(|i| format!("t{seed}n{i}")).collect();
        Document::new().add_text("body", text.join(" "))
    }

    fn ram_config(mb: f64) -> IndexWriterConfig {
        IndexWriterConfig::builder()
            .ram_buffer_size_mb(Some(mb))
            .build()
            .unwrap()
    }

    #[test]
    fn test_doc_count_flush_checks_out_own_buffer() {
        let config = IndexWriterConfig::builder()
            .ram_buffer_size_mb(None)
            .max_buffered_docs(Some(2))
            .build()
            .unwrap();
        let fx = Fixture::new(config);
        let mut guard = fx.control.obtain_and_lock().unwrap();
        assert!(fx.index(&mut guard, &doc(0, 3)).is_none());
        let flushing = fx.index(&mut guard, &doc(1, 3)).unwrap();
        assert!(!guard.is_live());
        drop(guard);

        assert_eq!(flushing.num_docs(), 2);
        assert_eq!(fx.control.num_flushing(), 1);
        assert_eq!(fx.control.num_pending(), 0);
        assert_eq!(fx.control.pool().size(), 0);
        assert!(fx.control.flush_bytes() > 0);

        fx.control.do_after_flush(flushing.buffer());
        assert_eq!(fx.control.num_flushing(), 0);
        assert_eq!(fx.control.flush_bytes(), 0);
        assert_eq!(fx.control.active_bytes(), 0);
    }

    #[test]
    fn test_largest_buffer_becomes_pending_and_is_retrievable() {
        let fx = Fixture::new(ram_config(1.0));
        let mut a = fx.control.obtain_and_lock().unwrap();
        let mut b = fx.control.obtain_and_lock().unwrap();
        let a_buffer = Arc::clone(a.buffer());

        // a grows to a bit more than half the buffer
        let mut seed = 0;
        while a.ram_bytes_used() < 600 * 1024 {
            assert!(fx.index(&mut a, &doc(seed, 200)).is_none());
            seed += 1;
        }
        fx.control.pool().mark_as_free_and_unlock(a);
        assert!(!a_buffer.is_flush_pending());

        // b stays smaller than a but pushes the total over the limit
        while !a_buffer.is_flush_pending() {
            assert!(fx.index(&mut b, &doc(seed, 20)).is_none());
            seed += 1;
        }
        assert!(!b.buffer().is_flush_pending());
        assert_eq!(fx.control.num_pending(), 1);
        assert!(fx.control.flush_bytes() > 0);

        let flushing = fx.control.next_pending_flush().unwrap();
        assert!(Arc::ptr_eq(flushing.buffer(), &a_buffer));
        assert_eq!(fx.control.num_pending(), 0);
        assert!(fx.control.next_pending_flush().is_none());
        assert!(fx.control.memory_bound_holds());
        drop(b);
    }

    #[test]
    fn test_stall_until_flush_completes() {
        let fx = Fixture::new(ram_config(1.0));
        let mut seed = 0;
        let mut flushing = Vec::new();
        while flushing.len() < 2 {
            let mut guard = fx.control.obtain_and_lock().unwrap();
            let checked_out = fx.index(&mut guard, &doc(seed, 1000));
            seed += 1;
            match checked_out {
                Some(buffer) => flushing.push(buffer),
                None => fx.control.pool().mark_as_free_and_unlock(guard),
            }
        }
        assert!(fx.control.net_bytes() > 2 * 1024 * 1024);
        assert!(fx.control.any_stalled_threads());
        assert!(!fx.control.wait_if_stalled_for(Duration::from_millis(10)));

        fx.control.do_after_flush(flushing[0].buffer());
        assert!(!fx.control.any_stalled_threads());
        assert!(fx.control.wait_if_stalled_for(Duration::from_millis(10)));
        fx.control.do_after_flush(flushing[1].buffer());
        assert_eq!(fx.control.net_bytes(), 0);
    }

    #[test]
    fn test_closed_control_never_stalls() {
        let fx = Fixture::new(ram_config(1.0));
        fx.control.set_closed();
        assert!(!fx.control.any_stalled_threads());
        assert!(matches!(
            fx.control.obtain_and_lock().unwrap_err(),
            IrisError::AlreadyClosed(_)
        ));
    }

    #[test]
    fn test_full_flush_collects_old_generation() {
        let fx = Fixture::new(ram_config(16.0));
        let old_queue = fx.control.delete_queue();
        let mut with_docs = fx.control.obtain_and_lock().unwrap();
        let empty = fx.control.obtain_and_lock().unwrap();
        fx.index(&mut with_docs, &doc(0, 5));
        fx.control.add_buffered_docs(1);
        fx.control.pool().mark_as_free_and_unlock(with_docs);
        fx.control.pool().mark_as_free_and_unlock(empty);
        let last = old_queue.last_sequence_number();

        let seq_no = fx.control.mark_for_full_flush();
        assert_eq!(seq_no, last + 2 + 1);
        assert!(fx.control.is_full_flush());
        assert!(!Arc::ptr_eq(&old_queue, &fx.control.delete_queue()));
        assert_eq!(fx.control.pool().size(), 0);
        assert_eq!(fx.control.num_queued_flushes(), 1);

        let flushing = fx.control.next_pending_flush().unwrap();
        assert_eq!(flushing.num_docs(), 1);
        fx.control.subtract_flushed_num_docs(1);
        fx.control.do_after_flush(flushing.buffer());
        fx.control.wait_for_flush();
        fx.control.finish_full_flush();
        assert!(!fx.control.is_full_flush());
        assert_eq!(fx.control.num_docs_in_ram(), 0);
    }

    #[test]
    fn test_pending_buffer_is_blocked_during_full_flush() {
        let config = IndexWriterConfig::builder()
            .max_buffered_docs(Some(1))
            .build()
            .unwrap();
        let fx = Fixture::new(config);
        fx.control.mark_for_full_flush();

        let mut guard = fx.control.obtain_and_lock().unwrap();
        assert!(fx.index(&mut guard, &doc(0, 2)).is_none());
        drop(guard);
        assert_eq!(fx.control.num_blocked_flushes(), 1);
        assert!(fx.control.next_pending_flush().is_none());

        fx.control.finish_full_flush();
        assert_eq!(fx.control.num_blocked_flushes(), 0);
        let flushing = fx.control.next_pending_flush().unwrap();
        fx.control.do_after_flush(flushing.buffer());
        assert_eq!(fx.control.num_flushing(), 0);
    }

    #[test]
    fn test_abort_full_flush_releases_everything() {
        let fx = Fixture::new(ram_config(16.0));
        let mut guard = fx.control.obtain_and_lock().unwrap();
        for seed in 0..3 {
            fx.index(&mut guard, &doc(seed, 5));
        }
        fx.control.add_buffered_docs(3);
        fx.control.pool().mark_as_free_and_unlock(guard);
        assert_eq!(fx.limiter.pending(), 3);

        fx.control.mark_for_full_flush();
        fx.control.abort_full_flushes();
        assert!(!fx.control.is_full_flush());
        assert_eq!(fx.control.num_queued_flushes(), 0);
        assert_eq!(fx.control.num_flushing(), 0);
        assert_eq!(fx.control.num_docs_in_ram(), 0);
        assert_eq!(fx.limiter.pending(), 0);
        assert_eq!(fx.control.net_bytes(), 0);
    }

    #[test]
    fn test_abort_pending_flushes_aborts_outside_the_control_lock() {
        let control_cell = Arc::new(OnceLock::new());
        let unlocked_aborts = Arc::new(AtomicUsize::new(0));
        let factory = LockCheckingChainFactory {
            inner: IndexWriterConfig::default().chain_factory_or_default(),
            control: Arc::clone(&control_cell),
            unlocked_aborts: Arc::clone(&unlocked_aborts),
        };
        let config = IndexWriterConfig::builder()
            .max_buffered_docs(Some(2))
            .chain_factory(Arc::new(factory))
            .build()
            .unwrap();
        let fx = Fixture::new(config);
        control_cell.set(Arc::downgrade(&fx.control)).unwrap();

        // two buffers of the old generation get queued by the full flush
        let mut first = fx.control.obtain_and_lock().unwrap();
        let mut second = fx.control.obtain_and_lock().unwrap();
        assert!(fx.index(&mut first, &doc(0, 3)).is_none());
        assert!(fx.index(&mut second, &doc(1, 3)).is_none());
        fx.control.pool().mark_as_free_and_unlock(first);
        fx.control.pool().mark_as_free_and_unlock(second);
        fx.control.add_buffered_docs(2);
        fx.control.mark_for_full_flush();
        assert_eq!(fx.control.num_queued_flushes(), 2);

        // a new generation buffer fills up and is blocked; the indexing
        // thread takes one queued flush with it
        let mut blocked = fx.control.obtain_and_lock().unwrap();
        assert!(fx.index(&mut blocked, &doc(2, 3)).is_none());
        let helped = fx.index(&mut blocked, &doc(3, 3)).unwrap();
        drop(blocked);
        fx.control.add_buffered_docs(2);
        fx.control.subtract_flushed_num_docs(helped.num_docs());
        fx.control.do_after_flush(helped.buffer());
        assert_eq!(fx.control.num_queued_flushes(), 1);
        assert_eq!(fx.control.num_blocked_flushes(), 1);

        fx.control.abort_pending_flushes();
        assert_eq!(unlocked_aborts.load(Ordering::SeqCst), 2);
        assert_eq!(fx.control.num_queued_flushes(), 0);
        assert_eq!(fx.control.num_blocked_flushes(), 0);
        assert_eq!(fx.control.num_flushing(), 0);
        assert_eq!(fx.control.num_docs_in_ram(), 0);
        assert_eq!(fx.control.flush_bytes(), 0);
        fx.control.abort_full_flushes();
        assert!(!fx.control.is_full_flush());
    }

    #[test]
    fn test_wait_for_full_flush_blocks_until_finished() {
        let fx = Fixture::new(ram_config(16.0));
        fx.control.mark_for_full_flush();

        let control = Arc::clone(&fx.control);
        let waiter = thread::spawn(move || {
            control.wait_for_full_flush();
            control.is_full_flush()
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        fx.control.finish_full_flush();
        assert!(!waiter.join().unwrap());
        // returns at once when no full flush runs
        fx.control.wait_for_full_flush();
    }

    #[test]
    fn test_do_on_abort_reverses_accounting() {
        let fx = Fixture::new(ram_config(16.0));
        let mut guard = fx.control.obtain_and_lock().unwrap();
        // large enough to pass the accounting granularity
        fx.index(&mut guard, &doc(0, 500));
        assert!(fx.control.active_bytes() > 0);

        guard.abort().unwrap();
        fx.control.do_on_abort(&mut guard);
        assert!(!guard.is_live());
        assert_eq!(fx.control.active_bytes(), 0);
        assert_eq!(fx.control.pool().size(), 0);
        assert_eq!(fx.limiter.pending(), 0);
    }

    #[test]
    fn test_checkout_largest_non_pending_writer() {
        let fx = Fixture::new(ram_config(16.0));
        let mut small = fx.control.obtain_and_lock().unwrap();
        let mut large = fx.control.obtain_and_lock().unwrap();
        fx.index(&mut small, &doc(0, 200));
        fx.index(&mut large, &doc(1, 800));
        let large_id = large.buffer().id();
        fx.control.pool().mark_as_free_and_unlock(small);
        fx.control.pool().mark_as_free_and_unlock(large);

        let flushing = fx.control.checkout_largest_non_pending_writer().unwrap();
        assert_eq!(flushing.buffer().id(), large_id);
        assert!(flushing.buffer().is_flush_pending());
        assert_eq!(fx.control.pool().size(), 1);
        fx.control.do_after_flush(flushing.buffer());
    }
}
