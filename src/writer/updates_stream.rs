//! The stream of published update packets.
//!
//! Every frozen packet that is published gets the next delete generation.
//! Segments get a generation too, so a packet applies exactly to the
//! segments published before it. Packets stay in the stream until an
//! [`UpdatesResolver`] has applied them.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::Result;
use crate::writer::frozen_updates::FrozenBufferedUpdates;

/// Applies a published packet to the segments it covers.
pub trait UpdatesResolver: Send + Sync + Debug {
    /// Resolve `packet` against every segment whose generation is lower
    /// than the packet's, or only its private segment if it has one.
    fn resolve(&self, packet: &FrozenBufferedUpdates) -> Result<()>;
}

/// Drops packets without resolving them, for writers without readers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolver;

impl UpdatesResolver for NoopResolver {
    fn resolve(&self, packet: &FrozenBufferedUpdates) -> Result<()> {
        trace!("BD: discard packet gen={:?}", packet.del_gen());
        Ok(())
    }
}

/// Tracks the highest generation below which every packet has finished.
#[derive(Debug, Default)]
struct FinishedSegments {
    completed_del_gen: u64,
    finished_del_gens: HashSet<u64>,
}

impl FinishedSegments {
    fn finished_segment(&mut self, del_gen: u64) {
        self.finished_del_gens.insert(del_gen);
        while self.finished_del_gens.remove(&(self.completed_del_gen + 1)) {
            self.completed_del_gen += 1;
        }
    }

    fn still_running(&self, del_gen: u64) -> bool {
        del_gen > self.completed_del_gen && !self.finished_del_gens.contains(&del_gen)
    }
}

#[derive(Debug)]
struct StreamState {
    updates: Vec<Arc<FrozenBufferedUpdates>>,
    next_gen: u64,
    finished: FinishedSegments,
}

#[derive(Debug)]
pub struct BufferedUpdatesStream {
    state: Mutex<StreamState>,
    bytes_used: AtomicI64,
    num_terms: AtomicUsize,
}

impl Default for BufferedUpdatesStream {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedUpdatesStream {
    pub fn new() -> Self {
        BufferedUpdatesStream {
            state: Mutex::new(StreamState {
                updates: Vec::new(),
                next_gen: 1,
                finished: FinishedSegments::default(),
            }),
            bytes_used: AtomicI64::new(0),
            num_terms: AtomicUsize::new(0),
        }
    }

    /// Append a packet and assign its delete generation.
    pub fn push(&self, packet: Arc<FrozenBufferedUpdates>) -> u64 {
        debug_assert!(packet.any());
        let mut state = self.state.lock();
        let del_gen = state.next_gen;
        state.next_gen += 1;
        packet.set_del_gen(del_gen);
        self.num_terms
            .fetch_add(packet.num_term_deletes(), Ordering::AcqRel);
        self.bytes_used
            .fetch_add(packet.ram_bytes_used() as i64, Ordering::AcqRel);
        debug!(
            "BD: push new packet ({:?}), packet count={}, bytes used={:.3} MB",
            packet,
            state.updates.len() + 1,
            self.ram_bytes_used() as f64 / 1024.0 / 1024.0
        );
        state.updates.push(packet);
        del_gen
    }

    /// Take the next generation without a packet.
    pub fn next_gen(&self) -> u64 {
        let mut state = self.state.lock();
        let del_gen = state.next_gen;
        state.next_gen += 1;
        del_gen
    }

    /// Remove an applied packet from the stream.
    pub fn finished(&self, packet: &Arc<FrozenBufferedUpdates>) {
        let first_time = packet.mark_applied();
        debug_assert!(first_time, "packet finished twice: {packet:?}");
        let mut state = self.state.lock();
        state.updates.retain(|p| !Arc::ptr_eq(p, packet));
        self.num_terms
            .fetch_sub(packet.num_term_deletes(), Ordering::AcqRel);
        self.bytes_used
            .fetch_sub(packet.ram_bytes_used() as i64, Ordering::AcqRel);
        if let Some(del_gen) = packet.del_gen() {
            state.finished.finished_segment(del_gen);
        }
    }

    /// Mark a generation finished that had no packet to apply.
    pub fn finished_segment(&self, del_gen: u64) {
        self.state.lock().finished.finished_segment(del_gen);
    }

    /// Every generation up to and including this one is finished.
    pub fn completed_del_gen(&self) -> u64 {
        self.state.lock().finished.completed_del_gen
    }

    pub fn still_running(&self, del_gen: u64) -> bool {
        self.state.lock().finished.still_running(del_gen)
    }

    /// Resolve every pending packet in generation order.
    ///
    /// A failing packet stays in the stream and stops the pass.
    pub fn apply_all(&self, resolver: &dyn UpdatesResolver) -> Result<usize> {
        let pending: Vec<_> = self.state.lock().updates.clone();
        let mut applied = 0;
        for packet in pending {
            resolver.resolve(&packet)?;
            self.finished(&packet);
            applied += 1;
        }
        if applied > 0 {
            debug!("BD: applied {applied} packets");
        }
        Ok(applied)
    }

    pub fn any(&self) -> bool {
        self.bytes_used.load(Ordering::Acquire) != 0
    }

    pub fn pending_packets(&self) -> usize {
        self.state.lock().updates.len()
    }

    pub fn num_terms(&self) -> usize {
        self.num_terms.load(Ordering::Acquire)
    }

    pub fn ram_bytes_used(&self) -> i64 {
        self.bytes_used.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.updates.clear();
        state.next_gen = 1;
        state.finished = FinishedSegments::default();
        self.num_terms.store(0, Ordering::Release);
        self.bytes_used.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::buffered_updates::BufferedUpdates;
    use crate::writer::term::Term;

    fn packet(term: &str) -> Arc<FrozenBufferedUpdates> {
        let mut updates = BufferedUpdates::new("global");
        updates.add_term(Term::new("id", term), u32::MAX);
        Arc::new(FrozenBufferedUpdates::new(&updates, None))
    }

    #[test]
    fn test_push_assigns_generations() {
        let stream = BufferedUpdatesStream::new();
        let first = packet("a");
        let second = packet("b");
        assert_eq!(stream.push(Arc::clone(&first)), 1);
        assert_eq!(stream.next_gen(), 2);
        assert_eq!(stream.push(Arc::clone(&second)), 3);
        assert_eq!(second.del_gen(), Some(3));
        assert_eq!(stream.num_terms(), 2);
        assert!(stream.any());
    }

    #[test]
    fn test_completed_gen_waits_for_holes() {
        let stream = BufferedUpdatesStream::new();
        let first = packet("a");
        stream.push(Arc::clone(&first));
        let segment_gen = stream.next_gen();
        stream.finished_segment(segment_gen);
        assert_eq!(stream.completed_del_gen(), 0);
        assert!(stream.still_running(1));
        assert!(!stream.still_running(2));

        stream.finished(&first);
        assert_eq!(stream.completed_del_gen(), 2);
        assert!(!stream.any());
        assert_eq!(stream.num_terms(), 0);
        assert!(first.is_applied());
    }

    #[test]
    fn test_apply_all_drains_stream() {
        let stream = BufferedUpdatesStream::new();
        stream.push(packet("a"));
        stream.push(packet("b"));
        assert_eq!(stream.apply_all(&NoopResolver).unwrap(), 2);
        assert_eq!(stream.pending_packets(), 0);
        assert_eq!(stream.ram_bytes_used(), 0);
        assert_eq!(stream.completed_del_gen(), 2);
    }
}
