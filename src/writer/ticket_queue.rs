//! Ordered publication of flushed segments and frozen deletes.
//!
//! Every flush takes a ticket before it freezes the global deletes, so the
//! order of tickets is the order in which deletes were frozen. Flushes then
//! run concurrently and fill in their tickets out of order, but tickets are
//! only ever published from the head: a segment and the deletes known when
//! its flush started become visible together and in flush order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;
use parking_lot::Mutex;

use crate::error::{IrisError, Result};
use crate::writer::delete_queue::DeleteQueue;
use crate::writer::frozen_updates::FrozenBufferedUpdates;
use crate::writer::per_thread::FlushingBuffer;
use crate::writer::segment::FlushedSegment;

/// Identifies a ticket while its segment is being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketId(u64);

/// Payload of a ticket, produced under the ticket queue lock.
#[derive(Debug)]
pub struct FlushTicket {
    frozen_updates: Option<Arc<FrozenBufferedUpdates>>,
    has_segment: bool,
}

impl FlushTicket {
    /// A ticket waiting for a segment, carrying the deletes frozen for it.
    pub fn for_segment(frozen_updates: Option<Arc<FrozenBufferedUpdates>>) -> Self {
        FlushTicket {
            frozen_updates,
            has_segment: true,
        }
    }

    /// A ticket carrying only frozen global deletes.
    pub fn for_deletes(frozen_updates: Arc<FrozenBufferedUpdates>) -> Self {
        FlushTicket {
            frozen_updates: Some(frozen_updates),
            has_segment: false,
        }
    }
}

#[derive(Debug)]
struct TicketSlot {
    id: TicketId,
    ticket: FlushTicket,
    segment: Option<FlushedSegment>,
    failed: bool,
}

impl TicketSlot {
    fn can_publish(&self) -> bool {
        !self.ticket.has_segment || self.segment.is_some() || self.failed
    }
}

/// A ticket handed to the publishing consumer.
#[derive(Debug)]
pub struct PublishedTicket {
    pub id: TicketId,
    /// Global deletes frozen when the ticket was taken.
    pub frozen_updates: Option<Arc<FrozenBufferedUpdates>>,
    /// The flushed segment; `None` for delete-only and failed tickets.
    pub segment: Option<FlushedSegment>,
    pub failed: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    tickets: VecDeque<TicketSlot>,
    next_id: u64,
}

#[derive(Default)]
pub struct FlushTicketQueue {
    state: Mutex<QueueState>,
    // counted before the ticket exists, so the count covers tickets whose
    // payload is still being produced
    ticket_count: AtomicUsize,
    purge_lock: Mutex<()>,
}

impl FlushTicketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next ticket, producing its payload under the queue lock.
    ///
    /// Returns `None` if `factory` produced no ticket.
    pub fn add_ticket<F>(&self, factory: F) -> Result<Option<TicketId>>
    where
        F: FnOnce() -> Result<Option<FlushTicket>>,
    {
        let mut state = self.state.lock();
        self.inc_tickets();
        let ticket = match factory() {
            Ok(Some(ticket)) => ticket,
            Ok(None) => {
                self.dec_tickets();
                return Ok(None);
            }
            Err(e) => {
                self.dec_tickets();
                return Err(e);
            }
        };
        let id = TicketId(state.next_id);
        state.next_id += 1;
        trace!(
            "TQ: add ticket {:?} segment={} frozen={:?}",
            id, ticket.has_segment, ticket.frozen_updates
        );
        state.tickets.push_back(TicketSlot {
            id,
            ticket,
            segment: None,
            failed: false,
        });
        Ok(Some(id))
    }

    /// Take a ticket for a buffer about to flush; freezes the global
    /// deletes in ticket order.
    pub fn add_flush_ticket(&self, buffer: &mut FlushingBuffer) -> Result<TicketId> {
        self.add_ticket(|| Ok(Some(FlushTicket::for_segment(buffer.prepare_flush()?))))?
            .ok_or_else(|| IrisError::internal("segment ticket was not created"))
    }

    /// Take a ticket for the global deletes of `queue`, if there are any.
    pub fn add_deletes(&self, queue: &DeleteQueue) -> Result<bool> {
        let id = self.add_ticket(|| {
            Ok(queue
                .maybe_freeze_global_buffer()
                .map(FlushTicket::for_deletes))
        })?;
        Ok(id.is_some())
    }

    /// Attach the flushed segment to its ticket.
    pub fn add_segment(&self, id: TicketId, segment: FlushedSegment) {
        let mut state = self.state.lock();
        let slot = Self::slot_mut(&mut state, id);
        assert!(slot.ticket.has_segment, "ticket {id:?} takes no segment");
        slot.segment = Some(segment);
    }

    /// Complete a ticket without a segment; its frozen deletes still publish.
    pub fn mark_ticket_failed(&self, id: TicketId) {
        let mut state = self.state.lock();
        let slot = Self::slot_mut(&mut state, id);
        assert!(slot.ticket.has_segment, "ticket {id:?} takes no segment");
        slot.failed = true;
    }

    fn slot_mut(state: &mut QueueState, id: TicketId) -> &mut TicketSlot {
        match state.tickets.iter_mut().find(|slot| slot.id == id) {
            Some(slot) => slot,
            None => panic!("ticket {id:?} is not queued"),
        }
    }

    /// Publish from the head for as long as tickets are complete, unless
    /// another thread is purging already.
    pub fn try_purge<C>(&self, consumer: C) -> Result<usize>
    where
        C: FnMut(PublishedTicket) -> Result<()>,
    {
        match self.purge_lock.try_lock() {
            Some(_purging) => self.inner_purge(consumer),
            None => Ok(0),
        }
    }

    /// Publish from the head for as long as tickets are complete.
    pub fn force_purge<C>(&self, consumer: C) -> Result<usize>
    where
        C: FnMut(PublishedTicket) -> Result<()>,
    {
        let _purging = self.purge_lock.lock();
        self.inner_purge(consumer)
    }

    fn inner_purge<C>(&self, mut consumer: C) -> Result<usize>
    where
        C: FnMut(PublishedTicket) -> Result<()>,
    {
        let mut published = 0;
        loop {
            // the consumer runs without the queue lock so flushes can keep
            // adding tickets while the head is published
            let head = {
                let mut state = self.state.lock();
                match state.tickets.front_mut() {
                    Some(slot) if slot.can_publish() => PublishedTicket {
                        id: slot.id,
                        frozen_updates: slot.ticket.frozen_updates.clone(),
                        segment: slot.segment.take(),
                        failed: slot.failed,
                    },
                    _ => break,
                }
            };
            let id = head.id;
            trace!("TQ: publish ticket {id:?} failed={}", head.failed);
            let result = consumer(head);
            {
                let mut state = self.state.lock();
                let polled = state.tickets.pop_front();
                // only the purge lock holder pops
                debug_assert_eq!(polled.map(|slot| slot.id), Some(id));
                self.dec_tickets();
            }
            result?;
            published += 1;
        }
        Ok(published)
    }

    pub fn ticket_count(&self) -> usize {
        self.ticket_count.load(Ordering::Acquire)
    }

    pub fn has_tickets(&self) -> bool {
        self.ticket_count() != 0
    }

    fn inc_tickets(&self) {
        self.ticket_count.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_tickets(&self) {
        let prev = self.ticket_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "ticket count underflow");
    }
}

impl fmt::Debug for FlushTicketQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushTicketQueue")
            .field("ticket_count", &self.ticket_count())
            .field("queued", &self.state.lock().tickets.len())
            .finish()
    }
}
