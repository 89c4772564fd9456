//! Pool of segment buffers.
//!
//! Keeps every registered buffer plus a free list of buffers no thread
//! currently holds. Leasing prefers the largest free buffer so that RAM is
//! concentrated in few buffers and flushes produce larger segments. When no
//! free buffer can be locked a new one is created, unless new writers are
//! locked out by a full flush or an abort-all.

use std::fmt;
use std::sync::Arc;

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::error::{IrisError, Result};
use crate::writer::per_thread::{BufferGuard, SegmentBuffer};

/// Creates a buffer bound to the current delete queue generation.
pub type BufferFactory = Box<dyn Fn() -> Result<Arc<SegmentBuffer>> + Send + Sync>;

#[derive(Default)]
struct PoolState {
    registered: Vec<Arc<SegmentBuffer>>,
    free_list: Vec<Arc<SegmentBuffer>>,
    taken_permits: usize,
    closed: bool,
}

impl PoolState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(IrisError::already_closed("buffer pool is already closed"));
        }
        Ok(())
    }

    /// Lock the free buffer with the most committed bytes, skipping buffers
    /// other threads hold right now.
    fn poll_free(&mut self) -> Option<BufferGuard> {
        self.free_list
            .sort_by_key(|b| std::cmp::Reverse(b.last_committed_bytes()));
        let mut index = 0;
        while index < self.free_list.len() {
            if let Some(guard) = self.free_list[index].try_lock() {
                self.free_list.remove(index);
                return Some(guard);
            }
            index += 1;
        }
        None
    }
}

pub struct BufferPool {
    state: Mutex<PoolState>,
    permits_released: Condvar,
    factory: BufferFactory,
}

impl BufferPool {
    pub fn new(factory: BufferFactory) -> Self {
        BufferPool {
            state: Mutex::new(PoolState::default()),
            permits_released: Condvar::new(),
            factory,
        }
    }

    /// Lease a locked buffer, creating one if no free buffer can be locked.
    pub fn get_and_lock(&self) -> Result<BufferGuard> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if let Some(guard) = state.poll_free() {
            return Ok(guard);
        }
        while state.taken_permits > 0 {
            self.permits_released.wait(&mut state);
        }
        state.ensure_open()?;
        let buffer = (self.factory)()?;
        let guard = buffer.lock();
        trace!("DW: new buffer {} registered", buffer.segment_name());
        state.registered.push(buffer);
        Ok(guard)
    }

    /// Return a leased buffer to the free list and unlock it.
    pub fn mark_as_free_and_unlock(&self, guard: BufferGuard) {
        {
            let mut state = self.state.lock();
            let buffer = guard.buffer();
            debug_assert!(
                state.registered.iter().any(|b| Arc::ptr_eq(b, buffer)),
                "buffer is not registered"
            );
            state.free_list.push(Arc::clone(buffer));
        }
        drop(guard);
    }

    /// Lock every registered buffer matching `predicate`.
    ///
    /// Buffers are locked outside of the pool lock and only kept if they
    /// are still registered once locked.
    pub fn filter_and_lock<P>(&self, predicate: P) -> Vec<BufferGuard>
    where
        P: Fn(&SegmentBuffer) -> bool,
    {
        let snapshot = self.buffers();
        snapshot
            .iter()
            .filter(|buffer| predicate(buffer))
            .filter_map(|buffer| {
                let guard = buffer.lock();
                guard.is_live().then_some(guard)
            })
            .collect()
    }

    /// Unregister a buffer; returns `false` if it was not registered.
    pub fn checkout(&self, buffer: &Arc<SegmentBuffer>) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.registered.iter().position(|b| Arc::ptr_eq(b, buffer)) else {
            return false;
        };
        state.registered.swap_remove(index);
        state.free_list.retain(|b| !Arc::ptr_eq(b, buffer));
        true
    }

    pub fn is_registered(&self, buffer: &Arc<SegmentBuffer>) -> bool {
        self.state
            .lock()
            .registered
            .iter()
            .any(|b| Arc::ptr_eq(b, buffer))
    }

    /// Number of registered buffers.
    pub fn size(&self) -> usize {
        self.state.lock().registered.len()
    }

    /// Snapshot of the registered buffers.
    pub fn buffers(&self) -> Vec<Arc<SegmentBuffer>> {
        self.state.lock().registered.clone()
    }

    /// Block creation of new buffers until the matching unlock.
    pub fn lock_new_writers(&self) {
        self.state.lock().taken_permits += 1;
    }

    pub fn unlock_new_writers(&self) {
        let mut state = self.state.lock();
        assert!(state.taken_permits > 0, "new writers are not locked");
        state.taken_permits -= 1;
        if state.taken_permits == 0 {
            self.permits_released.notify_all();
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.permits_released.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferPool")
            .field("registered", &state.registered.len())
            .field("free", &state.free_list.len())
            .field("taken_permits", &state.taken_permits)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use crate::storage::Storage;
    use crate::writer::chain::IndexingChainFactory;
    use crate::writer::delete_queue::DeleteQueue;
    use crate::writer::inverted_chain::InvertedChainFactory;
    use crate::writer::limiter::DocumentLimiter;

    fn pool() -> BufferPool {
        let queue = Arc::new(DeleteQueue::new());
        let limiter = Arc::new(DocumentLimiter::new(100));
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
        let counter = AtomicU64::new(0);
        BufferPool::new(Box::new(move || {
            let name = format!("s{}", counter.fetch_add(1, Ordering::SeqCst));
            Ok(SegmentBuffer::new(
                name.clone(),
                Arc::clone(&queue),
                Arc::clone(&limiter),
                Arc::clone(&storage),
                InvertedChainFactory::default().create(&name),
                false,
            ))
        }))
    }

    #[test]
    fn test_lease_reuses_free_buffers() {
        let pool = pool();
        let first = pool.get_and_lock().unwrap();
        let second = pool.get_and_lock().unwrap();
        assert_eq!(pool.size(), 2);
        let first_id = first.buffer().id();

        pool.mark_as_free_and_unlock(first);
        let again = pool.get_and_lock().unwrap();
        assert_eq!(again.buffer().id(), first_id);
        assert_eq!(pool.size(), 2);
        drop(second);
        drop(again);
    }

    #[test]
    fn test_checkout_unregisters() {
        let pool = pool();
        let guard = pool.get_and_lock().unwrap();
        let buffer = Arc::clone(guard.buffer());
        pool.mark_as_free_and_unlock(guard);

        assert!(pool.is_registered(&buffer));
        assert!(pool.checkout(&buffer));
        assert!(!pool.checkout(&buffer));
        assert_eq!(pool.size(), 0);

        // the checked out buffer must not be leased again
        let fresh = pool.get_and_lock().unwrap();
        assert_ne!(fresh.buffer().id(), buffer.id());
    }

    #[test]
    fn test_filter_and_lock_skips_unregistered() {
        let pool = pool();
        let a = pool.get_and_lock().unwrap();
        let b = pool.get_and_lock().unwrap();
        let b_buffer = Arc::clone(b.buffer());
        pool.mark_as_free_and_unlock(a);
        let mut b = b;
        assert!(pool.checkout(&b_buffer));
        b.retire();
        drop(b);

        let locked = pool.filter_and_lock(|_| true);
        assert_eq!(locked.len(), 1);
    }

    #[test]
    fn test_locked_new_writers_block_creation() {
        let pool = Arc::new(pool());
        pool.lock_new_writers();

        let handle = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.get_and_lock().map(|g| g.buffer().id()))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.size(), 0);

        pool.unlock_new_writers();
        handle.join().unwrap().unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_closed_pool_rejects_leases() {
        let pool = pool();
        pool.close();
        assert!(matches!(
            pool.get_and_lock().unwrap_err(),
            IrisError::AlreadyClosed(_)
        ));
    }
}
