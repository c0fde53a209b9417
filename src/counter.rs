//! Batch completion counters.
//!
//! Every dispatched batch owns one counter container for its lifetime. The
//! container packs `(generation << 32) | remaining` into a single atomic
//! word: `remaining` is the number of fibers still to finish, and the
//! generation makes a handle stale once its counter has been released, so a
//! duplicated handle can never free a container twice or observe a recycled
//! batch as its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_utils::CachePadded;

/// Sentinel for "not waiting on any counter" in a fiber's wait field.
/// Distinct from every real wait reference, whose index half is 16-bit.
pub(crate) const WAIT_NONE: u64 = u64::MAX;

const REMAINING_MASK: u64 = 0xffff_ffff;

/// A fiber's reference to the counter it waits on: `(generation << 32) |
/// index`, same layout as the counter state itself.
pub(crate) fn wait_ref(index: u16, generation: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(index)
}

/// Opaque token for a dispatched batch.
///
/// Valid from dispatch until `wait_jobs` returns. The API is single-consumer:
/// exactly one caller should wait on a handle. A copied handle that loses the
/// race observes the batch as drained and does not release the counter again.
#[derive(Copy, Clone, Debug)]
#[must_use = "a dispatched batch must be waited on with wait_jobs()"]
pub struct JobHandle {
    index: u16,
    generation: u32,
    scheduled: u16,
}

impl JobHandle {
    pub(crate) fn new(index: u16, generation: u32, scheduled: u16) -> JobHandle {
        JobHandle {
            index,
            generation,
            scheduled,
        }
    }

    /// How many jobs of the batch actually got a fiber.
    ///
    /// Smaller than the submitted count when the fiber pool ran dry during
    /// dispatch; the skipped jobs never run.
    pub fn scheduled(&self) -> usize {
        usize::from(self.scheduled)
    }

    pub(crate) fn index(&self) -> u16 {
        self.index
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

struct CounterSlot {
    state: AtomicU64,
}

fn pack(generation: u32, remaining: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(remaining)
}

/// Fixed pool of counter containers, one per possible in-flight batch.
pub(crate) struct CounterPool {
    slots: Box<[CachePadded<CounterSlot>]>,
    free: Mutex<Vec<u16>>,
}

impl CounterPool {
    pub(crate) fn new(capacity: usize) -> CounterPool {
        // Handles index with 16 bits.
        let capacity = capacity.min(usize::from(u16::MAX));
        let slots = (0..capacity)
            .map(|_| {
                CachePadded::new(CounterSlot {
                    state: AtomicU64::new(0),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // LIFO free list, low indices handed out first.
        let free = (0..capacity as u16).rev().collect();
        CounterPool {
            slots,
            free: Mutex::new(free),
        }
    }

    /// Pops a free container. Returns its index and current generation.
    pub(crate) fn allocate(&self) -> Option<(u16, u32)> {
        let index = self.free.lock().unwrap().pop()?;
        let state = self.slots[usize::from(index)].state.load(Ordering::Acquire);
        debug_assert_eq!(state & REMAINING_MASK, 0, "allocated a live counter");
        Some((index, (state >> 32) as u32))
    }

    /// Stores the batch size. Called once, between allocation and enqueue.
    pub(crate) fn arm(&self, index: u16, count: u32) {
        self.slots[usize::from(index)]
            .state
            .fetch_add(u64::from(count), Ordering::Release);
    }

    /// One fiber of the batch finished.
    pub(crate) fn decrement(&self, index: u32) {
        let prev = self.slots[index as usize].state.fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(prev & REMAINING_MASK, 0, "batch counter underflow");
    }

    /// Whether the batch behind a wait reference is done. A recycled
    /// container (generation moved on) counts as drained: the batch the
    /// waiter cared about is over either way.
    pub(crate) fn wait_ref_drained(&self, wait_ref: u64) -> bool {
        let index = (wait_ref & REMAINING_MASK) as usize;
        let generation = (wait_ref >> 32) as u32;
        let state = self.slots[index].state.load(Ordering::Acquire);
        (state >> 32) as u32 != generation || state & REMAINING_MASK == 0
    }

    /// Remaining count as seen through a handle; a stale generation reads as
    /// drained.
    pub(crate) fn value(&self, handle: &JobHandle) -> u32 {
        let state = self.slots[usize::from(handle.index)].state.load(Ordering::Acquire);
        if (state >> 32) as u32 == handle.generation {
            (state & REMAINING_MASK) as u32
        } else {
            0
        }
    }

    /// Returns the container to the pool. Exactly one caller per generation
    /// wins; the result tells whether this call was the one that freed it.
    pub(crate) fn release(&self, handle: &JobHandle) -> bool {
        let slot = &self.slots[usize::from(handle.index)];
        let current = pack(handle.generation, 0);
        let next = pack(handle.generation.wrapping_add(1), 0);
        if slot
            .state
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.free.lock().unwrap().push(handle.index);
        true
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_drains_and_releases_once() {
        let pool = CounterPool::new(4);
        let (index, generation) = pool.allocate().unwrap();
        pool.arm(index, 3);
        let handle = JobHandle::new(index, generation, 3);
        assert_eq!(pool.value(&handle), 3);

        for _ in 0..3 {
            pool.decrement(u32::from(index));
        }
        assert_eq!(pool.value(&handle), 0);

        assert!(pool.release(&handle));
        assert!(!pool.release(&handle));
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn stale_handle_reads_drained() {
        let pool = CounterPool::new(1);
        let (index, generation) = pool.allocate().unwrap();
        pool.arm(index, 1);
        let stale = JobHandle::new(index, generation, 1);
        pool.decrement(u32::from(index));
        assert!(pool.release(&stale));

        // Same container, next generation.
        let (index2, generation2) = pool.allocate().unwrap();
        assert_eq!(index2, index);
        assert_ne!(generation2, generation);
        pool.arm(index2, 5);
        assert_eq!(pool.value(&stale), 0, "recycled counter must not be visible");
        assert!(!pool.wait_ref_drained(wait_ref(index2, generation2)));
        assert!(
            pool.wait_ref_drained(wait_ref(index, generation)),
            "a wait reference from the released generation reads as drained"
        );
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = CounterPool::new(2);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());

        let handle = JobHandle::new(a.0, a.1, 0);
        assert!(pool.release(&handle));
        assert!(pool.allocate().is_some());
    }
}
