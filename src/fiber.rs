//! Fiber records and the fixed pools that own them.
//!
//! A fiber slot is the `Send` half of a fiber: the scheduling fields the
//! ready-queue scan reads, plus the pending job payload. The coroutine (and
//! with it the actual use of the slot's stack region) is bound by whichever
//! worker first resumes the fiber, and lives in that worker's loop frame
//! until the job completes; only the slot index travels through the queues.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::counter::WAIT_NONE;
use crate::job::{JobDesc, JobFn, JobPriority};
use crate::stack::{StackHandle, StackRegion};

/// Which of the two pools a fiber belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PoolKind {
    Small,
    Big,
}

/// Identifies one fiber slot; this is what the ready queues hold.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FiberKey {
    pub pool: PoolKind,
    pub index: u16,
}

/// The work a fresh fiber will run, consumed at first resume.
pub(crate) struct JobPayload {
    pub index: u16,
    pub callback: JobFn,
}

/// One fiber record.
///
/// `owner` is 0 while the fiber is freely schedulable; a parked waiter
/// carries the id of the thread whose auxiliary-stack frames hold its
/// continuation. `wait_counter` is [`WAIT_NONE`] unless the fiber is blocked
/// on a child batch. Both are read by the scheduler scan under the queue
/// lock; `counter` names the batch counter the completion trampoline
/// decrements.
pub(crate) struct FiberSlot {
    pub owner: AtomicU32,
    pub wait_counter: AtomicU64,
    pub counter: AtomicU32,
    priority: AtomicU8,
    job: Mutex<Option<JobPayload>>,
}

impl FiberSlot {
    fn new() -> FiberSlot {
        FiberSlot {
            owner: AtomicU32::new(0),
            wait_counter: AtomicU64::new(WAIT_NONE),
            counter: AtomicU32::new(0),
            priority: AtomicU8::new(JobPriority::Normal as u8),
            job: Mutex::new(None),
        }
    }

    pub(crate) fn priority(&self) -> JobPriority {
        JobPriority::from_index(self.priority.load(Ordering::Acquire))
    }
}

/// Fixed pool of fiber records with one pre-allocated stack per slot.
pub(crate) struct FiberPool {
    slots: Box<[FiberSlot]>,
    stacks: Box<[StackRegion]>,
    free: Mutex<Vec<u16>>,
}

impl FiberPool {
    pub(crate) fn new(max: u16, stack_size: usize) -> io::Result<FiberPool> {
        let slots = (0..max).map(|_| FiberSlot::new()).collect::<Vec<_>>();
        let mut stacks = Vec::with_capacity(usize::from(max));
        for _ in 0..max {
            stacks.push(StackRegion::new(stack_size)?);
        }
        // LIFO free list: slot i sits at position max - i - 1.
        let free = (0..max).rev().collect();
        Ok(FiberPool {
            slots: slots.into_boxed_slice(),
            stacks: stacks.into_boxed_slice(),
            free: Mutex::new(free),
        })
    }

    /// Takes a free slot and initialises the record for one job of a batch.
    ///
    /// `None` when the pool is exhausted; the caller skips the job and the
    /// batch counter ends up reflecting only successful allocations.
    pub(crate) fn allocate(&self, desc: JobDesc, index: u16, counter: u16) -> Option<u16> {
        let slot_index = self.free.lock().unwrap().pop()?;
        let slot = &self.slots[usize::from(slot_index)];
        debug_assert!(slot.job.lock().unwrap().is_none(), "allocated a live fiber");
        slot.owner.store(0, Ordering::Release);
        slot.wait_counter.store(WAIT_NONE, Ordering::Release);
        slot.counter.store(u32::from(counter), Ordering::Release);
        slot.priority.store(desc.priority as u8, Ordering::Release);
        *slot.job.lock().unwrap() = Some(JobPayload {
            index,
            callback: desc.callback,
        });
        Some(slot_index)
    }

    /// Returns a slot to the pool.
    ///
    /// Must only be called once the fiber's coroutine has fully returned:
    /// the slot's stack region becomes reusable by the next allocation the
    /// moment the index is back on the free list.
    pub(crate) fn release(&self, index: u16) {
        self.free.lock().unwrap().push(index);
    }

    /// Consumes the pending payload at first resume.
    pub(crate) fn take_job(&self, index: u16) -> JobPayload {
        self.slots[usize::from(index)]
            .job
            .lock()
            .unwrap()
            .take()
            .expect("fiber resumed without a pending job")
    }

    pub(crate) fn slot(&self, index: u16) -> &FiberSlot {
        &self.slots[usize::from(index)]
    }

    pub(crate) fn stack_handle(&self, index: u16) -> StackHandle {
        self.stacks[usize::from(index)].handle()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}
