//! The dispatcher core: ready queues, worker threads, dispatch and wait.
//!
//! Scheduling is cooperative. A job runs on one worker from start to finish
//! unless it calls [`wait_jobs`](crate::wait_jobs); that re-queues the caller
//! pinned to its thread and re-enters the scheduling loop on an auxiliary
//! stack, so the worker keeps draining unrelated jobs while the caller's
//! child batch completes. Unwinding out of that nested loop *is* the context
//! switch that resumes the caller.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use corosensei::{CoroutineResult, ScopedCoroutine, Yielder};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace, warn};

use crate::counter::{wait_ref, CounterPool, JobHandle, WAIT_NONE};
use crate::fiber::{FiberKey, FiberPool, FiberSlot, PoolKind};
use crate::job::{JobDesc, NUM_PRIORITIES};
use crate::stack::StackRegion;
use crate::{BuildError, Config, DispatchError};

/// ////////////////////////////////////////////////////////////////////////
/// Per-thread state

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// State the dispatcher keeps for every thread that touches it: workers get
/// theirs at startup, other threads (the main thread included) lazily on
/// first dispatch or wait.
struct ThreadData {
    /// Process-unique, non-zero; 0 in a fiber's owner field means unpinned.
    id: u32,
    is_worker: Cell<bool>,
    /// The fiber currently executing on this thread, if any. Only valid
    /// while a user callback is on the stack.
    running: Cell<Option<FiberKey>>,
    /// LIFO cache of auxiliary stacks for nested scheduling loops.
    cached_stacks: RefCell<Vec<StackRegion>>,
    /// Auxiliary stacks currently in use; bounds the wait nesting depth.
    live_stacks: Cell<usize>,
}

thread_local! {
    static THREAD_DATA: ThreadData = ThreadData {
        id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
        is_worker: Cell::new(false),
        running: Cell::new(None),
        cached_stacks: RefCell::new(Vec::new()),
        live_stacks: Cell::new(0),
    };
}

impl ThreadData {
    fn current_id() -> u32 {
        THREAD_DATA.with(|td| td.id)
    }

    fn install_worker() {
        THREAD_DATA.with(|td| td.is_worker.set(true));
    }

    fn is_worker() -> bool {
        THREAD_DATA.with(|td| td.is_worker.get())
    }

    fn running() -> Option<FiberKey> {
        THREAD_DATA.with(|td| td.running.get())
    }

    fn set_running(key: Option<FiberKey>) {
        THREAD_DATA.with(|td| td.running.set(key));
    }

    fn take_running() -> Option<FiberKey> {
        THREAD_DATA.with(|td| td.running.replace(None))
    }

    /// Reserves one auxiliary stack, reusing a cached region when its size
    /// still matches. `None` once `max_depth` stacks are live on this thread.
    fn reserve_wait_stack(size: usize, max_depth: usize) -> Option<StackRegion> {
        THREAD_DATA.with(|td| {
            if td.live_stacks.get() >= max_depth {
                return None;
            }
            let cached = {
                let mut cache = td.cached_stacks.borrow_mut();
                match cache.pop() {
                    Some(region) if region.usable() >= size => Some(region),
                    Some(_) => None, // stale size from an earlier configuration
                    None => None,
                }
            };
            let region = match cached {
                Some(region) => region,
                None => match StackRegion::new(size) {
                    Ok(region) => region,
                    Err(err) => {
                        warn!("auxiliary stack allocation failed: {}", err);
                        return None;
                    }
                },
            };
            td.live_stacks.set(td.live_stacks.get() + 1);
            Some(region)
        })
    }

    fn release_wait_stack(region: StackRegion) {
        THREAD_DATA.with(|td| {
            td.live_stacks.set(td.live_stacks.get() - 1);
            td.cached_stacks.borrow_mut().push(region);
        });
    }
}

/// ////////////////////////////////////////////////////////////////////////
/// Registry

/// Why a scheduling-loop invocation returned to its caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PusherExit {
    /// The stop flag was observed (worker shutdown).
    Stopped,
    /// A single non-worker pass finished.
    Pass,
    /// The loop consumed its own parked caller; unwinding resumes it.
    Unparked,
}

enum Selected {
    Fresh(FiberKey),
    Parked,
}

/// Snapshot of pool occupancy, mostly for tests and shutdown diagnostics.
#[derive(Copy, Clone, Debug)]
pub struct DispatcherStats {
    pub small_free: usize,
    pub small_capacity: usize,
    pub big_free: usize,
    pub big_capacity: usize,
    pub counters_free: usize,
    pub counters_capacity: usize,
}

pub(crate) struct Registry {
    config: Config,
    small: FiberPool,
    big: FiberPool,
    /// One FIFO per priority; a single lock guards all three. Entries stay
    /// queued while blocked on a child batch, so the scan skips rather than
    /// pops.
    queues: Mutex<[VecDeque<FiberKey>; NUM_PRIORITIES]>,
    counters: CounterPool,
    /// Counting semaphore for queued work: one token per enqueued fiber.
    work_tx: Sender<()>,
    work_rx: Receiver<()>,
    stop: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

static GLOBAL_REGISTRY: Mutex<Option<Arc<Registry>>> = Mutex::new(None);

pub(crate) fn init_global(config: Config) -> Result<(), BuildError> {
    let mut global = GLOBAL_REGISTRY.lock().unwrap();
    if global.is_some() {
        return Err(BuildError::AlreadyInitialized);
    }
    *global = Some(Registry::new(config)?);
    Ok(())
}

pub(crate) fn global() -> Arc<Registry> {
    GLOBAL_REGISTRY
        .lock()
        .unwrap()
        .as_ref()
        .cloned()
        .expect("the global job dispatcher has not been initialized")
}

pub(crate) fn shutdown_global() {
    let registry = GLOBAL_REGISTRY.lock().unwrap().take();
    if let Some(registry) = registry {
        registry.terminate_and_join();
    }
}

impl Registry {
    pub(crate) fn new(config: Config) -> Result<Arc<Registry>, BuildError> {
        let small = FiberPool::new(config.small_fibers, config.small_stack_size)
            .map_err(BuildError::StackAllocation)?;
        let big = FiberPool::new(config.big_fibers, config.big_stack_size)
            .map_err(BuildError::StackAllocation)?;
        let counters =
            CounterPool::new(usize::from(config.small_fibers) + usize::from(config.big_fibers));
        let (work_tx, work_rx) = crossbeam_channel::unbounded();

        let registry = Arc::new(Registry {
            config,
            small,
            big,
            queues: Mutex::new(Default::default()),
            counters,
            work_tx,
            work_rx,
            stop: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        for index in 0..registry.config.num_threads {
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", registry.config.thread_name, index));
            if let Some(stack_size) = registry.config.worker_stack_size {
                builder = builder.stack_size(stack_size);
            }
            let handle = {
                let registry = Arc::clone(&registry);
                builder.spawn(move || main_loop(registry, index))
            };
            match handle {
                Ok(handle) => registry.threads.lock().unwrap().push(handle),
                Err(err) => {
                    // Tear down whatever came up before reporting failure.
                    registry.terminate_and_join();
                    return Err(BuildError::ThreadSpawn(err));
                }
            }
        }

        debug!(
            "dispatcher up: {} workers, {}+{} fibers, {} counters",
            registry.config.num_threads,
            registry.small.capacity(),
            registry.big.capacity(),
            registry.counters.capacity(),
        );
        Ok(registry)
    }

    fn pool(&self, kind: PoolKind) -> &FiberPool {
        match kind {
            PoolKind::Small => &self.small,
            PoolKind::Big => &self.big,
        }
    }

    fn slot(&self, key: FiberKey) -> &FiberSlot {
        self.pool(key.pool).slot(key.index)
    }

    fn post(&self, count: usize) {
        for _ in 0..count {
            let _ = self.work_tx.send(());
        }
    }

    pub(crate) fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            small_free: self.small.free_count(),
            small_capacity: self.small.capacity(),
            big_free: self.big.free_count(),
            big_capacity: self.big.capacity(),
            counters_free: self.counters.free_count(),
            counters_capacity: self.counters.capacity(),
        }
    }

    /// ////////////////////////////////////////////////////////////////////////
    /// Scheduling loop

    /// One scheduling-loop invocation.
    ///
    /// Worker threads block on the token channel and loop until stopped;
    /// other threads run a single non-blocking pass (their progress is driven
    /// by the polling loop in `wait_jobs`). `parker` names the fiber that
    /// parked itself into this invocation, if any: it is the only pinned
    /// fiber this invocation may consume, because its continuation lives in
    /// the frames right beneath us.
    fn pusher(&self, parker: Option<FiberKey>) -> PusherExit {
        let worker = ThreadData::is_worker();
        let me = ThreadData::current_id();

        loop {
            if self.stop.load(Ordering::Acquire) {
                return PusherExit::Stopped;
            }
            if worker {
                // Wait for a job to be queued; one token per enqueued fiber.
                if self.work_rx.recv().is_err() {
                    return PusherExit::Stopped;
                }
                if self.stop.load(Ordering::Acquire) {
                    return PusherExit::Stopped;
                }
            }

            let (selected, saw_any) = self.select(me, parker);
            let idle = selected.is_none();
            match selected {
                Some(Selected::Parked) => {
                    // Unwind into the wait frame that spawned this loop; that
                    // resumes the parked fiber on its original stack.
                    return PusherExit::Unparked;
                }
                Some(Selected::Fresh(key)) => self.run_fiber(key),
                None => {
                    if worker && saw_any {
                        // Consumed a token without claiming work; put it back
                        // for whichever thread can actually run the entry.
                        self.post(1);
                        thread::yield_now();
                    }
                }
            }

            if !worker {
                if idle {
                    thread::yield_now();
                }
                return PusherExit::Pass;
            }
        }
    }

    /// Scans the ready queues, High to Low, head to tail, and removes the
    /// first eligible fiber: its wait counter must be drained (or absent)
    /// and it must be unpinned, or be this invocation's own parker.
    fn select(&self, me: u32, parker: Option<FiberKey>) -> (Option<Selected>, bool) {
        let mut queues = self.queues.lock().unwrap();
        let mut saw_any = false;
        for queue in queues.iter_mut() {
            for pos in 0..queue.len() {
                saw_any = true;
                let key = queue[pos];
                let slot = self.slot(key);
                let wait_on = slot.wait_counter.load(Ordering::Acquire);
                if wait_on != WAIT_NONE && !self.counters.wait_ref_drained(wait_on) {
                    // Still blocked on its child batch.
                    continue;
                }
                let owner = slot.owner.load(Ordering::Acquire);
                if owner == 0 {
                    queue.remove(pos);
                    return (Some(Selected::Fresh(key)), saw_any);
                }
                if owner == me && parker == Some(key) {
                    slot.owner.store(0, Ordering::Release);
                    queue.remove(pos);
                    return (Some(Selected::Parked), saw_any);
                }
            }
        }
        (None, saw_any)
    }

    /// Binds a coroutine to a fresh fiber's stack and runs it.
    ///
    /// `resume` returns only when the job has completed -- if the job parks
    /// itself in a wait, this frame stays frozen (holding the coroutine)
    /// until the whole park/unpark dance is over and the callback finishes.
    fn run_fiber(&self, key: FiberKey) {
        let pool = self.pool(key.pool);
        let payload = pool.take_job(key.index);
        let counter = pool.slot(key.index).counter.load(Ordering::Acquire);
        let stack = pool.stack_handle(key.index);

        trace!("thread {} runs fiber {:?}", ThreadData::current_id(), key);
        let fiber: ScopedCoroutine<'_, (), (), (), _> =
            ScopedCoroutine::with_stack(stack, move |_: &Yielder<(), ()>, ()| {
                // Completion trampoline: every fiber starts and ends here.
                ThreadData::set_running(Some(key));
                let index = usize::from(payload.index);
                let callback = payload.callback;
                if catch_unwind(AssertUnwindSafe(move || callback(index))).is_err() {
                    // A panic must not cross the context switch; the batch
                    // still drains so waiters are not stranded.
                    warn!("job {} of batch counter {} panicked", index, counter);
                }
                ThreadData::set_running(None);
            });

        fiber.scope(|mut fiber| {
            match fiber.as_mut().resume(()) {
                CoroutineResult::Return(()) => {}
                CoroutineResult::Yield(()) => unreachable!("job fibers do not yield"),
            }
            debug_assert!(fiber.as_mut().done());
        });
        // Only now has the coroutine left the slot's stack; releasing any
        // earlier would let the next allocation reuse the memory under the
        // final context switch. The counter drains last: a waiter that sees
        // zero may rely on every fiber of the batch being back in its pool.
        pool.release(key.index);
        self.counters.decrement(counter);
    }

    /// ////////////////////////////////////////////////////////////////////////
    /// Dispatch and wait

    pub(crate) fn dispatch(
        &self,
        jobs: Vec<JobDesc>,
        kind: PoolKind,
    ) -> Result<JobHandle, DispatchError> {
        let pool = self.pool(kind);
        let (counter_index, generation) = match self.counters.allocate() {
            Some(counter) => counter,
            None => {
                warn!("counter pool exhausted; batch of {} rejected", jobs.len());
                return Err(DispatchError::CountersExhausted);
            }
        };

        let submitted = jobs.len();
        let mut queued = Vec::with_capacity(submitted);
        // Batch positions are 16-bit, like the pools they index into.
        for (index, desc) in jobs.into_iter().enumerate().take(usize::from(u16::MAX)) {
            let priority = desc.priority;
            match pool.allocate(desc, index as u16, counter_index) {
                Some(slot) => queued.push((
                    FiberKey {
                        pool: kind,
                        index: slot,
                    },
                    priority,
                )),
                None => trace!(
                    "{:?} fiber pool exhausted; job {} of {} skipped",
                    kind,
                    index,
                    submitted
                ),
            }
        }

        let scheduled = queued.len();
        self.counters.arm(counter_index, scheduled as u32);

        // If we are inside a job, pre-arm its wait counter so that, should it
        // park on this batch, it cannot be re-selected before the batch
        // drains. Must happen before the fibers become visible.
        if let Some(running) = ThreadData::running() {
            self.slot(running)
                .wait_counter
                .store(wait_ref(counter_index, generation), Ordering::Release);
        }

        {
            let mut queues = self.queues.lock().unwrap();
            for (key, priority) in queued {
                queues[priority as usize].push_back(key);
            }
        }
        self.post(scheduled);

        trace!(
            "dispatched {}/{} {:?} jobs on counter {}",
            scheduled,
            submitted,
            kind,
            counter_index
        );
        Ok(JobHandle::new(counter_index, generation, scheduled as u16))
    }

    /// Blocks until the batch behind `handle` has fully run.
    ///
    /// From a plain thread this polls with single scheduling passes, so the
    /// waiting thread helps drain the queues. From inside a job it parks the
    /// calling fiber (pinned to this thread) and re-enters the scheduling
    /// loop on an auxiliary stack; the nested loop runs unrelated jobs and
    /// returns once it can hand the thread back to the parked caller.
    pub(crate) fn wait_jobs(&self, handle: JobHandle) {
        let mut parked: Option<FiberKey> = None;

        while self.counters.value(&handle) > 0 || parked.is_some() {
            let region = match ThreadData::reserve_wait_stack(
                self.config.wait_stack_size,
                self.config.max_wait_depth,
            ) {
                Some(region) => region,
                None => {
                    // Nesting deeper than the configured stack budget is a
                    // programming error; give up with the handle still live.
                    warn!(
                        "wait nesting exceeds {} on thread {}; wait abandoned",
                        self.config.max_wait_depth,
                        ThreadData::current_id()
                    );
                    if let Some(key) = parked.take() {
                        self.rescue_parked(key);
                    }
                    return;
                }
            };

            if parked.is_none() {
                if let Some(key) = ThreadData::take_running() {
                    // Called from inside a job: the callback is work in
                    // progress, so re-queue its fiber pinned to this thread.
                    // Arm the wait counter with the handle actually being
                    // waited on, then publish and post.
                    let slot = self.slot(key);
                    slot.wait_counter
                        .store(wait_ref(handle.index(), handle.generation()), Ordering::Release);
                    slot.owner.store(ThreadData::current_id(), Ordering::Release);
                    let priority = slot.priority();
                    self.queues.lock().unwrap()[priority as usize].push_back(key);
                    self.post(1);
                    parked = Some(key);
                    trace!(
                        "fiber {:?} parked on thread {} waiting for counter {}",
                        key,
                        ThreadData::current_id(),
                        handle.index()
                    );
                }
            }

            let exit = {
                let pusher: ScopedCoroutine<'_, (), (), PusherExit, _> =
                    ScopedCoroutine::with_stack(region.handle(), move |_: &Yielder<(), ()>, ()| {
                        self.pusher(parked)
                    });
                pusher.scope(|mut pusher| match pusher.as_mut().resume(()) {
                    CoroutineResult::Return(exit) => exit,
                    CoroutineResult::Yield(()) => unreachable!("scheduling loops do not yield"),
                })
            };
            ThreadData::release_wait_stack(region);

            if exit == PusherExit::Unparked {
                let key = parked.take().expect("unpark reported with nothing parked");
                self.slot(key).wait_counter.store(WAIT_NONE, Ordering::Release);
                ThreadData::set_running(Some(key));
                trace!("fiber {:?} resumed after wait", key);
            }
        }

        if self.counters.release(&handle) {
            trace!("batch counter {} drained and released", handle.index());
        }
    }

    /// Pulls an abandoned parked fiber back out of the queues (wait bailed
    /// out on auxiliary-stack exhaustion before the loop could consume it).
    fn rescue_parked(&self, key: FiberKey) {
        {
            let mut queues = self.queues.lock().unwrap();
            for queue in queues.iter_mut() {
                if let Some(pos) = queue.iter().position(|&queued| queued == key) {
                    queue.remove(pos);
                    break;
                }
            }
            let slot = self.slot(key);
            slot.owner.store(0, Ordering::Release);
            slot.wait_counter.store(WAIT_NONE, Ordering::Release);
        }
        ThreadData::set_running(Some(key));
    }

    /// ////////////////////////////////////////////////////////////////////////
    /// Shutdown

    /// Stops and joins the workers. All batches must have been waited on;
    /// leak counts make violations visible in the log.
    pub(crate) fn terminate_and_join(&self) {
        self.stop.store(true, Ordering::Release);
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        self.post(handles.len() + 1);
        for handle in handles {
            let _ = handle.join();
        }

        let stats = self.stats();
        if stats.small_free != stats.small_capacity
            || stats.big_free != stats.big_capacity
            || stats.counters_free != stats.counters_capacity
        {
            warn!(
                "dispatcher down with leaks: fibers {}/{} and {}/{} free, counters {}/{} free",
                stats.small_free,
                stats.small_capacity,
                stats.big_free,
                stats.big_capacity,
                stats.counters_free,
                stats.counters_capacity
            );
        } else {
            debug!("dispatcher down; all pools fully returned");
        }
    }
}

/// ////////////////////////////////////////////////////////////////////////
/// Worker threads

/// Body of every worker thread: install per-thread state, then sit in the
/// scheduling loop until shutdown.
fn main_loop(registry: Arc<Registry>, index: usize) {
    ThreadData::install_worker();
    trace!(
        "worker {} up (thread id {})",
        index,
        ThreadData::current_id()
    );

    let _exit = registry.pusher(None);
    debug_assert_eq!(_exit, PusherExit::Stopped);

    trace!("worker {} down", index);
}
