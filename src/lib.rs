//! Sisal: a fiber-based job dispatcher.
//!
//! Applications submit short jobs in batches. The jobs run in parallel on a
//! fixed pool of worker threads, and, crucially, a job may wait for a child
//! batch *from inside its own callback* without blocking the worker thread
//! underneath it. The waiting fiber freezes its stack, the
//! worker re-enters the scheduling loop on a small auxiliary stack and keeps
//! running unrelated jobs, and the waiter resumes on the same worker once
//! the batch's completion counter reaches zero.
//!
//! Jobs are stackful coroutines ("fibers") bound to pre-allocated stacks
//! from one of two pools: `small` for the common case and `big` for jobs
//! with deep call chains. Each dispatch returns a [`JobHandle`] that must be
//! consumed by exactly one [`wait_jobs`] call.
//!
//! ```
//! use sisal::{DispatcherBuilder, JobDesc};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! DispatcherBuilder::new().num_threads(2).build_global().unwrap();
//!
//! let hits = Arc::new(AtomicUsize::new(0));
//! let jobs: Vec<_> = (0..8)
//!     .map(|_| {
//!         let hits = Arc::clone(&hits);
//!         JobDesc::new(move |_index| {
//!             hits.fetch_add(1, Ordering::SeqCst);
//!         })
//!     })
//!     .collect();
//!
//! let handle = sisal::dispatch_small(jobs).unwrap();
//! sisal::wait_jobs(handle);
//! assert_eq!(hits.load(Ordering::SeqCst), 8);
//!
//! sisal::shutdown();
//! ```
//!
//! The dispatcher is a process-wide singleton with an explicit lifecycle:
//! [`init`] (or [`DispatcherBuilder::build_global`]) brings it up,
//! [`shutdown`] stops and joins the workers. Scheduling is strictly
//! cooperative -- no preemption, no cancellation; the only suspension point
//! visible to a job is `wait_jobs`.

use std::io;

use thiserror::Error;

mod counter;
mod fiber;
mod job;
mod registry;
mod stack;

pub use crate::counter::JobHandle;
pub use crate::job::{JobDesc, JobPriority};
pub use crate::registry::DispatcherStats;

use crate::fiber::PoolKind;

/// Default number of fibers in the small-stack pool.
pub const DEFAULT_SMALL_FIBERS: u16 = 128;
/// Default number of fibers in the big-stack pool.
pub const DEFAULT_BIG_FIBERS: u16 = 32;
/// Default stack size of a small fiber.
pub const DEFAULT_SMALL_STACK_SIZE: usize = 64 * 1024;
/// Default stack size of a big fiber.
pub const DEFAULT_BIG_STACK_SIZE: usize = 512 * 1024;
/// Default size of the auxiliary stacks that host nested scheduling loops.
pub const DEFAULT_WAIT_STACK_SIZE: usize = 32 * 1024;
/// Auxiliary stacks per thread, which bounds the wait nesting depth.
pub const MAX_WAIT_DEPTH: usize = 32;
/// Hard cap on the worker thread count.
pub const MAX_WORKER_THREADS: usize = 255;

const MIN_STACK_SIZE: usize = 4096;

/// Resolved configuration handed to the registry.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub num_threads: usize,
    pub small_fibers: u16,
    pub big_fibers: u16,
    pub small_stack_size: usize,
    pub big_stack_size: usize,
    pub wait_stack_size: usize,
    pub max_wait_depth: usize,
    pub thread_name: String,
    pub worker_stack_size: Option<usize>,
}

/// Error bringing the dispatcher up. After a failed build no other API may
/// be used until a later `build_global` succeeds.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("the global job dispatcher is already initialized")]
    AlreadyInitialized,
    #[error("failed to allocate stack memory")]
    StackAllocation(#[source] io::Error),
    #[error("failed to spawn a worker thread")]
    ThreadSpawn(#[source] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Error submitting a batch. The batch did not run and there is no handle.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no batch counter available; too many undrained batches in flight")]
    CountersExhausted,
}

/// Configures and starts the global dispatcher.
///
/// Mirrors the compile-time defaults of the dispatcher; everything here is a
/// tunable. `build_global` fails with [`BuildError::AlreadyInitialized`] if
/// a dispatcher is already up.
#[derive(Debug)]
pub struct DispatcherBuilder {
    num_threads: Option<usize>,
    small_fibers: u16,
    big_fibers: u16,
    small_stack_size: usize,
    big_stack_size: usize,
    wait_stack_size: usize,
    thread_name: Option<String>,
    worker_stack_size: Option<usize>,
}

impl Default for DispatcherBuilder {
    fn default() -> DispatcherBuilder {
        DispatcherBuilder {
            num_threads: None,
            small_fibers: DEFAULT_SMALL_FIBERS,
            big_fibers: DEFAULT_BIG_FIBERS,
            small_stack_size: DEFAULT_SMALL_STACK_SIZE,
            big_stack_size: DEFAULT_BIG_STACK_SIZE,
            wait_stack_size: DEFAULT_WAIT_STACK_SIZE,
            thread_name: None,
            worker_stack_size: None,
        }
    }
}

impl DispatcherBuilder {
    pub fn new() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Number of worker threads. Zero is legal: all work then happens in the
    /// single-pass scheduling loops of whichever threads call [`wait_jobs`].
    ///
    /// Defaults to `min(available cores - 1, 255)`, leaving one core to the
    /// dispatching thread.
    pub fn num_threads(mut self, num_threads: usize) -> DispatcherBuilder {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn small_fibers(mut self, count: u16) -> DispatcherBuilder {
        self.small_fibers = count;
        self
    }

    pub fn big_fibers(mut self, count: u16) -> DispatcherBuilder {
        self.big_fibers = count;
        self
    }

    pub fn small_stack_size(mut self, bytes: usize) -> DispatcherBuilder {
        self.small_stack_size = bytes;
        self
    }

    pub fn big_stack_size(mut self, bytes: usize) -> DispatcherBuilder {
        self.big_stack_size = bytes;
        self
    }

    /// Size of the per-thread auxiliary stacks used by nested waits.
    pub fn wait_stack_size(mut self, bytes: usize) -> DispatcherBuilder {
        self.wait_stack_size = bytes;
        self
    }

    /// Name prefix for worker threads (`<prefix>-<index>`).
    pub fn thread_name<S: Into<String>>(mut self, prefix: S) -> DispatcherBuilder {
        self.thread_name = Some(prefix.into());
        self
    }

    /// OS stack size for the worker threads themselves. Workers spend their
    /// lives in the scheduling loop (real work runs on fiber stacks), so
    /// the platform default is normally plenty.
    pub fn worker_stack_size(mut self, bytes: usize) -> DispatcherBuilder {
        self.worker_stack_size = Some(bytes);
        self
    }

    /// Starts the global dispatcher with this configuration.
    pub fn build_global(self) -> Result<(), BuildError> {
        let config = self.into_config()?;
        registry::init_global(config)
    }

    fn into_config(self) -> Result<Config, BuildError> {
        if self.small_stack_size < MIN_STACK_SIZE
            || self.big_stack_size < MIN_STACK_SIZE
            || self.wait_stack_size < MIN_STACK_SIZE
        {
            return Err(BuildError::InvalidConfig("stack sizes must be at least 4 KiB"));
        }
        let num_threads = self
            .num_threads
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
            .min(MAX_WORKER_THREADS);
        Ok(Config {
            num_threads,
            small_fibers: self.small_fibers,
            big_fibers: self.big_fibers,
            small_stack_size: self.small_stack_size,
            big_stack_size: self.big_stack_size,
            wait_stack_size: self.wait_stack_size,
            max_wait_depth: MAX_WAIT_DEPTH,
            thread_name: self.thread_name.unwrap_or_else(|| "sisal-worker".to_owned()),
            worker_stack_size: self.worker_stack_size,
        })
    }
}

/// Brings the global dispatcher up with default configuration.
pub fn init() -> Result<(), BuildError> {
    DispatcherBuilder::new().build_global()
}

/// Stops the workers, joins them, and releases all pools.
///
/// Every dispatched batch must have been waited on first; shutting down with
/// live batches leaks their fibers (and is logged). A later
/// `init`/`build_global` may bring a fresh dispatcher up.
pub fn shutdown() {
    registry::shutdown_global();
}

/// Submits a batch using the small-stack fiber pool.
///
/// Jobs beyond the pool's remaining capacity are silently skipped -- the
/// returned handle's [`scheduled`](JobHandle::scheduled) count tells how
/// many actually run. Fails only when no batch counter is available.
///
/// # Panics
///
/// Panics if the dispatcher is not initialized.
pub fn dispatch_small(jobs: Vec<JobDesc>) -> Result<JobHandle, DispatchError> {
    registry::global().dispatch(jobs, PoolKind::Small)
}

/// Submits a batch using the big-stack fiber pool. See [`dispatch_small`].
pub fn dispatch_big(jobs: Vec<JobDesc>) -> Result<JobHandle, DispatchError> {
    registry::global().dispatch(jobs, PoolKind::Big)
}

/// Blocks until every job of the batch has run, then invalidates the handle.
///
/// May be called from any plain thread (which then helps run queued jobs),
/// or from inside a job -- the calling fiber is parked, its worker keeps
/// draining unrelated work, and the fiber resumes on the same worker once
/// the batch is done. Waiting is single-consumer: exactly one caller should
/// wait on each handle.
///
/// # Panics
///
/// Panics if the dispatcher is not initialized.
pub fn wait_jobs(handle: JobHandle) {
    registry::global().wait_jobs(handle);
}

/// Occupancy snapshot of the fiber and counter pools.
///
/// With no batches in flight every pool reports `free == capacity`; anything
/// else means a handle was never waited on.
///
/// # Panics
///
/// Panics if the dispatcher is not initialized.
pub fn stats() -> DispatcherStats {
    registry::global().stats()
}
