//! Job descriptors submitted to the dispatcher.

use std::fmt;

/// Number of priority levels; ready queues are indexed by priority.
pub(crate) const NUM_PRIORITIES: usize = 3;

/// Scheduling priority of a job.
///
/// Selection strictly prefers `High` over `Normal` over `Low`; within one
/// level, eligible fibers run in dispatch order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl JobPriority {
    pub(crate) fn from_index(index: u8) -> JobPriority {
        match index {
            0 => JobPriority::High,
            1 => JobPriority::Normal,
            _ => JobPriority::Low,
        }
    }
}

impl Default for JobPriority {
    fn default() -> JobPriority {
        JobPriority::Normal
    }
}

pub(crate) type JobFn = Box<dyn FnOnce(usize) + Send + 'static>;

/// One unit of work in a batch.
///
/// The callback receives the job's position within its submitted batch (the
/// position is stable even when earlier entries fail to get a fiber). Any
/// state the job needs is captured by the closure.
pub struct JobDesc {
    pub(crate) priority: JobPriority,
    pub(crate) callback: JobFn,
}

impl JobDesc {
    /// A normal-priority job.
    pub fn new<F>(callback: F) -> JobDesc
    where
        F: FnOnce(usize) + Send + 'static,
    {
        JobDesc::with_priority(JobPriority::Normal, callback)
    }

    pub fn with_priority<F>(priority: JobPriority, callback: F) -> JobDesc
    where
        F: FnOnce(usize) + Send + 'static,
    {
        JobDesc {
            priority,
            callback: Box::new(callback),
        }
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }
}

impl fmt::Debug for JobDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDesc")
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_matches_queue_index() {
        assert!(JobPriority::High < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::Low);
        assert_eq!(JobPriority::from_index(JobPriority::Low as u8), JobPriority::Low);
    }

    #[test]
    fn default_priority_is_normal() {
        let desc = JobDesc::new(|_| {});
        assert_eq!(desc.priority(), JobPriority::Normal);
    }
}
