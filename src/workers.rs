//! Interface to the execution engine running the managed computation.

use crate::error::Result;
use std::time::Duration;

/// Counters accumulated by the workers since the previous [`WorkerPool::sample`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolSample {
    /// Tasks completed.
    pub tasks: u64,
    /// Time the active workers spent inside tasks, summed over workers.
    pub busy: Duration,
    /// Workers that were allowed to run.
    pub active_workers: usize,
}

impl PoolSample {
    /// Mean time per task, if any task completed.
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.tasks == 0 {
            None
        } else {
            Some(self.busy / self.tasks.min(u32::MAX as u64) as u32)
        }
    }
}

/// What the control loop needs from a worker pool.
///
/// Implementations must be usable from the control thread while their
/// workers run concurrently.
pub trait WorkerPool: Send + Sync {
    /// Upper bound on concurrently active workers.
    fn max_workers(&self) -> usize;

    /// Block until the computation has started or `timeout` elapsed.
    ///
    /// Returns whether it started.
    fn wait_for_start(&self, timeout: Duration) -> bool;

    /// Collect and clear the counters.
    ///
    /// `None` when counters are missing or incomplete for this interval.
    fn sample(&self) -> Option<PoolSample>;

    /// Freeze all workers, wait (at most `timeout`) until they are quiescent,
    /// run `placement.len()` workers on the listed virtual cores and resume.
    ///
    /// Returns after every active worker has acknowledged its new placement.
    fn reconfigure(&self, placement: &[usize], timeout: Duration) -> Result<()>;

    /// Whether the computation has run to completion.
    fn is_finished(&self) -> bool;
}
