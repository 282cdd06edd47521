//! A pinned rayon worker farm the control loop can resize and move.
//!
//! Every rayon thread runs one long-lived worker (via `spawn_broadcast`)
//! that calls the user task in a loop. Workers beyond the active count park
//! on a condition variable. Counters are per-worker atomics; the hot path
//! only reads an atomic generation and takes the control lock when it
//! changes.
//!
//! # Reconfiguration
//!
//! ```text
//! freeze  --gen+1-->  workers finish their task and park
//!         <--parked-- all parked (bounded wait)
//! resume  --gen+1-->  active workers re-pin and acknowledge
//!         <--acked--- all active acknowledged (bounded wait)
//! ```
//!
//! ```ignore
//! let farm = Farm::new("app", 8, |worker| {
//!     process_next_item(worker)
//! })?;
//! farm.start();
//! let mut manager = Manager::new(params, farm, SysfsHardware::new()?, SystemClock::new())?;
//! ```

use crate::affinity::PinState;
use crate::error::{Result, TuneError};
use crate::workers::{PoolSample, WorkerPool};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// User task: called repeatedly with the worker index; return `false` once
/// the computation is complete.
pub type TaskFn = dyn Fn(usize) -> bool + Send + Sync;

#[derive(Debug, Default)]
struct WorkerCounters {
    tasks: AtomicU64,
    busy_ns: AtomicU64,
}

#[derive(Debug, Default)]
struct Control {
    generation: u64,
    started: bool,
    stopping: bool,
    frozen: bool,
    active: usize,
    placement: Vec<usize>,
    parked: usize,
    exited: usize,
    acked: usize,
    pin_failure: Option<usize>,
}

struct FarmInner {
    generation: AtomicU64,
    finished: AtomicBool,
    control: Mutex<Control>,
    changed: Condvar,
    acked: Condvar,
    counters: Vec<WorkerCounters>,
    task: Box<TaskFn>,
}

impl FarmInner {
    fn bump(&self, c: &mut Control) {
        c.generation += 1;
        self.generation.store(c.generation, Ordering::Release);
        self.changed.notify_all();
    }

    fn run_worker(&self, index: usize) {
        let mut pin = PinState::default();
        let mut seen = u64::MAX;
        let counters = &self.counters[index];

        loop {
            if self.generation.load(Ordering::Acquire) != seen {
                let mut c = self.control.lock();
                let mut parked = false;
                loop {
                    if c.stopping {
                        if parked {
                            c.parked -= 1;
                        }
                        c.exited += 1;
                        self.acked.notify_all();
                        return;
                    }
                    if c.frozen || !c.started || index >= c.active {
                        if !parked {
                            c.parked += 1;
                            parked = true;
                            self.acked.notify_all();
                        }
                        self.changed.wait(&mut c);
                        continue;
                    }
                    break;
                }
                if parked {
                    c.parked -= 1;
                }
                if c.generation != seen {
                    let cpu = c.placement[index];
                    if let Err(e) = pin.ensure(cpu) {
                        warn!(%e, worker = index, cpu, "worker could not move");
                        c.pin_failure = Some(cpu);
                    }
                    seen = c.generation;
                    c.acked += 1;
                    self.acked.notify_all();
                }
            }

            let start = Instant::now();
            let more = (self.task)(index);
            counters
                .busy_ns
                .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
            counters.tasks.fetch_add(1, Ordering::Relaxed);

            if !more {
                self.finished.store(true, Ordering::Release);
                let mut c = self.control.lock();
                c.stopping = true;
                c.exited += 1;
                self.bump(&mut c);
                self.acked.notify_all();
                info!(worker = index, "computation finished");
                return;
            }
        }
    }
}

/// Pinned worker farm backed by a rayon thread pool.
pub struct Farm {
    inner: Arc<FarmInner>,
    // dropped last; workers exit once `stopping` is set
    _pool: rayon::ThreadPool,
}

impl std::fmt::Debug for Farm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Farm")
            .field("workers", &self.inner.counters.len())
            .finish()
    }
}

impl Farm {
    /// Spawn `max_workers` parked workers running `task`.
    ///
    /// Nothing runs until [`start`](Farm::start) is called and the control
    /// loop assigns a placement.
    pub fn new<F>(prefix: &str, max_workers: usize, task: F) -> Result<Self>
    where
        F: Fn(usize) -> bool + Send + Sync + 'static,
    {
        let name = prefix.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers.max(1))
            .thread_name(move |i| format!("{name}-worker-{i:04}"))
            .build()?;
        let inner = Arc::new(FarmInner {
            generation: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            control: Mutex::new(Control::default()),
            changed: Condvar::new(),
            acked: Condvar::new(),
            counters: (0..pool.current_num_threads())
                .map(|_| WorkerCounters::default())
                .collect(),
            task: Box::new(task),
        });

        let worker_inner = Arc::clone(&inner);
        pool.spawn_broadcast(move |ctx| worker_inner.run_worker(ctx.index()));
        debug!(prefix, workers = inner.counters.len(), "farm created");
        Ok(Self { inner, _pool: pool })
    }

    /// Let the computation begin once a placement is set.
    pub fn start(&self) {
        let mut c = self.inner.control.lock();
        c.started = true;
        self.inner.bump(&mut c);
        self.inner.acked.notify_all();
    }

    /// Ask every worker to exit after its current task.
    pub fn stop(&self) {
        let mut c = self.inner.control.lock();
        c.stopping = true;
        self.inner.bump(&mut c);
    }

    /// Tasks completed since creation, including those not yet sampled.
    pub fn pending_tasks(&self) -> u64 {
        self.inner
            .counters
            .iter()
            .map(|w| w.tasks.load(Ordering::Relaxed))
            .sum()
    }
}

impl Drop for Farm {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WorkerPool for Farm {
    fn max_workers(&self) -> usize {
        self.inner.counters.len()
    }

    fn wait_for_start(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut c = self.inner.control.lock();
        while !c.started {
            if self.inner.acked.wait_until(&mut c, deadline).timed_out() {
                return c.started;
            }
        }
        true
    }

    fn sample(&self) -> Option<PoolSample> {
        let active = {
            let c = self.inner.control.lock();
            if !c.started {
                return None;
            }
            c.active
        };
        let mut sample = PoolSample {
            active_workers: active,
            ..PoolSample::default()
        };
        let mut busy_ns = 0u64;
        for w in &self.inner.counters {
            sample.tasks += w.tasks.swap(0, Ordering::Relaxed);
            busy_ns += w.busy_ns.swap(0, Ordering::Relaxed);
        }
        sample.busy = Duration::from_nanos(busy_ns);
        Some(sample)
    }

    fn reconfigure(&self, placement: &[usize], timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        let workers = inner.counters.len();
        let deadline = Instant::now() + timeout;
        let mut c = inner.control.lock();

        c.frozen = true;
        inner.bump(&mut c);
        while c.parked + c.exited < workers && !c.stopping {
            if inner.acked.wait_until(&mut c, deadline).timed_out()
                && c.parked + c.exited < workers
            {
                c.frozen = false;
                inner.bump(&mut c);
                warn!(?timeout, parked = c.parked, workers, "workers did not freeze");
                return Err(TuneError::Quiescence(timeout));
            }
        }

        c.placement = placement.to_vec();
        c.active = placement.len().min(workers);
        c.acked = 0;
        c.pin_failure = None;
        c.frozen = false;
        inner.bump(&mut c);

        let expected = if c.started { c.active } else { 0 };
        while c.acked < expected && !c.stopping {
            if inner.acked.wait_until(&mut c, deadline).timed_out() && c.acked < expected {
                return Err(TuneError::Quiescence(timeout));
            }
        }
        if let Some(cpu) = c.pin_failure.take() {
            return Err(TuneError::AffinityFailed(cpu));
        }
        debug!(active = c.active, "farm reconfigured");
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuset::available_cpus;
    use std::sync::atomic::AtomicUsize;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_nothing_runs_before_placement() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let farm = Farm::new("idle", 2, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
            true
        })
        .unwrap();
        assert!(farm.sample().is_none());
        farm.start();
        assert!(farm.wait_for_start(Duration::from_secs(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(farm.sample().unwrap().tasks, 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_reconfigure_changes_active_workers() {
        let cpu = available_cpus()[0];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let farm = Farm::new("resize", 2, move |w| {
            s.lock().push(w);
            std::thread::sleep(Duration::from_micros(200));
            true
        })
        .unwrap();
        farm.start();

        farm.reconfigure(&[cpu], Duration::from_secs(5)).unwrap();
        assert!(wait_until(|| farm.pending_tasks() > 10));
        farm.reconfigure(&[], Duration::from_secs(5)).unwrap();
        let sample = farm.sample().unwrap();
        assert!(sample.tasks > 10);
        assert_eq!(sample.active_workers, 0);
        assert!(sample.busy > Duration::ZERO);
        assert!(seen.lock().iter().all(|&w| w == 0));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_finished_when_task_reports_done() {
        let cpu = available_cpus()[0];
        let remaining = Arc::new(AtomicUsize::new(50));
        let r = Arc::clone(&remaining);
        let farm = Farm::new("finite", 1, move |_| r.fetch_sub(1, Ordering::Relaxed) > 1).unwrap();
        farm.start();
        farm.reconfigure(&[cpu], Duration::from_secs(5)).unwrap();
        assert!(wait_until(|| farm.is_finished()));
        assert_eq!(farm.sample().unwrap().tasks, 50);
    }

    #[test]
    fn test_bad_cpu_reports_affinity_failure() {
        let farm = Farm::new("badpin", 1, |_| true).unwrap();
        farm.start();
        let err = farm
            .reconfigure(&[usize::MAX], Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, TuneError::AffinityFailed(usize::MAX)));
    }
}
