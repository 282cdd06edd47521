//! The control loop of one managed computation.
//!
//! # Loop
//!
//! ```text
//! wait for start -> all knobs at max -> repeat {
//!     sleep (interval - overhead of the previous tick)
//!     sample workers and energy -> smooth -> update contract requirement
//!     unless inhibited or persisting: decide -> act if different
//!         (act resets the smoother and discards the cooldown sample)
//! } until terminated or finished
//! ```
//!
//! The manager owns the [`Configuration`] (and through it the hardware) and
//! the [`Selector`]; nothing else actuates while it runs. A [`ManagerHandle`]
//! is the only way to reach a running manager from other threads.
//!
//! # Example
//!
//! ```ignore
//! use tuneloop::{Contract, Farm, Manager, Parameters, SysfsHardware, SystemClock};
//!
//! let farm = Farm::new("app", 8, |_worker| do_one_task())?;
//! let params = Parameters::new().with_contract(Contract::Throughput { target: 500.0 });
//! let mut manager = Manager::new(params, farm, SysfsHardware::new()?, SystemClock::new())?;
//! let handle = manager.handle();
//! std::thread::spawn(move || {
//!     wait_for_shutdown_signal();
//!     handle.terminate();
//! });
//! let summary = manager.run()?;
//! ```

use crate::clock::Clock;
use crate::config::{Contract, Parameters, PersistenceStrategy, SmoothingStrategy};
use crate::configuration::Configuration;
use crate::error::{ErrorKind, Result};
use crate::hardware::Hardware;
use crate::knob::KnobsValues;
use crate::metrics::TuneMetrics;
use crate::sample::Sample;
use crate::selector::{ContractState, Selector};
use crate::smoother::Smoother;
use crate::summary::{Observer, Summary, TickReport};
use crate::workers::{PoolSample, WorkerPool};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll period while waiting for the computation to start.
const START_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct HandleInner {
    terminated: AtomicBool,
    inhibited: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

/// Remote control for a running [`Manager`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ManagerHandle {
    inner: Arc<HandleInner>,
}

impl ManagerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the loop at its next check and wake it if sleeping.
    pub fn terminate(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.terminated.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Suspend (`true`) or resume (`false`) decision making.
    ///
    /// While inhibited the loop keeps sampling but never reconfigures.
    pub fn inhibit(&self, inhibited: bool) {
        self.inner.inhibited.store(inhibited, Ordering::SeqCst);
    }

    pub fn is_inhibited(&self) -> bool {
        self.inner.inhibited.load(Ordering::SeqCst)
    }

    /// Block for `timeout` or until [`terminate`](Self::terminate).
    ///
    /// Returns whether the handle is terminated.
    pub fn wait_for_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_terminated() {
            if self
                .inner
                .wakeup
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                break;
            }
        }
        self.is_terminated()
    }
}

/// Drives one computation's knobs to satisfy its contract.
pub struct Manager<W: WorkerPool, H: Hardware, C: Clock> {
    params: Parameters,
    workers: W,
    configuration: Configuration<H>,
    clock: C,
    handle: ManagerHandle,
    smoother: Smoother<Sample>,
    contract: ContractState,
    selector: Option<Selector>,
    metrics: TuneMetrics,
    observers: Vec<Box<dyn Observer>>,

    // === Run state ===
    started: Duration,
    last_tick: Duration,
    last_joules: f64,
    tasks_since_change: f64,
    total_tasks: f64,
    total_joules: f64,
    ticks: u64,
    last_valid: Option<KnobsValues>,
}

impl<W: WorkerPool, H: Hardware, C: Clock> Manager<W, H, C> {
    /// Validate `params` and build the configuration for `hardware`.
    ///
    /// # Errors
    ///
    /// Configuration errors: invalid parameters, no reachable configuration,
    /// metric creation. Governor actuation errors are passed through.
    pub fn new(params: Parameters, workers: W, hardware: H, clock: C) -> Result<Self> {
        params.validate()?;
        let configuration = Configuration::new(&params, hardware, workers.max_workers())?;
        let smoother = match params.smoothing {
            SmoothingStrategy::Simple => Smoother::simple(params.smoothing_window),
            SmoothingStrategy::Exponential => Smoother::exponential(params.smoothing_alpha),
        };
        let metrics = TuneMetrics::with_prefix(&params.prefix)?;
        let now = clock.now();
        Ok(Self {
            contract: ContractState::new(params.contract.clone(), now),
            params,
            workers,
            configuration,
            clock,
            handle: ManagerHandle::new(),
            smoother,
            selector: None,
            metrics,
            observers: Vec::new(),
            started: now,
            last_tick: now,
            last_joules: 0.0,
            tasks_since_change: 0.0,
            total_tasks: 0.0,
            total_joules: 0.0,
            ticks: 0,
            last_valid: None,
        })
    }

    /// Use externally created (and possibly registered) metrics.
    pub fn with_metrics(mut self, metrics: TuneMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    pub fn metrics(&self) -> &TuneMetrics {
        &self.metrics
    }

    pub fn configuration(&self) -> &Configuration<H> {
        &self.configuration
    }

    pub fn workers(&self) -> &W {
        &self.workers
    }

    pub fn selector(&self) -> Option<&Selector> {
        self.selector.as_ref()
    }

    fn is_calibrating(&self) -> bool {
        self.selector.as_ref().is_some_and(Selector::is_calibrating)
    }

    /// Run until terminated or the computation finishes.
    ///
    /// # Errors
    ///
    /// Errors before the first tick (maxing the knobs, resetting energy
    /// counters, building the selector) are returned. Errors while running
    /// end the loop and are reported in [`Summary::abort_reason`].
    pub fn run(&mut self) -> Result<Summary> {
        while !self.workers.wait_for_start(START_POLL) {
            if self.handle.is_terminated() {
                return Ok(self.summary(None));
            }
        }
        info!(contract = ?self.params.contract, "computation started");

        self.configuration.max_all_knobs(&self.workers)?;
        let values = self.configuration.real_values();
        self.metrics.record_values(&values);
        self.last_valid = Some(values);
        self.configuration.hardware_mut().reset_energy()?;
        self.last_joules = 0.0;
        // counters accumulated before the first configuration do not count
        let _discarded = self.workers.sample();

        let now = self.clock.now();
        self.started = now;
        self.last_tick = now;
        self.contract = ContractState::new(self.params.contract.clone(), now);
        self.selector = if self.params.contract == Contract::None {
            info!("no contract: running with all knobs at maximum");
            None
        } else if !self.configuration.knobs_change_needed() {
            info!("no knob can change: nothing to tune");
            None
        } else {
            Some(Selector::new(&self.params, &self.configuration, now)?)
        };

        let mut overhead = Duration::ZERO;
        let mut abort = None;
        loop {
            let interval = if self.is_calibrating() {
                self.params.sampling.calibration_interval()
            } else {
                self.params.sampling.steady_interval()
            };
            self.clock
                .sleep(interval.saturating_sub(overhead), &self.handle);
            if self.handle.is_terminated() {
                info!("terminated");
                break;
            }

            let tick_start = self.clock.now();
            if let Err(e) = self.tick(tick_start) {
                error!(%e, kind = ?e.kind(), "control loop aborted");
                abort = Some(e.to_string());
                break;
            }
            if self.workers.is_finished() {
                info!("computation finished");
                break;
            }
            overhead = self.clock.now().saturating_sub(tick_start);
        }
        Ok(self.summary(abort))
    }

    fn summary(&mut self, abort_reason: Option<String>) -> Summary {
        let summary = Summary {
            calibrations: self
                .selector
                .as_ref()
                .map(|s| s.calibrations().to_vec())
                .unwrap_or_default(),
            reconfigurations: self.configuration.reconfiguration_stats().clone(),
            total_tasks: self.total_tasks,
            total_joules: self.total_joules,
            duration: self.clock.now().saturating_sub(self.started),
            ticks: self.ticks,
            last_valid: self.last_valid.clone(),
            abort_reason,
            contract_infeasible: self
                .selector
                .as_ref()
                .is_some_and(Selector::contract_infeasible),
        };
        for o in &mut self.observers {
            o.on_summary(&summary);
        }
        summary
    }

    /// Energy since the previous read, or `None` if the meter failed.
    fn energy_delta(&mut self) -> Option<f64> {
        match self.configuration.hardware_mut().read_joules() {
            Ok(joules) => {
                let delta = (joules - self.last_joules).max(0.0);
                self.last_joules = joules;
                Some(delta)
            }
            Err(e) => {
                warn!(%e, "energy counters unavailable");
                None
            }
        }
    }

    fn account(&mut self, pool: &PoolSample, joules: f64) {
        let tasks = pool.tasks as f64;
        self.total_tasks += tasks;
        self.total_joules += joules;
        self.tasks_since_change += tasks;
        self.contract.record_tasks(tasks);
        if let Some(s) = self.selector.as_mut() {
            s.record_tick(tasks, joules);
        }
    }

    fn tick(&mut self, now: Duration) -> Result<()> {
        let elapsed = now.saturating_sub(self.last_tick);
        self.last_tick = now;
        self.ticks += 1;

        let Some(pool) = self.workers.sample() else {
            self.metrics.skipped_ticks.inc();
            debug!("no worker counters this tick");
            return Ok(());
        };
        let joules = self.energy_delta();
        self.account(&pool, joules.unwrap_or(0.0));
        let secs = elapsed.as_secs_f64();
        let Some(joules) = joules.filter(|_| secs > 0.0) else {
            self.metrics.skipped_ticks.inc();
            return Ok(());
        };

        let busy_capacity = pool.active_workers as f64 * secs;
        let sample = Sample {
            throughput: pool.tasks as f64 / secs,
            latency: pool.mean_latency().map_or(0.0, |l| l.as_secs_f64()),
            load_percentage: if busy_capacity > 0.0 {
                (pool.busy.as_secs_f64() / busy_capacity * 100.0).clamp(0.0, 100.0)
            } else {
                0.0
            },
            num_tasks: pool.tasks as f64,
            watts: joules / secs,
            ..Sample::zero()
        };
        self.smoother.add(sample);
        let smoothed = self.smoother.average();
        let required = self.contract.required(now);
        self.metrics.record_sample(&sample, &smoothed);
        self.metrics.required.set(required);
        if self.violates(&smoothed, required) {
            self.metrics.contract_violations.inc();
        }

        let inhibited = self.handle.is_inhibited();
        let report = TickReport {
            time: now.saturating_sub(self.started),
            values: self.configuration.real_values(),
            sample,
            smoothed,
            required,
            state: self.selector.as_ref().map(Selector::state),
            inhibited,
        };
        for o in &mut self.observers {
            o.on_tick(&report);
        }

        if inhibited {
            self.metrics.inhibited_ticks.inc();
            return Ok(());
        }
        if self.persist() {
            return Ok(());
        }
        if let Some(values) = self.decide() {
            if !self.configuration.equal(&values) {
                self.act(&values)?;
            }
        }
        Ok(())
    }

    fn violates(&self, smoothed: &Sample, required: f64) -> bool {
        match &self.params.contract {
            Contract::None => false,
            Contract::PowerBudget { .. } => smoothed.watts > required,
            Contract::Utilization { lower, upper } => {
                !(*lower..=*upper).contains(&smoothed.load_percentage)
            }
            _ => smoothed.maximum_throughput() < required,
        }
    }

    /// Whether the current configuration needs more samples before deciding.
    fn persist(&self) -> bool {
        let value = self.params.persistence_value;
        match self.params.persistence {
            PersistenceStrategy::Samples => (self.smoother.size() as f64) < value,
            PersistenceStrategy::Tasks => self.tasks_since_change < value,
            PersistenceStrategy::Variation => {
                let size = self.smoother.size();
                if size < 2 {
                    return true;
                }
                let cv = self.smoother.coefficient_variation();
                let cv = match self.params.contract {
                    Contract::PowerBudget { .. } => cv.watts,
                    Contract::Utilization { .. } => cv.load_percentage,
                    _ => cv.throughput,
                };
                cv * 100.0 > value && size < self.params.smoothing_window
            }
        }
    }

    /// Ask the selector for the next configuration given the smoothed samples
    /// so far. `None` when nothing is tuned.
    pub fn decide(&mut self) -> Option<KnobsValues> {
        let now = self.clock.now();
        let smoothed = self.smoother.average();
        let required = self.contract.required(now);
        let selector = self.selector.as_mut()?;
        let calibrating = selector.is_calibrating();
        let values = selector.decide(&self.configuration, &smoothed, required, now);
        if calibrating {
            self.metrics.calibration_steps.inc();
        }
        Some(values)
    }

    /// Apply `values`, then discard the samples of the transition.
    ///
    /// # Errors
    ///
    /// Actuation errors; the configuration keeps the knobs applied so far and
    /// the summary reports the last fully applied values.
    pub fn act(&mut self, values: &KnobsValues) -> Result<()> {
        if let Err(e) = self.configuration.set_values(values, &self.workers) {
            if e.kind() == ErrorKind::Actuation {
                warn!(%e, values = %values, "reconfiguration failed");
            }
            return Err(e);
        }
        let applied = self.configuration.real_values();
        debug!(values = %applied, "configuration applied");
        self.metrics.reconfigurations.inc();
        self.metrics.record_values(&applied);
        self.last_valid = Some(applied);

        self.smoother.reset();
        self.tasks_since_change = 0.0;
        self.clock
            .sleep(self.params.sampling.cooldown(), &self.handle);
        // work done during the transition counts, but is not attributed
        if let Some(pool) = self.workers.sample() {
            let joules = self.energy_delta().unwrap_or(0.0);
            self.account(&pool, joules);
            self.tasks_since_change = 0.0;
        }
        self.last_tick = self.clock.now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::PredictionStrategy;
    use crate::knob::KnobType;
    use crate::sim::{SimulatedHardware, SimulatedMachine, SimulatedWorkers, WorkloadModel};
    use crate::topology::Topology;

    fn machine(model: WorkloadModel) -> SimulatedMachine {
        SimulatedMachine::new(
            Topology::synthetic(1, 8, 1, vec![1_000_000, 1_500_000, 2_000_000]),
            model,
        )
    }

    fn manager(
        m: &SimulatedMachine,
        params: Parameters,
    ) -> Manager<SimulatedWorkers, SimulatedHardware, ManualClock> {
        Manager::new(params, m.workers(), m.hardware(), m.clock()).unwrap()
    }

    #[test]
    fn test_handle_wait_returns_on_terminate() {
        let handle = ManagerHandle::new();
        assert!(!handle.wait_for_termination(Duration::from_millis(1)));
        let remote = handle.clone();
        let t = std::thread::spawn(move || remote.terminate());
        assert!(handle.wait_for_termination(Duration::from_secs(30)));
        t.join().unwrap();
    }

    #[test]
    fn test_handle_inhibit_is_level_triggered() {
        let handle = ManagerHandle::new();
        handle.inhibit(true);
        assert!(handle.is_inhibited());
        handle.inhibit(false);
        assert!(!handle.is_inhibited());
    }

    #[test]
    fn test_invalid_parameters_fail_before_running() {
        let m = machine(WorkloadModel::default());
        let mut params = Parameters::new();
        params.smoothing_window = 0;
        assert!(Manager::new(params, m.workers(), m.hardware(), m.clock()).is_err());
    }

    #[test]
    fn test_no_contract_runs_at_max_until_finished() {
        let m = machine(WorkloadModel::default().with_total_tasks(5_000));
        let mut mgr = manager(&m, Parameters::new());
        let summary = mgr.run().unwrap();

        assert!(mgr.selector().is_none());
        assert!(summary.calibrations.is_empty());
        assert!(!summary.is_aborted());
        assert!(summary.total_tasks >= 4_999.0);
        let last = summary.last_valid.unwrap();
        assert_eq!(last[KnobType::VirtualCores], 8.0);
        assert_eq!(last[KnobType::Frequency], 2_000_000.0);
        assert_eq!(mgr.metrics().reconfigurations.get(), 0);
    }

    #[test]
    fn test_skipped_samples_are_counted() {
        let m = machine(WorkloadModel::default().with_total_tasks(2_000));
        // the first drop hits the discard before the first tick
        m.drop_samples(3);
        let mut mgr = manager(&m, Parameters::new());
        mgr.run().unwrap();
        assert_eq!(mgr.metrics().skipped_ticks.get(), 2);
    }

    #[test]
    fn test_inhibited_manager_never_reconfigures() {
        let m = machine(WorkloadModel::default().with_total_tasks(20_000));
        let params = Parameters::new()
            .with_contract(Contract::Throughput { target: 100.0 })
            .with_prediction(PredictionStrategy::Analytical);
        let mut mgr = manager(&m, params);
        mgr.handle().inhibit(true);
        let summary = mgr.run().unwrap();

        assert_eq!(mgr.metrics().reconfigurations.get(), 0);
        assert!(mgr.metrics().inhibited_ticks.get() > 0);
        assert_eq!(summary.last_valid.unwrap()[KnobType::VirtualCores], 8.0);
    }

    struct FailFrequencyOnFirstTick(SimulatedMachine);

    impl Observer for FailFrequencyOnFirstTick {
        fn on_tick(&mut self, _report: &TickReport) {
            self.0.fail_frequency_changes(true);
        }
    }

    #[test]
    fn test_actuation_failure_aborts_with_last_valid() {
        let m = machine(WorkloadModel::default().with_total_tasks(50_000));
        let params = Parameters::new()
            .with_contract(Contract::Throughput { target: 100.0 })
            .with_prediction(PredictionStrategy::Analytical);
        let mut mgr = manager(&m, params).with_observer(FailFrequencyOnFirstTick(m.clone()));
        let summary = mgr.run().unwrap();

        assert!(summary.is_aborted());
        let last = summary.last_valid.unwrap();
        assert_eq!(last[KnobType::VirtualCores], 8.0);
        assert_eq!(last[KnobType::Frequency], 2_000_000.0);
        assert!(m.completed_tasks() < 50_000.0);
    }

    #[test]
    fn test_persistence_by_samples() {
        let m = machine(WorkloadModel::default());
        let mut params = Parameters::new();
        params.persistence_value = 2.0;
        let mut mgr = manager(&m, params);
        assert!(mgr.persist());
        mgr.smoother.add(Sample::zero());
        assert!(mgr.persist());
        mgr.smoother.add(Sample::zero());
        assert!(!mgr.persist());
    }

    #[test]
    fn test_persistence_by_variation() {
        let m = machine(WorkloadModel::default());
        let mut params = Parameters::new().with_contract(Contract::Throughput { target: 10.0 });
        params.persistence = PersistenceStrategy::Variation;
        params.persistence_value = 5.0;
        params.smoothing_window = 4;
        let mut mgr = manager(&m, params);
        let at = |x: f64| Sample {
            throughput: x,
            ..Sample::zero()
        };

        mgr.smoother.add(at(100.0));
        assert!(mgr.persist());
        mgr.smoother.add(at(100.0));
        assert!(!mgr.persist(), "stable samples end persistence");

        mgr.smoother.reset();
        mgr.smoother.add(at(50.0));
        mgr.smoother.add(at(150.0));
        assert!(mgr.persist(), "noisy samples persist");
        mgr.smoother.add(at(50.0));
        mgr.smoother.add(at(150.0));
        assert!(!mgr.persist(), "a full window ends persistence");
    }
}
