//! In-memory machine for tests, benchmarks and dry runs.
//!
//! A [`SimulatedMachine`] hands out a [`SimulatedHardware`] and a
//! [`SimulatedWorkers`] that share one state. Time only moves through the
//! machine's [`ManualClock`], so a full control loop runs deterministically
//! and instantly.
//!
//! # Model
//!
//! With `n` distinct virtual cores active on `p` physical cores, the
//! effective parallelism is `e = p + ht_gain * (n - p)` and the capacity is
//!
//! ```text
//! rate * e / (1 + contention * (e - 1) + coherency * e * (e - 1)) * speed
//! ```
//!
//! where `speed` is the mean of `f / f_max * duty / 100` over the active
//! cores. Throughput is the capacity capped by the optional input rate.
//! Power is a static share per frequency domain plus a dynamic share per
//! active core scaled by `f * V^2` and load.
//!
//! ```ignore
//! let machine = SimulatedMachine::new(Topology::synthetic(1, 8, 1, freqs), WorkloadModel::default());
//! let mut manager = Manager::new(params, machine.workers(), machine.hardware(), machine.clock())?;
//! manager.run()?;
//! ```

use crate::clock::{Clock, ManualClock};
use crate::error::{Result, TuneError};
use crate::hardware::{Governor, Hardware};
use crate::knob::KnobType;
use crate::topology::Topology;
use crate::workers::{PoolSample, WorkerPool};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Operations recorded by the simulated machine, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetGovernor(usize, Governor),
    SetFrequency(usize, u64),
    SetClockModulation(usize, f64),
    Hotplug(usize, bool),
    Reconfigure(Vec<usize>),
}

/// Performance and power characteristics of the simulated workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadModel {
    /// Tasks per second of one worker at the top frequency.
    pub rate_per_core: f64,
    /// Serial fraction (USL sigma).
    pub contention: f64,
    /// Crosstalk penalty (USL kappa).
    pub coherency: f64,
    /// Extra throughput of a second hardware context relative to a full core.
    pub ht_gain: f64,
    /// Arrival rate cap in tasks per second.
    pub input_rate: Option<f64>,
    /// Watts per frequency domain, regardless of load.
    pub static_watts: f64,
    /// Watts of one fully loaded core at the top frequency and voltage.
    pub dynamic_watts: f64,
    /// Stop after this many tasks.
    pub total_tasks: Option<u64>,
}

impl Default for WorkloadModel {
    fn default() -> Self {
        Self {
            rate_per_core: 100.0,
            contention: 0.02,
            coherency: 0.0,
            ht_gain: 0.3,
            input_rate: None,
            static_watts: 10.0,
            dynamic_watts: 8.0,
            total_tasks: None,
        }
    }
}

impl WorkloadModel {
    pub fn with_rate_per_core(mut self, rate: f64) -> Self {
        self.rate_per_core = rate;
        self
    }

    pub fn with_contention(mut self, contention: f64) -> Self {
        self.contention = contention;
        self
    }

    pub fn with_input_rate(mut self, rate: f64) -> Self {
        self.input_rate = Some(rate);
        self
    }

    pub fn with_total_tasks(mut self, tasks: u64) -> Self {
        self.total_tasks = Some(tasks);
        self
    }
}

#[derive(Debug)]
struct SimState {
    topology: Topology,
    model: WorkloadModel,
    clock: ManualClock,
    last_advance: Duration,

    placement: Vec<usize>,
    frequencies: Vec<u64>,
    governors: Vec<Governor>,
    modulation: Vec<f64>,
    online: Vec<bool>,

    energy: f64,
    energy_base: f64,
    interval_tasks: f64,
    interval_busy: f64,
    completed: f64,

    calls: Vec<Call>,
    fail_frequency: bool,
    fail_reconfigure: bool,
    dropped_samples: usize,
}

impl SimState {
    fn new(topology: Topology, model: WorkloadModel, clock: ManualClock) -> Self {
        let max = topology.max_frequency().unwrap_or(0);
        let vcs = topology
            .virtual_cores
            .iter()
            .map(|vc| vc.id + 1)
            .max()
            .unwrap_or(0);
        Self {
            frequencies: vec![max; topology.domains.len()],
            governors: vec![Governor::Ondemand; topology.domains.len()],
            modulation: vec![100.0; vcs],
            online: vec![true; vcs],
            last_advance: clock.now(),
            topology,
            model,
            clock,
            placement: Vec::new(),
            energy: 0.0,
            energy_base: 0.0,
            interval_tasks: 0.0,
            interval_busy: 0.0,
            completed: 0.0,
            calls: Vec::new(),
            fail_frequency: false,
            fail_reconfigure: false,
            dropped_samples: 0,
        }
    }

    fn distinct_placement(&self) -> Vec<usize> {
        let set: BTreeSet<usize> = self.placement.iter().copied().collect();
        set.into_iter().collect()
    }

    fn domain_of(&self, vc: usize) -> Option<usize> {
        self.topology.virtual_core(vc).map(|v| v.domain)
    }

    /// Relative speed of a virtual core: frequency share times duty cycle.
    fn speed(&self, vc: usize) -> f64 {
        let fmax = self.topology.max_frequency().unwrap_or(1).max(1) as f64;
        let f = self
            .domain_of(vc)
            .map(|d| self.frequencies[d] as f64)
            .unwrap_or(fmax);
        f / fmax * self.modulation.get(vc).copied().unwrap_or(100.0) / 100.0
    }

    fn capacity(&self) -> f64 {
        let active = self.distinct_placement();
        if active.is_empty() {
            return 0.0;
        }
        let n = active.len() as f64;
        let p = self.topology.used_physical_cores(&active) as f64;
        let m = &self.model;
        let e = p + m.ht_gain * (n - p);
        let usl = e / (1.0 + m.contention * (e - 1.0) + m.coherency * e * (e - 1.0));
        let speed = active.iter().map(|&vc| self.speed(vc)).sum::<f64>() / n;
        m.rate_per_core * usl * speed
    }

    fn throughput(&self) -> f64 {
        if self.finished() {
            return 0.0;
        }
        let cap = self.capacity();
        match self.model.input_rate {
            Some(rate) => cap.min(rate),
            None => cap,
        }
    }

    fn load(&self) -> f64 {
        let cap = self.capacity();
        if cap <= 0.0 {
            0.0
        } else {
            (self.throughput() / cap).min(1.0)
        }
    }

    fn power(&self) -> f64 {
        let fmax = self.topology.max_frequency().unwrap_or(1).max(1);
        let vmax = self.topology.voltage(fmax);
        let load = self.load();
        let mut watts = self.model.static_watts * self.topology.domains.len() as f64;
        let active = self.distinct_placement();
        for vc in &self.topology.virtual_cores {
            if !self.online.get(vc.id).copied().unwrap_or(false) {
                continue;
            }
            let f = self.frequencies[vc.domain];
            let v = self.topology.voltage(f) / vmax;
            let scale = f as f64 / fmax as f64 * v * v;
            if active.contains(&vc.id) {
                let duty = self.modulation[vc.id] / 100.0;
                watts += self.model.dynamic_watts * scale * duty * (0.3 + 0.7 * load);
            } else {
                // idle but online
                watts += 0.05 * self.model.dynamic_watts * scale;
            }
        }
        watts
    }

    fn finished(&self) -> bool {
        self.model
            .total_tasks
            .is_some_and(|t| self.completed >= t as f64)
    }

    /// Integrate tasks and energy up to the clock's current time.
    fn advance(&mut self) {
        let now = self.clock.now();
        let dt = now.saturating_sub(self.last_advance).as_secs_f64();
        self.last_advance = now;
        if dt <= 0.0 {
            return;
        }
        let mut tasks = self.throughput() * dt;
        if let Some(total) = self.model.total_tasks {
            tasks = tasks.min((total as f64 - self.completed).max(0.0));
        }
        self.energy += self.power() * dt;
        self.interval_busy += self.load() * dt * self.placement.len() as f64;
        self.interval_tasks += tasks;
        self.completed += tasks;
    }
}

/// Shared state behind the simulated hardware and worker pool.
#[derive(Debug, Clone)]
pub struct SimulatedMachine {
    state: Arc<Mutex<SimState>>,
    clock: ManualClock,
}

impl SimulatedMachine {
    pub fn new(topology: Topology, model: WorkloadModel) -> Self {
        let clock = ManualClock::new();
        Self {
            state: Arc::new(Mutex::new(SimState::new(topology, model, clock.clone()))),
            clock,
        }
    }

    /// A hardware handle; all handles share this machine's state.
    pub fn hardware(&self) -> SimulatedHardware {
        SimulatedHardware {
            topology: self.state.lock().topology.clone(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn workers(&self) -> SimulatedWorkers {
        SimulatedWorkers {
            state: Arc::clone(&self.state),
        }
    }

    /// The clock driving this machine.
    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make every following frequency change fail.
    pub fn fail_frequency_changes(&self, fail: bool) {
        self.state.lock().fail_frequency = fail;
    }

    /// Make every following worker reconfiguration time out.
    pub fn fail_reconfigurations(&self, fail: bool) {
        self.state.lock().fail_reconfigure = fail;
    }

    /// Report the next `count` worker samples as missing.
    pub fn drop_samples(&self, count: usize) {
        self.state.lock().dropped_samples += count;
    }

    /// Swap the workload, e.g. to emulate interference from a co-runner.
    pub fn set_model(&self, model: WorkloadModel) {
        let mut s = self.state.lock();
        s.advance();
        s.model = model;
    }

    /// Tasks completed so far.
    pub fn completed_tasks(&self) -> f64 {
        let mut s = self.state.lock();
        s.advance();
        s.completed
    }

    /// Throughput the current placement and frequencies would sustain.
    pub fn capacity(&self) -> f64 {
        self.state.lock().capacity()
    }

    /// Current power draw.
    pub fn watts(&self) -> f64 {
        self.state.lock().power()
    }

    pub fn frequency(&self, domain: usize) -> Option<u64> {
        self.state.lock().frequencies.get(domain).copied()
    }

    pub fn governor(&self, domain: usize) -> Option<Governor> {
        self.state.lock().governors.get(domain).copied()
    }

    pub fn placement(&self) -> Vec<usize> {
        self.state.lock().placement.clone()
    }
}

/// [`Hardware`] view of a [`SimulatedMachine`].
#[derive(Debug)]
pub struct SimulatedHardware {
    topology: Topology,
    state: Arc<Mutex<SimState>>,
}

impl Hardware for SimulatedHardware {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn set_governor(&mut self, domain: usize, governor: Governor) -> Result<()> {
        let mut s = self.state.lock();
        s.advance();
        s.calls.push(Call::SetGovernor(domain, governor));
        match s.governors.get_mut(domain) {
            Some(g) => {
                *g = governor;
                Ok(())
            }
            None => Err(TuneError::actuation(
                KnobType::Frequency,
                format!("no frequency domain {domain}"),
            )),
        }
    }

    fn set_frequency(&mut self, domain: usize, khz: u64) -> Result<()> {
        let mut s = self.state.lock();
        s.advance();
        s.calls.push(Call::SetFrequency(domain, khz));
        if s.fail_frequency {
            return Err(TuneError::actuation(
                KnobType::Frequency,
                "simulated write failure",
            ));
        }
        let supported = s
            .topology
            .domains
            .get(domain)
            .is_some_and(|d| d.frequencies.contains(&khz));
        if !supported {
            return Err(TuneError::actuation(
                KnobType::Frequency,
                format!("{khz} kHz not available on domain {domain}"),
            ));
        }
        s.frequencies[domain] = khz;
        Ok(())
    }

    fn set_clock_modulation(&mut self, virtual_core: usize, percent: f64) -> Result<()> {
        let mut s = self.state.lock();
        s.advance();
        s.calls.push(Call::SetClockModulation(virtual_core, percent));
        match s.modulation.get_mut(virtual_core) {
            Some(m) => {
                *m = percent.clamp(0.0, 100.0);
                Ok(())
            }
            None => Err(TuneError::actuation(
                KnobType::ClockModulation,
                format!("no virtual core {virtual_core}"),
            )),
        }
    }

    fn hotplug(&mut self, virtual_core: usize, online: bool) -> Result<()> {
        let mut s = self.state.lock();
        s.advance();
        s.calls.push(Call::Hotplug(virtual_core, online));
        let pluggable = s
            .topology
            .virtual_core(virtual_core)
            .is_some_and(|vc| vc.hotpluggable);
        if !pluggable {
            return Err(TuneError::actuation(
                KnobType::VirtualCores,
                format!("virtual core {virtual_core} is not hot-pluggable"),
            ));
        }
        s.online[virtual_core] = online;
        Ok(())
    }

    fn is_online(&self, virtual_core: usize) -> bool {
        self.state
            .lock()
            .online
            .get(virtual_core)
            .copied()
            .unwrap_or(false)
    }

    fn read_joules(&mut self) -> Result<f64> {
        let mut s = self.state.lock();
        s.advance();
        Ok(s.energy - s.energy_base)
    }

    fn reset_energy(&mut self) -> Result<()> {
        let mut s = self.state.lock();
        s.advance();
        s.energy_base = s.energy;
        Ok(())
    }
}

/// [`WorkerPool`] view of a [`SimulatedMachine`].
#[derive(Debug, Clone)]
pub struct SimulatedWorkers {
    state: Arc<Mutex<SimState>>,
}

impl WorkerPool for SimulatedWorkers {
    fn max_workers(&self) -> usize {
        self.state.lock().topology.num_virtual_cores()
    }

    fn wait_for_start(&self, _timeout: Duration) -> bool {
        true
    }

    fn sample(&self) -> Option<PoolSample> {
        let mut s = self.state.lock();
        s.advance();
        let tasks = s.interval_tasks.floor();
        let busy = s.interval_busy;
        // keep the fractional task for the next interval
        s.interval_tasks -= tasks;
        s.interval_busy = 0.0;
        if s.dropped_samples > 0 {
            s.dropped_samples -= 1;
            return None;
        }
        Some(PoolSample {
            tasks: tasks as u64,
            busy: Duration::from_secs_f64(busy.max(0.0)),
            active_workers: s.placement.len(),
        })
    }

    fn reconfigure(&self, placement: &[usize], timeout: Duration) -> Result<()> {
        let mut s = self.state.lock();
        s.advance();
        s.calls.push(Call::Reconfigure(placement.to_vec()));
        if s.fail_reconfigure {
            return Err(TuneError::Quiescence(timeout));
        }
        if let Some(&vc) = placement
            .iter()
            .find(|&&vc| !s.online.get(vc).copied().unwrap_or(false))
        {
            return Err(TuneError::AffinityFailed(vc));
        }
        s.placement = placement.to_vec();
        Ok(())
    }

    fn is_finished(&self) -> bool {
        let mut s = self.state.lock();
        s.advance();
        s.finished()
    }
}
