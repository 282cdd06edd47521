//! The decision unit: calibrate models, pick a configuration, keep it.
//!
//! # States
//!
//! ```text
//!            ready                 low error, contract met
//! Seeding ----------> Validating -------------------------> Steady
//!    ^                   |  ^ otherwise                        |
//!    |                   +--+ (refine, re-pick)                |
//!    +---------------------------------------------------------+
//!         contract violated (clear or retain models)
//! ```
//!
//! Each call to [`Selector::decide`] consumes the smoothed sample of the
//! configuration currently applied. While seeding, the [`Explorer`] supplies
//! points until both predictors are ready. Validation applies the predicted
//! best configuration and compares the observation with the prediction; it
//! ends once the prediction is accurate and the contract is met there, or
//! no configuration is predicted to meet it. Exceeding the step bound, or a
//! model failure, ends the episode at the best configuration observed so far.
//!
//! The Li-Martinez strategy has no models: a bisection over cores and
//! frequency runs in the seeding state and the episode ends at the cheapest
//! configuration it saw meeting the floor.
//!
//! # Selection
//!
//! Among configurations predicted feasible (with the conservativeness
//! margin), throughput floors and utilization bands minimize power and power
//! budgets maximize throughput. A band is predicted as the current arrival
//! rate over the predicted capacity. When none is feasible, the one closest
//! to the requirement is chosen and the contract is reported infeasible.

mod bisection;

use crate::config::{
    Contract, ExplorationStrategy, Parameters, PredictionStrategy, RecalibrationPolicy,
};
use crate::configuration::Configuration;
use crate::error::{Result, TuneError};
use crate::explorer::Explorer;
use crate::hardware::Hardware;
use crate::knob::{KnobType, KnobsValues, KNOB_NUM};
use crate::predictor::{Predictor, PredictorTarget};
use crate::sample::Sample;
use crate::stats::CalibrationStats;
use bisection::Bisection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Phase of the calibration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    /// Gathering the points the predictors need.
    Seeding,
    /// Checking the predicted best configuration against observations.
    Validating,
    /// Configuration trusted until the contract breaks.
    Steady,
}

/// Tracks the requirement a contract imposes as the run progresses.
#[derive(Debug, Clone)]
pub struct ContractState {
    contract: Contract,
    start: Duration,
    remaining: f64,
}

impl ContractState {
    pub fn new(contract: Contract, start: Duration) -> Self {
        let remaining = match &contract {
            Contract::CompletionTime { expected_tasks, .. } => *expected_tasks as f64,
            _ => 0.0,
        };
        Self {
            contract,
            start,
            remaining,
        }
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn record_tasks(&mut self, tasks: f64) {
        self.remaining = (self.remaining - tasks).max(0.0);
    }

    pub fn remaining_tasks(&self) -> f64 {
        self.remaining
    }

    /// Throughput floor (performance contracts), watt ceiling (power budget)
    /// or utilization ceiling (utilization band).
    ///
    /// For a completion time contract this is the remaining tasks over the
    /// remaining time, or `f64::MAX` once the deadline has passed.
    pub fn required(&self, now: Duration) -> f64 {
        match &self.contract {
            Contract::None => 0.0,
            Contract::Throughput { target } => *target,
            Contract::PowerBudget { watts } => *watts,
            Contract::Utilization { upper, .. } => *upper,
            Contract::CompletionTime { seconds, .. } => {
                let deadline = self.start + Duration::from_secs_f64(seconds.max(0.0));
                if now >= deadline {
                    f64::MAX
                } else {
                    self.remaining / (deadline - now).as_secs_f64()
                }
            }
        }
    }
}

/// Predicted metrics of a configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub values: KnobsValues,
    pub primary: f64,
    pub secondary: f64,
}

#[derive(Debug, Clone, Default)]
struct Episode {
    start: Duration,
    steps: u64,
    tasks: f64,
    joules: f64,
    observed: Vec<Prediction>,
}

#[derive(Debug, Clone)]
struct InterferencePlan {
    points: Vec<KnobsValues>,
    next: usize,
}

/// What the primary metric has to satisfy.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Goal {
    /// Throughput at least the requirement.
    Floor,
    /// Watts at most the requirement.
    Ceiling,
    /// Utilization percentage inside `[lower, upper]`.
    Band { lower: f64, upper: f64 },
}

impl Goal {
    fn of(contract: &Contract) -> Self {
        match *contract {
            Contract::PowerBudget { .. } => Goal::Ceiling,
            Contract::Utilization { lower, upper } => Goal::Band { lower, upper },
            _ => Goal::Floor,
        }
    }

    /// Models for the primary and the secondary metric.
    fn targets(self) -> (PredictorTarget, PredictorTarget) {
        match self {
            Goal::Ceiling => (PredictorTarget::Power, PredictorTarget::Throughput),
            _ => (PredictorTarget::Throughput, PredictorTarget::Power),
        }
    }
}

/// Utilization of a configuration with `capacity` tasks/s under `arrival`.
fn utilization(arrival: f64, capacity: f64) -> f64 {
    if capacity > 0.0 {
        arrival / capacity * 100.0
    } else {
        f64::INFINITY
    }
}

/// Predictors plus the points that train them.
#[derive(Debug, Clone)]
struct Models {
    primary: Predictor,
    secondary: Predictor,
    explorer: Explorer,
    interference: Option<InterferencePlan>,
}

impl Models {
    /// Half the cores, all the cores, then one core; only for the USL model
    /// with a free core count.
    fn interference_plan<H: Hardware>(
        &mut self,
        configuration: &Configuration<H>,
        current: &KnobsValues,
    ) -> Option<InterferencePlan> {
        self.primary.as_usl_mut()?;
        let cores = configuration.knob(KnobType::VirtualCores);
        if !cores.auto_find() {
            return None;
        }
        let ht = current[KnobType::Hyperthreading].max(1.0);
        let physical = configuration.topology().num_physical_cores() as f64;
        let max = cores
            .allowed_values()
            .iter()
            .copied()
            .filter(|&c| c <= physical * ht)
            .fold(0.0, f64::max);
        let half = (max / 2.0).floor().max(1.0);
        if max < 3.0 || half <= 1.0 {
            return None;
        }
        let points = [half, max, 1.0]
            .into_iter()
            .map(|n| {
                let mut v = current.clone();
                v[KnobType::VirtualCores] = n;
                v
            })
            .collect();
        Some(InterferencePlan { points, next: 0 })
    }
}

#[derive(Debug, Clone)]
enum Engine {
    Models(Box<Models>),
    Bisection(Bisection),
}

fn error_percent(observed: f64, predicted: f64) -> f64 {
    if observed.abs() < f64::EPSILON {
        if predicted.abs() < f64::EPSILON {
            0.0
        } else {
            100.0
        }
    } else {
        ((observed - predicted) / observed).abs() * 100.0
    }
}

/// Calibration and selection for one managed computation.
#[derive(Debug, Clone)]
pub struct Selector {
    goal: Goal,
    engine: Engine,
    state: CalibrationState,
    policy: RecalibrationPolicy,
    max_primary_error: f64,
    max_secondary_error: f64,
    margin: f64,
    max_steps: u64,
    required: f64,
    arrival: f64,
    episode: Episode,
    calibrations: Vec<CalibrationStats>,
    expected: Option<Prediction>,
    chosen: Option<KnobsValues>,
    infeasible: bool,
}

impl Selector {
    /// Build the predictors and explorer `params` ask for.
    ///
    /// # Errors
    ///
    /// `TuneError::InvalidParameters` for contract `None` (nothing to select),
    /// Li-Martinez without a throughput floor, bad calibration points or
    /// unusable learned profiles.
    pub fn new<H: Hardware>(
        params: &Parameters,
        configuration: &Configuration<H>,
        now: Duration,
    ) -> Result<Self> {
        if params.contract == Contract::None {
            return Err(TuneError::InvalidParameters(
                "contract `none` needs no selector".into(),
            ));
        }
        let goal = Goal::of(&params.contract);
        let calibration = &params.calibration;
        let mut max_steps = calibration.max_steps as u64;

        let engine = if params.prediction == PredictionStrategy::LiMartinez {
            if goal != Goal::Floor {
                return Err(TuneError::InvalidParameters(
                    "li_martinez needs a throughput or completion time contract".into(),
                ));
            }
            Engine::Bisection(Bisection::new(configuration))
        } else {
            let (primary_target, secondary_target) = goal.targets();
            let primary =
                Predictor::new(params.prediction, primary_target, params, configuration)?;
            let secondary =
                Predictor::new(params.prediction, secondary_target, params, configuration)?;

            let free = configuration.free_knobs();
            let mut explorer = Explorer::new(params.exploration, free, calibration.seed);
            let mapping = configuration.knob(KnobType::Mapping);
            if params.explore_mapping_fully && mapping.auto_find() {
                explorer =
                    Explorer::multiple(explorer, KnobType::Mapping, mapping.allowed_values().len());
            }
            let mut explorer = explorer.with_additional_points(calibration.points.iter().cloned())?;

            if params.prediction == PredictionStrategy::FullSearch {
                let combinations = configuration.all_real_combinations();
                // initial points: a reset queues them again
                explorer = explorer.with_additional_points(
                    combinations.iter().map(|c| configuration.to_relative(c)),
                )?;
                max_steps = max_steps.max(combinations.len() as u64 + 1);
            }
            Engine::Models(Box::new(Models {
                primary,
                secondary,
                explorer,
                interference: None,
            }))
        };

        debug!(
            prediction = ?params.prediction,
            exploration = ?params.exploration,
            free = ?configuration.free_knobs(),
            "selector ready"
        );
        Ok(Self {
            goal,
            engine,
            state: CalibrationState::Seeding,
            policy: params.recalibration,
            max_primary_error: calibration.max_primary_error,
            max_secondary_error: calibration.max_secondary_error,
            margin: calibration.conservativeness / 100.0,
            max_steps,
            required: 0.0,
            arrival: 0.0,
            episode: Episode {
                start: now,
                ..Episode::default()
            },
            calibrations: Vec::new(),
            expected: None,
            chosen: None,
            infeasible: false,
        })
    }

    /// A selector for an explicit exploration strategy, mostly for tests.
    pub fn with_exploration<H: Hardware>(
        params: &Parameters,
        exploration: ExplorationStrategy,
        configuration: &Configuration<H>,
        now: Duration,
    ) -> Result<Self> {
        let params = Parameters {
            exploration,
            ..params.clone()
        };
        Self::new(&params, configuration, now)
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn is_calibrating(&self) -> bool {
        self.state != CalibrationState::Steady
    }

    /// Completed calibration episodes.
    pub fn calibrations(&self) -> &[CalibrationStats] {
        &self.calibrations
    }

    /// Whether the last selection found no configuration meeting the contract.
    pub fn contract_infeasible(&self) -> bool {
        self.infeasible
    }

    /// Prediction for the configuration being validated, if any.
    pub fn expected(&self) -> Option<&Prediction> {
        self.expected.as_ref()
    }

    /// Account one tick of work to the running calibration episode.
    pub fn record_tick(&mut self, tasks: f64, joules: f64) {
        if self.is_calibrating() {
            self.episode.tasks += tasks;
            self.episode.joules += joules;
        }
    }

    fn models(&self) -> Option<&Models> {
        match &self.engine {
            Engine::Models(m) => Some(&**m),
            Engine::Bisection(_) => None,
        }
    }

    fn models_mut(&mut self) -> Option<&mut Models> {
        match &mut self.engine {
            Engine::Models(m) => Some(&mut **m),
            Engine::Bisection(_) => None,
        }
    }

    fn primary_value(&self, sample: &Sample) -> f64 {
        match self.goal {
            Goal::Floor => sample.maximum_throughput(),
            Goal::Ceiling => sample.watts,
            Goal::Band { .. } => sample.load_percentage,
        }
    }

    fn secondary_value(&self, sample: &Sample) -> f64 {
        match self.goal {
            Goal::Ceiling => sample.maximum_throughput(),
            _ => sample.watts,
        }
    }

    fn feasible(&self, primary: f64, margin: f64) -> bool {
        match self.goal {
            Goal::Floor => primary * (1.0 - margin) >= self.required,
            Goal::Ceiling => primary * (1.0 + margin) <= self.required,
            Goal::Band { lower, upper } => primary >= lower && primary * (1.0 + margin) <= upper,
        }
    }

    fn feasible_observed(&self, primary: f64) -> bool {
        self.feasible(primary, 0.0)
    }

    fn better_secondary(&self, a: f64, b: f64) -> bool {
        match self.goal {
            Goal::Ceiling => a > b,
            _ => a < b,
        }
    }

    /// Closer to the requirement on the primary metric.
    fn smaller_shortfall(&self, a: f64, b: f64) -> bool {
        match self.goal {
            Goal::Floor => a > b,
            Goal::Ceiling => a < b,
            Goal::Band { lower, upper } => {
                let outside = |p: f64| (lower - p).max(p - upper).max(0.0);
                outside(a) < outside(b)
            }
        }
    }

    /// Best of `candidates` under `margin`; sets the infeasibility flag.
    fn pick<'a>(
        &mut self,
        candidates: impl Iterator<Item = &'a Prediction>,
        margin: f64,
    ) -> Option<Prediction> {
        let mut feasible: Option<&Prediction> = None;
        let mut closest: Option<&Prediction> = None;
        for c in candidates {
            if self.feasible(c.primary, margin) {
                let better = feasible.map_or(true, |f| {
                    self.better_secondary(c.secondary, f.secondary)
                        || (c.secondary == f.secondary && self.smaller_shortfall(c.primary, f.primary))
                });
                if better {
                    feasible = Some(c);
                }
            }
            if closest.map_or(true, |b| self.smaller_shortfall(c.primary, b.primary)) {
                closest = Some(c);
            }
        }
        self.infeasible = feasible.is_none() && closest.is_some();
        feasible.or(closest).cloned()
    }

    /// Fit both models and predict every legal combination.
    fn predict_best<H: Hardware>(&mut self, configuration: &Configuration<H>) -> Result<Prediction> {
        let topology = configuration.topology();
        let (goal, arrival) = (self.goal, self.arrival);
        let models = self
            .models_mut()
            .ok_or_else(|| TuneError::Model("no prediction model".into()))?;
        models.primary.prepare(topology)?;
        models.secondary.prepare(topology)?;

        let predictions: Vec<Prediction> = configuration
            .all_real_combinations()
            .iter()
            .filter_map(|values| {
                let mut primary = models.primary.predict(values, topology).ok()?;
                if let Goal::Band { .. } = goal {
                    primary = utilization(arrival, primary);
                }
                let secondary = models.secondary.predict(values, topology).ok()?;
                Some(Prediction {
                    values: values.clone(),
                    primary,
                    secondary,
                })
            })
            .collect();
        self.pick(predictions.iter(), self.margin)
            .ok_or_else(|| TuneError::Model("no configuration could be predicted".into()))
    }

    /// Next configuration to apply, given the smoothed sample of the current
    /// one and the contract requirement at this tick.
    ///
    /// Model failures are recovered internally; the returned values are
    /// relative for explorer points and real otherwise.
    pub fn decide<H: Hardware>(
        &mut self,
        configuration: &Configuration<H>,
        sample: &Sample,
        required: f64,
        now: Duration,
    ) -> KnobsValues {
        self.required = required;
        if sample.throughput > 0.0 {
            self.arrival = sample.throughput;
        }
        let current = configuration.real_values();
        match self.state {
            CalibrationState::Steady => self.steady(configuration, &current, sample, now),
            CalibrationState::Seeding => {
                self.observe(configuration, &current, sample);
                self.seed(configuration, &current, sample, now)
            }
            CalibrationState::Validating => {
                self.observe(configuration, &current, sample);
                self.validate(configuration, &current, sample, now)
            }
        }
    }

    fn observe<H: Hardware>(
        &mut self,
        configuration: &Configuration<H>,
        current: &KnobsValues,
        sample: &Sample,
    ) {
        self.episode.steps += 1;
        let observed = Prediction {
            values: current.clone(),
            primary: self.primary_value(sample),
            secondary: self.secondary_value(sample),
        };
        self.episode.observed.push(observed);
        if let Some(m) = self.models_mut() {
            let topology = configuration.topology();
            if m.interference.is_none() {
                m.primary.refine(current, sample, topology);
            }
            m.secondary.refine(current, sample, topology);
        }
    }

    fn seed<H: Hardware>(
        &mut self,
        configuration: &Configuration<H>,
        current: &KnobsValues,
        sample: &Sample,
        now: Duration,
    ) -> KnobsValues {
        if let Some(values) = self.bisect(current, sample, now) {
            return values;
        }
        if let Some(values) = self.interference_step(configuration, current, sample) {
            return values;
        }
        let ready = self
            .models()
            .is_some_and(|m| m.primary.is_ready() && m.secondary.is_ready());
        if ready {
            return self.start_validation(configuration, now);
        }
        if self.episode.steps >= self.max_steps {
            warn!(steps = self.episode.steps, "models not ready within the step bound");
            return self.fallback(now);
        }
        if let Some(m) = self.models_mut() {
            return m.explorer.next_relative();
        }
        self.fallback(now)
    }

    /// One bisection step. `None` unless the model-free search is in use.
    fn bisect(&mut self, current: &KnobsValues, sample: &Sample, now: Duration) -> Option<KnobsValues> {
        let feasible = self.feasible_observed(self.primary_value(sample));
        let Engine::Bisection(search) = &mut self.engine else {
            return None;
        };
        let next = search.step(current, feasible, sample.watts);
        Some(match next {
            Some(values) if self.episode.steps < self.max_steps => values,
            Some(_) => {
                warn!(steps = self.episode.steps, "calibration step bound reached");
                self.fallback(now)
            }
            None => self.fallback(now),
        })
    }

    /// Drive the interference protocol. `None` once it is over (or absent).
    fn interference_step<H: Hardware>(
        &mut self,
        configuration: &Configuration<H>,
        current: &KnobsValues,
        sample: &Sample,
    ) -> Option<KnobsValues> {
        let m = self.models_mut()?;
        let plan = m.interference.as_mut()?;
        let usl = m.primary.as_usl_mut()?;

        let recorded = usl.update_interference(current, sample, configuration.topology());
        let outcome = match recorded {
            Ok(()) if plan.next < plan.points.len() => {
                let values = plan.points[plan.next].clone();
                plan.next += 1;
                return Some(values);
            }
            Ok(()) => usl.update_coefficients(),
            Err(e) => Err(e),
        };
        m.interference = None;
        match outcome {
            Ok(()) => info!("scalability model updated for interference"),
            Err(e) => {
                warn!(%e, "interference update failed, recalibrating from scratch");
                m.primary.clear();
                m.secondary.clear();
                m.explorer.reset();
            }
        }
        None
    }

    fn start_validation<H: Hardware>(
        &mut self,
        configuration: &Configuration<H>,
        now: Duration,
    ) -> KnobsValues {
        self.state = CalibrationState::Validating;
        match self.predict_best(configuration) {
            Ok(best) => {
                debug!(
                    values = %best.values,
                    primary = best.primary,
                    secondary = best.secondary,
                    infeasible = self.infeasible,
                    "validating predicted configuration"
                );
                self.expected = Some(best.clone());
                best.values
            }
            Err(e) => {
                warn!(%e, "prediction failed, using best observed configuration");
                self.fallback(now)
            }
        }
    }

    fn validate<H: Hardware>(
        &mut self,
        configuration: &Configuration<H>,
        current: &KnobsValues,
        sample: &Sample,
        now: Duration,
    ) -> KnobsValues {
        let observed = self.primary_value(sample);
        // an accurate model may still land just short of the requirement
        let met = |s: &Self| s.feasible_observed(observed) || s.infeasible;
        let at_expected = self
            .expected
            .as_ref()
            .is_some_and(|e| e.values.key() == current.key());
        if let Some(expected) = self.expected.as_ref().filter(|_| at_expected) {
            let primary_error = error_percent(observed, expected.primary);
            let secondary_error = error_percent(self.secondary_value(sample), expected.secondary);
            let accurate = primary_error <= self.max_primary_error
                && secondary_error <= self.max_secondary_error;
            debug!(primary_error, secondary_error, met = met(self), "prediction error");
            if accurate && met(self) {
                return self.finish(current.clone(), now);
            }
        }
        if self.episode.steps >= self.max_steps {
            warn!(steps = self.episode.steps, "calibration step bound reached");
            return self.fallback(now);
        }
        match self.predict_best(configuration) {
            // the refined model insists on what was just observed
            Ok(best) if at_expected && best.values.key() == current.key() && met(self) => {
                self.finish(current.clone(), now)
            }
            Ok(best) => {
                self.expected = Some(best.clone());
                best.values
            }
            Err(e) => {
                warn!(%e, "prediction failed, using best observed configuration");
                self.fallback(now)
            }
        }
    }

    fn steady<H: Hardware>(
        &mut self,
        configuration: &Configuration<H>,
        current: &KnobsValues,
        sample: &Sample,
        now: Duration,
    ) -> KnobsValues {
        if self.feasible_observed(self.primary_value(sample)) {
            self.infeasible = false;
            return current.clone();
        }
        if self.infeasible && self.chosen.as_ref().is_some_and(|c| c.key() == current.key()) {
            debug!(required = self.required, "contract infeasible, keeping closest configuration");
            return current.clone();
        }

        info!(
            required = self.required,
            observed = self.primary_value(sample),
            policy = ?self.policy,
            "contract violated, recalibrating"
        );
        self.episode = Episode {
            start: now,
            ..Episode::default()
        };
        self.expected = None;
        self.state = CalibrationState::Seeding;

        let retain = self.policy == RecalibrationPolicy::Retain;
        match &mut self.engine {
            Engine::Bisection(search) => *search = Bisection::new(configuration),
            Engine::Models(m) if retain => {
                if let Some(plan) = m.interference_plan(configuration, current) {
                    let first = plan.points[0].clone();
                    m.interference = Some(InterferencePlan { next: 1, ..plan });
                    self.episode.steps += 1;
                    return first;
                }
            }
            Engine::Models(m) => {
                m.primary.clear();
                m.secondary.clear();
                m.explorer.reset();
            }
        }
        self.observe(configuration, current, sample);
        self.seed(configuration, current, sample, now)
    }

    /// End the episode at the best configuration observed in it.
    fn fallback(&mut self, now: Duration) -> KnobsValues {
        let observed = std::mem::take(&mut self.episode.observed);
        let best = self.pick(observed.iter(), 0.0).map(|p| p.values);
        self.episode.observed = observed;
        match best {
            Some(values) => self.finish(values, now),
            None => {
                // nothing observed yet: keep whatever is applied
                self.state = CalibrationState::Steady;
                self.end_episode(now);
                self.chosen
                    .clone()
                    .unwrap_or_else(|| KnobsValues::relative([100.0; KNOB_NUM]))
            }
        }
    }

    fn finish(&mut self, values: KnobsValues, now: Duration) -> KnobsValues {
        self.state = CalibrationState::Steady;
        self.expected = None;
        self.chosen = Some(values.clone());
        self.end_episode(now);
        info!(
            values = %values,
            infeasible = self.infeasible,
            calibrations = self.calibrations.len(),
            "calibration finished"
        );
        values
    }

    fn end_episode(&mut self, now: Duration) {
        let e = std::mem::take(&mut self.episode);
        self.calibrations.push(CalibrationStats {
            num_steps: e.steps,
            duration: now.saturating_sub(e.start),
            num_tasks: e.tasks,
            joules: e.joules,
        });
        self.episode.start = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KnobSettings;
    use crate::predictor::testing::sample;
    use crate::sim::{SimulatedHardware, SimulatedMachine, WorkloadModel};
    use crate::topology::Topology;

    fn configuration(params: &Parameters) -> (SimulatedMachine, Configuration<SimulatedHardware>) {
        let m = SimulatedMachine::new(
            Topology::synthetic(1, 8, 1, vec![1_000_000, 1_500_000, 2_000_000]),
            WorkloadModel::default(),
        );
        let c = Configuration::new(params, m.hardware(), 8).unwrap();
        (m, c)
    }

    #[test]
    fn test_required_bandwidth_from_deadline() {
        let mut s = ContractState::new(
            Contract::CompletionTime {
                seconds: 20.0,
                expected_tasks: 1500,
            },
            Duration::ZERO,
        );
        s.record_tasks(500.0);
        assert_eq!(s.remaining_tasks(), 1000.0);
        assert!((s.required(Duration::from_secs(10)) - 100.0).abs() < 1e-9);
        assert_eq!(s.required(Duration::from_secs(20)), f64::MAX);
        assert_eq!(s.required(Duration::from_secs(25)), f64::MAX);

        let band = ContractState::new(
            Contract::Utilization {
                lower: 60.0,
                upper: 85.0,
            },
            Duration::ZERO,
        );
        assert_eq!(band.required(Duration::from_secs(3)), 85.0);
    }

    #[test]
    fn test_none_contract_has_no_selector() {
        let params = Parameters::new();
        let (_m, c) = configuration(&params);
        assert!(Selector::new(&params, &c, Duration::ZERO).is_err());
    }

    #[test]
    fn test_infeasible_floor_selects_max_throughput() {
        let params = Parameters::new()
            .with_contract(Contract::Throughput { target: 100.0 })
            .with_prediction(PredictionStrategy::Analytical);
        let (m, mut c) = configuration(&params);
        let workers = m.workers();
        c.max_all_knobs(&workers).unwrap();
        let max = c.real_values();

        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();
        let observed = sample(60.0, 50.0);

        let next = s.decide(&c, &observed, 100.0, Duration::from_secs(1));
        assert_eq!(c.to_real(&next), max);
        assert!(s.contract_infeasible());
        assert_eq!(s.state(), CalibrationState::Validating);

        // prediction matches the observation: done, and it stays put
        let next = s.decide(&c, &observed, 100.0, Duration::from_secs(2));
        assert_eq!(c.to_real(&next), max);
        assert_eq!(s.state(), CalibrationState::Steady);
        for t in 3..10 {
            let next = s.decide(&c, &observed, 100.0, Duration::from_secs(t));
            assert_eq!(c.to_real(&next), max);
            assert_eq!(s.state(), CalibrationState::Steady);
        }
        assert!(s.contract_infeasible());
        assert_eq!(s.calibrations().len(), 1);
    }

    #[test]
    fn test_feasible_floor_minimizes_power() {
        let params = Parameters::new()
            .with_contract(Contract::Throughput { target: 100.0 })
            .with_knobs(KnobSettings::default().with_frequency(false))
            .with_prediction(PredictionStrategy::Analytical);
        let (m, mut c) = configuration(&params);
        c.max_all_knobs(&m.workers()).unwrap();

        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();
        // 8 cores give 400 tasks/s: two cores are enough
        let next = s.decide(&c, &sample(400.0, 80.0), 100.0, Duration::from_secs(1));
        assert_eq!(c.to_real(&next)[KnobType::VirtualCores], 2.0);
        assert!(!s.contract_infeasible());
    }

    #[test]
    fn test_steady_recalibrates_on_violation() {
        let params = Parameters::new()
            .with_contract(Contract::Throughput { target: 100.0 })
            .with_knobs(KnobSettings::default().with_frequency(false))
            .with_prediction(PredictionStrategy::Analytical);
        let (m, mut c) = configuration(&params);
        let w = m.workers();
        c.max_all_knobs(&w).unwrap();
        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();

        let next = s.decide(&c, &sample(400.0, 80.0), 100.0, Duration::from_secs(1));
        c.set_values(&next, &w).unwrap();
        s.decide(&c, &sample(100.0, 20.0), 100.0, Duration::from_secs(2));
        assert_eq!(s.state(), CalibrationState::Steady);

        // interference halves throughput
        s.decide(&c, &sample(50.0, 20.0), 100.0, Duration::from_secs(3));
        assert_ne!(s.state(), CalibrationState::Steady);
        assert_eq!(s.calibrations().len(), 1);
    }

    #[test]
    fn test_step_bound_falls_back_to_best_observed() {
        let mut params = Parameters::new()
            .with_contract(Contract::Throughput { target: 100.0 })
            .with_prediction(PredictionStrategy::Regression);
        params.calibration.max_steps = 1;
        let (m, mut c) = configuration(&params);
        c.max_all_knobs(&m.workers()).unwrap();
        let current = c.real_values();
        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();

        let next = s.decide(&c, &sample(80.0, 40.0), 100.0, Duration::from_secs(3));
        assert_eq!(next, current);
        assert_eq!(s.state(), CalibrationState::Steady);
        assert!(s.contract_infeasible());
        let stats = &s.calibrations()[0];
        assert_eq!(stats.num_steps, 1);
        assert_eq!(stats.duration, Duration::from_secs(3));
    }

    #[test]
    fn test_full_search_visits_every_combination() {
        let mut params = Parameters::new()
            .with_contract(Contract::Throughput { target: 150.0 })
            .with_knobs(KnobSettings::default().with_frequency(false))
            .with_prediction(PredictionStrategy::FullSearch);
        params.calibration.max_steps = 1;
        let (m, mut c) = configuration(&params);
        let w = m.workers();
        c.max_all_knobs(&w).unwrap();
        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();
        // every combination plus the validation step
        assert_eq!(s.max_steps, 9);

        let mut now = 0;
        while s.is_calibrating() {
            now += 1;
            let cores = c.real_values()[KnobType::VirtualCores];
            let observed = sample(50.0 * cores, 10.0 * cores);
            let next = s.decide(&c, &observed, 150.0, Duration::from_secs(now));
            c.set_values(&next, &w).unwrap();
            assert!(now < 20, "calibration must terminate");
        }
        assert_eq!(c.real_values()[KnobType::VirtualCores], 3.0);
        assert!(!s.contract_infeasible());
    }

    #[test]
    fn test_retained_scalability_model_runs_interference_plan() {
        let mut params = Parameters::new()
            .with_contract(Contract::Throughput { target: 150.0 })
            .with_knobs(KnobSettings::default().with_frequency(false))
            .with_prediction(PredictionStrategy::Usl);
        params.recalibration = RecalibrationPolicy::Retain;
        let (m, mut c) = configuration(&params);
        let w = m.workers();
        c.max_all_knobs(&w).unwrap();
        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();

        let truth = |cores: f64, scale: f64| {
            let x = scale * 50.0 * cores / (1.0 + 0.01 * (cores - 1.0));
            sample(x, 10.0 * cores)
        };
        let mut now = 0;
        while s.is_calibrating() {
            now += 1;
            let cores = c.real_values()[KnobType::VirtualCores];
            let next = s.decide(&c, &truth(cores, 1.0), 150.0, Duration::from_secs(now));
            c.set_values(&next, &w).unwrap();
            assert!(now < 40, "calibration must terminate");
        }

        // external load: throughput drops to a fifth
        let mut visited = Vec::new();
        for _ in 0..3 {
            now += 1;
            let cores = c.real_values()[KnobType::VirtualCores];
            let next = s.decide(&c, &truth(cores, 0.2), 150.0, Duration::from_secs(now));
            assert_eq!(s.state(), CalibrationState::Seeding);
            visited.push(c.to_real(&next)[KnobType::VirtualCores]);
            c.set_values(&next, &w).unwrap();
        }
        assert_eq!(visited, vec![4.0, 8.0, 1.0]);

        let next = s.decide(&c, &truth(1.0, 0.2), 150.0, Duration::from_secs(now + 1));
        assert_eq!(s.state(), CalibrationState::Validating);
        assert!(s
            .models_mut()
            .and_then(|m| m.primary.as_usl_mut())
            .is_some_and(|usl| usl.coefficients().is_some()));
        // nothing reaches 150 any more: the fastest configuration is chosen
        assert_eq!(c.to_real(&next)[KnobType::VirtualCores], 8.0);
        assert!(s.contract_infeasible());
    }

    /// Drive `s` until it leaves calibration, sampling `truth` at whatever
    /// configuration is applied. Returns the real values it asked for.
    fn calibrate(
        s: &mut Selector,
        c: &mut Configuration<SimulatedHardware>,
        w: &crate::sim::SimulatedWorkers,
        truth: impl Fn(&KnobsValues) -> Sample,
        required: f64,
        now: &mut u64,
    ) -> Vec<KnobsValues> {
        let mut visited = Vec::new();
        loop {
            *now += 1;
            let observed = truth(&c.real_values());
            let next = s.decide(c, &observed, required, Duration::from_secs(*now));
            visited.push(c.to_real(&next));
            c.set_values(&next, w).unwrap();
            if !s.is_calibrating() {
                return visited;
            }
            assert!(*now < 100, "calibration must terminate");
        }
    }

    #[test]
    fn test_validation_keeps_searching_below_the_floor() {
        let params = Parameters::new()
            .with_contract(Contract::Throughput { target: 100.0 })
            .with_knobs(KnobSettings::default().with_frequency(false))
            .with_prediction(PredictionStrategy::Analytical);
        let (m, mut c) = configuration(&params);
        let w = m.workers();
        c.max_all_knobs(&w).unwrap();
        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();

        let next = s.decide(&c, &sample(400.0, 80.0), 100.0, Duration::from_secs(1));
        assert_eq!(c.to_real(&next)[KnobType::VirtualCores], 2.0);
        c.set_values(&next, &w).unwrap();

        // within 3% of the prediction, but short of the floor
        let next = s.decide(&c, &sample(97.0, 20.0), 100.0, Duration::from_secs(2));
        assert_eq!(s.state(), CalibrationState::Validating);
        assert!(!s.contract_infeasible());
        assert!(s.calibrations().is_empty());
        assert_eq!(c.to_real(&next)[KnobType::VirtualCores], 3.0);
        c.set_values(&next, &w).unwrap();

        s.decide(&c, &sample(145.5, 30.0), 100.0, Duration::from_secs(3));
        assert_eq!(s.state(), CalibrationState::Steady);
        assert_eq!(c.real_values()[KnobType::VirtualCores], 3.0);
    }

    #[test]
    fn test_full_search_recalibration_revisits_every_combination() {
        let params = Parameters::new()
            .with_contract(Contract::Throughput { target: 150.0 })
            .with_knobs(KnobSettings::default().with_frequency(false))
            .with_prediction(PredictionStrategy::FullSearch);
        assert_eq!(params.recalibration, RecalibrationPolicy::Clear);
        let (m, mut c) = configuration(&params);
        let w = m.workers();
        c.max_all_knobs(&w).unwrap();
        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();

        let cores = |v: &KnobsValues| v[KnobType::VirtualCores];
        let mut now = 0;
        let truth = |v: &KnobsValues| sample(50.0 * cores(v), 10.0 * cores(v));
        calibrate(&mut s, &mut c, &w, truth, 150.0, &mut now);
        assert_eq!(cores(&c.real_values()), 3.0);

        // every core now delivers half as much
        let slower = |v: &KnobsValues| sample(25.0 * cores(v), 10.0 * cores(v));
        let visited = calibrate(&mut s, &mut c, &w, slower, 150.0, &mut now);
        let visited: Vec<f64> = visited.iter().map(cores).collect();
        assert_eq!(visited[..8], [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(visited.last(), Some(&6.0));
        assert_eq!(cores(&c.real_values()), 6.0);
        assert_eq!(s.calibrations().len(), 2);
        assert!(!s.contract_infeasible());
    }

    #[test]
    fn test_utilization_band_minimizes_power_inside_band() {
        let params = Parameters::new()
            .with_contract(Contract::Utilization {
                lower: 60.0,
                upper: 85.0,
            })
            .with_knobs(KnobSettings::default().with_frequency(false))
            .with_prediction(PredictionStrategy::Analytical);
        let (m, mut c) = configuration(&params);
        let w = m.workers();
        c.max_all_knobs(&w).unwrap();
        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();

        // 200 tasks/s arrive; 8 cores could serve 800
        let loaded = |throughput: f64, load: f64, watts: f64| Sample {
            load_percentage: load,
            ..sample(throughput, watts)
        };
        let next = s.decide(&c, &loaded(200.0, 25.0, 80.0), 85.0, Duration::from_secs(1));
        // 200/c percent: only three cores land inside [60, 85]
        assert_eq!(c.to_real(&next)[KnobType::VirtualCores], 3.0);
        assert!(!s.contract_infeasible());
        c.set_values(&next, &w).unwrap();

        s.decide(&c, &loaded(200.0, 200.0 / 3.0, 30.0), 85.0, Duration::from_secs(2));
        assert_eq!(s.state(), CalibrationState::Steady);

        // still inside the band: nothing to do
        let next = s.decide(&c, &loaded(200.0, 70.0, 30.0), 85.0, Duration::from_secs(3));
        assert_eq!(next, c.real_values());
        assert_eq!(s.state(), CalibrationState::Steady);

        // idle workers: the band is left from below
        s.decide(&c, &loaded(100.0, 33.0, 30.0), 85.0, Duration::from_secs(4));
        assert_ne!(s.state(), CalibrationState::Steady);
    }

    /// 50 tasks/s per core per GHz; power grows with frequency squared.
    fn frequency_truth(v: &KnobsValues) -> Sample {
        let cores = v[KnobType::VirtualCores];
        let ghz = v[KnobType::Frequency] / 1e6;
        sample(50.0 * cores * ghz, cores * (2.0 + ghz * ghz) + 5.0)
    }

    fn li_martinez(target: f64) -> Parameters {
        Parameters::new()
            .with_contract(Contract::Throughput { target })
            .with_prediction(PredictionStrategy::LiMartinez)
    }

    #[test]
    fn test_li_martinez_settles_on_cheapest_feasible_configuration() {
        let params = li_martinez(300.0);
        let (m, mut c) = configuration(&params);
        let w = m.workers();
        c.max_all_knobs(&w).unwrap();
        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();
        assert!(s.models().is_none());

        let mut now = 0;
        let visited = calibrate(&mut s, &mut c, &w, frequency_truth, 300.0, &mut now);
        // three cores at 2 GHz meet the floor, four at 1.5 GHz do it cheaper
        let last = c.real_values();
        assert_eq!(last[KnobType::VirtualCores], 4.0);
        assert_eq!(last[KnobType::Frequency], 1_500_000.0);
        assert_eq!(visited.len(), 9);
        assert!(!s.contract_infeasible());
        assert_eq!(s.calibrations()[0].num_steps, 9);

        // steady while the floor holds
        let next = s.decide(&c, &frequency_truth(&last), 300.0, Duration::from_secs(now + 1));
        assert_eq!(next, last);
        assert_eq!(s.state(), CalibrationState::Steady);
    }

    #[test]
    fn test_li_martinez_unreachable_floor_keeps_maximum() {
        let params = li_martinez(1_000.0);
        let (m, mut c) = configuration(&params);
        let w = m.workers();
        c.max_all_knobs(&w).unwrap();
        let max = c.real_values();
        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();

        let next = s.decide(&c, &frequency_truth(&max), 1_000.0, Duration::from_secs(1));
        assert_eq!(next, max);
        assert_eq!(s.state(), CalibrationState::Steady);
        assert!(s.contract_infeasible());
    }

    #[test]
    fn test_li_martinez_respects_step_bound() {
        let mut params = li_martinez(300.0);
        params.calibration.max_steps = 3;
        let (m, mut c) = configuration(&params);
        let w = m.workers();
        c.max_all_knobs(&w).unwrap();
        let mut s = Selector::new(&params, &c, Duration::ZERO).unwrap();

        let mut now = 0;
        calibrate(&mut s, &mut c, &w, frequency_truth, 300.0, &mut now);
        // 8, 4 and 2 cores at 2 GHz were tried; 4 is the cheapest that met the floor
        assert_eq!(c.real_values()[KnobType::VirtualCores], 4.0);
        assert_eq!(c.real_values()[KnobType::Frequency], 2_000_000.0);
        assert_eq!(s.calibrations()[0].num_steps, 3);
    }

    #[test]
    fn test_li_martinez_needs_a_floor() {
        let params = Parameters::new()
            .with_contract(Contract::PowerBudget { watts: 50.0 })
            .with_prediction(PredictionStrategy::LiMartinez);
        let (_m, c) = configuration(&params);
        assert!(matches!(
            Selector::new(&params, &c, Duration::ZERO),
            Err(TuneError::InvalidParameters(_))
        ));
    }
}
