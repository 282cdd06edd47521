//! Parameters of a tuning run.
//!
//! [`Parameters`] is the immutable input record of the control loop. It can be
//! deserialized from TOML, YAML, JSON or environment variables through
//! [`ParametersBuilder`](crate::builder::ParametersBuilder); every field has a
//! default so partial files are fine.
//!
//! # Example (TOML)
//!
//! ```toml
//! prediction = "regression"
//! exploration = "halton"
//!
//! [contract]
//! type = "throughput"
//! target = 2500.0
//!
//! [knobs]
//! frequency = true
//! hyperthreading = false
//! ```

use crate::error::{Result, TuneError};
use crate::knob::KnobsValues;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the tuner has to guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Contract {
    /// Run at maximum resources; no decisions.
    None,
    /// Sustain at least `target` tasks per second with minimum power.
    Throughput { target: f64 },
    /// Finish `expected_tasks` within `seconds` of the start with minimum power.
    CompletionTime { seconds: f64, expected_tasks: u64 },
    /// Stay below `watts` with maximum throughput.
    PowerBudget { watts: f64 },
    /// Keep worker utilization between `lower` and `upper` percent with
    /// minimum power.
    Utilization { lower: f64, upper: f64 },
}

impl Contract {
    /// Whether throughput is the constrained metric.
    pub fn is_performance(&self) -> bool {
        matches!(
            self,
            Contract::Throughput { .. } | Contract::CompletionTime { .. }
        )
    }

    /// Whether power is the metric minimized.
    pub fn minimizes_power(&self) -> bool {
        self.is_performance() || matches!(self, Contract::Utilization { .. })
    }
}

/// How the mapping knob is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSetting {
    /// Let the tuner choose.
    Auto,
    Linear,
    Interleaved,
}

/// Which knobs the tuner may move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobSettings {
    /// Tune the number of active workers. Default: true
    #[serde(default = "default_true")]
    pub cores: bool,

    /// Tune the number of contexts used per physical core. Default: false
    #[serde(default)]
    pub hyperthreading: bool,

    /// Placement order. Default: linear
    #[serde(default = "default_mapping")]
    pub mapping: MappingSetting,

    /// Tune the userspace frequency. Default: true
    #[serde(default = "default_true")]
    pub frequency: bool,

    /// Tune the clock modulation duty cycle. Default: false
    #[serde(default)]
    pub clock_modulation: bool,

    /// Keep turbo-boost frequency steps. Default: false
    #[serde(default)]
    pub turbo_boost: bool,

    /// Never use more workers than this.
    #[serde(default)]
    pub max_cores: Option<usize>,
}

impl Default for KnobSettings {
    fn default() -> Self {
        Self {
            cores: true,
            hyperthreading: false,
            mapping: default_mapping(),
            frequency: true,
            clock_modulation: false,
            turbo_boost: false,
            max_cores: None,
        }
    }
}

impl KnobSettings {
    pub fn with_cores(mut self, enabled: bool) -> Self {
        self.cores = enabled;
        self
    }

    pub fn with_hyperthreading(mut self, enabled: bool) -> Self {
        self.hyperthreading = enabled;
        self
    }

    pub fn with_mapping(mut self, mapping: MappingSetting) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_frequency(mut self, enabled: bool) -> Self {
        self.frequency = enabled;
        self
    }

    pub fn with_clock_modulation(mut self, enabled: bool) -> Self {
        self.clock_modulation = enabled;
        self
    }

    pub fn with_turbo_boost(mut self, enabled: bool) -> Self {
        self.turbo_boost = enabled;
        self
    }

    pub fn with_max_cores(mut self, max: usize) -> Self {
        self.max_cores = Some(max);
        self
    }
}

/// What happens to virtual cores no worker runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnusedCores {
    /// Leave them alone.
    None,
    /// Run their frequency domains at the lowest frequency.
    LowestFrequency,
    /// Lowest frequency, and take hot-pluggable ones offline.
    Off,
}

/// Model family used to predict throughput and power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStrategy {
    /// Closed-form scaling law, relative power.
    Analytical,
    /// Closed-form scaling law calibrated to absolute watts.
    AnalyticalFull,
    /// Linear regression over observed configurations.
    Regression,
    /// One regression model per mapping.
    RegressionMapping,
    /// Universal scalability law for throughput, regression for power.
    Usl,
    /// Observe every configuration.
    FullSearch,
    /// Combination of previously profiled applications.
    Learned,
    /// No model: binary search over cores, then frequency (Li and Martinez).
    LiMartinez,
}

/// How calibration points are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExplorationStrategy {
    Random,
    Halton,
    HaltonReverse,
    /// Base-2 Niederreiter sequence.
    Niederreiter,
    Sobol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingStrategy {
    /// Moving average over `smoothing_window` samples.
    Simple,
    /// Exponential moving average with factor `smoothing_alpha`.
    Exponential,
}

/// When a configuration has been observed long enough to judge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceStrategy {
    /// After `persistence_value` samples.
    Samples,
    /// After `persistence_value` completed tasks.
    Tasks,
    /// Once the coefficient of variation (percent) of both metrics drops
    /// below `persistence_value`, or the smoothing window is full.
    Variation,
}

/// Model state kept when a steady configuration stops satisfying the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecalibrationPolicy {
    /// Forget everything and calibrate from scratch.
    Clear,
    /// Keep fitted models and go straight to validation.
    Retain,
}

/// Control-loop timing, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingSettings {
    /// Tick length while calibrating. Default: 500
    #[serde(default = "default_calibration_interval_ms")]
    pub calibration_interval_ms: u64,

    /// Tick length in steady state. Default: 1000
    #[serde(default = "default_steady_interval_ms")]
    pub steady_interval_ms: u64,

    /// Pause after a reconfiguration before sampling again. Default: 100
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Bound on waiting for workers to freeze. Default: 5000
    #[serde(default = "default_freeze_timeout_ms")]
    pub freeze_timeout_ms: u64,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            calibration_interval_ms: default_calibration_interval_ms(),
            steady_interval_ms: default_steady_interval_ms(),
            cooldown_ms: default_cooldown_ms(),
            freeze_timeout_ms: default_freeze_timeout_ms(),
        }
    }
}

impl SamplingSettings {
    pub fn calibration_interval(&self) -> Duration {
        Duration::from_millis(self.calibration_interval_ms)
    }

    pub fn steady_interval(&self) -> Duration {
        Duration::from_millis(self.steady_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn freeze_timeout(&self) -> Duration {
        Duration::from_millis(self.freeze_timeout_ms)
    }
}

/// Throughput and power of one profiled application, one entry per
/// configuration in combination order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedProfile {
    pub throughput: Vec<f64>,
    pub watts: Vec<f64>,
}

/// Calibration tolerances and model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Accepted primary-metric prediction error, percent. Default: 10
    #[serde(default = "default_prediction_error")]
    pub max_primary_error: f64,

    /// Accepted secondary-metric prediction error, percent. Default: 10
    #[serde(default = "default_prediction_error")]
    pub max_secondary_error: f64,

    /// Safety margin on the contract target when selecting, percent. Default: 0
    #[serde(default)]
    pub conservativeness: f64,

    /// Configurations tried before settling for the best observed one. Default: 30
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Observations kept by regression models; 0 keeps all. Default: 0
    #[serde(default)]
    pub regression_aging: usize,

    /// Seed for random exploration; entropy when unset.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Relative points to try before any generated one.
    #[serde(default)]
    pub points: Vec<KnobsValues>,

    /// Profiles for the learned strategy.
    #[serde(default)]
    pub learned_profiles: Vec<LearnedProfile>,

    /// Per-domain static power assumed by the analytical-full model. Default: 0
    #[serde(default)]
    pub static_power_watts: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            max_primary_error: default_prediction_error(),
            max_secondary_error: default_prediction_error(),
            conservativeness: 0.0,
            max_steps: default_max_steps(),
            regression_aging: 0,
            seed: None,
            points: Vec::new(),
            learned_profiles: Vec::new(),
            static_power_watts: 0.0,
        }
    }
}

/// Everything a tuning run needs to know up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Metric and thread name prefix (default: "tuneloop")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_contract")]
    pub contract: Contract,

    #[serde(default)]
    pub knobs: KnobSettings,

    #[serde(default = "default_unused_cores")]
    pub unused_cores: UnusedCores,

    #[serde(default = "default_prediction")]
    pub prediction: PredictionStrategy,

    #[serde(default = "default_exploration")]
    pub exploration: ExplorationStrategy,

    /// Try every mapping for each generated point.
    #[serde(default)]
    pub explore_mapping_fully: bool,

    #[serde(default = "default_smoothing")]
    pub smoothing: SmoothingStrategy,

    /// Default: 10
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,

    /// Default: 0.5
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,

    #[serde(default = "default_persistence")]
    pub persistence: PersistenceStrategy,

    /// Default: 3
    #[serde(default = "default_persistence_value")]
    pub persistence_value: f64,

    #[serde(default = "default_recalibration")]
    pub recalibration: RecalibrationPolicy,

    #[serde(default)]
    pub sampling: SamplingSettings,

    #[serde(default)]
    pub calibration: CalibrationSettings,
}

fn default_true() -> bool {
    true
}

fn default_mapping() -> MappingSetting {
    MappingSetting::Linear
}

fn default_prefix() -> String {
    "tuneloop".to_string()
}

fn default_contract() -> Contract {
    Contract::None
}

fn default_unused_cores() -> UnusedCores {
    UnusedCores::None
}

fn default_prediction() -> PredictionStrategy {
    PredictionStrategy::Regression
}

fn default_exploration() -> ExplorationStrategy {
    ExplorationStrategy::Halton
}

fn default_smoothing() -> SmoothingStrategy {
    SmoothingStrategy::Simple
}

fn default_smoothing_window() -> usize {
    10
}

fn default_smoothing_alpha() -> f64 {
    0.5
}

fn default_persistence() -> PersistenceStrategy {
    PersistenceStrategy::Samples
}

fn default_persistence_value() -> f64 {
    3.0
}

fn default_recalibration() -> RecalibrationPolicy {
    RecalibrationPolicy::Clear
}

fn default_calibration_interval_ms() -> u64 {
    500
}

fn default_steady_interval_ms() -> u64 {
    1000
}

fn default_cooldown_ms() -> u64 {
    100
}

fn default_freeze_timeout_ms() -> u64 {
    5000
}

fn default_prediction_error() -> f64 {
    10.0
}

fn default_max_steps() -> usize {
    30
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            contract: default_contract(),
            knobs: KnobSettings::default(),
            unused_cores: default_unused_cores(),
            prediction: default_prediction(),
            exploration: default_exploration(),
            explore_mapping_fully: false,
            smoothing: default_smoothing(),
            smoothing_window: default_smoothing_window(),
            smoothing_alpha: default_smoothing_alpha(),
            persistence: default_persistence(),
            persistence_value: default_persistence_value(),
            recalibration: default_recalibration(),
            sampling: SamplingSettings::default(),
            calibration: CalibrationSettings::default(),
        }
    }
}

impl Parameters {
    /// Create parameters with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contract(mut self, contract: Contract) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_knobs(mut self, knobs: KnobSettings) -> Self {
        self.knobs = knobs;
        self
    }

    pub fn with_prediction(mut self, prediction: PredictionStrategy) -> Self {
        self.prediction = prediction;
        self
    }

    pub fn with_exploration(mut self, exploration: ExplorationStrategy) -> Self {
        self.exploration = exploration;
        self
    }

    /// Check every startup constraint.
    ///
    /// # Errors
    ///
    /// Returns `TuneError::InvalidParameters` naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TuneError::InvalidParameters(msg));
        let positive = |v: f64| v.is_finite() && v > 0.0;

        match self.contract {
            Contract::None => {}
            Contract::Throughput { target } if !positive(target) => {
                return invalid(format!("throughput target must be positive, got {target}"));
            }
            Contract::PowerBudget { watts } if !positive(watts) => {
                return invalid(format!("power budget must be positive, got {watts}"));
            }
            Contract::CompletionTime {
                seconds,
                expected_tasks,
            } if !positive(seconds) || expected_tasks == 0 => {
                return invalid(format!(
                    "completion time needs positive seconds and tasks, got {seconds}s for {expected_tasks} tasks"
                ));
            }
            Contract::Utilization { lower, upper }
                if !(positive(lower) && lower < upper && upper <= 100.0) =>
            {
                return invalid(format!(
                    "utilization bounds must satisfy 0 < lower < upper <= 100, got [{lower}, {upper}]"
                ));
            }
            _ => {}
        }

        if matches!(self.contract, Contract::PowerBudget { .. })
            && self.prediction == PredictionStrategy::Analytical
        {
            return invalid(
                "a power budget needs absolute power predictions; use analytical_full or a fitted model"
                    .to_string(),
            );
        }
        if self.prediction == PredictionStrategy::LiMartinez && !self.contract.is_performance() {
            return invalid(
                "li_martinez searches for a throughput floor; use a throughput or completion time contract"
                    .to_string(),
            );
        }
        if self.prediction == PredictionStrategy::Learned
            && self.calibration.learned_profiles.is_empty()
        {
            return invalid("the learned strategy needs at least one profile".to_string());
        }
        if self.smoothing_window == 0 {
            return invalid("smoothing_window must be at least 1".to_string());
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return invalid(format!(
                "smoothing_alpha must be in (0, 1], got {}",
                self.smoothing_alpha
            ));
        }
        if !self.persistence_value.is_finite() || self.persistence_value < 0.0 {
            return invalid("persistence_value must be a non-negative number".to_string());
        }
        if self.persistence == PersistenceStrategy::Samples
            && self.smoothing == SmoothingStrategy::Simple
            && self.persistence_value > self.smoothing_window as f64
        {
            return invalid(format!(
                "persisting for {} samples never ends with a window of {}",
                self.persistence_value, self.smoothing_window
            ));
        }
        if self.sampling.calibration_interval_ms == 0 || self.sampling.steady_interval_ms == 0 {
            return invalid("sampling intervals must be positive".to_string());
        }
        let cal = &self.calibration;
        if !positive(cal.max_primary_error) || !positive(cal.max_secondary_error) {
            return invalid("prediction error tolerances must be positive".to_string());
        }
        if !(0.0..100.0).contains(&cal.conservativeness) {
            return invalid("conservativeness must be in [0, 100)".to_string());
        }
        if cal.max_steps == 0 {
            return invalid("calibration.max_steps must be at least 1".to_string());
        }
        if cal.points.iter().any(|p| !p.is_relative()) {
            return invalid("calibration points must be relative".to_string());
        }
        if self.knobs.max_cores == Some(0) {
            return invalid("knobs.max_cores must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters() {
        let p = Parameters::default();
        assert_eq!(p.prefix, "tuneloop");
        assert_eq!(p.contract, Contract::None);
        assert!(p.knobs.cores);
        assert!(!p.knobs.turbo_boost);
        assert_eq!(p.smoothing_window, 10);
        assert_eq!(p.sampling.steady_interval(), Duration::from_secs(1));
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_deserialize_parameters() {
        let toml = r#"
            prefix = "farm"
            prediction = "usl"
            exploration = "halton_reverse"
            persistence = "variation"
            persistence_value = 5.0

            [contract]
            type = "completion_time"
            seconds = 60.0
            expected_tasks = 100000

            [knobs]
            hyperthreading = true
            mapping = "auto"
            max_cores = 6

            [sampling]
            steady_interval_ms = 250
        "#;

        let p: Parameters = toml::from_str(toml).unwrap();
        assert_eq!(p.prefix, "farm");
        assert_eq!(p.prediction, PredictionStrategy::Usl);
        assert_eq!(p.exploration, ExplorationStrategy::HaltonReverse);
        assert_eq!(p.persistence, PersistenceStrategy::Variation);
        assert_eq!(
            p.contract,
            Contract::CompletionTime {
                seconds: 60.0,
                expected_tasks: 100_000
            }
        );
        assert!(p.knobs.hyperthreading);
        assert!(p.knobs.frequency);
        assert_eq!(p.knobs.mapping, MappingSetting::Auto);
        assert_eq!(p.knobs.max_cores, Some(6));
        assert_eq!(p.sampling.steady_interval_ms, 250);
        assert_eq!(p.sampling.calibration_interval_ms, 500);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_contracts() {
        let p = Parameters::new().with_contract(Contract::Throughput { target: 0.0 });
        assert!(matches!(p.validate(), Err(TuneError::InvalidParameters(_))));

        let p = Parameters::new().with_contract(Contract::CompletionTime {
            seconds: 10.0,
            expected_tasks: 0,
        });
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_power_budget_needs_absolute_power() {
        let p = Parameters::new()
            .with_contract(Contract::PowerBudget { watts: 50.0 })
            .with_prediction(PredictionStrategy::Analytical);
        assert!(p.validate().is_err());

        let p = p.with_prediction(PredictionStrategy::AnalyticalFull);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unreachable_persistence() {
        let mut p = Parameters::new();
        p.smoothing_window = 5;
        p.persistence_value = 6.0;
        assert!(matches!(p.validate(), Err(TuneError::InvalidParameters(_))));

        p.persistence_value = 5.0;
        assert!(p.validate().is_ok());

        // exponential smoothing counts samples without bound
        p.persistence_value = 6.0;
        p.smoothing = SmoothingStrategy::Exponential;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_utilization_bounds() {
        let p = Parameters::new().with_contract(Contract::Utilization {
            lower: 60.0,
            upper: 80.0,
        });
        assert!(p.validate().is_ok());
        assert!(p.contract.minimizes_power());
        assert!(!p.contract.is_performance());

        for (lower, upper) in [(80.0, 60.0), (0.0, 50.0), (50.0, 120.0)] {
            let p = Parameters::new().with_contract(Contract::Utilization { lower, upper });
            assert!(p.validate().is_err(), "[{lower}, {upper}]");
        }

        let toml = r#"
            [contract]
            type = "utilization"
            lower = 70.0
            upper = 90.0
        "#;
        let p: Parameters = toml::from_str(toml).unwrap();
        assert_eq!(
            p.contract,
            Contract::Utilization {
                lower: 70.0,
                upper: 90.0
            }
        );
    }

    #[test]
    fn test_li_martinez_needs_a_throughput_floor() {
        let p = Parameters::new()
            .with_contract(Contract::PowerBudget { watts: 40.0 })
            .with_prediction(PredictionStrategy::LiMartinez);
        assert!(p.validate().is_err());

        let p = p.with_contract(Contract::Throughput { target: 40.0 });
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_learned_needs_profiles() {
        let p = Parameters::new().with_prediction(PredictionStrategy::Learned);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_calibration_points_must_be_relative() {
        let mut p = Parameters::new();
        p.calibration
            .points
            .push(KnobsValues::real([4.0, 1.0, 0.0, 2_000_000.0, 100.0]));
        assert!(p.validate().is_err());

        p.calibration.points[0] = KnobsValues::relative([50.0; 5]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_knob_settings_builder() {
        let k = KnobSettings::default()
            .with_hyperthreading(true)
            .with_mapping(MappingSetting::Interleaved)
            .with_max_cores(4);
        assert!(k.hyperthreading);
        assert_eq!(k.mapping, MappingSetting::Interleaved);
        assert_eq!(k.max_cores, Some(4));
    }
}
