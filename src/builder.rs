//! Layered construction of [`Parameters`].
//!
//! The builder supports multiple configuration sources using figment:
//! - Default values
//! - Config files (TOML, YAML, JSON)
//! - Environment variables
//! - Programmatic overrides
//! - CLI arguments via clap

use crate::config::{
    CalibrationSettings, Contract, ExplorationStrategy, KnobSettings, Parameters,
    PredictionStrategy, SamplingSettings,
};
use crate::error::Result;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use std::path::{Path, PathBuf};

/// Builder for [`Parameters`].
///
/// Configuration sources are merged in the following order (later sources override earlier):
/// 1. Default values
/// 2. Config files (in order added)
/// 3. Environment variables
/// 4. Programmatic overrides and CLI arguments, in call order
///
/// # Examples
///
/// ```ignore
/// use tuneloop::{Contract, ParametersBuilder};
///
/// let params = ParametersBuilder::new()
///     .file("tuneloop.toml")
///     .env_prefix("TUNELOOP")
///     .contract(Contract::Throughput { target: 250.0 })
///     .build()?;
/// ```
#[derive(Debug)]
pub struct ParametersBuilder {
    figment: Figment,
}

impl Default for ParametersBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ParametersBuilder {
    /// Create a new builder with default parameters.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(Parameters::default())),
        }
    }

    /// Add a configuration file.
    ///
    /// Supports TOML, YAML, and JSON formats (detected by extension, TOML
    /// otherwise). Files are merged in the order they are added; a missing
    /// file contributes nothing.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        self.figment = match extension.to_lowercase().as_str() {
            "yaml" | "yml" => self.figment.merge(Yaml::file(path)),
            "json" => self.figment.merge(Json::file(path)),
            _ => self.figment.merge(Toml::file(path)),
        };
        self
    }

    /// Add environment variables with a prefix.
    ///
    /// Variables are read as `{PREFIX}_{KEY}` with `__` separating nested
    /// keys, e.g. `TUNELOOP_SMOOTHING_WINDOW=5` or
    /// `TUNELOOP_KNOBS__FREQUENCY=false`.
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        self.figment = self
            .figment
            .merge(Env::prefixed(&format!("{prefix}_")).split("__"));
        self
    }

    fn set<T: serde::Serialize>(mut self, key: &str, value: T) -> Self {
        self.figment = self.figment.merge(Serialized::default(key, value));
        self
    }

    /// Set the metric and thread name prefix.
    pub fn prefix(self, prefix: impl Into<String>) -> Self {
        self.set("prefix", prefix.into())
    }

    pub fn contract(self, contract: Contract) -> Self {
        self.set("contract", contract)
    }

    pub fn knobs(self, knobs: KnobSettings) -> Self {
        self.set("knobs", knobs)
    }

    pub fn prediction(self, prediction: PredictionStrategy) -> Self {
        self.set("prediction", prediction)
    }

    pub fn exploration(self, exploration: ExplorationStrategy) -> Self {
        self.set("exploration", exploration)
    }

    pub fn sampling(self, sampling: SamplingSettings) -> Self {
        self.set("sampling", sampling)
    }

    pub fn calibration(self, calibration: CalibrationSettings) -> Self {
        self.set("calibration", calibration)
    }

    /// Apply CLI argument overrides.
    ///
    /// The file named by `--tune-config` is merged first, then every value
    /// that was given on the command line.
    pub fn with_cli_args(mut self, args: &TuneArgs) -> Self {
        if let Some(ref path) = args.tune_config {
            self = self.file(path);
        }
        if let Some(ref prefix) = args.tune_prefix {
            self = self.prefix(prefix.clone());
        }
        if let Some(contract) = args.contract() {
            self = self.contract(contract);
        }
        if let Some(prediction) = args.tune_prediction {
            self = self.prediction(prediction);
        }
        if let Some(exploration) = args.tune_exploration {
            self = self.exploration(exploration);
        }
        if let Some(max) = args.tune_max_cores {
            self = self.set("knobs.max_cores", max);
        }
        if let Some(frequency) = args.tune_frequency {
            self = self.set("knobs.frequency", frequency);
        }
        if let Some(seed) = args.tune_seed {
            self = self.set("calibration.seed", seed);
        }
        self
    }

    /// Extract and validate the parameters.
    ///
    /// # Errors
    ///
    /// `TuneError::Config` if a source cannot be read or does not match the
    /// parameter schema; `TuneError::InvalidParameters` if validation fails.
    pub fn build(self) -> Result<Parameters> {
        let params: Parameters = self.figment.extract().map_err(Box::new)?;
        params.validate()?;
        Ok(params)
    }
}

/// CLI arguments for tuning parameters.
///
/// Flatten into an application's clap parser and apply with
/// [`ParametersBuilder::with_cli_args`].
///
/// # Examples
///
/// ```ignore
/// use clap::Parser;
/// use tuneloop::{ParametersBuilder, TuneArgs};
///
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     tune: TuneArgs,
/// }
///
/// let args = MyArgs::parse();
/// let params = ParametersBuilder::new().with_cli_args(&args.tune).build()?;
/// ```
#[derive(Debug, Default, Clone, clap::Args)]
pub struct TuneArgs {
    /// Parameters file (TOML, YAML or JSON)
    #[arg(long)]
    pub tune_config: Option<PathBuf>,

    /// Metric and thread name prefix
    #[arg(long)]
    pub tune_prefix: Option<String>,

    /// Required throughput in tasks per second
    #[arg(long, conflicts_with_all = ["tune_power_budget", "tune_deadline", "tune_utilization"])]
    pub tune_throughput: Option<f64>,

    /// Power budget in watts
    #[arg(long, conflicts_with_all = ["tune_deadline", "tune_utilization"])]
    pub tune_power_budget: Option<f64>,

    /// Utilization band in percent, as LOWER,UPPER
    #[arg(long, value_delimiter = ',', num_args = 1, conflicts_with = "tune_deadline")]
    pub tune_utilization: Option<Vec<f64>>,

    /// Seconds to complete the expected tasks in
    #[arg(long, requires = "tune_expected_tasks")]
    pub tune_deadline: Option<f64>,

    /// Tasks the computation will run
    #[arg(long)]
    pub tune_expected_tasks: Option<u64>,

    #[arg(long, value_enum)]
    pub tune_prediction: Option<PredictionStrategy>,

    #[arg(long, value_enum)]
    pub tune_exploration: Option<ExplorationStrategy>,

    /// Never use more workers than this
    #[arg(long)]
    pub tune_max_cores: Option<usize>,

    /// Tune the CPU frequency (true/false)
    #[arg(long)]
    pub tune_frequency: Option<bool>,

    /// Seed for random exploration
    #[arg(long)]
    pub tune_seed: Option<u64>,
}

impl TuneArgs {
    /// The contract the arguments ask for, if any.
    pub fn contract(&self) -> Option<Contract> {
        if let Some(target) = self.tune_throughput {
            return Some(Contract::Throughput { target });
        }
        if let Some(watts) = self.tune_power_budget {
            return Some(Contract::PowerBudget { watts });
        }
        if let Some([lower, upper]) = self.tune_utilization.as_deref() {
            return Some(Contract::Utilization {
                lower: *lower,
                upper: *upper,
            });
        }
        match (self.tune_deadline, self.tune_expected_tasks) {
            (Some(seconds), Some(expected_tasks)) => Some(Contract::CompletionTime {
                seconds,
                expected_tasks,
            }),
            _ => None,
        }
    }
}
