//! Models estimating throughput or power at configurations not yet tried.
//!
//! Every model follows the same cycle:
//!
//! 1. [`Predictor::refine`] after each observed configuration,
//! 2. [`Predictor::prepare`] once per batch of refinements (repeat calls
//!    without new data do nothing),
//! 3. [`Predictor::predict`] for any real [`KnobsValues`].
//!
//! Observations are keyed by the exact real values; observing the same
//! configuration again updates its running average instead of adding a row.
//!
//! # Variants
//!
//! | Variant | Needs | Notes |
//! |---------|-------|-------|
//! | `Regression` | features + 1 points | service-time / power feature models |
//! | `Analytical` | 1 point | scaling law from the latest observation |
//! | `Usl` | 3 distinct core counts | throughput only; 3-call interference update |
//! | `FullSearch` | every combination | fails on unobserved configurations |
//! | `PerMapping` | every mapping ready | one regression per mapping |
//! | `Learned` | a few points | ridge mix of known application profiles |

mod analytical;
mod full_search;
mod learned;
pub mod linalg;
mod mapping;
mod regression;
mod usl;

pub use analytical::AnalyticalModel;
pub use full_search::FullSearchModel;
pub use learned::LearnedModel;
pub use mapping::PerMappingModel;
pub use regression::{Feature, RegressionModel};
pub use usl::UslModel;

use crate::config::{Parameters, PredictionStrategy};
use crate::configuration::Configuration;
use crate::error::{Result, TuneError};
use crate::hardware::Hardware;
use crate::knob::{KnobType, KnobsValues};
use crate::sample::Sample;
use crate::topology::Topology;
use std::collections::VecDeque;

/// Metric a predictor estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorTarget {
    /// Tasks per second the configuration can sustain (higher is better).
    Throughput,
    /// Watts (lower is better).
    Power,
}

impl PredictorTarget {
    /// The observed value of this metric in a smoothed sample.
    pub fn response(self, sample: &Sample) -> f64 {
        match self {
            PredictorTarget::Throughput => sample.maximum_throughput(),
            PredictorTarget::Power => sample.watts,
        }
    }
}

/// Averaged response at one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub values: KnobsValues,
    pub response: f64,
    pub count: u32,
}

/// Observations in arrival order, at most one per configuration.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    items: VecDeque<Observation>,
    limit: Option<usize>,
}

impl Observations {
    /// Keep at most `limit` configurations, evicting the oldest.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            limit: limit.filter(|&l| l > 0),
        }
    }

    pub fn record(&mut self, values: &KnobsValues, response: f64) {
        let key = values.key();
        if let Some(o) = self.items.iter_mut().find(|o| o.values.key() == key) {
            o.count += 1;
            o.response += (response - o.response) / o.count as f64;
            return;
        }
        self.items.push_back(Observation {
            values: values.clone(),
            response,
            count: 1,
        });
        if let Some(limit) = self.limit {
            while self.items.len() > limit {
                self.items.pop_front();
            }
        }
    }

    pub fn get(&self, values: &KnobsValues) -> Option<&Observation> {
        let key = values.key();
        self.items.iter().find(|o| o.values.key() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// One of the prediction models, dispatched by variant.
#[derive(Debug, Clone)]
pub enum Predictor {
    Regression(RegressionModel),
    Analytical(AnalyticalModel),
    Usl(UslModel),
    FullSearch(FullSearchModel),
    PerMapping(PerMappingModel),
    Learned(LearnedModel),
}

impl Predictor {
    /// Build the model `strategy` selects for `target` on this configuration.
    ///
    /// The universal scalability law only describes throughput; power under
    /// that strategy is modeled by regression.
    pub fn new<H: Hardware>(
        strategy: PredictionStrategy,
        target: PredictorTarget,
        params: &Parameters,
        configuration: &Configuration<H>,
    ) -> Result<Self> {
        let free = configuration.free_knobs();
        let topology = configuration.topology();
        let aging = params.calibration.regression_aging;
        let regression = || {
            RegressionModel::new(target, free, topology, params.unused_cores)
                .with_aging(aging)
        };

        Ok(match strategy {
            PredictionStrategy::Analytical => {
                Predictor::Analytical(AnalyticalModel::new(target, false, 0.0))
            }
            PredictionStrategy::AnalyticalFull => Predictor::Analytical(AnalyticalModel::new(
                target,
                true,
                params.calibration.static_power_watts,
            )),
            PredictionStrategy::Regression => Predictor::Regression(regression()),
            PredictionStrategy::RegressionMapping => Predictor::PerMapping(PerMappingModel::new(
                configuration.knob(KnobType::Mapping).allowed_values(),
                regression,
            )),
            PredictionStrategy::Usl => match target {
                PredictorTarget::Throughput => Predictor::Usl(UslModel::new()),
                PredictorTarget::Power => Predictor::Regression(regression()),
            },
            PredictionStrategy::FullSearch => Predictor::FullSearch(FullSearchModel::new(
                target,
                configuration.all_real_combinations().len(),
            )),
            PredictionStrategy::Learned => Predictor::Learned(LearnedModel::new(
                target,
                &params.calibration.learned_profiles,
                configuration.all_real_combinations(),
            )?),
            PredictionStrategy::LiMartinez => {
                return Err(TuneError::InvalidParameters(
                    "li_martinez searches without a prediction model".into(),
                ))
            }
        })
    }

    /// Discard all fitted state and observations.
    pub fn clear(&mut self) {
        match self {
            Predictor::Regression(m) => m.clear(),
            Predictor::Analytical(m) => m.clear(),
            Predictor::Usl(m) => m.clear(),
            Predictor::FullSearch(m) => m.clear(),
            Predictor::PerMapping(m) => m.clear(),
            Predictor::Learned(m) => m.clear(),
        }
    }

    /// Incorporate the smoothed sample observed at real `values`.
    pub fn refine(&mut self, values: &KnobsValues, sample: &Sample, topology: &Topology) {
        match self {
            Predictor::Regression(m) => m.refine(values, sample, topology),
            Predictor::Analytical(m) => m.refine(values, sample),
            Predictor::Usl(m) => m.refine(values, sample, topology),
            Predictor::FullSearch(m) => m.refine(values, sample),
            Predictor::PerMapping(m) => m.refine(values, sample, topology),
            Predictor::Learned(m) => m.refine(values, sample),
        }
    }

    /// Distinct observations needed before predictions are meaningful.
    pub fn minimum_points(&self) -> usize {
        match self {
            Predictor::Regression(m) => m.minimum_points(),
            Predictor::Analytical(_) => 1,
            Predictor::Usl(_) => UslModel::MINIMUM_POINTS,
            Predictor::FullSearch(m) => m.minimum_points(),
            Predictor::PerMapping(m) => m.minimum_points(),
            Predictor::Learned(m) => m.minimum_points(),
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Predictor::Regression(m) => m.is_ready(),
            Predictor::Analytical(m) => m.is_ready(),
            Predictor::Usl(m) => m.is_ready(),
            Predictor::FullSearch(m) => m.is_ready(),
            Predictor::PerMapping(m) => m.is_ready(),
            Predictor::Learned(m) => m.is_ready(),
        }
    }

    /// Fit the accumulated observations. A no-op when nothing changed.
    ///
    /// # Errors
    ///
    /// `TuneError::Model` when the model is not ready or cannot be fitted.
    pub fn prepare(&mut self, topology: &Topology) -> Result<()> {
        match self {
            Predictor::Regression(m) => m.prepare(topology),
            Predictor::Analytical(m) => m.prepare(),
            Predictor::Usl(m) => m.prepare(),
            Predictor::FullSearch(_) => Ok(()),
            Predictor::PerMapping(m) => m.prepare(topology),
            Predictor::Learned(m) => m.prepare(),
        }
    }

    /// Estimate the target metric at real `values`.
    pub fn predict(&self, values: &KnobsValues, topology: &Topology) -> Result<f64> {
        match self {
            Predictor::Regression(m) => m.predict(values, topology),
            Predictor::Analytical(m) => m.predict(values, topology),
            Predictor::Usl(m) => m.predict(values, topology),
            Predictor::FullSearch(m) => m.predict(values),
            Predictor::PerMapping(m) => m.predict(values, topology),
            Predictor::Learned(m) => m.predict(values),
        }
    }

    /// The USL model, for the interference update protocol.
    pub fn as_usl_mut(&mut self) -> Option<&mut UslModel> {
        match self {
            Predictor::Usl(m) => Some(m),
            _ => None,
        }
    }
}
