//! Linear regression over physically motivated features.
//!
//! Throughput is fitted as service time (`1 / throughput`), which is close to
//! linear in `1/f` and `1/(f * cores)`. Power is fitted over the dynamic term
//! `cores * f * V^2` and the voltage of used and idle frequency domains.
//! Only features whose inputs actually vary are used, so the design matrix
//! has no constant columns besides the intercept.

use super::linalg::least_squares;
use super::{Observations, PredictorTarget};
use crate::config::UnusedCores;
use crate::error::{Result, TuneError};
use crate::knob::{KnobType, KnobsValues, MappingType, KNOB_NUM};
use crate::sample::Sample;
use crate::topology::Topology;
use nalgebra::DVector;
use tracing::debug;

/// Columns of the design matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Intercept,
    /// `f_min / f_eff`
    InverseFrequency,
    /// `f_min / (f_eff * physical cores)`
    InverseFrequencyCores,
    /// `f_min / (f_eff * contexts)`
    InverseFrequencyContexts,
    /// `contexts * f[GHz] * V^2 * duty`
    Dynamic,
    /// `V * used domains`
    UsedDomains,
    /// `V_min * idle domains`
    IdleDomains,
}

#[derive(Debug, Clone)]
pub struct RegressionModel {
    target: PredictorTarget,
    features: Vec<Feature>,
    observations: Observations,
    coefficients: Option<DVector<f64>>,
    dirty: bool,
}

impl RegressionModel {
    /// Pick the features for `target` given which knobs are free.
    pub fn new(
        target: PredictorTarget,
        free: [bool; KNOB_NUM],
        topology: &Topology,
        unused: UnusedCores,
    ) -> Self {
        let is_free = |k: KnobType| free[k.index()];
        let speed = is_free(KnobType::Frequency) || is_free(KnobType::ClockModulation);
        let cores = is_free(KnobType::VirtualCores);
        let ht = is_free(KnobType::Hyperthreading);
        let spread = (cores || is_free(KnobType::Mapping)) && topology.domains.len() > 1;

        let mut features = vec![Feature::Intercept];
        match target {
            PredictorTarget::Throughput => {
                if speed {
                    features.push(Feature::InverseFrequency);
                }
                if cores || ht {
                    features.push(Feature::InverseFrequencyCores);
                }
                if cores && ht {
                    features.push(Feature::InverseFrequencyContexts);
                }
            }
            PredictorTarget::Power => {
                if speed || cores || ht {
                    features.push(Feature::Dynamic);
                }
                if is_free(KnobType::Frequency) || spread {
                    features.push(Feature::UsedDomains);
                }
                if unused != UnusedCores::None && spread && is_free(KnobType::Frequency) {
                    features.push(Feature::IdleDomains);
                }
            }
        }

        Self {
            target,
            features,
            observations: Observations::default(),
            coefficients: None,
            dirty: false,
        }
    }

    /// Keep only the most recent `limit` configurations (0 keeps all).
    pub fn with_aging(mut self, limit: usize) -> Self {
        self.observations = Observations::with_limit(Some(limit));
        self
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn observations(&self) -> &Observations {
        &self.observations
    }

    /// The row of the design matrix for real `values`.
    pub fn row(&self, values: &KnobsValues, topology: &Topology) -> Vec<f64> {
        let contexts = values[KnobType::VirtualCores].max(1.0);
        let placement = topology.placement(
            MappingType::from_value(values[KnobType::Mapping]),
            values[KnobType::Hyperthreading].max(1.0) as usize,
            contexts as usize,
        );
        let physical = topology.used_physical_cores(&placement).max(1) as f64;
        let f = values[KnobType::Frequency].max(1.0);
        let duty = (values[KnobType::ClockModulation] / 100.0).clamp(0.01, 1.0);
        let f_eff = f * duty;
        let f_min = topology.min_frequency().map(|m| m as f64).unwrap_or(f);
        let volts = topology.voltage(f as u64);
        let used = topology.used_domains(&placement).len() as f64;
        let idle = topology.domains.len() as f64 - used;

        self.features
            .iter()
            .map(|feature| match feature {
                Feature::Intercept => 1.0,
                Feature::InverseFrequency => f_min / f_eff,
                Feature::InverseFrequencyCores => f_min / (f_eff * physical),
                Feature::InverseFrequencyContexts => f_min / (f_eff * contexts),
                Feature::Dynamic => contexts * f / 1e6 * volts * volts * duty,
                Feature::UsedDomains => volts * used,
                Feature::IdleDomains => topology.voltage(f_min as u64) * idle,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.coefficients = None;
        self.dirty = false;
    }

    pub fn refine(&mut self, values: &KnobsValues, sample: &Sample, _topology: &Topology) {
        let observed = self.target.response(sample);
        let response = match self.target {
            PredictorTarget::Throughput if observed > 0.0 => 1.0 / observed,
            PredictorTarget::Throughput => return,
            PredictorTarget::Power => observed.max(0.0),
        };
        self.observations.record(values, response);
        self.dirty = true;
    }

    pub fn minimum_points(&self) -> usize {
        self.features.len() + 1
    }

    pub fn is_ready(&self) -> bool {
        self.observations.len() >= self.minimum_points()
    }

    /// Solve the least squares problem.
    ///
    /// Collinear observations (e.g. all at one frequency) leave the design
    /// matrix rank deficient; the minimum-norm solution is used then.
    pub fn prepare(&mut self, topology: &Topology) -> Result<()> {
        if !self.dirty && self.coefficients.is_some() {
            return Ok(());
        }
        if !self.is_ready() {
            return Err(TuneError::Model(format!(
                "regression needs {} configurations, has {}",
                self.minimum_points(),
                self.observations.len()
            )));
        }

        let rows: Vec<Vec<f64>> = self
            .observations
            .iter()
            .map(|o| self.row(&o.values, topology))
            .collect();
        let ys: Vec<f64> = self.observations.iter().map(|o| o.response).collect();

        let fit = least_squares(&rows, &ys)
            .ok_or_else(|| TuneError::Model("regression system cannot be solved".into()))?;
        if !fit.is_full_rank() {
            debug!(
                rank = fit.rank,
                features = self.features.len(),
                "rank deficient design matrix"
            );
        }
        self.coefficients = Some(fit.coefficients);
        self.dirty = false;
        Ok(())
    }

    pub fn predict(&self, values: &KnobsValues, topology: &Topology) -> Result<f64> {
        let c = self
            .coefficients
            .as_ref()
            .ok_or_else(|| TuneError::Model("regression used before prepare".into()))?;
        let y = DVector::from_vec(self.row(values, topology)).dot(c);
        match self.target {
            PredictorTarget::Throughput if y > 0.0 => Ok(1.0 / y),
            PredictorTarget::Throughput => Err(TuneError::Model(format!(
                "non-positive service time predicted for {values}"
            ))),
            PredictorTarget::Power => Ok(y.max(0.0)),
        }
    }
}
