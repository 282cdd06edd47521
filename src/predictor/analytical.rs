//! Closed-form scaling from a single reference observation.
//!
//! Throughput is assumed to grow linearly with effective cores and
//! effective frequency; extra hardware contexts count as a fraction of a
//! core. Power scales with `contexts * f * V^2`. The full variant only
//! scales the dynamic part, keeping the configured static power fixed.
//! Outside these assumptions the model is imprecise but always answers.

use super::PredictorTarget;
use crate::error::{Result, TuneError};
use crate::knob::{KnobType, KnobsValues, MappingType};
use crate::sample::Sample;
use crate::topology::Topology;

/// Throughput of an extra hardware context relative to a physical core.
const CONTEXT_GAIN: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct AnalyticalModel {
    target: PredictorTarget,
    full: bool,
    static_watts: f64,
    reference: Option<(KnobsValues, f64)>,
}

impl AnalyticalModel {
    pub fn new(target: PredictorTarget, full: bool, static_watts: f64) -> Self {
        Self {
            target,
            full,
            static_watts: static_watts.max(0.0),
            reference: None,
        }
    }

    pub fn clear(&mut self) {
        self.reference = None;
    }

    /// The latest observation becomes the reference.
    pub fn refine(&mut self, values: &KnobsValues, sample: &Sample) {
        let response = self.target.response(sample);
        if response > 0.0 {
            self.reference = Some((values.clone(), response));
        }
    }

    pub fn is_ready(&self) -> bool {
        self.reference.is_some()
    }

    pub fn prepare(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(TuneError::Model("no reference observation".into()))
        }
    }

    fn score(&self, values: &KnobsValues, topology: &Topology) -> f64 {
        let contexts = values[KnobType::VirtualCores].max(1.0);
        let f = values[KnobType::Frequency].max(1.0);
        let duty = (values[KnobType::ClockModulation] / 100.0).clamp(0.01, 1.0);
        match self.target {
            PredictorTarget::Throughput => {
                let placement = topology.placement(
                    MappingType::from_value(values[KnobType::Mapping]),
                    values[KnobType::Hyperthreading].max(1.0) as usize,
                    contexts as usize,
                );
                let physical = topology.used_physical_cores(&placement).max(1) as f64;
                let effective = physical + CONTEXT_GAIN * (contexts - physical).max(0.0);
                effective * f * duty
            }
            PredictorTarget::Power => {
                let v = topology.voltage(f as u64);
                contexts * f * v * v * duty
            }
        }
    }

    pub fn predict(&self, values: &KnobsValues, topology: &Topology) -> Result<f64> {
        let (reference, observed) = self
            .reference
            .as_ref()
            .ok_or_else(|| TuneError::Model("no reference observation".into()))?;
        let ratio = self.score(values, topology) / self.score(reference, topology);
        Ok(match (self.target, self.full) {
            (PredictorTarget::Power, true) => {
                let dynamic = (observed - self.static_watts).max(0.0);
                self.static_watts + dynamic * ratio
            }
            _ => observed * ratio,
        })
    }
}
