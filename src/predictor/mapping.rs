//! One regression per thread mapping.
//!
//! Linear and interleaved placements of the same core count can behave very
//! differently (shared caches vs. memory bandwidth), which a single set of
//! features does not capture.

use super::RegressionModel;
use crate::error::{Result, TuneError};
use crate::knob::{KnobType, KnobsValues};
use crate::sample::Sample;
use crate::topology::Topology;

#[derive(Debug, Clone)]
pub struct PerMappingModel {
    models: Vec<(f64, RegressionModel)>,
}

impl PerMappingModel {
    /// One model per allowed mapping value, each built by `make`.
    pub fn new(mappings: &[f64], make: impl Fn() -> RegressionModel) -> Self {
        let mut models: Vec<(f64, RegressionModel)> =
            mappings.iter().map(|&m| (m, make())).collect();
        if models.is_empty() {
            // mapping knob not applicable: everything runs linear
            models.push((0.0, make()));
        }
        Self { models }
    }

    fn index(&self, values: &KnobsValues) -> Option<usize> {
        if self.models.len() == 1 {
            return Some(0);
        }
        let mapping = values[KnobType::Mapping];
        self.models.iter().position(|(m, _)| *m == mapping)
    }

    pub fn clear(&mut self) {
        self.models.iter_mut().for_each(|(_, m)| m.clear());
    }

    /// Refine only the model for the observed mapping.
    pub fn refine(&mut self, values: &KnobsValues, sample: &Sample, topology: &Topology) {
        if let Some(i) = self.index(values) {
            self.models[i].1.refine(values, sample, topology);
        }
    }

    pub fn minimum_points(&self) -> usize {
        self.models.iter().map(|(_, m)| m.minimum_points()).sum()
    }

    /// Ready once every mapping's model is.
    pub fn is_ready(&self) -> bool {
        self.models.iter().all(|(_, m)| m.is_ready())
    }

    pub fn prepare(&mut self, topology: &Topology) -> Result<()> {
        for (_, m) in &mut self.models {
            m.prepare(topology)?;
        }
        Ok(())
    }

    pub fn predict(&self, values: &KnobsValues, topology: &Topology) -> Result<f64> {
        let i = self.index(values).ok_or_else(|| {
            TuneError::Model(format!(
                "no model for mapping {}",
                values[KnobType::Mapping]
            ))
        })?;
        self.models[i].1.predict(values, topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnusedCores;
    use crate::predictor::testing::sample;
    use crate::predictor::PredictorTarget;

    #[test]
    fn test_ready_needs_every_mapping() {
        let t = Topology::synthetic(2, 4, 1, vec![1_000_000, 2_000_000]);
        let free = [true, false, true, false, false];
        let mut m = PerMappingModel::new(&[0.0, 1.0], || {
            RegressionModel::new(PredictorTarget::Power, free, &t, UnusedCores::None)
        });
        let per_model = m.models[0].1.minimum_points();
        assert_eq!(m.minimum_points(), 2 * per_model);

        for c in 1..=per_model {
            m.refine(
                &KnobsValues::real([c as f64, 1.0, 0.0, 2e6, 100.0]),
                &sample(1.0, 10.0 * c as f64),
                &t,
            );
        }
        assert!(!m.is_ready());
        for c in 1..=per_model {
            m.refine(
                &KnobsValues::real([c as f64 + 2.0, 1.0, 1.0, 2e6, 100.0]),
                &sample(1.0, 12.0 * c as f64),
                &t,
            );
        }
        assert!(m.is_ready());
        m.prepare(&t).unwrap();
        assert!(m
            .predict(&KnobsValues::real([2.0, 1.0, 1.0, 2e6, 100.0]), &t)
            .is_ok());
        assert!(m
            .predict(&KnobsValues::real([2.0, 1.0, 5.0, 2e6, 100.0]), &t)
            .is_err());
    }
}
