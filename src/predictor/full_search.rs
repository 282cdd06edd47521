//! Exhaustive search: remember what every configuration did.

use super::{Observations, PredictorTarget};
use crate::error::{Result, TuneError};
use crate::knob::KnobsValues;
use crate::sample::Sample;

#[derive(Debug, Clone)]
pub struct FullSearchModel {
    target: PredictorTarget,
    observations: Observations,
    expected: usize,
}

impl FullSearchModel {
    /// A model over `combinations` configurations.
    pub fn new(target: PredictorTarget, combinations: usize) -> Self {
        Self {
            target,
            observations: Observations::default(),
            expected: combinations,
        }
    }

    pub fn clear(&mut self) {
        self.observations.clear();
    }

    pub fn refine(&mut self, values: &KnobsValues, sample: &Sample) {
        self.observations
            .record(values, self.target.response(sample));
    }

    pub fn minimum_points(&self) -> usize {
        self.expected
    }

    pub fn is_ready(&self) -> bool {
        self.observations.len() >= self.expected
    }

    /// The observed value.
    ///
    /// # Errors
    ///
    /// `TuneError::NotObserved` for configurations never sampled.
    pub fn predict(&self, values: &KnobsValues) -> Result<f64> {
        self.observations
            .get(values)
            .map(|o| o.response)
            .ok_or_else(|| TuneError::NotObserved(values.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::testing::sample;

    #[test]
    fn test_only_observed_configurations_answer() {
        let mut m = FullSearchModel::new(PredictorTarget::Power, 2);
        let a = KnobsValues::real([1.0, 1.0, 0.0, 1e6, 100.0]);
        let b = KnobsValues::real([2.0, 1.0, 0.0, 1e6, 100.0]);
        m.refine(&a, &sample(10.0, 30.0));
        assert!(!m.is_ready());
        assert!(matches!(m.predict(&b), Err(TuneError::NotObserved(_))));

        m.refine(&b, &sample(20.0, 40.0));
        assert!(m.is_ready());
        assert_eq!(m.predict(&a).unwrap(), 30.0);
        assert_eq!(m.predict(&b).unwrap(), 40.0);
    }
}
