//! Prediction from profiles of previously characterized applications.
//!
//! Each profile holds one value per configuration, in the order of
//! [`Configuration::all_real_combinations`](crate::configuration::Configuration::all_real_combinations).
//! The model finds the ridge least-squares mix of profiles that best matches
//! the few configurations observed so far and reads predictions off the mix.

use super::linalg::ridge;
use super::{Observations, PredictorTarget};
use crate::config::LearnedProfile;
use crate::error::{Result, TuneError};
use crate::knob::{KnobsValues, ValuesKey};
use crate::sample::Sample;
use nalgebra::DVector;
use std::collections::HashMap;

const RIDGE: f64 = 1e-3;

#[derive(Debug, Clone)]
pub struct LearnedModel {
    target: PredictorTarget,
    /// `profiles[j][i]`: profile `j` at combination `i`.
    profiles: Vec<Vec<f64>>,
    index: HashMap<ValuesKey, usize>,
    observations: Observations,
    weights: Option<DVector<f64>>,
    dirty: bool,
}

impl LearnedModel {
    /// # Errors
    ///
    /// `TuneError::InvalidParameters` when there are no profiles or a profile
    /// does not have one value per combination.
    pub fn new(
        target: PredictorTarget,
        profiles: &[LearnedProfile],
        combinations: &[KnobsValues],
    ) -> Result<Self> {
        let profiles: Vec<Vec<f64>> = profiles
            .iter()
            .map(|p| match target {
                PredictorTarget::Throughput => p.throughput.clone(),
                PredictorTarget::Power => p.watts.clone(),
            })
            .collect();
        if profiles.is_empty() {
            return Err(TuneError::InvalidParameters(
                "learned prediction needs at least one profile".into(),
            ));
        }
        if let Some(p) = profiles.iter().find(|p| p.len() != combinations.len()) {
            return Err(TuneError::InvalidParameters(format!(
                "learned profile has {} values, configuration has {} combinations",
                p.len(),
                combinations.len()
            )));
        }
        Ok(Self {
            target,
            profiles,
            index: combinations
                .iter()
                .enumerate()
                .map(|(i, v)| (v.key(), i))
                .collect(),
            observations: Observations::default(),
            weights: None,
            dirty: false,
        })
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.weights = None;
        self.dirty = false;
    }

    pub fn refine(&mut self, values: &KnobsValues, sample: &Sample) {
        if self.index.contains_key(&values.key()) {
            self.observations
                .record(values, self.target.response(sample));
            self.dirty = true;
        }
    }

    pub fn minimum_points(&self) -> usize {
        self.profiles.len().clamp(1, 3)
    }

    pub fn is_ready(&self) -> bool {
        self.observations.len() >= self.minimum_points()
    }

    fn column(&self, values: &KnobsValues) -> Option<Vec<f64>> {
        let i = *self.index.get(&values.key())?;
        Some(self.profiles.iter().map(|p| p[i]).collect())
    }

    pub fn prepare(&mut self) -> Result<()> {
        if !self.dirty && self.weights.is_some() {
            return Ok(());
        }
        if !self.is_ready() {
            return Err(TuneError::Model(format!(
                "learned model needs {} configurations, has {}",
                self.minimum_points(),
                self.observations.len()
            )));
        }
        let (rows, ys): (Vec<Vec<f64>>, Vec<f64>) = self
            .observations
            .iter()
            .filter_map(|o| self.column(&o.values).map(|c| (c, o.response)))
            .unzip();
        let weights = ridge(&rows, &ys, RIDGE)
            .ok_or_else(|| TuneError::Model("profile mix cannot be solved".into()))?;
        self.weights = Some(weights);
        self.dirty = false;
        Ok(())
    }

    pub fn predict(&self, values: &KnobsValues) -> Result<f64> {
        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| TuneError::Model("learned model used before prepare".into()))?;
        let column = self
            .column(values)
            .ok_or_else(|| TuneError::Model(format!("{values} is not a known combination")))?;
        Ok(DVector::from_vec(column).dot(weights).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::testing::sample;

    fn combos() -> Vec<KnobsValues> {
        (1..=4)
            .map(|c| KnobsValues::real([c as f64, 1.0, 0.0, 1e6, 100.0]))
            .collect()
    }

    #[test]
    fn test_profile_length_checked() {
        let bad = LearnedProfile {
            throughput: vec![1.0, 2.0],
            watts: vec![1.0, 2.0],
        };
        assert!(LearnedModel::new(PredictorTarget::Throughput, &[bad], &combos()).is_err());
        assert!(LearnedModel::new(PredictorTarget::Throughput, &[], &combos()).is_err());
    }

    #[test]
    fn test_mix_of_profiles() {
        let linear = LearnedProfile {
            throughput: vec![10.0, 20.0, 30.0, 40.0],
            watts: vec![0.0; 4],
        };
        let flat = LearnedProfile {
            throughput: vec![10.0, 10.0, 10.0, 10.0],
            watts: vec![0.0; 4],
        };
        let c = combos();
        let mut m = LearnedModel::new(PredictorTarget::Throughput, &[linear, flat], &c).unwrap();
        assert_eq!(m.minimum_points(), 2);

        // the application behaves like twice the linear profile
        m.refine(&c[0], &sample(20.0, 0.0));
        m.refine(&c[1], &sample(40.0, 0.0));
        m.prepare().unwrap();
        let p = m.predict(&c[3]).unwrap();
        assert!((p - 80.0).abs() < 0.5);
    }
}
