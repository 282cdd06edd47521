//! Universal scalability law fitted on frequency-normalized throughput.
//!
//! With `n` workers, `n / X(n) = c0 + c1 (n - 1) + c2 n (n - 1)`. The
//! coefficients come from a least squares fit over the observed core
//! counts, or from the interference protocol: after external load changes,
//! three fresh observations (two fixed core counts, then a baseline) are fed
//! through [`UslModel::update_interference`] and
//! [`UslModel::update_coefficients`] solves the curve through them exactly.

use super::linalg::{least_squares, solve};
use super::Observations;
use crate::error::{Result, TuneError};
use crate::knob::{KnobType, KnobsValues};
use crate::sample::Sample;
use crate::topology::Topology;
use tracing::debug;

/// Updates the interference protocol requires.
const INTERFERENCE_POINTS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct UslModel {
    observations: Observations,
    coefficients: Option<[f64; 3]>,
    dirty: bool,
    interference: Vec<(f64, f64)>,
}

fn usl_row(n: f64) -> Vec<f64> {
    vec![1.0, n - 1.0, n * (n - 1.0)]
}

/// Throughput at the top frequency and full duty cycle.
fn normalized(values: &KnobsValues, throughput: f64, topology: &Topology) -> f64 {
    let f = values[KnobType::Frequency].max(1.0);
    let f_max = topology.max_frequency().map(|m| m as f64).unwrap_or(f);
    let duty = (values[KnobType::ClockModulation] / 100.0).clamp(0.01, 1.0);
    throughput * f_max / (f * duty)
}

impl UslModel {
    pub const MINIMUM_POINTS: usize = 3;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn coefficients(&self) -> Option<[f64; 3]> {
        self.coefficients
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.coefficients = None;
        self.dirty = false;
        self.interference.clear();
    }

    pub fn refine(&mut self, values: &KnobsValues, sample: &Sample, topology: &Topology) {
        let x = sample.maximum_throughput();
        if x > 0.0 {
            self.observations
                .record(values, normalized(values, x, topology));
            self.dirty = true;
        }
    }

    fn distinct_core_counts(&self) -> usize {
        let mut counts: Vec<u64> = self
            .observations
            .iter()
            .map(|o| o.values[KnobType::VirtualCores].to_bits())
            .collect();
        counts.sort_unstable();
        counts.dedup();
        counts.len()
    }

    pub fn is_ready(&self) -> bool {
        (self.coefficients.is_some() && !self.dirty)
            || self.distinct_core_counts() >= Self::MINIMUM_POINTS
    }

    pub fn prepare(&mut self) -> Result<()> {
        if !self.dirty && self.coefficients.is_some() {
            return Ok(());
        }
        if self.distinct_core_counts() < Self::MINIMUM_POINTS {
            if self.coefficients.is_some() {
                // too few fresh points to refit: keep the current curve
                self.dirty = false;
                return Ok(());
            }
            return Err(TuneError::Model(format!(
                "scalability fit needs {} core counts, has {}",
                Self::MINIMUM_POINTS,
                self.distinct_core_counts()
            )));
        }
        let (rows, ys): (Vec<Vec<f64>>, Vec<f64>) = self
            .observations
            .iter()
            .map(|o| {
                let n = o.values[KnobType::VirtualCores].max(1.0);
                (usl_row(n), n / o.response)
            })
            .unzip();
        let c = least_squares(&rows, &ys)
            .filter(|fit| fit.is_full_rank())
            .ok_or_else(|| TuneError::Model("scalability fit is singular".into()))?
            .coefficients;
        self.coefficients = Some([c[0], c[1], c[2]]);
        self.dirty = false;
        debug!(c0 = c[0], c1 = c[1], c2 = c[2], "scalability curve fitted");
        Ok(())
    }

    pub fn predict(&self, values: &KnobsValues, topology: &Topology) -> Result<f64> {
        let [c0, c1, c2] = self
            .coefficients
            .ok_or_else(|| TuneError::Model("scalability model used before prepare".into()))?;
        let n = values[KnobType::VirtualCores].max(1.0);
        let denominator = c0 + c1 * (n - 1.0) + c2 * n * (n - 1.0);
        if denominator <= 0.0 {
            return Err(TuneError::Model(format!(
                "scalability curve undefined at {n} cores"
            )));
        }
        let at_max = n / denominator;
        // undo the normalization for this frequency
        Ok(at_max / normalized(values, 1.0, topology))
    }

    /// Record one step of the interference protocol.
    ///
    /// # Errors
    ///
    /// `TuneError::InterferenceProtocol` on a fourth call before
    /// [`update_coefficients`](Self::update_coefficients).
    pub fn update_interference(
        &mut self,
        values: &KnobsValues,
        sample: &Sample,
        topology: &Topology,
    ) -> Result<()> {
        if self.interference.len() >= INTERFERENCE_POINTS {
            return Err(TuneError::InterferenceProtocol(self.interference.len() + 1));
        }
        let n = values[KnobType::VirtualCores].max(1.0);
        let x = normalized(values, sample.maximum_throughput(), topology);
        self.interference.push((n, x));
        Ok(())
    }

    /// Refit the curve through the three interference points.
    ///
    /// # Errors
    ///
    /// `TuneError::InterferenceProtocol` unless exactly three updates were
    /// recorded; `TuneError::Model` if the points do not determine a curve.
    /// The recorded updates are discarded either way.
    pub fn update_coefficients(&mut self) -> Result<()> {
        let points = std::mem::take(&mut self.interference);
        if points.len() != INTERFERENCE_POINTS {
            return Err(TuneError::InterferenceProtocol(points.len()));
        }
        if points.iter().any(|&(_, x)| x <= 0.0) {
            return Err(TuneError::Model(
                "interference point without throughput".into(),
            ));
        }
        let a: Vec<Vec<f64>> = points.iter().map(|&(n, _)| usl_row(n)).collect();
        let b: Vec<f64> = points.iter().map(|&(n, x)| n / x).collect();
        let c = solve(&a, &b).ok_or_else(|| {
            TuneError::Model("interference points do not span three core counts".into())
        })?;
        self.coefficients = Some([c[0], c[1], c[2]]);
        self.observations.clear();
        self.dirty = false;
        debug!(c0 = c[0], c1 = c[1], c2 = c[2], "scalability curve updated for interference");
        Ok(())
    }

    /// Interference updates recorded so far.
    pub fn pending_updates(&self) -> usize {
        self.interference.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::testing::sample;

    fn topo() -> Topology {
        Topology::synthetic(1, 16, 1, vec![1_000_000, 2_000_000])
    }

    fn at(n: f64, khz: f64) -> KnobsValues {
        KnobsValues::real([n, 1.0, 0.0, khz, 100.0])
    }

    fn usl(n: f64) -> f64 {
        // c0 = 0.01, c1 = 0.001, c2 = 0.0001
        n / (0.01 + 0.001 * (n - 1.0) + 0.0001 * n * (n - 1.0))
    }

    #[test]
    fn test_fit_and_predict_with_frequency() {
        let t = topo();
        let mut m = UslModel::new();
        for n in [1.0, 4.0, 8.0, 16.0] {
            m.refine(&at(n, 2e6), &sample(usl(n), 0.0), &t);
        }
        // half frequency halves observed throughput but the curve is the same
        m.refine(&at(2.0, 1e6), &sample(usl(2.0) / 2.0, 0.0), &t);
        assert!(m.is_ready());
        m.prepare().unwrap();

        let p = m.predict(&at(12.0, 1e6), &t).unwrap();
        assert!((p - usl(12.0) / 2.0).abs() / p < 1e-6);
    }

    #[test]
    fn test_update_coefficients_requires_three_updates() {
        let t = topo();
        let mut m = UslModel::new();
        assert!(matches!(
            m.update_coefficients(),
            Err(TuneError::InterferenceProtocol(0))
        ));

        m.update_interference(&at(8.0, 2e6), &sample(usl(8.0), 0.0), &t)
            .unwrap();
        m.update_interference(&at(16.0, 2e6), &sample(usl(16.0), 0.0), &t)
            .unwrap();
        assert!(matches!(
            m.update_coefficients(),
            Err(TuneError::InterferenceProtocol(2))
        ));
        assert_eq!(m.pending_updates(), 0);
    }

    #[test]
    fn test_fourth_update_rejected() {
        let t = topo();
        let mut m = UslModel::new();
        for n in [8.0, 16.0, 1.0] {
            m.update_interference(&at(n, 2e6), &sample(usl(n), 0.0), &t)
                .unwrap();
        }
        let err = m
            .update_interference(&at(4.0, 2e6), &sample(usl(4.0), 0.0), &t)
            .unwrap_err();
        assert!(matches!(err, TuneError::InterferenceProtocol(4)));
    }

    #[test]
    fn test_interference_protocol_recovers_new_curve() {
        let t = topo();
        let mut m = UslModel::new();
        for n in [1.0, 4.0, 8.0] {
            m.refine(&at(n, 2e6), &sample(2.0 * usl(n), 0.0), &t);
        }
        m.prepare().unwrap();

        for n in [8.0, 16.0, 1.0] {
            m.update_interference(&at(n, 2e6), &sample(usl(n), 0.0), &t)
                .unwrap();
        }
        m.update_coefficients().unwrap();
        let [c0, c1, c2] = m.coefficients().unwrap();
        assert!((c0 - 0.01).abs() < 1e-9);
        assert!((c1 - 0.001).abs() < 1e-9);
        assert!((c2 - 0.0001).abs() < 1e-9);
        assert!(m.is_ready());
    }
}
