//! Running statistics and end-of-run accounting records.

use crate::knob::{KnobType, KNOB_NUM};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::time::Duration;

/// Welford accumulator for mean and variance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance; zero with fewer than two values.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).max(0.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Time spent applying configurations, per knob and in total (milliseconds).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconfigurationStats {
    knobs: [RunningStats; KNOB_NUM],
    total: RunningStats,
}

impl ReconfigurationStats {
    pub fn record_knob(&mut self, knob: KnobType, elapsed: Duration) {
        self.knobs[knob.index()].push(elapsed.as_secs_f64() * 1e3);
    }

    pub fn record_total(&mut self, elapsed: Duration) {
        self.total.push(elapsed.as_secs_f64() * 1e3);
    }

    pub fn knob(&self, knob: KnobType) -> &RunningStats {
        &self.knobs[knob.index()]
    }

    pub fn total(&self) -> &RunningStats {
        &self.total
    }
}

/// Cost of one calibration episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStats {
    /// Configurations tried.
    pub num_steps: u64,
    pub duration: Duration,
    /// Tasks completed while calibrating.
    pub num_tasks: f64,
    pub joules: f64,
}

impl AddAssign for CalibrationStats {
    fn add_assign(&mut self, rhs: Self) {
        self.num_steps += rhs.num_steps;
        self.duration += rhs.duration;
        self.num_tasks += rhs.num_tasks;
        self.joules += rhs.joules;
    }
}
