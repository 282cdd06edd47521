//! Time-windowed measurements of a managed computation.
//!
//! A [`Sample`] is produced once per control-loop tick from worker counters
//! and the energy meter. All arithmetic is element-wise across every field so
//! the [`Smoother`](crate::smoother::Smoother) can compute means and variances
//! of whole samples at once.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Div, Mul, Sub};

/// Number of application-defined custom fields carried by a sample.
pub const CUSTOM_FIELDS: usize = 10;

/// Load (percent) at or above which a computation is considered saturated.
///
/// Below this, observed throughput is limited by the input rate rather than
/// by the configuration, and [`Sample::maximum_throughput`] extrapolates.
pub const MAX_RHO: f64 = 90.0;

/// One sampling interval worth of measurements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Completed tasks per second.
    pub throughput: f64,
    /// Mean task latency in seconds.
    pub latency: f64,
    /// Fraction of time the active workers were busy, in percent.
    pub load_percentage: f64,
    /// Tasks completed during the interval.
    pub num_tasks: f64,
    /// Average power draw in watts.
    pub watts: f64,
    /// Application-defined values.
    pub custom: [f64; CUSTOM_FIELDS],
}

impl Sample {
    /// The all-zero sample.
    pub fn zero() -> Self {
        Self::default()
    }

    fn map(self, f: impl Fn(f64) -> f64) -> Self {
        let mut custom = self.custom;
        for c in custom.iter_mut() {
            *c = f(*c);
        }
        Self {
            throughput: f(self.throughput),
            latency: f(self.latency),
            load_percentage: f(self.load_percentage),
            num_tasks: f(self.num_tasks),
            watts: f(self.watts),
            custom,
        }
    }

    fn zip(self, other: Self, f: impl Fn(f64, f64) -> f64) -> Self {
        let mut custom = self.custom;
        for (c, o) in custom.iter_mut().zip(other.custom.iter()) {
            *c = f(*c, *o);
        }
        Self {
            throughput: f(self.throughput, other.throughput),
            latency: f(self.latency, other.latency),
            load_percentage: f(self.load_percentage, other.load_percentage),
            num_tasks: f(self.num_tasks, other.num_tasks),
            watts: f(self.watts, other.watts),
            custom,
        }
    }

    /// Element-wise square root.
    pub fn sqrt(self) -> Self {
        self.map(f64::sqrt)
    }

    /// Element-wise minimum.
    pub fn min(self, other: Self) -> Self {
        self.zip(other, f64::min)
    }

    /// Element-wise maximum.
    pub fn max(self, other: Self) -> Self {
        self.zip(other, f64::max)
    }

    /// Clamp negative fields to zero.
    pub fn regularize(self) -> Self {
        self.map(|v| if v < 0.0 { 0.0 } else { v })
    }

    /// Element-wise division where a zero denominator yields zero.
    pub fn div_or_zero(self, other: Self) -> Self {
        self.zip(other, |a, b| if b == 0.0 { 0.0 } else { a / b })
    }

    /// Throughput the computation could sustain if it were never starved for input.
    pub fn maximum_throughput(&self) -> f64 {
        if self.load_percentage >= MAX_RHO || self.load_percentage <= 0.0 {
            self.throughput
        } else {
            self.throughput / (self.load_percentage / 100.0)
        }
    }
}

impl Add for Sample {
    type Output = Sample;
    fn add(self, rhs: Sample) -> Sample {
        self.zip(rhs, |a, b| a + b)
    }
}

impl AddAssign for Sample {
    fn add_assign(&mut self, rhs: Sample) {
        *self = *self + rhs;
    }
}

impl Sub for Sample {
    type Output = Sample;
    fn sub(self, rhs: Sample) -> Sample {
        self.zip(rhs, |a, b| a - b)
    }
}

impl Mul for Sample {
    type Output = Sample;
    fn mul(self, rhs: Sample) -> Sample {
        self.zip(rhs, |a, b| a * b)
    }
}

impl Div for Sample {
    type Output = Sample;
    fn div(self, rhs: Sample) -> Sample {
        self.zip(rhs, |a, b| a / b)
    }
}

impl Mul<f64> for Sample {
    type Output = Sample;
    fn mul(self, rhs: f64) -> Sample {
        self.map(|a| a * rhs)
    }
}

impl Div<f64> for Sample {
    type Output = Sample;
    fn div(self, rhs: f64) -> Sample {
        self.map(|a| a / rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(throughput: f64, watts: f64) -> Sample {
        Sample {
            throughput,
            watts,
            ..Sample::default()
        }
    }

    #[test]
    fn test_elementwise_arithmetic() {
        let mut a = sample(10.0, 4.0);
        a.custom[3] = 2.0;
        let mut b = sample(5.0, 16.0);
        b.custom[3] = 8.0;

        let sum = a + b;
        assert_eq!(sum.throughput, 15.0);
        assert_eq!(sum.watts, 20.0);
        assert_eq!(sum.custom[3], 10.0);

        let prod = a * b;
        assert_eq!(prod.custom[3], 16.0);
        assert_eq!((b / 4.0).watts, 4.0);
        assert_eq!(b.sqrt().watts, 4.0);
        assert_eq!(a.min(b).throughput, 5.0);
        assert_eq!(a.max(b).watts, 16.0);
    }

    #[test]
    fn test_regularize_clamps_negative() {
        let d = sample(3.0, 1.0) - sample(5.0, 0.5);
        assert!(d.throughput < 0.0);
        let r = d.regularize();
        assert_eq!(r.throughput, 0.0);
        assert_eq!(r.watts, 0.5);
    }

    #[test]
    fn test_div_or_zero() {
        let r = sample(10.0, 3.0).div_or_zero(sample(0.0, 1.5));
        assert_eq!(r.throughput, 0.0);
        assert_eq!(r.watts, 2.0);
        assert_eq!(r.latency, 0.0);
    }

    #[test]
    fn test_maximum_throughput() {
        let mut s = sample(50.0, 0.0);
        s.load_percentage = 50.0;
        assert_eq!(s.maximum_throughput(), 100.0);

        s.load_percentage = 95.0;
        assert_eq!(s.maximum_throughput(), 50.0);

        s.load_percentage = 0.0;
        assert_eq!(s.maximum_throughput(), 50.0);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut s = sample(1.5, 2.5);
        s.custom[0] = 7.0;
        let json = serde_json::to_string(&s).unwrap();
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
