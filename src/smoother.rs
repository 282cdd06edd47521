//! Online mean/variance tracking over recent samples.
//!
//! Two policies share one contract:
//!
//! - [`Smoother::simple`]: moving average over the last `window` values. The
//!   mean and variance are recomputed over the retained window on every
//!   [`add`](Smoother::add), so repeated identical values average to exactly
//!   that value.
//! - [`Smoother::exponential`]: exponentially weighted average with decay
//!   factor `alpha`, keeping one running state and no history.
//!
//! # Example
//!
//! ```ignore
//! use tuneloop::smoother::Smoother;
//!
//! let mut s = Smoother::<f64>::simple(3);
//! s.add(1.0);
//! s.add(2.0);
//! s.add(3.0);
//! s.add(4.0); // evicts 1.0
//! assert_eq!(s.average(), 3.0);
//! ```

use crate::sample::Sample;
use std::collections::VecDeque;
use std::ops::{Add, Div, Mul, Sub};

/// Values a [`Smoother`] can track.
pub trait Smoothable:
    Copy
    + Default
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    /// Element-wise square root.
    fn sqrt(self) -> Self;
    /// Clamp negative components to zero.
    fn regularize(self) -> Self;
    /// Element-wise division where a zero denominator yields zero.
    fn div_or_zero(self, other: Self) -> Self;
}

impl Smoothable for f64 {
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    fn regularize(self) -> Self {
        self.max(0.0)
    }

    fn div_or_zero(self, other: Self) -> Self {
        if other == 0.0 {
            0.0
        } else {
            self / other
        }
    }
}

impl Smoothable for Sample {
    fn sqrt(self) -> Self {
        Sample::sqrt(self)
    }

    fn regularize(self) -> Self {
        Sample::regularize(self)
    }

    fn div_or_zero(self, other: Self) -> Self {
        Sample::div_or_zero(self, other)
    }
}

/// Online smoother over values of type `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Smoother<T: Smoothable> {
    Simple(SimpleState<T>),
    Exponential(ExponentialState<T>),
}

/// Moving-average state over a bounded window.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleState<T> {
    window: usize,
    history: VecDeque<T>,
    average: T,
    variance: T,
}

/// Exponential moving-average state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialState<T> {
    alpha: f64,
    count: usize,
    average: T,
    variance: T,
    last: Option<T>,
}

impl<T: Smoothable> Smoother<T> {
    /// Moving average over the last `window` values (at least one).
    pub fn simple(window: usize) -> Self {
        Smoother::Simple(SimpleState {
            window: window.max(1),
            history: VecDeque::with_capacity(window.max(1)),
            average: T::default(),
            variance: T::default(),
        })
    }

    /// Exponential moving average; `alpha` is the weight of the newest value.
    pub fn exponential(alpha: f64) -> Self {
        Smoother::Exponential(ExponentialState {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            count: 0,
            average: T::default(),
            variance: T::default(),
            last: None,
        })
    }

    /// Add a new value.
    pub fn add(&mut self, value: T) {
        match self {
            Smoother::Simple(s) => {
                if s.history.len() == s.window {
                    s.history.pop_front();
                }
                s.history.push_back(value);

                // Welford over the retained window
                let mut mean = T::default();
                let mut m2 = T::default();
                for (i, &x) in s.history.iter().enumerate() {
                    let delta = x - mean;
                    mean = mean + delta / (i + 1) as f64;
                    m2 = m2 + delta * (x - mean);
                }
                s.average = mean;
                s.variance = (m2 / s.history.len() as f64).regularize();
            }
            Smoother::Exponential(s) => {
                if s.count == 0 {
                    s.average = value;
                    s.variance = T::default();
                } else {
                    let diff = value - s.average;
                    let increment = diff * s.alpha;
                    s.average = s.average + increment;
                    s.variance = ((s.variance + diff * increment) * (1.0 - s.alpha)).regularize();
                }
                s.count += 1;
                s.last = Some(value);
            }
        }
    }

    /// Current average, or the zero value when empty.
    pub fn average(&self) -> T {
        match self {
            Smoother::Simple(s) => s.average,
            Smoother::Exponential(s) => s.average,
        }
    }

    /// Current variance, or the zero value when empty.
    pub fn variance(&self) -> T {
        match self {
            Smoother::Simple(s) => s.variance,
            Smoother::Exponential(s) => s.variance,
        }
    }

    /// Standard deviation divided by mean; zero where the mean is zero.
    pub fn coefficient_variation(&self) -> T {
        self.variance().sqrt().div_or_zero(self.average())
    }

    /// Number of values currently contributing to the average.
    ///
    /// For the exponential policy this counts every value since the last reset.
    pub fn size(&self) -> usize {
        match self {
            Smoother::Simple(s) => s.history.len(),
            Smoother::Exponential(s) => s.count,
        }
    }

    /// Most recently added value.
    pub fn last_sample(&self) -> Option<T> {
        match self {
            Smoother::Simple(s) => s.history.back().copied(),
            Smoother::Exponential(s) => s.last,
        }
    }

    /// Discard all history.
    pub fn reset(&mut self) {
        match self {
            Smoother::Simple(s) => {
                s.history.clear();
                s.average = T::default();
                s.variance = T::default();
            }
            Smoother::Exponential(s) => {
                s.count = 0;
                s.average = T::default();
                s.variance = T::default();
                s.last = None;
            }
        }
    }
}
