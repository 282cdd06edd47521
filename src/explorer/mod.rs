//! Generators of calibration points in relative knob space.
//!
//! Only free knobs are explored; every other knob gets relative value 0,
//! which resolves to its single allowed (or current) value. Caller-supplied
//! points are served first, in order.
//!
//! # Strategies
//!
//! - Random: an independent uniform draw per free knob.
//! - Halton: one low-discrepancy sequence over all free knobs, with the
//!   first prime bases; the reverse variant permutes digits `d -> (b - d) % b`.
//! - Niederreiter: the base-2 sequence of [`niederreiter`].
//! - Sobol: Joe-Kuo direction numbers from the `sobol` crate.
//! - Multiple: wraps another explorer and sweeps one knob through all its
//!   values for every base point (e.g. every mapping for each core count).
//!
//! The low-discrepancy sequences skip their origin, the all-minimum point.

mod niederreiter;

pub use niederreiter::Niederreiter2;

use crate::config::ExplorationStrategy;
use crate::error::{Result, TuneError};
use crate::knob::{KnobType, KnobsValues, ValueKind, KNOB_NUM};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use sobol::params::JoeKuoD6;
use sobol::Sobol;
use std::collections::VecDeque;

const PRIMES: [u64; KNOB_NUM] = [2, 3, 5, 7, 11];

/// Sobol points generated up front; calibration never needs more.
const SOBOL_POINTS: usize = 1024;

fn sobol_points(dimension: usize) -> Vec<Vec<f64>> {
    let params = JoeKuoD6::minimal();
    Sobol::<f32>::new(dimension.max(1), &params)
        .skip(1)
        .take(SOBOL_POINTS)
        .map(|p| p.into_iter().map(f64::from).collect())
        .collect()
}

/// Radical inverse of `index` in `base`, optionally with reversed digits.
fn radical_inverse(mut index: u64, base: u64, reverse: bool) -> f64 {
    let mut result = 0.0;
    let mut scale = 1.0 / base as f64;
    while index > 0 {
        let mut digit = index % base;
        if reverse {
            digit = (base - digit) % base;
        }
        result += digit as f64 * scale;
        index /= base;
        scale /= base as f64;
    }
    result
}

#[derive(Debug, Clone)]
enum Kind {
    Random {
        rng: SmallRng,
        seed: Option<u64>,
        range: Uniform<f64>,
    },
    Halton {
        index: u64,
        reverse: bool,
    },
    Niederreiter(Niederreiter2),
    Sobol {
        points: Vec<Vec<f64>>,
        index: usize,
    },
    Multiple {
        base: Box<Explorer>,
        knob: KnobType,
        num_values: usize,
        next: usize,
        point: Option<KnobsValues>,
    },
}

/// Source of relative calibration points.
#[derive(Debug, Clone)]
pub struct Explorer {
    free: [bool; KNOB_NUM],
    initial_points: VecDeque<KnobsValues>,
    points: VecDeque<KnobsValues>,
    kind: Kind,
}

fn seeded(seed: Option<u64>) -> SmallRng {
    match seed {
        Some(s) => SmallRng::seed_from_u64(s),
        None => SmallRng::from_entropy(),
    }
}

impl Explorer {
    /// Explore the `free` knobs with `strategy`.
    ///
    /// `seed` makes the random strategy reproducible.
    pub fn new(strategy: ExplorationStrategy, free: [bool; KNOB_NUM], seed: Option<u64>) -> Self {
        let dimension = free.iter().filter(|&&f| f).count();
        let kind = match strategy {
            ExplorationStrategy::Random => Kind::Random {
                rng: seeded(seed),
                seed,
                range: Uniform::new_inclusive(0.0, 100.0),
            },
            ExplorationStrategy::Halton => Kind::Halton {
                index: 1,
                reverse: false,
            },
            ExplorationStrategy::HaltonReverse => Kind::Halton {
                index: 1,
                reverse: true,
            },
            ExplorationStrategy::Niederreiter => {
                let mut generator = Niederreiter2::new(dimension);
                generator.next_point(&mut [0.0; KNOB_NUM]);
                Kind::Niederreiter(generator)
            }
            ExplorationStrategy::Sobol => Kind::Sobol {
                points: sobol_points(dimension),
                index: 0,
            },
        };
        Self {
            free,
            initial_points: VecDeque::new(),
            points: VecDeque::new(),
            kind,
        }
    }

    /// Sweep `knob` through `num_values` evenly spaced relative values for
    /// every point `base` produces. `base` must not explore `knob` itself.
    pub fn multiple(mut base: Explorer, knob: KnobType, num_values: usize) -> Self {
        base.free[knob.index()] = false;
        let mut free = base.free;
        free[knob.index()] = true;
        Self {
            free,
            initial_points: VecDeque::new(),
            points: VecDeque::new(),
            kind: Kind::Multiple {
                base: Box::new(base),
                knob,
                num_values: num_values.max(1),
                next: 0,
                point: None,
            },
        }
    }

    /// Serve `points` before generated ones, again after every
    /// [`reset`](Self::reset).
    ///
    /// # Errors
    ///
    /// `TuneError::InvalidParameters` if a point is not relative.
    pub fn with_additional_points(
        mut self,
        points: impl IntoIterator<Item = KnobsValues>,
    ) -> Result<Self> {
        for p in points {
            if !p.is_relative() {
                return Err(TuneError::InvalidParameters(format!(
                    "calibration point {p} must be relative"
                )));
            }
            self.points.push_back(p.clone());
            self.initial_points.push_back(p);
        }
        Ok(self)
    }

    /// Knobs this explorer varies.
    pub fn free_knobs(&self) -> [bool; KNOB_NUM] {
        self.free
    }

    /// Next relative point to sample.
    pub fn next_relative(&mut self) -> KnobsValues {
        if let Some(p) = self.points.pop_front() {
            return p;
        }
        let free = self.free;
        let mut v = KnobsValues::new(ValueKind::Relative);
        match &mut self.kind {
            Kind::Random { rng, range, .. } => {
                for k in KnobType::ALL {
                    if free[k.index()] {
                        v[k] = range.sample(rng);
                    }
                }
            }
            Kind::Halton { index, reverse } => {
                let mut dim = 0;
                for k in KnobType::ALL {
                    if free[k.index()] {
                        v[k] = radical_inverse(*index, PRIMES[dim], *reverse) * 100.0;
                        dim += 1;
                    }
                }
                *index += 1;
            }
            Kind::Niederreiter(generator) => {
                let mut unit = [0.0; KNOB_NUM];
                generator.next_point(&mut unit);
                let mut dims = unit.iter();
                for k in KnobType::ALL {
                    if free[k.index()] {
                        v[k] = dims.next().copied().unwrap_or(0.0) * 100.0;
                    }
                }
            }
            Kind::Sobol { points, index } => {
                if let Some(point) = points.get(*index % points.len().max(1)) {
                    let mut dims = point.iter();
                    for k in KnobType::ALL {
                        if free[k.index()] {
                            v[k] = dims.next().copied().unwrap_or(0.0) * 100.0;
                        }
                    }
                }
                *index += 1;
            }
            Kind::Multiple {
                base,
                knob,
                num_values,
                next,
                point,
            } => {
                let mut p = match point.take() {
                    Some(p) if *next < *num_values => p,
                    _ => {
                        *next = 0;
                        base.next_relative()
                    }
                };
                p[*knob] = if *num_values > 1 {
                    *next as f64 * 100.0 / (*num_values - 1) as f64
                } else {
                    0.0
                };
                *next += 1;
                *point = Some(p.clone());
                v = p;
            }
        }
        v
    }

    /// Restart the sequence from the beginning, including caller points.
    pub fn reset(&mut self) {
        self.points = self.initial_points.clone();
        match &mut self.kind {
            Kind::Random { rng, seed, .. } => {
                if seed.is_some() {
                    *rng = seeded(*seed);
                }
            }
            Kind::Halton { index, .. } => *index = 1,
            Kind::Niederreiter(generator) => {
                generator.reset();
                generator.next_point(&mut [0.0; KNOB_NUM]);
            }
            Kind::Sobol { index, .. } => *index = 0,
            Kind::Multiple {
                base, next, point, ..
            } => {
                base.reset();
                *next = 0;
                *point = None;
            }
        }
    }
}
