//! Model-free calibration after Li and Martinez.
//!
//! A binary search finds the fewest cores that meet the throughput floor at
//! the highest frequency, then a second one the lowest frequency that still
//! meets it on those cores. The search then moves up one core count at a
//! time, again looking for the lowest feasible frequency, for as long as
//! that lowers power. Feasibility is assumed monotone in both knobs.

use crate::configuration::Configuration;
use crate::hardware::Hardware;
use crate::knob::{KnobType, KnobsValues};
use std::ops::Range;
use tracing::debug;

/// Smallest feasible index in `range`, with the power observed there.
#[derive(Debug, Clone)]
struct Search {
    range: Range<usize>,
    found: Option<(usize, f64)>,
}

impl Search {
    fn new(range: Range<usize>, found: Option<(usize, f64)>) -> Self {
        Self { range, found }
    }

    fn next(&self) -> Option<usize> {
        (!self.range.is_empty()).then(|| self.range.start + (self.range.end - self.range.start) / 2)
    }

    fn record(&mut self, index: usize, feasible: bool, watts: f64) {
        if !self.range.contains(&index) {
            return;
        }
        if feasible {
            self.found = Some((index, watts));
            self.range.end = index;
        } else {
            self.range.start = index + 1;
        }
    }
}

#[derive(Debug, Clone)]
enum Phase {
    /// Core count at the highest frequency.
    Cores(Search),
    /// Frequency on a fixed core count.
    Frequency { cores: usize, search: Search },
    Done,
}

#[derive(Debug, Clone)]
pub(super) struct Bisection {
    base: KnobsValues,
    cores: Vec<f64>,
    frequencies: Vec<f64>,
    phase: Phase,
    pending: Option<(usize, usize)>,
    best_watts: Option<f64>,
}

fn ascending(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(f64::total_cmp);
    values.dedup();
    values
}

impl Bisection {
    /// Search around the values currently applied; knobs other than cores
    /// and frequency keep them.
    pub(super) fn new<H: Hardware>(configuration: &Configuration<H>) -> Self {
        let base = configuration.real_values();
        let choices = |kind: KnobType| {
            let knob = configuration.knob(kind);
            if knob.auto_find() {
                ascending(knob.allowed_values().to_vec())
            } else {
                vec![base[kind]]
            }
        };
        let frequencies = choices(KnobType::Frequency);
        let cores: Vec<f64> = choices(KnobType::VirtualCores)
            .into_iter()
            .filter(|&c| {
                let mut v = base.clone();
                v[KnobType::VirtualCores] = c;
                configuration.is_legal(&v)
            })
            .collect();
        Self {
            phase: Phase::Cores(Search::new(0..cores.len(), None)),
            base,
            cores,
            frequencies,
            pending: None,
            best_watts: None,
        }
    }

    fn top(&self) -> usize {
        self.frequencies.len().saturating_sub(1)
    }

    fn values(&self, cores: usize, frequency: usize) -> KnobsValues {
        let mut v = self.base.clone();
        v[KnobType::VirtualCores] = self.cores[cores];
        v[KnobType::Frequency] = self.frequencies[frequency];
        v
    }

    fn position(&self, values: &KnobsValues) -> Option<(usize, usize)> {
        let c = self
            .cores
            .iter()
            .position(|&c| c == values[KnobType::VirtualCores])?;
        let f = self
            .frequencies
            .iter()
            .position(|&f| f == values[KnobType::Frequency])?;
        Some((c, f))
    }

    fn probe(&mut self, cores: usize, frequency: usize) -> KnobsValues {
        self.pending = Some((cores, frequency));
        self.values(cores, frequency)
    }

    fn record(&mut self, cores: usize, frequency: usize, feasible: bool, watts: f64) {
        let top = self.top();
        match &mut self.phase {
            Phase::Cores(search) if frequency == top => search.record(cores, feasible, watts),
            Phase::Frequency { cores: c, search } if *c == cores => {
                search.record(frequency, feasible, watts)
            }
            _ => {}
        }
    }

    /// Account the observation of `current`, then return the next real
    /// values to try, or `None` once the search is over.
    pub(super) fn step(
        &mut self,
        current: &KnobsValues,
        feasible: bool,
        watts: f64,
    ) -> Option<KnobsValues> {
        let observed = self.position(current);
        match self.pending.take() {
            // not applied: ask again
            Some((c, f)) if observed != Some((c, f)) => return Some(self.probe(c, f)),
            _ => {}
        }
        if let Some((c, f)) = observed {
            self.record(c, f, feasible, watts);
        }
        self.advance()
    }

    fn advance(&mut self) -> Option<KnobsValues> {
        if self.cores.is_empty() || self.frequencies.is_empty() {
            return None;
        }
        loop {
            match &self.phase {
                Phase::Cores(search) => {
                    if let Some(c) = search.next() {
                        return Some(self.probe(c, self.top()));
                    }
                    self.phase = match search.found {
                        Some((cores, watts)) => Phase::Frequency {
                            cores,
                            search: Search::new(0..self.top(), Some((self.top(), watts))),
                        },
                        None => Phase::Done,
                    };
                }
                Phase::Frequency { cores, search } => {
                    if let Some(f) = search.next() {
                        let cores = *cores;
                        return Some(self.probe(cores, f));
                    }
                    let cores = *cores;
                    let found = search.found;
                    let improved = match (found, self.best_watts) {
                        (Some((_, w)), Some(best)) => w < best,
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    debug!(
                        cores = self.cores[cores],
                        frequency = ?found.map(|(f, _)| self.frequencies[f]),
                        improved,
                        "frequency search finished"
                    );
                    self.phase = match found {
                        Some((f, watts)) if improved && cores + 1 < self.cores.len() => {
                            self.best_watts = Some(watts);
                            // one more core never needs a higher frequency
                            Phase::Frequency {
                                cores: cores + 1,
                                search: Search::new(0..f + 1, None),
                            }
                        }
                        _ => Phase::Done,
                    };
                }
                Phase::Done => return None,
            }
        }
    }
}
