//! Tunable resource dimensions.
//!
//! A [`Knob`] maps a relative position in `[0, 100]` to one value of a
//! discrete, ordered set of real values (core counts, frequencies in kHz,
//! clock-modulation duty cycles, ...). Knobs hold state only: the
//! [`Configuration`](crate::configuration::Configuration) owns the hardware
//! handle and performs the actuation for each [`KnobType`].
//!
//! # Relative values
//!
//! A relative value `v` selects the real value at index
//! `round((len - 1) * v / 100)` of the allowed set, so `0` is always the
//! smallest and `100` the largest allowed value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Number of knob dimensions.
pub const KNOB_NUM: usize = 5;

/// Identifies one knob dimension.
///
/// Declaration order is also the order in which knobs are applied and the
/// outer-to-inner order of [`Configuration::all_real_combinations`](crate::configuration::Configuration::all_real_combinations).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnobType {
    /// Number of active worker threads, one per virtual core.
    VirtualCores,
    /// Hardware contexts used per physical core.
    Hyperthreading,
    /// Placement order of workers on virtual cores.
    Mapping,
    /// Userspace frequency of the domains hosting active workers, in kHz.
    Frequency,
    /// Clock modulation duty cycle of active virtual cores, in percent.
    ClockModulation,
}

impl KnobType {
    /// All knob types in declaration order.
    pub const ALL: [KnobType; KNOB_NUM] = [
        KnobType::VirtualCores,
        KnobType::Hyperthreading,
        KnobType::Mapping,
        KnobType::Frequency,
        KnobType::ClockModulation,
    ];

    /// Position of this knob in value arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            KnobType::VirtualCores => "virtual_cores",
            KnobType::Hyperthreading => "hyperthreading",
            KnobType::Mapping => "mapping",
            KnobType::Frequency => "frequency",
            KnobType::ClockModulation => "clock_modulation",
        }
    }
}

impl fmt::Display for KnobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Worker placement orders understood by the mapping knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    /// Fill the physical cores of one CPU before moving to the next.
    Linear = 0,
    /// Round-robin workers across CPUs.
    Interleaved = 1,
}

impl MappingType {
    /// Decode a real mapping-knob value.
    pub fn from_value(v: f64) -> Self {
        if v.round() as i64 == MappingType::Interleaved as i64 {
            MappingType::Interleaved
        } else {
            MappingType::Linear
        }
    }

    /// Real knob value for this mapping.
    pub fn value(self) -> f64 {
        self as i64 as f64
    }
}

/// Whether a [`KnobsValues`] holds relative or real values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Positions in `[0, 100]`.
    Relative,
    /// Native units (core counts, kHz, percent duty cycle).
    Real,
}

/// One value per knob, consistently tagged as relative or real.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobsValues {
    kind: ValueKind,
    values: [f64; KNOB_NUM],
}

/// Hashable identity of a real [`KnobsValues`], used to key observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValuesKey([u64; KNOB_NUM]);

impl KnobsValues {
    /// All-zero values of the given kind.
    pub fn new(kind: ValueKind) -> Self {
        Self {
            kind,
            values: [0.0; KNOB_NUM],
        }
    }

    /// Relative values, one per knob in declaration order.
    pub fn relative(values: [f64; KNOB_NUM]) -> Self {
        Self {
            kind: ValueKind::Relative,
            values,
        }
    }

    /// Real values, one per knob in declaration order.
    pub fn real(values: [f64; KNOB_NUM]) -> Self {
        Self {
            kind: ValueKind::Real,
            values,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_relative(&self) -> bool {
        self.kind == ValueKind::Relative
    }

    pub fn is_real(&self) -> bool {
        self.kind == ValueKind::Real
    }

    /// Identity of these values for map lookups.
    pub fn key(&self) -> ValuesKey {
        let mut bits = [0u64; KNOB_NUM];
        for (b, v) in bits.iter_mut().zip(self.values.iter()) {
            // +0.0 and -0.0 must hash the same
            *b = if *v == 0.0 { 0 } else { v.to_bits() };
        }
        ValuesKey(bits)
    }
}

impl Index<KnobType> for KnobsValues {
    type Output = f64;
    fn index(&self, k: KnobType) -> &f64 {
        &self.values[k.index()]
    }
}

impl IndexMut<KnobType> for KnobsValues {
    fn index_mut(&mut self, k: KnobType) -> &mut f64 {
        &mut self.values[k.index()]
    }
}

impl fmt::Display for KnobsValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            ValueKind::Relative => "rel",
            ValueKind::Real => "real",
        };
        write!(f, "{tag}[")?;
        for (i, k) in KnobType::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", k, self.values[i])?;
        }
        f.write_str("]")
    }
}

/// State of one tunable dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Knob {
    kind: KnobType,
    allowed: Vec<f64>,
    real: f64,
    relative: Option<f64>,
    locked: bool,
}

impl Knob {
    /// Create a knob over `allowed` values (sorted and deduplicated here).
    ///
    /// The knob starts at its maximum allowed value. When `allowed` is empty
    /// the knob is not applicable on this hardware and reports `fallback` as
    /// its real value.
    pub fn new(kind: KnobType, mut allowed: Vec<f64>, fallback: f64) -> Self {
        allowed.retain(|v| v.is_finite());
        allowed.sort_by(|a, b| a.total_cmp(b));
        allowed.dedup();
        let real = allowed.last().copied().unwrap_or(fallback);
        Self {
            kind,
            allowed,
            real,
            relative: None,
            locked: false,
        }
    }

    pub fn kind(&self) -> KnobType {
        self.kind
    }

    /// Current legal real values, ascending.
    pub fn allowed_values(&self) -> &[f64] {
        &self.allowed
    }

    pub fn real_value(&self) -> f64 {
        self.real
    }

    /// Last relative value applied, if any.
    pub fn relative_value(&self) -> Option<f64> {
        self.relative
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Whether this knob has anything to act on.
    pub fn is_applicable(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Whether the tuner has to search for this knob's value.
    pub fn auto_find(&self) -> bool {
        !self.locked && self.allowed.len() > 1
    }

    /// Real value a relative position would select.
    pub fn real_for_relative(&self, relative: f64) -> Option<f64> {
        if self.allowed.is_empty() {
            return None;
        }
        let relative = relative.clamp(0.0, 100.0);
        let last = (self.allowed.len() - 1) as f64;
        let index = (last * relative / 100.0).round() as usize;
        self.allowed.get(index.min(self.allowed.len() - 1)).copied()
    }

    /// Relative position of an allowed real value.
    pub fn relative_for_real(&self, real: f64) -> Option<f64> {
        let index = self.allowed.iter().position(|v| *v == real)?;
        if self.allowed.len() == 1 {
            Some(0.0)
        } else {
            Some(index as f64 * 100.0 / (self.allowed.len() - 1) as f64)
        }
    }

    /// Move to the value selected by `relative`.
    ///
    /// Does nothing on a knob without allowed values. Returns the new real
    /// value when one was selected.
    pub fn set_relative_value(&mut self, relative: f64) -> Option<f64> {
        let real = self.real_for_relative(relative)?;
        self.relative = Some(relative.clamp(0.0, 100.0));
        self.real = real;
        Some(real)
    }

    /// Move to `real`, which must be one of the allowed values.
    ///
    /// Returns `false` (and leaves the knob unchanged) otherwise.
    pub fn set_real_value(&mut self, real: f64) -> bool {
        if self.allowed.is_empty() {
            return real == self.real;
        }
        match self.relative_for_real(real) {
            Some(rel) => {
                self.relative = Some(rel);
                self.real = real;
                true
            }
            None => false,
        }
    }

    /// Restrict the allowed set to the allowed value closest to `v`.
    ///
    /// Calling it again with the same value changes nothing.
    pub fn lock(&mut self, v: f64) {
        if let Some(closest) = self
            .allowed
            .iter()
            .copied()
            .min_by(|a, b| (a - v).abs().total_cmp(&(b - v).abs()))
        {
            self.allowed = vec![closest];
            self.real = closest;
            self.relative = Some(0.0);
        }
        self.locked = true;
    }

    pub fn lock_to_max(&mut self) {
        if let Some(max) = self.allowed.last().copied() {
            self.lock(max);
        } else {
            self.locked = true;
        }
    }

    pub fn lock_to_min(&mut self) {
        if let Some(min) = self.allowed.first().copied() {
            self.lock(min);
        } else {
            self.locked = true;
        }
    }

    /// Drop allowed values above `max`, always keeping the smallest one.
    ///
    /// Returns `true` when the current real value had to move down.
    pub fn change_max(&mut self, max: f64) -> bool {
        if self.allowed.is_empty() {
            return false;
        }
        let min = self.allowed[0];
        self.allowed.retain(|v| *v <= max);
        if self.allowed.is_empty() {
            self.allowed.push(min);
        }
        let top = self.allowed[self.allowed.len() - 1];
        if self.real > top {
            self.real = top;
            self.relative = Some(100.0);
            true
        } else {
            false
        }
    }
}
