//! The set of knobs governing one managed computation.
//!
//! A [`Configuration`] owns one [`Knob`] per [`KnobType`] and the
//! [`Hardware`] handle that backs them. It is the only component that
//! actuates: [`Configuration::set_values`] applies knobs in declaration order
//! because the frequency and clock-modulation knobs act on the frequency
//! domains and virtual cores of the placement the structural knobs produce.
//!
//! # Combinations
//!
//! [`Configuration::all_real_combinations`] enumerates the Cartesian product
//! of the allowed values, outer-to-inner in declaration order (virtual cores
//! outermost, clock modulation innermost), skipping combinations with more
//! workers than the enabled hardware contexts. The list is built once and
//! cached until a knob's allowed set changes.

use crate::config::{MappingSetting, Parameters, UnusedCores};
use crate::cpuset::format_cpuset;
use crate::error::{Result, TuneError};
use crate::hardware::{Governor, Hardware};
use crate::knob::{Knob, KnobType, KnobsValues, MappingType, ValueKind, KNOB_NUM};
use crate::stats::ReconfigurationStats;
use crate::topology::Topology;
use crate::workers::WorkerPool;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Knob state plus the hardware it controls.
pub struct Configuration<H: Hardware> {
    hardware: H,
    knobs: [Knob; KNOB_NUM],
    unused: UnusedCores,
    controls_frequency: bool,
    freeze_timeout: Duration,
    placement: Vec<usize>,
    applied_frequency: Option<u64>,
    applied_modulation: Option<f64>,
    combinations: OnceLock<Vec<KnobsValues>>,
    stats: ReconfigurationStats,
}

impl<H: Hardware> Configuration<H> {
    /// Build the knobs for `hardware` and put frequency domains under
    /// userspace control when the tuner needs to set frequencies.
    ///
    /// # Errors
    ///
    /// `TuneError::Unreachable` when no worker can be placed, or an actuation
    /// error if a governor cannot be set.
    pub fn new(params: &Parameters, mut hardware: H, max_workers: usize) -> Result<Self> {
        let topo = hardware.topology();
        let settings = &params.knobs;
        if topo.num_virtual_cores() == 0 {
            return Err(TuneError::Unreachable("topology has no virtual cores".into()));
        }

        let max_ht = if settings.hyperthreading {
            topo.threads_per_core()
        } else {
            1
        };
        let slots = (topo.num_physical_cores() * max_ht)
            .min(max_workers)
            .min(settings.max_cores.unwrap_or(usize::MAX));
        if slots == 0 {
            return Err(TuneError::Unreachable(format!(
                "no worker slots (max_workers = {max_workers}, max_cores = {:?})",
                settings.max_cores
            )));
        }

        let mut cores = Knob::new(
            KnobType::VirtualCores,
            (1..=slots).map(|c| c as f64).collect(),
            slots as f64,
        );
        if !settings.cores {
            cores.lock_to_max();
        }

        let mut hyperthreading = Knob::new(
            KnobType::Hyperthreading,
            (1..=max_ht).map(|h| h as f64).collect(),
            1.0,
        );
        if !settings.hyperthreading {
            hyperthreading.lock_to_min();
        }

        let mappings = if topo.cpus.len() > 1 {
            vec![MappingType::Linear.value(), MappingType::Interleaved.value()]
        } else {
            vec![MappingType::Linear.value()]
        };
        let mut mapping = Knob::new(KnobType::Mapping, mappings, MappingType::Linear.value());
        match settings.mapping {
            MappingSetting::Auto => {}
            MappingSetting::Linear => mapping.lock(MappingType::Linear.value()),
            MappingSetting::Interleaved => mapping.lock(MappingType::Interleaved.value()),
        }

        let mut frequencies = topo.frequencies();
        if !settings.turbo_boost {
            frequencies.retain(|f| !Topology::is_turbo(*f));
        }
        let nominal_max = frequencies.last().copied().unwrap_or(0) as f64;
        let has_frequencies = !frequencies.is_empty();
        if !settings.frequency {
            frequencies.clear();
        }
        let frequency = Knob::new(
            KnobType::Frequency,
            frequencies.into_iter().map(|f| f as f64).collect(),
            nominal_max,
        );

        let modulation = Knob::new(
            KnobType::ClockModulation,
            if settings.clock_modulation {
                topo.clock_modulation.clone()
            } else {
                Vec::new()
            },
            100.0,
        );

        let controls_frequency =
            has_frequencies && (frequency.is_applicable() || params.unused_cores != UnusedCores::None);
        let domains = topo.domains.len();
        if controls_frequency {
            for domain in 0..domains {
                hardware.set_governor(domain, Governor::Userspace)?;
            }
        }

        let configuration = Self {
            hardware,
            knobs: [cores, hyperthreading, mapping, frequency, modulation],
            unused: params.unused_cores,
            controls_frequency,
            freeze_timeout: params.sampling.freeze_timeout(),
            placement: Vec::new(),
            applied_frequency: None,
            applied_modulation: None,
            combinations: OnceLock::new(),
            stats: ReconfigurationStats::default(),
        };
        info!(
            slots,
            free_knobs = ?configuration.free_knobs(),
            combinations = configuration.all_real_combinations().len(),
            "configuration ready"
        );
        Ok(configuration)
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    pub fn topology(&self) -> &Topology {
        self.hardware.topology()
    }

    pub fn knob(&self, kind: KnobType) -> &Knob {
        &self.knobs[kind.index()]
    }

    /// Virtual cores the workers currently run on.
    pub fn placement(&self) -> &[usize] {
        &self.placement
    }

    pub fn reconfiguration_stats(&self) -> &ReconfigurationStats {
        &self.stats
    }

    /// Which knobs the tuner has to search.
    pub fn free_knobs(&self) -> [bool; KNOB_NUM] {
        let mut free = [false; KNOB_NUM];
        for (f, k) in free.iter_mut().zip(self.knobs.iter()) {
            *f = k.auto_find();
        }
        free
    }

    /// Whether any knob still has a choice to make.
    pub fn knobs_change_needed(&self) -> bool {
        self.knobs.iter().any(Knob::auto_find)
    }

    /// Whether real `values` use no more workers than the selected contexts hold.
    pub fn is_legal(&self, values: &KnobsValues) -> bool {
        let ht = values[KnobType::Hyperthreading].max(1.0);
        values[KnobType::VirtualCores] <= self.topology().num_physical_cores() as f64 * ht
    }

    /// Every legal combination of allowed real values, knob-major.
    pub fn all_real_combinations(&self) -> &[KnobsValues] {
        self.combinations.get_or_init(|| {
            let sets: Vec<Vec<f64>> = self
                .knobs
                .iter()
                .map(|k| {
                    if k.is_applicable() {
                        k.allowed_values().to_vec()
                    } else {
                        vec![k.real_value()]
                    }
                })
                .collect();

            let mut out = Vec::with_capacity(sets.iter().map(Vec::len).product());
            let mut index = [0usize; KNOB_NUM];
            'outer: loop {
                let mut v = KnobsValues::new(ValueKind::Real);
                for (i, k) in KnobType::ALL.iter().enumerate() {
                    v[*k] = sets[i][index[i]];
                }
                if self.is_legal(&v) {
                    out.push(v);
                }
                // odometer, innermost knob first
                for i in (0..KNOB_NUM).rev() {
                    index[i] += 1;
                    if index[i] < sets[i].len() {
                        continue 'outer;
                    }
                    index[i] = 0;
                }
                break;
            }
            out
        })
    }

    /// Current real values.
    pub fn real_values(&self) -> KnobsValues {
        let mut v = KnobsValues::new(ValueKind::Real);
        for k in KnobType::ALL {
            v[k] = self.knob(k).real_value();
        }
        v
    }

    /// Convert to real values through the current allowed sets.
    ///
    /// Knobs without allowed values keep their current real value.
    pub fn to_real(&self, values: &KnobsValues) -> KnobsValues {
        if values.is_real() {
            return values.clone();
        }
        let mut real = KnobsValues::new(ValueKind::Real);
        for k in KnobType::ALL {
            let knob = self.knob(k);
            real[k] = knob
                .real_for_relative(values[k])
                .unwrap_or(knob.real_value());
        }
        real
    }

    /// Convert allowed real values to relative positions.
    pub fn to_relative(&self, values: &KnobsValues) -> KnobsValues {
        if values.is_relative() {
            return values.clone();
        }
        let mut rel = KnobsValues::new(ValueKind::Relative);
        for k in KnobType::ALL {
            rel[k] = self.knob(k).relative_for_real(values[k]).unwrap_or(0.0);
        }
        rel
    }

    /// Whether applying `values` would change nothing.
    ///
    /// Locked and non-applicable knobs never differ.
    pub fn equal(&self, values: &KnobsValues) -> bool {
        let real = self.to_real(values);
        KnobType::ALL.iter().all(|&k| {
            let knob = self.knob(k);
            knob.is_locked() || !knob.is_applicable() || knob.real_value() == real[k]
        })
    }

    /// Restrict a knob to a single value.
    pub fn lock(&mut self, kind: KnobType, value: f64) {
        self.knobs[kind.index()].lock(value);
        self.combinations = OnceLock::new();
    }

    /// Drop allowed values above `max`, e.g. when fewer cores are usable.
    pub fn change_max(&mut self, kind: KnobType, max: f64) {
        self.knobs[kind.index()].change_max(max);
        self.combinations = OnceLock::new();
    }

    /// Apply every knob at its maximum.
    pub fn max_all_knobs<W: WorkerPool + ?Sized>(&mut self, workers: &W) -> Result<()> {
        self.set_values(&KnobsValues::relative([100.0; KNOB_NUM]), workers)
    }

    /// Move to `values` (relative or real), actuating only what changes.
    ///
    /// Structural knobs go first and end with one worker reconfiguration;
    /// frequency and clock modulation then act on the new placement. Timing is
    /// recorded per knob and in total even when nothing changes.
    ///
    /// # Errors
    ///
    /// Actuation errors from the hardware or the worker pool. If the new
    /// placement never took effect the structural knobs roll back, so
    /// [`real_values`](Self::real_values) keeps describing what is applied.
    /// Knobs actuated after the placement keep the values applied so far.
    pub fn set_values<W: WorkerPool + ?Sized>(
        &mut self,
        values: &KnobsValues,
        workers: &W,
    ) -> Result<()> {
        let target = self.to_real(values);
        let started = Instant::now();

        let knobs = self.knobs.clone();
        let placement = self.placement.clone();
        let placement_changed = match self.set_structure(&target, workers) {
            Ok(changed) => changed,
            Err(e) => {
                if self.placement == placement {
                    self.knobs = knobs;
                }
                return Err(e);
            }
        };

        let step = Instant::now();
        if self.controls_frequency {
            let khz = self.knob(KnobType::Frequency).real_value() as u64;
            if placement_changed || self.applied_frequency != Some(khz) {
                let domains = self.topology().used_domains(&self.placement);
                for domain in domains {
                    self.hardware.set_frequency(domain, khz)?;
                }
                self.applied_frequency = Some(khz);
            }
        }
        self.stats.record_knob(KnobType::Frequency, step.elapsed());

        let step = Instant::now();
        if self.knob(KnobType::ClockModulation).is_applicable() {
            let duty = self.knob(KnobType::ClockModulation).real_value();
            if placement_changed || self.applied_modulation != Some(duty) {
                let mut cores = self.placement.clone();
                cores.sort_unstable();
                cores.dedup();
                for vc in cores {
                    self.hardware.set_clock_modulation(vc, duty)?;
                }
                self.applied_modulation = Some(duty);
            }
        }
        self.stats
            .record_knob(KnobType::ClockModulation, step.elapsed());
        self.stats.record_total(started.elapsed());

        if placement_changed {
            debug!(
                values = %self.real_values(),
                placement = %format_cpuset(&self.placement),
                "applied configuration"
            );
        }
        Ok(())
    }

    /// Cores, contexts and mapping; `true` when the placement moved.
    fn set_structure<W: WorkerPool + ?Sized>(
        &mut self,
        target: &KnobsValues,
        workers: &W,
    ) -> Result<bool> {
        let mut placement_changed = false;
        for kind in [
            KnobType::VirtualCores,
            KnobType::Hyperthreading,
            KnobType::Mapping,
        ] {
            let step = Instant::now();
            let knob = &mut self.knobs[kind.index()];
            if !knob.is_locked() && knob.is_applicable() && !knob.set_real_value(target[kind]) {
                return Err(TuneError::Unreachable(format!(
                    "{kind} cannot take value {}",
                    target[kind]
                )));
            }
            if kind == KnobType::Mapping {
                let placement = self.topology().placement(
                    MappingType::from_value(self.knob(KnobType::Mapping).real_value()),
                    self.knob(KnobType::Hyperthreading).real_value() as usize,
                    self.knob(KnobType::VirtualCores).real_value() as usize,
                );
                if placement != self.placement {
                    self.apply_placement(placement, workers)?;
                    placement_changed = true;
                }
            }
            self.stats.record_knob(kind, step.elapsed());
        }
        Ok(placement_changed)
    }

    fn apply_placement<W: WorkerPool + ?Sized>(
        &mut self,
        placement: Vec<usize>,
        workers: &W,
    ) -> Result<()> {
        if self.unused == UnusedCores::Off {
            let offline: Vec<usize> = placement
                .iter()
                .copied()
                .filter(|&vc| !self.hardware.is_online(vc))
                .collect();
            for vc in offline {
                self.hardware.hotplug(vc, true)?;
            }
        }

        // cores leaving the placement go back to full duty cycle
        if self.applied_modulation.is_some_and(|d| d < 100.0) {
            let leaving: Vec<usize> = self
                .placement
                .iter()
                .copied()
                .filter(|vc| !placement.contains(vc))
                .collect();
            for vc in leaving {
                self.hardware.set_clock_modulation(vc, 100.0)?;
            }
        }

        workers.reconfigure(&placement, self.freeze_timeout)?;
        self.placement = placement;

        if self.unused == UnusedCores::None {
            return Ok(());
        }
        let topo = self.topology();
        let used = topo.used_domains(&self.placement);
        let idle_domains: Vec<usize> = (0..topo.domains.len())
            .filter(|d| !used.contains(d))
            .collect();
        let min = topo.min_frequency();
        let unplug: Vec<usize> = if self.unused == UnusedCores::Off {
            topo.virtual_cores
                .iter()
                .filter(|vc| vc.hotpluggable && !self.placement.contains(&vc.id))
                .map(|vc| vc.id)
                .collect()
        } else {
            Vec::new()
        };

        if let (true, Some(min)) = (self.controls_frequency, min) {
            for domain in idle_domains {
                self.hardware.set_frequency(domain, min)?;
            }
        }
        for vc in unplug {
            if self.hardware.is_online(vc) {
                self.hardware.hotplug(vc, false)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KnobSettings;
    use crate::sim::{Call, SimulatedMachine, WorkloadModel};

    fn params(knobs: KnobSettings) -> Parameters {
        Parameters::new().with_knobs(knobs)
    }

    fn machine(cpus: usize, cores: usize, threads: usize) -> SimulatedMachine {
        SimulatedMachine::new(
            Topology::synthetic(cpus, cores, threads, vec![1_000_000, 1_500_000, 2_000_000]),
            WorkloadModel::default(),
        )
    }

    #[test]
    fn test_scenario_cores_by_frequency_combinations() {
        let m = machine(1, 8, 1);
        let c = Configuration::new(&params(KnobSettings::default()), m.hardware(), 8).unwrap();
        let combos = c.all_real_combinations();
        assert_eq!(combos.len(), 24);

        let mut keys: Vec<_> = combos.iter().map(KnobsValues::key).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 24);

        // knob-major: cores outermost, frequency inner
        assert_eq!(combos[0][KnobType::VirtualCores], 1.0);
        assert_eq!(combos[0][KnobType::Frequency], 1_000_000.0);
        assert_eq!(combos[1][KnobType::Frequency], 1_500_000.0);
        assert_eq!(combos[3][KnobType::VirtualCores], 2.0);
        assert_eq!(combos[23][KnobType::VirtualCores], 8.0);
    }

    #[test]
    fn test_combinations_skip_oversubscribed_contexts() {
        let m = machine(1, 2, 2);
        let knobs = KnobSettings::default()
            .with_hyperthreading(true)
            .with_frequency(false);
        let c = Configuration::new(&params(knobs), m.hardware(), 4).unwrap();
        // cores 1..4 x ht 1..2, minus (3,1) and (4,1)
        assert_eq!(c.all_real_combinations().len(), 6);
    }

    #[test]
    fn test_knobs_change_needed() {
        let m = machine(1, 4, 1);
        let c = Configuration::new(&params(KnobSettings::default()), m.hardware(), 4).unwrap();
        assert!(c.knobs_change_needed());

        let knobs = KnobSettings::default()
            .with_cores(false)
            .with_frequency(false);
        let c = Configuration::new(&params(knobs), m.hardware(), 4).unwrap();
        assert!(!c.knobs_change_needed());
        assert_eq!(c.all_real_combinations().len(), 1);
    }

    #[test]
    fn test_turbo_step_removed_unless_enabled() {
        let m = SimulatedMachine::new(
            Topology::synthetic(1, 2, 1, vec![1_200_000, 2_400_000, 2_401_000]),
            WorkloadModel::default(),
        );
        let c = Configuration::new(&params(KnobSettings::default()), m.hardware(), 2).unwrap();
        assert_eq!(
            c.knob(KnobType::Frequency).allowed_values(),
            &[1_200_000.0, 2_400_000.0]
        );

        let knobs = KnobSettings::default().with_turbo_boost(true);
        let c = Configuration::new(&params(knobs), m.hardware(), 2).unwrap();
        assert_eq!(c.knob(KnobType::Frequency).allowed_values().len(), 3);
    }

    #[test]
    fn test_frequency_applied_after_placement_on_active_domains() {
        let m = machine(2, 2, 1);
        let workers = m.workers();
        let mut c = Configuration::new(&params(KnobSettings::default()), m.hardware(), 4).unwrap();
        m.clear_calls();

        // two workers, linear mapping: both on CPU 0
        let v = KnobsValues::real([2.0, 1.0, 0.0, 1_500_000.0, 100.0]);
        c.set_values(&v, &workers).unwrap();
        assert_eq!(c.placement(), &[0, 1]);

        let calls = m.calls();
        let reconf = calls
            .iter()
            .position(|c| matches!(c, Call::Reconfigure(_)))
            .unwrap();
        let freq = calls
            .iter()
            .position(|c| matches!(c, Call::SetFrequency(0, 1_500_000)))
            .unwrap();
        assert!(reconf < freq);
        assert!(!calls.contains(&Call::SetFrequency(1, 1_500_000)));
    }

    #[test]
    fn test_reapplying_current_values_is_free() {
        let m = machine(2, 2, 1);
        let workers = m.workers();
        let mut c = Configuration::new(&params(KnobSettings::default()), m.hardware(), 4).unwrap();
        c.max_all_knobs(&workers).unwrap();
        m.clear_calls();

        let current = c.real_values();
        c.set_values(&current, &workers).unwrap();
        assert!(c.equal(&current));
        assert!(m.calls().is_empty());
        assert_eq!(
            c.reconfiguration_stats().total().count(),
            2,
            "fast path is timed too"
        );
        assert_eq!(
            c.reconfiguration_stats()
                .knob(KnobType::Frequency)
                .count(),
            2
        );
    }

    #[test]
    fn test_equal_ignores_locked_knobs() {
        let m = machine(1, 4, 1);
        let knobs = KnobSettings::default().with_cores(false);
        let c = Configuration::new(&params(knobs), m.hardware(), 4).unwrap();
        let mut v = c.real_values();
        v[KnobType::VirtualCores] = 1.0;
        assert!(c.equal(&v));
        v[KnobType::Frequency] = 1_000_000.0;
        assert!(!c.equal(&v));
    }

    #[test]
    fn test_relative_conversion() {
        let m = machine(1, 8, 1);
        let c = Configuration::new(&params(KnobSettings::default()), m.hardware(), 8).unwrap();
        let real = c.to_real(&KnobsValues::relative([0.0, 0.0, 0.0, 100.0, 0.0]));
        assert_eq!(real[KnobType::VirtualCores], 1.0);
        assert_eq!(real[KnobType::Frequency], 2_000_000.0);
        assert_eq!(real[KnobType::ClockModulation], 100.0);

        let back = c.to_real(&c.to_relative(&real));
        assert_eq!(back, real);
    }

    #[test]
    fn test_unused_cores_off_unplugs_and_lowers_frequency() {
        let m = machine(2, 2, 1);
        let workers = m.workers();
        let mut p = params(KnobSettings::default().with_frequency(false));
        p.unused_cores = UnusedCores::Off;
        let mut c = Configuration::new(&p, m.hardware(), 4).unwrap();
        m.clear_calls();

        c.set_values(&KnobsValues::real([2.0, 1.0, 0.0, 2_000_000.0, 100.0]), &workers)
            .unwrap();
        let calls = m.calls();
        assert!(calls.contains(&Call::SetFrequency(1, 1_000_000)));
        assert!(calls.contains(&Call::Hotplug(2, false)));
        assert!(calls.contains(&Call::Hotplug(3, false)));
        assert!(!c.hardware().is_online(3));

        // growing again brings cores back before the workers move
        m.clear_calls();
        c.set_values(&KnobsValues::real([4.0, 1.0, 0.0, 2_000_000.0, 100.0]), &workers)
            .unwrap();
        let calls = m.calls();
        let plug = calls
            .iter()
            .position(|c| *c == Call::Hotplug(3, true))
            .unwrap();
        let reconf = calls
            .iter()
            .position(|c| matches!(c, Call::Reconfigure(_)))
            .unwrap();
        assert!(plug < reconf);
    }

    #[test]
    fn test_actuation_failure_propagates() {
        let m = machine(1, 4, 1);
        let workers = m.workers();
        let mut c = Configuration::new(&params(KnobSettings::default()), m.hardware(), 4).unwrap();
        c.max_all_knobs(&workers).unwrap();
        m.fail_frequency_changes(true);
        let err = c
            .set_values(&KnobsValues::relative([100.0, 0.0, 0.0, 0.0, 0.0]), &workers)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Actuation);
    }

    #[test]
    fn test_failed_reconfiguration_keeps_applied_values() {
        let m = machine(1, 8, 1);
        let workers = m.workers();
        let mut c = Configuration::new(&params(KnobSettings::default()), m.hardware(), 8).unwrap();
        c.max_all_knobs(&workers).unwrap();
        let before = c.real_values();
        let placement = c.placement().to_vec();

        m.fail_reconfigurations(true);
        let err = c
            .set_values(&KnobsValues::relative([0.0, 0.0, 0.0, 0.0, 0.0]), &workers)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Actuation);
        assert_eq!(c.real_values(), before);
        assert_eq!(c.placement(), placement.as_slice());
        assert!(c.equal(&before));

        // the rolled back knobs still drive the next attempt
        m.fail_reconfigurations(false);
        c.set_values(&KnobsValues::relative([0.0, 0.0, 0.0, 100.0, 0.0]), &workers)
            .unwrap();
        assert_eq!(c.real_values()[KnobType::VirtualCores], 1.0);
        assert_eq!(m.placement().len(), 1);
    }

    #[test]
    fn test_change_max_refreshes_combinations() {
        let m = machine(1, 8, 1);
        let mut c = Configuration::new(&params(KnobSettings::default()), m.hardware(), 8).unwrap();
        assert_eq!(c.all_real_combinations().len(), 24);
        c.change_max(KnobType::VirtualCores, 4.0);
        assert_eq!(c.all_real_combinations().len(), 12);
    }
}
