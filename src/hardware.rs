//! Narrow interface to the machine's power-management controls.
//!
//! The [`Configuration`](crate::configuration::Configuration) is the only
//! owner of a [`Hardware`] handle while a computation is managed; nothing else
//! changes governors, frequencies, duty cycles or online state.
//!
//! [`SysfsHardware`] drives a Linux machine through cpufreq, CPU hotplug,
//! the `IA32_CLOCK_MODULATION` MSR and powercap RAPL energy counters. The
//! [`sim`](crate::sim) module provides an in-memory implementation.

use crate::error::{Result, TuneError};
use crate::knob::KnobType;
use crate::topology::Topology;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// cpufreq scaling governors the tuner uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Governor {
    Userspace,
    Powersave,
    Performance,
    Ondemand,
}

impl Governor {
    pub fn as_str(self) -> &'static str {
        match self {
            Governor::Userspace => "userspace",
            Governor::Powersave => "powersave",
            Governor::Performance => "performance",
            Governor::Ondemand => "ondemand",
        }
    }
}

/// Hardware operations the tuner needs.
pub trait Hardware: Send {
    /// Layout of the machine.
    fn topology(&self) -> &Topology;

    /// Set the scaling governor of a frequency domain.
    fn set_governor(&mut self, domain: usize, governor: Governor) -> Result<()>;

    /// Set the userspace frequency (kHz) of a frequency domain.
    fn set_frequency(&mut self, domain: usize, khz: u64) -> Result<()>;

    /// Set the clock modulation duty cycle (percent) of a virtual core.
    fn set_clock_modulation(&mut self, virtual_core: usize, percent: f64) -> Result<()>;

    /// Bring a virtual core online or take it offline.
    fn hotplug(&mut self, virtual_core: usize, online: bool) -> Result<()>;

    fn is_online(&self, virtual_core: usize) -> bool;

    /// Joules consumed since the last [`reset_energy`](Hardware::reset_energy).
    fn read_joules(&mut self) -> Result<f64>;

    fn reset_energy(&mut self) -> Result<()>;
}

const MSR_IA32_CLOCK_MODULATION: u64 = 0x19A;

/// Duty cycles supported through `IA32_CLOCK_MODULATION` (12.5% steps).
pub fn clock_modulation_steps() -> Vec<f64> {
    (1..=8).map(|i| i as f64 * 12.5).collect()
}

#[derive(Debug)]
struct RaplZone {
    energy: PathBuf,
    max_range_uj: u64,
    last_uj: u64,
    accumulated_uj: u64,
}

/// Linux implementation backed by sysfs, powercap and `/dev/cpu/*/msr`.
#[derive(Debug)]
pub struct SysfsHardware {
    topology: Topology,
    cpu_root: PathBuf,
    msr_root: PathBuf,
    zones: Vec<RaplZone>,
}

impl SysfsHardware {
    /// Probe the running machine.
    pub fn new() -> Result<Self> {
        let cpu_root = Path::new("/sys/devices/system/cpu");
        Self::with_topology(
            Topology::discover(cpu_root)?,
            cpu_root,
            Path::new("/sys/class/powercap"),
            Path::new("/dev/cpu"),
        )
    }

    /// Probe a machine whose sysfs, powercap and msr trees live elsewhere.
    pub fn with_roots(cpu_root: &Path, powercap_root: &Path, msr_root: &Path) -> Result<Self> {
        Self::with_topology(Topology::from_sysfs(cpu_root)?, cpu_root, powercap_root, msr_root)
    }

    fn with_topology(
        mut topology: Topology,
        cpu_root: &Path,
        powercap_root: &Path,
        msr_root: &Path,
    ) -> Result<Self> {
        let has_msr = topology
            .virtual_cores
            .first()
            .map(|vc| msr_root.join(format!("{}/msr", vc.id)).exists())
            .unwrap_or(false);
        if has_msr {
            topology.clock_modulation = clock_modulation_steps();
        }

        let mut zones = Vec::new();
        if let Ok(entries) = std::fs::read_dir(powercap_root) {
            let mut names: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        // packages only; subzones (intel-rapl:0:0) are already included
                        .map(|n| n.starts_with("intel-rapl:") && n.matches(':').count() == 1)
                        .unwrap_or(false)
                })
                .collect();
            names.sort();
            for dir in names {
                let energy = dir.join("energy_uj");
                let max_range_uj = read_u64(&dir.join("max_energy_range_uj")).unwrap_or(u64::MAX);
                let last_uj = read_u64(&energy)?;
                zones.push(RaplZone {
                    energy,
                    max_range_uj,
                    last_uj,
                    accumulated_uj: 0,
                });
            }
        }
        if zones.is_empty() {
            warn!("no RAPL energy counters found; power readings will be zero");
        }
        debug!(
            virtual_cores = topology.num_virtual_cores(),
            domains = topology.domains.len(),
            rapl_zones = zones.len(),
            "probed machine"
        );

        Ok(Self {
            topology,
            cpu_root: cpu_root.to_path_buf(),
            msr_root: msr_root.to_path_buf(),
            zones,
        })
    }

    fn domain_cpu(&self, domain: usize) -> Result<usize> {
        self.topology
            .domains
            .get(domain)
            .and_then(|d| d.virtual_cores.first().copied())
            .ok_or_else(|| TuneError::Unreachable(format!("unknown frequency domain {domain}")))
    }

    fn write(&self, knob: KnobType, path: PathBuf, value: &str) -> Result<()> {
        std::fs::write(&path, value)
            .map_err(|e| TuneError::actuation(knob, format!("{}: {e}", path.display())))
    }
}

impl Hardware for SysfsHardware {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn set_governor(&mut self, domain: usize, governor: Governor) -> Result<()> {
        let cpu = self.domain_cpu(domain)?;
        let path = self
            .cpu_root
            .join(format!("cpu{cpu}/cpufreq/scaling_governor"));
        self.write(KnobType::Frequency, path, governor.as_str())
    }

    fn set_frequency(&mut self, domain: usize, khz: u64) -> Result<()> {
        let cpu = self.domain_cpu(domain)?;
        let path = self.cpu_root.join(format!("cpu{cpu}/cpufreq/scaling_setspeed"));
        self.write(KnobType::Frequency, path, &khz.to_string())
    }

    fn set_clock_modulation(&mut self, virtual_core: usize, percent: f64) -> Result<()> {
        // bit 4 enables modulation, bits 1-3 hold the duty cycle in 12.5% steps
        let value: u64 = if percent >= 100.0 {
            0
        } else {
            let step = ((percent / 12.5).round() as u64).clamp(1, 7);
            (1 << 4) | (step << 1)
        };
        let path = self.msr_root.join(format!("{virtual_core}/msr"));
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| TuneError::actuation(KnobType::ClockModulation, e))?;
        file.write_all_at(&value.to_le_bytes(), MSR_IA32_CLOCK_MODULATION)
            .map_err(|e| TuneError::actuation(KnobType::ClockModulation, e))
    }

    fn hotplug(&mut self, virtual_core: usize, online: bool) -> Result<()> {
        let path = self.cpu_root.join(format!("cpu{virtual_core}/online"));
        self.write(KnobType::VirtualCores, path, if online { "1" } else { "0" })
    }

    fn is_online(&self, virtual_core: usize) -> bool {
        match std::fs::read_to_string(self.cpu_root.join(format!("cpu{virtual_core}/online"))) {
            Ok(s) => s.trim() == "1",
            // cores without an online file cannot be unplugged
            Err(_) => true,
        }
    }

    fn read_joules(&mut self) -> Result<f64> {
        let mut total_uj = 0u64;
        for zone in &mut self.zones {
            let now = read_u64(&zone.energy)?;
            let delta = if now >= zone.last_uj {
                now - zone.last_uj
            } else {
                // counter wrapped
                zone.max_range_uj.saturating_sub(zone.last_uj) + now
            };
            zone.accumulated_uj = zone.accumulated_uj.saturating_add(delta);
            zone.last_uj = now;
            total_uj = total_uj.saturating_add(zone.accumulated_uj);
        }
        Ok(total_uj as f64 / 1e6)
    }

    fn reset_energy(&mut self) -> Result<()> {
        for zone in &mut self.zones {
            zone.last_uj = read_u64(&zone.energy)?;
            zone.accumulated_uj = 0;
        }
        Ok(())
    }
}

fn read_u64(path: &Path) -> Result<u64> {
    let text = std::fs::read_to_string(path).map_err(|e| TuneError::io(path, e))?;
    text.trim()
        .parse()
        .map_err(|_| TuneError::Sampling(format!("unparsable counter in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTree {
        root: PathBuf,
    }

    impl FakeTree {
        fn new(tag: &str) -> Self {
            let root = std::env::temp_dir().join(format!(
                "tuneloop-hw-{tag}-{}",
                std::process::id()
            ));
            let _ = std::fs::remove_dir_all(&root);
            let cpu = root.join("cpu");
            std::fs::create_dir_all(&cpu).unwrap();
            std::fs::write(cpu.join("online"), "0-1\n").unwrap();
            for id in 0..2 {
                let dir = cpu.join(format!("cpu{id}"));
                std::fs::create_dir_all(dir.join("topology")).unwrap();
                std::fs::create_dir_all(dir.join("cpufreq")).unwrap();
                std::fs::write(dir.join("topology/physical_package_id"), "0").unwrap();
                std::fs::write(dir.join("topology/core_id"), id.to_string()).unwrap();
                std::fs::write(dir.join("cpufreq/related_cpus"), "0-1").unwrap();
                std::fs::write(dir.join("cpufreq/cpuinfo_min_freq"), "800000").unwrap();
                std::fs::write(dir.join("cpufreq/cpuinfo_max_freq"), "3000000").unwrap();
                std::fs::write(dir.join("online"), "1").unwrap();
            }
            let zone = root.join("powercap/intel-rapl:0");
            std::fs::create_dir_all(&zone).unwrap();
            std::fs::write(zone.join("energy_uj"), "1000000").unwrap();
            std::fs::write(zone.join("max_energy_range_uj"), "5000000").unwrap();
            std::fs::create_dir_all(root.join("msr")).unwrap();
            Self { root }
        }

        fn hardware(&self) -> SysfsHardware {
            SysfsHardware::with_roots(
                &self.root.join("cpu"),
                &self.root.join("powercap"),
                &self.root.join("msr"),
            )
            .unwrap()
        }
    }

    impl Drop for FakeTree {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn test_probe_fake_machine() {
        let tree = FakeTree::new("probe");
        let hw = tree.hardware();
        assert_eq!(hw.topology().num_virtual_cores(), 2);
        assert_eq!(hw.topology().domains.len(), 1);
        assert_eq!(hw.topology().frequencies(), vec![800_000, 3_000_000]);
        assert!(hw.topology().clock_modulation.is_empty());
    }

    #[test]
    fn test_governor_frequency_and_hotplug_writes() {
        let tree = FakeTree::new("writes");
        let mut hw = tree.hardware();
        hw.set_governor(0, Governor::Userspace).unwrap();
        hw.set_frequency(0, 800_000).unwrap();
        hw.hotplug(1, false).unwrap();

        let cpu0 = tree.root.join("cpu/cpu0/cpufreq");
        assert_eq!(
            std::fs::read_to_string(cpu0.join("scaling_governor")).unwrap(),
            "userspace"
        );
        assert_eq!(
            std::fs::read_to_string(cpu0.join("scaling_setspeed")).unwrap(),
            "800000"
        );
        assert!(!hw.is_online(1));
        assert!(hw.is_online(0));
        assert!(hw.set_governor(7, Governor::Powersave).is_err());
    }

    #[test]
    fn test_energy_accumulates_across_wraparound() {
        let tree = FakeTree::new("energy");
        let mut hw = tree.hardware();
        let counter = tree.root.join("powercap/intel-rapl:0/energy_uj");

        hw.reset_energy().unwrap();
        std::fs::write(&counter, "3000000").unwrap();
        assert!((hw.read_joules().unwrap() - 2.0).abs() < 1e-9);

        // wraps at 5 J: 3 J -> 5 J -> 1 J is 3 J more
        std::fs::write(&counter, "1000000").unwrap();
        assert!((hw.read_joules().unwrap() - 5.0).abs() < 1e-9);

        hw.reset_energy().unwrap();
        assert_eq!(hw.read_joules().unwrap(), 0.0);
    }

    #[test]
    fn test_clock_modulation_without_msr_fails() {
        let tree = FakeTree::new("msr");
        let mut hw = tree.hardware();
        let err = hw.set_clock_modulation(0, 50.0).unwrap_err();
        assert!(matches!(
            err,
            TuneError::Actuation {
                knob: KnobType::ClockModulation,
                ..
            }
        ));
    }

    #[test]
    fn test_clock_modulation_steps() {
        let steps = clock_modulation_steps();
        assert_eq!(steps.len(), 8);
        assert_eq!(steps[0], 12.5);
        assert_eq!(steps[7], 100.0);
    }
}
