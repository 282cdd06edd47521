//! CPU topology and worker placement.
//!
//! The topology lists CPUs (sockets), their physical cores, the virtual cores
//! (hardware contexts) of each physical core, and the frequency domains
//! virtual cores share. It is either described synthetically or read from
//! Linux sysfs. With the `hwloc` feature the core layout comes from hwloc
//! (through `hwlocality`) and only the cpufreq facts are read from sysfs.
//!
//! # Placement
//!
//! [`Topology::placement`] turns the three structural knobs (core count,
//! hyperthreading level, mapping) into the ordered list of virtual cores the
//! workers run on. Contexts are used level by level: every physical core gets
//! its first context before any gets a second one.
//!
//! - Linear: the physical cores of CPU 0, then CPU 1, ...
//! - Interleaved: core 0 of every CPU, then core 1 of every CPU, ...
//!
//! Requesting more workers than the order holds wraps around.

use crate::cpuset::parse_cpuset;
use crate::error::{Result, TuneError};
use crate::knob::MappingType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A hardware context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualCore {
    /// OS CPU number.
    pub id: usize,
    /// Index into [`Topology::physical_cores`].
    pub physical_core: usize,
    /// Index into [`Topology::cpus`].
    pub cpu: usize,
    /// Index into [`Topology::domains`].
    pub domain: usize,
    /// Whether the core can be taken offline.
    pub hotpluggable: bool,
}

/// A physical core and its contexts, ordered by context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalCore {
    pub cpu: usize,
    pub virtual_cores: Vec<usize>,
}

/// A CPU package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cpu {
    pub physical_cores: Vec<usize>,
}

/// Virtual cores that always run at the same frequency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyDomain {
    pub virtual_cores: Vec<usize>,
    /// Available frequencies in kHz, ascending.
    pub frequencies: Vec<u64>,
}

/// Machine layout as seen by the tuner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub cpus: Vec<Cpu>,
    pub physical_cores: Vec<PhysicalCore>,
    pub virtual_cores: Vec<VirtualCore>,
    pub domains: Vec<FrequencyDomain>,
    /// Clock modulation duty cycles in percent; empty when unsupported.
    pub clock_modulation: Vec<f64>,
    /// (kHz, volts) pairs; empty to use a nominal linear curve.
    pub voltages: Vec<(u64, f64)>,
}

impl Topology {
    /// Regular machine with one frequency domain per CPU.
    ///
    /// Virtual cores are numbered the way Linux numbers them: the first
    /// context of every physical core first, then the second contexts.
    pub fn synthetic(
        cpus: usize,
        cores_per_cpu: usize,
        threads_per_core: usize,
        frequencies: Vec<u64>,
    ) -> Self {
        let physical = cpus * cores_per_cpu;
        let mut topo = Topology {
            cpus: Vec::with_capacity(cpus),
            physical_cores: Vec::with_capacity(physical),
            virtual_cores: Vec::with_capacity(physical * threads_per_core),
            domains: Vec::with_capacity(cpus),
            clock_modulation: Vec::new(),
            voltages: Vec::new(),
        };
        let mut frequencies = frequencies;
        frequencies.sort_unstable();
        frequencies.dedup();

        for cpu in 0..cpus {
            topo.cpus.push(Cpu {
                physical_cores: (cpu * cores_per_cpu..(cpu + 1) * cores_per_cpu).collect(),
            });
            topo.domains.push(FrequencyDomain {
                virtual_cores: Vec::new(),
                frequencies: frequencies.clone(),
            });
        }
        for pc in 0..physical {
            topo.physical_cores.push(PhysicalCore {
                cpu: pc / cores_per_cpu.max(1),
                virtual_cores: Vec::new(),
            });
        }
        for ctx in 0..threads_per_core {
            for pc in 0..physical {
                let id = ctx * physical + pc;
                let cpu = topo.physical_cores[pc].cpu;
                topo.physical_cores[pc].virtual_cores.push(id);
                topo.domains[cpu].virtual_cores.push(id);
                topo.virtual_cores.push(VirtualCore {
                    id,
                    physical_core: pc,
                    cpu,
                    domain: cpu,
                    hotpluggable: id != 0,
                });
            }
        }
        topo.virtual_cores.sort_by_key(|vc| vc.id);
        topo
    }

    /// Declare clock modulation support with the given duty cycles.
    pub fn with_clock_modulation(mut self, steps: Vec<f64>) -> Self {
        self.clock_modulation = steps;
        self
    }

    /// Use a measured voltage table instead of the nominal curve.
    pub fn with_voltages(mut self, mut table: Vec<(u64, f64)>) -> Self {
        table.sort_by_key(|(f, _)| *f);
        self.voltages = table;
        self
    }

    /// Read the layout of the online CPUs under a sysfs cpu directory
    /// (normally `/sys/devices/system/cpu`).
    pub fn from_sysfs(root: &Path) -> Result<Self> {
        let online = parse_cpuset(&read_trimmed(&root.join("online"))?)?;

        let mut contexts = Vec::with_capacity(online.len());
        for &id in &online {
            let dir = root.join(format!("cpu{id}"));
            let package = read_trimmed(&dir.join("topology/physical_package_id"))?
                .parse::<i64>()
                .unwrap_or(0)
                .max(0) as usize;
            let core = read_trimmed(&dir.join("topology/core_id"))?
                .parse::<usize>()
                .map_err(|_| TuneError::Unreachable(format!("bad core_id for cpu{id}")))?;
            contexts.push(RawContext::read(root, id, package, core)?);
        }
        Ok(Self::assemble(contexts))
    }

    /// Core layout from hwloc, frequency domains from the cpufreq entries
    /// under `root`.
    ///
    /// # Errors
    ///
    /// `TuneError::Unreachable` if hwloc cannot build a topology or reports
    /// no processing units.
    #[cfg(feature = "hwloc")]
    pub fn from_hwloc(root: &Path) -> Result<Self> {
        use hwlocality::object::types::ObjectType;

        let hw = hwlocality::Topology::new()
            .map_err(|e| TuneError::Unreachable(format!("hwlocality error: {e}")))?;
        let packages: Vec<Vec<usize>> = hw
            .objects_with_type(ObjectType::Package)
            .map(|p| {
                p.cpuset()
                    .map(|set| set.iter_set().map(|c| c.into()).collect::<Vec<usize>>())
                    .unwrap_or_default()
            })
            .collect();

        let mut contexts = Vec::new();
        for (core, obj) in hw.objects_with_type(ObjectType::Core).enumerate() {
            let Some(set) = obj.cpuset() else { continue };
            for id in set.iter_set().map(|c| c.into()).collect::<Vec<usize>>() {
                let package = packages.iter().position(|p| p.contains(&id)).unwrap_or(0);
                contexts.push(RawContext::read(root, id, package, core)?);
            }
        }
        if contexts.is_empty() {
            return Err(TuneError::Unreachable(
                "hwloc reported no processing units".into(),
            ));
        }
        contexts.sort_by_key(|c| c.id);
        Ok(Self::assemble(contexts))
    }

    /// The machine's layout: hwloc when the feature is enabled and works,
    /// sysfs otherwise.
    pub fn discover(root: &Path) -> Result<Self> {
        #[cfg(feature = "hwloc")]
        match Self::from_hwloc(root) {
            Ok(topology) => return Ok(topology),
            Err(e) => tracing::debug!(%e, "hwloc discovery failed, reading sysfs"),
        }
        Self::from_sysfs(root)
    }

    /// Renumber packages, cores and domains densely, in ascending order of
    /// the ids the OS reported.
    fn assemble(contexts: Vec<RawContext>) -> Self {
        let mut packages: BTreeMap<usize, usize> = BTreeMap::new();
        let mut cores: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        let mut domains: BTreeMap<usize, usize> = BTreeMap::new();
        for r in &contexts {
            packages.entry(r.package).or_insert(0);
            cores.entry((r.package, r.core)).or_insert(0);
            domains.entry(r.domain_key).or_insert(0);
        }
        for (i, v) in packages.values_mut().enumerate() {
            *v = i;
        }
        for (i, v) in cores.values_mut().enumerate() {
            *v = i;
        }
        for (i, v) in domains.values_mut().enumerate() {
            *v = i;
        }

        let mut topo = Topology {
            cpus: vec![Cpu { physical_cores: Vec::new() }; packages.len()],
            physical_cores: Vec::with_capacity(cores.len()),
            virtual_cores: Vec::with_capacity(contexts.len()),
            domains: vec![
                FrequencyDomain {
                    virtual_cores: Vec::new(),
                    frequencies: Vec::new(),
                };
                domains.len()
            ],
            clock_modulation: Vec::new(),
            voltages: Vec::new(),
        };
        for (&(package, _), _) in cores.iter() {
            let cpu = packages[&package];
            topo.cpus[cpu].physical_cores.push(topo.physical_cores.len());
            topo.physical_cores.push(PhysicalCore {
                cpu,
                virtual_cores: Vec::new(),
            });
        }
        for r in contexts {
            let cpu = packages[&r.package];
            let pc = cores[&(r.package, r.core)];
            let domain = domains[&r.domain_key];
            topo.physical_cores[pc].virtual_cores.push(r.id);
            topo.domains[domain].virtual_cores.push(r.id);
            if topo.domains[domain].frequencies.is_empty() {
                topo.domains[domain].frequencies = r.frequencies;
            }
            topo.virtual_cores.push(VirtualCore {
                id: r.id,
                physical_core: pc,
                cpu,
                domain,
                hotpluggable: r.hotpluggable,
            });
        }
        topo
    }

    pub fn num_virtual_cores(&self) -> usize {
        self.virtual_cores.len()
    }

    pub fn num_physical_cores(&self) -> usize {
        self.physical_cores.len()
    }

    /// Largest number of contexts on any physical core.
    pub fn threads_per_core(&self) -> usize {
        self.physical_cores
            .iter()
            .map(|pc| pc.virtual_cores.len())
            .max()
            .unwrap_or(1)
            .max(1)
    }

    pub fn virtual_core(&self, id: usize) -> Option<&VirtualCore> {
        self.virtual_cores.iter().find(|vc| vc.id == id)
    }

    /// Frequencies every domain supports, ascending.
    pub fn frequencies(&self) -> Vec<u64> {
        let mut domains = self.domains.iter().filter(|d| !d.frequencies.is_empty());
        let Some(first) = domains.next() else {
            return Vec::new();
        };
        let mut common = first.frequencies.clone();
        for d in domains {
            common.retain(|f| d.frequencies.contains(f));
        }
        common
    }

    pub fn min_frequency(&self) -> Option<u64> {
        self.frequencies().first().copied()
    }

    pub fn max_frequency(&self) -> Option<u64> {
        self.frequencies().last().copied()
    }

    /// Whether `khz` is a turbo-boost step: the value sysfs reports for turbo
    /// is the nominal maximum plus 1 MHz, e.g. `2401000`.
    pub fn is_turbo(khz: u64) -> bool {
        khz % 10_000 == 1_000
    }

    /// Supply voltage at a frequency.
    pub fn voltage(&self, khz: u64) -> f64 {
        if self.voltages.is_empty() {
            let (min, max) = match (self.min_frequency(), self.max_frequency()) {
                (Some(min), Some(max)) if max > min => (min as f64, max as f64),
                _ => return 1.0,
            };
            let t = ((khz as f64 - min) / (max - min)).clamp(0.0, 1.0);
            return 0.8 + 0.4 * t;
        }
        let first = self.voltages[0];
        if khz <= first.0 {
            return first.1;
        }
        for pair in self.voltages.windows(2) {
            let ((f0, v0), (f1, v1)) = (pair[0], pair[1]);
            if khz <= f1 {
                let t = (khz - f0) as f64 / (f1 - f0).max(1) as f64;
                return v0 + (v1 - v0) * t;
            }
        }
        self.voltages[self.voltages.len() - 1].1
    }

    /// Every virtual core in placement order for a mapping and hyperthreading level.
    pub fn placement_order(&self, mapping: MappingType, ht_level: usize) -> Vec<usize> {
        let ht_level = ht_level.clamp(1, self.threads_per_core());
        let mut order = Vec::with_capacity(self.num_physical_cores() * ht_level);
        for ctx in 0..ht_level {
            let mut push = |pc: usize| {
                if let Some(&vc) = self.physical_cores[pc].virtual_cores.get(ctx) {
                    order.push(vc);
                }
            };
            match mapping {
                MappingType::Linear => {
                    for cpu in &self.cpus {
                        cpu.physical_cores.iter().for_each(|&pc| push(pc));
                    }
                }
                MappingType::Interleaved => {
                    let widest = self
                        .cpus
                        .iter()
                        .map(|c| c.physical_cores.len())
                        .max()
                        .unwrap_or(0);
                    for j in 0..widest {
                        for cpu in &self.cpus {
                            if let Some(&pc) = cpu.physical_cores.get(j) {
                                push(pc);
                            }
                        }
                    }
                }
            }
        }
        order
    }

    /// Virtual cores for `cores` workers, wrapping when oversubscribed.
    pub fn placement(&self, mapping: MappingType, ht_level: usize, cores: usize) -> Vec<usize> {
        let order = self.placement_order(mapping, ht_level);
        if order.is_empty() {
            return Vec::new();
        }
        order.iter().copied().cycle().take(cores).collect()
    }

    /// Number of distinct physical cores hosting the given virtual cores.
    pub fn used_physical_cores(&self, placement: &[usize]) -> usize {
        let mut used: Vec<usize> = placement
            .iter()
            .filter_map(|&id| self.virtual_core(id).map(|vc| vc.physical_core))
            .collect();
        used.sort_unstable();
        used.dedup();
        used.len()
    }

    /// Frequency domains hosting at least one of the given virtual cores, ascending.
    pub fn used_domains(&self, placement: &[usize]) -> Vec<usize> {
        let mut used: Vec<usize> = placement
            .iter()
            .filter_map(|&id| self.virtual_core(id).map(|vc| vc.domain))
            .collect();
        used.sort_unstable();
        used.dedup();
        used
    }
}

/// One online hardware context as the OS reports it.
struct RawContext {
    id: usize,
    package: usize,
    core: usize,
    domain_key: usize,
    frequencies: Vec<u64>,
    hotpluggable: bool,
}

impl RawContext {
    /// Complete the context with the cpufreq and hotplug entries of `cpu{id}`.
    fn read(root: &Path, id: usize, package: usize, core: usize) -> Result<Self> {
        let dir = root.join(format!("cpu{id}"));
        let domain_key = match read_trimmed(&dir.join("cpufreq/related_cpus")) {
            Ok(list) => parse_cpuset(&list)?.first().copied().unwrap_or(id),
            Err(_) => usize::MAX,
        };
        Ok(Self {
            id,
            package,
            core,
            domain_key,
            frequencies: read_frequencies(&dir.join("cpufreq")),
            hotpluggable: dir.join("online").exists(),
        })
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| TuneError::io(path, e))
}

fn read_frequencies(cpufreq: &Path) -> Vec<u64> {
    let parse = |s: String| -> Vec<u64> {
        s.split_whitespace()
            .filter_map(|f| f.parse().ok())
            .collect()
    };
    let mut freqs = match read_trimmed(&cpufreq.join("scaling_available_frequencies")) {
        Ok(list) => parse(list),
        Err(_) => {
            let min = read_trimmed(&cpufreq.join("cpuinfo_min_freq")).map(parse);
            let max = read_trimmed(&cpufreq.join("cpuinfo_max_freq")).map(parse);
            match (min, max) {
                (Ok(mut a), Ok(b)) => {
                    a.extend(b);
                    a
                }
                _ => Vec::new(),
            }
        }
    };
    freqs.sort_unstable();
    freqs.dedup();
    freqs
}
