//! Prometheus metrics for the control loop.
//!
//! Gauges and counters are plain atomics and are updated on every tick
//! whether or not they are registered. Registration is only needed for
//! exposition (scraping).
//!
//! # Usage
//!
//! ```ignore
//! let registry = prometheus::Registry::new();
//! let metrics = TuneMetrics::with_prefix("myapp")?;
//! metrics.register(&registry)?;
//! let manager = Manager::new(params, workers, hardware, clock)?.with_metrics(metrics);
//!
//! // Later: expose via HTTP endpoint
//! let encoder = prometheus::TextEncoder::new();
//! encoder.encode(&registry.gather(), &mut buffer)?;
//! ```

use crate::error::Result;
use crate::knob::{KnobType, KnobsValues};
use crate::sample::Sample;
use prometheus::{Gauge, IntCounter, IntGauge, Opts, Registry};

/// Per-tick gauges and lifetime counters of one managed computation.
#[derive(Clone)]
pub struct TuneMetrics {
    // === Gauges (current values) ===
    /// Tasks per second in the last interval
    pub throughput: Gauge,

    /// Smoothed tasks per second
    pub smoothed_throughput: Gauge,

    /// Watts drawn in the last interval
    pub watts: Gauge,

    /// Smoothed watts
    pub smoothed_watts: Gauge,

    /// Mean task latency in seconds
    pub latency_seconds: Gauge,

    /// Share of the interval workers spent in tasks, percent
    pub load_percentage: Gauge,

    /// Throughput floor or watt ceiling the contract currently imposes
    pub required: Gauge,

    /// Workers running
    pub active_cores: IntGauge,

    /// Applied frequency in kHz (0 when not controlled)
    pub frequency_khz: IntGauge,

    // === Counters (cumulative) ===
    /// Configuration changes applied
    pub reconfigurations: IntCounter,

    /// Configurations sampled while calibrating
    pub calibration_steps: IntCounter,

    /// Ticks on which decisions were inhibited
    pub inhibited_ticks: IntCounter,

    /// Ticks skipped for missing counters
    pub skipped_ticks: IntCounter,

    /// Ticks on which the contract was not met
    pub contract_violations: IntCounter,
}

/// Replace characters Prometheus does not accept in metric names.
fn sanitize(prefix: &str) -> String {
    prefix
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let valid = if i == 0 {
                c.is_ascii_alphabetic() || c == '_' || c == ':'
            } else {
                c.is_ascii_alphanumeric() || c == '_' || c == ':'
            };
            if valid {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl TuneMetrics {
    /// Create metrics with the default prefix "tuneloop".
    pub fn new() -> Result<Self> {
        Self::with_prefix("tuneloop")
    }

    /// Create metrics named `{prefix}_throughput`, `{prefix}_reconfigurations`, ...
    ///
    /// Invalid characters in `prefix` become underscores (`my-app` -> `my_app`).
    pub fn with_prefix(prefix: &str) -> Result<Self> {
        let prefix = sanitize(prefix);
        let gauge = |name: &str, help: &str| Gauge::with_opts(Opts::new(format!("{prefix}_{name}"), help));
        let int_gauge =
            |name: &str, help: &str| IntGauge::with_opts(Opts::new(format!("{prefix}_{name}"), help));
        let counter =
            |name: &str, help: &str| IntCounter::with_opts(Opts::new(format!("{prefix}_{name}"), help));

        Ok(Self {
            throughput: gauge("throughput", "Tasks per second in the last interval")?,
            smoothed_throughput: gauge("smoothed_throughput", "Smoothed tasks per second")?,
            watts: gauge("watts", "Watts drawn in the last interval")?,
            smoothed_watts: gauge("smoothed_watts", "Smoothed watts")?,
            latency_seconds: gauge("latency_seconds", "Mean task latency")?,
            load_percentage: gauge("load_percentage", "Worker utilization percent")?,
            required: gauge("required", "Contract requirement at this tick")?,
            active_cores: int_gauge("active_cores", "Workers running")?,
            frequency_khz: int_gauge("frequency_khz", "Applied frequency in kHz")?,

            reconfigurations: counter("reconfigurations", "Configuration changes applied")?,
            calibration_steps: counter("calibration_steps", "Configurations sampled while calibrating")?,
            inhibited_ticks: counter("inhibited_ticks", "Ticks with decisions inhibited")?,
            skipped_ticks: counter("skipped_ticks", "Ticks skipped for missing counters")?,
            contract_violations: counter("contract_violations", "Ticks not meeting the contract")?,
        })
    }

    /// Register all metrics with a Registry for exposition.
    ///
    /// # Errors
    ///
    /// `TuneError::Metrics` if any metric fails to register (e.g. duplicate names).
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.throughput.clone()))?;
        registry.register(Box::new(self.smoothed_throughput.clone()))?;
        registry.register(Box::new(self.watts.clone()))?;
        registry.register(Box::new(self.smoothed_watts.clone()))?;
        registry.register(Box::new(self.latency_seconds.clone()))?;
        registry.register(Box::new(self.load_percentage.clone()))?;
        registry.register(Box::new(self.required.clone()))?;
        registry.register(Box::new(self.active_cores.clone()))?;
        registry.register(Box::new(self.frequency_khz.clone()))?;
        registry.register(Box::new(self.reconfigurations.clone()))?;
        registry.register(Box::new(self.calibration_steps.clone()))?;
        registry.register(Box::new(self.inhibited_ticks.clone()))?;
        registry.register(Box::new(self.skipped_ticks.clone()))?;
        registry.register(Box::new(self.contract_violations.clone()))?;
        Ok(())
    }

    /// Update the sample gauges.
    #[inline]
    pub fn record_sample(&self, instantaneous: &Sample, smoothed: &Sample) {
        self.throughput.set(instantaneous.throughput);
        self.watts.set(instantaneous.watts);
        self.latency_seconds.set(instantaneous.latency);
        self.load_percentage.set(instantaneous.load_percentage);
        self.smoothed_throughput.set(smoothed.throughput);
        self.smoothed_watts.set(smoothed.watts);
    }

    /// Update the knob gauges after a change.
    #[inline]
    pub fn record_values(&self, values: &KnobsValues) {
        self.active_cores.set(values[KnobType::VirtualCores] as i64);
        self.frequency_khz.set(values[KnobType::Frequency] as i64);
    }
}

impl std::fmt::Debug for TuneMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TuneMetrics")
            .field("smoothed_throughput", &self.smoothed_throughput.get())
            .field("smoothed_watts", &self.smoothed_watts.get())
            .field("active_cores", &self.active_cores.get())
            .field("reconfigurations", &self.reconfigurations.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = TuneMetrics::new().unwrap();
        assert_eq!(metrics.active_cores.get(), 0);
        assert_eq!(metrics.reconfigurations.get(), 0);
    }

    #[test]
    fn test_sample_and_values_gauges() {
        let metrics = TuneMetrics::new().unwrap();
        let mut s = Sample::zero();
        s.throughput = 120.0;
        s.watts = 35.5;
        let mut smoothed = s;
        smoothed.throughput = 100.0;
        metrics.record_sample(&s, &smoothed);
        assert!((metrics.throughput.get() - 120.0).abs() < 0.001);
        assert!((metrics.smoothed_throughput.get() - 100.0).abs() < 0.001);
        assert!((metrics.watts.get() - 35.5).abs() < 0.001);

        metrics.record_values(&KnobsValues::real([6.0, 1.0, 0.0, 1_800_000.0, 100.0]));
        assert_eq!(metrics.active_cores.get(), 6);
        assert_eq!(metrics.frequency_khz.get(), 1_800_000);
    }

    #[test]
    fn test_custom_prefix_registration() {
        let metrics = TuneMetrics::with_prefix("my-app").unwrap();
        let registry = Registry::new();
        metrics
            .register(&registry)
            .expect("registration should succeed");
        metrics.reconfigurations.inc();

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "my_app_reconfigurations"));
        assert!(!families
            .iter()
            .any(|f| f.get_name() == "tuneloop_reconfigurations"));
    }

    #[test]
    fn test_double_registration_fails() {
        let metrics = TuneMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }

    #[test]
    fn test_metrics_clone_shares_counters() {
        let metrics = TuneMetrics::new().unwrap();
        let cloned = metrics.clone();
        cloned.skipped_ticks.inc();
        assert_eq!(metrics.skipped_ticks.get(), 1);
    }
}
