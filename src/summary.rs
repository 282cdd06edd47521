//! What the manager reports: one record per tick, one summary per run.

use crate::knob::KnobsValues;
use crate::sample::Sample;
use crate::selector::CalibrationState;
use crate::stats::{CalibrationStats, ReconfigurationStats};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Observation made on one control-loop tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// Time since the manager started.
    pub time: Duration,
    /// Real knob values in effect during the interval.
    pub values: KnobsValues,
    pub sample: Sample,
    pub smoothed: Sample,
    /// Throughput floor, watt ceiling or utilization ceiling of this tick.
    pub required: f64,
    /// `None` when no selector runs (contract `none` or nothing to tune).
    pub state: Option<CalibrationState>,
    pub inhibited: bool,
}

/// End-of-run statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// One entry per calibration episode.
    pub calibrations: Vec<CalibrationStats>,
    pub reconfigurations: ReconfigurationStats,
    pub total_tasks: f64,
    pub total_joules: f64,
    pub duration: Duration,
    pub ticks: u64,
    /// Last configuration applied successfully.
    pub last_valid: Option<KnobsValues>,
    /// Set when the run ended on an error.
    pub abort_reason: Option<String>,
    /// Whether the final selection could not meet the contract.
    pub contract_infeasible: bool,
}

impl Summary {
    /// All calibration episodes added up.
    pub fn total_calibration(&self) -> CalibrationStats {
        let mut total = CalibrationStats::default();
        for c in &self.calibrations {
            total += *c;
        }
        total
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    /// Mean power over the run.
    pub fn average_watts(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_joules / secs
        } else {
            0.0
        }
    }
}

/// Receives the manager's periodic observations.
pub trait Observer: Send {
    fn on_tick(&mut self, report: &TickReport);

    fn on_summary(&mut self, _summary: &Summary) {}
}

/// Emits tick reports and the summary as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_tick(&mut self, report: &TickReport) {
        debug!(
            time_ms = report.time.as_millis() as u64,
            values = %report.values,
            throughput = report.sample.throughput,
            smoothed_throughput = report.smoothed.throughput,
            watts = report.sample.watts,
            smoothed_watts = report.smoothed.watts,
            load = report.sample.load_percentage,
            required = report.required,
            state = ?report.state,
            inhibited = report.inhibited,
            "tick"
        );
    }

    fn on_summary(&mut self, summary: &Summary) {
        let calibration = summary.total_calibration();
        info!(
            duration_ms = summary.duration.as_millis() as u64,
            ticks = summary.ticks,
            total_tasks = summary.total_tasks,
            total_joules = summary.total_joules,
            calibrations = summary.calibrations.len(),
            calibration_steps = calibration.num_steps,
            reconfiguration_ms = summary.reconfigurations.total().mean(),
            reconfiguration_ms_sd = summary.reconfigurations.total().std_dev(),
            contract_infeasible = summary.contract_infeasible,
            "run finished"
        );
        if let Some(reason) = &summary.abort_reason {
            warn!(%reason, last_valid = ?summary.last_valid, "run aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_totals() {
        let s = Summary {
            calibrations: vec![
                CalibrationStats {
                    num_steps: 4,
                    duration: Duration::from_secs(2),
                    num_tasks: 100.0,
                    joules: 20.0,
                },
                CalibrationStats {
                    num_steps: 2,
                    duration: Duration::from_secs(1),
                    num_tasks: 50.0,
                    joules: 10.0,
                },
            ],
            total_joules: 300.0,
            duration: Duration::from_secs(10),
            ..Summary::default()
        };
        let total = s.total_calibration();
        assert_eq!(total.num_steps, 6);
        assert_eq!(total.duration, Duration::from_secs(3));
        assert_eq!(s.average_watts(), 30.0);
        assert!(!s.is_aborted());
    }

    #[test]
    fn test_summary_serializes() {
        let s = Summary {
            abort_reason: Some("frequency rejected".into()),
            ..Summary::default()
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: Summary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        assert!(back.is_aborted());
    }
}
