//! Metrics collection for the tuning loop.
//!
//! The manager always updates a [`TuneMetrics`]; expose it by registering it
//! into a `prometheus::Registry`.
//!
//! # Available Metrics
//!
//! ## Gauges (current values)
//!
//! - `tuneloop_throughput`, `tuneloop_smoothed_throughput` - tasks per second
//! - `tuneloop_watts`, `tuneloop_smoothed_watts` - power draw
//! - `tuneloop_latency_seconds` - mean task latency
//! - `tuneloop_load_percentage` - worker utilization
//! - `tuneloop_required` - current contract requirement
//! - `tuneloop_active_cores`, `tuneloop_frequency_khz` - applied knobs
//!
//! ## Counters (cumulative)
//!
//! - `tuneloop_reconfigurations` - configuration changes applied
//! - `tuneloop_calibration_steps` - configurations sampled while calibrating
//! - `tuneloop_inhibited_ticks` - ticks with decisions inhibited
//! - `tuneloop_skipped_ticks` - ticks without counters
//! - `tuneloop_contract_violations` - ticks not meeting the contract

mod prometheus;

pub use self::prometheus::TuneMetrics;
