//! # tuneloop
//!
//! **Fit the machine to the contract**
//!
//! A self-tuning control loop for parallel computations. It samples a worker
//! pool, smooths the measurements and moves the pool's knobs (worker count,
//! hyperthreading, placement, CPU frequency, clock modulation) until a
//! throughput floor, a completion deadline, a power budget or a utilization
//! band is met at the lowest cost in the other metric.
//!
//! ## Features
//!
//! - **Contracts**: throughput floor, completion time (recomputed every tick
//!   as remaining tasks over remaining time), power budget and utilization
//!   band
//! - **Predictors**: analytical, linear regression (optionally per mapping),
//!   universal scalability law with an interference update, exhaustive
//!   search and learned application profiles, or the model-free
//!   Li-Martinez bisection
//! - **Explorers**: random, (reverse) Halton, Niederreiter and Sobol
//!   sequences over the free knobs
//! - **Hardware**: Linux cpufreq, hotplug and RAPL energy counters through
//!   sysfs (core layout optionally from hwloc with the `hwloc` feature), or
//!   a deterministic simulated machine
//! - **Worker farm**: a rayon pool with pinned workers that freezes,
//!   re-places and resumes on demand
//! - **Flexible Configuration**: files (TOML/YAML/JSON), environment
//!   variables, code and clap arguments
//! - **Observability**: `tracing` events and Prometheus metrics
//!
//! ## Quick Start
//!
//! ```ignore
//! use tuneloop::{Contract, Farm, Manager, ParametersBuilder, SysfsHardware, SystemClock};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = ParametersBuilder::new()
//!         .file("tuneloop.toml")
//!         .env_prefix("TUNELOOP")
//!         .contract(Contract::Throughput { target: 400.0 })
//!         .build()?;
//!
//!     let farm = Farm::new(&params.prefix, 16, |_worker| {
//!         process_one_item();
//!         true
//!     })?;
//!     farm.start();
//!
//!     let mut manager = Manager::new(params, farm, SysfsHardware::new()?, SystemClock::new())?;
//!     let summary = manager.run()?;
//!     println!("{} tasks, {:.1} J", summary.total_tasks, summary.total_joules);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Configuration sources are merged in order (later sources override earlier):
//!
//! 1. Default values
//! 2. Config files (via `.file()`)
//! 3. Environment variables (via `.env_prefix()`)
//! 4. Programmatic overrides and CLI arguments (via `.with_cli_args()`)
//!
//! ### Config File Example (TOML)
//!
//! ```toml
//! prefix = "myapp"
//! prediction = "regression"
//! exploration = "halton"
//! persistence = "samples"
//! persistence_value = 3
//!
//! [contract]
//! type = "power_budget"
//! watts = 45.0
//!
//! [knobs]
//! hyperthreading = true
//! mapping = "auto"
//!
//! [sampling]
//! calibration_interval_ms = 250
//! ```
//!
//! ### Environment Variables
//!
//! With `.env_prefix("TUNELOOP")`:
//! - `TUNELOOP_PREDICTION=usl`
//! - `TUNELOOP_SMOOTHING_WINDOW=5`
//! - `TUNELOOP_KNOBS__FREQUENCY=false`
//!
//! ## Testing without hardware
//!
//! [`sim::SimulatedMachine`] provides both the hardware and the worker pool,
//! driven by a [`clock::ManualClock`], so a whole run completes instantly and
//! deterministically.

pub(crate) mod affinity;
pub mod builder;
pub mod clock;
pub mod config;
pub mod configuration;
pub mod cpuset;
pub mod error;
pub mod explorer;
pub mod farm;
pub mod hardware;
pub mod knob;
pub mod manager;
pub mod metrics;
pub mod predictor;
pub mod sample;
pub mod selector;
pub mod sim;
pub mod smoother;
pub mod stats;
pub mod summary;
pub mod topology;
pub mod workers;

pub use builder::{ParametersBuilder, TuneArgs};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CalibrationSettings, Contract, ExplorationStrategy, KnobSettings, MappingSetting, Parameters,
    PersistenceStrategy, PredictionStrategy, RecalibrationPolicy, SamplingSettings,
    SmoothingStrategy, UnusedCores,
};
pub use configuration::Configuration;
pub use error::{ErrorKind, Result, TuneError};
pub use farm::Farm;
pub use hardware::{Governor, Hardware, SysfsHardware};
pub use knob::{KnobType, KnobsValues, MappingType};
pub use manager::{Manager, ManagerHandle};
pub use metrics::TuneMetrics;
pub use sample::Sample;
pub use selector::{CalibrationState, ContractState, Selector};
pub use summary::{Observer, Summary, TickReport, TracingObserver};
pub use topology::Topology;
pub use workers::{PoolSample, WorkerPool};
