//! Error types for tuneloop.
//!
//! Every fallible operation returns [`TuneError`]. Callers that need to react
//! differently to startup problems, hardware failures, model trouble and
//! missing data use [`TuneError::kind`] instead of matching individual variants.

use crate::knob::KnobType;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while configuring or running a tuning loop.
#[derive(Debug, Error)]
pub enum TuneError {
    // === Configuration errors (fatal at startup) ===
    /// Parameters failed validation.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Error extracting parameters from figment.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Error parsing a CPU list string.
    #[error("invalid cpuset format: {0}")]
    InvalidCpuSet(String),

    /// CPU ID is not available on this system.
    #[error("CPU {0} is not available on this system")]
    CpuNotAvailable(usize),

    /// No knob combination can be reached with the given parameters and hardware.
    #[error("no reachable configuration: {0}")]
    Unreachable(String),

    /// Metric registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // === Actuation errors (fatal for the run) ===
    /// A hardware or runtime operation backing a knob failed.
    #[error("failed to change {knob}: {reason}")]
    Actuation { knob: KnobType, reason: String },

    /// Error setting thread affinity.
    #[error("failed to set thread affinity for CPU {0}")]
    AffinityFailed(usize),

    /// Workers did not reach a frozen state in time.
    #[error("workers did not quiesce within {0:?}")]
    Quiescence(Duration),

    /// Error building the rayon worker pool.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Error reading or writing a sysfs/powercap/msr file.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // === Modeling errors (recoverable) ===
    /// A predictor could not produce an estimate.
    #[error("model error: {0}")]
    Model(String),

    /// A full-search predictor was asked about a configuration it never saw.
    #[error("configuration {0} was never observed")]
    NotObserved(String),

    /// The interference update protocol was not followed.
    #[error("interference protocol violated: {0} updates recorded, exactly 3 required")]
    InterferenceProtocol(usize),

    // === Transient errors ===
    /// Counters were missing or incomplete for this tick.
    #[error("no usable sample: {0}")]
    Sampling(String),
}

/// Coarse classification of a [`TuneError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or unsatisfiable setup; reported before the loop starts.
    Config,
    /// Hardware or runtime actuation failed; terminates the run.
    Actuation,
    /// A model could not answer; recovered with a fallback configuration.
    Model,
    /// No usable data this tick; the decision is skipped.
    Sampling,
}

impl TuneError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TuneError::InvalidParameters(_)
            | TuneError::Config(_)
            | TuneError::InvalidCpuSet(_)
            | TuneError::CpuNotAvailable(_)
            | TuneError::Unreachable(_)
            | TuneError::Metrics(_) => ErrorKind::Config,
            TuneError::Actuation { .. }
            | TuneError::AffinityFailed(_)
            | TuneError::Quiescence(_)
            | TuneError::ThreadPool(_)
            | TuneError::Io { .. } => ErrorKind::Actuation,
            TuneError::Model(_)
            | TuneError::NotObserved(_)
            | TuneError::InterferenceProtocol(_) => ErrorKind::Model,
            TuneError::Sampling(_) => ErrorKind::Sampling,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TuneError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn actuation(knob: KnobType, reason: impl std::fmt::Display) -> Self {
        TuneError::Actuation {
            knob,
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for tuneloop operations.
pub type Result<T> = std::result::Result<T, TuneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TuneError::InvalidParameters("x".into()).kind(),
            ErrorKind::Config
        );
        assert_eq!(
            TuneError::actuation(KnobType::Frequency, "denied").kind(),
            ErrorKind::Actuation
        );
        assert_eq!(TuneError::InterferenceProtocol(2).kind(), ErrorKind::Model);
        assert_eq!(TuneError::Sampling("empty".into()).kind(), ErrorKind::Sampling);
    }

    #[test]
    fn test_actuation_message_names_knob() {
        let e = TuneError::actuation(KnobType::Frequency, "permission denied");
        assert_eq!(e.to_string(), "failed to change frequency: permission denied");
    }
}
