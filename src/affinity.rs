//! Thread affinity utilities for CPU pinning.
//!
//! Farm workers are re-pinned every time the control loop moves them, so
//! [`PinState`] remembers where the current thread is and only calls into
//! `core_affinity` when the target changes.

use crate::cpuset::validate_cpuset;
use crate::error::{Result, TuneError};
use core_affinity::CoreId;
use tracing::{debug, warn};

/// Pin the current thread to the specified CPU.
///
/// # Errors
///
/// Returns `TuneError::AffinityFailed` if the CPU is outside this process's
/// affinity mask or the thread cannot be pinned.
///
/// ```ignore
/// use tuneloop::affinity::pin_to_cpu;
///
/// pin_to_cpu(0)?;
/// ```
pub fn pin_to_cpu(cpu_id: usize) -> Result<()> {
    // core_affinity panics on ids past the libc cpu_set_t
    if let Err(e) = validate_cpuset(&[cpu_id]) {
        warn!(%e, "CPU is not in the affinity mask");
        return Err(TuneError::AffinityFailed(cpu_id));
    }
    if core_affinity::set_for_current(CoreId { id: cpu_id }) {
        debug!(cpu_id, "pinned thread to CPU");
        Ok(())
    } else {
        warn!(cpu_id, "failed to pin thread to CPU");
        Err(TuneError::AffinityFailed(cpu_id))
    }
}

/// Where the current thread is pinned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PinState {
    current: Option<usize>,
}

impl PinState {
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Pin to `cpu_id` unless already there. Returns whether a move happened.
    pub fn ensure(&mut self, cpu_id: usize) -> Result<bool> {
        if self.current == Some(cpu_id) {
            return Ok(false);
        }
        pin_to_cpu(cpu_id)?;
        self.current = Some(cpu_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuset::available_cpus;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_pin_to_cpu() {
        let first = available_cpus()[0];
        assert!(pin_to_cpu(first).is_ok());
    }

    #[test]
    fn test_pin_outside_mask_fails() {
        assert!(matches!(
            pin_to_cpu(usize::MAX),
            Err(TuneError::AffinityFailed(usize::MAX))
        ));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_pin_state_skips_repeat() {
        let first = available_cpus()[0];
        let mut state = PinState::default();
        assert!(state.ensure(first).unwrap());
        assert!(!state.ensure(first).unwrap());
        assert_eq!(state.current(), Some(first));
    }
}
