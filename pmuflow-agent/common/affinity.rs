use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::error::{PmuError, Result};

/// Pins the calling thread to one CPU until dropped
pub struct AffinityGuard {
    old_affinity: CpuSet,
}

impl AffinityGuard {
    pub fn new(cpu: u32) -> Result<Self> {
        if cpu as usize >= CpuSet::count() {
            return Err(PmuError::AffinityError(format!(
                "CPU {cpu} is outside the affinity mask"
            )));
        }

        let old_affinity = sched_getaffinity(Pid::from_raw(0))
            .map_err(|e| PmuError::AffinityError(format!("Failed to get affinity: {e}")))?;

        // Already pinned here, nothing to restore
        if Self::is_only(&old_affinity, cpu) {
            return Ok(Self { old_affinity });
        }

        let mut new_affinity = CpuSet::new();
        new_affinity.set(cpu as usize).map_err(|e| {
            PmuError::AffinityError(format!("Failed to set CPU {cpu} in set: {e}"))
        })?;

        sched_setaffinity(Pid::from_raw(0), &new_affinity).map_err(|e| {
            PmuError::AffinityError(format!("Failed to set affinity to CPU {cpu}: {e}"))
        })?;

        Ok(Self { old_affinity })
    }

    fn is_only(set: &CpuSet, cpu: u32) -> bool {
        (0..CpuSet::count()).all(|i| set.is_set(i).unwrap_or(false) == (i == cpu as usize))
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        if let Err(e) = sched_setaffinity(Pid::from_raw(0), &self.old_affinity) {
            tracing::warn!("Failed to restore CPU affinity: {}", e);
        }
    }
}
