//! Resource monitoring through the Linux resctrl filesystem
//!
//! One monitoring group per core under `<root>/mon_groups/pcm<core>`, with
//! the core as its only member. Values are summed over every L3 domain.

use std::fs;
use std::path::{Path, PathBuf};

use crate::counters::rdt::{QosMonitor, QosSample};
use crate::error::{PmuError, Result};

pub const DEFAULT_RESCTRL_ROOT: &str = "/sys/fs/resctrl";

const OCCUPANCY_FILE: &str = "llc_occupancy";
const LOCAL_FILE: &str = "mbm_local_bytes";
const TOTAL_FILE: &str = "mbm_total_bytes";

pub struct ResctrlMonitor {
    groups: Vec<(u32, PathBuf)>,
}

impl ResctrlMonitor {
    /// True when `root` is a mounted resctrl with L3 monitoring
    pub fn is_supported(root: &Path) -> bool {
        root.join("info").join("L3_MON").is_dir()
    }

    pub fn group_path(root: &Path, cpu: u32) -> PathBuf {
        root.join("mon_groups").join(format!("pcm{cpu}"))
    }

    pub fn new(root: &Path, cpus: &[u32]) -> Result<Self> {
        let mut groups = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let group = Self::group_path(root, cpu);
            fs::create_dir_all(&group).map_err(|e| {
                PmuError::ResctrlError(format!("cannot create {}: {}", group.display(), e))
            })?;
            fs::write(group.join("cpus_list"), cpu.to_string()).map_err(|e| {
                PmuError::ResctrlError(format!("cannot assign CPU {} to {}: {}", cpu, group.display(), e))
            })?;
            groups.push((cpu, group));
        }
        tracing::info!("Created {} resctrl monitoring groups under {}", groups.len(), root.display());
        Ok(Self { groups })
    }

    /// Sum of `file` over every L3 domain of `group`; unreadable values count
    /// as zero
    fn read_summed(group: &Path, file: &str) -> u64 {
        let mon_data = group.join("mon_data");
        let domains = match fs::read_dir(&mon_data) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot list {}: {}", mon_data.display(), e);
                return 0;
            }
        };

        let mut total = 0u64;
        for domain in domains.flatten() {
            if !domain.file_name().to_string_lossy().starts_with("mon_L3_") {
                continue;
            }
            let path = domain.path().join(file);
            match fs::read_to_string(&path).map(|s| s.trim().parse::<u64>()) {
                Ok(Ok(value)) => total = total.wrapping_add(value),
                Ok(Err(e)) => tracing::warn!("Bad value in {}: {}", path.display(), e),
                Err(e) => tracing::warn!("Cannot read {}: {}", path.display(), e),
            }
        }
        total
    }
}

impl QosMonitor for ResctrlMonitor {
    fn sample(&self, cpu: u32) -> QosSample {
        let Some((_, group)) = self.groups.iter().find(|(c, _)| *c == cpu) else {
            return QosSample::INVALID;
        };
        QosSample {
            l3_occupancy: Self::read_summed(group, OCCUPANCY_FILE),
            mem_bw_local: Self::read_summed(group, LOCAL_FILE),
            mem_bw_total: Self::read_summed(group, TOTAL_FILE),
        }
    }

    fn cleanup(&mut self) {
        for (_, group) in self.groups.drain(..) {
            if let Err(e) = fs::remove_dir(&group) {
                tracing::warn!("Cannot remove {}: {}", group.display(), e);
            }
        }
    }
}
