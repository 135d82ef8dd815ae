use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::common::whitelist::{AccessFilter, AllowAll};
use crate::common::Topology;
use crate::counters::resctrl::DEFAULT_RESCTRL_ROOT;

/// Which cores and sockets get exported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub sockets: Vec<u32>,
    pub cores: Vec<u32>,
    pub core_labels: HashMap<u32, String>,
}

impl MonitorConfig {
    /// Create a new configuration from sockets and cores
    pub fn new(sockets: Vec<u32>, cores: Vec<u32>) -> Self {
        let core_labels = cores
            .iter()
            .map(|&core| (core, format!("core_{core}")))
            .collect();

        Self {
            sockets,
            cores,
            core_labels,
        }
    }

    /// Every online CPU and socket of `topology`
    pub fn from_topology(topology: &Topology) -> Self {
        let cores: Vec<u32> = topology.cpus().iter().map(|c| c.os_id).collect();
        let sockets = topology.sockets();

        tracing::info!(
            "Auto-detected {} sockets, {} cores",
            sockets.len(),
            cores.len()
        );

        Self::new(sockets, cores)
    }

    /// Keep the requested cores and sockets that exist in `topology`.
    /// Without requested sockets, the sockets of the selected cores are used.
    pub fn select(topology: &Topology, cores: &[u32], sockets: &[u32]) -> Self {
        let online = Self::from_topology(topology);
        let cores: Vec<u32> = if cores.is_empty() {
            online.cores
        } else {
            cores
                .iter()
                .copied()
                .filter(|c| {
                    let known = online.cores.contains(c);
                    if !known {
                        tracing::warn!("CPU {} is not online, ignoring", c);
                    }
                    known
                })
                .collect()
        };

        let mut sockets: Vec<u32> = if sockets.is_empty() {
            cores.iter().filter_map(|&c| topology.socket_of(c)).collect()
        } else {
            sockets
                .iter()
                .copied()
                .filter(|s| online.sockets.contains(s))
                .collect()
        };
        sockets.sort_unstable();
        sockets.dedup();

        Self::new(sockets, cores)
    }

    pub fn label(&self, core: u32) -> String {
        self.core_labels
            .get(&core)
            .cloned()
            .unwrap_or_else(|| format!("core_{core}"))
    }
}

/// Events the general purpose core counters carry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CoreProgramMode {
    /// L2/L3 hit and miss events of the generation
    #[default]
    DefaultEvents,
    /// Raw IA32_PERFEVTSELx values and the two offcore response values
    CustomEvents { events: Vec<u64>, offcore: [u64; 2] },
}

/// How the coordinator programs the machine
#[derive(Clone)]
pub struct ProgramConfig {
    pub mode: CoreProgramMode,
    /// Take over PMUs another agent left enabled
    pub force_reprogram: bool,
    /// Count L1 instead of L0p residency on the xPI power slot
    pub xpi_l1: bool,
    /// Sampling period of the energy counter extenders; `None` leaves them
    /// to be folded on every read
    pub energy_cadence: Option<Duration>,
    /// Sampling period of the 24-bit MBM extenders
    pub mbm_cadence: Option<Duration>,
    /// Sampling period of the client memory controller extenders
    pub imc_cadence: Option<Duration>,
    pub use_resctrl: bool,
    pub resctrl_root: PathBuf,
    /// Bytes per MBM increment when the QoS MSRs are usable; `None` when the
    /// processor lacks resource monitoring
    pub mbm_scaling: Option<u64>,
    /// Programmable counters reported by CPUID leaf 0xA, if known
    pub gp_counters: Option<usize>,
    pub filter: Arc<dyn AccessFilter>,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            mode: CoreProgramMode::DefaultEvents,
            force_reprogram: false,
            xpi_l1: false,
            energy_cadence: Some(Duration::from_secs(10)),
            mbm_cadence: Some(Duration::from_secs(1)),
            imc_cadence: Some(Duration::from_secs(1)),
            use_resctrl: true,
            resctrl_root: PathBuf::from(DEFAULT_RESCTRL_ROOT),
            mbm_scaling: None,
            gp_counters: None,
            filter: Arc::new(AllowAll),
        }
    }
}

impl std::fmt::Debug for ProgramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramConfig")
            .field("mode", &self.mode)
            .field("force_reprogram", &self.force_reprogram)
            .field("xpi_l1", &self.xpi_l1)
            .field("energy_cadence", &self.energy_cadence)
            .field("mbm_cadence", &self.mbm_cadence)
            .field("imc_cadence", &self.imc_cadence)
            .field("use_resctrl", &self.use_resctrl)
            .field("resctrl_root", &self.resctrl_root)
            .field("mbm_scaling", &self.mbm_scaling)
            .field("gp_counters", &self.gp_counters)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::topology::CpuTopology;

    fn topology() -> Topology {
        Topology::new(
            (0..8)
                .map(|cpu| CpuTopology {
                    os_id: cpu,
                    socket: cpu / 4,
                    core_id: cpu % 4,
                    thread_id: 0,
                })
                .collect(),
        )
    }

    #[test]
    fn test_from_topology_takes_everything() {
        let config = MonitorConfig::from_topology(&topology());
        assert_eq!(config.sockets, vec![0, 1]);
        assert_eq!(config.cores.len(), 8);
        assert_eq!(config.label(3), "core_3");
    }

    #[test]
    fn test_select_derives_sockets_from_cores() {
        let config = MonitorConfig::select(&topology(), &[5, 6, 42], &[]);
        assert_eq!(config.cores, vec![5, 6]);
        assert_eq!(config.sockets, vec![1]);
    }

    #[test]
    fn test_select_drops_unknown_sockets() {
        let config = MonitorConfig::select(&topology(), &[], &[1, 7]);
        assert_eq!(config.sockets, vec![1]);
        assert_eq!(config.cores.len(), 8);
    }
}
