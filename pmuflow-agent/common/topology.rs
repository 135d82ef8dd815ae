use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{PmuError, Result};

/// Placement of one logical CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTopology {
    pub os_id: u32,
    pub socket: u32,
    pub core_id: u32,
    /// SMT sibling index within the physical core
    pub thread_id: u32,
}

/// Logical CPUs of the machine, ordered by OS id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    cpus: Vec<CpuTopology>,
}

impl Topology {
    pub fn new(mut cpus: Vec<CpuTopology>) -> Self {
        cpus.sort_by_key(|c| c.os_id);
        Self { cpus }
    }

    /// Read `online` and each CPU's `topology/` directory under `cpu_root`
    /// (normally `/sys/devices/system/cpu`)
    pub fn from_sysfs(cpu_root: &Path) -> Result<Self> {
        let online = std::fs::read_to_string(cpu_root.join("online"))
            .map_err(|e| PmuError::ConfigError(format!("Cannot read online CPU list: {e}")))?;
        let online = parse_cpu_list(&online)
            .ok_or_else(|| PmuError::ConfigError(format!("Bad online CPU list '{online}'")))?;

        let read_id = |cpu: u32, file: &str| -> Option<u32> {
            std::fs::read_to_string(cpu_root.join(format!("cpu{cpu}/topology/{file}")))
                .ok()?
                .trim()
                .parse()
                .ok()
        };

        let mut cpus = Vec::with_capacity(online.len());
        for cpu in online {
            let socket = read_id(cpu, "physical_package_id").unwrap_or(0);
            let core_id = read_id(cpu, "core_id").unwrap_or(cpu);
            let thread_id = std::fs::read_to_string(
                cpu_root.join(format!("cpu{cpu}/topology/thread_siblings_list")),
            )
            .ok()
            .and_then(|s| parse_cpu_list(&s))
            .and_then(|siblings| siblings.iter().position(|&s| s == cpu))
            .unwrap_or(0) as u32;

            cpus.push(CpuTopology {
                os_id: cpu,
                socket,
                core_id,
                thread_id,
            });
        }

        if cpus.is_empty() {
            return Err(PmuError::ConfigError("no online CPUs".to_string()));
        }

        let topology = Self::new(cpus);
        tracing::info!(
            "Topology: {} logical CPUs on {} sockets, SMT {}",
            topology.num_cores(),
            topology.num_sockets(),
            if topology.smt_enabled() { "on" } else { "off" }
        );
        Ok(topology)
    }

    pub fn cpus(&self) -> &[CpuTopology] {
        &self.cpus
    }

    pub fn num_cores(&self) -> usize {
        self.cpus.len()
    }

    pub fn sockets(&self) -> Vec<u32> {
        self.cpus
            .iter()
            .map(|c| c.socket)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn num_sockets(&self) -> usize {
        self.sockets().len()
    }

    pub fn socket_of(&self, cpu: u32) -> Option<u32> {
        self.cpu(cpu).map(|c| c.socket)
    }

    pub fn cpu(&self, cpu: u32) -> Option<&CpuTopology> {
        self.cpus.iter().find(|c| c.os_id == cpu)
    }

    pub fn cores_of_socket(&self, socket: u32) -> Vec<u32> {
        self.cpus
            .iter()
            .filter(|c| c.socket == socket)
            .map(|c| c.os_id)
            .collect()
    }

    /// Lowest online CPU of `socket`; package-scope MSRs are accessed here
    pub fn socket_ref_core(&self, socket: u32) -> Option<u32> {
        self.cpus
            .iter()
            .find(|c| c.socket == socket)
            .map(|c| c.os_id)
    }

    pub fn smt_enabled(&self) -> bool {
        self.cpus.iter().any(|c| c.thread_id > 0)
    }

    pub fn threads_per_core(&self) -> usize {
        self.cpus
            .iter()
            .map(|c| c.thread_id as usize + 1)
            .max()
            .unwrap_or(1)
    }
}

/// Parse a CPU list like "0-3,8-11"
pub fn parse_cpu_list(s: &str) -> Option<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in s.trim().split(',').filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.parse().ok()?;
            let end: u32 = end.parse().ok()?;
            if end < start {
                return None;
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(part.parse().ok()?);
        }
    }
    Some(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_socket() -> Topology {
        let cpus = (0..8)
            .map(|i| CpuTopology {
                os_id: i,
                socket: i / 4,
                core_id: i % 2,
                thread_id: (i % 4) / 2,
            })
            .collect();
        Topology::new(cpus)
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,8-9\n"), Some(vec![0, 1, 2, 3, 8, 9]));
        assert_eq!(parse_cpu_list("5"), Some(vec![5]));
        assert_eq!(parse_cpu_list("3-1"), None);
        assert_eq!(parse_cpu_list("a"), None);
    }

    #[test]
    fn test_socket_queries() {
        let topo = two_socket();
        assert_eq!(topo.sockets(), vec![0, 1]);
        assert_eq!(topo.cores_of_socket(1), vec![4, 5, 6, 7]);
        assert_eq!(topo.socket_ref_core(1), Some(4));
        assert_eq!(topo.socket_of(6), Some(1));
        assert!(topo.smt_enabled());
        assert_eq!(topo.threads_per_core(), 2);
    }

    #[test]
    fn test_from_sysfs() {
        let root = std::env::temp_dir().join(format!("pmuflow-topo-{}", std::process::id()));
        for cpu in 0..2u32 {
            let dir = root.join(format!("cpu{cpu}/topology"));
            std::fs::create_dir_all(&dir).expect("mkdir");
            std::fs::write(dir.join("physical_package_id"), "0\n").expect("write");
            std::fs::write(dir.join("core_id"), "0\n").expect("write");
            std::fs::write(dir.join("thread_siblings_list"), "0-1\n").expect("write");
        }
        std::fs::write(root.join("online"), "0-1\n").expect("write");

        let topo = Topology::from_sysfs(&root).expect("topology");
        assert_eq!(topo.num_cores(), 2);
        assert_eq!(topo.cpu(1).map(|c| c.thread_id), Some(1));

        let _ = std::fs::remove_dir_all(&root);
    }
}
