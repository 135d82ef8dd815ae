//! Operating-system access to MSRs, PCI configuration space and MMIO
//!
//! Everything above this layer talks to hardware only through the
//! [`Platform`] trait and the three device traits, so the whole engine can
//! run against in-memory devices in tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pmuflow_raw::discovery::{DiscoveryTable, GlobalEntry, ENTRY_WORDS};

use crate::common::mmio::LinuxMmio;
use crate::common::msr::LinuxMsr;
use crate::common::pci::{LinuxPciConfig, Mcfg};
use crate::common::topology::Topology;
use crate::common::cpuid;
use crate::error::{PmuError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub group_number: u32,
    pub bus: u32,
    pub device: u32,
    pub function: u32,
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.group_number, self.bus, self.device, self.function
        )
    }
}

/// One CPU's MSR device
pub trait MsrDevice: Send + Sync {
    fn cpu(&self) -> u32;
    fn read(&self, addr: u64) -> Result<u64>;
    fn write(&self, addr: u64, value: u64) -> Result<()>;
}

/// One PCI function's configuration space
pub trait PciConfigDevice: Send + Sync {
    fn address(&self) -> PciAddress;
    fn read32(&self, offset: u32) -> Result<u32>;
    fn write32(&self, offset: u32, value: u32) -> Result<()>;

    /// Two 32-bit reads, low word first
    fn read64(&self, offset: u32) -> Result<u64> {
        let low = self.read32(offset)? as u64;
        let high = self.read32(offset + 4)? as u64;
        Ok(low | (high << 32))
    }

    fn vendor_device_id(&self) -> Result<(u32, u32)> {
        let value = self.read32(0)?;
        Ok((value & 0xFFFF, value >> 16))
    }
}

/// A mapped physical address window
pub trait MmioDevice: Send + Sync {
    fn read32(&self, offset: u64) -> Result<u32>;
    fn write32(&self, offset: u64, value: u32) -> Result<()>;
    fn read64(&self, offset: u64) -> Result<u64>;
    fn write64(&self, offset: u64, value: u64) -> Result<()>;
}

pub trait Platform: Send + Sync {
    /// CPUID leaf 1 EAX
    fn cpu_signature(&self) -> u32;

    fn topology(&self) -> Result<Topology>;

    fn open_msr(&self, cpu: u32) -> Result<Arc<dyn MsrDevice>>;

    /// Every instance of an Intel PCI function with `device_id` at
    /// `device.function`, in bus order (one per socket on server parts)
    fn find_pci(&self, device: u32, function: u32, device_id: u32) -> Result<Vec<PciAddress>>;

    fn open_pci(&self, address: PciAddress) -> Result<Arc<dyn PciConfigDevice>>;

    fn map_mmio(&self, physical: u64, size: usize) -> Result<Arc<dyn MmioDevice>>;

    /// Raw uncore discovery tables, one per socket; empty when the platform
    /// has none
    fn discovery_tables(&self) -> Result<Vec<Vec<u64>>>;
}

const INTEL_VENDOR_ID: u32 = 0x8086;
const PCI_EXT_CAP_START: u32 = 0x100;
const PCI_EXT_CAP_ID_DVSEC: u32 = 0x23;
const DVSEC_ID_UNCORE_DISCOVERY: u32 = 0x1;

/// Linux backends: `/dev/cpu/N/msr`, `/proc/bus/pci`, `/dev/mem`
pub struct LinuxPlatform {
    root: PathBuf,
    mcfg: Option<Mcfg>,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        // Containers bind-mount the host's /proc and /sys under /pcm
        let root = if std::env::var("DOCKER_RUNNING").is_ok() {
            PathBuf::from("/pcm")
        } else {
            PathBuf::from("/")
        };
        Self::with_root(root)
    }

    pub fn with_root(root: PathBuf) -> Self {
        let mcfg = match Mcfg::load(&root.join("sys/firmware/acpi/tables/MCFG")) {
            Ok(mcfg) => Some(mcfg),
            Err(e) => {
                tracing::warn!("MCFG table unavailable, scanning PCI segment 0 only: {}", e);
                None
            }
        };
        Self { root, mcfg }
    }

    fn proc_pci(&self) -> PathBuf {
        self.root.join("proc/bus/pci")
    }

    fn bus_ranges(&self) -> Vec<(u32, u32, u32)> {
        match &self.mcfg {
            Some(mcfg) => mcfg.bus_ranges(),
            None => vec![(0, 0, 255)],
        }
    }

    fn open_config(&self, address: PciAddress) -> Result<LinuxPciConfig> {
        LinuxPciConfig::open(&self.proc_pci(), address)
    }

    /// Every present function, in segment/bus/device/function order
    fn enumerate_pci(&self) -> Vec<PciAddress> {
        let mut found = Vec::new();
        for (group, start, end) in self.bus_ranges() {
            for bus in start..=end {
                let dir = bus_dir(&self.proc_pci(), group, bus);
                let Ok(entries) = std::fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let Some((dev, func)) = name.to_str().and_then(parse_devfn) else {
                        continue;
                    };
                    found.push(PciAddress {
                        group_number: group,
                        bus,
                        device: dev,
                        function: func,
                    });
                }
            }
        }
        found.sort();
        found
    }

    /// Offset of the uncore discovery DVSEC in `config`, if any
    fn find_discovery_dvsec(config: &LinuxPciConfig) -> Option<u32> {
        let mut offset = PCI_EXT_CAP_START;
        // Each capability is at least 4 bytes; bound the walk
        for _ in 0..(4096 / 4) {
            let header = config.read32(offset).ok()?;
            if header == 0 || header == u32::MAX {
                return None;
            }
            if header & 0xFFFF == PCI_EXT_CAP_ID_DVSEC {
                let vendor = config.read32(offset + 4).ok()? & 0xFFFF;
                let id = config.read32(offset + 8).ok()? & 0xFFFF;
                if vendor == INTEL_VENDOR_ID && id == DVSEC_ID_UNCORE_DISCOVERY {
                    return Some(offset);
                }
            }
            let next = header >> 20;
            if next < PCI_EXT_CAP_START {
                return None;
            }
            offset = next;
        }
        None
    }

    fn read_discovery_table(&self, config: &LinuxPciConfig, dvsec: u32) -> Result<Vec<u64>> {
        let bir = config.read32(dvsec + 0xC)? & 0x7;
        let bar = config.read64(0x10 + bir * 4)? & !0xFFF;

        let head = self.map_mmio(bar, ENTRY_WORDS * 8)?;
        let mut global_words = [0u64; ENTRY_WORDS];
        for (i, word) in global_words.iter_mut().enumerate() {
            *word = head.read64(i as u64 * 8)?;
        }
        let global = GlobalEntry::from_words(&global_words);
        let span = DiscoveryTable::span_bytes(&global);
        if span == 0 {
            return Ok(global_words.to_vec());
        }

        let table = self.map_mmio(bar, span)?;
        (0..span / 8)
            .map(|i| table.read64(i as u64 * 8))
            .collect()
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn bus_dir(proc_pci: &Path, group: u32, bus: u32) -> PathBuf {
    if group > 0 {
        proc_pci.join(format!("{group:04x}:{bus:02x}"))
    } else {
        proc_pci.join(format!("{bus:02x}"))
    }
}

/// Parse a `/proc/bus/pci/<bus>/` entry name such as `1e.3`
fn parse_devfn(name: &str) -> Option<(u32, u32)> {
    let (dev, func) = name.split_once('.')?;
    Some((
        u32::from_str_radix(dev, 16).ok()?,
        func.parse().ok()?,
    ))
}

impl Platform for LinuxPlatform {
    fn cpu_signature(&self) -> u32 {
        cpuid::cpuid(1, 0).0
    }

    fn topology(&self) -> Result<Topology> {
        Topology::from_sysfs(&self.root.join("sys/devices/system/cpu"))
    }

    fn open_msr(&self, cpu: u32) -> Result<Arc<dyn MsrDevice>> {
        let path = self.root.join(format!("dev/cpu/{cpu}/msr"));
        Ok(Arc::new(LinuxMsr::open(&path, cpu)?))
    }

    fn find_pci(&self, device: u32, function: u32, device_id: u32) -> Result<Vec<PciAddress>> {
        let mut found = Vec::new();
        for (group, start, end) in self.bus_ranges() {
            for bus in start..=end {
                let address = PciAddress {
                    group_number: group,
                    bus,
                    device,
                    function,
                };
                let Ok(config) = self.open_config(address) else {
                    continue;
                };
                if let Ok((vendor, id)) = config.vendor_device_id() {
                    if vendor == INTEL_VENDOR_ID && id == device_id {
                        tracing::debug!("Located PCI device {:04x} at {}", device_id, address);
                        found.push(address);
                    }
                }
            }
        }
        Ok(found)
    }

    fn open_pci(&self, address: PciAddress) -> Result<Arc<dyn PciConfigDevice>> {
        Ok(Arc::new(self.open_config(address)?))
    }

    fn map_mmio(&self, physical: u64, size: usize) -> Result<Arc<dyn MmioDevice>> {
        Ok(Arc::new(LinuxMmio::map(
            &self.root.join("dev/mem"),
            physical,
            size,
        )?))
    }

    fn discovery_tables(&self) -> Result<Vec<Vec<u64>>> {
        let mut tables = Vec::new();
        for address in self.enumerate_pci() {
            let Ok(config) = self.open_config(address) else {
                continue;
            };
            match config.vendor_device_id() {
                Ok((INTEL_VENDOR_ID, _)) => {}
                _ => continue,
            }
            let Some(dvsec) = Self::find_discovery_dvsec(&config) else {
                continue;
            };
            tracing::info!("Uncore discovery table behind {}", address);
            match self.read_discovery_table(&config, dvsec) {
                Ok(words) => tables.push(words),
                Err(e) => tracing::warn!("Cannot read discovery table at {}: {}", address, e),
            }
        }
        if tables.is_empty() {
            return Err(PmuError::PciError(
                "no uncore discovery DVSEC found".to_string(),
            ));
        }
        Ok(tables)
    }
}
