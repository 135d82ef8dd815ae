//! Write gate for MSR and PCI configuration space
//!
//! Every write issued by the agent passes an [`AccessFilter`] first. A denied
//! write fails with [`PmuError::AccessDenied`] and never reaches the device.

use std::ops::RangeInclusive;

use crate::error::{PmuError, Result};

pub trait AccessFilter: Send + Sync {
    fn allow_msr(&self, addr: u64) -> bool;
    fn allow_pci_cfg(&self, device_id: u32, offset: u32) -> bool;
}

/// No restrictions
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessFilter for AllowAll {
    fn allow_msr(&self, _addr: u64) -> bool {
        true
    }

    fn allow_pci_cfg(&self, _device_id: u32, _offset: u32) -> bool {
        true
    }
}

/// Static table of permitted address ranges
#[derive(Debug, Clone, Default)]
pub struct RangeFilter {
    msr: Vec<RangeInclusive<u64>>,
    /// `None` device id matches any device
    pci: Vec<(Option<u32>, RangeInclusive<u32>)>,
}

impl RangeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_msr_range(mut self, range: RangeInclusive<u64>) -> Self {
        self.msr.push(range);
        self
    }

    pub fn allow_pci_range(mut self, device_id: Option<u32>, range: RangeInclusive<u32>) -> Self {
        self.pci.push((device_id, range));
        self
    }

    /// Every register the agent programs: core PMU, offcore response, RDT,
    /// uncore MSR boxes of all supported generations, and the PMON block of
    /// PCI uncore functions
    pub fn pmu_defaults() -> Self {
        Self::new()
            .allow_msr_range(0xC1..=0xC8) // IA32_PMCx
            .allow_msr_range(0x186..=0x18D) // IA32_PERFEVTSELx
            .allow_msr_range(0x1A6..=0x1A7) // offcore response
            .allow_msr_range(0x309..=0x30C) // fixed counters and slots
            .allow_msr_range(0x329..=0x329) // PERF_METRICS
            .allow_msr_range(0x38D..=0x390) // fixed ctrl and global ctrl/status
            .allow_msr_range(0x700..=0x7FF) // HSX/SKX uncore MSR boxes
            .allow_msr_range(0xA00..=0xBFF) // IIO and KNL boxes
            .allow_msr_range(0xC8D..=0xC8F) // RDT
            .allow_msr_range(0xE00..=0x1FFF) // CBo/CHA
            .allow_msr_range(0x2000..=0x2FFF) // SPR CHA and PCU
            .allow_msr_range(0x3000..=0x3FFF) // SPR IIO
            .allow_pci_range(None, 0x00..=0xFF)
            .allow_pci_range(None, 0x200..=0x4FF)
    }
}

impl AccessFilter for RangeFilter {
    fn allow_msr(&self, addr: u64) -> bool {
        self.msr.iter().any(|r| r.contains(&addr))
    }

    fn allow_pci_cfg(&self, device_id: u32, offset: u32) -> bool {
        self.pci
            .iter()
            .any(|(dev, r)| dev.map_or(true, |d| d == device_id) && r.contains(&offset))
    }
}

pub fn check_msr(filter: &dyn AccessFilter, addr: u64) -> Result<()> {
    if filter.allow_msr(addr) {
        Ok(())
    } else {
        Err(PmuError::AccessDenied(format!("MSR 0x{addr:x} not whitelisted")))
    }
}

pub fn check_pci_cfg(filter: &dyn AccessFilter, device_id: u32, offset: u32) -> Result<()> {
    if filter.allow_pci_cfg(device_id, offset) {
        Ok(())
    } else {
        Err(PmuError::AccessDenied(format!(
            "PCI config offset 0x{offset:x} of device 0x{device_id:04x} not whitelisted"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_filter() {
        let filter = RangeFilter::new()
            .allow_msr_range(0x186..=0x18D)
            .allow_pci_range(Some(0x2042), 0xD8..=0xF4);

        assert!(filter.allow_msr(0x186));
        assert!(!filter.allow_msr(0x10));
        assert!(filter.allow_pci_cfg(0x2042, 0xF4));
        assert!(!filter.allow_pci_cfg(0x2043, 0xF4));
        assert!(!filter.allow_pci_cfg(0x2042, 0x100));
    }

    #[test]
    fn test_defaults_cover_core_pmu_but_not_tsc() {
        let filter = RangeFilter::pmu_defaults();
        assert!(filter.allow_msr(0x38F));
        assert!(filter.allow_msr(0xE01));
        assert!(!filter.allow_msr(0x10));
        assert!(check_msr(&filter, 0x10).is_err());
        assert!(check_msr(&AllowAll, 0x10).is_ok());
    }
}
