//! Uniform access to one hardware register
//!
//! PMU code holds `Arc<dyn HwRegister>` and never learns whether a value
//! lives in an MSR, PCI configuration space or an MMIO window. Reads are
//! always physical; nothing is cached here.

use std::sync::Arc;

use crate::common::platform::{MmioDevice, MsrDevice, PciConfigDevice};
use crate::common::whitelist::{check_msr, check_pci_cfg, AccessFilter};
use crate::error::Result;

pub trait HwRegister: Send + Sync {
    fn read(&self) -> Result<u64>;
    fn write(&self, value: u64) -> Result<()>;
}

pub type RegisterRef = Arc<dyn HwRegister>;

pub struct MsrRegister {
    device: Arc<dyn MsrDevice>,
    addr: u64,
    filter: Arc<dyn AccessFilter>,
}

impl MsrRegister {
    pub fn new(device: Arc<dyn MsrDevice>, addr: u64, filter: Arc<dyn AccessFilter>) -> Self {
        Self {
            device,
            addr,
            filter,
        }
    }

    pub fn shared(
        device: &Arc<dyn MsrDevice>,
        addr: u64,
        filter: &Arc<dyn AccessFilter>,
    ) -> RegisterRef {
        Arc::new(Self::new(Arc::clone(device), addr, Arc::clone(filter)))
    }
}

impl HwRegister for MsrRegister {
    fn read(&self) -> Result<u64> {
        self.device.read(self.addr)
    }

    fn write(&self, value: u64) -> Result<()> {
        check_msr(self.filter.as_ref(), self.addr)?;
        self.device.write(self.addr, value)
    }
}

/// 32-bit configuration register
pub struct PciCfgRegister32 {
    device: Arc<dyn PciConfigDevice>,
    device_id: u32,
    offset: u32,
    filter: Arc<dyn AccessFilter>,
}

impl PciCfgRegister32 {
    pub fn new(
        device: Arc<dyn PciConfigDevice>,
        device_id: u32,
        offset: u32,
        filter: Arc<dyn AccessFilter>,
    ) -> Self {
        Self {
            device,
            device_id,
            offset,
            filter,
        }
    }
}

impl HwRegister for PciCfgRegister32 {
    fn read(&self) -> Result<u64> {
        Ok(self.device.read32(self.offset)? as u64)
    }

    fn write(&self, value: u64) -> Result<()> {
        check_pci_cfg(self.filter.as_ref(), self.device_id, self.offset)?;
        self.device.write32(self.offset, value as u32)
    }
}

/// 64-bit configuration register accessed as two dwords, low first
pub struct PciCfgRegister64 {
    device: Arc<dyn PciConfigDevice>,
    device_id: u32,
    offset: u32,
    filter: Arc<dyn AccessFilter>,
}

impl PciCfgRegister64 {
    pub fn new(
        device: Arc<dyn PciConfigDevice>,
        device_id: u32,
        offset: u32,
        filter: Arc<dyn AccessFilter>,
    ) -> Self {
        Self {
            device,
            device_id,
            offset,
            filter,
        }
    }
}

impl HwRegister for PciCfgRegister64 {
    fn read(&self) -> Result<u64> {
        self.device.read64(self.offset)
    }

    /// Both dwords must be writable before either is written
    fn write(&self, value: u64) -> Result<()> {
        check_pci_cfg(self.filter.as_ref(), self.device_id, self.offset)?;
        check_pci_cfg(self.filter.as_ref(), self.device_id, self.offset + 4)?;
        self.device.write32(self.offset, value as u32)?;
        self.device.write32(self.offset + 4, (value >> 32) as u32)
    }
}

pub struct MmioRegister32 {
    window: Arc<dyn MmioDevice>,
    offset: u64,
}

impl MmioRegister32 {
    pub fn new(window: Arc<dyn MmioDevice>, offset: u64) -> Self {
        Self { window, offset }
    }
}

impl HwRegister for MmioRegister32 {
    fn read(&self) -> Result<u64> {
        Ok(self.window.read32(self.offset)? as u64)
    }

    fn write(&self, value: u64) -> Result<()> {
        self.window.write32(self.offset, value as u32)
    }
}

pub struct MmioRegister64 {
    window: Arc<dyn MmioDevice>,
    offset: u64,
}

impl MmioRegister64 {
    pub fn new(window: Arc<dyn MmioDevice>, offset: u64) -> Self {
        Self { window, offset }
    }
}

impl HwRegister for MmioRegister64 {
    fn read(&self) -> Result<u64> {
        self.window.read64(self.offset)
    }

    fn write(&self, value: u64) -> Result<()> {
        self.window.write64(self.offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::mock::{MockMmio, MockMsr, MockPci};
    use crate::common::whitelist::{AllowAll, RangeFilter};
    use crate::error::PmuError;

    #[test]
    fn test_msr_write_is_gated() {
        let msr = Arc::new(MockMsr::new(0));
        let device: Arc<dyn MsrDevice> = msr.clone();
        let filter: Arc<dyn AccessFilter> =
            Arc::new(RangeFilter::new().allow_msr_range(0x186..=0x187));

        let allowed = MsrRegister::shared(&device, 0x186, &filter);
        let denied = MsrRegister::shared(&device, 0x10, &filter);

        allowed.write(0x43_00C0).expect("allowed");
        assert!(matches!(denied.write(1), Err(PmuError::AccessDenied(_))));
        assert_eq!(msr.writes(), vec![(0x186, 0x43_00C0)]);
        // Reads are never gated
        msr.set(0x10, 7);
        assert_eq!(denied.read().expect("read"), 7);
    }

    #[test]
    fn test_pci_64_low_word_first() {
        let pci = Arc::new(MockPci::new(0x2042));
        let reg = PciCfgRegister64::new(pci.clone(), 0x2042, 0xA0, Arc::new(AllowAll));
        reg.write(0x0000_1234_8765_4321).expect("write");
        assert_eq!(
            pci.writes(),
            vec![(0xA0, 0x8765_4321), (0xA4, 0x0000_1234)]
        );
        assert_eq!(reg.read().expect("read"), 0x0000_1234_8765_4321);
    }

    #[test]
    fn test_pci_64_high_word_is_gated() {
        let pci = Arc::new(MockPci::new(0x2042));
        let filter: Arc<dyn AccessFilter> =
            Arc::new(RangeFilter::new().allow_pci_range(None, 0xA0..=0xA3));
        let reg = PciCfgRegister64::new(pci.clone(), 0x2042, 0xA0, filter);

        assert!(matches!(reg.write(1), Err(PmuError::AccessDenied(_))));
        assert!(pci.writes().is_empty());
    }

    #[test]
    fn test_mmio_widths() {
        let window = Arc::new(MockMmio::new(0x100));
        let wide = MmioRegister64::new(window.clone(), 0x8);
        let narrow = MmioRegister32::new(window, 0xC);
        wide.write(0xAAAA_BBBB_CCCC_DDDD).expect("write");
        assert_eq!(narrow.read().expect("read"), 0xAAAA_BBBB);
    }
}
