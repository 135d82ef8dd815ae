use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::common::platform::{PciAddress, PciConfigDevice};
use crate::error::{PmuError, Result};

/// Configuration space of one function under `/proc/bus/pci`
pub struct LinuxPciConfig {
    file: parking_lot::Mutex<File>,
    address: PciAddress,
}

impl LinuxPciConfig {
    pub fn open(proc_pci: &Path, address: PciAddress) -> Result<Self> {
        let path = if address.group_number > 0 {
            proc_pci.join(format!(
                "{:04x}:{:02x}/{:02x}.{}",
                address.group_number, address.bus, address.device, address.function
            ))
        } else {
            proc_pci.join(format!(
                "{:02x}/{:02x}.{}",
                address.bus, address.device, address.function
            ))
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    PmuError::AccessDenied(format!("PCI device {address}: {e}"))
                }
                _ => PmuError::PciError(format!("Failed to open PCI device {address}: {e}")),
            })?;

        Ok(Self {
            file: parking_lot::Mutex::new(file),
            address,
        })
    }
}

impl PciConfigDevice for LinuxPciConfig {
    fn address(&self) -> PciAddress {
        self.address
    }

    fn read32(&self, offset: u32) -> Result<u32> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset as u64)).map_err(|e| {
            PmuError::PciError(format!("{}: seek to 0x{offset:x} failed: {e}", self.address))
        })?;

        let mut buffer = [0u8; 4];
        file.read_exact(&mut buffer).map_err(|e| {
            PmuError::PciError(format!("{}: read at 0x{offset:x} failed: {e}", self.address))
        })?;

        Ok(u32::from_le_bytes(buffer))
    }

    fn write32(&self, offset: u32, value: u32) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset as u64)).map_err(|e| {
            PmuError::PciError(format!("{}: seek to 0x{offset:x} failed: {e}", self.address))
        })?;

        file.write_all(&value.to_le_bytes()).map_err(|e| {
            PmuError::PciError(format!("{}: write at 0x{offset:x} failed: {e}", self.address))
        })?;

        Ok(())
    }
}

/// One MCFG allocation: an ECAM window covering a bus range of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McfgRecord {
    pub base_address: u64,
    pub pci_segment_group: u16,
    pub start_bus: u8,
    pub end_bus: u8,
}

/// ACPI MCFG table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mcfg {
    pub records: Vec<McfgRecord>,
}

impl Mcfg {
    const HEADER_LEN: usize = 44;
    const RECORD_LEN: usize = 16;

    pub fn load(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| PmuError::PciError(format!("Failed to read MCFG table: {e}")))?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::HEADER_LEN || &bytes[0..4] != b"MCFG" {
            return Err(PmuError::PciError("malformed MCFG header".to_string()));
        }
        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let length = length.min(bytes.len());

        let records = bytes[Self::HEADER_LEN..length]
            .chunks_exact(Self::RECORD_LEN)
            .map(|r| {
                let mut base = [0u8; 8];
                base.copy_from_slice(&r[0..8]);
                McfgRecord {
                    base_address: u64::from_le_bytes(base),
                    pci_segment_group: u16::from_le_bytes([r[8], r[9]]),
                    start_bus: r[10],
                    end_bus: r[11],
                }
            })
            .collect();

        Ok(Self { records })
    }

    /// (segment, first bus, last bus) per record
    pub fn bus_ranges(&self) -> Vec<(u32, u32, u32)> {
        self.records
            .iter()
            .map(|r| {
                (
                    r.pci_segment_group as u32,
                    r.start_bus as u32,
                    r.end_bus as u32,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(records: &[(u64, u16, u8, u8)]) -> Vec<u8> {
        let mut bytes = vec![0u8; Mcfg::HEADER_LEN];
        bytes[0..4].copy_from_slice(b"MCFG");
        let len = (Mcfg::HEADER_LEN + records.len() * Mcfg::RECORD_LEN) as u32;
        bytes[4..8].copy_from_slice(&len.to_le_bytes());
        for &(base, seg, start, end) in records {
            bytes.extend_from_slice(&base.to_le_bytes());
            bytes.extend_from_slice(&seg.to_le_bytes());
            bytes.push(start);
            bytes.push(end);
            bytes.extend_from_slice(&[0; 4]);
        }
        bytes
    }

    #[test]
    fn test_parse_mcfg_records() {
        let mcfg = Mcfg::parse(&table(&[(0x8000_0000, 0, 0, 0xFF), (0x9000_0000, 1, 0, 0x7F)]))
            .expect("parse");
        assert_eq!(mcfg.records.len(), 2);
        assert_eq!(mcfg.records[1].base_address, 0x9000_0000);
        assert_eq!(mcfg.bus_ranges(), vec![(0, 0, 255), (1, 0, 127)]);
    }

    #[test]
    fn test_rejects_wrong_signature() {
        let mut bytes = table(&[]);
        bytes[0] = b'X';
        assert!(Mcfg::parse(&bytes).is_err());
    }

    #[test]
    fn test_length_bounds_records() {
        let mut bytes = table(&[(0x8000_0000, 0, 0, 0xFF)]);
        // Trailing garbage beyond the declared length is ignored
        bytes.extend_from_slice(&[0xAA; 16]);
        assert_eq!(Mcfg::parse(&bytes).expect("parse").records.len(), 1);
    }
}
