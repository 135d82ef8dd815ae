//! Hardware uncore discovery table
//!
//! Sapphire Rapids and later publish a per-socket table (located through a
//! PCIe DVSEC capability) that lists every uncore PMU unit with its access
//! method and register offsets. The table is a global entry followed by unit
//! entries, each three 64-bit words, spaced `stride * 8` bytes apart.
//!
//! ## Global entry
//!
//! | Word | Bits   | Field           |
//! |------|--------|-----------------|
//! | 0    | 0-7    | type            |
//! | 0    | 8-15   | stride (8 B)    |
//! | 0    | 16-25  | max_units       |
//! | 0    | 62-63  | access_type     |
//! | 1    | 0-63   | global_ctrl     |
//! | 2    | 0-7    | status_offset   |
//! | 2    | 8-23   | num_status      |
//!
//! ## Unit entry
//!
//! | Word | Bits   | Field           |
//! |------|--------|-----------------|
//! | 0    | 0-7    | num_regs        |
//! | 0    | 8-15   | ctrl_offset     |
//! | 0    | 16-23  | bit_width       |
//! | 0    | 24-31  | ctr_offset      |
//! | 0    | 32-39  | status_offset   |
//! | 0    | 62-63  | access_type     |
//! | 1    | 0-63   | box_ctrl_addr   |
//! | 2    | 0-15   | box_type        |
//! | 2    | 16-31  | box_id          |

use thiserror::Error;

use crate::arch::uncore::UncorePmuId;
use crate::register::extract_bits;

/// Words in one global or unit entry
pub const ENTRY_WORDS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("discovery table holds {len} words, need at least {needed}")]
    TableTooShort { needed: usize, len: usize },

    #[error("discovery table stride {0} is smaller than one entry")]
    InvalidStride(u64),

    #[error("unit uses unknown access type {0}")]
    UnknownAccessType(u8),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// How a unit's registers are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Msr,
    Mmio,
    PciCfg,
    Unknown(u8),
}

impl AccessType {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => AccessType::Msr,
            1 => AccessType::Mmio,
            2 => AccessType::PciCfg,
            other => AccessType::Unknown(other as u8),
        }
    }
}

/// Box type identifiers used by Sapphire Rapids class parts
pub mod box_type {
    pub const CHA: u16 = 0;
    pub const IIO: u16 = 1;
    pub const IRP: u16 = 2;
    pub const PCU: u16 = 4;
    pub const UBOX: u16 = 5;
    pub const MC: u16 = 6;
    pub const M2M: u16 = 7;
    pub const UPI: u16 = 8;
    pub const CXLCM: u16 = 12;
    pub const CXLDP: u16 = 13;
}

/// Uncore PMU family a discovery box type belongs to
pub fn pmu_for_box_type(box_type: u16) -> Option<UncorePmuId> {
    let pmu = match box_type {
        box_type::CHA => UncorePmuId::Cha,
        box_type::IIO => UncorePmuId::Iio,
        box_type::IRP => UncorePmuId::Irp,
        box_type::PCU => UncorePmuId::Pcu,
        box_type::UBOX => UncorePmuId::Ubox,
        box_type::MC => UncorePmuId::Imc,
        box_type::M2M => UncorePmuId::M2m,
        box_type::UPI => UncorePmuId::Xpi,
        box_type::CXLCM => UncorePmuId::CxlCm,
        box_type::CXLDP => UncorePmuId::CxlDp,
        _ => return None,
    };
    Some(pmu)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalEntry {
    pub entry_type: u8,
    /// Distance between entries in 8-byte units
    pub stride: u64,
    pub max_units: usize,
    pub access_type: AccessType,
    pub global_ctrl_addr: u64,
    pub status_offset: u8,
    pub num_status: u16,
}

impl GlobalEntry {
    pub fn from_words(words: &[u64; ENTRY_WORDS]) -> Self {
        Self {
            entry_type: extract_bits(words[0], 0, 7) as u8,
            stride: extract_bits(words[0], 8, 15),
            max_units: extract_bits(words[0], 16, 25) as usize,
            access_type: AccessType::from_bits(extract_bits(words[0], 62, 63)),
            global_ctrl_addr: words[1],
            status_offset: extract_bits(words[2], 0, 7) as u8,
            num_status: extract_bits(words[2], 8, 23) as u16,
        }
    }

    fn stride_words(&self) -> usize {
        self.stride as usize
    }
}

/// PCI address packed into a PCICFG unit's box control field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciCfgAddress {
    pub segment: u32,
    pub bus: u32,
    pub device: u32,
    pub function: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitEntry {
    pub num_regs: usize,
    pub ctrl_offset: u64,
    pub bit_width: u32,
    pub ctr_offset: u64,
    pub status_offset: u64,
    pub access_type: AccessType,
    pub box_ctrl_addr: u64,
    pub box_type: u16,
    pub box_id: u16,
}

impl UnitEntry {
    pub fn from_words(words: &[u64; ENTRY_WORDS]) -> Self {
        Self {
            num_regs: extract_bits(words[0], 0, 7) as usize,
            ctrl_offset: extract_bits(words[0], 8, 15),
            bit_width: extract_bits(words[0], 16, 23) as u32,
            ctr_offset: extract_bits(words[0], 24, 31),
            status_offset: extract_bits(words[0], 32, 39),
            access_type: AccessType::from_bits(extract_bits(words[0], 62, 63)),
            box_ctrl_addr: words[1],
            box_type: extract_bits(words[2], 0, 15) as u16,
            box_id: extract_bits(words[2], 16, 31) as u16,
        }
    }

    /// Empty or unpopulated slot
    fn is_placeholder(words: &[u64; ENTRY_WORDS]) -> bool {
        words[0] == u64::MAX || words[1] == 0 || words[1] == u64::MAX
    }

    pub fn pmu(&self) -> Option<UncorePmuId> {
        pmu_for_box_type(self.box_type)
    }

    fn control_stride(&self) -> u64 {
        match self.access_type {
            AccessType::Msr => 1,
            _ => 4,
        }
    }

    fn value_stride(&self) -> u64 {
        match self.access_type {
            AccessType::Msr => 1,
            _ => 8,
        }
    }

    /// Address of counter control register `index` (MSR address, physical
    /// MMIO address, or PCI config offset depending on the access type)
    pub fn counter_control(&self, index: usize) -> u64 {
        self.box_base() + self.ctrl_offset + self.control_stride() * index as u64
    }

    pub fn counter_value(&self, index: usize) -> u64 {
        self.box_base() + self.ctr_offset + self.value_stride() * index as u64
    }

    /// Address of the unit control register itself
    pub fn box_base(&self) -> u64 {
        match self.pci_address() {
            Some(addr) => addr.offset as u64,
            None => self.box_ctrl_addr,
        }
    }

    /// Decoded PCI address for PCICFG units
    pub fn pci_address(&self) -> Option<PciCfgAddress> {
        if self.access_type != AccessType::PciCfg {
            return None;
        }
        let raw = self.box_ctrl_addr;
        let devfn = extract_bits(raw, 12, 19) as u32;
        Some(PciCfgAddress {
            segment: extract_bits(raw, 28, 30) as u32,
            bus: extract_bits(raw, 20, 27) as u32,
            device: devfn >> 3,
            function: devfn & 0x7,
            offset: extract_bits(raw, 0, 11) as u32,
        })
    }
}

/// Parsed discovery table of one socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryTable {
    pub global: GlobalEntry,
    pub units: Vec<UnitEntry>,
}

fn entry_at(words: &[u64], start: usize) -> Option<[u64; ENTRY_WORDS]> {
    let slice = words.get(start..start + ENTRY_WORDS)?;
    Some([slice[0], slice[1], slice[2]])
}

impl DiscoveryTable {
    /// Parse a table from its 64-bit words starting at the global entry
    ///
    /// Units beyond the end of `words` are ignored.
    pub fn parse(words: &[u64]) -> Result<Self> {
        let global_words = entry_at(words, 0).ok_or(DiscoveryError::TableTooShort {
            needed: ENTRY_WORDS,
            len: words.len(),
        })?;
        let global = GlobalEntry::from_words(&global_words);

        if global.stride_words() < ENTRY_WORDS {
            return Err(DiscoveryError::InvalidStride(global.stride));
        }

        let units = (0..global.max_units)
            .map_while(|i| entry_at(words, (i + 1) * global.stride_words()))
            .filter(|entry| !UnitEntry::is_placeholder(entry))
            .map(|entry| UnitEntry::from_words(&entry))
            .collect();

        Ok(Self { global, units })
    }

    /// Units of one box type ordered by box id
    pub fn units_of(&self, box_type: u16) -> Vec<&UnitEntry> {
        let mut units: Vec<&UnitEntry> = self
            .units
            .iter()
            .filter(|u| u.box_type == box_type)
            .collect();
        units.sort_by_key(|u| u.box_id);
        units
    }

    pub fn count_of(&self, box_type: u16) -> usize {
        self.units.iter().filter(|u| u.box_type == box_type).count()
    }

    /// Bytes covered by the table (what a caller needs to map)
    pub fn span_bytes(global: &GlobalEntry) -> usize {
        (global.max_units + 1) * global.stride as usize * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global_word0(stride: u64, max_units: u64, access: u64) -> u64 {
        stride << 8 | max_units << 16 | access << 62
    }

    fn unit_word0(num_regs: u64, ctrl: u64, width: u64, ctr: u64, access: u64) -> u64 {
        num_regs | ctrl << 8 | width << 16 | ctr << 24 | access << 62
    }

    fn table() -> Vec<u64> {
        // stride of 4 words (32 bytes), three unit slots
        vec![
            global_word0(4, 3, 0),
            0x2FF0,
            0x0100_0000,
            0,
            // CHA 1 over MSR
            unit_word0(4, 2, 48, 8, 0),
            0x2010,
            (1 << 16) | box_type::CHA as u64,
            0,
            // MC 0 over MMIO
            unit_word0(4, 0x40, 48, 0x08, 1),
            0xFE00_0000,
            box_type::MC as u64,
            0,
            // placeholder
            u64::MAX,
            u64::MAX,
            u64::MAX,
            0,
        ]
    }

    #[test]
    fn test_parse_global_entry() {
        let parsed = DiscoveryTable::parse(&table()).expect("table parses");
        assert_eq!(parsed.global.stride, 4);
        assert_eq!(parsed.global.max_units, 3);
        assert_eq!(parsed.global.access_type, AccessType::Msr);
        assert_eq!(parsed.global.global_ctrl_addr, 0x2FF0);
        assert_eq!(parsed.units.len(), 2);
    }

    #[test]
    fn test_msr_unit_addresses() {
        let parsed = DiscoveryTable::parse(&table()).expect("table parses");
        let cha = parsed.units_of(box_type::CHA);
        assert_eq!(cha.len(), 1);
        assert_eq!(cha[0].box_id, 1);
        assert_eq!(cha[0].counter_control(1), 0x2013);
        assert_eq!(cha[0].counter_value(0), 0x2018);
        assert_eq!(cha[0].pmu(), Some(UncorePmuId::Cha));
    }

    #[test]
    fn test_mmio_unit_strides() {
        let parsed = DiscoveryTable::parse(&table()).expect("table parses");
        let mc = parsed.units_of(box_type::MC);
        assert_eq!(mc[0].access_type, AccessType::Mmio);
        assert_eq!(mc[0].counter_control(2), 0xFE00_0048);
        assert_eq!(mc[0].counter_value(1), 0xFE00_0010);
    }

    #[test]
    fn test_pci_unit_address_decoding() {
        let raw = (0x7Eu64 << 20) | ((2u64 << 3 | 1) << 12) | 0x318;
        let unit = UnitEntry::from_words(&[
            unit_word0(4, 0x38, 48, 0x08, 2),
            raw,
            box_type::UPI as u64,
        ]);
        let addr = unit.pci_address().expect("PCI unit");
        assert_eq!((addr.bus, addr.device, addr.function), (0x7E, 2, 1));
        assert_eq!(addr.offset, 0x318);
        assert_eq!(unit.counter_control(0), 0x350);
        assert_eq!(unit.counter_value(1), 0x328);
    }

    #[test]
    fn test_truncated_and_malformed_tables() {
        assert_eq!(
            DiscoveryTable::parse(&[1, 2]),
            Err(DiscoveryError::TableTooShort { needed: 3, len: 2 })
        );
        assert_eq!(
            DiscoveryTable::parse(&[global_word0(1, 4, 0), 0, 0]),
            Err(DiscoveryError::InvalidStride(1))
        );

        // Units past the end of the buffer are dropped
        let short = &table()[..8];
        let parsed = DiscoveryTable::parse(short).expect("table parses");
        assert_eq!(parsed.units.len(), 1);
    }
}
