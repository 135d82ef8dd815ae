//! Uncore PMU register layouts shared by every box type
//!
//! All uncore boxes (memory controller channels, xPI links, M2M, HA, PCU,
//! CHA/CBo, IIO) expose the same building blocks: one unit (box) control
//! register, a set of counter control/counter value pairs and, on some boxes,
//! a fixed counter and filter registers. What differs between generations is
//! the bit layout of the unit control register and the order in which a
//! counter control register must be written.

use crate::register::RegisterLayout;

/// Bit width of programmable uncore counters
pub const UNCORE_COUNTER_WIDTH_BITS: u32 = 48;

/// Maximum programmable counters in one box
pub const MAX_COUNTERS_PER_BOX: usize = 8;

/// Maximum filter registers in one box
pub const MAX_FILTERS_PER_BOX: usize = 2;

/// Counter control enable bit (bit 22) used by every uncore generation
pub const UNC_PMON_CTL_EN: u64 = 1 << 22;

/// Bit layout of the unit control register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitControlLayout {
    /// Haswell-EP through Cooper Lake
    Legacy,
    /// Ice Lake-SP and later
    IcxPlus,
}

impl UnitControlLayout {
    /// Bit that resets the counter control registers
    pub const fn reset_control(&self) -> u64 {
        match self {
            UnitControlLayout::Legacy => 1 << 0,
            UnitControlLayout::IcxPlus => 1 << 8,
        }
    }

    /// Bit that zeroes the counter value registers
    pub const fn reset_counters(&self) -> u64 {
        match self {
            UnitControlLayout::Legacy => 1 << 1,
            UnitControlLayout::IcxPlus => 1 << 9,
        }
    }

    /// Freeze bit
    pub const fn freeze(&self) -> u64 {
        match self {
            UnitControlLayout::Legacy => 1 << 8,
            UnitControlLayout::IcxPlus => 1 << 0,
        }
    }

    /// Freeze-enable bit; ICX+ boxes are always freezable
    pub const fn freeze_enable(&self) -> u64 {
        match self {
            UnitControlLayout::Legacy => 1 << 16,
            UnitControlLayout::IcxPlus => 0,
        }
    }

    /// Bits that read back unchanged after a write; used to check that the
    /// unit control write took effect
    pub const fn valid_bits_mask(&self) -> u64 {
        match self {
            UnitControlLayout::Legacy => (1 << 17) - 1,
            UnitControlLayout::IcxPlus => (1 << 10) - 1,
        }
    }

    /// Value to write for "freeze enabled, running" with the extra bits of a
    /// particular box type
    pub const fn base(&self, extra: u64) -> u64 {
        self.freeze_enable() | extra
    }
}

/// How counter control registers must be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramStyle {
    /// Write the event encoding directly (ICX+)
    Direct,
    /// Write the enable bit first, then enable plus the event (legacy boxes
    /// would otherwise count a partial configuration)
    EnableFirst,
}

/// Generic uncore counter control layout
///
/// | Bits   | Field          |
/// |--------|----------------|
/// | 0-7    | event_select   |
/// | 8-15   | unit_mask      |
/// | 17     | reset          |
/// | 18     | edge_detect    |
/// | 22     | enable         |
/// | 23     | invert         |
/// | 24-31  | threshold      |
/// | 32-63  | umask_ext      |
///
/// The extended umask exists only on Sapphire Rapids and later; older boxes
/// ignore the upper dword.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UncoreCounterControl {
    pub event_select: u8,
    pub unit_mask: u8,
    pub reset: bool,
    pub edge_detect: bool,
    pub enable: bool,
    pub invert: bool,
    pub threshold: u8,
    pub umask_ext: u32,
}

impl UncoreCounterControl {
    /// Event encoding without the enable bit
    pub const fn event(event_select: u8, unit_mask: u8) -> Self {
        Self {
            event_select,
            unit_mask,
            reset: false,
            edge_detect: false,
            enable: false,
            invert: false,
            threshold: 0,
            umask_ext: 0,
        }
    }

    pub const fn with_umask_ext(mut self, umask_ext: u32) -> Self {
        self.umask_ext = umask_ext;
        self
    }

    pub const fn with_edge(mut self, threshold: u8) -> Self {
        self.edge_detect = true;
        self.threshold = threshold;
        self
    }
}

impl RegisterLayout for UncoreCounterControl {
    fn to_raw(&self) -> u64 {
        let flag = |set: bool, bit: u32| if set { 1u64 << bit } else { 0 };

        (self.event_select as u64)
            | ((self.unit_mask as u64) << 8)
            | flag(self.reset, 17)
            | flag(self.edge_detect, 18)
            | flag(self.enable, 22)
            | flag(self.invert, 23)
            | ((self.threshold as u64) << 24)
            | ((self.umask_ext as u64) << 32)
    }

    fn from_raw(value: u64) -> Self {
        let bit = |n: u32| (value >> n) & 1 != 0;

        Self {
            event_select: (value & 0xFF) as u8,
            unit_mask: ((value >> 8) & 0xFF) as u8,
            reset: bit(17),
            edge_detect: bit(18),
            enable: bit(22),
            invert: bit(23),
            threshold: ((value >> 24) & 0xFF) as u8,
            umask_ext: (value >> 32) as u32,
        }
    }
}

/// Fixed counter control value enabling the DRAM/uncore clock counter
pub const UNC_PMON_FIXED_CTL_EN: u64 = 1 << 22;

/// Fixed counter control reset bit
pub const UNC_PMON_FIXED_CTL_RST: u64 = 1 << 19;

/// Logical uncore PMU types used to index per-unit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UncorePmuId {
    Cbo,
    Cha,
    Imc,
    Edc,
    Xpi,
    M2m,
    Ha,
    Pcu,
    Iio,
    Irp,
    Ubox,
    CxlCm,
    CxlDp,
}

impl UncorePmuId {
    pub fn name(&self) -> &'static str {
        match self {
            UncorePmuId::Cbo => "cbo",
            UncorePmuId::Cha => "cha",
            UncorePmuId::Imc => "imc",
            UncorePmuId::Edc => "edc",
            UncorePmuId::Xpi => "xpi",
            UncorePmuId::M2m => "m2m",
            UncorePmuId::Ha => "ha",
            UncorePmuId::Pcu => "pcu",
            UncorePmuId::Iio => "iio",
            UncorePmuId::Irp => "irp",
            UncorePmuId::Ubox => "ubox",
            UncorePmuId::CxlCm => "cxlcm",
            UncorePmuId::CxlDp => "cxldp",
        }
    }

    pub fn all() -> Vec<UncorePmuId> {
        vec![
            UncorePmuId::Cbo,
            UncorePmuId::Cha,
            UncorePmuId::Imc,
            UncorePmuId::Edc,
            UncorePmuId::Xpi,
            UncorePmuId::M2m,
            UncorePmuId::Ha,
            UncorePmuId::Pcu,
            UncorePmuId::Iio,
            UncorePmuId::Irp,
            UncorePmuId::Ubox,
            UncorePmuId::CxlCm,
            UncorePmuId::CxlDp,
        ]
    }
}

impl std::str::FromStr for UncorePmuId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cbo" | "cbox" => Ok(UncorePmuId::Cbo),
            "cha" => Ok(UncorePmuId::Cha),
            "imc" | "mc" => Ok(UncorePmuId::Imc),
            "edc" => Ok(UncorePmuId::Edc),
            "xpi" | "upi" | "upi_ll" | "qpi" | "qpi_ll" => Ok(UncorePmuId::Xpi),
            "m2m" => Ok(UncorePmuId::M2m),
            "ha" => Ok(UncorePmuId::Ha),
            "pcu" => Ok(UncorePmuId::Pcu),
            "iio" => Ok(UncorePmuId::Iio),
            "irp" => Ok(UncorePmuId::Irp),
            "ubox" => Ok(UncorePmuId::Ubox),
            "cxlcm" => Ok(UncorePmuId::CxlCm),
            "cxldp" => Ok(UncorePmuId::CxlDp),
            other => Err(format!("unknown uncore PMU type '{other}'")),
        }
    }
}
