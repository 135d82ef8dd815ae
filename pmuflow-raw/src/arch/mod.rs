//! Architecture descriptors
//!
//! Each supported generation contributes one [`ArchDescriptor`]: unit counts,
//! register locations, event encodings and the set of metrics that exist on
//! that part. The descriptor is looked up once from the detected
//! [`CpuModel`]; nothing downstream switches on the model again.
//!
//! ## Supported Architectures
//!
//! - Haswell-EP / Broadwell-EP (`haswell`)
//! - Knights Landing (`knights`)
//! - Skylake-SP / Cascade Lake / Cooper Lake (`skylake`)
//! - Ice Lake-SP / Snow Ridge (`icelake`)
//! - Sapphire Rapids / Emerald Rapids (`sapphirerapids`)
//! - Client parts (`client`)

pub mod client;
pub mod core;
pub mod haswell;
pub mod icelake;
pub mod knights;
pub mod rapl;
pub mod rdt;
pub mod sapphirerapids;
pub mod skylake;
pub mod uncore;

use bitflags::bitflags;

use crate::cpu::CpuModel;
use self::core::CoreEventSet;
use self::uncore::{ProgramStyle, UncoreCounterControl, UnitControlLayout};

bitflags! {
    /// Metric families present on a processor generation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Availability: u32 {
        const L2_CACHE = 1 << 0;
        const L3_CACHE = 1 << 1;
        const MEMORY_TRAFFIC = 1 << 2;
        const PMM_TRAFFIC = 1 << 3;
        const EDC_TRAFFIC = 1 << 4;
        const IO_REQUESTS = 1 << 5;
        const PACKAGE_ENERGY = 1 << 6;
        const DRAM_ENERGY = 1 << 7;
        const CORE_C_STATES = 1 << 8;
        const PACKAGE_C_STATES = 1 << 9;
        const INCOMING_XPI = 1 << 10;
        const OUTGOING_XPI = 1 << 11;
        const L3_OCCUPANCY = 1 << 12;
        const LOCAL_MEMORY_BW = 1 << 13;
        const REMOTE_MEMORY_BW = 1 << 14;
        const TOPDOWN = 1 << 15;
        const SMI_COUNT = 1 << 16;
        const THERMAL_HEADROOM = 1 << 17;
        const NEAR_MEMORY = 1 << 18;
        const HA_REQUESTS = 1 << 19;
        const CXL_TRAFFIC = 1 << 20;
        const UNCORE_CLOCKS = 1 << 21;
        const LLC_MISS_LATENCY = 1 << 22;
        const IIO_TRAFFIC = 1 << 23;
    }
}

/// Counter slot assignments used when programming each box type
///
/// The derived metrics read counters by these positions.
pub mod slot {
    pub const MC_READ: usize = 0;
    pub const MC_WRITE: usize = 1;
    pub const MC_PMM_READ: usize = 2;
    pub const MC_PMM_WRITE: usize = 3;

    pub const EDC_READ: usize = 0;
    pub const EDC_WRITE: usize = 1;

    pub const XPI_INCOMING: usize = 0;
    pub const XPI_OUTGOING: usize = 1;
    pub const XPI_CLOCKS: usize = 2;
    pub const XPI_POWER: usize = 3;

    pub const HA_REQUESTS: usize = 0;
    pub const HA_LOCAL_REQUESTS: usize = 1;
    pub const HA_NM_HIT: usize = 2;
    pub const HA_NM_MISS: usize = 3;

    pub const PCU_CLOCKS: usize = 0;
    pub const PCU_THERMAL_LIMIT: usize = 1;
    pub const PCU_POWER_LIMIT: usize = 2;
    pub const PCU_PROCHOT: usize = 3;

    pub const CHA_TOR_OCCUPANCY: usize = 0;
    pub const CHA_TOR_INSERTS: usize = 1;
    pub const CHA_CLOCKS: usize = 2;
    pub const CHA_LLC_LOOKUP: usize = 3;

    pub const IIO_IN_READ: usize = 0;
    pub const IIO_IN_WRITE: usize = 1;
    pub const IIO_OUT_READ: usize = 2;
    pub const IIO_OUT_WRITE: usize = 3;

    pub const CXL_MEM_WRITE: usize = 0;
    pub const CXL_CACHE_WRITE: usize = 1;
}

/// PCI coordinates of one uncore unit (the bus is resolved per socket)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciLocation {
    pub device: u32,
    pub function: u32,
    pub device_id: u32,
}

impl PciLocation {
    pub const fn new(device: u32, function: u32, device_id: u32) -> Self {
        Self {
            device,
            function,
            device_id,
        }
    }
}

/// Register offsets of one box, relative to its base (PCI config offset,
/// MMIO offset, or absolute MSR address for MSR boxes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxLayout {
    pub unit_control: u64,
    pub counter_control: u64,
    pub control_stride: u64,
    pub counter_value: u64,
    pub value_stride: u64,
    pub counters: usize,
    pub fixed_control: Option<u64>,
    pub fixed_value: Option<u64>,
    pub filters: [Option<u64>; 2],
}

impl BoxLayout {
    pub const fn control(&self, index: usize) -> u64 {
        self.counter_control + self.control_stride * index as u64
    }

    pub const fn value(&self, index: usize) -> u64 {
        self.counter_value + self.value_stride * index as u64
    }

    /// The same layout shifted by `offset` (next MSR box or MMIO channel)
    pub const fn shifted(&self, offset: u64) -> Self {
        const fn shift(v: Option<u64>, offset: u64) -> Option<u64> {
            match v {
                Some(x) => Some(x + offset),
                None => None,
            }
        }
        Self {
            unit_control: self.unit_control + offset,
            counter_control: self.counter_control + offset,
            control_stride: self.control_stride,
            counter_value: self.counter_value + offset,
            value_stride: self.value_stride,
            counters: self.counters,
            fixed_control: shift(self.fixed_control, offset),
            fixed_value: shift(self.fixed_value, offset),
            filters: [
                shift(self.filters[0], offset),
                shift(self.filters[1], offset),
            ],
        }
    }
}

/// Uncore boxes addressed through PCI configuration space
#[derive(Debug, Clone, Copy)]
pub struct PciBoxes {
    pub layout: BoxLayout,
    pub locations: &'static [PciLocation],
}

/// Placement of successive MSR boxes relative to the first one
#[derive(Debug, Clone, Copy)]
pub enum MsrUnits {
    Strided { stride: u64, count: usize },
    Listed(&'static [u64]),
}

/// Uncore boxes addressed through per-core MSRs
#[derive(Debug, Clone, Copy)]
pub struct MsrBoxes {
    pub first: BoxLayout,
    pub units: MsrUnits,
}

impl MsrBoxes {
    pub const fn max_units(&self) -> usize {
        match self.units {
            MsrUnits::Strided { count, .. } => count,
            MsrUnits::Listed(offsets) => offsets.len(),
        }
    }

    /// Layout of box `index`, or `None` past the last box
    pub fn unit(&self, index: usize) -> Option<BoxLayout> {
        let offset = match self.units {
            MsrUnits::Strided { stride, count } if index < count => stride * index as u64,
            MsrUnits::Listed(offsets) => *offsets.get(index)?,
            _ => return None,
        };
        Some(self.first.shifted(offset))
    }
}

/// Memory controller channels behind an MMIO window whose base is
/// assembled from PCI configuration registers (Ice Lake-SP)
#[derive(Debug, Clone, Copy)]
pub struct MmioMcLayout {
    /// Device holding the MMIO base registers
    pub base_device: PciLocation,
    pub base_offset: u32,
    pub base_mask: u64,
    pub base_shift: u32,
    pub mem_offset: u32,
    pub mem_stride: u32,
    pub mem_mask: u64,
    pub mem_shift: u32,
    pub controllers: usize,
    /// Offset of the first channel window from the controller base
    pub channel_offset: u64,
    pub channels_per_controller: usize,
    pub channel_stride: u64,
    pub window_size: usize,
    /// Box layout relative to the channel window
    pub layout: BoxLayout,
}

/// Client memory controller free-running counters in the MCHBAR window
#[derive(Debug, Clone, Copy)]
pub struct ClientImc {
    /// Offset of MCHBAR in the host bridge (0:0.0) configuration space
    pub mchbar_offset: u32,
    pub mchbar_mask: u64,
    pub window_offset: u64,
    pub window_size: usize,
    pub reads: u64,
    pub writes: u64,
    pub io_requests: u64,
    pub counter_width: u32,
}

/// Where the memory controller PMUs live
#[derive(Debug, Clone, Copy)]
pub enum McLocation {
    Pci(PciBoxes),
    Mmio(MmioMcLayout),
    Client(ClientImc),
    /// Located through the hardware discovery table
    Discovered,
    Absent,
}

/// Where a non-memory PCI box family lives
#[derive(Debug, Clone, Copy)]
pub enum BoxLocation {
    Pci(PciBoxes),
    Msr(MsrBoxes),
    Discovered,
    Absent,
}

impl BoxLocation {
    pub fn is_present(&self) -> bool {
        !matches!(self, BoxLocation::Absent)
    }
}

/// Everything the agent needs to know about one processor generation
#[derive(Debug, Clone)]
pub struct ArchDescriptor {
    pub model: CpuModel,
    pub availability: Availability,

    pub core_events: CoreEventSet,
    /// General purpose counters per hardware thread with SMT enabled
    pub core_counters: usize,
    pub core_c_states: &'static [usize],
    pub package_c_states: &'static [usize],

    pub unit_control: UnitControlLayout,
    pub program_style: ProgramStyle,

    pub mc: McLocation,
    pub mc_events: [UncoreCounterControl; 4],
    pub edc: BoxLocation,
    pub edc_events: [UncoreCounterControl; 2],

    pub xpi: BoxLocation,
    pub xpi_events: [UncoreCounterControl; 4],
    /// Alternative for the power slot counting L1 residency cycles
    pub xpi_l1_event: UncoreCounterControl,
    /// Extra unit control bits xPI boxes require
    pub xpi_unit_extra: u64,
    pub xpi_bytes_per_flit: f64,
    /// Raw link transfer rate in bytes per second
    pub xpi_link_speed: u64,

    pub ha: BoxLocation,
    pub ha_events: [UncoreCounterControl; 4],

    pub pcu: BoxLocation,
    pub pcu_events: [UncoreCounterControl; 4],

    pub cha: BoxLocation,
    pub cha_events: [UncoreCounterControl; 4],
    /// Filter register values programmed with the CHA events
    pub cha_filters: [u64; 2],

    pub iio: BoxLocation,
    pub iio_events: [UncoreCounterControl; 4],

    pub cxl_events: [UncoreCounterControl; 2],

    /// Nominal bus clock used to convert the platform-info ratio (Hz)
    pub bus_clock_hz: u64,
}

impl ArchDescriptor {
    /// Register-location table for `model`
    pub fn for_model(model: CpuModel) -> Self {
        match model {
            CpuModel::HaswellX | CpuModel::BroadwellX => haswell::descriptor(model),
            CpuModel::KnightsLanding => knights::descriptor(model),
            CpuModel::SkylakeX | CpuModel::CascadeLakeX | CpuModel::CooperLakeX => {
                skylake::descriptor(model)
            }
            CpuModel::IceLakeX | CpuModel::SnowRidge => icelake::descriptor(model),
            CpuModel::SapphireRapids | CpuModel::EmeraldRapids => {
                sapphirerapids::descriptor(model)
            }
            CpuModel::SkylakeClient | CpuModel::IceLakeClient => client::descriptor(model),
        }
    }

    pub fn is_available(&self, what: Availability) -> bool {
        self.availability.contains(what)
    }

    pub fn core_c_state_available(&self, state: usize) -> bool {
        state <= 1 || self.core_c_states.contains(&state)
    }

    pub fn package_c_state_available(&self, state: usize) -> bool {
        self.package_c_states.contains(&state)
    }

    /// Number of memory channels per socket the tables describe
    pub fn mc_channels(&self) -> usize {
        match &self.mc {
            McLocation::Pci(boxes) => boxes.locations.len(),
            McLocation::Mmio(mmio) => mmio.controllers * mmio.channels_per_controller,
            McLocation::Client(_) => 1,
            McLocation::Discovered | McLocation::Absent => 0,
        }
    }

    /// Accelerator PMU layout on parts that carry DSA/IAA devices
    pub fn idx(&self) -> Option<sapphirerapids::IdxLayout> {
        self.model
            .has_uncore_discovery()
            .then_some(sapphirerapids::IDX)
    }

    /// Number of xPI links per socket the tables describe
    pub fn xpi_links(&self) -> usize {
        match &self.xpi {
            BoxLocation::Pci(boxes) => boxes.locations.len(),
            BoxLocation::Msr(boxes) => boxes.max_units(),
            BoxLocation::Discovered | BoxLocation::Absent => 0,
        }
    }
}

/// Standard 4-counter PCI box layout shared by HA, QPI and memory channels
/// on Haswell-EP through Skylake-SP
pub(crate) const LEGACY_PCI_BOX: BoxLayout = BoxLayout {
    unit_control: 0xF4,
    counter_control: 0xD8,
    control_stride: 4,
    counter_value: 0xA0,
    value_stride: 8,
    counters: 4,
    fixed_control: Some(0xF0),
    fixed_value: Some(0xD0),
    filters: [None, None],
};
