//! Sapphire Rapids and Emerald Rapids uncore locations
//!
//! Memory channels, UPI links, M2M blocks and CXL ports are located through
//! the hardware discovery table (see [`crate::discovery`]). CHA, IIO and PCU
//! boxes keep fixed MSR addresses.
//!
//! ## References
//!
//! - 4th Gen Intel® Xeon® Scalable Processor Uncore Performance Monitoring Reference Manual

use super::core::CoreEventSet;
use super::skylake::{iio_port_masks, UPI_BYTES_PER_FLIT, UPI_EVENTS, UPI_L1_EVENT};
use super::uncore::{ProgramStyle, UncoreCounterControl as Ev, UnitControlLayout};
use super::{
    ArchDescriptor, Availability, BoxLayout, BoxLocation, McLocation, MsrBoxes, MsrUnits,
    PciLocation,
};
use crate::cpu::CpuModel;

const SPR_PCU: MsrBoxes = MsrBoxes {
    first: BoxLayout {
        unit_control: 0x2FC0,
        counter_control: 0x2FC2,
        control_stride: 1,
        counter_value: 0x2FC8,
        value_stride: 1,
        counters: 4,
        fixed_control: None,
        fixed_value: None,
        filters: [None, None],
    },
    units: MsrUnits::Strided {
        stride: 0,
        count: 1,
    },
};

const SPR_CHA: MsrBoxes = MsrBoxes {
    first: BoxLayout {
        unit_control: 0x2000,
        counter_control: 0x2002,
        control_stride: 1,
        counter_value: 0x2008,
        value_stride: 1,
        counters: 4,
        fixed_control: None,
        fixed_value: None,
        filters: [Some(0x200E), None],
    },
    units: MsrUnits::Strided {
        stride: 0x10,
        count: 60,
    },
};

const SPR_IIO: MsrBoxes = MsrBoxes {
    first: BoxLayout {
        unit_control: 0x3000,
        counter_control: 0x3008,
        control_stride: 1,
        counter_value: 0x3001,
        value_stride: 1,
        counters: 4,
        fixed_control: None,
        fixed_value: None,
        filters: [None, None],
    },
    units: MsrUnits::Strided {
        stride: 0x10,
        count: 12,
    },
};

const TOR_IA_MISS_DRD: u32 = 0xC8_17FE;

/// Performance monitor of the data streaming (DSA) and analytics (IAA)
/// accelerators, all offsets relative to the perfmon block in BAR0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxLayout {
    pub devices: &'static [PciLocation],
    /// Configuration offset of BAR0
    pub bar_offset: u32,
    pub bar_mask: u64,
    /// BAR0 register whose low 16 bits locate the perfmon block
    pub table_offset_register: u64,
    pub table_multiplier: u64,
    pub window_size: usize,
    pub reset_control: u64,
    pub freeze_control: u64,
    pub general_control: u64,
    pub counter_config: u64,
    pub counter_data: u64,
    pub counter_stride: u64,
    pub filter_config: u64,
    pub filter_stride: u64,
    pub filters_per_counter: usize,
    pub counters: usize,
}

impl IdxLayout {
    pub const fn config(&self, counter: usize) -> u64 {
        self.counter_config + self.counter_stride * counter as u64
    }

    pub const fn data(&self, counter: usize) -> u64 {
        self.counter_data + self.counter_stride * counter as u64
    }

    /// 32-bit filter `filter` of `counter`
    pub const fn filter(&self, counter: usize, filter: usize) -> u64 {
        self.filter_config + self.filter_stride * counter as u64 + 4 * filter as u64
    }
}

pub const DSA_DEVICE_ID: u32 = 0x0B25;
pub const IAA_DEVICE_ID: u32 = 0x0CFE;

pub const IDX: IdxLayout = IdxLayout {
    devices: &[
        PciLocation::new(1, 0, DSA_DEVICE_ID),
        PciLocation::new(2, 0, IAA_DEVICE_ID),
    ],
    bar_offset: 0x10,
    bar_mask: !0xFFF,
    table_offset_register: 0x68,
    table_multiplier: 0x100,
    window_size: 0x1000,
    reset_control: 0x10,
    freeze_control: 0x20,
    general_control: 0x30,
    counter_config: 0x100,
    counter_data: 0x200,
    counter_stride: 8,
    filter_config: 0x300,
    filter_stride: 0x20,
    filters_per_counter: 5,
    counters: 4,
};

pub fn descriptor(model: CpuModel) -> ArchDescriptor {
    ArchDescriptor {
        model,
        availability: Availability::L2_CACHE
            | Availability::L3_CACHE
            | Availability::MEMORY_TRAFFIC
            | Availability::PMM_TRAFFIC
            | Availability::PACKAGE_ENERGY
            | Availability::DRAM_ENERGY
            | Availability::CORE_C_STATES
            | Availability::PACKAGE_C_STATES
            | Availability::INCOMING_XPI
            | Availability::OUTGOING_XPI
            | Availability::L3_OCCUPANCY
            | Availability::LOCAL_MEMORY_BW
            | Availability::REMOTE_MEMORY_BW
            | Availability::TOPDOWN
            | Availability::SMI_COUNT
            | Availability::THERMAL_HEADROOM
            | Availability::UNCORE_CLOCKS
            | Availability::LLC_MISS_LATENCY
            | Availability::IIO_TRAFFIC
            | Availability::CXL_TRAFFIC,
        core_events: CoreEventSet::Skylake,
        core_counters: 4,
        core_c_states: &[6],
        package_c_states: &[2, 6],
        unit_control: UnitControlLayout::IcxPlus,
        program_style: ProgramStyle::Direct,
        mc: McLocation::Discovered,
        mc_events: [
            Ev::event(0x05, 0xCF), // CAS_COUNT.RD
            Ev::event(0x05, 0xF0), // CAS_COUNT.WR
            Ev::event(0xE3, 0x00), // PMM_RPQ_INSERTS
            Ev::event(0xE7, 0x00), // PMM_WPQ_INSERTS
        ],
        edc: BoxLocation::Absent,
        edc_events: [Ev::event(0, 0); 2],
        xpi: BoxLocation::Discovered,
        xpi_events: UPI_EVENTS,
        xpi_l1_event: UPI_L1_EVENT,
        xpi_unit_extra: 0,
        xpi_bytes_per_flit: UPI_BYTES_PER_FLIT,
        xpi_link_speed: 32_000_000_000,
        ha: BoxLocation::Discovered,
        ha_events: [Ev::event(0, 0); 4],
        pcu: BoxLocation::Msr(SPR_PCU),
        pcu_events: [
            Ev::event(0x01, 0x00), // CLOCKTICKS
            Ev::event(0x04, 0x00), // FREQ_MAX_LIMIT_THERMAL_CYCLES
            Ev::event(0x05, 0x00), // FREQ_MAX_POWER_CYCLES
            Ev::event(0x0A, 0x00), // PROCHOT_EXTERNAL_CYCLES
        ],
        cha: BoxLocation::Msr(SPR_CHA),
        cha_events: [
            Ev::event(0x36, 0x01).with_umask_ext(TOR_IA_MISS_DRD),
            Ev::event(0x35, 0x01).with_umask_ext(TOR_IA_MISS_DRD),
            Ev::event(0x01, 0x00), // CLOCKTICKS
            Ev::event(0x34, 0xFF).with_umask_ext(0x1FFF),
        ],
        cha_filters: [0, 0],
        iio: BoxLocation::Msr(SPR_IIO),
        iio_events: [
            Ev::event(0x83, 0x04).with_umask_ext(iio_port_masks(0x001, 0x07, 12)),
            Ev::event(0x83, 0x01).with_umask_ext(iio_port_masks(0x001, 0x07, 12)),
            Ev::event(0xC0, 0x04).with_umask_ext(iio_port_masks(0x001, 0x07, 12)),
            Ev::event(0xC0, 0x01).with_umask_ext(iio_port_masks(0x001, 0x07, 12)),
        ],
        cxl_events: [
            Ev::event(0x02, 0x10), // TxC_PACK_BUF_INSERTS.MEM_DATA
            Ev::event(0x02, 0x04), // TxC_PACK_BUF_INSERTS.CACHE_DATA
        ],
        bus_clock_hz: 100_000_000,
    }
}
