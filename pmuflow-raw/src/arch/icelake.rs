//! Ice Lake-SP and Snow Ridge uncore locations
//!
//! Memory channel PMUs moved from PCI configuration space into MMIO. The
//! window base is assembled from two registers of a per-socket PCI device:
//! a socket-wide base and one offset per memory controller.
//!
//! ## References
//!
//! - 3rd Gen Intel® Xeon® Processor Scalable Family, Codename Ice Lake, Uncore Performance Monitoring Reference Manual

use super::core::CoreEventSet;
use super::haswell::PCU_0X710;
use super::skylake::{iio_port_masks, UPI_BYTES_PER_FLIT, UPI_EVENTS, UPI_L1_EVENT};
use super::uncore::{ProgramStyle, UncoreCounterControl as Ev, UnitControlLayout};
use super::{
    ArchDescriptor, Availability, BoxLayout, BoxLocation, McLocation, MmioMcLayout, MsrBoxes,
    MsrUnits, PciBoxes, PciLocation,
};
use crate::cpu::CpuModel;

/// Memory channel PMU relative to the channel window
const ICX_MC_CHANNEL: BoxLayout = BoxLayout {
    unit_control: 0x00,
    counter_control: 0x40,
    control_stride: 4,
    counter_value: 0x08,
    value_stride: 8,
    counters: 4,
    fixed_control: Some(0x54),
    fixed_value: Some(0x38),
    filters: [None, None],
};

const fn icx_mc(controllers: usize) -> MmioMcLayout {
    MmioMcLayout {
        base_device: PciLocation::new(0, 1, 0x3451),
        base_offset: 0xD0,
        base_mask: 0x1FFF_FFFF,
        base_shift: 23,
        mem_offset: 0xD8,
        mem_stride: 4,
        mem_mask: 0x7FF,
        mem_shift: 12,
        controllers,
        channel_offset: 0x22800,
        channels_per_controller: 2,
        channel_stride: 0x4000,
        window_size: 0x4000,
        layout: ICX_MC_CHANNEL,
    }
}

const ICX_UPI: [PciLocation; 3] = [
    PciLocation::new(2, 1, 0x3441),
    PciLocation::new(3, 1, 0x3441),
    PciLocation::new(4, 1, 0x3441),
];

const ICX_UPI_BOX: BoxLayout = BoxLayout {
    unit_control: 0x318,
    counter_control: 0x350,
    control_stride: 8,
    counter_value: 0x320,
    value_stride: 8,
    counters: 4,
    fixed_control: None,
    fixed_value: None,
    filters: [None, None],
};

const ICX_M2M: [PciLocation; 4] = [
    PciLocation::new(12, 0, 0x344A),
    PciLocation::new(13, 0, 0x344A),
    PciLocation::new(14, 0, 0x344A),
    PciLocation::new(15, 0, 0x344A),
];

const ICX_M2M_BOX: BoxLayout = BoxLayout {
    unit_control: 0x438,
    counter_control: 0x468,
    control_stride: 8,
    counter_value: 0x440,
    value_stride: 8,
    counters: 4,
    fixed_control: None,
    fixed_value: None,
    filters: [None, None],
};

const ICX_CHA: MsrBoxes = MsrBoxes {
    first: BoxLayout {
        unit_control: 0xE00,
        counter_control: 0xE01,
        control_stride: 1,
        counter_value: 0xE08,
        value_stride: 1,
        counters: 4,
        fixed_control: None,
        fixed_value: None,
        filters: [Some(0xE05), None],
    },
    units: MsrUnits::Strided {
        stride: 0x0E,
        count: 40,
    },
};

/// IIO stacks are not evenly spaced on Ice Lake-SP
const ICX_IIO: MsrBoxes = MsrBoxes {
    first: BoxLayout {
        unit_control: 0xA50,
        counter_control: 0xA58,
        control_stride: 1,
        counter_value: 0xA41,
        value_stride: 1,
        counters: 4,
        fixed_control: None,
        fixed_value: None,
        filters: [None, None],
    },
    units: MsrUnits::Listed(&[0x00, 0x20, 0x40, 0x90, 0xA0, 0xB0]),
};

/// Demand data read misses from local cores
const TOR_IA_MISS_DRD: u32 = 0xC8_17FE;

pub fn descriptor(model: CpuModel) -> ArchDescriptor {
    let snow_ridge = model == CpuModel::SnowRidge;

    let mut availability = Availability::L2_CACHE
        | Availability::MEMORY_TRAFFIC
        | Availability::PACKAGE_ENERGY
        | Availability::DRAM_ENERGY
        | Availability::CORE_C_STATES
        | Availability::PACKAGE_C_STATES
        | Availability::L3_OCCUPANCY
        | Availability::LOCAL_MEMORY_BW
        | Availability::REMOTE_MEMORY_BW
        | Availability::SMI_COUNT
        | Availability::THERMAL_HEADROOM
        | Availability::UNCORE_CLOCKS
        | Availability::IIO_TRAFFIC;
    if !snow_ridge {
        availability |= Availability::L3_CACHE
            | Availability::PMM_TRAFFIC
            | Availability::NEAR_MEMORY
            | Availability::INCOMING_XPI
            | Availability::OUTGOING_XPI
            | Availability::TOPDOWN
            | Availability::LLC_MISS_LATENCY;
    }

    ArchDescriptor {
        model,
        availability,
        core_events: CoreEventSet::Skylake,
        core_counters: 4,
        core_c_states: &[6],
        package_c_states: &[2, 6],
        unit_control: UnitControlLayout::IcxPlus,
        program_style: ProgramStyle::Direct,
        mc: McLocation::Mmio(icx_mc(if snow_ridge { 1 } else { 4 })),
        mc_events: [
            Ev::event(0x04, 0x0F), // CAS_COUNT.RD
            Ev::event(0x04, 0x30), // CAS_COUNT.WR
            Ev::event(0xE3, 0x00), // PMM_RPQ_INSERTS
            Ev::event(0xE7, 0x00), // PMM_WPQ_INSERTS
        ],
        edc: BoxLocation::Absent,
        edc_events: [Ev::event(0, 0); 2],
        xpi: if snow_ridge {
            BoxLocation::Absent
        } else {
            BoxLocation::Pci(PciBoxes {
                layout: ICX_UPI_BOX,
                locations: &ICX_UPI,
            })
        },
        xpi_events: UPI_EVENTS,
        xpi_l1_event: UPI_L1_EVENT,
        xpi_unit_extra: 0,
        xpi_bytes_per_flit: UPI_BYTES_PER_FLIT,
        xpi_link_speed: 22_400_000_000,
        ha: if snow_ridge {
            BoxLocation::Absent
        } else {
            BoxLocation::Pci(PciBoxes {
                layout: ICX_M2M_BOX,
                locations: &ICX_M2M,
            })
        },
        ha_events: [
            Ev::event(0x00, 0x00),
            Ev::event(0x00, 0x00),
            Ev::event(0x2C, 0x03), // TAG_HIT.NM_RD_HIT + NM_WR_HIT
            Ev::event(0x2D, 0x03), // TAG_MISS
        ],
        pcu: BoxLocation::Msr(PCU_0X710),
        pcu_events: [
            Ev::event(0x01, 0x00), // CLOCKTICKS
            Ev::event(0x04, 0x00), // FREQ_MAX_LIMIT_THERMAL_CYCLES
            Ev::event(0x05, 0x00), // FREQ_MAX_POWER_CYCLES
            Ev::event(0x0A, 0x00), // PROCHOT_EXTERNAL_CYCLES
        ],
        cha: BoxLocation::Msr(ICX_CHA),
        cha_events: [
            Ev::event(0x36, 0x01).with_umask_ext(TOR_IA_MISS_DRD),
            Ev::event(0x35, 0x01).with_umask_ext(TOR_IA_MISS_DRD),
            Ev::event(0x01, 0x00), // CLOCKTICKS
            Ev::event(0x34, 0xFF).with_umask_ext(0x1FFF),
        ],
        cha_filters: [0, 0],
        iio: BoxLocation::Msr(ICX_IIO),
        iio_events: [
            Ev::event(0x83, 0x04).with_umask_ext(iio_port_masks(0x001, 0x07, 12)),
            Ev::event(0x83, 0x01).with_umask_ext(iio_port_masks(0x001, 0x07, 12)),
            Ev::event(0xC0, 0x04).with_umask_ext(iio_port_masks(0x001, 0x07, 12)),
            Ev::event(0xC0, 0x01).with_umask_ext(iio_port_masks(0x001, 0x07, 12)),
        ],
        cxl_events: [Ev::event(0, 0); 2],
        bus_clock_hz: 100_000_000,
    }
}
