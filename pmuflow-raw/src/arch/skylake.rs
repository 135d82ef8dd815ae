//! Skylake-SP, Cascade Lake-SP and Cooper Lake-SP uncore locations
//!
//! Memory channels, UPI links and M2M blocks are PCI devices; CHA, IIO and
//! PCU boxes are MSRs. Cascade Lake adds Optane persistent memory, counted
//! through the memory channel PMM queues, and the M2M near-memory cache
//! events used in memory mode.
//!
//! ## References
//!
//! - Intel® Xeon® Processor Scalable Memory Family Uncore Performance Monitoring Reference Manual
//! - 2nd Gen Intel® Xeon® Scalable Processors Uncore Performance Monitoring

use super::core::CoreEventSet;
use super::haswell::{CBO_0XE00, PCU_0X710, PCU_EVENTS};
use super::uncore::{ProgramStyle, UncoreCounterControl as Ev, UnitControlLayout};
use super::{
    ArchDescriptor, Availability, BoxLayout, BoxLocation, McLocation, MsrBoxes, MsrUnits,
    PciBoxes, PciLocation, LEGACY_PCI_BOX,
};
use crate::cpu::CpuModel;

const SKX_MC: [PciLocation; 6] = [
    PciLocation::new(10, 2, 0x2042),
    PciLocation::new(10, 6, 0x2046),
    PciLocation::new(11, 2, 0x204A),
    PciLocation::new(12, 2, 0x2042),
    PciLocation::new(12, 6, 0x2046),
    PciLocation::new(13, 2, 0x204A),
];

const SKX_UPI: [PciLocation; 3] = [
    PciLocation::new(14, 0, 0x2058),
    PciLocation::new(15, 0, 0x2058),
    PciLocation::new(16, 0, 0x2058),
];

const SKX_M2M: [PciLocation; 2] = [
    PciLocation::new(8, 0, 0x2066),
    PciLocation::new(9, 0, 0x2066),
];

const SKX_UPI_BOX: BoxLayout = BoxLayout {
    unit_control: 0x378,
    counter_control: 0x350,
    control_stride: 8,
    counter_value: 0x318,
    value_stride: 8,
    counters: 4,
    fixed_control: None,
    fixed_value: None,
    filters: [None, None],
};

const SKX_M2M_BOX: BoxLayout = BoxLayout {
    unit_control: 0x258,
    counter_control: 0x228,
    control_stride: 8,
    counter_value: 0x200,
    value_stride: 8,
    counters: 4,
    fixed_control: None,
    fixed_value: None,
    filters: [None, None],
};

const SKX_IIO: MsrBoxes = MsrBoxes {
    first: BoxLayout {
        unit_control: 0xA60,
        counter_control: 0xA68,
        control_stride: 1,
        counter_value: 0xA61,
        value_stride: 1,
        counters: 4,
        fixed_control: None,
        fixed_value: None,
        filters: [None, None],
    },
    units: MsrUnits::Strided {
        stride: 0x20,
        count: 6,
    },
};

/// IIO channel mask (bits 36-43) and function mask (bits 44-46) in the
/// upper control dword
pub(crate) const fn iio_port_masks(channel: u32, function: u32, channel_bits: u32) -> u32 {
    (channel << 4) | (function << (4 + channel_bits))
}

/// SNP/state filter: all LLC states, local and remote
const CHA_FILTER0_ALL_STATES: u64 = 0x1FF << 17;
/// Opcode filter: DRd in opc0, local and remote nodes
const CHA_FILTER1_OPC_DRD: u64 = (0x202 << 9) | 0x3B;

/// UPI events shared with Ice Lake-SP and Sapphire Rapids
pub(crate) const UPI_EVENTS: [Ev; 4] = [
    Ev::event(0x03, 0x0F), // RxL_FLITS.ALL_DATA
    Ev::event(0x02, 0x0F), // TxL_FLITS.ALL_DATA
    Ev::event(0x01, 0x00), // CLOCKTICKS
    Ev::event(0x27, 0x00), // TxL0P_POWER_CYCLES
];

pub(crate) const UPI_L1_EVENT: Ev = Ev::event(0x21, 0x00);

/// 64 payload bytes per 9 flits
pub(crate) const UPI_BYTES_PER_FLIT: f64 = 64.0 / 9.0;

pub fn descriptor(model: CpuModel) -> ArchDescriptor {
    let optane = matches!(model, CpuModel::CascadeLakeX | CpuModel::CooperLakeX);

    let mut availability = Availability::L2_CACHE
        | Availability::L3_CACHE
        | Availability::MEMORY_TRAFFIC
        | Availability::PACKAGE_ENERGY
        | Availability::DRAM_ENERGY
        | Availability::CORE_C_STATES
        | Availability::PACKAGE_C_STATES
        | Availability::INCOMING_XPI
        | Availability::OUTGOING_XPI
        | Availability::L3_OCCUPANCY
        | Availability::LOCAL_MEMORY_BW
        | Availability::REMOTE_MEMORY_BW
        | Availability::SMI_COUNT
        | Availability::THERMAL_HEADROOM
        | Availability::UNCORE_CLOCKS
        | Availability::LLC_MISS_LATENCY
        | Availability::IIO_TRAFFIC;
    if optane {
        availability |= Availability::PMM_TRAFFIC | Availability::NEAR_MEMORY;
    }

    ArchDescriptor {
        model,
        availability,
        core_events: CoreEventSet::Skylake,
        core_counters: 4,
        core_c_states: &[6],
        package_c_states: &[2, 6],
        unit_control: UnitControlLayout::Legacy,
        program_style: ProgramStyle::EnableFirst,
        mc: McLocation::Pci(PciBoxes {
            layout: LEGACY_PCI_BOX,
            locations: &SKX_MC,
        }),
        mc_events: [
            Ev::event(0x04, 0x03), // CAS_COUNT.RD
            Ev::event(0x04, 0x0C), // CAS_COUNT.WR
            Ev::event(0xE3, 0x00), // PMM_RPQ_INSERTS
            Ev::event(0xE7, 0x00), // PMM_WPQ_INSERTS
        ],
        edc: BoxLocation::Absent,
        edc_events: [Ev::event(0, 0); 2],
        xpi: BoxLocation::Pci(PciBoxes {
            layout: SKX_UPI_BOX,
            locations: &SKX_UPI,
        }),
        xpi_events: UPI_EVENTS,
        xpi_l1_event: UPI_L1_EVENT,
        xpi_unit_extra: 0,
        xpi_bytes_per_flit: UPI_BYTES_PER_FLIT,
        xpi_link_speed: 20_800_000_000,
        ha: BoxLocation::Pci(PciBoxes {
            layout: SKX_M2M_BOX,
            locations: &SKX_M2M,
        }),
        ha_events: [
            Ev::event(0x00, 0x00),
            Ev::event(0x00, 0x00),
            Ev::event(0x2C, 0x03), // TAG_HIT.NM_RD_HIT + NM_WR_HIT
            Ev::event(0x2D, 0x03), // TAG_MISS
        ],
        pcu: BoxLocation::Msr(PCU_0X710),
        pcu_events: PCU_EVENTS,
        cha: BoxLocation::Msr(MsrBoxes {
            first: CBO_0XE00,
            units: MsrUnits::Strided {
                stride: 0x10,
                count: 28,
            },
        }),
        cha_events: [
            Ev::event(0x36, 0x21), // TOR_OCCUPANCY.IA_MISS
            Ev::event(0x35, 0x21), // TOR_INSERTS.IA_MISS
            Ev::event(0x00, 0x00), // CLOCKTICKS
            Ev::event(0x34, 0x11), // LLC_LOOKUP.DATA_READ
        ],
        cha_filters: [CHA_FILTER0_ALL_STATES, CHA_FILTER1_OPC_DRD],
        iio: BoxLocation::Msr(SKX_IIO),
        iio_events: [
            // DATA_REQ_OF_CPU: device to memory; DATA_REQ_BY_CPU: core to device
            Ev::event(0x83, 0x04).with_umask_ext(iio_port_masks(0x01, 0x07, 8)),
            Ev::event(0x83, 0x01).with_umask_ext(iio_port_masks(0x01, 0x07, 8)),
            Ev::event(0xC0, 0x04).with_umask_ext(iio_port_masks(0x01, 0x07, 8)),
            Ev::event(0xC0, 0x01).with_umask_ext(iio_port_masks(0x01, 0x07, 8)),
        ],
        cxl_events: [Ev::event(0, 0); 2],
        bus_clock_hz: 100_000_000,
    }
}
