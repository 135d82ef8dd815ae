//! Haswell-EP and Broadwell-EP uncore locations
//!
//! Memory channels, QPI links and home agents are PCI devices on the socket's
//! uncore bus; the PCU and CBo boxes are MSRs.
//!
//! ## References
//!
//! - Intel® Xeon® Processor E5 and E7 v3 Family Uncore Performance Monitoring Reference Manual
//! - Intel® Xeon® Processor E5 and E7 v4 Family Uncore Performance Monitoring Reference Manual

use super::core::CoreEventSet;
use super::uncore::{ProgramStyle, UncoreCounterControl as Ev, UnitControlLayout};
use super::{
    ArchDescriptor, Availability, BoxLayout, BoxLocation, McLocation, MsrBoxes, MsrUnits,
    PciBoxes, PciLocation, LEGACY_PCI_BOX,
};
use crate::cpu::CpuModel;

const HSX_MC: [PciLocation; 8] = [
    PciLocation::new(20, 0, 0x2FB4),
    PciLocation::new(20, 1, 0x2FB5),
    PciLocation::new(21, 0, 0x2FB0),
    PciLocation::new(21, 1, 0x2FB1),
    PciLocation::new(23, 0, 0x2FD4),
    PciLocation::new(23, 1, 0x2FD5),
    PciLocation::new(24, 0, 0x2FD0),
    PciLocation::new(24, 1, 0x2FD1),
];

const BDX_MC: [PciLocation; 8] = [
    PciLocation::new(20, 0, 0x6FB4),
    PciLocation::new(20, 1, 0x6FB5),
    PciLocation::new(21, 0, 0x6FB0),
    PciLocation::new(21, 1, 0x6FB1),
    PciLocation::new(23, 0, 0x6FD4),
    PciLocation::new(23, 1, 0x6FD5),
    PciLocation::new(24, 0, 0x6FD0),
    PciLocation::new(24, 1, 0x6FD1),
];

const HSX_QPI: [PciLocation; 3] = [
    PciLocation::new(8, 2, 0x2F32),
    PciLocation::new(9, 2, 0x2F33),
    PciLocation::new(10, 2, 0x2F3A),
];

const BDX_QPI: [PciLocation; 3] = [
    PciLocation::new(8, 2, 0x6F32),
    PciLocation::new(9, 2, 0x6F33),
    PciLocation::new(10, 2, 0x6F3A),
];

const HSX_HA: [PciLocation; 2] = [
    PciLocation::new(18, 1, 0x2F30),
    PciLocation::new(18, 5, 0x2F38),
];

const BDX_HA: [PciLocation; 2] = [
    PciLocation::new(18, 1, 0x6F30),
    PciLocation::new(18, 5, 0x6F38),
];

/// PCU box shared with Skylake-SP and Ice Lake-SP
pub(crate) const PCU_0X710: MsrBoxes = MsrBoxes {
    first: BoxLayout {
        unit_control: 0x710,
        counter_control: 0x711,
        control_stride: 1,
        counter_value: 0x717,
        value_stride: 1,
        counters: 4,
        fixed_control: None,
        fixed_value: None,
        filters: [Some(0x715), None],
    },
    units: MsrUnits::Strided {
        stride: 0,
        count: 1,
    },
};

/// CBo/CHA box 0 at 0xE00, shared with Skylake-SP
pub(crate) const CBO_0XE00: BoxLayout = BoxLayout {
    unit_control: 0xE00,
    counter_control: 0xE01,
    control_stride: 1,
    counter_value: 0xE08,
    value_stride: 1,
    counters: 4,
    fixed_control: None,
    fixed_value: None,
    filters: [Some(0xE05), Some(0xE06)],
};

/// DRd opcode in the CBo filter 1 opcode field (bits 20-28)
const CBO_FILTER1_OPC_DRD: u64 = 0x182 << 20;

pub(crate) const PCU_EVENTS: [Ev; 4] = [
    Ev::event(0x00, 0x00), // CLOCKTICKS
    Ev::event(0x04, 0x00), // FREQ_MAX_LIMIT_THERMAL_CYCLES
    Ev::event(0x05, 0x00), // FREQ_MAX_POWER_CYCLES
    Ev::event(0x0A, 0x00), // PROCHOT_EXTERNAL_CYCLES
];

pub fn descriptor(model: CpuModel) -> ArchDescriptor {
    let broadwell = model == CpuModel::BroadwellX;

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
        | Availability::SMI_COUNT
        | Availability::THERMAL_HEADROOM
        | Availability::HA_REQUESTS
        | Availability::UNCORE_CLOCKS
        | Availability::LLC_MISS_LATENCY;
    if broadwell {
        availability |= Availability::LOCAL_MEMORY_BW | Availability::REMOTE_MEMORY_BW;
    }

    ArchDescriptor {
        model,
        availability,
        core_events: CoreEventSet::Legacy,
        core_counters: 4,
        core_c_states: &[3, 6],
        package_c_states: &[2, 3, 6],
        unit_control: UnitControlLayout::Legacy,
        program_style: ProgramStyle::EnableFirst,
        mc: McLocation::Pci(PciBoxes {
            layout: LEGACY_PCI_BOX,
            locations: if broadwell { &BDX_MC } else { &HSX_MC },
        }),
        mc_events: [
            Ev::event(0x04, 0x03), // CAS_COUNT.RD
            Ev::event(0x04, 0x0C), // CAS_COUNT.WR
            Ev::event(0x00, 0x00),
            Ev::event(0x00, 0x00),
        ],
        edc: BoxLocation::Absent,
        edc_events: [Ev::event(0, 0); 2],
        xpi: BoxLocation::Pci(PciBoxes {
            layout: LEGACY_PCI_BOX,
            locations: if broadwell { &BDX_QPI } else { &HSX_QPI },
        }),
        xpi_events: [
            Ev::event(0x01, 0x02), // RxL_FLITS_G0.DATA
            Ev::event(0x00, 0x06), // TxL_FLITS_G0.DATA + NON_DATA
            Ev::event(0x14, 0x00), // CLOCKTICKS
            Ev::event(0x0D, 0x00), // TxL0P_POWER_CYCLES
        ],
        xpi_l1_event: Ev::event(0x12, 0x00),
        xpi_unit_extra: 1 << 17,
        xpi_bytes_per_flit: 8.0,
        xpi_link_speed: 19_200_000_000,
        ha: BoxLocation::Pci(PciBoxes {
            layout: LEGACY_PCI_BOX,
            locations: if broadwell { &BDX_HA } else { &HSX_HA },
        }),
        ha_events: [
            Ev::event(0x01, 0x0F), // REQUESTS.READS + WRITES
            Ev::event(0x01, 0x05), // REQUESTS.READS_LOCAL + WRITES_LOCAL
            Ev::event(0x00, 0x00),
            Ev::event(0x00, 0x00),
        ],
        pcu: BoxLocation::Msr(PCU_0X710),
        pcu_events: PCU_EVENTS,
        cha: BoxLocation::Msr(MsrBoxes {
            first: CBO_0XE00,
            units: MsrUnits::Strided {
                stride: 0x10,
                count: if broadwell { 24 } else { 18 },
            },
        }),
        cha_events: [
            Ev::event(0x36, 0x03), // TOR_OCCUPANCY.MISS_OPCODE
            Ev::event(0x35, 0x03), // TOR_INSERTS.MISS_OPCODE
            Ev::event(0x00, 0x00), // CLOCKTICKS
            Ev::event(0x34, 0x11), // LLC_LOOKUP.ANY
        ],
        cha_filters: [0, CBO_FILTER1_OPC_DRD],
        iio: BoxLocation::Absent,
        iio_events: [Ev::event(0, 0); 4],
        cxl_events: [Ev::event(0, 0); 2],
        bus_clock_hz: 100_000_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadwell_uses_its_own_device_ids() {
        let hsx = descriptor(CpuModel::HaswellX);
        let bdx = descriptor(CpuModel::BroadwellX);
        let ids = |d: &ArchDescriptor| match d.mc {
            McLocation::Pci(boxes) => boxes.locations[0].device_id,
            _ => 0,
        };
        assert_eq!(ids(&hsx), 0x2FB4);
        assert_eq!(ids(&bdx), 0x6FB4);
        assert_eq!(hsx.mc_channels(), 8);
        assert_eq!(hsx.xpi_links(), 3);
        assert!(bdx.is_available(Availability::LOCAL_MEMORY_BW));
        assert!(!hsx.is_available(Availability::LOCAL_MEMORY_BW));
    }

    #[test]
    fn test_qpi_flit_size() {
        let hsx = descriptor(CpuModel::HaswellX);
        assert_eq!(hsx.xpi_bytes_per_flit, 8.0);
    }
}
