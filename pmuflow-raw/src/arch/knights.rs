//! Knights Landing / Knights Mill uncore locations
//!
//! Six DDR4 channels behind two memory controllers and eight MCDRAM
//! controllers (EDC), all PCI devices. There is no L3 and no QPI.
//!
//! ## References
//!
//! - Intel® Xeon Phi™ Processor Performance Monitoring Reference Manual, Volume 2: Events

use super::core::CoreEventSet;
use super::haswell::{PCU_0X710, PCU_EVENTS};
use super::uncore::{ProgramStyle, UncoreCounterControl as Ev, UnitControlLayout};
use super::{
    ArchDescriptor, Availability, BoxLayout, BoxLocation, McLocation, PciBoxes, PciLocation,
};
use crate::cpu::CpuModel;

const KNL_MC_BOX: BoxLayout = BoxLayout {
    unit_control: 0xB30,
    counter_control: 0xB20,
    control_stride: 4,
    counter_value: 0xB00,
    value_stride: 8,
    counters: 4,
    fixed_control: Some(0xB44),
    fixed_value: Some(0xB3C),
    filters: [None, None],
};

const KNL_EDC_BOX: BoxLayout = BoxLayout {
    unit_control: 0xA30,
    counter_control: 0xA20,
    control_stride: 4,
    counter_value: 0xA00,
    value_stride: 8,
    counters: 4,
    fixed_control: Some(0xA44),
    fixed_value: Some(0xA3C),
    filters: [None, None],
};

const KNL_MC: [PciLocation; 6] = [
    PciLocation::new(8, 2, 0x7841),
    PciLocation::new(8, 3, 0x7841),
    PciLocation::new(8, 4, 0x7841),
    PciLocation::new(9, 2, 0x7841),
    PciLocation::new(9, 3, 0x7841),
    PciLocation::new(9, 4, 0x7841),
];

const KNL_EDC: [PciLocation; 8] = [
    PciLocation::new(24, 2, 0x7833),
    PciLocation::new(25, 2, 0x7833),
    PciLocation::new(26, 2, 0x7833),
    PciLocation::new(27, 2, 0x7833),
    PciLocation::new(28, 2, 0x7833),
    PciLocation::new(29, 2, 0x7833),
    PciLocation::new(30, 2, 0x7833),
    PciLocation::new(31, 2, 0x7833),
];

pub fn descriptor(model: CpuModel) -> ArchDescriptor {
    ArchDescriptor {
        model,
        availability: Availability::MEMORY_TRAFFIC
            | Availability::EDC_TRAFFIC
            | Availability::PACKAGE_ENERGY
            | Availability::DRAM_ENERGY
            | Availability::CORE_C_STATES
            | Availability::PACKAGE_C_STATES
            | Availability::SMI_COUNT
            | Availability::THERMAL_HEADROOM
            | Availability::UNCORE_CLOCKS,
        core_events: CoreEventSet::Legacy,
        core_counters: 2,
        core_c_states: &[6],
        package_c_states: &[2, 3, 6],
        unit_control: UnitControlLayout::Legacy,
        program_style: ProgramStyle::EnableFirst,
        mc: McLocation::Pci(PciBoxes {
            layout: KNL_MC_BOX,
            locations: &KNL_MC,
        }),
        mc_events: [
            Ev::event(0x03, 0x01), // CAS_COUNT.RD
            Ev::event(0x03, 0x02), // CAS_COUNT.WR
            Ev::event(0x00, 0x00),
            Ev::event(0x00, 0x00),
        ],
        edc: BoxLocation::Pci(PciBoxes {
            layout: KNL_EDC_BOX,
            locations: &KNL_EDC,
        }),
        edc_events: [
            Ev::event(0x01, 0x01), // RPQ_INSERTS
            Ev::event(0x02, 0x01), // WPQ_INSERTS
        ],
        xpi: BoxLocation::Absent,
        xpi_events: [Ev::event(0, 0); 4],
        xpi_l1_event: Ev::event(0, 0),
        xpi_unit_extra: 0,
        xpi_bytes_per_flit: 0.0,
        xpi_link_speed: 0,
        ha: BoxLocation::Absent,
        ha_events: [Ev::event(0, 0); 4],
        pcu: BoxLocation::Msr(PCU_0X710),
        pcu_events: PCU_EVENTS,
        cha: BoxLocation::Absent,
        cha_events: [Ev::event(0, 0); 4],
        cha_filters: [0, 0],
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
    fn test_no_l3_metrics() {
        let knl = descriptor(CpuModel::KnightsLanding);
        assert!(!knl.is_available(Availability::L3_CACHE));
        assert!(knl.is_available(Availability::EDC_TRAFFIC));
        assert_eq!(knl.mc_channels(), 6);
        assert_eq!(knl.xpi_links(), 0);
    }
}
