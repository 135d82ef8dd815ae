//! Client (desktop/mobile) parts
//!
//! No programmable uncore PMUs are used; memory traffic comes from the three
//! free-running 32-bit counters in the MCHBAR window of the host bridge.

use super::core::CoreEventSet;
use super::uncore::{ProgramStyle, UncoreCounterControl as Ev, UnitControlLayout};
use super::{ArchDescriptor, Availability, BoxLocation, ClientImc, McLocation};
use crate::cpu::CpuModel;

const CLIENT_IMC: ClientImc = ClientImc {
    mchbar_offset: 0x48,
    mchbar_mask: 0x7F_FFFF_8000,
    window_offset: 0x5000,
    window_size: 0x1000,
    reads: 0x5050,
    writes: 0x5054,
    io_requests: 0x5058,
    counter_width: 32,
};

pub fn descriptor(model: CpuModel) -> ArchDescriptor {
    let mut availability = Availability::L2_CACHE
        | Availability::L3_CACHE
        | Availability::MEMORY_TRAFFIC
        | Availability::IO_REQUESTS
        | Availability::PACKAGE_ENERGY
        | Availability::DRAM_ENERGY
        | Availability::CORE_C_STATES
        | Availability::PACKAGE_C_STATES
        | Availability::SMI_COUNT
        | Availability::THERMAL_HEADROOM;
    if model == CpuModel::IceLakeClient {
        availability |= Availability::TOPDOWN;
    }

    ArchDescriptor {
        model,
        availability,
        core_events: CoreEventSet::Skylake,
        core_counters: 4,
        core_c_states: &[3, 6, 7],
        package_c_states: &[2, 3, 6, 7, 8, 9, 10],
        unit_control: UnitControlLayout::Legacy,
        program_style: ProgramStyle::EnableFirst,
        mc: McLocation::Client(CLIENT_IMC),
        mc_events: [Ev::event(0, 0); 4],
        edc: BoxLocation::Absent,
        edc_events: [Ev::event(0, 0); 2],
        xpi: BoxLocation::Absent,
        xpi_events: [Ev::event(0, 0); 4],
        xpi_l1_event: Ev::event(0, 0),
        xpi_unit_extra: 0,
        xpi_bytes_per_flit: 0.0,
        xpi_link_speed: 0,
        ha: BoxLocation::Absent,
        ha_events: [Ev::event(0, 0); 4],
        pcu: BoxLocation::Absent,
        pcu_events: [Ev::event(0, 0); 4],
        cha: BoxLocation::Absent,
        cha_events: [Ev::event(0, 0); 4],
        cha_filters: [0, 0],
        iio: BoxLocation::Absent,
        iio_events: [Ev::event(0, 0); 4],
        cxl_events: [Ev::event(0, 0); 2],
        bus_clock_hz: 100_000_000,
    }
}
