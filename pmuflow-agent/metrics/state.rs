//! Counter snapshots
//!
//! A state is a plain copy of cumulative counter values taken at one
//! instant. Metrics are computed from two snapshots of the same kind; the
//! state itself never holds rates. Per-core states aggregate into socket and
//! system states with `+=`.

use std::ops::AddAssign;

use pmuflow_raw::arch::core::{CoreEventSet, MAX_C_STATE, MAX_PROGRAMMABLE_COUNTERS};
use pmuflow_raw::arch::slot;
use pmuflow_raw::Availability;
use serde::Serialize;

/// Thermal headroom was not readable
pub const INVALID_THERMAL_HEADROOM: i32 = i32::MIN;

/// Resource monitoring value was not readable
pub const INVALID_QOS_MONITORING_DATA: u64 = u64::MAX;

pub const C_STATE_SLOTS: usize = MAX_C_STATE + 1;

/// Anything carrying the availability of the machine it was captured on
pub trait CounterState {
    fn availability(&self) -> Availability;
}

pub trait HasBasic: CounterState {
    fn basic(&self) -> &BasicCounterState;
}

pub trait HasUncore: CounterState {
    fn uncore(&self) -> &UncoreCounterState;
}

fn add_qos(lhs: u64, rhs: u64) -> u64 {
    if lhs == INVALID_QOS_MONITORING_DATA || rhs == INVALID_QOS_MONITORING_DATA {
        INVALID_QOS_MONITORING_DATA
    } else {
        lhs.wrapping_add(rhs)
    }
}

/// Lowest valid headroom, the hottest core of the aggregate
fn min_headroom(lhs: i32, rhs: i32) -> i32 {
    match (lhs, rhs) {
        (INVALID_THERMAL_HEADROOM, h) | (h, INVALID_THERMAL_HEADROOM) => h,
        (l, r) => l.min(r),
    }
}

fn add_arrays<const N: usize>(lhs: &mut [u64; N], rhs: &[u64; N]) {
    for (l, r) in lhs.iter_mut().zip(rhs) {
        *l = l.wrapping_add(*r);
    }
}

/// Per-core counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasicCounterState {
    #[serde(skip)]
    pub availability: Availability,
    /// Meaning of `events[0..4]`; `None` when custom events are programmed
    #[serde(skip)]
    pub event_set: Option<CoreEventSet>,
    /// Programming generation the values belong to
    pub generation: u64,

    pub instructions_retired: u64,
    pub cpu_clk_unhalted_thread: u64,
    pub cpu_clk_unhalted_ref: u64,
    pub events: [u64; MAX_PROGRAMMABLE_COUNTERS],
    pub invariant_tsc: u64,
    pub core_c_state_residency: [u64; C_STATE_SLOTS],
    pub smi_count: u64,
    /// Degrees below TjMax; `+=` keeps the lowest valid value instead of
    /// summing
    pub thermal_headroom: i32,

    pub l3_occupancy: u64,
    pub mem_bw_local: u64,
    pub mem_bw_total: u64,

    pub frontend_bound_slots: u64,
    pub bad_speculation_slots: u64,
    pub backend_bound_slots: u64,
    pub retiring_slots: u64,
    pub all_slots: u64,
}

impl Default for BasicCounterState {
    fn default() -> Self {
        Self {
            availability: Availability::empty(),
            event_set: None,
            generation: 0,
            instructions_retired: 0,
            cpu_clk_unhalted_thread: 0,
            cpu_clk_unhalted_ref: 0,
            events: [0; MAX_PROGRAMMABLE_COUNTERS],
            invariant_tsc: 0,
            core_c_state_residency: [0; C_STATE_SLOTS],
            smi_count: 0,
            thermal_headroom: INVALID_THERMAL_HEADROOM,
            l3_occupancy: 0,
            mem_bw_local: 0,
            mem_bw_total: 0,
            frontend_bound_slots: 0,
            bad_speculation_slots: 0,
            backend_bound_slots: 0,
            retiring_slots: 0,
            all_slots: 0,
        }
    }
}

impl AddAssign<&BasicCounterState> for BasicCounterState {
    fn add_assign(&mut self, o: &BasicCounterState) {
        self.availability |= o.availability;
        if self.event_set.is_none() {
            self.event_set = o.event_set;
        }
        self.generation = self.generation.max(o.generation);

        self.instructions_retired = self.instructions_retired.wrapping_add(o.instructions_retired);
        self.cpu_clk_unhalted_thread = self
            .cpu_clk_unhalted_thread
            .wrapping_add(o.cpu_clk_unhalted_thread);
        self.cpu_clk_unhalted_ref = self.cpu_clk_unhalted_ref.wrapping_add(o.cpu_clk_unhalted_ref);
        add_arrays(&mut self.events, &o.events);
        self.invariant_tsc = self.invariant_tsc.wrapping_add(o.invariant_tsc);
        add_arrays(&mut self.core_c_state_residency, &o.core_c_state_residency);
        self.smi_count = self.smi_count.wrapping_add(o.smi_count);
        self.thermal_headroom = min_headroom(self.thermal_headroom, o.thermal_headroom);

        self.l3_occupancy = add_qos(self.l3_occupancy, o.l3_occupancy);
        self.mem_bw_local = add_qos(self.mem_bw_local, o.mem_bw_local);
        self.mem_bw_total = add_qos(self.mem_bw_total, o.mem_bw_total);

        self.frontend_bound_slots = self.frontend_bound_slots.wrapping_add(o.frontend_bound_slots);
        self.bad_speculation_slots = self
            .bad_speculation_slots
            .wrapping_add(o.bad_speculation_slots);
        self.backend_bound_slots = self.backend_bound_slots.wrapping_add(o.backend_bound_slots);
        self.retiring_slots = self.retiring_slots.wrapping_add(o.retiring_slots);
        self.all_slots = self.all_slots.wrapping_add(o.all_slots);
    }
}

impl AddAssign for BasicCounterState {
    fn add_assign(&mut self, o: BasicCounterState) {
        *self += &o;
    }
}

impl CounterState for BasicCounterState {
    fn availability(&self) -> Availability {
        self.availability
    }
}

impl HasBasic for BasicCounterState {
    fn basic(&self) -> &BasicCounterState {
        self
    }
}

/// Per-socket counters outside the cores
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UncoreCounterState {
    #[serde(skip)]
    pub availability: Availability,

    pub mc_normal_reads: u64,
    pub mc_full_writes: u64,
    pub pmm_reads: u64,
    pub pmm_writes: u64,
    pub edc_normal_reads: u64,
    pub edc_full_writes: u64,
    pub mc_io_requests: u64,

    pub ha_requests: u64,
    pub ha_local_requests: u64,
    pub nm_hits: u64,
    pub nm_misses: u64,

    /// Raw energy units, width extended
    pub package_energy_status: u64,
    pub dram_energy_status: u64,
    pub joules_per_energy_unit: f64,
    pub dram_joules_per_energy_unit: f64,

    pub uncore_clocks: u64,
    pub package_c_state_residency: [u64; C_STATE_SLOTS],
    /// TSC of the socket's reference core
    pub invariant_tsc: u64,
}

impl AddAssign<&UncoreCounterState> for UncoreCounterState {
    fn add_assign(&mut self, o: &UncoreCounterState) {
        self.availability |= o.availability;

        self.mc_normal_reads = self.mc_normal_reads.wrapping_add(o.mc_normal_reads);
        self.mc_full_writes = self.mc_full_writes.wrapping_add(o.mc_full_writes);
        self.pmm_reads = self.pmm_reads.wrapping_add(o.pmm_reads);
        self.pmm_writes = self.pmm_writes.wrapping_add(o.pmm_writes);
        self.edc_normal_reads = self.edc_normal_reads.wrapping_add(o.edc_normal_reads);
        self.edc_full_writes = self.edc_full_writes.wrapping_add(o.edc_full_writes);
        self.mc_io_requests = self.mc_io_requests.wrapping_add(o.mc_io_requests);

        self.ha_requests = self.ha_requests.wrapping_add(o.ha_requests);
        self.ha_local_requests = self.ha_local_requests.wrapping_add(o.ha_local_requests);
        self.nm_hits = self.nm_hits.wrapping_add(o.nm_hits);
        self.nm_misses = self.nm_misses.wrapping_add(o.nm_misses);

        self.package_energy_status = self
            .package_energy_status
            .wrapping_add(o.package_energy_status);
        self.dram_energy_status = self.dram_energy_status.wrapping_add(o.dram_energy_status);
        // Units are properties of the machine, not counters
        if self.joules_per_energy_unit == 0.0 {
            self.joules_per_energy_unit = o.joules_per_energy_unit;
        }
        if self.dram_joules_per_energy_unit == 0.0 {
            self.dram_joules_per_energy_unit = o.dram_joules_per_energy_unit;
        }

        self.uncore_clocks = self.uncore_clocks.wrapping_add(o.uncore_clocks);
        add_arrays(&mut self.package_c_state_residency, &o.package_c_state_residency);
        self.invariant_tsc = self.invariant_tsc.wrapping_add(o.invariant_tsc);
    }
}

impl AddAssign for UncoreCounterState {
    fn add_assign(&mut self, o: UncoreCounterState) {
        *self += &o;
    }
}

impl CounterState for UncoreCounterState {
    fn availability(&self) -> Availability {
        self.availability
    }
}

impl HasUncore for UncoreCounterState {
    fn uncore(&self) -> &UncoreCounterState {
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SocketCounterState {
    pub socket: u32,
    pub basic: BasicCounterState,
    pub uncore: UncoreCounterState,
}

impl AddAssign<&SocketCounterState> for SocketCounterState {
    fn add_assign(&mut self, o: &SocketCounterState) {
        self.basic += &o.basic;
        self.uncore += &o.uncore;
    }
}

impl AddAssign for SocketCounterState {
    fn add_assign(&mut self, o: SocketCounterState) {
        *self += &o;
    }
}

impl CounterState for SocketCounterState {
    fn availability(&self) -> Availability {
        self.basic.availability | self.uncore.availability
    }
}

impl HasBasic for SocketCounterState {
    fn basic(&self) -> &BasicCounterState {
        &self.basic
    }
}

impl HasUncore for SocketCounterState {
    fn uncore(&self) -> &UncoreCounterState {
        &self.uncore
    }
}

/// Whole-machine counters plus the inter-socket links
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemCounterState {
    pub basic: BasicCounterState,
    pub uncore: UncoreCounterState,

    /// `[socket][link]` data flits received
    pub incoming_xpi_flits: Vec<Vec<u64>>,
    /// `[socket][link]` flits sent
    pub outgoing_xpi_flits: Vec<Vec<u64>>,
    /// `[socket][link]` link clocks
    pub xpi_clocks: Vec<Vec<u64>>,
    /// `[socket][link]` low-power residency cycles (L0p or L1)
    pub xpi_power_cycles: Vec<Vec<u64>>,
    pub xpi_bytes_per_flit: f64,
    /// Bytes per second one link can carry
    pub xpi_link_speed: u64,
    pub nominal_frequency: u64,

    /// `[socket][port]` 64-byte writes to CXL memory
    pub cxl_write_mem: Vec<Vec<u64>>,
    /// `[socket][port]` 64-byte writes to CXL cache
    pub cxl_write_cache: Vec<Vec<u64>>,
}

impl SystemCounterState {
    /// Fold one socket into the system totals
    pub fn accumulate(&mut self, socket: &SocketCounterState) {
        self.basic += &socket.basic;
        self.uncore += &socket.uncore;
    }

    pub fn num_sockets(&self) -> usize {
        self.incoming_xpi_flits.len()
    }
}

impl CounterState for SystemCounterState {
    fn availability(&self) -> Availability {
        self.basic.availability | self.uncore.availability
    }
}

impl HasBasic for SystemCounterState {
    fn basic(&self) -> &BasicCounterState {
        &self.basic
    }
}

impl HasUncore for SystemCounterState {
    fn uncore(&self) -> &UncoreCounterState {
        &self.uncore
    }
}

/// Counters of one uncore unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitCounters {
    /// `false` when the unit does not exist or could not be programmed;
    /// such units are skipped by aggregation
    pub present: bool,
    pub counters: Vec<u64>,
    pub fixed: u64,
}

impl UnitCounters {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn counter(&self, index: usize) -> u64 {
        self.counters.get(index).copied().unwrap_or(0)
    }
}

/// Uncore unit families kept per socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Mc,
    Edc,
    M2m,
    Xpi,
    Iio,
    Cxl,
    Cha,
    Pcu,
    /// DSA/IAA accelerators
    Idx,
}

impl UnitKind {
    pub fn name(&self) -> &'static str {
        match self {
            UnitKind::Mc => "imc",
            UnitKind::Edc => "edc",
            UnitKind::M2m => "m2m",
            UnitKind::Xpi => "xpi",
            UnitKind::Iio => "iio",
            UnitKind::Cxl => "cxl",
            UnitKind::Cha => "cha",
            UnitKind::Pcu => "pcu",
            UnitKind::Idx => "idx",
        }
    }

    pub fn all() -> Vec<UnitKind> {
        vec![
            UnitKind::Mc,
            UnitKind::Edc,
            UnitKind::M2m,
            UnitKind::Xpi,
            UnitKind::Iio,
            UnitKind::Cxl,
            UnitKind::Cha,
            UnitKind::Pcu,
            UnitKind::Idx,
        ]
    }
}

/// Raw per-unit counters of one socket
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerUncoreCounterState {
    #[serde(skip)]
    pub availability: Availability,
    pub socket: u32,
    pub generation: u64,

    pub mc: Vec<UnitCounters>,
    pub edc: Vec<UnitCounters>,
    pub m2m: Vec<UnitCounters>,
    pub xpi: Vec<UnitCounters>,
    pub iio: Vec<UnitCounters>,
    pub cxl: Vec<UnitCounters>,
    pub cha: Vec<UnitCounters>,
    pub pcu: Vec<UnitCounters>,
    pub idx: Vec<UnitCounters>,

    pub package_energy_status: u64,
    pub dram_energy_status: u64,
    pub invariant_tsc: u64,
}

impl ServerUncoreCounterState {
    pub fn units(&self, kind: UnitKind) -> &[UnitCounters] {
        match kind {
            UnitKind::Mc => &self.mc,
            UnitKind::Edc => &self.edc,
            UnitKind::M2m => &self.m2m,
            UnitKind::Xpi => &self.xpi,
            UnitKind::Iio => &self.iio,
            UnitKind::Cxl => &self.cxl,
            UnitKind::Cha => &self.cha,
            UnitKind::Pcu => &self.pcu,
            UnitKind::Idx => &self.idx,
        }
    }

    pub fn units_mut(&mut self, kind: UnitKind) -> &mut Vec<UnitCounters> {
        match kind {
            UnitKind::Mc => &mut self.mc,
            UnitKind::Edc => &mut self.edc,
            UnitKind::M2m => &mut self.m2m,
            UnitKind::Xpi => &mut self.xpi,
            UnitKind::Iio => &mut self.iio,
            UnitKind::Cxl => &mut self.cxl,
            UnitKind::Cha => &mut self.cha,
            UnitKind::Pcu => &mut self.pcu,
            UnitKind::Idx => &mut self.idx,
        }
    }

    /// Sum of counter `index` over every present unit
    pub fn sum(units: &[UnitCounters], index: usize) -> u64 {
        units
            .iter()
            .filter(|u| u.present)
            .fold(0u64, |acc, u| acc.wrapping_add(u.counter(index)))
    }

    pub fn present(units: &[UnitCounters]) -> usize {
        units.iter().filter(|u| u.present).count()
    }

    /// Counter `index` of every unit of `kind`, zero for absent units
    pub fn per_unit(&self, kind: UnitKind, index: usize) -> Vec<u64> {
        self.units(kind)
            .iter()
            .map(|u| if u.present { u.counter(index) } else { 0 })
            .collect()
    }

    /// Socket totals of the box counters the aggregate metrics use
    pub fn fold_into(&self, uncore: &mut UncoreCounterState) {
        uncore.mc_normal_reads = Self::sum(&self.mc, slot::MC_READ);
        uncore.mc_full_writes = Self::sum(&self.mc, slot::MC_WRITE);
        if self.availability.contains(Availability::PMM_TRAFFIC) {
            uncore.pmm_reads = Self::sum(&self.mc, slot::MC_PMM_READ);
            uncore.pmm_writes = Self::sum(&self.mc, slot::MC_PMM_WRITE);
        }
        uncore.edc_normal_reads = Self::sum(&self.edc, slot::EDC_READ);
        uncore.edc_full_writes = Self::sum(&self.edc, slot::EDC_WRITE);

        if self.availability.contains(Availability::HA_REQUESTS) {
            uncore.ha_requests = Self::sum(&self.m2m, slot::HA_REQUESTS);
            uncore.ha_local_requests = Self::sum(&self.m2m, slot::HA_LOCAL_REQUESTS);
        }
        if self.availability.contains(Availability::NEAR_MEMORY) {
            uncore.nm_hits = Self::sum(&self.m2m, slot::HA_NM_HIT);
            uncore.nm_misses = Self::sum(&self.m2m, slot::HA_NM_MISS);
        }
        uncore.uncore_clocks = Self::sum(&self.pcu, slot::PCU_CLOCKS);
    }
}

impl CounterState for ServerUncoreCounterState {
    fn availability(&self) -> Availability {
        self.availability
    }
}
