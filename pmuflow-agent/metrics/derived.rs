//! Metrics derived from two snapshots
//!
//! Every function takes `(before, after)` of the same state kind. Metrics
//! that do not exist on the machine return a sentinel (0, -1,
//! [`INVALID_THERMAL_HEADROOM`] or [`INVALID_QOS_MONITORING_DATA`]) and
//! never fail. Signed ratios with a zero denominator are -1; residencies and
//! utilizations are clamped to `0.0..=1.0`.

use pmuflow_raw::arch::core::{CoreEventSet, MAX_C_STATE};
use pmuflow_raw::arch::slot;
use pmuflow_raw::Availability;

use super::state::{
    CounterState, HasBasic, HasUncore, ServerUncoreCounterState, SystemCounterState,
    UncoreCounterState, UnitKind, INVALID_QOS_MONITORING_DATA, INVALID_THERMAL_HEADROOM,
};

const CACHE_LINE_BYTES: u64 = 64;
/// IIO data counters count 4-byte units
const IIO_UNIT_BYTES: u64 = 4;

/// Approximate core cycles stalled per L3 miss
const L3_MISS_PENALTY_CYCLES: f64 = 180.0;
/// Approximate cycles per L3 hit without and with cross-core snoop
const L3_UNSHARED_HIT_PENALTY_CYCLES: f64 = 35.0;
const L2_HITM_PENALTY_CYCLES: f64 = 75.0;

/// `after - before`, or 0 if the counter went backwards
pub fn get_number_of_events(before: u64, after: u64) -> u64 {
    if after < before {
        tracing::debug!(
            "Counter decreased from {} to {}, reporting 0 events",
            before,
            after
        );
        0
    } else {
        after - before
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        -1.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn clamp_fraction(value: f64, what: &str) -> f64 {
    let clamped = value.clamp(0.0, 1.0);
    if clamped != value {
        tracing::debug!("{} of {:.4} clamped to {:.1}", what, value, clamped);
    }
    clamped
}

fn available<S: CounterState>(state: &S, what: Availability) -> bool {
    state.availability().contains(what)
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

pub fn get_instructions_retired<S: HasBasic>(before: &S, after: &S) -> u64 {
    get_number_of_events(
        before.basic().instructions_retired,
        after.basic().instructions_retired,
    )
}

/// Core cycles while not halted, at the current frequency
pub fn get_cycles<S: HasBasic>(before: &S, after: &S) -> u64 {
    get_number_of_events(
        before.basic().cpu_clk_unhalted_thread,
        after.basic().cpu_clk_unhalted_thread,
    )
}

/// Unhalted cycles at the nominal (TSC) frequency
pub fn get_ref_cycles<S: HasBasic>(before: &S, after: &S) -> u64 {
    get_number_of_events(
        before.basic().cpu_clk_unhalted_ref,
        after.basic().cpu_clk_unhalted_ref,
    )
}

pub fn get_invariant_tsc<S: HasBasic>(before: &S, after: &S) -> u64 {
    get_number_of_events(before.basic().invariant_tsc, after.basic().invariant_tsc)
}

/// Instructions per core cycle; -1 when no cycle elapsed
pub fn get_ipc<S: HasBasic>(before: &S, after: &S) -> f64 {
    ratio(get_instructions_retired(before, after), get_cycles(before, after))
}

/// Instructions per TSC tick
pub fn get_exec_usage<S: HasBasic>(before: &S, after: &S) -> f64 {
    ratio(
        get_instructions_retired(before, after),
        get_invariant_tsc(before, after),
    )
}

/// Core frequency relative to nominal over the whole interval
pub fn get_relative_frequency<S: HasBasic>(before: &S, after: &S) -> f64 {
    ratio(get_cycles(before, after), get_invariant_tsc(before, after))
}

/// Core frequency relative to nominal while not halted
pub fn get_active_relative_frequency<S: HasBasic>(before: &S, after: &S) -> f64 {
    ratio(get_cycles(before, after), get_ref_cycles(before, after))
}

/// Average frequency in Hz
pub fn get_average_frequency<S: HasBasic>(before: &S, after: &S, nominal_hz: u64) -> f64 {
    let relative = get_relative_frequency(before, after);
    if relative < 0.0 {
        return -1.0;
    }
    relative * nominal_hz as f64
}

pub fn get_active_average_frequency<S: HasBasic>(before: &S, after: &S, nominal_hz: u64) -> f64 {
    let relative = get_active_relative_frequency(before, after);
    if relative < 0.0 {
        return -1.0;
    }
    relative * nominal_hz as f64
}

fn event_delta<S: HasBasic>(before: &S, after: &S, index: usize) -> u64 {
    match (before.basic().events.get(index), after.basic().events.get(index)) {
        (Some(&b), Some(&a)) => get_number_of_events(b, a),
        _ => 0,
    }
}

/// Delta of programmable counter `index`
pub fn get_number_of_custom_events<S: HasBasic>(index: usize, before: &S, after: &S) -> u64 {
    event_delta(before, after, index)
}

fn event_set<S: HasBasic>(state: &S) -> Option<CoreEventSet> {
    state.basic().event_set
}

pub fn get_l3_cache_misses<S: HasBasic>(before: &S, after: &S) -> u64 {
    if !available(after, Availability::L3_CACHE) || event_set(after).is_none() {
        return 0;
    }
    event_delta(before, after, 0)
}

pub fn get_l3_cache_hits<S: HasBasic>(before: &S, after: &S) -> u64 {
    if !available(after, Availability::L3_CACHE) {
        return 0;
    }
    match event_set(after) {
        Some(CoreEventSet::Legacy) => {
            event_delta(before, after, 1) + event_delta(before, after, 2)
        }
        Some(CoreEventSet::Skylake) => event_delta(before, after, 1),
        None => 0,
    }
}

/// L3 hits that needed no snoop of another core (pre-Skylake only)
pub fn get_l3_cache_hits_no_snoop<S: HasBasic>(before: &S, after: &S) -> u64 {
    match event_set(after) {
        Some(CoreEventSet::Legacy) if available(after, Availability::L3_CACHE) => {
            event_delta(before, after, 1)
        }
        _ => 0,
    }
}

/// L3 hits modified in another core (pre-Skylake only)
pub fn get_l3_cache_hits_snoop<S: HasBasic>(before: &S, after: &S) -> u64 {
    match event_set(after) {
        Some(CoreEventSet::Legacy) if available(after, Availability::L3_CACHE) => {
            event_delta(before, after, 2)
        }
        _ => 0,
    }
}

pub fn get_l3_cache_hit_ratio<S: HasBasic>(before: &S, after: &S) -> f64 {
    if !available(after, Availability::L3_CACHE) || event_set(after).is_none() {
        return -1.0;
    }
    let hits = get_l3_cache_hits(before, after);
    ratio(hits, hits + get_l3_cache_misses(before, after))
}

pub fn get_l2_cache_hits<S: HasBasic>(before: &S, after: &S) -> u64 {
    if !available(after, Availability::L2_CACHE) || event_set(after).is_none() {
        return 0;
    }
    event_delta(before, after, 3)
}

pub fn get_l2_cache_misses<S: HasBasic>(before: &S, after: &S) -> u64 {
    if !available(after, Availability::L2_CACHE) {
        return 0;
    }
    match event_set(after) {
        // Every L2 miss is either an L3 hit or an L3 miss
        Some(CoreEventSet::Legacy) => {
            get_l3_cache_hits(before, after) + get_l3_cache_misses(before, after)
        }
        Some(CoreEventSet::Skylake) => event_delta(before, after, 2),
        None => 0,
    }
}

pub fn get_l2_cache_hit_ratio<S: HasBasic>(before: &S, after: &S) -> f64 {
    if !available(after, Availability::L2_CACHE) || event_set(after).is_none() {
        return -1.0;
    }
    let hits = get_l2_cache_hits(before, after);
    ratio(hits, hits + get_l2_cache_misses(before, after))
}

/// Estimated fraction of cycles stalled on L3 misses
pub fn get_cycles_lost_due_l3_cache_misses<S: HasBasic>(before: &S, after: &S) -> f64 {
    let cycles = get_cycles(before, after);
    if cycles == 0 || !available(after, Availability::L3_CACHE) || event_set(after).is_none() {
        return -1.0;
    }
    L3_MISS_PENALTY_CYCLES * get_l3_cache_misses(before, after) as f64 / cycles as f64
}

/// Estimated fraction of cycles stalled on L2 misses served by L3
///
/// Only the pre-Skylake event set splits L3 hits by snoop outcome.
pub fn get_cycles_lost_due_l2_cache_misses<S: HasBasic>(before: &S, after: &S) -> f64 {
    let cycles = get_cycles(before, after);
    if cycles == 0 || event_set(after) != Some(CoreEventSet::Legacy) {
        return -1.0;
    }
    let unshared = get_l3_cache_hits_no_snoop(before, after) as f64;
    let hitm = get_l3_cache_hits_snoop(before, after) as f64;
    (L3_UNSHARED_HIT_PENALTY_CYCLES * unshared + L2_HITM_PENALTY_CYCLES * hitm) / cycles as f64
}

/// Fraction of time in core C-state `state`
///
/// C0 comes from the reference cycle counter and C1 is whatever the other
/// states leave over.
pub fn get_core_c_state_residency<S: HasBasic>(state: usize, before: &S, after: &S) -> f64 {
    if state > MAX_C_STATE || !available(after, Availability::CORE_C_STATES) {
        return 0.0;
    }
    let tsc = get_invariant_tsc(before, after);
    if tsc == 0 {
        return 0.0;
    }
    let tsc = tsc as f64;
    let residency = |s: usize| {
        get_number_of_events(
            before.basic().core_c_state_residency[s],
            after.basic().core_c_state_residency[s],
        ) as f64
            / tsc
    };

    let c0 = get_ref_cycles(before, after) as f64 / tsc;
    let value = match state {
        0 => c0,
        1 => {
            let others: f64 = (2..=MAX_C_STATE).map(residency).sum();
            1.0 - c0 - others
        }
        s => residency(s),
    };
    clamp_fraction(value, "Core C-state residency")
}

/// Fraction of time in package C-state `state`; C0 is the remainder
pub fn get_package_c_state_residency<S: HasUncore>(state: usize, before: &S, after: &S) -> f64 {
    if state > MAX_C_STATE || !available(after, Availability::PACKAGE_C_STATES) {
        return 0.0;
    }
    let tsc = get_number_of_events(before.uncore().invariant_tsc, after.uncore().invariant_tsc);
    if tsc == 0 {
        return 0.0;
    }
    let tsc = tsc as f64;
    let residency = |s: usize| {
        get_number_of_events(
            before.uncore().package_c_state_residency[s],
            after.uncore().package_c_state_residency[s],
        ) as f64
            / tsc
    };

    let value = match state {
        0 => 1.0 - (1..=MAX_C_STATE).map(residency).sum::<f64>(),
        s => residency(s),
    };
    clamp_fraction(value, "Package C-state residency")
}

pub fn get_smi_count<S: HasBasic>(before: &S, after: &S) -> u64 {
    if !available(after, Availability::SMI_COUNT) {
        return 0;
    }
    get_number_of_events(before.basic().smi_count, after.basic().smi_count)
}

/// Instantaneous reading, taken from a single snapshot
pub fn get_thermal_headroom<S: HasBasic>(state: &S) -> i32 {
    if !available(state, Availability::THERMAL_HEADROOM) {
        return INVALID_THERMAL_HEADROOM;
    }
    state.basic().thermal_headroom
}

/// L3 occupancy in KiB from a single snapshot
pub fn get_l3_cache_occupancy<S: HasBasic>(state: &S) -> u64 {
    let occupancy = state.basic().l3_occupancy;
    if !available(state, Availability::L3_OCCUPANCY) || occupancy == INVALID_QOS_MONITORING_DATA {
        return INVALID_QOS_MONITORING_DATA;
    }
    occupancy / 1024
}

fn qos_delta(before: u64, after: u64) -> u64 {
    if before == INVALID_QOS_MONITORING_DATA || after == INVALID_QOS_MONITORING_DATA {
        return 0;
    }
    get_number_of_events(before, after)
}

/// Bytes the core pulled from its local memory controller
pub fn get_local_memory_bw<S: HasBasic>(before: &S, after: &S) -> u64 {
    if !available(after, Availability::LOCAL_MEMORY_BW) {
        return 0;
    }
    qos_delta(before.basic().mem_bw_local, after.basic().mem_bw_local)
}

/// Bytes the core pulled from other sockets
pub fn get_remote_memory_bw<S: HasBasic>(before: &S, after: &S) -> u64 {
    if !available(after, Availability::REMOTE_MEMORY_BW) {
        return 0;
    }
    let total = qos_delta(before.basic().mem_bw_total, after.basic().mem_bw_total);
    let local = qos_delta(before.basic().mem_bw_local, after.basic().mem_bw_local);
    total.saturating_sub(local)
}

fn topdown_fraction<S: HasBasic>(before: &S, after: &S, pick: fn(&S) -> u64) -> f64 {
    if !available(after, Availability::TOPDOWN) {
        return 0.0;
    }
    let (b, a) = (pick(before), pick(after));
    debug_assert!(a >= b, "topdown slots went backwards: {b} -> {a}");
    let slots = get_number_of_events(before.basic().all_slots, after.basic().all_slots);
    if slots == 0 {
        return 0.0;
    }
    get_number_of_events(b, a) as f64 / slots as f64
}

pub fn get_frontend_bound<S: HasBasic>(before: &S, after: &S) -> f64 {
    topdown_fraction(before, after, |s| s.basic().frontend_bound_slots)
}

pub fn get_bad_speculation<S: HasBasic>(before: &S, after: &S) -> f64 {
    topdown_fraction(before, after, |s| s.basic().bad_speculation_slots)
}

pub fn get_backend_bound<S: HasBasic>(before: &S, after: &S) -> f64 {
    topdown_fraction(before, after, |s| s.basic().backend_bound_slots)
}

pub fn get_retiring<S: HasBasic>(before: &S, after: &S) -> f64 {
    topdown_fraction(before, after, |s| s.basic().retiring_slots)
}

pub fn get_all_slots<S: HasBasic>(before: &S, after: &S) -> u64 {
    if !available(after, Availability::TOPDOWN) {
        return 0;
    }
    get_number_of_events(before.basic().all_slots, after.basic().all_slots)
}

// ---------------------------------------------------------------------------
// Uncore
// ---------------------------------------------------------------------------

fn uncore_delta<S: HasUncore>(
    before: &S,
    after: &S,
    what: Availability,
    pick: fn(&UncoreCounterState) -> u64,
) -> u64 {
    if !available(after, what) {
        return 0;
    }
    get_number_of_events(pick(before.uncore()), pick(after.uncore()))
}

pub fn get_bytes_read_from_mc<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::MEMORY_TRAFFIC, |u| u.mc_normal_reads)
        .saturating_mul(CACHE_LINE_BYTES)
}

pub fn get_bytes_written_to_mc<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::MEMORY_TRAFFIC, |u| u.mc_full_writes)
        .saturating_mul(CACHE_LINE_BYTES)
}

pub fn get_bytes_read_from_pmm<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::PMM_TRAFFIC, |u| u.pmm_reads)
        .saturating_mul(CACHE_LINE_BYTES)
}

pub fn get_bytes_written_to_pmm<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::PMM_TRAFFIC, |u| u.pmm_writes)
        .saturating_mul(CACHE_LINE_BYTES)
}

pub fn get_bytes_read_from_edc<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::EDC_TRAFFIC, |u| u.edc_normal_reads)
        .saturating_mul(CACHE_LINE_BYTES)
}

pub fn get_bytes_written_to_edc<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::EDC_TRAFFIC, |u| u.edc_full_writes)
        .saturating_mul(CACHE_LINE_BYTES)
}

/// Bytes requested by I/O agents from the memory controller
pub fn get_io_request_bytes_from_mc<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::IO_REQUESTS, |u| u.mc_io_requests)
        .saturating_mul(CACHE_LINE_BYTES)
}

/// Package energy in raw RAPL units
pub fn get_consumed_energy<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::PACKAGE_ENERGY, |u| {
        u.package_energy_status
    })
}

pub fn get_dram_consumed_energy<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::DRAM_ENERGY, |u| u.dram_energy_status)
}

pub fn get_consumed_joules<S: HasUncore>(before: &S, after: &S) -> f64 {
    get_consumed_energy(before, after) as f64 * after.uncore().joules_per_energy_unit
}

pub fn get_dram_consumed_joules<S: HasUncore>(before: &S, after: &S) -> f64 {
    get_dram_consumed_energy(before, after) as f64 * after.uncore().dram_joules_per_energy_unit
}

pub fn get_uncore_clocks<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::UNCORE_CLOCKS, |u| u.uncore_clocks)
}

/// Share of home agent requests that came from the local socket
pub fn get_local_memory_request_ratio<S: HasUncore>(before: &S, after: &S) -> f64 {
    if !available(after, Availability::HA_REQUESTS) {
        return -1.0;
    }
    ratio(
        uncore_delta(before, after, Availability::HA_REQUESTS, |u| u.ha_local_requests),
        uncore_delta(before, after, Availability::HA_REQUESTS, |u| u.ha_requests),
    )
}

pub fn get_nm_hits<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::NEAR_MEMORY, |u| u.nm_hits)
}

pub fn get_nm_misses<S: HasUncore>(before: &S, after: &S) -> u64 {
    uncore_delta(before, after, Availability::NEAR_MEMORY, |u| u.nm_misses)
}

/// Near-memory (DRAM cache in front of PMM) hit rate
pub fn get_nm_hit_rate<S: HasUncore>(before: &S, after: &S) -> f64 {
    if !available(after, Availability::NEAR_MEMORY) {
        return -1.0;
    }
    let hits = get_nm_hits(before, after);
    ratio(hits, hits + get_nm_misses(before, after))
}

/// Bytes moved because of near-memory misses
pub fn get_nm_miss_bw<S: HasUncore>(before: &S, after: &S) -> u64 {
    get_nm_misses(before, after).saturating_mul(CACHE_LINE_BYTES)
}

// ---------------------------------------------------------------------------
// System links
// ---------------------------------------------------------------------------

fn link_delta(before: &[Vec<u64>], after: &[Vec<u64>], socket: usize, link: usize) -> u64 {
    let b = before.get(socket).and_then(|s| s.get(link)).copied();
    let a = after.get(socket).and_then(|s| s.get(link)).copied();
    match (b, a) {
        (Some(b), Some(a)) => get_number_of_events(b, a),
        _ => 0,
    }
}

fn flits_to_bytes(flits: u64, bytes_per_flit: f64) -> u64 {
    (flits as f64 * bytes_per_flit) as u64
}

pub fn get_incoming_xpi_link_bytes(
    socket: usize,
    link: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    if !available(after, Availability::INCOMING_XPI) {
        return 0;
    }
    let flits = link_delta(&before.incoming_xpi_flits, &after.incoming_xpi_flits, socket, link);
    flits_to_bytes(flits, after.xpi_bytes_per_flit)
}

pub fn get_outgoing_xpi_link_bytes(
    socket: usize,
    link: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    if !available(after, Availability::OUTGOING_XPI) {
        return 0;
    }
    let flits = link_delta(&before.outgoing_xpi_flits, &after.outgoing_xpi_flits, socket, link);
    flits_to_bytes(flits, after.xpi_bytes_per_flit)
}

/// Wall time of the interval in seconds, from the per-socket TSC sum
fn elapsed_seconds(before: &SystemCounterState, after: &SystemCounterState) -> f64 {
    let sockets = after.num_sockets().max(1) as f64;
    let tsc = get_number_of_events(before.uncore.invariant_tsc, after.uncore.invariant_tsc);
    if after.nominal_frequency == 0 {
        return 0.0;
    }
    tsc as f64 / sockets / after.nominal_frequency as f64
}

fn link_utilization(bytes: u64, before: &SystemCounterState, after: &SystemCounterState) -> f64 {
    let max_bytes = after.xpi_link_speed as f64 * elapsed_seconds(before, after);
    if max_bytes <= 0.0 {
        return -1.0;
    }
    // Link and TSC counters are not read at the same instant
    clamp_fraction(bytes as f64 / max_bytes, "xPI link utilization")
}

pub fn get_incoming_xpi_link_utilization(
    socket: usize,
    link: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> f64 {
    if !available(after, Availability::INCOMING_XPI) {
        return -1.0;
    }
    link_utilization(
        get_incoming_xpi_link_bytes(socket, link, before, after),
        before,
        after,
    )
}

pub fn get_outgoing_xpi_link_utilization(
    socket: usize,
    link: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> f64 {
    if !available(after, Availability::OUTGOING_XPI) {
        return -1.0;
    }
    link_utilization(
        get_outgoing_xpi_link_bytes(socket, link, before, after),
        before,
        after,
    )
}

fn all_links(
    before: &SystemCounterState,
    after: &SystemCounterState,
    per_link: fn(usize, usize, &SystemCounterState, &SystemCounterState) -> u64,
    grid: &[Vec<u64>],
) -> u64 {
    grid.iter()
        .enumerate()
        .flat_map(|(socket, links)| (0..links.len()).map(move |link| (socket, link)))
        .map(|(socket, link)| per_link(socket, link, before, after))
        .sum()
}

pub fn get_all_incoming_xpi_link_bytes(
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    all_links(before, after, get_incoming_xpi_link_bytes, &after.incoming_xpi_flits)
}

pub fn get_all_outgoing_xpi_link_bytes(
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    all_links(before, after, get_outgoing_xpi_link_bytes, &after.outgoing_xpi_flits)
}

/// Inter-socket traffic relative to memory controller traffic
pub fn get_xpi_to_mc_traffic_ratio(before: &SystemCounterState, after: &SystemCounterState) -> f64 {
    if !available(after, Availability::INCOMING_XPI) {
        return -1.0;
    }
    let mc = get_bytes_read_from_mc(before, after) + get_bytes_written_to_mc(before, after);
    ratio(get_all_incoming_xpi_link_bytes(before, after), mc)
}

pub fn get_xpi_clocks(
    socket: usize,
    link: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    link_delta(&before.xpi_clocks, &after.xpi_clocks, socket, link)
}

/// Cycles the link spent in its low-power state (L0p or L1, whichever was
/// programmed)
pub fn get_xpi_power_cycles(
    socket: usize,
    link: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    link_delta(&before.xpi_power_cycles, &after.xpi_power_cycles, socket, link)
}

pub fn get_normalized_xpi_power_cycles(
    socket: usize,
    link: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> f64 {
    let clocks = get_xpi_clocks(socket, link, before, after);
    if clocks == 0 {
        return -1.0;
    }
    clamp_fraction(
        get_xpi_power_cycles(socket, link, before, after) as f64 / clocks as f64,
        "xPI power state residency",
    )
}

pub fn get_cxl_write_mem_bytes(
    socket: usize,
    port: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    if !available(after, Availability::CXL_TRAFFIC) {
        return 0;
    }
    link_delta(&before.cxl_write_mem, &after.cxl_write_mem, socket, port)
        .saturating_mul(CACHE_LINE_BYTES)
}

pub fn get_cxl_write_cache_bytes(
    socket: usize,
    port: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    if !available(after, Availability::CXL_TRAFFIC) {
        return 0;
    }
    link_delta(&before.cxl_write_cache, &after.cxl_write_cache, socket, port)
        .saturating_mul(CACHE_LINE_BYTES)
}

// ---------------------------------------------------------------------------
// Per-unit server uncore counters
// ---------------------------------------------------------------------------

fn unit_delta(
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
    kind: UnitKind,
    unit: usize,
    counter: usize,
) -> u64 {
    if before.generation != after.generation {
        tracing::debug!(
            "Socket {} was reprogrammed between snapshots ({} -> {})",
            after.socket,
            before.generation,
            after.generation
        );
        return 0;
    }
    match (before.units(kind).get(unit), after.units(kind).get(unit)) {
        (Some(b), Some(a)) if b.present && a.present => {
            get_number_of_events(b.counter(counter), a.counter(counter))
        }
        _ => 0,
    }
}

fn units_sum(
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
    kind: UnitKind,
    counter: usize,
) -> u64 {
    (0..after.units(kind).len())
        .map(|unit| unit_delta(before, after, kind, unit, counter))
        .sum()
}

pub fn get_mc_counter(
    channel: usize,
    counter: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    unit_delta(before, after, UnitKind::Mc, channel, counter)
}

pub fn get_edc_counter(
    channel: usize,
    counter: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    unit_delta(before, after, UnitKind::Edc, channel, counter)
}

pub fn get_m2m_counter(
    controller: usize,
    counter: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    unit_delta(before, after, UnitKind::M2m, controller, counter)
}

pub fn get_xpi_counter(
    port: usize,
    counter: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    unit_delta(before, after, UnitKind::Xpi, port, counter)
}

pub fn get_iio_counter(
    stack: usize,
    counter: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    unit_delta(before, after, UnitKind::Iio, stack, counter)
}

pub fn get_cxl_counter(
    port: usize,
    counter: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    unit_delta(before, after, UnitKind::Cxl, port, counter)
}

pub fn get_cha_counter(
    cha: usize,
    counter: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    unit_delta(before, after, UnitKind::Cha, cha, counter)
}

pub fn get_pcu_counter(
    counter: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    unit_delta(before, after, UnitKind::Pcu, 0, counter)
}

/// DRAM clocks of one channel from its fixed counter
pub fn get_dram_clocks(
    channel: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    if before.generation != after.generation {
        return 0;
    }
    match (before.mc.get(channel), after.mc.get(channel)) {
        (Some(b), Some(a)) if b.present && a.present => get_number_of_events(b.fixed, a.fixed),
        _ => 0,
    }
}

pub fn get_mc_channel_read_bytes(
    channel: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    if !available(after, Availability::MEMORY_TRAFFIC) {
        return 0;
    }
    get_mc_counter(channel, slot::MC_READ, before, after).saturating_mul(CACHE_LINE_BYTES)
}

pub fn get_mc_channel_write_bytes(
    channel: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    if !available(after, Availability::MEMORY_TRAFFIC) {
        return 0;
    }
    get_mc_counter(channel, slot::MC_WRITE, before, after).saturating_mul(CACHE_LINE_BYTES)
}

/// Bytes moved by one IIO stack for the given direction slot
pub fn get_iio_stack_bytes(
    stack: usize,
    direction: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    if !available(after, Availability::IIO_TRAFFIC) {
        return 0;
    }
    get_iio_counter(stack, direction, before, after).saturating_mul(IIO_UNIT_BYTES)
}

pub fn get_pcu_clocks(before: &ServerUncoreCounterState, after: &ServerUncoreCounterState) -> u64 {
    get_pcu_counter(slot::PCU_CLOCKS, before, after)
}

fn pcu_ratio(
    counter: usize,
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> f64 {
    let clocks = get_pcu_clocks(before, after);
    if clocks == 0 {
        return -1.0;
    }
    clamp_fraction(
        get_pcu_counter(counter, before, after) as f64 / clocks as f64,
        "PCU residency",
    )
}

/// Share of PCU clocks with frequency capped by temperature
pub fn get_thermal_limit_ratio(
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> f64 {
    pcu_ratio(slot::PCU_THERMAL_LIMIT, before, after)
}

pub fn get_power_limit_ratio(
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> f64 {
    pcu_ratio(slot::PCU_POWER_LIMIT, before, after)
}

pub fn get_prochot_ratio(
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> f64 {
    pcu_ratio(slot::PCU_PROCHOT, before, after)
}

/// Average uncore (CHA) frequency in Hz
pub fn get_uncore_frequency(
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
    nominal_hz: u64,
) -> f64 {
    let chas = ServerUncoreCounterState::present(&after.cha);
    let tsc = get_number_of_events(before.invariant_tsc, after.invariant_tsc);
    if chas == 0 || tsc == 0 || nominal_hz == 0 {
        return -1.0;
    }
    let clocks = units_sum(before, after, UnitKind::Cha, slot::CHA_CLOCKS) as f64 / chas as f64;
    let seconds = tsc as f64 / nominal_hz as f64;
    clocks / seconds
}

/// Average latency of demand reads missing the LLC, in nanoseconds
pub fn get_llc_read_miss_latency(
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
    nominal_hz: u64,
) -> f64 {
    if !available(after, Availability::LLC_MISS_LATENCY) {
        return -1.0;
    }
    let occupancy = units_sum(before, after, UnitKind::Cha, slot::CHA_TOR_OCCUPANCY);
    let inserts = units_sum(before, after, UnitKind::Cha, slot::CHA_TOR_INSERTS);
    let frequency = get_uncore_frequency(before, after, nominal_hz);
    if inserts == 0 || frequency <= 0.0 {
        return -1.0;
    }
    1e9 * (occupancy as f64 / inserts as f64) / frequency
}

/// Package energy of the socket in raw RAPL units
pub fn get_socket_energy(
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    if !available(after, Availability::PACKAGE_ENERGY) {
        return 0;
    }
    get_number_of_events(before.package_energy_status, after.package_energy_status)
}

pub fn get_socket_dram_energy(
    before: &ServerUncoreCounterState,
    after: &ServerUncoreCounterState,
) -> u64 {
    if !available(after, Availability::DRAM_ENERGY) {
        return 0;
    }
    get_number_of_events(before.dram_energy_status, after.dram_energy_status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::state::{BasicCounterState, SocketCounterState, UnitCounters};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn core(instructions: u64, cycles: u64, tsc: u64) -> BasicCounterState {
        BasicCounterState {
            availability: Availability::all(),
            event_set: Some(CoreEventSet::Skylake),
            instructions_retired: instructions,
            cpu_clk_unhalted_thread: cycles,
            cpu_clk_unhalted_ref: cycles,
            invariant_tsc: tsc,
            ..Default::default()
        }
    }

    #[test]
    fn test_ipc_zero_cycles_is_minus_one() {
        let before = core(100, 50, 0);
        let after = core(200, 50, 10);
        assert_eq!(get_ipc(&before, &after), -1.0);
    }

    #[test]
    fn test_ipc() {
        let before = core(100, 50, 0);
        let after = core(500, 250, 1000);
        assert!(approx(get_ipc(&before, &after), 2.0));
    }

    #[test]
    fn test_number_of_events_clamps() {
        assert_eq!(get_number_of_events(10, 4), 0);
        assert_eq!(get_number_of_events(4, 10), 6);
    }

    #[test]
    fn test_diffs_are_additive() {
        let a = core(100, 1_000, 10_000);
        let b = core(350, 1_900, 20_000);
        let c = core(900, 2_500, 35_000);
        assert_eq!(
            get_instructions_retired(&a, &c),
            get_instructions_retired(&a, &b) + get_instructions_retired(&b, &c)
        );
        assert_eq!(
            get_cycles(&a, &c),
            get_cycles(&a, &b) + get_cycles(&b, &c)
        );
    }

    #[test]
    fn test_aggregation_identity() {
        let before = [core(10, 100, 1_000), core(20, 300, 1_000)];
        let after = [core(60, 400, 2_000), core(120, 500, 2_100)];

        let mut total_before = BasicCounterState::default();
        let mut total_after = BasicCounterState::default();
        for (b, a) in before.iter().zip(&after) {
            total_before += b;
            total_after += a;
        }

        let summed: u64 = before
            .iter()
            .zip(&after)
            .map(|(b, a)| get_instructions_retired(b, a))
            .sum();
        assert_eq!(get_instructions_retired(&total_before, &total_after), summed);
        assert_eq!(
            get_cycles(&total_before, &total_after),
            before.iter().zip(&after).map(|(b, a)| get_cycles(b, a)).sum::<u64>()
        );
    }

    #[test]
    fn test_unavailable_metrics_return_sentinels() {
        let mut before = core(0, 0, 0);
        let mut after = core(10, 10, 10);
        before.availability = Availability::empty();
        after.availability = Availability::empty();
        after.events[0] = 99;
        after.thermal_headroom = 40;
        after.l3_occupancy = 4096;

        assert_eq!(get_l3_cache_misses(&before, &after), 0);
        assert_eq!(get_l3_cache_hit_ratio(&before, &after), -1.0);
        assert_eq!(get_thermal_headroom(&after), INVALID_THERMAL_HEADROOM);
        assert_eq!(get_l3_cache_occupancy(&after), INVALID_QOS_MONITORING_DATA);
        assert_eq!(get_smi_count(&before, &after), 0);
        assert_eq!(get_frontend_bound(&before, &after), 0.0);
        assert_eq!(get_core_c_state_residency(6, &before, &after), 0.0);
    }

    #[test]
    fn test_skylake_cache_events() {
        let before = core(0, 0, 0);
        let mut after = core(0, 1_000, 0);
        // L3 miss, L3 hit, L2 miss, L2 hit
        after.events[..4].copy_from_slice(&[10, 30, 40, 60]);

        assert_eq!(get_l3_cache_misses(&before, &after), 10);
        assert_eq!(get_l3_cache_hits(&before, &after), 30);
        assert_eq!(get_l2_cache_misses(&before, &after), 40);
        assert!(approx(get_l2_cache_hit_ratio(&before, &after), 0.6));
        assert!(approx(get_l3_cache_hit_ratio(&before, &after), 0.75));
        assert!(approx(
            get_cycles_lost_due_l3_cache_misses(&before, &after),
            1.8
        ));
        assert_eq!(get_cycles_lost_due_l2_cache_misses(&before, &after), -1.0);
    }

    #[test]
    fn test_legacy_cache_events() {
        let mut before = core(0, 0, 0);
        let mut after = core(0, 1_000, 0);
        before.event_set = Some(CoreEventSet::Legacy);
        after.event_set = Some(CoreEventSet::Legacy);
        // L3 miss, L3 unshared hit, L2 HITM, L2 hit
        after.events[..4].copy_from_slice(&[10, 20, 5, 65]);

        assert_eq!(get_l3_cache_hits(&before, &after), 25);
        assert_eq!(get_l2_cache_misses(&before, &after), 35);
        assert_eq!(get_l3_cache_hits_snoop(&before, &after), 5);
        assert!(approx(
            get_cycles_lost_due_l2_cache_misses(&before, &after),
            (35.0 * 20.0 + 75.0 * 5.0) / 1_000.0
        ));
    }

    #[test]
    fn test_custom_events_disable_cache_metrics() {
        let before = core(0, 0, 0);
        let mut after = core(0, 100, 0);
        after.event_set = None;
        after.events[0] = 7;
        assert_eq!(get_l3_cache_misses(&before, &after), 0);
        assert_eq!(get_number_of_custom_events(0, &before, &after), 7);
        assert_eq!(get_number_of_custom_events(12, &before, &after), 0);
    }

    #[test]
    fn test_core_c_state_residency() {
        let before = core(0, 0, 0);
        let mut after = core(0, 0, 1_000);
        after.cpu_clk_unhalted_ref = 250;
        after.core_c_state_residency[6] = 500;

        assert!(approx(get_core_c_state_residency(0, &before, &after), 0.25));
        assert!(approx(get_core_c_state_residency(6, &before, &after), 0.5));
        assert!(approx(get_core_c_state_residency(1, &before, &after), 0.25));
        assert_eq!(get_core_c_state_residency(11, &before, &after), 0.0);
    }

    #[test]
    fn test_residency_is_clamped() {
        let before = core(0, 0, 0);
        let mut after = core(0, 0, 1_000);
        after.cpu_clk_unhalted_ref = 900;
        after.core_c_state_residency[6] = 400;
        // 1 - 0.9 - 0.4 < 0
        assert_eq!(get_core_c_state_residency(1, &before, &after), 0.0);
        after.core_c_state_residency[6] = 1_500;
        assert_eq!(get_core_c_state_residency(6, &before, &after), 1.0);
    }

    fn socket(reads: u64, writes: u64, energy: u64, tsc: u64) -> SocketCounterState {
        SocketCounterState {
            socket: 0,
            basic: core(0, 0, tsc),
            uncore: UncoreCounterState {
                availability: Availability::all(),
                mc_normal_reads: reads,
                mc_full_writes: writes,
                package_energy_status: energy,
                joules_per_energy_unit: 0.5,
                invariant_tsc: tsc,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_memory_and_energy() {
        let before = socket(10, 5, 100, 0);
        let mut after = socket(20, 15, 140, 1_000);
        after.uncore.package_c_state_residency[6] = 300;

        assert_eq!(get_bytes_read_from_mc(&before, &after), 640);
        assert_eq!(get_bytes_written_to_mc(&before, &after), 640);
        assert_eq!(get_consumed_energy(&before, &after), 40);
        assert!(approx(get_consumed_joules(&before, &after), 20.0));
        assert!(approx(get_package_c_state_residency(6, &before, &after), 0.3));
        assert!(approx(get_package_c_state_residency(0, &before, &after), 0.7));
    }

    #[test]
    fn test_memory_bw_sentinels() {
        let mut before = core(0, 0, 0);
        let mut after = core(0, 0, 0);
        before.mem_bw_local = 100;
        before.mem_bw_total = 300;
        after.mem_bw_local = 400;
        after.mem_bw_total = 1_000;
        after.l3_occupancy = 8192;
        assert_eq!(get_local_memory_bw(&before, &after), 300);
        assert_eq!(get_remote_memory_bw(&before, &after), 400);
        assert_eq!(get_l3_cache_occupancy(&after), 8);

        after.mem_bw_local = INVALID_QOS_MONITORING_DATA;
        assert_eq!(get_local_memory_bw(&before, &after), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "topdown slots went backwards")]
    fn test_topdown_going_backwards_is_fatal() {
        let mut before = core(0, 0, 0);
        before.all_slots = 1_000;
        before.backend_bound_slots = 400;
        let mut after = core(0, 0, 0);
        after.all_slots = 2_000;
        after.backend_bound_slots = 300;
        get_backend_bound(&before, &after);
    }

    #[test]
    fn test_byte_counts_saturate() {
        let before = SocketCounterState::default();
        let mut after = SocketCounterState::default();
        after.uncore.availability = Availability::all();
        after.uncore.mc_normal_reads = u64::MAX / 2;
        assert_eq!(get_bytes_read_from_mc(&before, &after), u64::MAX);
    }

    #[test]
    fn test_topdown_fractions() {
        let before = core(0, 0, 0);
        let mut after = core(0, 0, 0);
        after.all_slots = 1_000;
        after.frontend_bound_slots = 100;
        after.bad_speculation_slots = 50;
        after.backend_bound_slots = 350;
        after.retiring_slots = 500;
        assert!(approx(get_frontend_bound(&before, &after), 0.1));
        assert!(approx(get_bad_speculation(&before, &after), 0.05));
        assert!(approx(get_backend_bound(&before, &after), 0.35));
        assert!(approx(get_retiring(&before, &after), 0.5));
    }

    fn system(incoming: u64, outgoing: u64, tsc: u64, reads: u64) -> SystemCounterState {
        let mut state = SystemCounterState {
            incoming_xpi_flits: vec![vec![incoming, 0], vec![0, 0]],
            outgoing_xpi_flits: vec![vec![outgoing, 0], vec![0, 0]],
            xpi_clocks: vec![vec![tsc, 0], vec![0, 0]],
            xpi_power_cycles: vec![vec![tsc / 4, 0], vec![0, 0]],
            xpi_bytes_per_flit: 8.0,
            xpi_link_speed: 1_000,
            nominal_frequency: 100,
            ..Default::default()
        };
        state.basic.availability = Availability::all();
        state.uncore.availability = Availability::all();
        state.uncore.invariant_tsc = tsc;
        state.uncore.mc_normal_reads = reads;
        state
    }

    #[test]
    fn test_xpi_link_metrics() {
        let before = system(0, 0, 0, 0);
        // two sockets, 200 ticks total: one second at 100 Hz
        let after = system(50, 200, 200, 25);

        assert_eq!(get_incoming_xpi_link_bytes(0, 0, &before, &after), 400);
        assert_eq!(get_outgoing_xpi_link_bytes(0, 0, &before, &after), 1_600);
        assert!(approx(
            get_incoming_xpi_link_utilization(0, 0, &before, &after),
            0.4
        ));
        // 1600 bytes on a 1000 byte/s link is clamped
        assert_eq!(get_outgoing_xpi_link_utilization(0, 0, &before, &after), 1.0);
        assert_eq!(get_all_incoming_xpi_link_bytes(&before, &after), 400);
        assert!(approx(get_xpi_to_mc_traffic_ratio(&before, &after), 0.25));
        assert!(approx(
            get_normalized_xpi_power_cycles(0, 0, &before, &after),
            0.25
        ));
        assert_eq!(get_incoming_xpi_link_bytes(5, 0, &before, &after), 0);
    }

    fn unit(counters: &[u64], fixed: u64) -> UnitCounters {
        UnitCounters {
            present: true,
            counters: counters.to_vec(),
            fixed,
        }
    }

    fn server(mc: Vec<UnitCounters>, cha: Vec<UnitCounters>, tsc: u64) -> ServerUncoreCounterState {
        ServerUncoreCounterState {
            availability: Availability::all(),
            mc,
            cha,
            invariant_tsc: tsc,
            generation: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_server_uncore_units() {
        let before = server(
            vec![unit(&[0, 0, 0, 0], 0), UnitCounters::absent()],
            vec![],
            0,
        );
        let after = server(
            vec![unit(&[10, 4, 0, 0], 500), UnitCounters::absent()],
            vec![],
            100,
        );
        assert_eq!(get_mc_counter(0, slot::MC_READ, &before, &after), 10);
        assert_eq!(get_mc_channel_write_bytes(0, &before, &after), 256);
        assert_eq!(get_dram_clocks(0, &before, &after), 500);
        assert_eq!(get_mc_counter(1, 0, &before, &after), 0);
        assert_eq!(get_mc_counter(9, 0, &before, &after), 0);
    }

    #[test]
    fn test_generation_change_discards_deltas() {
        let before = server(vec![unit(&[0], 0)], vec![], 0);
        let mut after = server(vec![unit(&[10], 0)], vec![], 100);
        after.generation = 2;
        assert_eq!(get_mc_counter(0, 0, &before, &after), 0);
    }

    #[test]
    fn test_llc_read_miss_latency() {
        let before = server(vec![], vec![unit(&[0, 0, 0, 0], 0); 2], 0);
        // one second at 1 GHz nominal; each CHA ticks 2e9 times
        let after = server(
            vec![],
            vec![unit(&[4_000, 100, 2_000_000_000, 0], 0); 2],
            1_000_000_000,
        );
        assert!(approx(
            get_uncore_frequency(&before, &after, 1_000_000_000),
            2e9
        ));
        // 40 cycles per miss at 2 GHz
        assert!(approx(
            get_llc_read_miss_latency(&before, &after, 1_000_000_000),
            20.0
        ));
    }
}
