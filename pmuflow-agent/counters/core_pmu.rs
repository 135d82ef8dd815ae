//! Per-core PMU: fixed counters, programmable events and core-scope MSRs

use std::sync::Arc;

use parking_lot::Mutex;
use pmuflow_raw::arch::core::{
    global_ctrl_value, msr, perf_metrics_fractions, thermal_headroom, CoreEventSet, FixedCtrCtrl,
    PerfEvtSel, CORE_COUNTER_WIDTH_BITS, CORE_C_STATE_MSRS, MAX_PROGRAMMABLE_COUNTERS,
    PKG_C_STATE_MSRS,
};
use pmuflow_raw::{counter_mask, ArchDescriptor, Availability, RegisterLayout};

use crate::common::platform::MsrDevice;
use crate::common::whitelist::{check_msr, AccessFilter};
use crate::error::{PmuError, Result};
use crate::metrics::state::{BasicCounterState, C_STATE_SLOTS, INVALID_THERMAL_HEADROOM};

/// Fixed counter 3 (SLOTS) enable in IA32_PERF_GLOBAL_CTRL
const GLOBAL_CTRL_SLOTS: u64 = 1 << 35;
/// Fixed counter 3 ring bits in IA32_FIXED_CTR_CTRL
const FIXED_CTRL_SLOTS: u64 = 0x3 << 12;

const PERFEVTSEL_ENABLE: u64 = 1 << 22;

/// What to program into the general purpose counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreEventConfig {
    /// Raw IA32_PERFEVTSELx values
    pub events: Vec<u64>,
    /// Meaning of the first four counters when they carry the cache events
    pub event_set: Option<CoreEventSet>,
    /// MSR_OFFCORE_RSP0/1 values
    pub offcore: [u64; 2],
}

impl CoreEventConfig {
    /// L2/L3 hit and miss events of the generation
    pub fn default_for(set: CoreEventSet) -> Self {
        Self {
            events: set
                .events()
                .iter()
                .map(|e| e.perfevtsel().to_raw())
                .collect(),
            event_set: Some(set),
            offcore: [0, 0],
        }
    }

    /// User supplied encodings; the enable bit is forced on
    pub fn custom(events: Vec<u64>, offcore: [u64; 2]) -> Self {
        Self {
            events: events.into_iter().map(|e| e | PERFEVTSEL_ENABLE).collect(),
            event_set: None,
            offcore,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TopdownTotals {
    frontend: u64,
    bad_speculation: u64,
    backend: u64,
    retiring: u64,
    slots: u64,
}

pub struct CorePmu {
    cpu: u32,
    msr: Arc<dyn MsrDevice>,
    filter: Arc<dyn AccessFilter>,
    availability: Availability,
    c_states: Vec<(usize, u64)>,
    programmable: usize,
    topdown: bool,
    event_set: Option<CoreEventSet>,
    generation: u64,
    topdown_totals: Mutex<TopdownTotals>,
    /// Previous snapshot; its fields stand in for registers that fail to read
    last: Mutex<BasicCounterState>,
}

impl CorePmu {
    /// `programmable` is the number of general purpose counters to drive
    pub fn new(
        msr: Arc<dyn MsrDevice>,
        filter: Arc<dyn AccessFilter>,
        descriptor: &ArchDescriptor,
        programmable: usize,
    ) -> Self {
        let c_states = descriptor
            .core_c_states
            .iter()
            .filter_map(|&state| CORE_C_STATE_MSRS.get(state).copied().flatten().map(|a| (state, a)))
            .collect();
        Self {
            cpu: msr.cpu(),
            msr,
            filter,
            availability: descriptor.availability,
            c_states,
            programmable: programmable.min(MAX_PROGRAMMABLE_COUNTERS),
            topdown: descriptor.is_available(Availability::TOPDOWN),
            event_set: None,
            generation: 0,
            topdown_totals: Mutex::new(TopdownTotals::default()),
            last: Mutex::new(BasicCounterState::default()),
        }
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn write(&self, addr: u64, value: u64) -> Result<()> {
        check_msr(self.filter.as_ref(), addr)?;
        tracing::debug!("CPU {}: MSR 0x{:x} <- 0x{:x}", self.cpu, addr, value);
        self.msr.write(addr, value)
    }

    fn read(&self, addr: u64) -> Result<u64> {
        self.msr.read(addr)
    }

    fn read_or(&self, addr: u64, last: u64) -> u64 {
        self.read(addr).unwrap_or_else(|e| {
            tracing::debug!(
                "CPU {}: MSR 0x{:x} unreadable, repeating last value: {}",
                self.cpu,
                addr,
                e
            );
            last
        })
    }

    /// True when another agent left counters enabled
    pub fn busy(&self) -> Result<bool> {
        for i in 0..self.programmable {
            if PerfEvtSel::from_raw(self.read(msr::perfevtsel(i))?).enable {
                return Ok(true);
            }
        }
        let fixed = FixedCtrCtrl::from_raw(self.read(msr::IA32_FIXED_CTR_CTRL)?);
        Ok(fixed.any_enabled())
    }

    pub fn program(&mut self, config: &CoreEventConfig, force: bool) -> Result<()> {
        if self.busy()? {
            if !force {
                return Err(PmuError::PmuBusy(format!("core PMU of CPU {}", self.cpu)));
            }
            tracing::warn!("CPU {}: PMU in use, reprogramming anyway", self.cpu);
        }

        let events = &config.events[..config.events.len().min(self.programmable)];
        if events.len() < config.events.len() {
            tracing::warn!(
                "CPU {}: {} events requested, {} counters available",
                self.cpu,
                config.events.len(),
                self.programmable
            );
        }

        self.write(msr::IA32_PERF_GLOBAL_CTRL, 0)?;

        let mut fixed = FixedCtrCtrl::all_rings().to_raw();
        if self.topdown {
            fixed |= FIXED_CTRL_SLOTS;
        }
        self.write(msr::IA32_FIXED_CTR_CTRL, fixed)?;
        for addr in [msr::IA32_FIXED_CTR0, msr::IA32_FIXED_CTR1, msr::IA32_FIXED_CTR2] {
            self.write(addr, 0)?;
        }

        if config.offcore[0] != 0 {
            self.write(msr::MSR_OFFCORE_RSP0, config.offcore[0])?;
        }
        if config.offcore[1] != 0 {
            self.write(msr::MSR_OFFCORE_RSP1, config.offcore[1])?;
        }
        for (i, &event) in events.iter().enumerate() {
            self.write(msr::perfevtsel(i), event)?;
            self.write(msr::pmc(i), 0)?;
        }

        if self.topdown {
            self.write(msr::TOPDOWN_SLOTS, 0)?;
            self.write(msr::PERF_METRICS, 0)?;
            *self.topdown_totals.lock() = TopdownTotals::default();
        }
        *self.last.lock() = BasicCounterState::default();

        let mut global = global_ctrl_value(events.len(), self.topdown);
        if self.topdown {
            global |= GLOBAL_CTRL_SLOTS;
        }
        self.write(msr::IA32_PERF_GLOBAL_CTRL, global)?;

        self.event_set = config.event_set;
        self.generation += 1;
        Ok(())
    }

    /// Fold the hardware topdown metrics into the running totals and restart
    /// them. Totals stay as they are when the metrics cannot be read.
    fn sample_topdown(&self) -> TopdownTotals {
        let mut totals = self.topdown_totals.lock();
        let (slots, metrics) = match (self.read(msr::TOPDOWN_SLOTS), self.read(msr::PERF_METRICS)) {
            (Ok(slots), Ok(metrics)) => (slots & counter_mask(CORE_COUNTER_WIDTH_BITS), metrics),
            (Err(e), _) | (_, Err(e)) => {
                tracing::debug!("CPU {}: topdown metrics unreadable: {}", self.cpu, e);
                return *totals;
            }
        };
        let [retiring, bad_speculation, frontend, backend] = perf_metrics_fractions(metrics);
        let part = |fraction: f64| (fraction * slots as f64) as u64;

        totals.retiring += part(retiring);
        totals.bad_speculation += part(bad_speculation);
        totals.frontend += part(frontend);
        totals.backend += part(backend);
        totals.slots += slots;

        for addr in [msr::PERF_METRICS, msr::TOPDOWN_SLOTS] {
            if let Err(e) = self.write(addr, 0) {
                tracing::debug!("CPU {}: cannot restart topdown metrics: {}", self.cpu, e);
            }
        }
        *totals
    }

    /// Current counter values. A register that fails to read keeps its
    /// value from the previous snapshot, so the interval reads as idle
    /// instead of breaking the capture.
    pub fn snapshot(&self) -> BasicCounterState {
        let mask = counter_mask(CORE_COUNTER_WIDTH_BITS);
        let mut last = self.last.lock();
        let mut state = BasicCounterState {
            availability: self.availability,
            event_set: self.event_set,
            generation: self.generation,
            ..Default::default()
        };

        state.instructions_retired =
            self.read_or(msr::IA32_FIXED_CTR0, last.instructions_retired) & mask;
        state.cpu_clk_unhalted_thread =
            self.read_or(msr::IA32_FIXED_CTR1, last.cpu_clk_unhalted_thread) & mask;
        state.cpu_clk_unhalted_ref =
            self.read_or(msr::IA32_FIXED_CTR2, last.cpu_clk_unhalted_ref) & mask;
        for i in 0..self.programmable {
            state.events[i] = self.read_or(msr::pmc(i), last.events[i]) & mask;
        }
        state.invariant_tsc = self.read_or(msr::IA32_TIME_STAMP_COUNTER, last.invariant_tsc);

        for &(index, addr) in &self.c_states {
            state.core_c_state_residency[index] =
                self.read_or(addr, last.core_c_state_residency[index]);
        }

        if self.availability.contains(Availability::SMI_COUNT) {
            state.smi_count = self.read_or(msr::MSR_SMI_COUNT, last.smi_count) & 0xFFFF_FFFF;
        }
        if self.availability.contains(Availability::THERMAL_HEADROOM) {
            state.thermal_headroom = self
                .read(msr::IA32_THERM_STATUS)
                .ok()
                .and_then(thermal_headroom)
                .unwrap_or(INVALID_THERMAL_HEADROOM);
        }

        if self.topdown && self.generation > 0 {
            let totals = self.sample_topdown();
            state.frontend_bound_slots = totals.frontend;
            state.bad_speculation_slots = totals.bad_speculation;
            state.backend_bound_slots = totals.backend;
            state.retiring_slots = totals.retiring;
            state.all_slots = totals.slots;
        }

        *last = state.clone();
        state
    }

    pub fn cleanup(&self) -> Result<()> {
        self.write(msr::IA32_PERF_GLOBAL_CTRL, 0)?;
        for i in 0..self.programmable {
            self.write(msr::perfevtsel(i), 0)?;
        }
        self.write(msr::IA32_FIXED_CTR_CTRL, 0)
    }
}

/// Package C-state residency counters, read on a core of the package. A
/// state that fails to read keeps its value from `last`.
pub fn package_c_states(
    msr: &dyn MsrDevice,
    descriptor: &ArchDescriptor,
    last: &[u64; C_STATE_SLOTS],
) -> [u64; C_STATE_SLOTS] {
    let mut residency = [0u64; C_STATE_SLOTS];
    for &state in descriptor.package_c_states {
        if let Some(Some(addr)) = PKG_C_STATE_MSRS.get(state) {
            residency[state] = msr.read(*addr).unwrap_or_else(|e| {
                tracing::debug!(
                    "Package C{} residency unreadable on CPU {}: {}",
                    state,
                    msr.cpu(),
                    e
                );
                last[state]
            });
        }
    }
    residency
}

/// Nominal core frequency in Hz from the platform info ratio
pub fn nominal_frequency(msr: &dyn MsrDevice, bus_clock_hz: u64) -> Result<u64> {
    let ratio = (msr.read(msr::MSR_PLATFORM_INFO)? >> 8) & 0xFF;
    Ok(ratio * bus_clock_hz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::mock::MockMsr;
    use crate::common::whitelist::{AllowAll, RangeFilter};
    use pmuflow_raw::CpuModel;

    fn pmu(model: CpuModel) -> (Arc<MockMsr>, CorePmu) {
        let mock = Arc::new(MockMsr::new(3));
        let descriptor = ArchDescriptor::for_model(model);
        let pmu = CorePmu::new(
            Arc::clone(&mock) as Arc<dyn MsrDevice>,
            Arc::new(AllowAll),
            &descriptor,
            descriptor.core_counters,
        );
        (mock, pmu)
    }

    #[test]
    fn test_program_default_events() {
        let (mock, mut pmu) = pmu(CpuModel::SkylakeX);
        pmu.program(&CoreEventConfig::default_for(CoreEventSet::Skylake), false)
            .expect("program");

        assert_eq!(mock.get(msr::IA32_FIXED_CTR_CTRL), 0x333);
        assert_eq!(mock.get(msr::perfevtsel(0)), 0x0043_20D1);
        assert_eq!(mock.get(msr::IA32_PERF_GLOBAL_CTRL), global_ctrl_value(4, false));
        // global control is cleared first and set last
        let writes = mock.writes();
        assert_eq!(writes.first(), Some(&(msr::IA32_PERF_GLOBAL_CTRL, 0)));
        assert_eq!(writes.last().map(|w| w.0), Some(msr::IA32_PERF_GLOBAL_CTRL));
        assert_eq!(pmu.generation(), 1);
    }

    #[test]
    fn test_busy_pmu_requires_force() {
        let (mock, mut pmu) = pmu(CpuModel::SkylakeX);
        mock.set(msr::perfevtsel(1), 0x0043_003C);
        let config = CoreEventConfig::default_for(CoreEventSet::Skylake);

        let err = pmu.program(&config, false).expect_err("busy");
        assert!(matches!(err, PmuError::PmuBusy(_)));
        assert_eq!(pmu.generation(), 0);

        pmu.program(&config, true).expect("forced");
        assert_eq!(pmu.generation(), 1);
    }

    #[test]
    fn test_denied_write_is_reported() {
        let mock = Arc::new(MockMsr::new(0));
        let descriptor = ArchDescriptor::for_model(CpuModel::SkylakeX);
        let mut pmu = CorePmu::new(
            mock as Arc<dyn MsrDevice>,
            Arc::new(RangeFilter::new()),
            &descriptor,
            4,
        );
        let err = pmu
            .program(&CoreEventConfig::default_for(CoreEventSet::Skylake), false)
            .expect_err("denied");
        assert!(matches!(err, PmuError::AccessDenied(_)));
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let (mock, mut pmu) = pmu(CpuModel::SkylakeX);
        pmu.program(&CoreEventConfig::default_for(CoreEventSet::Skylake), false)
            .expect("program");

        mock.set(msr::IA32_FIXED_CTR0, (1 << 50) | 1_000);
        mock.set(msr::IA32_FIXED_CTR1, 2_000);
        mock.set(msr::pmc(2), 17);
        mock.set(msr::IA32_TIME_STAMP_COUNTER, 5_000);
        mock.set(msr::MSR_CORE_C6_RESIDENCY, 300);
        mock.set(msr::IA32_THERM_STATUS, (1 << 31) | (55 << 16));

        let state = pmu.snapshot();
        assert_eq!(state.instructions_retired, 1_000);
        assert_eq!(state.cpu_clk_unhalted_thread, 2_000);
        assert_eq!(state.events[2], 17);
        assert_eq!(state.invariant_tsc, 5_000);
        assert_eq!(state.core_c_state_residency[6], 300);
        assert_eq!(state.thermal_headroom, 55);
        assert_eq!(state.event_set, Some(CoreEventSet::Skylake));
        assert_eq!(state.generation, 1);
    }

    #[test]
    fn test_unreadable_counter_repeats_last_value() {
        let (mock, mut pmu) = pmu(CpuModel::SkylakeX);
        pmu.program(&CoreEventConfig::default_for(CoreEventSet::Skylake), false)
            .expect("program");

        mock.set(msr::IA32_FIXED_CTR0, 1_000);
        mock.set(msr::MSR_CORE_C6_RESIDENCY, 300);
        let first = pmu.snapshot();

        mock.registers().fail(msr::MSR_CORE_C6_RESIDENCY);
        mock.set(msr::IA32_FIXED_CTR0, 1_800);
        let second = pmu.snapshot();
        assert_eq!(second.instructions_retired, 1_800);
        assert_eq!(second.core_c_state_residency[6], first.core_c_state_residency[6]);

        mock.registers().recover(msr::MSR_CORE_C6_RESIDENCY);
        mock.set(msr::MSR_CORE_C6_RESIDENCY, 900);
        assert_eq!(pmu.snapshot().core_c_state_residency[6], 900);
    }

    #[test]
    fn test_invalid_thermal_reading() {
        let (_mock, pmu) = pmu(CpuModel::SkylakeX);
        let state = pmu.snapshot();
        assert_eq!(state.thermal_headroom, INVALID_THERMAL_HEADROOM);
    }

    #[test]
    fn test_topdown_accumulates_and_resets() {
        let (mock, mut pmu) = pmu(CpuModel::IceLakeX);
        pmu.program(&CoreEventConfig::default_for(CoreEventSet::Skylake), false)
            .expect("program");
        assert_ne!(mock.get(msr::IA32_PERF_GLOBAL_CTRL) & GLOBAL_CTRL_SLOTS, 0);

        // retiring 0xFF/255 of 510 slots
        mock.set(msr::TOPDOWN_SLOTS, 510);
        mock.set(msr::PERF_METRICS, 0xFF);
        let first = pmu.snapshot();
        assert_eq!(first.all_slots, 510);
        assert_eq!(first.retiring_slots, 510);
        assert_eq!(mock.get(msr::TOPDOWN_SLOTS), 0);

        // half backend bound
        mock.set(msr::TOPDOWN_SLOTS, 100);
        mock.set(msr::PERF_METRICS, 0x80 << 24);
        let second = pmu.snapshot();
        assert_eq!(second.all_slots, 610);
        assert_eq!(second.retiring_slots, 510);
        assert_eq!(second.backend_bound_slots, 50);
    }

    #[test]
    fn test_custom_events_get_enable_bit() {
        let config = CoreEventConfig::custom(vec![0x3C], [0, 0]);
        assert_eq!(config.events, vec![0x40_003C]);
        assert!(config.event_set.is_none());
    }

    #[test]
    fn test_package_c_states_and_frequency() {
        let mock = MockMsr::new(0);
        mock.set(msr::MSR_PKG_C6_RESIDENCY, 42);
        mock.set(msr::MSR_PKG_C3_RESIDENCY, 7);
        mock.set(msr::MSR_PLATFORM_INFO, 0x1A << 8);
        let descriptor = ArchDescriptor::for_model(CpuModel::SkylakeX);

        let residency = package_c_states(&mock, &descriptor, &[0; C_STATE_SLOTS]);
        assert_eq!(residency[6], 42);
        // C3 is not reported on this generation
        assert_eq!(residency[3], 0);

        mock.registers().fail(msr::MSR_PKG_C6_RESIDENCY);
        let repeated = package_c_states(&mock, &descriptor, &residency);
        assert_eq!(repeated[6], 42);
        assert_eq!(
            nominal_frequency(&mock, descriptor.bus_clock_hz).expect("read"),
            2_600_000_000
        );
    }
}
