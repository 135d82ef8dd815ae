//! Core PMU register definitions
//!
//! Architectural performance monitoring (Intel SDM Vol. 3B, chapter 20) is
//! identical across the generations this crate supports, so the addresses
//! here are shared. Only the event encodings for the cache hierarchy differ;
//! those live in [`CoreEventSet`].

use crate::register::RegisterLayout;

/// Width of the fixed and general purpose counters
pub const CORE_COUNTER_WIDTH_BITS: u32 = 48;

/// Number of fixed-function counters (instructions, cycles, reference cycles)
pub const CORE_FIXED_COUNTERS: usize = 3;

/// Maximum number of programmable counters (no SMT)
pub const MAX_PROGRAMMABLE_COUNTERS: usize = 8;

pub mod msr {
    pub const IA32_TIME_STAMP_COUNTER: u64 = 0x10;
    pub const MSR_SMI_COUNT: u64 = 0x34;
    pub const MSR_PLATFORM_INFO: u64 = 0xCE;
    pub const IA32_THERM_STATUS: u64 = 0x19C;
    pub const IA32_PERF_CAPABILITIES: u64 = 0x345;

    pub const IA32_PMC0: u64 = 0xC1;
    pub const IA32_PERFEVTSEL0: u64 = 0x186;
    pub const MSR_OFFCORE_RSP0: u64 = 0x1A6;
    pub const MSR_OFFCORE_RSP1: u64 = 0x1A7;

    pub const IA32_FIXED_CTR0: u64 = 0x309; // Instructions retired
    pub const IA32_FIXED_CTR1: u64 = 0x30A; // Unhalted core cycles
    pub const IA32_FIXED_CTR2: u64 = 0x30B; // Unhalted reference cycles
    pub const TOPDOWN_SLOTS: u64 = 0x30C;
    pub const PERF_METRICS: u64 = 0x329;

    pub const IA32_FIXED_CTR_CTRL: u64 = 0x38D;
    pub const IA32_PERF_GLOBAL_STATUS: u64 = 0x38E;
    pub const IA32_PERF_GLOBAL_CTRL: u64 = 0x38F;
    pub const IA32_PERF_GLOBAL_OVF_CTRL: u64 = 0x390;

    pub const MSR_CORE_C3_RESIDENCY: u64 = 0x3FC;
    pub const MSR_CORE_C6_RESIDENCY: u64 = 0x3FD;
    pub const MSR_CORE_C7_RESIDENCY: u64 = 0x3FE;

    pub const MSR_PKG_C2_RESIDENCY: u64 = 0x60D;
    pub const MSR_PKG_C3_RESIDENCY: u64 = 0x3F8;
    pub const MSR_PKG_C6_RESIDENCY: u64 = 0x3F9;
    pub const MSR_PKG_C7_RESIDENCY: u64 = 0x3FA;
    pub const MSR_PKG_C8_RESIDENCY: u64 = 0x630;
    pub const MSR_PKG_C9_RESIDENCY: u64 = 0x631;
    pub const MSR_PKG_C10_RESIDENCY: u64 = 0x632;

    /// Programmable event select register for counter `index`
    pub const fn perfevtsel(index: usize) -> u64 {
        IA32_PERFEVTSEL0 + index as u64
    }

    /// Programmable counter register for counter `index`
    pub const fn pmc(index: usize) -> u64 {
        IA32_PMC0 + index as u64
    }
}

/// Number of C-state slots tracked per core and per package (C0..C10)
pub const MAX_C_STATE: usize = 10;

/// Core C-state residency MSRs indexed by C-state number
///
/// C0 and C1 are derived from the reference cycle counter and the TSC.
pub const CORE_C_STATE_MSRS: [Option<u64>; MAX_C_STATE + 1] = [
    None,
    None,
    None,
    Some(msr::MSR_CORE_C3_RESIDENCY),
    None,
    None,
    Some(msr::MSR_CORE_C6_RESIDENCY),
    Some(msr::MSR_CORE_C7_RESIDENCY),
    None,
    None,
    None,
];

/// Package C-state residency MSRs indexed by C-state number
pub const PKG_C_STATE_MSRS: [Option<u64>; MAX_C_STATE + 1] = [
    None,
    None,
    Some(msr::MSR_PKG_C2_RESIDENCY),
    Some(msr::MSR_PKG_C3_RESIDENCY),
    None,
    None,
    Some(msr::MSR_PKG_C6_RESIDENCY),
    Some(msr::MSR_PKG_C7_RESIDENCY),
    Some(msr::MSR_PKG_C8_RESIDENCY),
    Some(msr::MSR_PKG_C9_RESIDENCY),
    Some(msr::MSR_PKG_C10_RESIDENCY),
];

/// IA32_PERFEVTSELx layout
///
/// | Bits   | Field        |
/// |--------|--------------|
/// | 0-7    | event_select |
/// | 8-15   | umask        |
/// | 16     | usr          |
/// | 17     | os           |
/// | 18     | edge         |
/// | 19     | pc           |
/// | 20     | int          |
/// | 21     | any_thread   |
/// | 22     | enable       |
/// | 23     | invert       |
/// | 24-31  | cmask        |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfEvtSel {
    pub event_select: u8,
    pub umask: u8,
    pub usr: bool,
    pub os: bool,
    pub edge: bool,
    pub pc: bool,
    pub int: bool,
    pub any_thread: bool,
    pub enable: bool,
    pub invert: bool,
    pub cmask: u8,
}

impl PerfEvtSel {
    /// Event counting in both user and kernel mode, enabled
    pub fn counting(event_select: u8, umask: u8) -> Self {
        Self {
            event_select,
            umask,
            usr: true,
            os: true,
            enable: true,
            ..Default::default()
        }
    }
}

impl RegisterLayout for PerfEvtSel {
    fn to_raw(&self) -> u64 {
        let flag = |set: bool, bit: u32| if set { 1u64 << bit } else { 0 };

        (self.event_select as u64)
            | ((self.umask as u64) << 8)
            | flag(self.usr, 16)
            | flag(self.os, 17)
            | flag(self.edge, 18)
            | flag(self.pc, 19)
            | flag(self.int, 20)
            | flag(self.any_thread, 21)
            | flag(self.enable, 22)
            | flag(self.invert, 23)
            | ((self.cmask as u64) << 24)
    }

    fn from_raw(value: u64) -> Self {
        let bit = |n: u32| (value >> n) & 1 != 0;

        Self {
            event_select: (value & 0xFF) as u8,
            umask: ((value >> 8) & 0xFF) as u8,
            usr: bit(16),
            os: bit(17),
            edge: bit(18),
            pc: bit(19),
            int: bit(20),
            any_thread: bit(21),
            enable: bit(22),
            invert: bit(23),
            cmask: ((value >> 24) & 0xFF) as u8,
        }
    }
}

/// Per-counter control nibble of IA32_FIXED_CTR_CTRL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedCounterMode {
    pub os: bool,
    pub usr: bool,
    pub any_thread: bool,
    pub pmi: bool,
}

/// IA32_FIXED_CTR_CTRL layout: one 4-bit field per fixed counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedCtrCtrl {
    pub counters: [FixedCounterMode; CORE_FIXED_COUNTERS],
}

impl FixedCtrCtrl {
    /// All three fixed counters counting in user and kernel mode
    pub fn all_rings() -> Self {
        let mode = FixedCounterMode {
            os: true,
            usr: true,
            ..Default::default()
        };
        Self {
            counters: [mode; CORE_FIXED_COUNTERS],
        }
    }

    /// True when any fixed counter is enabled for any ring
    pub fn any_enabled(&self) -> bool {
        self.counters.iter().any(|c| c.os || c.usr)
    }
}

impl RegisterLayout for FixedCtrCtrl {
    fn to_raw(&self) -> u64 {
        self.counters
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, c)| {
                let nibble = (c.os as u64)
                    | ((c.usr as u64) << 1)
                    | ((c.any_thread as u64) << 2)
                    | ((c.pmi as u64) << 3);
                acc | (nibble << (4 * i))
            })
    }

    fn from_raw(value: u64) -> Self {
        let mut ctrl = Self::default();
        for (i, c) in ctrl.counters.iter_mut().enumerate() {
            let nibble = (value >> (4 * i)) & 0xF;
            *c = FixedCounterMode {
                os: nibble & 0x1 != 0,
                usr: nibble & 0x2 != 0,
                any_thread: nibble & 0x4 != 0,
                pmi: nibble & 0x8 != 0,
            };
        }
        ctrl
    }
}

/// IA32_PERF_GLOBAL_CTRL value enabling `programmable` general purpose
/// counters, the three fixed counters and, when `topdown` is set, the
/// PERF_METRICS group
pub const fn global_ctrl_value(programmable: usize, topdown: bool) -> u64 {
    let gp = (1u64 << programmable) - 1;
    let fixed = 0x7u64 << 32;
    let metrics = if topdown { 1u64 << 48 } else { 0 };
    gp | fixed | metrics
}

/// Hardware event encoding (event select, unit mask)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreEvent {
    pub event: u8,
    pub umask: u8,
    pub name: &'static str,
}

impl CoreEvent {
    pub const fn new(event: u8, umask: u8, name: &'static str) -> Self {
        Self { event, umask, name }
    }

    pub fn perfevtsel(&self) -> PerfEvtSel {
        PerfEvtSel::counting(self.event, self.umask)
    }
}

/// How the four default cache events map onto L2/L3 semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEventSet {
    /// Pre-Skylake: L3 miss, L3 unshared hit, L2 HITM, L2 hit
    Legacy,
    /// Skylake and later: L3 miss, L3 hit, L2 miss, L2 hit
    Skylake,
}

impl CoreEventSet {
    pub fn events(&self) -> [CoreEvent; 4] {
        match self {
            CoreEventSet::Legacy => [
                CoreEvent::new(0xD1, 0x20, "MEM_LOAD_UOPS_RETIRED.L3_MISS"),
                CoreEvent::new(0xD2, 0x01, "MEM_LOAD_UOPS_L3_HIT_RETIRED.XSNP_NONE"),
                CoreEvent::new(0xD2, 0x04, "MEM_LOAD_UOPS_L3_HIT_RETIRED.XSNP_HITM"),
                CoreEvent::new(0xD1, 0x02, "MEM_LOAD_UOPS_RETIRED.L2_HIT"),
            ],
            CoreEventSet::Skylake => [
                CoreEvent::new(0xD1, 0x20, "MEM_LOAD_RETIRED.L3_MISS"),
                CoreEvent::new(0xD1, 0x04, "MEM_LOAD_RETIRED.L3_HIT"),
                CoreEvent::new(0xD1, 0x10, "MEM_LOAD_RETIRED.L2_MISS"),
                CoreEvent::new(0xD1, 0x02, "MEM_LOAD_RETIRED.L2_HIT"),
            ],
        }
    }
}

/// Thermal headroom (degrees below TjMax) from IA32_THERM_STATUS
///
/// Returns `None` when the reading-valid bit (31) is clear.
pub fn thermal_headroom(therm_status: u64) -> Option<i32> {
    if therm_status & (1 << 31) == 0 {
        return None;
    }
    Some(((therm_status >> 16) & 0x7F) as i32)
}

/// Split PERF_METRICS into the four level-1 topdown fractions
///
/// Each byte is a fraction of 0xFF; the order is retiring, bad speculation,
/// frontend bound, backend bound.
pub fn perf_metrics_fractions(value: u64) -> [f64; 4] {
    let byte = |n: u32| ((value >> (8 * n)) & 0xFF) as f64 / 255.0;
    [byte(0), byte(1), byte(2), byte(3)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfevtsel_encoding() {
        let sel = PerfEvtSel::counting(0xD1, 0x20);
        assert_eq!(sel.to_raw(), 0x0043_20D1);
        assert_eq!(PerfEvtSel::from_raw(sel.to_raw()), sel);
    }

    #[test]
    fn test_fixed_ctr_ctrl_all_rings() {
        let ctrl = FixedCtrCtrl::all_rings();
        assert_eq!(ctrl.to_raw(), 0x333);
        assert!(ctrl.any_enabled());
        assert!(!FixedCtrCtrl::from_raw(0).any_enabled());
    }

    #[test]
    fn test_global_ctrl_value() {
        assert_eq!(global_ctrl_value(4, false), 0x7_0000_000F);
        assert_eq!(global_ctrl_value(8, true), 0x1_0007_0000_00FF);
    }

    #[test]
    fn test_thermal_headroom() {
        assert_eq!(thermal_headroom(0), None);
        assert_eq!(thermal_headroom((1 << 31) | (42 << 16)), Some(42));
    }
}
