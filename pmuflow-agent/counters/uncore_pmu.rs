//! Uncore counter boxes and their freeze protocol
//!
//! A box is one unit control register plus counter control/value pairs,
//! optionally a fixed counter and filters. Reads of several counters are
//! only mutually consistent while the box is frozen, so snapshots go
//! through [`UncorePmu::read_frozen`].

use pmuflow_raw::arch::uncore::{
    ProgramStyle, UnitControlLayout, UNC_PMON_CTL_EN, UNC_PMON_FIXED_CTL_EN,
    MAX_COUNTERS_PER_BOX, MAX_FILTERS_PER_BOX,
};

use crate::common::register::RegisterRef;
use crate::error::{PmuError, Result};

pub struct UncorePmu {
    unit_control: Option<RegisterRef>,
    counter_control: Vec<RegisterRef>,
    counter_value: Vec<RegisterRef>,
    fixed_control: Option<RegisterRef>,
    fixed_value: Option<RegisterRef>,
    filters: [Option<RegisterRef>; MAX_FILTERS_PER_BOX],
    layout: UnitControlLayout,
    generation: u64,
}

/// Counter values of one box captured while frozen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoxSnapshot {
    pub counters: Vec<u64>,
    pub fixed: Option<u64>,
}

impl UncorePmu {
    pub fn new(
        unit_control: Option<RegisterRef>,
        counter_control: Vec<RegisterRef>,
        counter_value: Vec<RegisterRef>,
        layout: UnitControlLayout,
    ) -> Result<Self> {
        if counter_control.len() != counter_value.len() {
            return Err(PmuError::ConfigError(format!(
                "uncore box with {} control and {} value registers",
                counter_control.len(),
                counter_value.len()
            )));
        }
        if counter_control.len() > MAX_COUNTERS_PER_BOX {
            return Err(PmuError::ConfigError(format!(
                "uncore box with {} counters",
                counter_control.len()
            )));
        }
        Ok(Self {
            unit_control,
            counter_control,
            counter_value,
            fixed_control: None,
            fixed_value: None,
            filters: [None, None],
            layout,
            generation: 0,
        })
    }

    /// Placeholder for a unit that is missing; never valid
    pub fn absent(layout: UnitControlLayout) -> Self {
        Self {
            unit_control: None,
            counter_control: Vec::new(),
            counter_value: Vec::new(),
            fixed_control: None,
            fixed_value: None,
            filters: [None, None],
            layout,
            generation: 0,
        }
    }

    pub fn with_fixed(mut self, control: RegisterRef, value: RegisterRef) -> Self {
        self.fixed_control = Some(control);
        self.fixed_value = Some(value);
        self
    }

    pub fn with_filters(mut self, filters: [Option<RegisterRef>; MAX_FILTERS_PER_BOX]) -> Self {
        self.filters = filters;
        self
    }

    pub fn valid(&self) -> bool {
        self.unit_control.is_some()
    }

    pub fn counters(&self) -> usize {
        self.counter_value.len()
    }

    pub fn has_fixed(&self) -> bool {
        self.fixed_value.is_some()
    }

    /// Incremented on every [`Self::program`]; earlier snapshots are stale
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn write_unit(&self, value: u64) -> Result<()> {
        match &self.unit_control {
            Some(reg) => reg.write(value),
            None => Ok(()),
        }
    }

    /// Enable freezing; with `check`, verify the write stuck and invalidate
    /// the box if it did not
    pub fn init_freeze(&mut self, extra: u64, check: bool) -> Result<bool> {
        let Some(unit) = self.unit_control.clone() else {
            return Ok(false);
        };

        unit.write(extra)?;
        if check {
            let mask = self.layout.valid_bits_mask();
            let readback = unit.read()?;
            if readback & mask != extra & mask {
                tracing::warn!(
                    "Uncore unit control reads back 0x{:x} after writing 0x{:x}, box disabled",
                    readback,
                    extra
                );
                self.unit_control = None;
                return Ok(false);
            }
        }
        unit.write(extra | self.layout.freeze())?;
        Ok(true)
    }

    pub fn freeze(&self, extra: u64) -> Result<()> {
        self.write_unit(extra | self.layout.freeze())
    }

    pub fn unfreeze(&self, extra: u64) -> Result<()> {
        self.write_unit(extra)
    }

    /// Zero every counter, then let the box run
    pub fn reset_unfreeze(&self, extra: u64) -> Result<()> {
        self.write_unit(extra | self.layout.freeze() | self.layout.reset_counters())?;
        for value in &self.counter_value {
            value.write(0)?;
        }
        if let Some(fixed) = &self.fixed_value {
            fixed.write(0)?;
        }
        self.write_unit(extra)
    }

    /// Program `events` into the first `events.len()` counters and restart
    /// the box from zero. `Direct` writes each encoding unchanged, so it must
    /// carry its own enable bit; `EnableFirst` adds the bit itself.
    pub fn program(&mut self, events: &[u64], extra: u64, style: ProgramStyle) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }

        self.freeze(extra)?;
        for (control, &event) in self.counter_control.iter().zip(events) {
            match style {
                ProgramStyle::Direct => control.write(event)?,
                ProgramStyle::EnableFirst => {
                    control.write(UNC_PMON_CTL_EN)?;
                    control.write(UNC_PMON_CTL_EN | event)?;
                }
            }
        }
        if events.len() > self.counter_control.len() {
            tracing::debug!(
                "Box has {} counters, ignoring {} extra events",
                self.counter_control.len(),
                events.len() - self.counter_control.len()
            );
        }
        if let Some(fixed) = &self.fixed_control {
            fixed.write(UNC_PMON_FIXED_CTL_EN)?;
        }
        self.reset_unfreeze(extra)?;
        self.generation += 1;
        Ok(())
    }

    pub fn set_filter(&self, index: usize, value: u64) -> Result<()> {
        match self.filters.get(index).and_then(Option::as_ref) {
            Some(filter) => filter.write(value),
            None => Ok(()),
        }
    }

    pub fn read_counter(&self, index: usize) -> Result<u64> {
        match self.counter_value.get(index) {
            Some(reg) => reg.read(),
            None => Ok(0),
        }
    }

    pub fn read_fixed(&self) -> Result<Option<u64>> {
        self.fixed_value.as_ref().map(|r| r.read()).transpose()
    }

    /// Read every counter with the box frozen so the values describe one
    /// instant
    pub fn read_frozen(&self, extra: u64) -> Result<BoxSnapshot> {
        if !self.valid() {
            return Ok(BoxSnapshot::default());
        }
        self.freeze(extra)?;
        let result = (|| -> Result<BoxSnapshot> {
            let counters = self
                .counter_value
                .iter()
                .map(|r| r.read())
                .collect::<Result<Vec<_>>>()?;
            let fixed = self.read_fixed()?;
            Ok(BoxSnapshot { counters, fixed })
        })();
        self.unfreeze(extra)?;
        result
    }

    /// Disable every counter and drop the freeze configuration
    pub fn cleanup(&self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        for control in &self.counter_control {
            control.write(0)?;
        }
        if let Some(fixed) = &self.fixed_control {
            fixed.write(0)?;
        }
        self.write_unit(0)
    }
}

/// One counter of an accelerator PMU with its filter registers
pub struct IdxCounter {
    pub control: RegisterRef,
    pub value: RegisterRef,
    pub filters: Vec<RegisterRef>,
}

/// Event configuration for one accelerator counter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdxEvent {
    pub config: u64,
    pub filters: Vec<u64>,
}

/// Data streaming / analytics accelerator PMU
///
/// Freeze and reset act on per-counter bit masks; the general control
/// register carries the global enable.
pub struct IdxPmu {
    reset_control: RegisterRef,
    freeze_control: RegisterRef,
    general_control: RegisterRef,
    counters: Vec<IdxCounter>,
    generation: u64,
}

const IDX_RESET_CONFIG: u64 = 1 << 0;
const IDX_RESET_COUNTERS: u64 = 1 << 1;
const IDX_ENABLE: u64 = 1;

impl IdxPmu {
    pub fn new(
        reset_control: RegisterRef,
        freeze_control: RegisterRef,
        general_control: RegisterRef,
        counters: Vec<IdxCounter>,
    ) -> Self {
        Self {
            reset_control,
            freeze_control,
            general_control,
            counters,
            generation: 0,
        }
    }

    fn mask(&self) -> u64 {
        pmuflow_raw::counter_mask(self.counters.len() as u32)
    }

    pub fn counters(&self) -> usize {
        self.counters.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn freeze(&self) -> Result<()> {
        self.freeze_control.write(self.mask())
    }

    pub fn unfreeze(&self) -> Result<()> {
        self.freeze_control.write(0)
    }

    pub fn reset_unfreeze(&self) -> Result<()> {
        self.reset_control.write(IDX_RESET_COUNTERS)?;
        self.unfreeze()
    }

    pub fn program(&mut self, events: &[IdxEvent]) -> Result<()> {
        self.freeze()?;
        self.reset_control.write(IDX_RESET_CONFIG)?;
        for (counter, event) in self.counters.iter().zip(events) {
            for (reg, &value) in counter.filters.iter().zip(&event.filters) {
                reg.write(value)?;
            }
            counter.control.write(event.config | IDX_ENABLE)?;
        }
        self.general_control.write(IDX_ENABLE)?;
        self.reset_unfreeze()?;
        self.generation += 1;
        Ok(())
    }

    pub fn read_frozen(&self) -> Result<Vec<u64>> {
        self.freeze()?;
        let values = self
            .counters
            .iter()
            .map(|c| c.value.read())
            .collect::<Result<Vec<_>>>();
        self.unfreeze()?;
        values
    }

    pub fn cleanup(&self) -> Result<()> {
        for counter in &self.counters {
            counter.control.write(0)?;
        }
        self.general_control.write(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::mock::{MockMmio, MockMsr};
    use crate::common::platform::{MmioDevice, MsrDevice};
    use crate::common::register::{MmioRegister64, MsrRegister};
    use crate::common::whitelist::{AccessFilter, AllowAll};
    use std::sync::Arc;

    const UNIT: u64 = 0xE00;

    fn msr_box(msr: &Arc<MockMsr>, layout: UnitControlLayout) -> UncorePmu {
        let device: Arc<dyn MsrDevice> = msr.clone();
        let filter: Arc<dyn AccessFilter> = Arc::new(AllowAll);
        let reg = |addr| MsrRegister::shared(&device, addr, &filter);
        UncorePmu::new(
            Some(reg(UNIT)),
            (0..4).map(|i| reg(0xE01 + i)).collect(),
            (0..4).map(|i| reg(0xE08 + i)).collect(),
            layout,
        )
        .expect("box")
    }

    #[test]
    fn test_mismatched_registers_rejected() {
        let msr = Arc::new(MockMsr::new(0));
        let device: Arc<dyn MsrDevice> = msr;
        let filter: Arc<dyn AccessFilter> = Arc::new(AllowAll);
        let reg = |addr| MsrRegister::shared(&device, addr, &filter);
        let result = UncorePmu::new(
            Some(reg(UNIT)),
            vec![reg(1), reg(2)],
            vec![reg(3)],
            UnitControlLayout::Legacy,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_frozen_reads_do_not_advance() {
        let msr = Arc::new(MockMsr::new(0));
        let regs = msr.registers();
        let layout = UnitControlLayout::Legacy;
        for i in 0..4 {
            regs.set(0xE08 + i, 1000 * i);
            regs.set_increment(0xE08 + i, 7);
        }
        regs.set_freeze_gate(UNIT, layout.freeze());
        let pmu = msr_box(&msr, layout);

        // Running box: each read moves the counter
        let a = pmu.read_counter(0).expect("read");
        let b = pmu.read_counter(0).expect("read");
        assert_ne!(a, b);

        pmu.freeze(layout.base(0)).expect("freeze");
        let first: Vec<u64> = (0..4).map(|i| pmu.read_counter(i).expect("read")).collect();
        let second: Vec<u64> = (0..4).map(|i| pmu.read_counter(i).expect("read")).collect();
        assert_eq!(first, second);
        pmu.unfreeze(layout.base(0)).expect("unfreeze");

        let snap = pmu.read_frozen(layout.base(0)).expect("snapshot");
        assert_eq!(snap.counters[0], first[0]);
        assert_eq!(regs.get(UNIT), layout.base(0));
    }

    #[test]
    fn test_enable_first_programming() {
        let msr = Arc::new(MockMsr::new(0));
        let layout = UnitControlLayout::Legacy;
        let mut pmu = msr_box(&msr, layout);
        let extra = layout.base(0);

        pmu.program(&[0x0304, 0x0C04], extra, ProgramStyle::EnableFirst)
            .expect("program");

        let writes = msr.writes();
        let freeze = extra | layout.freeze();
        assert_eq!(writes[0], (UNIT, freeze));
        assert_eq!(writes[1], (0xE01, UNC_PMON_CTL_EN));
        assert_eq!(writes[2], (0xE01, UNC_PMON_CTL_EN | 0x0304));
        assert_eq!(writes[3], (0xE02, UNC_PMON_CTL_EN));
        assert_eq!(writes[4], (0xE02, UNC_PMON_CTL_EN | 0x0C04));
        assert_eq!(writes[5], (UNIT, freeze | layout.reset_counters()));
        // All four counters zeroed before the final unfreeze
        assert!((0..4).all(|i| writes.contains(&(0xE08 + i, 0))));
        assert_eq!(writes.last(), Some(&(UNIT, extra)));
        assert_eq!(pmu.generation(), 1);
    }

    #[test]
    fn test_direct_programming_single_write() {
        let msr = Arc::new(MockMsr::new(0));
        let mut pmu = msr_box(&msr, UnitControlLayout::IcxPlus);
        pmu.program(&[0x01], 0, ProgramStyle::Direct).expect("program");

        let control_writes: Vec<_> = msr
            .writes()
            .into_iter()
            .filter(|(addr, _)| *addr == 0xE01)
            .collect();
        // the encoding is written as is, enable bit or not
        assert_eq!(control_writes, vec![(0xE01, 0x01)]);
    }

    #[test]
    fn test_init_freeze_check_invalidates() {
        let msr = Arc::new(MockMsr::new(0));
        let layout = UnitControlLayout::Legacy;
        let mut pmu = msr_box(&msr, layout);
        assert!(pmu.init_freeze(layout.base(0), true).expect("init"));
        assert!(pmu.valid());

        // A unit control that ignores writes (reads back zero)
        let device: Arc<dyn MsrDevice> = Arc::new(StuckMsr);
        let filter: Arc<dyn AccessFilter> = Arc::new(AllowAll);
        let mut stuck = UncorePmu::new(
            Some(MsrRegister::shared(&device, UNIT, &filter)),
            vec![],
            vec![],
            layout,
        )
        .expect("box");
        assert!(!stuck.init_freeze(layout.base(0), true).expect("init"));
        assert!(!stuck.valid());
        // Invalid boxes are skipped silently
        stuck.program(&[1], 0, ProgramStyle::Direct).expect("noop");
        assert_eq!(stuck.read_frozen(0).expect("noop"), BoxSnapshot::default());
    }

    struct StuckMsr;

    impl MsrDevice for StuckMsr {
        fn cpu(&self) -> u32 {
            0
        }
        fn read(&self, _addr: u64) -> Result<u64> {
            Ok(0)
        }
        fn write(&self, _addr: u64, _value: u64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_idx_program_and_freeze() {
        let window = Arc::new(MockMmio::new(0x400));
        let mmio: Arc<dyn MmioDevice> = window.clone();
        let reg = |off| -> RegisterRef { Arc::new(MmioRegister64::new(Arc::clone(&mmio), off)) };
        let counters = (0..2)
            .map(|i| IdxCounter {
                control: reg(0x100 + 8 * i),
                value: reg(0x200 + 8 * i),
                filters: vec![reg(0x300 + 0x20 * i)],
            })
            .collect();
        let mut pmu = IdxPmu::new(reg(0x10), reg(0x20), reg(0x30), counters);

        pmu.program(&[IdxEvent {
            config: 0x0102_0000,
            filters: vec![0xFF],
        }])
        .expect("program");

        assert_eq!(window.get64(0x100), 0x0102_0001);
        assert_eq!(window.get64(0x300), 0xFF);
        assert_eq!(window.get64(0x30), 1);
        assert_eq!(window.get64(0x20), 0);
        assert_eq!(pmu.generation(), 1);

        window.set64(0x208, 55);
        assert_eq!(pmu.read_frozen().expect("read"), vec![0, 55]);
    }
}
