//! RAPL (Running Average Power Limit) energy registers
//!
//! The energy status MSRs are 32-bit free-running counters that wrap in
//! minutes under load, so the agent always reads them through a width
//! extender.
//!
//! ## References
//!
//! - Intel® 64 and IA-32 Architectures Software Developer's Manual, Volume 3B
//! - Section 15.10: Platform Specific Power Management Support

use crate::register::RegisterLayout;

/// Width of the energy status counters
pub const ENERGY_STATUS_WIDTH_BITS: u32 = 32;

pub mod msr {
    pub const MSR_RAPL_POWER_UNIT: u64 = 0x606;
    pub const MSR_PKG_ENERGY_STATUS: u64 = 0x611;
    pub const MSR_DRAM_ENERGY_STATUS: u64 = 0x619;
    pub const MSR_PP0_ENERGY_STATUS: u64 = 0x639;
    pub const MSR_PP1_ENERGY_STATUS: u64 = 0x641;
    pub const MSR_PKG_POWER_INFO: u64 = 0x614;
}

/// MSR_RAPL_POWER_UNIT layout
///
/// | Bits   | Field        |
/// |--------|--------------|
/// | 0-3    | power_units  |
/// | 8-12   | energy_units |
/// | 16-19  | time_units   |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaplPowerUnit {
    pub power_units: u8,
    pub energy_units: u8,
    pub time_units: u8,
}

impl RegisterLayout for RaplPowerUnit {
    fn to_raw(&self) -> u64 {
        (self.power_units as u64 & 0x0F)
            | ((self.energy_units as u64 & 0x1F) << 8)
            | ((self.time_units as u64 & 0x0F) << 16)
    }

    fn from_raw(value: u64) -> Self {
        Self {
            power_units: (value & 0x0F) as u8,
            energy_units: ((value >> 8) & 0x1F) as u8,
            time_units: ((value >> 16) & 0x0F) as u8,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.power_units > 15 {
            return Err("Power units must be <= 15 (4 bits)");
        }
        if self.energy_units > 31 {
            return Err("Energy units must be <= 31 (5 bits)");
        }
        if self.time_units > 15 {
            return Err("Time units must be <= 15 (4 bits)");
        }
        Ok(())
    }
}

impl RaplPowerUnit {
    /// Joules per counter increment
    pub fn joules_per_energy_unit(&self) -> f64 {
        1.0 / (1u64 << self.energy_units) as f64
    }

    /// Watts per power-limit increment
    pub fn watts_per_power_unit(&self) -> f64 {
        1.0 / (1u64 << self.power_units) as f64
    }
}

/// Fixed DRAM energy unit used by server parts (15.3 µJ) regardless of
/// MSR_RAPL_POWER_UNIT
pub const SERVER_DRAM_JOULES_PER_UNIT: f64 = 1.0 / 65536.0;

/// Thermal design power in watts from MSR_PKG_POWER_INFO
pub fn package_tdp_watts(power_info: u64, unit: &RaplPowerUnit) -> f64 {
    (power_info & 0x7FFF) as f64 * unit.watts_per_power_unit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_unit_decoding() {
        // Typical Skylake-SP value: power 1/8 W, energy 1/16384 J, time 1/1024 s
        let unit = RaplPowerUnit::from_raw(0x000A_0E03);
        assert_eq!(unit.power_units, 3);
        assert_eq!(unit.energy_units, 14);
        assert_eq!(unit.time_units, 10);
        assert_eq!(unit.joules_per_energy_unit(), 1.0 / 16384.0);
        assert!(unit.validate().is_ok());
    }

    #[test]
    fn test_package_tdp() {
        let unit = RaplPowerUnit {
            power_units: 3,
            ..Default::default()
        };
        assert_eq!(package_tdp_watts(1640, &unit), 205.0);
    }
}
