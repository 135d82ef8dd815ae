//! RDT (Resource Director Technology) monitoring registers
//!
//! Used only when the resctrl filesystem is unavailable. The memory bandwidth
//! monitoring counters are 24 bits wide and wrap within seconds on a busy
//! socket, so they are always width-extended.
//!
//! ## References
//!
//! - Intel® 64 and IA-32 Architectures Software Developer's Manual, Volume 3B
//! - Section 19.18: Intel Resource Director Technology Monitoring Features

use crate::register::RegisterLayout;

/// Width of the MBM counters read through IA32_QM_CTR
pub const MBM_COUNTER_WIDTH_BITS: u32 = 24;

/// Highest RMID the agent hands out
pub const RMID_MAX: u32 = 255;

pub mod msr {
    pub const IA32_QM_EVTSEL: u64 = 0xC8D;
    pub const IA32_QM_CTR: u64 = 0xC8E;
    pub const IA32_PQR_ASSOC: u64 = 0xC8F;
}

/// Monitoring event identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosEvent {
    L3Occupancy = 1,
    TotalMemoryBandwidth = 2,
    LocalMemoryBandwidth = 3,
}

/// IA32_QM_EVTSEL layout
///
/// | Bits   | Field    |
/// |--------|----------|
/// | 0-7    | event_id |
/// | 32-41  | rmid     |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QmEventSelect {
    pub event_id: u8,
    pub rmid: u32,
}

impl QmEventSelect {
    pub fn new(event: QosEvent, rmid: u32) -> Self {
        Self {
            event_id: event as u8,
            rmid,
        }
    }
}

impl RegisterLayout for QmEventSelect {
    fn to_raw(&self) -> u64 {
        (self.event_id as u64) | ((self.rmid as u64 & 0x3FF) << 32)
    }

    fn from_raw(value: u64) -> Self {
        Self {
            event_id: (value & 0xFF) as u8,
            rmid: ((value >> 32) & 0x3FF) as u32,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.rmid > 0x3FF {
            return Err("RMID must be <= 0x3FF (10 bits)");
        }
        Ok(())
    }
}

/// IA32_QM_CTR flags
pub mod qm_ctr {
    /// Data not available for the selected RMID/event
    pub const UNAVAILABLE: u64 = 1 << 62;
    /// Unsupported RMID or event
    pub const ERROR: u64 = 1 << 63;
    /// Counter payload
    pub const DATA_MASK: u64 = (1 << 62) - 1;
}

/// Replace the RMID field (bits 0-9) of an IA32_PQR_ASSOC value
pub const fn pqr_assoc_with_rmid(current: u64, rmid: u32) -> u64 {
    (current & !0x3FF) | (rmid as u64 & 0x3FF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qm_event_select_encoding() {
        let sel = QmEventSelect::new(QosEvent::LocalMemoryBandwidth, 5);
        assert_eq!(sel.to_raw(), (5u64 << 32) | 3);
        assert_eq!(QmEventSelect::from_raw(sel.to_raw()), sel);
    }

    #[test]
    fn test_pqr_assoc_preserves_cos() {
        let cos_bits = 3u64 << 32;
        assert_eq!(pqr_assoc_with_rmid(cos_bits | 0x12, 7), cos_bits | 7);
    }
}
