//! Client memory controller traffic
//!
//! Desktop and mobile parts expose three free-running 32-bit request
//! counters in the MCHBAR window of the host bridge. They are read through
//! MMIO and widened in software.

use std::sync::Arc;
use std::time::Duration;

use pmuflow_raw::arch::ClientImc;

use crate::common::platform::{PciAddress, Platform};
use crate::common::register::{MmioRegister32, RegisterRef};
use crate::counters::extender;
use crate::counters::width_extender::CounterWidthExtender;
use crate::error::{PmuError, Result};

const HOST_BRIDGE: PciAddress = PciAddress {
    group_number: 0,
    bus: 0,
    device: 0,
    function: 0,
};

/// Cache-line request counts since start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientImcSample {
    pub reads: u64,
    pub writes: u64,
    pub io_requests: u64,
}

pub struct ClientImcCounters {
    reads: CounterWidthExtender,
    writes: CounterWidthExtender,
    io_requests: CounterWidthExtender,
}

impl ClientImcCounters {
    pub fn open(platform: &dyn Platform, imc: &ClientImc, cadence: Option<Duration>) -> Result<Self> {
        let bridge = platform.open_pci(HOST_BRIDGE)?;
        let mchbar = bridge.read64(imc.mchbar_offset)? & imc.mchbar_mask;
        if mchbar == 0 {
            return Err(PmuError::MmioError("MCHBAR is not enabled".to_string()));
        }
        tracing::info!("MCHBAR at 0x{:x}", mchbar);

        let window = platform.map_mmio(mchbar + imc.window_offset, imc.window_size)?;
        let counter = |reg: u64| -> Result<CounterWidthExtender> {
            let register: RegisterRef =
                Arc::new(MmioRegister32::new(Arc::clone(&window), reg - imc.window_offset));
            extender(Box::new(register), imc.counter_width, cadence)
        };

        Ok(Self {
            reads: counter(imc.reads)?,
            writes: counter(imc.writes)?,
            io_requests: counter(imc.io_requests)?,
        })
    }

    /// Current counts; a counter that cannot be read repeats its last count
    pub fn sample(&self) -> ClientImcSample {
        ClientImcSample {
            reads: self.reads.read_or_last(),
            writes: self.writes.read_or_last(),
            io_requests: self.io_requests.read_or_last(),
        }
    }
}
