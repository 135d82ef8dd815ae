//! Package and DRAM energy counters
//!
//! The energy status MSRs are 32 bits wide and wrap within minutes under
//! load, so each one sits behind a width extender.

use std::sync::Arc;
use std::time::Duration;

use pmuflow_raw::arch::rapl::{
    msr, RaplPowerUnit, ENERGY_STATUS_WIDTH_BITS, SERVER_DRAM_JOULES_PER_UNIT,
};
use pmuflow_raw::{ArchDescriptor, Availability, RegisterLayout};

use crate::common::platform::MsrDevice;
use crate::common::register::{MsrRegister, RegisterRef};
use crate::common::whitelist::AccessFilter;
use crate::counters::extender;
use crate::counters::width_extender::CounterWidthExtender;
use crate::error::Result;

struct SocketEnergy {
    package: Option<CounterWidthExtender>,
    dram: Option<CounterWidthExtender>,
}

pub struct RaplCounters {
    sockets: Vec<SocketEnergy>,
    joules_per_energy_unit: f64,
    dram_joules_per_energy_unit: f64,
}

impl RaplCounters {
    /// `msrs` holds one MSR handle per socket, on a core of that socket
    pub fn new(
        msrs: &[Arc<dyn MsrDevice>],
        filter: &Arc<dyn AccessFilter>,
        descriptor: &ArchDescriptor,
        cadence: Option<Duration>,
    ) -> Result<Self> {
        let unit = match msrs.first() {
            Some(msr) => RaplPowerUnit::from_raw(msr.read(msr::MSR_RAPL_POWER_UNIT)?),
            None => RaplPowerUnit::default(),
        };
        let joules_per_energy_unit = unit.joules_per_energy_unit();
        let dram_joules_per_energy_unit = if descriptor.model.is_server() {
            SERVER_DRAM_JOULES_PER_UNIT
        } else {
            joules_per_energy_unit
        };
        tracing::info!(
            "RAPL energy unit {:.3e} J, DRAM {:.3e} J",
            joules_per_energy_unit,
            dram_joules_per_energy_unit
        );

        let open = |msr: &Arc<dyn MsrDevice>, addr: u64| -> Option<CounterWidthExtender> {
            let register: RegisterRef = MsrRegister::shared(msr, addr, filter);
            match extender(Box::new(register), ENERGY_STATUS_WIDTH_BITS, cadence) {
                Ok(ext) => Some(ext),
                Err(e) => {
                    tracing::warn!("Energy counter 0x{:x} on CPU {} unusable: {}", addr, msr.cpu(), e);
                    None
                }
            }
        };

        let sockets = msrs
            .iter()
            .map(|msr| SocketEnergy {
                package: descriptor
                    .is_available(Availability::PACKAGE_ENERGY)
                    .then(|| open(msr, msr::MSR_PKG_ENERGY_STATUS))
                    .flatten(),
                dram: descriptor
                    .is_available(Availability::DRAM_ENERGY)
                    .then(|| open(msr, msr::MSR_DRAM_ENERGY_STATUS))
                    .flatten(),
            })
            .collect();

        Ok(Self {
            sockets,
            joules_per_energy_unit,
            dram_joules_per_energy_unit,
        })
    }

    pub fn joules_per_energy_unit(&self) -> f64 {
        self.joules_per_energy_unit
    }

    pub fn dram_joules_per_energy_unit(&self) -> f64 {
        self.dram_joules_per_energy_unit
    }

    /// Extended (package, DRAM) energy counts of `socket`; 0 when absent.
    /// A failed read repeats the last count.
    pub fn energy(&self, socket: usize) -> (u64, u64) {
        let Some(energy) = self.sockets.get(socket) else {
            return (0, 0);
        };
        let read = |ext: &Option<CounterWidthExtender>| {
            ext.as_ref().map_or(0, CounterWidthExtender::read_or_last)
        };
        (read(&energy.package), read(&energy.dram))
    }
}
