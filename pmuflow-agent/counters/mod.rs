pub mod client_imc;
pub mod core_pmu;
pub mod rapl;
pub mod rdt;
pub mod resctrl;
pub mod server_uncore;
pub mod uncore_pmu;
pub mod width_extender;

use std::time::Duration;

use crate::error::Result;
use width_extender::{CounterWidthExtender, RawCounter};

pub use client_imc::{ClientImcCounters, ClientImcSample};
pub use core_pmu::{CoreEventConfig, CorePmu};
pub use rapl::RaplCounters;
pub use rdt::{MsrQosMonitor, QosMonitor, QosSample};
pub use resctrl::ResctrlMonitor;
pub use server_uncore::{RegisterLocations, ServerUncorePmus};
pub use uncore_pmu::{IdxEvent, IdxPmu, UncorePmu};
pub use width_extender::WidthExtendedRegister;

/// Threaded extender when a cadence is given, manual otherwise
pub(crate) fn extender(
    counter: Box<dyn RawCounter>,
    width: u32,
    cadence: Option<Duration>,
) -> Result<CounterWidthExtender> {
    match cadence {
        Some(delay) => CounterWidthExtender::new(counter, width, delay),
        None => CounterWidthExtender::manual(counter, width),
    }
}
