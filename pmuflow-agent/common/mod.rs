pub mod affinity;
pub mod cpuid;
pub mod mmio;
#[cfg(test)]
pub mod mock;
pub mod msr;
pub mod pci;
pub mod platform;
pub mod register;
pub mod topology;
pub mod whitelist;

pub use affinity::AffinityGuard;
pub use platform::{LinuxPlatform, MmioDevice, MsrDevice, PciAddress, PciConfigDevice, Platform};
pub use register::{HwRegister, RegisterRef};
pub use topology::Topology;
pub use whitelist::{AccessFilter, AllowAll, RangeFilter};
