//! # pmuflow-raw
//!
//! Hardware register definitions for Intel core and uncore performance
//! monitoring.
//!
//! This crate is pure data: register bit layouts, CPU model identification,
//! one location table per processor generation, and the parser for the
//! hardware uncore discovery table. It never touches hardware; access
//! backends live in `pmuflow-agent`.
//!
//! ## Usage
//!
//! ```ignore
//! use pmuflow_raw::arch::ArchDescriptor;
//! use pmuflow_raw::cpu::{CpuModel, CpuSignature};
//!
//! let model = CpuModel::identify(CpuSignature::from_eax(eax)).expect("supported CPU");
//! let desc = ArchDescriptor::for_model(model);
//! println!("{} memory channels per socket", desc.mc_channels());
//! ```

pub mod arch;
pub mod cpu;
pub mod discovery;
pub mod register;

// Re-export for convenience
pub use arch::{ArchDescriptor, Availability};
pub use cpu::{CpuModel, CpuSignature};
pub use register::{counter_mask, Register, RegisterLayout};
