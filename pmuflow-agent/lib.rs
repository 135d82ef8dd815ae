// Macros (must be first for visibility)
#[macro_use]
pub mod macros;

pub mod common;
pub mod config;
pub mod counters;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod prom;

pub use config::{CoreProgramMode, MonitorConfig, ProgramConfig};
pub use error::{ErrorCode, PmuError, Result};
pub use orchestrator::{
    CollectorConfig, Coordinator, CounterStates, MetricCollector, PmuType, RawEventConfig,
};

pub use prom::{CoreMetricExporter, LinkMetricExporter, SocketMetricExporter, UncoreMetricExporter};
