pub mod collector;
pub mod coordinator;
pub mod raw_event;

pub use collector::{CollectorConfig, MetricCollector};
pub use coordinator::{Coordinator, CounterStates};
pub use raw_event::{PmuType, RawEventConfig};
