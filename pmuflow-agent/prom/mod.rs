pub mod core;
pub mod link;
pub mod socket;
pub mod uncore;

pub use self::core::{CoreMetric, CoreMetricExporter};
pub use link::{LinkMetric, LinkMetricExporter};
pub use socket::{SocketMetric, SocketMetricExporter};
pub use uncore::{UncoreMetric, UncoreMetricExporter};

/// Negative values are the "cannot be computed" sentinel of the derived
/// metrics; those gauges keep their previous value.
pub(crate) fn valid(value: f64) -> Option<f64> {
    (value >= 0.0).then_some(value)
}

pub(crate) fn per_second(value: u64, seconds: f64) -> Option<f64> {
    (seconds > 0.0).then(|| value as f64 / seconds)
}
