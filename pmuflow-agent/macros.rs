//! Declarative macros shared by the exporters

/// Define a metric enum with automatic `name()` and `all()` implementations
///
/// # Example
/// ```
/// use pmuflow::metric_enum;
///
/// metric_enum! {
///     pub enum PowerMetric {
///         PackagePower => "PackagePowerWatts",
///         DramPower => "DramPowerWatts",
///     }
/// }
///
/// let metric = PowerMetric::PackagePower;
/// assert_eq!(metric.name(), "PackagePowerWatts");
/// assert_eq!(PowerMetric::all().len(), 2);
/// ```
///
/// Expands to:
/// - An enum with Debug, Clone, Copy, PartialEq, Eq, Hash derives
/// - A `name(&self) -> &'static str` method
/// - An `all() -> Vec<Self>` method
#[macro_export]
macro_rules! metric_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $str:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant,)*
        }

        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $str,)*
                }
            }

            pub fn all() -> Vec<$name> {
                vec![$($name::$variant,)*]
            }
        }
    };
}

/// Initialize an exporter when `$enabled` holds, logging failures
///
/// # Example
/// ```ignore
/// // In orchestrator::collector::MetricCollector::new()
/// init_exporter!(
///     collector,
///     coordinator.incoming_xpi_traffic_metrics_available(),
///     XpiMetricExporter::new(&config, &links),
///     xpi_exporter,
///     "xPI link"
/// );
/// ```
#[macro_export]
macro_rules! init_exporter {
    (
        $collector:expr,
        $enabled:expr,
        $ctor:expr,
        $field:ident,
        $name:literal
    ) => {
        if $enabled {
            match $ctor {
                Ok(exporter) => {
                    $collector.$field = Some(exporter);
                    tracing::info!(concat!($name, " exporter initialized"));
                }
                Err(e) => {
                    tracing::error!(concat!("Failed to initialize ", $name, " exporter: {}"), e);
                }
            }
        }
    };
}

/// Gather metrics from an exporter's registry
///
/// # Example
/// ```ignore
/// // In the /metrics handler
/// let mut buffer = Vec::new();
/// gather_metrics!(buffer, encoder, exporters.core, "Core");
/// ```
#[macro_export]
macro_rules! gather_metrics {
    ($buffer:expr, $encoder:expr, $exporter:expr, $name:literal) => {
        if let Some(ref exporter) = $exporter {
            let metric_families = exporter.registry().gather();
            if let Err(e) = $encoder.encode(&metric_families, &mut $buffer) {
                tracing::error!(concat!("Failed to encode ", $name, " metrics: {}"), e);
            }
        }
    };
}
