use prometheus::{Gauge, Registry};
use std::collections::HashMap;
use std::sync::Arc;

use pmuflow_raw::arch::slot;

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::metrics::derived::*;
use crate::metrics::state::{ServerUncoreCounterState, UnitKind};
use crate::orchestrator::{Coordinator, CounterStates};
use crate::prom::{per_second, valid};

metric_enum! {
    pub enum UncoreMetric {
        McChannelReadBandwidth => "McChannelReadBytesPerSecond",
        McChannelWriteBandwidth => "McChannelWriteBytesPerSecond",
        IioInboundReadBandwidth => "IioInboundReadBytesPerSecond",
        IioInboundWriteBandwidth => "IioInboundWriteBytesPerSecond",
        IioOutboundReadBandwidth => "IioOutboundReadBytesPerSecond",
        IioOutboundWriteBandwidth => "IioOutboundWriteBytesPerSecond",
        ThermalLimitRatio => "ThermalLimitRatio",
        PowerLimitRatio => "PowerLimitRatio",
        ProchotRatio => "ProchotRatio",
        UncoreFrequency => "UncoreFrequencyHz",
        LlcReadMissLatency => "LlcReadMissLatencyNs",
    }
}

impl UncoreMetric {
    pub fn supported(coordinator: &Coordinator) -> Vec<UncoreMetric> {
        UncoreMetric::all()
            .into_iter()
            .filter(|metric| match metric.unit_kind() {
                Some(UnitKind::Mc) => coordinator.memory_traffic_metrics_available(),
                Some(UnitKind::Iio) => coordinator.iio_traffic_metrics_available(),
                _ => match metric {
                    // CHA clocks drive the frequency
                    UncoreMetric::UncoreFrequency | UncoreMetric::LlcReadMissLatency => {
                        coordinator.llc_miss_latency_metrics_available()
                    }
                    _ => coordinator.uncore_frequency_metrics_available(),
                },
            })
            .collect()
    }

    /// Unit family the metric is reported per instance of; `None` for
    /// socket-wide metrics
    pub fn unit_kind(&self) -> Option<UnitKind> {
        match self {
            UncoreMetric::McChannelReadBandwidth | UncoreMetric::McChannelWriteBandwidth => {
                Some(UnitKind::Mc)
            }
            UncoreMetric::IioInboundReadBandwidth
            | UncoreMetric::IioInboundWriteBandwidth
            | UncoreMetric::IioOutboundReadBandwidth
            | UncoreMetric::IioOutboundWriteBandwidth => Some(UnitKind::Iio),
            _ => None,
        }
    }

    fn unit_label(kind: UnitKind) -> &'static str {
        match kind {
            UnitKind::Mc => "channel",
            UnitKind::Iio => "stack",
            _ => "unit",
        }
    }

    fn value(
        &self,
        unit: usize,
        before: &ServerUncoreCounterState,
        after: &ServerUncoreCounterState,
        nominal_hz: u64,
        seconds: f64,
    ) -> Option<f64> {
        match self {
            UncoreMetric::McChannelReadBandwidth => {
                per_second(get_mc_channel_read_bytes(unit, before, after), seconds)
            }
            UncoreMetric::McChannelWriteBandwidth => {
                per_second(get_mc_channel_write_bytes(unit, before, after), seconds)
            }
            UncoreMetric::IioInboundReadBandwidth => per_second(
                get_iio_stack_bytes(unit, slot::IIO_IN_READ, before, after),
                seconds,
            ),
            UncoreMetric::IioInboundWriteBandwidth => per_second(
                get_iio_stack_bytes(unit, slot::IIO_IN_WRITE, before, after),
                seconds,
            ),
            UncoreMetric::IioOutboundReadBandwidth => per_second(
                get_iio_stack_bytes(unit, slot::IIO_OUT_READ, before, after),
                seconds,
            ),
            UncoreMetric::IioOutboundWriteBandwidth => per_second(
                get_iio_stack_bytes(unit, slot::IIO_OUT_WRITE, before, after),
                seconds,
            ),
            UncoreMetric::ThermalLimitRatio => valid(get_thermal_limit_ratio(before, after)),
            UncoreMetric::PowerLimitRatio => valid(get_power_limit_ratio(before, after)),
            UncoreMetric::ProchotRatio => valid(get_prochot_ratio(before, after)),
            UncoreMetric::UncoreFrequency => {
                valid(get_uncore_frequency(before, after, nominal_hz))
            }
            UncoreMetric::LlcReadMissLatency => {
                valid(get_llc_read_miss_latency(before, after, nominal_hz))
            }
        }
    }
}

/// Server uncore gauges, per memory channel, per IIO stack or per socket
pub struct UncoreMetricExporter {
    registry: Arc<Registry>,
    /// `(socket id, unit) -> gauge`; socket-wide metrics use unit 0
    unit_gauges: HashMap<UncoreMetric, HashMap<(u32, usize), Gauge>>,
}

impl UncoreMetricExporter {
    /// `sockets` are socket ids in index order, `slots(kind)` the unit
    /// count of each socket in the same order
    pub fn new(
        config: &MonitorConfig,
        metrics: &[UncoreMetric],
        sockets: &[u32],
        slots: impl Fn(UnitKind) -> Vec<usize>,
    ) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let mut unit_gauges = HashMap::new();

        for &metric in metrics {
            let opts = prometheus::Opts::new(
                metric.name(),
                format!("Uncore {} measurement", metric.name()),
            );
            let counts = metric.unit_kind().map(&slots);

            let mut unit_map = HashMap::new();
            for (index, &socket_id) in sockets.iter().enumerate() {
                if !config.sockets.contains(&socket_id) {
                    continue;
                }
                let socket_opts = opts.clone().const_label("socket", socket_id.to_string());
                match (metric.unit_kind(), &counts) {
                    (Some(kind), Some(counts)) => {
                        for unit in 0..counts.get(index).copied().unwrap_or(0) {
                            let gauge = Gauge::with_opts(
                                socket_opts
                                    .clone()
                                    .const_label(UncoreMetric::unit_label(kind), unit.to_string()),
                            )?;
                            registry.register(Box::new(gauge.clone()))?;
                            unit_map.insert((socket_id, unit), gauge);
                        }
                    }
                    _ => {
                        let gauge = Gauge::with_opts(socket_opts)?;
                        registry.register(Box::new(gauge.clone()))?;
                        unit_map.insert((socket_id, 0), gauge);
                    }
                }
            }
            unit_gauges.insert(metric, unit_map);
        }

        Ok(Self {
            registry,
            unit_gauges,
        })
    }

    pub fn update(&self, before: &CounterStates, after: &CounterStates, seconds: f64) {
        let nominal_hz = after.system.nominal_frequency;

        for now in &after.server_uncore {
            let Some(then) = before.server_uncore.iter().find(|s| s.socket == now.socket) else {
                continue;
            };

            for (metric, gauges) in &self.unit_gauges {
                for (&(socket, unit), gauge) in gauges {
                    if socket != now.socket {
                        continue;
                    }
                    if let Some(value) = metric.value(unit, then, now, nominal_hz, seconds) {
                        gauge.set(value);
                    }
                }
            }
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::state::UnitCounters;
    use crate::prom::testing::gauge_value;
    use pmuflow_raw::Availability;

    fn unit(counters: Vec<u64>) -> UnitCounters {
        UnitCounters {
            present: true,
            counters,
            fixed: 0,
        }
    }

    fn server(socket: u32, reads: u64, thermal: u64) -> ServerUncoreCounterState {
        ServerUncoreCounterState {
            availability: Availability::all(),
            socket,
            generation: 1,
            mc: vec![unit(vec![reads, 0, 0, 0]), UnitCounters::absent()],
            pcu: vec![unit(vec![1000, thermal, 0, 0])],
            ..Default::default()
        }
    }

    fn states(server_uncore: Vec<ServerUncoreCounterState>) -> CounterStates {
        CounterStates {
            server_uncore,
            ..Default::default()
        }
    }

    fn exporter() -> UncoreMetricExporter {
        let config = MonitorConfig::new(vec![0], vec![]);
        UncoreMetricExporter::new(
            &config,
            &[
                UncoreMetric::McChannelReadBandwidth,
                UncoreMetric::ThermalLimitRatio,
            ],
            &[0],
            |kind| match kind {
                UnitKind::Mc => vec![2],
                _ => vec![],
            },
        )
        .expect("exporter")
    }

    #[test]
    fn test_channel_bandwidth() {
        let exporter = exporter();
        let mut before = server(0, 0, 0);
        before.pcu = vec![unit(vec![0, 0, 0, 0])];
        exporter.update(&states(vec![before]), &states(vec![server(0, 100, 250)]), 0.5);

        let registry = exporter.registry();
        assert_eq!(
            gauge_value(
                &registry,
                "McChannelReadBytesPerSecond",
                &[("socket", "0"), ("channel", "0")]
            ),
            Some(12_800.0)
        );
        // absent channel reports nothing
        assert_eq!(
            gauge_value(
                &registry,
                "McChannelReadBytesPerSecond",
                &[("socket", "0"), ("channel", "1")]
            ),
            Some(0.0)
        );
        let thermal =
            gauge_value(&registry, "ThermalLimitRatio", &[("socket", "0")]).expect("gauge");
        assert!((thermal - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_reprogrammed_socket_is_skipped() {
        let exporter = exporter();
        let mut before = server(0, 0, 0);
        before.generation = 0;
        exporter.update(&states(vec![before]), &states(vec![server(0, 100, 0)]), 1.0);

        // a reprogrammed interval has no PCU clocks, so the ratio is left alone
        assert_eq!(
            gauge_value(&exporter.registry(), "ThermalLimitRatio", &[("socket", "0")]),
            Some(0.0)
        );
        assert_eq!(
            gauge_value(
                &exporter.registry(),
                "McChannelReadBytesPerSecond",
                &[("channel", "0")]
            ),
            Some(0.0)
        );
    }
}
