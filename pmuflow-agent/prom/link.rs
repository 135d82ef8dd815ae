use prometheus::{Gauge, Registry};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::metrics::derived::*;
use crate::metrics::state::{SystemCounterState, UnitKind};
use crate::orchestrator::{Coordinator, CounterStates};
use crate::prom::{per_second, valid};

metric_enum! {
    pub enum LinkMetric {
        IncomingBandwidth => "XpiIncomingBytesPerSecond",
        OutgoingBandwidth => "XpiOutgoingBytesPerSecond",
        IncomingUtilization => "XpiIncomingUtilization",
        OutgoingUtilization => "XpiOutgoingUtilization",
        PowerStateResidency => "XpiPowerStateResidency",
        CxlMemWriteBandwidth => "CxlMemWriteBytesPerSecond",
        CxlCacheWriteBandwidth => "CxlCacheWriteBytesPerSecond",
    }
}

impl LinkMetric {
    pub fn supported(coordinator: &Coordinator) -> Vec<LinkMetric> {
        LinkMetric::all()
            .into_iter()
            .filter(|metric| match metric {
                LinkMetric::IncomingBandwidth | LinkMetric::IncomingUtilization => {
                    coordinator.incoming_xpi_traffic_metrics_available()
                }
                LinkMetric::OutgoingBandwidth | LinkMetric::OutgoingUtilization => {
                    coordinator.outgoing_xpi_traffic_metrics_available()
                }
                LinkMetric::PowerStateResidency => {
                    coordinator.incoming_xpi_traffic_metrics_available()
                }
                LinkMetric::CxlMemWriteBandwidth | LinkMetric::CxlCacheWriteBandwidth => {
                    coordinator.cxl_traffic_metrics_available()
                }
            })
            .collect()
    }

    /// Unit family whose instances the metric is reported for
    pub fn unit_kind(&self) -> UnitKind {
        match self {
            LinkMetric::CxlMemWriteBandwidth | LinkMetric::CxlCacheWriteBandwidth => UnitKind::Cxl,
            _ => UnitKind::Xpi,
        }
    }

    fn value(
        &self,
        socket: usize,
        link: usize,
        before: &SystemCounterState,
        after: &SystemCounterState,
        seconds: f64,
    ) -> Option<f64> {
        match self {
            LinkMetric::IncomingBandwidth => {
                per_second(get_incoming_xpi_link_bytes(socket, link, before, after), seconds)
            }
            LinkMetric::OutgoingBandwidth => {
                per_second(get_outgoing_xpi_link_bytes(socket, link, before, after), seconds)
            }
            LinkMetric::IncomingUtilization => {
                valid(get_incoming_xpi_link_utilization(socket, link, before, after))
            }
            LinkMetric::OutgoingUtilization => {
                valid(get_outgoing_xpi_link_utilization(socket, link, before, after))
            }
            LinkMetric::PowerStateResidency => {
                valid(get_normalized_xpi_power_cycles(socket, link, before, after))
            }
            LinkMetric::CxlMemWriteBandwidth => {
                per_second(get_cxl_write_mem_bytes(socket, link, before, after), seconds)
            }
            LinkMetric::CxlCacheWriteBandwidth => {
                per_second(get_cxl_write_cache_bytes(socket, link, before, after), seconds)
            }
        }
    }
}

/// Per-link gauges of the inter-socket and CXL ports, labelled `socket` and
/// `link`
pub struct LinkMetricExporter {
    registry: Arc<Registry>,
    /// `(socket index, link) -> gauge`
    link_gauges: HashMap<LinkMetric, HashMap<(usize, usize), Gauge>>,
}

impl LinkMetricExporter {
    /// `sockets` are socket ids in index order, `slots(kind)` the unit
    /// count of each socket in the same order
    pub fn new(
        config: &MonitorConfig,
        metrics: &[LinkMetric],
        sockets: &[u32],
        slots: impl Fn(UnitKind) -> Vec<usize>,
    ) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let mut link_gauges = HashMap::new();

        for &metric in metrics {
            let opts =
                prometheus::Opts::new(metric.name(), format!("Link {} measurement", metric.name()));
            let counts = slots(metric.unit_kind());

            let mut link_map = HashMap::new();
            for (index, &socket_id) in sockets.iter().enumerate() {
                if !config.sockets.contains(&socket_id) {
                    continue;
                }
                for link in 0..counts.get(index).copied().unwrap_or(0) {
                    let gauge = Gauge::with_opts(
                        opts.clone()
                            .const_label("socket", socket_id.to_string())
                            .const_label("link", link.to_string()),
                    )?;
                    registry.register(Box::new(gauge.clone()))?;
                    link_map.insert((index, link), gauge);
                }
            }
            link_gauges.insert(metric, link_map);
        }

        Ok(Self {
            registry,
            link_gauges,
        })
    }

    pub fn update(&self, before: &CounterStates, after: &CounterStates, seconds: f64) {
        for (metric, gauges) in &self.link_gauges {
            for (&(socket, link), gauge) in gauges {
                if let Some(value) = metric.value(socket, link, &before.system, &after.system, seconds)
                {
                    gauge.set(value);
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
    use crate::prom::testing::gauge_value;
    use pmuflow_raw::Availability;

    fn system(flits: [u64; 2], tsc: u64) -> SystemCounterState {
        let mut system = SystemCounterState {
            incoming_xpi_flits: vec![vec![flits[0], 0], vec![flits[1], 0]],
            outgoing_xpi_flits: vec![vec![0, 0], vec![0, 0]],
            xpi_bytes_per_flit: 8.0,
            xpi_link_speed: 1_000_000,
            nominal_frequency: 1_000,
            ..Default::default()
        };
        system.basic.availability = Availability::all();
        system.uncore.availability = Availability::all();
        // summed over both sockets
        system.uncore.invariant_tsc = tsc * 2;
        system
    }

    fn states(system: SystemCounterState) -> CounterStates {
        CounterStates {
            system,
            ..Default::default()
        }
    }

    fn exporter(sockets: Vec<u32>) -> LinkMetricExporter {
        let config = MonitorConfig::new(sockets, vec![]);
        LinkMetricExporter::new(
            &config,
            &[LinkMetric::IncomingBandwidth, LinkMetric::IncomingUtilization],
            &[0, 1],
            |kind| match kind {
                UnitKind::Xpi => vec![2, 2],
                _ => vec![],
            },
        )
        .expect("exporter")
    }

    #[test]
    fn test_link_bandwidth_and_utilization() {
        let exporter = exporter(vec![0, 1]);
        // one second of TSC at 1 kHz nominal
        exporter.update(
            &states(system([0, 0], 0)),
            &states(system([50_000, 125_000], 1_000)),
            1.0,
        );

        let registry = exporter.registry();
        assert_eq!(
            gauge_value(
                &registry,
                "XpiIncomingBytesPerSecond",
                &[("socket", "1"), ("link", "0")]
            ),
            Some(1_000_000.0)
        );
        let utilization = gauge_value(
            &registry,
            "XpiIncomingUtilization",
            &[("socket", "0"), ("link", "0")],
        )
        .expect("gauge");
        assert!((utilization - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_only_selected_sockets_are_registered() {
        let exporter = exporter(vec![1]);
        let registry = exporter.registry();
        assert!(gauge_value(&registry, "XpiIncomingBytesPerSecond", &[("socket", "0")]).is_none());
        assert!(gauge_value(
            &registry,
            "XpiIncomingBytesPerSecond",
            &[("socket", "1"), ("link", "1")]
        )
        .is_some());
    }
}
