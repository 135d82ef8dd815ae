use prometheus::{Gauge, Registry};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::metrics::derived::*;
use crate::metrics::state::SocketCounterState;
use crate::orchestrator::{Coordinator, CounterStates};
use crate::prom::{per_second, valid};

metric_enum! {
    pub enum SocketMetric {
        Ipc => "SocketIPC",
        MemoryReadBandwidth => "MemoryReadBytesPerSecond",
        MemoryWriteBandwidth => "MemoryWriteBytesPerSecond",
        PmmReadBandwidth => "PmmReadBytesPerSecond",
        PmmWriteBandwidth => "PmmWriteBytesPerSecond",
        EdcReadBandwidth => "EdcReadBytesPerSecond",
        EdcWriteBandwidth => "EdcWriteBytesPerSecond",
        IoRequestBandwidth => "IoRequestBytesPerSecond",
        PackagePower => "PackagePowerWatts",
        DramPower => "DramPowerWatts",
        UncoreClocks => "UncoreClocks",
        LocalMemoryRequestRatio => "LocalMemoryRequestRatio",
        NearMemoryHitRate => "NearMemoryHitRate",
    }
}

const C_STATE_METRIC: &str = "PackageCStateResidency";

impl SocketMetric {
    pub fn supported(coordinator: &Coordinator) -> Vec<SocketMetric> {
        SocketMetric::all()
            .into_iter()
            .filter(|metric| match metric {
                SocketMetric::Ipc => true,
                SocketMetric::MemoryReadBandwidth | SocketMetric::MemoryWriteBandwidth => {
                    coordinator.memory_traffic_metrics_available()
                }
                SocketMetric::PmmReadBandwidth | SocketMetric::PmmWriteBandwidth => {
                    coordinator.pmm_traffic_metrics_available()
                }
                SocketMetric::EdcReadBandwidth | SocketMetric::EdcWriteBandwidth => {
                    coordinator.edc_traffic_metrics_available()
                }
                SocketMetric::IoRequestBandwidth => coordinator.io_request_metrics_available(),
                SocketMetric::PackagePower => coordinator.package_energy_metrics_available(),
                SocketMetric::DramPower => coordinator.dram_energy_metrics_available(),
                SocketMetric::UncoreClocks => coordinator.uncore_frequency_metrics_available(),
                SocketMetric::LocalMemoryRequestRatio => coordinator.home_agent_metrics_available(),
                SocketMetric::NearMemoryHitRate => coordinator.near_memory_metrics_available(),
            })
            .collect()
    }

    fn value(&self, before: &SocketCounterState, after: &SocketCounterState, seconds: f64) -> Option<f64> {
        match self {
            SocketMetric::Ipc => valid(get_ipc(before, after)),
            SocketMetric::MemoryReadBandwidth => {
                per_second(get_bytes_read_from_mc(before, after), seconds)
            }
            SocketMetric::MemoryWriteBandwidth => {
                per_second(get_bytes_written_to_mc(before, after), seconds)
            }
            SocketMetric::PmmReadBandwidth => {
                per_second(get_bytes_read_from_pmm(before, after), seconds)
            }
            SocketMetric::PmmWriteBandwidth => {
                per_second(get_bytes_written_to_pmm(before, after), seconds)
            }
            SocketMetric::EdcReadBandwidth => {
                per_second(get_bytes_read_from_edc(before, after), seconds)
            }
            SocketMetric::EdcWriteBandwidth => {
                per_second(get_bytes_written_to_edc(before, after), seconds)
            }
            SocketMetric::IoRequestBandwidth => {
                per_second(get_io_request_bytes_from_mc(before, after), seconds)
            }
            SocketMetric::PackagePower => {
                (seconds > 0.0).then(|| get_consumed_joules(before, after) / seconds)
            }
            SocketMetric::DramPower => {
                (seconds > 0.0).then(|| get_dram_consumed_joules(before, after) / seconds)
            }
            SocketMetric::UncoreClocks => Some(get_uncore_clocks(before, after) as f64),
            SocketMetric::LocalMemoryRequestRatio => {
                valid(get_local_memory_request_ratio(before, after))
            }
            SocketMetric::NearMemoryHitRate => valid(get_nm_hit_rate(before, after)),
        }
    }
}

/// Per-socket gauges, labelled `socket`
pub struct SocketMetricExporter {
    registry: Arc<Registry>,
    socket_gauges: HashMap<SocketMetric, HashMap<u32, Gauge>>,
    c_state_gauges: HashMap<(u32, usize), Gauge>,
}

impl SocketMetricExporter {
    pub fn new(
        config: &MonitorConfig,
        metrics: &[SocketMetric],
        c_states: &[usize],
    ) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let mut socket_gauges = HashMap::new();
        let mut c_state_gauges = HashMap::new();

        for &metric in metrics {
            let opts = prometheus::Opts::new(
                metric.name(),
                format!("Socket {} measurement", metric.name()),
            );

            let mut socket_map = HashMap::new();
            for &socket_id in &config.sockets {
                let gauge =
                    Gauge::with_opts(opts.clone().const_label("socket", socket_id.to_string()))?;
                registry.register(Box::new(gauge.clone()))?;
                socket_map.insert(socket_id, gauge);
            }
            socket_gauges.insert(metric, socket_map);
        }

        let opts =
            prometheus::Opts::new(C_STATE_METRIC, "Share of time the package spent in a C-state");
        for &socket_id in &config.sockets {
            for &state in c_states {
                let gauge = Gauge::with_opts(
                    opts.clone()
                        .const_label("socket", socket_id.to_string())
                        .const_label("state", format!("C{state}")),
                )?;
                registry.register(Box::new(gauge.clone()))?;
                c_state_gauges.insert((socket_id, state), gauge);
            }
        }

        Ok(Self {
            registry,
            socket_gauges,
            c_state_gauges,
        })
    }

    pub fn update(&self, before: &CounterStates, after: &CounterStates, seconds: f64) {
        for now in &after.sockets {
            let Some(then) = before.sockets.iter().find(|s| s.socket == now.socket) else {
                continue;
            };

            for (metric, gauges) in &self.socket_gauges {
                if let Some(gauge) = gauges.get(&now.socket) {
                    if let Some(value) = metric.value(then, now, seconds) {
                        gauge.set(value);
                    }
                }
            }

            for ((socket, state), gauge) in &self.c_state_gauges {
                if *socket == now.socket {
                    gauge.set(get_package_c_state_residency(*state, then, now));
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
    use crate::metrics::state::UncoreCounterState;
    use crate::prom::testing::gauge_value;
    use pmuflow_raw::Availability;

    fn socket(socket: u32, reads: u64, energy: u64) -> SocketCounterState {
        SocketCounterState {
            socket,
            uncore: UncoreCounterState {
                availability: Availability::all(),
                mc_normal_reads: reads,
                package_energy_status: energy,
                joules_per_energy_unit: 0.5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn states(sockets: Vec<SocketCounterState>) -> CounterStates {
        CounterStates {
            sockets,
            ..Default::default()
        }
    }

    #[test]
    fn test_bandwidth_and_power() {
        let config = MonitorConfig::new(vec![0, 1], vec![]);
        let exporter = SocketMetricExporter::new(
            &config,
            &[SocketMetric::MemoryReadBandwidth, SocketMetric::PackagePower],
            &[],
        )
        .expect("exporter");

        let before = states(vec![socket(0, 0, 0), socket(1, 0, 0)]);
        let after = states(vec![socket(0, 1000, 40), socket(1, 10, 4)]);
        exporter.update(&before, &after, 2.0);

        let registry = exporter.registry();
        assert_eq!(
            gauge_value(&registry, "MemoryReadBytesPerSecond", &[("socket", "0")]),
            Some(32_000.0)
        );
        assert_eq!(
            gauge_value(&registry, "PackagePowerWatts", &[("socket", "1")]),
            Some(1.0)
        );
    }

    #[test]
    fn test_zero_interval_keeps_rates() {
        let config = MonitorConfig::new(vec![0], vec![]);
        let exporter =
            SocketMetricExporter::new(&config, &[SocketMetric::MemoryReadBandwidth], &[])
                .expect("exporter");
        exporter.update(
            &states(vec![socket(0, 0, 0)]),
            &states(vec![socket(0, 10, 0)]),
            0.0,
        );
        assert_eq!(
            gauge_value(&exporter.registry(), "MemoryReadBytesPerSecond", &[("socket", "0")]),
            Some(0.0)
        );
    }

    #[test]
    fn test_package_c_states() {
        let config = MonitorConfig::new(vec![0], vec![]);
        let exporter = SocketMetricExporter::new(&config, &[], &[0, 2]).expect("exporter");

        let before = socket(0, 0, 0);
        let mut after = socket(0, 0, 0);
        after.uncore.invariant_tsc = 1000;
        after.uncore.package_c_state_residency[2] = 400;
        exporter.update(&states(vec![before]), &states(vec![after]), 1.0);

        let registry = exporter.registry();
        let c2 = gauge_value(&registry, C_STATE_METRIC, &[("state", "C2")]).expect("gauge");
        let c0 = gauge_value(&registry, C_STATE_METRIC, &[("state", "C0")]).expect("gauge");
        assert!((c2 - 0.4).abs() < 1e-9);
        assert!((c0 - 0.6).abs() < 1e-9);
    }
}
