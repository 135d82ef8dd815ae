use prometheus::{Gauge, Registry};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::metrics::derived::*;
use crate::metrics::state::{BasicCounterState, INVALID_QOS_MONITORING_DATA, INVALID_THERMAL_HEADROOM};
use crate::orchestrator::{Coordinator, CounterStates};
use crate::prom::{per_second, valid};

metric_enum! {
    pub enum CoreMetric {
        Ipc => "IPC",
        Instructions => "Instructions",
        Cycles => "Cycles",
        ExecUsage => "ExecUsage",
        RelativeFrequency => "RelativeFrequency",
        AverageFrequency => "AverageFrequencyHz",
        L2CacheHitRatio => "L2CacheHitRatio",
        L3CacheHitRatio => "L3CacheHitRatio",
        L2CacheMisses => "L2CacheMisses",
        L3CacheMisses => "L3CacheMisses",
        L3Occupancy => "L3OccupancyKiB",
        LocalMemoryBandwidth => "LocalMemoryBandwidthBytes",
        RemoteMemoryBandwidth => "RemoteMemoryBandwidthBytes",
        SmiCount => "SMICount",
        ThermalHeadroom => "ThermalHeadroomCelsius",
        FrontendBound => "FrontendBound",
        BadSpeculation => "BadSpeculation",
        BackendBound => "BackendBound",
        Retiring => "Retiring",
    }
}

const C_STATE_METRIC: &str = "CoreCStateResidency";

impl CoreMetric {
    /// Metrics the programmed machine can produce
    pub fn supported(coordinator: &Coordinator) -> Vec<CoreMetric> {
        CoreMetric::all()
            .into_iter()
            .filter(|metric| match metric {
                CoreMetric::L2CacheHitRatio | CoreMetric::L2CacheMisses => {
                    coordinator.l2_cache_metrics_available()
                }
                CoreMetric::L3CacheHitRatio | CoreMetric::L3CacheMisses => {
                    coordinator.l3_cache_metrics_available()
                }
                CoreMetric::L3Occupancy => coordinator.l3_cache_occupancy_metric_available(),
                CoreMetric::LocalMemoryBandwidth => {
                    coordinator.core_local_memory_bw_metric_available()
                }
                CoreMetric::RemoteMemoryBandwidth => {
                    coordinator.core_remote_memory_bw_metric_available()
                }
                CoreMetric::SmiCount => coordinator.smi_count_available(),
                CoreMetric::ThermalHeadroom => coordinator.thermal_headroom_available(),
                CoreMetric::FrontendBound
                | CoreMetric::BadSpeculation
                | CoreMetric::BackendBound
                | CoreMetric::Retiring => coordinator.topdown_metrics_available(),
                _ => true,
            })
            .collect()
    }

    fn value(
        &self,
        before: &BasicCounterState,
        after: &BasicCounterState,
        nominal_hz: u64,
        seconds: f64,
    ) -> Option<f64> {
        match self {
            CoreMetric::Ipc => valid(get_ipc(before, after)),
            CoreMetric::Instructions => Some(get_instructions_retired(before, after) as f64),
            CoreMetric::Cycles => Some(get_cycles(before, after) as f64),
            CoreMetric::ExecUsage => valid(get_exec_usage(before, after)),
            CoreMetric::RelativeFrequency => valid(get_relative_frequency(before, after)),
            CoreMetric::AverageFrequency => {
                valid(get_average_frequency(before, after, nominal_hz))
            }
            CoreMetric::L2CacheHitRatio => valid(get_l2_cache_hit_ratio(before, after)),
            CoreMetric::L3CacheHitRatio => valid(get_l3_cache_hit_ratio(before, after)),
            CoreMetric::L2CacheMisses => Some(get_l2_cache_misses(before, after) as f64),
            CoreMetric::L3CacheMisses => Some(get_l3_cache_misses(before, after) as f64),
            CoreMetric::L3Occupancy => match get_l3_cache_occupancy(after) {
                INVALID_QOS_MONITORING_DATA => None,
                kib => Some(kib as f64),
            },
            CoreMetric::LocalMemoryBandwidth => {
                per_second(get_local_memory_bw(before, after), seconds)
            }
            CoreMetric::RemoteMemoryBandwidth => {
                per_second(get_remote_memory_bw(before, after), seconds)
            }
            CoreMetric::SmiCount => Some(get_smi_count(before, after) as f64),
            CoreMetric::ThermalHeadroom => match get_thermal_headroom(after) {
                INVALID_THERMAL_HEADROOM => None,
                celsius => Some(celsius as f64),
            },
            CoreMetric::FrontendBound => Some(get_frontend_bound(before, after)),
            CoreMetric::BadSpeculation => Some(get_bad_speculation(before, after)),
            CoreMetric::BackendBound => Some(get_backend_bound(before, after)),
            CoreMetric::Retiring => Some(get_retiring(before, after)),
        }
    }
}

/// Per-core gauges, labelled `core` and `core_label`
pub struct CoreMetricExporter {
    registry: Arc<Registry>,
    core_gauges: HashMap<CoreMetric, HashMap<u32, Gauge>>,
    c_state_gauges: HashMap<(u32, usize), Gauge>,
}

impl CoreMetricExporter {
    pub fn new(config: &MonitorConfig, metrics: &[CoreMetric], c_states: &[usize]) -> Result<Self> {
        let mut exporter = Self {
            registry: Arc::new(Registry::new()),
            core_gauges: HashMap::new(),
            c_state_gauges: HashMap::new(),
        };

        exporter.register_metrics(config, metrics)?;
        exporter.register_c_states(config, c_states)?;

        Ok(exporter)
    }

    fn register_metrics(&mut self, config: &MonitorConfig, metrics: &[CoreMetric]) -> Result<()> {
        for &metric in metrics {
            let opts =
                prometheus::Opts::new(metric.name(), format!("Core {} measurement", metric.name()));

            let mut core_map = HashMap::new();
            for &core_id in &config.cores {
                let gauge = Gauge::with_opts(
                    opts.clone()
                        .const_label("core", core_id.to_string())
                        .const_label("core_label", config.label(core_id)),
                )?;
                self.registry.register(Box::new(gauge.clone()))?;
                core_map.insert(core_id, gauge);
            }
            self.core_gauges.insert(metric, core_map);
        }

        Ok(())
    }

    fn register_c_states(&mut self, config: &MonitorConfig, c_states: &[usize]) -> Result<()> {
        let opts = prometheus::Opts::new(C_STATE_METRIC, "Share of time the core spent in a C-state");
        for &core_id in &config.cores {
            for &state in c_states {
                let gauge = Gauge::with_opts(
                    opts.clone()
                        .const_label("core", core_id.to_string())
                        .const_label("core_label", config.label(core_id))
                        .const_label("state", format!("C{state}")),
                )?;
                self.registry.register(Box::new(gauge.clone()))?;
                self.c_state_gauges.insert((core_id, state), gauge);
            }
        }
        Ok(())
    }

    /// Publish the interval between two captures
    pub fn update(&self, before: &CounterStates, after: &CounterStates, seconds: f64) {
        let nominal_hz = after.system.nominal_frequency;

        for (core_id, now) in &after.cores {
            let Some((_, then)) = before.cores.iter().find(|(cpu, _)| cpu == core_id) else {
                continue;
            };

            for (metric, gauges) in &self.core_gauges {
                if let Some(gauge) = gauges.get(core_id) {
                    if let Some(value) = metric.value(then, now, nominal_hz, seconds) {
                        gauge.set(value);
                    }
                }
            }

            for ((core, state), gauge) in &self.c_state_gauges {
                if core == core_id {
                    gauge.set(get_core_c_state_residency(*state, then, now));
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

    fn core(instructions: u64, cycles: u64, tsc: u64) -> BasicCounterState {
        BasicCounterState {
            availability: Availability::all(),
            instructions_retired: instructions,
            cpu_clk_unhalted_thread: cycles,
            cpu_clk_unhalted_ref: cycles,
            invariant_tsc: tsc,
            thermal_headroom: 42,
            ..Default::default()
        }
    }

    fn states(cores: Vec<(u32, BasicCounterState)>) -> CounterStates {
        let mut states = CounterStates {
            cores,
            ..Default::default()
        };
        states.system.nominal_frequency = 2_000_000_000;
        states
    }

    #[test]
    fn test_core_gauges_follow_the_interval() {
        let config = MonitorConfig::new(vec![0], vec![0, 1]);
        let exporter = CoreMetricExporter::new(
            &config,
            &[CoreMetric::Ipc, CoreMetric::Instructions, CoreMetric::ThermalHeadroom],
            &[],
        )
        .expect("exporter");

        let before = states(vec![(0, core(0, 0, 0)), (1, core(0, 0, 0))]);
        let after = states(vec![(0, core(3000, 1500, 2000)), (1, core(10, 0, 2000))]);
        exporter.update(&before, &after, 1.0);

        let registry = exporter.registry();
        let ipc = gauge_value(&registry, "IPC", &[("core", "0")]).expect("gauge");
        assert!((ipc - 2.0).abs() < 1e-9);
        let instructions =
            gauge_value(&registry, "Instructions", &[("core", "1"), ("core_label", "core_1")]);
        assert_eq!(instructions, Some(10.0));
        assert_eq!(
            gauge_value(&registry, "ThermalHeadroomCelsius", &[("core", "0")]),
            Some(42.0)
        );
    }

    #[test]
    fn test_sentinels_leave_gauges_untouched() {
        let config = MonitorConfig::new(vec![0], vec![0]);
        let exporter =
            CoreMetricExporter::new(&config, &[CoreMetric::Ipc, CoreMetric::ThermalHeadroom], &[])
                .expect("exporter");

        let mut idle = core(0, 0, 0);
        idle.thermal_headroom = INVALID_THERMAL_HEADROOM;
        exporter.update(&states(vec![(0, idle.clone())]), &states(vec![(0, idle)]), 1.0);

        let registry = exporter.registry();
        assert_eq!(gauge_value(&registry, "IPC", &[("core", "0")]), Some(0.0));
        assert_eq!(
            gauge_value(&registry, "ThermalHeadroomCelsius", &[("core", "0")]),
            Some(0.0)
        );
    }

    #[test]
    fn test_c_state_gauges() {
        let config = MonitorConfig::new(vec![0], vec![2]);
        let exporter = CoreMetricExporter::new(&config, &[], &[0, 6]).expect("exporter");

        let before = core(0, 0, 0);
        let mut after = core(0, 0, 1000);
        after.core_c_state_residency[6] = 250;
        exporter.update(&states(vec![(2, before)]), &states(vec![(2, after)]), 1.0);

        let registry = exporter.registry();
        let c6 = gauge_value(&registry, C_STATE_METRIC, &[("core", "2"), ("state", "C6")])
            .expect("gauge");
        assert!((c6 - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_unconfigured_cores_are_skipped() {
        let config = MonitorConfig::new(vec![0], vec![0]);
        let exporter = CoreMetricExporter::new(&config, &[CoreMetric::Cycles], &[]).expect("exporter");
        let before = states(vec![(0, core(0, 0, 0)), (5, core(0, 0, 0))]);
        let after = states(vec![(0, core(0, 7, 10)), (5, core(0, 9, 10))]);
        exporter.update(&before, &after, 1.0);

        let registry = exporter.registry();
        assert_eq!(gauge_value(&registry, "Cycles", &[("core", "0")]), Some(7.0));
        assert_eq!(gauge_value(&registry, "Cycles", &[("core", "5")]), None);
    }
}
