// Centralized metric collection orchestrator
// One loop captures every counter and feeds all exporters from the same pair
// of snapshots

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use pmuflow_raw::arch::core::MAX_C_STATE;

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::orchestrator::coordinator::{Coordinator, CounterStates};
use crate::prom::{
    CoreMetric, CoreMetricExporter, LinkMetric, LinkMetricExporter, SocketMetric,
    SocketMetricExporter, UncoreMetric, UncoreMetricExporter,
};

/// How often the machine is sampled
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Centralized collector that orchestrates all metric collection
pub struct MetricCollector {
    coordinator: Arc<Mutex<Coordinator>>,
    collector_config: CollectorConfig,

    core_exporter: Option<Arc<CoreMetricExporter>>,
    socket_exporter: Option<Arc<SocketMetricExporter>>,
    link_exporter: Option<Arc<LinkMetricExporter>>,
    uncore_exporter: Option<Arc<UncoreMetricExporter>>,
}

impl MetricCollector {
    /// Build one exporter per metric family the programmed machine supports
    pub fn new(
        coordinator: Coordinator,
        config: &MonitorConfig,
        collector_config: CollectorConfig,
    ) -> Result<Self> {
        let mut collector = Self {
            coordinator: Arc::new(Mutex::new(coordinator)),
            collector_config,
            core_exporter: None,
            socket_exporter: None,
            link_exporter: None,
            uncore_exporter: None,
        };

        let coordinator = Arc::clone(&collector.coordinator);
        let pcm = coordinator.lock();
        let sockets = pcm.sockets().to_vec();

        let core_metrics = CoreMetric::supported(&pcm);
        let core_c_states: Vec<usize> = (0..=MAX_C_STATE)
            .filter(|&s| pcm.core_c_state_residency_available(s))
            .collect();
        crate::init_exporter!(
            collector,
            !config.cores.is_empty(),
            CoreMetricExporter::new(config, &core_metrics, &core_c_states).map(Arc::new),
            core_exporter,
            "Core PMU"
        );

        let socket_metrics = SocketMetric::supported(&pcm);
        let package_c_states: Vec<usize> = (0..=MAX_C_STATE)
            .filter(|&s| pcm.package_c_state_residency_available(s))
            .collect();
        crate::init_exporter!(
            collector,
            !config.sockets.is_empty(),
            SocketMetricExporter::new(config, &socket_metrics, &package_c_states).map(Arc::new),
            socket_exporter,
            "Socket"
        );

        let link_metrics = LinkMetric::supported(&pcm);
        crate::init_exporter!(
            collector,
            !link_metrics.is_empty(),
            LinkMetricExporter::new(config, &link_metrics, &sockets, |kind| pcm.unit_slots(kind))
                .map(Arc::new),
            link_exporter,
            "Link"
        );

        let uncore_metrics = UncoreMetric::supported(&pcm);
        crate::init_exporter!(
            collector,
            pcm.model().is_server() && !uncore_metrics.is_empty(),
            UncoreMetricExporter::new(config, &uncore_metrics, &sockets, |kind| {
                pcm.unit_slots(kind)
            })
            .map(Arc::new),
            uncore_exporter,
            "Server uncore"
        );
        drop(pcm);

        Ok(collector)
    }

    /// Start the centralized collection loop
    pub fn start(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tracing::warn!("Starting centralized metric collection orchestrator");

        tokio::spawn(async move {
            self.collection_loop(cancel_token).await;
        })
    }

    /// Main unified collection loop
    async fn collection_loop(self, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.collector_config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous = None;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    tracing::info!("Collection loop cancelled");
                    break;
                }
                _ = interval.tick() => {}
            }

            self.sample(&mut previous);
        }

        self.coordinator.lock().cleanup();
        tracing::info!("Counters released");
    }

    /// Capture the machine once and publish the interval since the previous
    /// capture
    pub(crate) fn sample(&self, previous: &mut Option<(CounterStates, Instant)>) {
        let now = Instant::now();
        let states = match self.coordinator.lock().get_all_counter_states() {
            Ok(states) => states,
            Err(e) => {
                tracing::error!("Failed to capture counter states: {}", e);
                return;
            }
        };

        if let Some((before, at)) = previous.as_ref() {
            let seconds = now.duration_since(*at).as_secs_f64();
            if let Some(exporter) = &self.core_exporter {
                exporter.update(before, &states, seconds);
            }
            if let Some(exporter) = &self.socket_exporter {
                exporter.update(before, &states, seconds);
            }
            if let Some(exporter) = &self.link_exporter {
                exporter.update(before, &states, seconds);
            }
            if let Some(exporter) = &self.uncore_exporter {
                exporter.update(before, &states, seconds);
            }
        }
        *previous = Some((states, now));
    }

    pub fn coordinator(&self) -> Arc<Mutex<Coordinator>> {
        Arc::clone(&self.coordinator)
    }

    /// Get references to exporters for metrics handler
    pub fn core_exporter(&self) -> Option<Arc<CoreMetricExporter>> {
        self.core_exporter.clone()
    }

    pub fn socket_exporter(&self) -> Option<Arc<SocketMetricExporter>> {
        self.socket_exporter.clone()
    }

    pub fn link_exporter(&self) -> Option<Arc<LinkMetricExporter>> {
        self.link_exporter.clone()
    }

    pub fn uncore_exporter(&self) -> Option<Arc<UncoreMetricExporter>> {
        self.uncore_exporter.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::mock::MockPlatform;
    use crate::common::platform::Platform;
    use crate::config::ProgramConfig;
    use crate::prom::testing::gauge_value;
    use pmuflow_raw::arch::core::msr;

    const SKX_SIGNATURE: u32 = 0x50654;

    fn collector(platform: &Arc<MockPlatform>) -> MetricCollector {
        let config = ProgramConfig {
            energy_cadence: None,
            mbm_cadence: None,
            imc_cadence: None,
            use_resctrl: false,
            ..Default::default()
        };
        let mut pcm = Coordinator::new(Arc::clone(platform) as Arc<dyn Platform>, config)
            .expect("coordinator");
        pcm.program().expect("program");
        let monitor = MonitorConfig::from_topology(pcm.topology());
        MetricCollector::new(pcm, &monitor, CollectorConfig::default()).expect("collector")
    }

    #[test]
    fn test_first_sample_publishes_nothing() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 2));
        let collector = collector(&platform);
        let mut previous = None;

        platform.msr(0).set(msr::IA32_FIXED_CTR0, 500);
        collector.sample(&mut previous);
        assert!(previous.is_some());

        let registry = collector.core_exporter().expect("core exporter").registry();
        assert_eq!(gauge_value(&registry, "Instructions", &[("core", "0")]), Some(0.0));
    }

    #[test]
    fn test_interval_reaches_core_gauges() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 2));
        let collector = collector(&platform);
        let mut previous = None;

        collector.sample(&mut previous);
        platform.msr(0).set(msr::IA32_FIXED_CTR0, 500);
        platform.msr(1).set(msr::IA32_FIXED_CTR0, 20);
        collector.sample(&mut previous);

        let registry = collector.core_exporter().expect("core exporter").registry();
        assert_eq!(gauge_value(&registry, "Instructions", &[("core", "0")]), Some(500.0));
        assert_eq!(gauge_value(&registry, "Instructions", &[("core", "1")]), Some(20.0));
        assert!(collector.socket_exporter().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_loop_releases_counters() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 1));
        let collector = collector(&platform);
        let coordinator = collector.coordinator();
        let cancel_token = CancellationToken::new();

        let handle = collector.start(cancel_token.clone());
        cancel_token.cancel();
        handle.await.expect("collection loop");

        assert!(!coordinator.lock().is_programmed());
        assert_eq!(platform.msr(0).get(msr::IA32_PERF_GLOBAL_CTRL), 0);
    }
}
