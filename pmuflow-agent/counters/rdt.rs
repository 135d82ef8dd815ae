//! Resource monitoring through the QoS MSRs
//!
//! Used when resctrl is unavailable or disabled. Every monitored core gets
//! its own RMID through IA32_PQR_ASSOC. The MBM counters are 24 bits wide
//! and sit behind width extenders; occupancy is an instantaneous value.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pmuflow_raw::arch::rdt::{
    msr, pqr_assoc_with_rmid, qm_ctr, QmEventSelect, QosEvent, MBM_COUNTER_WIDTH_BITS, RMID_MAX,
};
use pmuflow_raw::RegisterLayout;

use crate::common::platform::MsrDevice;
use crate::common::whitelist::{check_msr, AccessFilter};
use crate::counters::extender;
use crate::counters::width_extender::{CounterWidthExtender, RawCounter};
use crate::error::{PmuError, Result};
use crate::metrics::state::INVALID_QOS_MONITORING_DATA;

/// One reading of the resource monitoring counters of a core, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosSample {
    pub l3_occupancy: u64,
    pub mem_bw_local: u64,
    pub mem_bw_total: u64,
}

impl QosSample {
    pub const INVALID: QosSample = QosSample {
        l3_occupancy: INVALID_QOS_MONITORING_DATA,
        mem_bw_local: INVALID_QOS_MONITORING_DATA,
        mem_bw_total: INVALID_QOS_MONITORING_DATA,
    };
}

/// Source of per-core L3 occupancy and memory bandwidth
pub trait QosMonitor: Send + Sync {
    fn sample(&self, cpu: u32) -> QosSample;

    /// Release per-core monitoring resources
    fn cleanup(&mut self);
}

/// IA32_QM_EVTSEL/IA32_QM_CTR pair of one core
///
/// The select and the read must not interleave with another event's, so
/// every counter of a core shares the core's lock.
struct QmCounter {
    msr: Arc<dyn MsrDevice>,
    filter: Arc<dyn AccessFilter>,
    lock: Arc<Mutex<()>>,
    select: u64,
}

impl QmCounter {
    fn new(core: &CoreMonitor, event: QosEvent, filter: &Arc<dyn AccessFilter>) -> Self {
        Self {
            msr: Arc::clone(&core.msr),
            filter: Arc::clone(filter),
            lock: Arc::clone(&core.lock),
            select: QmEventSelect::new(event, core.rmid).to_raw(),
        }
    }
}

impl RawCounter for QmCounter {
    fn read(&self) -> Result<u64> {
        let _guard = self.lock.lock();
        check_msr(self.filter.as_ref(), msr::IA32_QM_EVTSEL)?;
        self.msr.write(msr::IA32_QM_EVTSEL, self.select)?;
        let value = self.msr.read(msr::IA32_QM_CTR)?;
        if value & (qm_ctr::ERROR | qm_ctr::UNAVAILABLE) != 0 {
            return Err(PmuError::RdtError(format!(
                "QM_CTR reports no data for select 0x{:x} (0x{:x})",
                self.select, value
            )));
        }
        Ok(value & qm_ctr::DATA_MASK)
    }
}

/// Memory bandwidth counter of one core
///
/// QM_CTR reports no data for a while after an RMID is assigned, so the
/// extender is created by the first read that sees data.
struct MbmCounter {
    event: QosEvent,
    cadence: Option<Duration>,
    extender: Mutex<Option<CounterWidthExtender>>,
}

impl MbmCounter {
    fn new(event: QosEvent, cadence: Option<Duration>) -> Self {
        Self {
            event,
            cadence,
            extender: Mutex::new(None),
        }
    }

    fn read(&self, core: &CoreMonitor, filter: &Arc<dyn AccessFilter>) -> Result<u64> {
        let mut slot = self.extender.lock();
        if slot.is_none() {
            let counter = QmCounter::new(core, self.event, filter);
            let ext = extender(Box::new(counter), MBM_COUNTER_WIDTH_BITS, self.cadence)?;
            tracing::debug!("MBM {:?} of CPU {} reports data", self.event, core.msr.cpu());
            *slot = Some(ext);
        }
        match slot.as_ref() {
            Some(ext) => ext.read(),
            None => Err(PmuError::RdtError(format!("MBM {:?} not started", self.event))),
        }
    }

    /// Stop the sampling thread, if any
    fn stop(&self) {
        *self.extender.lock() = None;
    }
}

struct CoreMonitor {
    msr: Arc<dyn MsrDevice>,
    lock: Arc<Mutex<()>>,
    rmid: u32,
    local: MbmCounter,
    total: MbmCounter,
}

pub struct MsrQosMonitor {
    filter: Arc<dyn AccessFilter>,
    scaling: u64,
    cores: Vec<CoreMonitor>,
}

impl MsrQosMonitor {
    /// Assign RMIDs 1.. to the cores behind `msrs`
    pub fn new(
        msrs: Vec<Arc<dyn MsrDevice>>,
        filter: Arc<dyn AccessFilter>,
        scaling: u64,
        cadence: Option<Duration>,
    ) -> Result<Self> {
        if msrs.len() > RMID_MAX as usize {
            return Err(PmuError::RdtError(format!(
                "{} cores exceed the {} available RMIDs",
                msrs.len(),
                RMID_MAX
            )));
        }

        let mut monitor = Self {
            filter,
            scaling: scaling.max(1),
            cores: Vec::with_capacity(msrs.len()),
        };
        for (i, msr) in msrs.into_iter().enumerate() {
            let rmid = i as u32 + 1;
            monitor.assign_rmid(msr.as_ref(), rmid)?;
            tracing::info!("MBM monitoring of CPU {} with RMID {}", msr.cpu(), rmid);
            monitor.cores.push(CoreMonitor {
                msr,
                lock: Arc::new(Mutex::new(())),
                rmid,
                local: MbmCounter::new(QosEvent::LocalMemoryBandwidth, cadence),
                total: MbmCounter::new(QosEvent::TotalMemoryBandwidth, cadence),
            });
        }
        for core in &monitor.cores {
            // Start the extenders of counters that already report data
            let _ = core.local.read(core, &monitor.filter);
            let _ = core.total.read(core, &monitor.filter);
        }
        Ok(monitor)
    }

    fn assign_rmid(&self, msr: &dyn MsrDevice, rmid: u32) -> Result<()> {
        check_msr(self.filter.as_ref(), msr::IA32_PQR_ASSOC)?;
        let current = msr.read(msr::IA32_PQR_ASSOC)?;
        msr.write(msr::IA32_PQR_ASSOC, pqr_assoc_with_rmid(current, rmid))
    }
}

impl QosMonitor for MsrQosMonitor {
    fn sample(&self, cpu: u32) -> QosSample {
        let Some(core) = self.cores.iter().find(|c| c.msr.cpu() == cpu) else {
            return QosSample::INVALID;
        };
        let scale = |value: Result<u64>| match value {
            Ok(v) => v.wrapping_mul(self.scaling),
            Err(e) => {
                tracing::debug!("CPU {}: {}", cpu, e);
                INVALID_QOS_MONITORING_DATA
            }
        };
        let occupancy = QmCounter::new(core, QosEvent::L3Occupancy, &self.filter);
        QosSample {
            l3_occupancy: scale(occupancy.read()),
            mem_bw_local: scale(core.local.read(core, &self.filter)),
            mem_bw_total: scale(core.total.read(core, &self.filter)),
        }
    }

    fn cleanup(&mut self) {
        for core in &self.cores {
            core.local.stop();
            core.total.stop();
        }
        for core in &self.cores {
            if let Err(e) = self.assign_rmid(core.msr.as_ref(), 0) {
                tracing::warn!("Cannot release RMID {}: {}", core.rmid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::mock::MockMsr;
    use crate::common::whitelist::AllowAll;

    fn monitor(cpus: &[u32]) -> (Vec<Arc<MockMsr>>, MsrQosMonitor) {
        let mocks: Vec<Arc<MockMsr>> = cpus.iter().map(|&c| Arc::new(MockMsr::new(c))).collect();
        let msrs = mocks
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn MsrDevice>)
            .collect();
        let monitor = MsrQosMonitor::new(msrs, Arc::new(AllowAll), 64, None).expect("monitor");
        (mocks, monitor)
    }

    #[test]
    fn test_rmids_assigned_per_core() {
        let cos = 2u64 << 32;
        let mock = Arc::new(MockMsr::new(4));
        mock.set(msr::IA32_PQR_ASSOC, cos);
        let _monitor = MsrQosMonitor::new(
            vec![Arc::clone(&mock) as Arc<dyn MsrDevice>],
            Arc::new(AllowAll),
            1,
            None,
        )
        .expect("monitor");
        assert_eq!(mock.get(msr::IA32_PQR_ASSOC), cos | 1);
    }

    #[test]
    fn test_sample_scales_counts() {
        let (mocks, monitor) = monitor(&[0]);
        // The mock returns whatever QM_CTR holds, regardless of the select
        mocks[0].set(msr::IA32_QM_CTR, 10);
        let sample = monitor.sample(0);
        assert_eq!(sample.l3_occupancy, 640);
        assert_eq!(sample.mem_bw_local, 640);
    }

    #[test]
    fn test_unavailable_data_is_invalid() {
        let (mocks, monitor) = monitor(&[0, 1]);
        mocks[1].set(msr::IA32_QM_CTR, qm_ctr::UNAVAILABLE | 5);
        let sample = monitor.sample(1);
        assert_eq!(sample.l3_occupancy, INVALID_QOS_MONITORING_DATA);
        assert_eq!(monitor.sample(9), QosSample::INVALID);
    }

    #[test]
    fn test_bandwidth_starts_once_data_arrives() {
        let mock = Arc::new(MockMsr::new(0));
        mock.set(msr::IA32_QM_CTR, qm_ctr::UNAVAILABLE);
        let monitor = MsrQosMonitor::new(
            vec![Arc::clone(&mock) as Arc<dyn MsrDevice>],
            Arc::new(AllowAll),
            64,
            None,
        )
        .expect("monitor");
        assert_eq!(monitor.sample(0).mem_bw_local, INVALID_QOS_MONITORING_DATA);

        mock.set(msr::IA32_QM_CTR, 100);
        let first = monitor.sample(0);
        assert_eq!(first.l3_occupancy, 6_400);
        assert_eq!(first.mem_bw_local, 6_400);

        // a transient gap only invalidates that one sample
        mock.set(msr::IA32_QM_CTR, qm_ctr::UNAVAILABLE);
        assert_eq!(monitor.sample(0).mem_bw_total, INVALID_QOS_MONITORING_DATA);

        mock.set(msr::IA32_QM_CTR, 150);
        assert_eq!(monitor.sample(0).mem_bw_local, 9_600);
    }

    #[test]
    fn test_cleanup_releases_rmid() {
        let (mocks, mut monitor) = monitor(&[0, 1]);
        assert_eq!(mocks[1].get(msr::IA32_PQR_ASSOC), 2);
        monitor.cleanup();
        assert_eq!(mocks[1].get(msr::IA32_PQR_ASSOC), 0);
    }
}
