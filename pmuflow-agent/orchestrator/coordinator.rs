//! Machine-wide programming and snapshot capture
//!
//! The coordinator owns every counter source of the machine. Programming
//! takes `&mut self`, capture takes `&self`, so the two never interleave.

use std::sync::Arc;

use parking_lot::Mutex;
use pmuflow_raw::arch::core::{msr, MAX_PROGRAMMABLE_COUNTERS};
use pmuflow_raw::arch::{slot, McLocation};
use pmuflow_raw::{ArchDescriptor, Availability, CpuModel};

use crate::common::cpuid::detect_model;
use crate::common::platform::{MsrDevice, Platform};
use crate::common::Topology;
use crate::config::{CoreProgramMode, ProgramConfig};
use crate::counters::core_pmu::{self, CoreEventConfig, CorePmu};
use crate::counters::rdt::{MsrQosMonitor, QosMonitor, QosSample};
use crate::counters::resctrl::ResctrlMonitor;
use crate::counters::uncore_pmu::IdxEvent;
use crate::counters::{ClientImcCounters, RaplCounters, ServerUncorePmus};
use crate::error::{PmuError, Result};
use crate::metrics::state::{
    BasicCounterState, ServerUncoreCounterState, SocketCounterState, SystemCounterState,
    UncoreCounterState, UnitKind, C_STATE_SLOTS,
};
use crate::orchestrator::raw_event::{PmuType, RawEventConfig};

/// One consistent capture of every level of the hierarchy
#[derive(Debug, Clone, Default)]
pub struct CounterStates {
    pub system: SystemCounterState,
    pub sockets: Vec<SocketCounterState>,
    /// `(cpu, state)` in CPU order
    pub cores: Vec<(u32, BasicCounterState)>,
    /// Per-unit counters of each socket; empty without server uncore PMUs
    pub server_uncore: Vec<ServerUncoreCounterState>,
}

/// Socket-scope MSR values of the previous capture
#[derive(Debug, Clone, Copy, Default)]
struct SocketReadings {
    package_c_states: [u64; C_STATE_SLOTS],
    tsc: u64,
}

pub struct Coordinator {
    platform: Arc<dyn Platform>,
    config: ProgramConfig,
    descriptor: ArchDescriptor,
    topology: Topology,
    /// Socket ids in index order
    sockets: Vec<u32>,
    /// One handle per socket on its reference core
    socket_msrs: Vec<Arc<dyn MsrDevice>>,
    /// Stand-ins for socket MSRs that fail to read, by socket index
    socket_readings: Mutex<Vec<SocketReadings>>,
    cores: Vec<CorePmu>,
    uncore: Option<ServerUncorePmus>,
    rapl: Option<RaplCounters>,
    qos: Option<Box<dyn QosMonitor>>,
    client_imc: Option<ClientImcCounters>,
    nominal_frequency: u64,
    programmed: bool,
}

impl Coordinator {
    /// Identify the processor and open the package-scope MSRs. Nothing is
    /// programmed yet.
    pub fn new(platform: Arc<dyn Platform>, config: ProgramConfig) -> Result<Self> {
        let (model, _) = detect_model(platform.cpu_signature())?;
        let descriptor = ArchDescriptor::for_model(model);
        let topology = platform.topology()?;
        let sockets = topology.sockets();

        let socket_msrs = sockets
            .iter()
            .map(|&socket| {
                let cpu = topology.socket_ref_core(socket).ok_or_else(|| {
                    PmuError::ConfigError(format!("socket {socket} has no online CPU"))
                })?;
                platform.open_msr(cpu)
            })
            .collect::<Result<Vec<_>>>()?;

        let nominal_frequency = match socket_msrs.first() {
            Some(msr) => core_pmu::nominal_frequency(msr.as_ref(), descriptor.bus_clock_hz)
                .unwrap_or_else(|e| {
                    tracing::warn!("Cannot read the nominal frequency: {}", e);
                    0
                }),
            None => 0,
        };
        tracing::info!(
            "{} with {} sockets, nominal frequency {} MHz",
            model.name(),
            sockets.len(),
            nominal_frequency / 1_000_000
        );

        let socket_readings = Mutex::new(vec![SocketReadings::default(); sockets.len()]);
        Ok(Self {
            platform,
            config,
            descriptor,
            topology,
            sockets,
            socket_readings,
            socket_msrs,
            cores: Vec::new(),
            uncore: None,
            rapl: None,
            qos: None,
            client_imc: None,
            nominal_frequency,
            programmed: false,
        })
    }

    pub fn model(&self) -> CpuModel {
        self.descriptor.model
    }

    pub fn descriptor(&self) -> &ArchDescriptor {
        &self.descriptor
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn num_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Socket ids in index order
    pub fn sockets(&self) -> &[u32] {
        &self.sockets
    }

    /// Unit slots of `kind` on each socket in index order, absent units
    /// included; empty without server uncore PMUs
    pub fn unit_slots(&self, kind: UnitKind) -> Vec<usize> {
        let Some(uncore) = self.uncore.as_ref() else {
            return Vec::new();
        };
        (0..uncore.num_sockets())
            .map(|s| {
                uncore.socket(s).map_or(0, |l| match kind {
                    UnitKind::Idx => l.idx.len(),
                    _ => l.boxes(kind).len(),
                })
            })
            .collect()
    }

    pub fn nominal_frequency(&self) -> u64 {
        self.nominal_frequency
    }

    pub fn is_programmed(&self) -> bool {
        self.programmed
    }

    /// General purpose counters each hardware thread can use
    pub fn programmable_counters(&self) -> usize {
        let per_thread = if self.topology.smt_enabled() {
            self.descriptor.core_counters
        } else {
            self.descriptor.core_counters * 2
        };
        let usable = match self.config.gp_counters {
            Some(reported) => per_thread.min(reported),
            None => per_thread,
        };
        usable.min(MAX_PROGRAMMABLE_COUNTERS)
    }

    fn core_event_config(&self) -> CoreEventConfig {
        match &self.config.mode {
            CoreProgramMode::DefaultEvents => {
                CoreEventConfig::default_for(self.descriptor.core_events)
            }
            CoreProgramMode::CustomEvents { events, offcore } => {
                CoreEventConfig::custom(events.clone(), *offcore)
            }
        }
    }

    /// Program every counter source with the configured core events and the
    /// default uncore events
    pub fn program(&mut self) -> Result<()> {
        let core = self.core_event_config();
        self.program_with(&core)
    }

    /// Program user supplied events. Core events replace the general purpose
    /// counter set; uncore events replace the defaults of their unit family.
    pub fn program_raw(&mut self, events: &[(PmuType, RawEventConfig)]) -> Result<()> {
        let mut kinds: Vec<UnitKind> = Vec::new();
        for (pmu, _) in events {
            if let Some(kind) = pmu.unit_kind() {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
        }
        if !kinds.is_empty() && !self.descriptor.model.is_server() {
            return Err(PmuError::ConfigError(format!(
                "{} has no server uncore PMUs",
                self.descriptor.model.name()
            )));
        }

        let core_events: Vec<&RawEventConfig> = events
            .iter()
            .filter(|(pmu, _)| *pmu == PmuType::Core)
            .map(|(_, e)| e)
            .collect();
        let core = if core_events.is_empty() {
            self.core_event_config()
        } else {
            let mut offcore = [0u64; 2];
            for event in &core_events {
                if event.config[1] != 0 && offcore[0] == 0 {
                    offcore[0] = event.config[1];
                }
                if event.config[2] != 0 && offcore[1] == 0 {
                    offcore[1] = event.config[2];
                }
            }
            CoreEventConfig::custom(core_events.iter().map(|e| e.config[0]).collect(), offcore)
        };
        self.program_with(&core)?;

        let Some(uncore) = self.uncore.as_mut() else {
            return Ok(());
        };

        for kind in kinds {
            let selected = events
                .iter()
                .filter(|(pmu, _)| pmu.unit_kind() == Some(kind))
                .map(|(_, e)| e);
            if kind == UnitKind::Idx {
                let idx: Vec<IdxEvent> = selected
                    .map(|e| IdxEvent {
                        config: e.config[0],
                        filters: e.config[1..].iter().copied().filter(|&f| f != 0).collect(),
                    })
                    .collect();
                uncore.program_idx(&idx)?;
            } else {
                let encodings: Vec<u64> = selected.map(|e| e.config[0]).collect();
                uncore.program_kind(kind, &encodings)?;
            }
            tracing::info!("Programmed raw {} events", kind.name());
        }
        Ok(())
    }

    fn program_with(&mut self, core: &CoreEventConfig) -> Result<()> {
        if self.programmed {
            self.cleanup();
        }

        self.program_cores(core)?;
        if let Err(e) = self.program_uncore() {
            self.cleanup();
            return Err(e);
        }
        self.open_energy();
        self.open_qos();
        self.open_client_imc();

        self.programmed = true;
        tracing::info!(
            "Programmed {} cores on {} sockets",
            self.cores.len(),
            self.sockets.len()
        );
        Ok(())
    }

    fn program_cores(&mut self, config: &CoreEventConfig) -> Result<()> {
        if self.cores.is_empty() {
            let programmable = self.programmable_counters();
            for cpu in self.topology.cpus() {
                let msr = self.platform.open_msr(cpu.os_id)?;
                self.cores.push(CorePmu::new(
                    msr,
                    Arc::clone(&self.config.filter),
                    &self.descriptor,
                    programmable,
                ));
            }
        }

        // A refusal must leave every core untouched
        if !self.config.force_reprogram {
            for core in &self.cores {
                if core.busy()? {
                    return Err(PmuError::PmuBusy(format!(
                        "core PMU of CPU {} is already enabled",
                        core.cpu()
                    )));
                }
            }
        }

        let force = self.config.force_reprogram;
        for index in 0..self.cores.len() {
            if let Err(e) = self.cores[index].program(config, force) {
                for core in &self.cores[..index] {
                    if let Err(e) = core.cleanup() {
                        tracing::warn!("Cleanup of CPU {} failed: {}", core.cpu(), e);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn program_uncore(&mut self) -> Result<()> {
        if !self.descriptor.model.is_server() {
            return Ok(());
        }
        if self.uncore.is_none() {
            self.uncore = Some(ServerUncorePmus::discover(
                self.platform.as_ref(),
                &self.descriptor,
                &self.topology,
                Arc::clone(&self.config.filter),
            )?);
        }
        if let Some(uncore) = self.uncore.as_mut() {
            uncore.program(self.config.xpi_l1)?;
        }
        Ok(())
    }

    fn open_energy(&mut self) {
        let energy = Availability::PACKAGE_ENERGY | Availability::DRAM_ENERGY;
        if !self.descriptor.availability.intersects(energy) {
            return;
        }
        match RaplCounters::new(
            &self.socket_msrs,
            &self.config.filter,
            &self.descriptor,
            self.config.energy_cadence,
        ) {
            Ok(rapl) => self.rapl = Some(rapl),
            Err(e) => tracing::warn!("Energy counters unavailable: {}", e),
        }
    }

    fn open_qos(&mut self) {
        let qos = Availability::L3_OCCUPANCY
            | Availability::LOCAL_MEMORY_BW
            | Availability::REMOTE_MEMORY_BW;
        if !self.descriptor.availability.intersects(qos) {
            return;
        }
        let cpus: Vec<u32> = self.cores.iter().map(CorePmu::cpu).collect();

        let root = &self.config.resctrl_root;
        if self.config.use_resctrl && ResctrlMonitor::is_supported(root) {
            match ResctrlMonitor::new(root, &cpus) {
                Ok(monitor) => {
                    self.qos = Some(Box::new(monitor));
                    return;
                }
                Err(e) => tracing::warn!("resctrl unusable, falling back to QoS MSRs: {}", e),
            }
        }

        let Some(scaling) = self.config.mbm_scaling else {
            tracing::info!("Processor lacks resource monitoring, L3 occupancy and MBM disabled");
            return;
        };
        let msrs = match cpus
            .iter()
            .map(|&cpu| self.platform.open_msr(cpu))
            .collect::<Result<Vec<_>>>()
        {
            Ok(msrs) => msrs,
            Err(e) => {
                tracing::warn!("QoS MSRs unavailable: {}", e);
                return;
            }
        };
        match MsrQosMonitor::new(
            msrs,
            Arc::clone(&self.config.filter),
            scaling,
            self.config.mbm_cadence,
        ) {
            Ok(monitor) => self.qos = Some(Box::new(monitor)),
            Err(e) => tracing::warn!("QoS monitoring unavailable: {}", e),
        }
    }

    fn open_client_imc(&mut self) {
        let McLocation::Client(imc) = &self.descriptor.mc else {
            return;
        };
        match ClientImcCounters::open(self.platform.as_ref(), imc, self.config.imc_cadence) {
            Ok(counters) => self.client_imc = Some(counters),
            Err(e) => tracing::warn!("Client memory controller counters unavailable: {}", e),
        }
    }

    /// Disable every counter this coordinator programmed and release the
    /// monitoring resources. Failures are logged and skipped.
    pub fn cleanup(&mut self) {
        for core in &self.cores {
            if let Err(e) = core.cleanup() {
                tracing::warn!("Cleanup of CPU {} failed: {}", core.cpu(), e);
            }
        }
        if let Some(uncore) = self.uncore.as_mut() {
            uncore.cleanup();
        }
        if let Some(mut qos) = self.qos.take() {
            qos.cleanup();
        }
        self.rapl = None;
        self.client_imc = None;
        if self.programmed {
            tracing::info!("Performance counters released");
        }
        self.programmed = false;
    }

    fn socket_index(&self, socket: u32) -> Result<usize> {
        self.sockets
            .iter()
            .position(|&s| s == socket)
            .ok_or_else(|| PmuError::ConfigError(format!("unknown socket {socket}")))
    }

    fn core_state(&self, core: &CorePmu) -> BasicCounterState {
        let mut state = core.snapshot();
        let qos = match &self.qos {
            Some(qos) => qos.sample(core.cpu()),
            None => QosSample::INVALID,
        };
        state.l3_occupancy = qos.l3_occupancy;
        state.mem_bw_local = qos.mem_bw_local;
        state.mem_bw_total = qos.mem_bw_total;
        state
    }

    /// TSC and package C-states of socket `index`; a register that fails to
    /// read repeats its value from the previous capture
    fn socket_readings(&self, index: usize) -> SocketReadings {
        let mut readings = self.socket_readings.lock();
        let Some(last) = readings.get_mut(index) else {
            return SocketReadings::default();
        };
        if let Some(msr) = self.socket_msrs.get(index) {
            if self.descriptor.is_available(Availability::PACKAGE_C_STATES) {
                last.package_c_states = core_pmu::package_c_states(
                    msr.as_ref(),
                    &self.descriptor,
                    &last.package_c_states,
                );
            }
            match msr.read(msr::IA32_TIME_STAMP_COUNTER) {
                Ok(tsc) => last.tsc = tsc,
                Err(e) => tracing::debug!("Socket {} TSC unreadable: {}", index, e),
            }
        }
        *last
    }

    fn uncore_state(
        &self,
        index: usize,
        server: Option<&ServerUncoreCounterState>,
    ) -> UncoreCounterState {
        let mut uncore = UncoreCounterState {
            availability: self.descriptor.availability,
            ..Default::default()
        };
        if let Some(server) = server {
            server.fold_into(&mut uncore);
        }

        if let Some(rapl) = &self.rapl {
            let (package, dram) = rapl.energy(index);
            uncore.package_energy_status = package;
            uncore.dram_energy_status = dram;
            uncore.joules_per_energy_unit = rapl.joules_per_energy_unit();
            uncore.dram_joules_per_energy_unit = rapl.dram_joules_per_energy_unit();
        }

        let readings = self.socket_readings(index);
        uncore.package_c_state_residency = readings.package_c_states;
        uncore.invariant_tsc = readings.tsc;

        // Client parts have a single memory controller
        if index == 0 {
            if let Some(imc) = &self.client_imc {
                let sample = imc.sample();
                uncore.mc_normal_reads = sample.reads;
                uncore.mc_full_writes = sample.writes;
                uncore.mc_io_requests = sample.io_requests;
            }
        }
        uncore
    }

    /// Per-unit snapshot of socket `index`, labelled with the socket id
    fn server_state(&self, index: usize) -> Option<ServerUncoreCounterState> {
        let uncore = self.uncore.as_ref()?;
        let mut state = uncore.snapshot(index);
        if let Some(&socket) = self.sockets.get(index) {
            state.socket = socket;
        }
        Some(state)
    }

    pub fn get_core_counter_state(&self, cpu: u32) -> Result<BasicCounterState> {
        let core = self
            .cores
            .iter()
            .find(|c| c.cpu() == cpu)
            .ok_or_else(|| PmuError::ConfigError(format!("CPU {cpu} is not programmed")))?;
        Ok(self.core_state(core))
    }

    pub fn get_socket_counter_state(&self, socket: u32) -> Result<SocketCounterState> {
        let index = self.socket_index(socket)?;
        let mut basic = BasicCounterState::default();
        for core in &self.cores {
            if self.topology.socket_of(core.cpu()) == Some(socket) {
                basic += &self.core_state(core);
            }
        }
        let server = self.server_state(index);
        Ok(SocketCounterState {
            socket,
            basic,
            uncore: self.uncore_state(index, server.as_ref()),
        })
    }

    pub fn get_system_counter_state(&self) -> Result<SystemCounterState> {
        Ok(self.get_all_counter_states()?.system)
    }

    /// Raw per-unit counters of `socket` with its energy and TSC
    pub fn get_server_uncore_counter_state(&self, socket: u32) -> Result<ServerUncoreCounterState> {
        let index = self.socket_index(socket)?;
        let mut state = self.server_state(index).unwrap_or_else(|| ServerUncoreCounterState {
            availability: self.descriptor.availability,
            socket,
            ..Default::default()
        });
        if let Some(rapl) = &self.rapl {
            let (package, dram) = rapl.energy(index);
            state.package_energy_status = package;
            state.dram_energy_status = dram;
        }
        state.invariant_tsc = self.socket_readings(index).tsc;
        Ok(state)
    }

    /// Every core, every socket and the system, captured in one pass.
    /// Registers that fail to read do not abort the capture; they repeat
    /// their previous value.
    pub fn get_all_counter_states(&self) -> Result<CounterStates> {
        let cores: Vec<(u32, BasicCounterState)> = self
            .cores
            .iter()
            .map(|core| (core.cpu(), self.core_state(core)))
            .collect();

        let mut system = SystemCounterState {
            xpi_bytes_per_flit: self.descriptor.xpi_bytes_per_flit,
            xpi_link_speed: self.descriptor.xpi_link_speed,
            nominal_frequency: self.nominal_frequency,
            ..Default::default()
        };
        system.basic.availability = self.descriptor.availability;
        system.uncore.availability = self.descriptor.availability;

        let mut sockets = Vec::with_capacity(self.sockets.len());
        let mut server_uncore = Vec::new();
        for (index, &socket) in self.sockets.iter().enumerate() {
            let mut basic = BasicCounterState::default();
            for (cpu, state) in &cores {
                if self.topology.socket_of(*cpu) == Some(socket) {
                    basic += state;
                }
            }

            let server = self.server_state(index);
            let state = SocketCounterState {
                socket,
                basic,
                uncore: self.uncore_state(index, server.as_ref()),
            };
            system.accumulate(&state);

            let per_unit = |kind: UnitKind, slot: usize| -> Vec<u64> {
                server
                    .as_ref()
                    .map(|s| s.per_unit(kind, slot))
                    .unwrap_or_default()
            };
            system.incoming_xpi_flits.push(per_unit(UnitKind::Xpi, slot::XPI_INCOMING));
            system.outgoing_xpi_flits.push(per_unit(UnitKind::Xpi, slot::XPI_OUTGOING));
            system.xpi_clocks.push(per_unit(UnitKind::Xpi, slot::XPI_CLOCKS));
            system.xpi_power_cycles.push(per_unit(UnitKind::Xpi, slot::XPI_POWER));
            system.cxl_write_mem.push(per_unit(UnitKind::Cxl, slot::CXL_MEM_WRITE));
            system.cxl_write_cache.push(per_unit(UnitKind::Cxl, slot::CXL_CACHE_WRITE));

            if let Some(mut server) = server {
                server.package_energy_status = state.uncore.package_energy_status;
                server.dram_energy_status = state.uncore.dram_energy_status;
                server.invariant_tsc = state.uncore.invariant_tsc;
                server_uncore.push(server);
            }
            sockets.push(state);
        }

        Ok(CounterStates {
            system,
            sockets,
            cores,
            server_uncore,
        })
    }

    fn valid_units(&self, kind: UnitKind) -> usize {
        self.uncore.as_ref().map_or(0, |u| {
            (0..u.num_sockets())
                .filter_map(|s| u.socket(s))
                .map(|l| l.valid_units(kind))
                .sum()
        })
    }

    fn has(&self, what: Availability) -> bool {
        self.descriptor.is_available(what)
    }

    pub fn l2_cache_metrics_available(&self) -> bool {
        self.has(Availability::L2_CACHE) && self.programmable_counters() >= 4
    }

    pub fn l3_cache_metrics_available(&self) -> bool {
        self.has(Availability::L3_CACHE) && self.programmable_counters() >= 4
    }

    pub fn memory_traffic_metrics_available(&self) -> bool {
        self.has(Availability::MEMORY_TRAFFIC)
            && (self.valid_units(UnitKind::Mc) > 0 || self.client_imc.is_some())
    }

    pub fn pmm_traffic_metrics_available(&self) -> bool {
        self.has(Availability::PMM_TRAFFIC) && self.valid_units(UnitKind::Mc) > 0
    }

    pub fn edc_traffic_metrics_available(&self) -> bool {
        self.has(Availability::EDC_TRAFFIC) && self.valid_units(UnitKind::Edc) > 0
    }

    pub fn io_request_metrics_available(&self) -> bool {
        self.has(Availability::IO_REQUESTS) && self.client_imc.is_some()
    }

    pub fn package_energy_metrics_available(&self) -> bool {
        self.has(Availability::PACKAGE_ENERGY) && self.rapl.is_some()
    }

    pub fn dram_energy_metrics_available(&self) -> bool {
        self.has(Availability::DRAM_ENERGY) && self.rapl.is_some()
    }

    pub fn core_c_state_residency_available(&self, state: usize) -> bool {
        self.has(Availability::CORE_C_STATES) && self.descriptor.core_c_state_available(state)
    }

    pub fn package_c_state_residency_available(&self, state: usize) -> bool {
        self.has(Availability::PACKAGE_C_STATES)
            && self.descriptor.package_c_state_available(state)
    }

    pub fn incoming_xpi_traffic_metrics_available(&self) -> bool {
        self.sockets.len() > 1
            && self.has(Availability::INCOMING_XPI)
            && self.valid_units(UnitKind::Xpi) > 0
    }

    pub fn outgoing_xpi_traffic_metrics_available(&self) -> bool {
        self.sockets.len() > 1
            && self.has(Availability::OUTGOING_XPI)
            && self.valid_units(UnitKind::Xpi) > 0
    }

    pub fn l3_cache_occupancy_metric_available(&self) -> bool {
        self.has(Availability::L3_OCCUPANCY) && self.qos.is_some()
    }

    pub fn core_local_memory_bw_metric_available(&self) -> bool {
        self.has(Availability::LOCAL_MEMORY_BW) && self.qos.is_some()
    }

    pub fn core_remote_memory_bw_metric_available(&self) -> bool {
        self.has(Availability::REMOTE_MEMORY_BW) && self.qos.is_some()
    }

    pub fn topdown_metrics_available(&self) -> bool {
        self.has(Availability::TOPDOWN)
    }

    pub fn smi_count_available(&self) -> bool {
        self.has(Availability::SMI_COUNT)
    }

    pub fn thermal_headroom_available(&self) -> bool {
        self.has(Availability::THERMAL_HEADROOM)
    }

    pub fn near_memory_metrics_available(&self) -> bool {
        self.has(Availability::NEAR_MEMORY) && self.valid_units(UnitKind::M2m) > 0
    }

    pub fn home_agent_metrics_available(&self) -> bool {
        self.has(Availability::HA_REQUESTS) && self.valid_units(UnitKind::M2m) > 0
    }

    pub fn cxl_traffic_metrics_available(&self) -> bool {
        self.has(Availability::CXL_TRAFFIC) && self.valid_units(UnitKind::Cxl) > 0
    }

    pub fn uncore_frequency_metrics_available(&self) -> bool {
        self.has(Availability::UNCORE_CLOCKS) && self.valid_units(UnitKind::Pcu) > 0
    }

    pub fn llc_miss_latency_metrics_available(&self) -> bool {
        self.has(Availability::LLC_MISS_LATENCY) && self.valid_units(UnitKind::Cha) > 0
    }

    pub fn iio_traffic_metrics_available(&self) -> bool {
        self.has(Availability::IIO_TRAFFIC) && self.valid_units(UnitKind::Iio) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::mock::MockPlatform;
    use crate::error::ErrorCode;
    use crate::metrics::derived;
    use crate::metrics::state::INVALID_QOS_MONITORING_DATA;

    const SKX_SIGNATURE: u32 = 0x50654;
    const SKL_CLIENT_SIGNATURE: u32 = 0x506E3;
    const PERFEVTSEL_ENABLE: u64 = 1 << 22;

    fn test_config() -> ProgramConfig {
        ProgramConfig {
            energy_cadence: None,
            mbm_cadence: None,
            imc_cadence: None,
            use_resctrl: false,
            mbm_scaling: None,
            ..Default::default()
        }
    }

    fn coordinator(platform: &Arc<MockPlatform>, config: ProgramConfig) -> Coordinator {
        Coordinator::new(Arc::clone(platform) as Arc<dyn Platform>, config).expect("coordinator")
    }

    #[test]
    fn test_unsupported_processor_is_rejected() {
        let platform = Arc::new(MockPlatform::new(0x0000_0F00, 1, 1));
        let err = Coordinator::new(platform as Arc<dyn Platform>, test_config())
            .err()
            .expect("unsupported");
        assert!(matches!(err, PmuError::UnsupportedProcessor(_)));
    }

    #[test]
    fn test_states_aggregate_per_socket() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 2, 2));
        let mut pcm = coordinator(&platform, test_config());
        pcm.program().expect("program");
        assert!(pcm.is_programmed());

        for cpu in 0..4u32 {
            platform.msr(cpu).set(msr::IA32_FIXED_CTR0, 100 * (cpu as u64 + 1));
        }
        let states = pcm.get_all_counter_states().expect("states");
        assert_eq!(states.cores.len(), 4);
        assert_eq!(states.sockets.len(), 2);
        assert_eq!(states.sockets[0].basic.instructions_retired, 300);
        assert_eq!(states.sockets[1].basic.instructions_retired, 700);
        assert_eq!(states.system.basic.instructions_retired, 1000);
        assert_eq!(states.system.num_sockets(), 2);

        let socket = pcm.get_socket_counter_state(1).expect("socket");
        assert_eq!(socket.basic.instructions_retired, 700);
        assert!(pcm.get_socket_counter_state(5).is_err());
    }

    #[test]
    fn test_unreadable_msr_keeps_the_capture() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 1));
        let mut pcm = coordinator(&platform, test_config());
        pcm.program().expect("program");

        platform.msr(0).set(msr::MSR_PKG_C6_RESIDENCY, 42);
        let first = pcm.get_all_counter_states().expect("states");
        assert_eq!(first.sockets[0].uncore.package_c_state_residency[6], 42);

        platform.msr(0).registers().fail(msr::MSR_PKG_C6_RESIDENCY);
        platform.msr(0).registers().fail(msr::IA32_TIME_STAMP_COUNTER);
        platform.msr(0).set(msr::IA32_FIXED_CTR0, 500);
        let second = pcm.get_all_counter_states().expect("states");

        assert_eq!(second.cores[0].1.instructions_retired, 500);
        assert_eq!(second.sockets[0].basic.instructions_retired, 500);
        assert_eq!(second.sockets[0].uncore.package_c_state_residency[6], 42);
        assert_eq!(
            second.sockets[0].uncore.invariant_tsc,
            first.sockets[0].uncore.invariant_tsc
        );
        // the failed registers report no progress over the interval
        assert_eq!(
            derived::get_package_c_state_residency(6, &first.sockets[0], &second.sockets[0]),
            0.0
        );
    }

    #[test]
    fn test_busy_pmu_is_left_untouched() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 2));
        platform.msr(1).set(msr::perfevtsel(0), PERFEVTSEL_ENABLE | 0x3C);
        let mut pcm = coordinator(&platform, test_config());

        let result = pcm.program();
        assert_eq!(ErrorCode::of(&result), ErrorCode::PmuBusy);
        assert!(platform.msr(0).writes().is_empty());
        assert!(!pcm.is_programmed());
    }

    #[test]
    fn test_force_takes_over_busy_pmu() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 2));
        platform.msr(1).set(msr::perfevtsel(0), PERFEVTSEL_ENABLE | 0x3C);
        let mut pcm = coordinator(
            &platform,
            ProgramConfig {
                force_reprogram: true,
                ..test_config()
            },
        );
        pcm.program().expect("forced program");
        assert_ne!(platform.msr(1).get(msr::perfevtsel(0)), PERFEVTSEL_ENABLE | 0x3C);
    }

    #[test]
    fn test_reprogram_bumps_generation() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 1));
        let mut pcm = coordinator(&platform, test_config());
        pcm.program().expect("program");
        let before = pcm.get_core_counter_state(0).expect("state");
        pcm.program().expect("reprogram");
        let after = pcm.get_core_counter_state(0).expect("state");
        assert_eq!(after.generation, before.generation + 1);
    }

    #[test]
    fn test_cleanup_disables_counters() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 1));
        let mut pcm = coordinator(&platform, test_config());
        pcm.program().expect("program");
        assert_ne!(platform.msr(0).get(msr::IA32_PERF_GLOBAL_CTRL), 0);

        pcm.cleanup();
        assert_eq!(platform.msr(0).get(msr::IA32_PERF_GLOBAL_CTRL), 0);
        assert_eq!(platform.msr(0).get(msr::perfevtsel(0)), 0);
        assert!(!pcm.is_programmed());
    }

    #[test]
    fn test_raw_core_events() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 1));
        let mut pcm = coordinator(&platform, test_config());
        let events = vec![
            RawEventConfig::parse("core/config=0x01b7,config1=0x10001/").expect("event"),
            RawEventConfig::parse("core/config=0x00c4/").expect("event"),
        ];
        pcm.program_raw(&events).expect("program");

        let msr0 = platform.msr(0);
        assert_eq!(msr0.get(msr::perfevtsel(0)), 0x01b7 | PERFEVTSEL_ENABLE);
        assert_eq!(msr0.get(msr::perfevtsel(1)), 0x00c4 | PERFEVTSEL_ENABLE);
        assert_eq!(msr0.get(msr::MSR_OFFCORE_RSP0), 0x10001);
        let state = pcm.get_core_counter_state(0).expect("state");
        assert_eq!(state.event_set, None);
    }

    #[test]
    fn test_raw_uncore_events_need_server_part() {
        let platform = Arc::new(MockPlatform::new(SKL_CLIENT_SIGNATURE, 1, 2));
        let mut pcm = coordinator(&platform, test_config());
        let events = vec![RawEventConfig::parse("cha/config=0x0135/").expect("event")];
        assert!(pcm.program_raw(&events).is_err());
        assert!(!pcm.is_programmed());
    }

    #[test]
    fn test_qos_values_are_invalid_without_monitoring() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 1));
        let mut pcm = coordinator(&platform, test_config());
        pcm.program().expect("program");
        let state = pcm.get_core_counter_state(0).expect("state");
        assert_eq!(state.l3_occupancy, INVALID_QOS_MONITORING_DATA);
        assert!(!pcm.l3_cache_occupancy_metric_available());
    }

    #[test]
    fn test_msr_qos_fallback() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 2));
        let mut pcm = coordinator(
            &platform,
            ProgramConfig {
                mbm_scaling: Some(64),
                ..test_config()
            },
        );
        pcm.program().expect("program");
        assert!(pcm.l3_cache_occupancy_metric_available());
        platform.msr(1).set(pmuflow_raw::arch::rdt::msr::IA32_QM_CTR, 3);
        let state = pcm.get_core_counter_state(1).expect("state");
        assert_eq!(state.l3_occupancy, 3 * 64);
    }

    #[test]
    fn test_availability_tracks_discovered_units() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 2));
        let mut pcm = coordinator(&platform, test_config());
        pcm.program().expect("program");
        // No memory controller PCI functions on the mock
        assert!(!pcm.memory_traffic_metrics_available());
        assert!(!pcm.incoming_xpi_traffic_metrics_available());
        assert!(pcm.thermal_headroom_available());
        assert!(pcm.package_energy_metrics_available());
    }

    #[test]
    fn test_client_memory_traffic() {
        let platform = Arc::new(MockPlatform::new(SKL_CLIENT_SIGNATURE, 1, 2));
        let bridge = platform.add_pci(0, 0, 0, 0x1910);
        bridge.set64(0x48, 0xFED1_0000 | 1);
        let window = platform.add_mmio(0xFED1_5000, 0x1000);

        let mut pcm = coordinator(&platform, test_config());
        pcm.program().expect("program");
        assert!(pcm.memory_traffic_metrics_available());

        let before = pcm.get_system_counter_state().expect("before");
        window.set32(0x50, 1_000);
        window.set32(0x54, 500);
        let after = pcm.get_system_counter_state().expect("after");
        assert_eq!(derived::get_bytes_read_from_mc(&before, &after), 64_000);
        assert_eq!(derived::get_bytes_written_to_mc(&before, &after), 32_000);
    }

    #[test]
    fn test_server_uncore_state_carries_energy() {
        let platform = Arc::new(MockPlatform::new(SKX_SIGNATURE, 1, 1));
        platform
            .msr(0)
            .set(pmuflow_raw::arch::rapl::msr::MSR_PKG_ENERGY_STATUS, 0x1234);
        let mut pcm = coordinator(&platform, test_config());
        pcm.program().expect("program");
        let state = pcm.get_server_uncore_counter_state(0).expect("state");
        assert_eq!(state.package_energy_status, 0x1234);
        assert!(state.generation > 0);
    }
}
