//! Server uncore PMUs of every socket
//!
//! Boxes are located once from the [`ArchDescriptor`] tables (PCI devices,
//! MSR ranges, MMIO windows) or from the hardware discovery table, and kept
//! in a [`RegisterLocations`] per socket. Missing units stay in place as
//! invalid boxes so unit indices are stable across sockets and snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use pmuflow_raw::arch::sapphirerapids::IdxLayout;
use pmuflow_raw::arch::uncore::{
    ProgramStyle, UncoreCounterControl, UnitControlLayout, MAX_COUNTERS_PER_BOX,
    UNCORE_COUNTER_WIDTH_BITS, UNC_PMON_CTL_EN,
};
use pmuflow_raw::arch::{
    slot, ArchDescriptor, BoxLayout, BoxLocation, McLocation, MmioMcLayout, MsrBoxes, PciBoxes,
    PciLocation,
};
use pmuflow_raw::discovery::{box_type, AccessType, DiscoveryError, DiscoveryTable, UnitEntry};
use pmuflow_raw::{counter_mask, RegisterLayout};

use crate::common::platform::{MmioDevice, MsrDevice, PciAddress, PciConfigDevice, Platform};
use crate::common::register::{
    MmioRegister32, MmioRegister64, MsrRegister, PciCfgRegister32, PciCfgRegister64, RegisterRef,
};
use crate::common::topology::Topology;
use crate::common::whitelist::AccessFilter;
use crate::counters::uncore_pmu::{BoxSnapshot, IdxCounter, IdxEvent, IdxPmu, UncorePmu};
use crate::error::{PmuError, Result};
use crate::metrics::state::{ServerUncoreCounterState, UnitCounters, UnitKind};

const PAGE_SIZE: u64 = 0x1000;

/// Uncore boxes of one socket, indexed like the matching state vectors
#[derive(Default)]
pub struct RegisterLocations {
    pub mc: Vec<UncorePmu>,
    pub edc: Vec<UncorePmu>,
    /// M2M blocks, or home agents before Skylake-SP
    pub m2m: Vec<UncorePmu>,
    pub xpi: Vec<UncorePmu>,
    pub iio: Vec<UncorePmu>,
    pub cxl: Vec<UncorePmu>,
    pub cha: Vec<UncorePmu>,
    pub pcu: Vec<UncorePmu>,
    pub idx: Vec<IdxPmu>,
}

const BOX_KINDS: [UnitKind; 8] = [
    UnitKind::Mc,
    UnitKind::Edc,
    UnitKind::M2m,
    UnitKind::Xpi,
    UnitKind::Iio,
    UnitKind::Cxl,
    UnitKind::Cha,
    UnitKind::Pcu,
];

impl RegisterLocations {
    /// Boxes of `kind`; accelerators are not boxes and yield nothing
    pub fn boxes(&self, kind: UnitKind) -> &[UncorePmu] {
        match kind {
            UnitKind::Mc => &self.mc,
            UnitKind::Edc => &self.edc,
            UnitKind::M2m => &self.m2m,
            UnitKind::Xpi => &self.xpi,
            UnitKind::Iio => &self.iio,
            UnitKind::Cxl => &self.cxl,
            UnitKind::Cha => &self.cha,
            UnitKind::Pcu => &self.pcu,
            UnitKind::Idx => &[],
        }
    }

    fn boxes_mut(&mut self, kind: UnitKind) -> &mut [UncorePmu] {
        match kind {
            UnitKind::Mc => &mut self.mc,
            UnitKind::Edc => &mut self.edc,
            UnitKind::M2m => &mut self.m2m,
            UnitKind::Xpi => &mut self.xpi,
            UnitKind::Iio => &mut self.iio,
            UnitKind::Cxl => &mut self.cxl,
            UnitKind::Cha => &mut self.cha,
            UnitKind::Pcu => &mut self.pcu,
            UnitKind::Idx => &mut [],
        }
    }

    pub fn valid_units(&self, kind: UnitKind) -> usize {
        match kind {
            UnitKind::Idx => self.idx.len(),
            _ => self.boxes(kind).iter().filter(|b| b.valid()).count(),
        }
    }
}

/// Build a box from a layout given how to make its narrow (control) and
/// wide (counter) registers
fn assemble(
    layout: &BoxLayout,
    unit: UnitControlLayout,
    narrow: impl Fn(u64) -> RegisterRef,
    wide: impl Fn(u64) -> RegisterRef,
) -> Result<UncorePmu> {
    let counters = layout.counters.min(MAX_COUNTERS_PER_BOX);
    let mut pmu = UncorePmu::new(
        Some(narrow(layout.unit_control)),
        (0..counters).map(|i| narrow(layout.control(i))).collect(),
        (0..counters).map(|i| wide(layout.value(i))).collect(),
        unit,
    )?;
    if let (Some(control), Some(value)) = (layout.fixed_control, layout.fixed_value) {
        pmu = pmu.with_fixed(narrow(control), wide(value));
    }
    let filters = [layout.filters[0].map(&narrow), layout.filters[1].map(&narrow)];
    Ok(pmu.with_filters(filters))
}

struct Builder<'a> {
    platform: &'a dyn Platform,
    filter: Arc<dyn AccessFilter>,
    layout: UnitControlLayout,
    instances: HashMap<PciLocation, Vec<PciAddress>>,
}

impl<'a> Builder<'a> {
    /// Every instance of a PCI unit, one per socket in bus order
    fn instances(&mut self, location: PciLocation) -> Vec<PciAddress> {
        if let Some(found) = self.instances.get(&location) {
            return found.clone();
        }
        let found = self
            .platform
            .find_pci(location.device, location.function, location.device_id)
            .unwrap_or_else(|e| {
                tracing::warn!(
                    "PCI scan for {:02x}.{} (0x{:04x}) failed: {}",
                    location.device,
                    location.function,
                    location.device_id,
                    e
                );
                Vec::new()
            });
        self.instances.insert(location, found.clone());
        found
    }

    fn open_instance(
        &mut self,
        location: PciLocation,
        socket: usize,
    ) -> Option<Arc<dyn PciConfigDevice>> {
        let address = *self.instances(location).get(socket)?;
        match self.platform.open_pci(address) {
            Ok(device) => Some(device),
            Err(e) => {
                tracing::warn!("Cannot open PCI device {}: {}", address, e);
                None
            }
        }
    }

    fn absent(&self) -> UncorePmu {
        UncorePmu::absent(self.layout)
    }

    fn or_absent(&self, result: Result<UncorePmu>, kind: UnitKind, index: usize) -> UncorePmu {
        result.unwrap_or_else(|e| {
            tracing::warn!("{} unit {} unusable: {}", kind.name(), index, e);
            self.absent()
        })
    }

    fn pci_box(
        &self,
        device: &Arc<dyn PciConfigDevice>,
        device_id: u32,
        layout: &BoxLayout,
    ) -> Result<UncorePmu> {
        let narrow = |offset: u64| -> RegisterRef {
            Arc::new(PciCfgRegister32::new(
                Arc::clone(device),
                device_id,
                offset as u32,
                Arc::clone(&self.filter),
            ))
        };
        let wide = |offset: u64| -> RegisterRef {
            Arc::new(PciCfgRegister64::new(
                Arc::clone(device),
                device_id,
                offset as u32,
                Arc::clone(&self.filter),
            ))
        };
        assemble(layout, self.layout, narrow, wide)
    }

    fn msr_box(&self, msr: &Arc<dyn MsrDevice>, layout: &BoxLayout) -> Result<UncorePmu> {
        let reg = |addr: u64| MsrRegister::shared(msr, addr, &self.filter);
        assemble(layout, self.layout, reg, reg)
    }

    fn mmio_box(&self, window: &Arc<dyn MmioDevice>, layout: &BoxLayout) -> Result<UncorePmu> {
        let narrow =
            |offset: u64| -> RegisterRef { Arc::new(MmioRegister32::new(Arc::clone(window), offset)) };
        let wide =
            |offset: u64| -> RegisterRef { Arc::new(MmioRegister64::new(Arc::clone(window), offset)) };
        assemble(layout, self.layout, narrow, wide)
    }

    fn pci_boxes(&mut self, boxes: &PciBoxes, socket: usize, kind: UnitKind) -> Vec<UncorePmu> {
        let mut pmus = Vec::with_capacity(boxes.locations.len());
        for (index, location) in boxes.locations.iter().enumerate() {
            let pmu = match self.open_instance(*location, socket) {
                Some(device) => {
                    let built = self.pci_box(&device, location.device_id, &boxes.layout);
                    self.or_absent(built, kind, index)
                }
                None => {
                    tracing::debug!(
                        "{} unit {} not present on socket {}",
                        kind.name(),
                        index,
                        socket
                    );
                    self.absent()
                }
            };
            pmus.push(pmu);
        }
        pmus
    }

    /// MSR boxes up to `limit`, stopping at the first box whose unit control
    /// cannot be read
    fn msr_boxes(
        &self,
        boxes: &MsrBoxes,
        msr: &Arc<dyn MsrDevice>,
        limit: usize,
        kind: UnitKind,
    ) -> Vec<UncorePmu> {
        let mut pmus = Vec::new();
        for index in 0..boxes.max_units().min(limit) {
            let Some(layout) = boxes.unit(index) else {
                break;
            };
            if let Err(e) = msr.read(layout.unit_control) {
                tracing::debug!(
                    "{} box {} absent (MSR 0x{:x}: {})",
                    kind.name(),
                    index,
                    layout.unit_control,
                    e
                );
                break;
            }
            let built = self.msr_box(msr, &layout);
            pmus.push(self.or_absent(built, kind, index));
        }
        pmus
    }

    /// Memory channels behind MMIO windows whose bases come from the
    /// per-socket configuration registers
    fn mmio_channels(&mut self, mmio: &MmioMcLayout, socket: usize) -> Vec<UncorePmu> {
        let total = mmio.controllers * mmio.channels_per_controller;
        let Some(device) = self.open_instance(mmio.base_device, socket) else {
            tracing::warn!("Memory controller base device missing on socket {}", socket);
            return (0..total).map(|_| self.absent()).collect();
        };

        let base = match device.read32(mmio.base_offset) {
            Ok(raw) => (raw as u64 & mmio.base_mask) << mmio.base_shift,
            Err(e) => {
                tracing::warn!("Cannot read memory controller base: {}", e);
                return (0..total).map(|_| self.absent()).collect();
            }
        };

        let mut pmus = Vec::with_capacity(total);
        for controller in 0..mmio.controllers {
            let mem_offset = mmio.mem_offset + mmio.mem_stride * controller as u32;
            let mem = match device.read32(mem_offset) {
                Ok(raw) => (raw as u64 & mmio.mem_mask) << mmio.mem_shift,
                Err(e) => {
                    tracing::warn!("Cannot read memory controller {} offset: {}", controller, e);
                    pmus.extend((0..mmio.channels_per_controller).map(|_| self.absent()));
                    continue;
                }
            };
            for channel in 0..mmio.channels_per_controller {
                let index = controller * mmio.channels_per_controller + channel;
                let physical =
                    base + mem + mmio.channel_offset + mmio.channel_stride * channel as u64;
                let built = self
                    .platform
                    .map_mmio(physical, mmio.window_size)
                    .and_then(|window| self.mmio_box(&window, &mmio.layout));
                pmus.push(self.or_absent(built, UnitKind::Mc, index));
            }
        }
        pmus
    }

    /// Box described by a discovery table entry
    fn discovered_box(
        &self,
        entry: &UnitEntry,
        msr: Option<&Arc<dyn MsrDevice>>,
    ) -> Result<UncorePmu> {
        let counters = entry.num_regs.min(MAX_COUNTERS_PER_BOX);
        let absolute = BoxLayout {
            unit_control: entry.box_base(),
            counter_control: entry.counter_control(0),
            control_stride: entry.counter_control(1) - entry.counter_control(0),
            counter_value: entry.counter_value(0),
            value_stride: entry.counter_value(1) - entry.counter_value(0),
            counters,
            fixed_control: None,
            fixed_value: None,
            filters: [None, None],
        };

        match entry.access_type {
            AccessType::Msr => {
                let msr = msr.ok_or_else(|| {
                    PmuError::MsrError("no MSR handle for discovered unit".to_string())
                })?;
                self.msr_box(msr, &absolute)
            }
            AccessType::PciCfg => {
                let address = entry.pci_address().ok_or_else(|| {
                    PmuError::PciError(format!("bad unit address 0x{:x}", entry.box_ctrl_addr))
                })?;
                let device = self.platform.open_pci(PciAddress {
                    group_number: address.segment,
                    bus: address.bus,
                    device: address.device,
                    function: address.function,
                })?;
                let (_, device_id) = device.vendor_device_id()?;
                self.pci_box(&device, device_id, &absolute)
            }
            AccessType::Mmio => {
                let page = entry.box_base() & !(PAGE_SIZE - 1);
                let end = [
                    entry.box_base() + 8,
                    entry.counter_control(counters.max(1) - 1) + 8,
                    entry.counter_value(counters.max(1) - 1) + 8,
                ]
                .into_iter()
                .max()
                .unwrap_or(page + PAGE_SIZE);
                let size = (end - page).div_ceil(PAGE_SIZE) * PAGE_SIZE;
                let window = self.platform.map_mmio(page, size as usize)?;
                let relative = BoxLayout {
                    unit_control: absolute.unit_control - page,
                    counter_control: absolute.counter_control - page,
                    counter_value: absolute.counter_value - page,
                    ..absolute
                };
                self.mmio_box(&window, &relative)
            }
            AccessType::Unknown(kind) => Err(DiscoveryError::UnknownAccessType(kind).into()),
        }
    }

    fn discovered_boxes(
        &self,
        table: Option<&DiscoveryTable>,
        box_type: u16,
        msr: Option<&Arc<dyn MsrDevice>>,
        kind: UnitKind,
    ) -> Vec<UncorePmu> {
        let Some(table) = table else {
            return Vec::new();
        };
        table
            .units_of(box_type)
            .into_iter()
            .enumerate()
            .map(|(index, entry)| self.or_absent(self.discovered_box(entry, msr), kind, index))
            .collect()
    }

    fn boxes(
        &mut self,
        location: &BoxLocation,
        socket: usize,
        msr: Option<&Arc<dyn MsrDevice>>,
        discovered: (Option<&DiscoveryTable>, u16),
        kind: UnitKind,
        limit: usize,
    ) -> Vec<UncorePmu> {
        match location {
            BoxLocation::Pci(boxes) => self.pci_boxes(boxes, socket, kind),
            BoxLocation::Msr(boxes) => match msr {
                Some(msr) => self.msr_boxes(boxes, msr, limit, kind),
                None => Vec::new(),
            },
            BoxLocation::Discovered => {
                self.discovered_boxes(discovered.0, discovered.1, msr, kind)
            }
            BoxLocation::Absent => Vec::new(),
        }
    }

    /// Accelerator PMUs; instances are spread over sockets in bus order
    fn idx_pmus(&mut self, idx: &IdxLayout, sockets: usize) -> Vec<(usize, IdxPmu)> {
        let mut pmus = Vec::new();
        for location in idx.devices {
            let instances = self.instances(*location);
            for (i, address) in instances.iter().enumerate() {
                let socket = i * sockets / instances.len();
                match self.idx_pmu(idx, *address) {
                    Ok(pmu) => pmus.push((socket, pmu)),
                    Err(e) => tracing::warn!("Accelerator {} PMU unusable: {}", address, e),
                }
            }
        }
        pmus
    }

    fn idx_pmu(&self, idx: &IdxLayout, address: PciAddress) -> Result<IdxPmu> {
        let device = self.platform.open_pci(address)?;
        let bar = device.read64(idx.bar_offset)? & idx.bar_mask;
        if bar == 0 {
            return Err(PmuError::PciError(format!("{address} has no BAR0")));
        }
        let registers = self.platform.map_mmio(bar, PAGE_SIZE as usize)?;
        let perfmon = (registers.read64(idx.table_offset_register)? & 0xFFFF) * idx.table_multiplier;
        let window = self.platform.map_mmio(bar + perfmon, idx.window_size)?;

        let narrow =
            |offset: u64| -> RegisterRef { Arc::new(MmioRegister32::new(Arc::clone(&window), offset)) };
        let wide =
            |offset: u64| -> RegisterRef { Arc::new(MmioRegister64::new(Arc::clone(&window), offset)) };

        let counters = (0..idx.counters)
            .map(|i| IdxCounter {
                control: wide(idx.config(i)),
                value: wide(idx.data(i)),
                filters: (0..idx.filters_per_counter)
                    .map(|f| narrow(idx.filter(i, f)))
                    .collect(),
            })
            .collect();
        Ok(IdxPmu::new(
            narrow(idx.reset_control),
            narrow(idx.freeze_control),
            narrow(idx.general_control),
            counters,
        ))
    }
}

/// All server uncore PMUs of the machine
pub struct ServerUncorePmus {
    descriptor: ArchDescriptor,
    sockets: Vec<RegisterLocations>,
}

impl ServerUncorePmus {
    pub fn discover(
        platform: &dyn Platform,
        descriptor: &ArchDescriptor,
        topology: &Topology,
        filter: Arc<dyn AccessFilter>,
    ) -> Result<Self> {
        let uses_table = matches!(descriptor.mc, McLocation::Discovered)
            || matches!(descriptor.xpi, BoxLocation::Discovered)
            || matches!(descriptor.ha, BoxLocation::Discovered);
        let tables: Vec<Option<DiscoveryTable>> = if uses_table {
            match platform.discovery_tables() {
                Ok(raw) => raw
                    .iter()
                    .map(|words| {
                        DiscoveryTable::parse(words)
                            .map_err(|e| tracing::warn!("Discovery table rejected: {}", e))
                            .ok()
                    })
                    .collect(),
                Err(e) => {
                    tracing::warn!("No uncore discovery table: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut builder = Builder {
            platform,
            filter,
            layout: descriptor.unit_control,
            instances: HashMap::new(),
        };

        let socket_ids = topology.sockets();
        let mut sockets = Vec::with_capacity(socket_ids.len());
        for (index, &socket) in socket_ids.iter().enumerate() {
            let msr = match topology.socket_ref_core(socket) {
                Some(cpu) => Some(platform.open_msr(cpu)?),
                None => None,
            };
            let msr = msr.as_ref();
            let table = tables.get(index).and_then(Option::as_ref);
            let physical_cores =
                topology.cores_of_socket(socket).len() / topology.threads_per_core().max(1);

            let mc = match &descriptor.mc {
                McLocation::Pci(boxes) => builder.pci_boxes(boxes, index, UnitKind::Mc),
                McLocation::Mmio(mmio) => builder.mmio_channels(mmio, index),
                McLocation::Discovered => {
                    builder.discovered_boxes(table, box_type::MC, msr, UnitKind::Mc)
                }
                // Client memory counters are free running, see `client_imc`
                McLocation::Client(_) | McLocation::Absent => Vec::new(),
            };

            let locations = RegisterLocations {
                mc,
                edc: builder.boxes(&descriptor.edc, index, msr, (table, 0), UnitKind::Edc, usize::MAX),
                m2m: builder.boxes(
                    &descriptor.ha,
                    index,
                    msr,
                    (table, box_type::M2M),
                    UnitKind::M2m,
                    usize::MAX,
                ),
                xpi: builder.boxes(
                    &descriptor.xpi,
                    index,
                    msr,
                    (table, box_type::UPI),
                    UnitKind::Xpi,
                    usize::MAX,
                ),
                iio: builder.boxes(&descriptor.iio, index, msr, (table, box_type::IIO), UnitKind::Iio, usize::MAX),
                cxl: if descriptor.is_available(pmuflow_raw::Availability::CXL_TRAFFIC) {
                    builder.discovered_boxes(table, box_type::CXLCM, msr, UnitKind::Cxl)
                } else {
                    Vec::new()
                },
                cha: builder.boxes(
                    &descriptor.cha,
                    index,
                    msr,
                    (table, box_type::CHA),
                    UnitKind::Cha,
                    physical_cores.max(1),
                ),
                pcu: builder.boxes(&descriptor.pcu, index, msr, (table, box_type::PCU), UnitKind::Pcu, 1),
                idx: Vec::new(),
            };

            tracing::info!(
                "Socket {}: {} memory channels, {} xPI links, {} M2M/HA, {} CHA, {} IIO, {} CXL",
                socket,
                locations.valid_units(UnitKind::Mc),
                locations.valid_units(UnitKind::Xpi),
                locations.valid_units(UnitKind::M2m),
                locations.valid_units(UnitKind::Cha),
                locations.valid_units(UnitKind::Iio),
                locations.valid_units(UnitKind::Cxl),
            );
            sockets.push(locations);
        }

        if let Some(idx) = descriptor.idx() {
            for (socket, pmu) in builder.idx_pmus(&idx, sockets.len()) {
                if let Some(locations) = sockets.get_mut(socket) {
                    locations.idx.push(pmu);
                }
            }
        }

        Ok(Self {
            descriptor: descriptor.clone(),
            sockets,
        })
    }

    pub fn num_sockets(&self) -> usize {
        self.sockets.len()
    }

    pub fn socket(&self, socket: usize) -> Option<&RegisterLocations> {
        self.sockets.get(socket)
    }

    /// Unit control bits a box of `kind` keeps while running
    fn extra(&self, kind: UnitKind) -> u64 {
        let layout = self.descriptor.unit_control;
        match kind {
            UnitKind::Xpi => layout.base(self.descriptor.xpi_unit_extra),
            _ => layout.base(0),
        }
    }

    /// Default event encodings of `kind`, ordered by counter slot
    pub fn default_events(&self, kind: UnitKind, xpi_l1: bool) -> Vec<u64> {
        let d = &self.descriptor;
        let raw = |events: &[UncoreCounterControl]| -> Vec<u64> {
            events.iter().map(|e| e.to_raw()).collect()
        };
        match kind {
            UnitKind::Mc => raw(&d.mc_events),
            UnitKind::Edc => raw(&d.edc_events),
            UnitKind::M2m => raw(&d.ha_events),
            UnitKind::Xpi => {
                let mut events = d.xpi_events;
                if xpi_l1 {
                    events[slot::XPI_POWER] = d.xpi_l1_event;
                }
                raw(&events)
            }
            UnitKind::Iio => raw(&d.iio_events),
            UnitKind::Cxl => raw(&d.cxl_events),
            UnitKind::Cha => raw(&d.cha_events),
            UnitKind::Pcu => raw(&d.pcu_events),
            UnitKind::Idx => Vec::new(),
        }
    }

    /// Program every box with its default events
    pub fn program(&mut self, xpi_l1: bool) -> Result<()> {
        for kind in BOX_KINDS {
            let events = self.default_events(kind, xpi_l1);
            self.program_kind(kind, &events)?;
        }
        Ok(())
    }

    /// Program every box of `kind` on every socket with raw encodings
    pub fn program_kind(&mut self, kind: UnitKind, events: &[u64]) -> Result<()> {
        let extra = self.extra(kind);
        let style = self.descriptor.program_style;
        let events = control_encodings(style, events);
        let events = events.as_slice();
        let filters = self.descriptor.cha_filters;
        for (socket, locations) in self.sockets.iter_mut().enumerate() {
            let mut programmed = 0;
            for pmu in locations.boxes_mut(kind) {
                if !pmu.init_freeze(extra, true)? {
                    continue;
                }
                if kind == UnitKind::Cha {
                    pmu.set_filter(0, filters[0])?;
                    pmu.set_filter(1, filters[1])?;
                }
                pmu.program(events, extra, style)?;
                programmed += 1;
            }
            if programmed > 0 {
                tracing::debug!(
                    "Programmed {} {} boxes on socket {}",
                    programmed,
                    kind.name(),
                    socket
                );
            }
        }
        Ok(())
    }

    /// Program every accelerator PMU
    pub fn program_idx(&mut self, events: &[IdxEvent]) -> Result<()> {
        for locations in &mut self.sockets {
            for pmu in &mut locations.idx {
                pmu.program(events)?;
            }
        }
        Ok(())
    }

    fn unit_counters(pmu: &UncorePmu, extra: u64, kind: UnitKind, index: usize) -> UnitCounters {
        if !pmu.valid() {
            return UnitCounters::absent();
        }
        let mask = counter_mask(UNCORE_COUNTER_WIDTH_BITS);
        match pmu.read_frozen(extra) {
            Ok(BoxSnapshot { counters, fixed }) => UnitCounters {
                present: true,
                counters: counters.into_iter().map(|v| v & mask).collect(),
                fixed: fixed.map(|v| v & mask).unwrap_or(0),
            },
            Err(e) => {
                tracing::warn!("Reading {} unit {} failed: {}", kind.name(), index, e);
                UnitCounters::absent()
            }
        }
    }

    /// Frozen read of every unit of `socket`
    pub fn snapshot(&self, socket: usize) -> ServerUncoreCounterState {
        let mut state = ServerUncoreCounterState {
            availability: self.descriptor.availability,
            socket: socket as u32,
            ..Default::default()
        };
        let Some(locations) = self.sockets.get(socket) else {
            return state;
        };

        for kind in BOX_KINDS {
            let extra = self.extra(kind);
            let boxes = locations.boxes(kind);
            *state.units_mut(kind) = boxes
                .iter()
                .enumerate()
                .map(|(index, pmu)| Self::unit_counters(pmu, extra, kind, index))
                .collect();
            if let Some(generation) = boxes.iter().map(UncorePmu::generation).max() {
                state.generation = state.generation.max(generation);
            }
        }

        state.idx = locations
            .idx
            .iter()
            .enumerate()
            .map(|(index, pmu)| {
                if pmu.generation() == 0 {
                    return UnitCounters::absent();
                }
                match pmu.read_frozen() {
                    Ok(counters) => UnitCounters {
                        present: true,
                        counters,
                        fixed: 0,
                    },
                    Err(e) => {
                        tracing::warn!("Reading accelerator {} failed: {}", index, e);
                        UnitCounters::absent()
                    }
                }
            })
            .collect();
        state
    }

    /// Disable every box; errors are logged and skipped
    pub fn cleanup(&mut self) {
        for (socket, locations) in self.sockets.iter().enumerate() {
            for kind in BOX_KINDS {
                for pmu in locations.boxes(kind) {
                    if let Err(e) = pmu.cleanup() {
                        tracing::warn!(
                            "Cleanup of {} box on socket {} failed: {}",
                            kind.name(),
                            socket,
                            e
                        );
                    }
                }
            }
            for pmu in &locations.idx {
                if let Err(e) = pmu.cleanup() {
                    tracing::warn!("Cleanup of accelerator PMU failed: {}", e);
                }
            }
        }
    }
}

/// Counter control values for `events`. Direct-style boxes take the
/// encoding as written, so the enable bit goes into the encoding here.
fn control_encodings(style: ProgramStyle, events: &[u64]) -> Vec<u64> {
    match style {
        ProgramStyle::Direct => events.iter().map(|e| e | UNC_PMON_CTL_EN).collect(),
        ProgramStyle::EnableFirst => events.to_vec(),
    }
}
