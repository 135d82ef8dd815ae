//! In-memory devices for tests
//!
//! Each mock keeps a sparse register file. Reads of an unset address return
//! zero. A register can be made to advance on every read, optionally gated
//! on a freeze bit in another register, which is how free-running and
//! frozen counters are simulated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::platform::{
    MmioDevice, MsrDevice, PciAddress, PciConfigDevice, Platform,
};
use crate::common::topology::{CpuTopology, Topology};
use crate::error::{PmuError, Result};

#[derive(Default)]
struct RegisterFile {
    values: HashMap<u64, u64>,
    increments: HashMap<u64, u64>,
    /// (control address, freeze mask): increments pause while set
    freeze_gate: Option<(u64, u64)>,
    failing: HashSet<u64>,
    writes: Vec<(u64, u64)>,
    reads: usize,
}

impl RegisterFile {
    fn frozen(&self) -> bool {
        match self.freeze_gate {
            Some((ctl, mask)) => self.values.get(&ctl).copied().unwrap_or(0) & mask != 0,
            None => false,
        }
    }

    fn read(&mut self, addr: u64) -> Option<u64> {
        if self.failing.contains(&addr) {
            return None;
        }
        self.reads += 1;
        let value = self.values.get(&addr).copied().unwrap_or(0);
        if let Some(&step) = self.increments.get(&addr) {
            if !self.frozen() {
                self.values.insert(addr, value.wrapping_add(step));
            }
        }
        Some(value)
    }

    fn write(&mut self, addr: u64, value: u64) -> bool {
        if self.failing.contains(&addr) {
            return false;
        }
        self.writes.push((addr, value));
        self.values.insert(addr, value);
        true
    }
}

/// Shared handle to a mock's register file, for tests poking at state
#[derive(Clone, Default)]
pub struct MockRegisters(Arc<Mutex<RegisterFile>>);

impl MockRegisters {
    pub fn set(&self, addr: u64, value: u64) {
        self.0.lock().values.insert(addr, value);
    }

    pub fn get(&self, addr: u64) -> u64 {
        self.0.lock().values.get(&addr).copied().unwrap_or(0)
    }

    /// Advance `addr` by `step` after every read
    pub fn set_increment(&self, addr: u64, step: u64) {
        self.0.lock().increments.insert(addr, step);
    }

    pub fn set_freeze_gate(&self, control: u64, mask: u64) {
        self.0.lock().freeze_gate = Some((control, mask));
    }

    pub fn fail(&self, addr: u64) {
        self.0.lock().failing.insert(addr);
    }

    pub fn recover(&self, addr: u64) {
        self.0.lock().failing.remove(&addr);
    }

    pub fn writes(&self) -> Vec<(u64, u64)> {
        self.0.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.0.lock().writes.clear();
    }

    pub fn read_count(&self) -> usize {
        self.0.lock().reads
    }
}

pub struct MockMsr {
    cpu: u32,
    regs: MockRegisters,
}

impl MockMsr {
    pub fn new(cpu: u32) -> Self {
        Self {
            cpu,
            regs: MockRegisters::default(),
        }
    }

    pub fn registers(&self) -> MockRegisters {
        self.regs.clone()
    }

    pub fn set(&self, addr: u64, value: u64) {
        self.regs.set(addr, value);
    }

    pub fn get(&self, addr: u64) -> u64 {
        self.regs.get(addr)
    }

    pub fn writes(&self) -> Vec<(u64, u64)> {
        self.regs.writes()
    }
}

impl MsrDevice for MockMsr {
    fn cpu(&self) -> u32 {
        self.cpu
    }

    fn read(&self, addr: u64) -> Result<u64> {
        self.regs
            .0
            .lock()
            .read(addr)
            .ok_or_else(|| PmuError::MsrError(format!("mock read of 0x{addr:x} failed")))
    }

    fn write(&self, addr: u64, value: u64) -> Result<()> {
        if self.regs.0.lock().write(addr, value) {
            Ok(())
        } else {
            Err(PmuError::MsrError(format!("mock write of 0x{addr:x} failed")))
        }
    }
}

/// Configuration space stored as dwords
pub struct MockPci {
    address: PciAddress,
    regs: MockRegisters,
}

impl MockPci {
    pub fn new(device_id: u32) -> Self {
        Self::at(
            PciAddress {
                group_number: 0,
                bus: 0,
                device: 0,
                function: 0,
            },
            device_id,
        )
    }

    pub fn at(address: PciAddress, device_id: u32) -> Self {
        let regs = MockRegisters::default();
        regs.set(0, ((device_id as u64) << 16) | 0x8086);
        Self { address, regs }
    }

    pub fn registers(&self) -> MockRegisters {
        self.regs.clone()
    }

    pub fn set32(&self, offset: u32, value: u32) {
        self.regs.set(offset as u64, value as u64);
    }

    /// Store a 64-bit value as two dwords
    pub fn set64(&self, offset: u32, value: u64) {
        self.set32(offset, value as u32);
        self.set32(offset + 4, (value >> 32) as u32);
    }

    pub fn get32(&self, offset: u32) -> u32 {
        self.regs.get(offset as u64) as u32
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.regs
            .writes()
            .into_iter()
            .map(|(a, v)| (a as u32, v as u32))
            .collect()
    }
}

impl PciConfigDevice for MockPci {
    fn address(&self) -> PciAddress {
        self.address
    }

    fn read32(&self, offset: u32) -> Result<u32> {
        self.regs
            .0
            .lock()
            .read(offset as u64)
            .map(|v| v as u32)
            .ok_or_else(|| PmuError::PciError(format!("mock read of 0x{offset:x} failed")))
    }

    fn write32(&self, offset: u32, value: u32) -> Result<()> {
        if self.regs.0.lock().write(offset as u64, value as u64) {
            Ok(())
        } else {
            Err(PmuError::PciError(format!("mock write of 0x{offset:x} failed")))
        }
    }
}

/// MMIO window stored as dwords
pub struct MockMmio {
    size: usize,
    regs: MockRegisters,
}

impl MockMmio {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            regs: MockRegisters::default(),
        }
    }

    pub fn registers(&self) -> MockRegisters {
        self.regs.clone()
    }

    pub fn set32(&self, offset: u64, value: u32) {
        self.regs.set(offset, value as u64);
    }

    pub fn set64(&self, offset: u64, value: u64) {
        self.set32(offset, value as u32);
        self.set32(offset + 4, (value >> 32) as u32);
    }

    pub fn get64(&self, offset: u64) -> u64 {
        self.regs.get(offset) | (self.regs.get(offset + 4) << 32)
    }

    fn check(&self, offset: u64, width: u64) -> Result<()> {
        if offset % width != 0 || offset + width > self.size as u64 {
            return Err(PmuError::MmioError(format!(
                "mock offset 0x{offset:x} outside window"
            )));
        }
        Ok(())
    }
}

impl MmioDevice for MockMmio {
    fn read32(&self, offset: u64) -> Result<u32> {
        self.check(offset, 4)?;
        self.regs
            .0
            .lock()
            .read(offset)
            .map(|v| v as u32)
            .ok_or_else(|| PmuError::MmioError(format!("mock read of 0x{offset:x} failed")))
    }

    fn write32(&self, offset: u64, value: u32) -> Result<()> {
        self.check(offset, 4)?;
        self.regs.0.lock().write(offset, value as u64);
        Ok(())
    }

    fn read64(&self, offset: u64) -> Result<u64> {
        self.check(offset, 8)?;
        let mut regs = self.regs.0.lock();
        let low = regs
            .read(offset)
            .ok_or_else(|| PmuError::MmioError(format!("mock read of 0x{offset:x} failed")))?;
        let high = regs.values.get(&(offset + 4)).copied().unwrap_or(0);
        Ok((low & 0xFFFF_FFFF) | (high << 32))
    }

    fn write64(&self, offset: u64, value: u64) -> Result<()> {
        self.check(offset, 8)?;
        let mut regs = self.regs.0.lock();
        regs.write(offset, value & 0xFFFF_FFFF);
        regs.values.insert(offset + 4, value >> 32);
        Ok(())
    }
}

/// A machine made of mock devices
pub struct MockPlatform {
    signature: u32,
    topology: Topology,
    msrs: HashMap<u32, Arc<MockMsr>>,
    pci: Mutex<Vec<(PciAddress, u32, Arc<MockPci>)>>,
    mmio: Mutex<HashMap<u64, Arc<MockMmio>>>,
    discovery: Vec<Vec<u64>>,
}

impl MockPlatform {
    /// `sockets` x `cores_per_socket` CPUs without SMT
    pub fn new(signature: u32, sockets: u32, cores_per_socket: u32) -> Self {
        let cpus: Vec<CpuTopology> = (0..sockets * cores_per_socket)
            .map(|i| CpuTopology {
                os_id: i,
                socket: i / cores_per_socket,
                core_id: i % cores_per_socket,
                thread_id: 0,
            })
            .collect();
        let msrs = cpus
            .iter()
            .map(|c| (c.os_id, Arc::new(MockMsr::new(c.os_id))))
            .collect();
        Self {
            signature,
            topology: Topology::new(cpus),
            msrs,
            pci: Mutex::new(Vec::new()),
            mmio: Mutex::new(HashMap::new()),
            discovery: Vec::new(),
        }
    }

    pub fn msr(&self, cpu: u32) -> Arc<MockMsr> {
        Arc::clone(&self.msrs[&cpu])
    }

    /// Register an Intel PCI function on `bus`
    pub fn add_pci(&self, bus: u32, device: u32, function: u32, device_id: u32) -> Arc<MockPci> {
        let address = PciAddress {
            group_number: 0,
            bus,
            device,
            function,
        };
        let dev = Arc::new(MockPci::at(address, device_id));
        self.pci.lock().push((address, device_id, Arc::clone(&dev)));
        dev
    }

    pub fn add_mmio(&self, physical: u64, size: usize) -> Arc<MockMmio> {
        let window = Arc::new(MockMmio::new(size));
        self.mmio.lock().insert(physical, Arc::clone(&window));
        window
    }

    pub fn with_discovery(mut self, tables: Vec<Vec<u64>>) -> Self {
        self.discovery = tables;
        self
    }
}

impl Platform for MockPlatform {
    fn cpu_signature(&self) -> u32 {
        self.signature
    }

    fn topology(&self) -> Result<Topology> {
        Ok(self.topology.clone())
    }

    fn open_msr(&self, cpu: u32) -> Result<Arc<dyn MsrDevice>> {
        self.msrs
            .get(&cpu)
            .map(|m| Arc::clone(m) as Arc<dyn MsrDevice>)
            .ok_or_else(|| PmuError::MsrError(format!("no mock MSR for CPU {cpu}")))
    }

    fn find_pci(&self, device: u32, function: u32, device_id: u32) -> Result<Vec<PciAddress>> {
        let mut found: Vec<PciAddress> = self
            .pci
            .lock()
            .iter()
            .filter(|(a, id, _)| a.device == device && a.function == function && *id == device_id)
            .map(|(a, _, _)| *a)
            .collect();
        found.sort();
        Ok(found)
    }

    fn open_pci(&self, address: PciAddress) -> Result<Arc<dyn PciConfigDevice>> {
        self.pci
            .lock()
            .iter()
            .find(|(a, _, _)| *a == address)
            .map(|(_, _, d)| Arc::clone(d) as Arc<dyn PciConfigDevice>)
            .ok_or_else(|| PmuError::PciError(format!("no mock PCI device at {address}")))
    }

    fn map_mmio(&self, physical: u64, _size: usize) -> Result<Arc<dyn MmioDevice>> {
        self.mmio
            .lock()
            .get(&physical)
            .map(|w| Arc::clone(w) as Arc<dyn MmioDevice>)
            .ok_or_else(|| PmuError::MmioError(format!("no mock MMIO window at 0x{physical:x}")))
    }

    fn discovery_tables(&self) -> Result<Vec<Vec<u64>>> {
        Ok(self.discovery.clone())
    }
}
