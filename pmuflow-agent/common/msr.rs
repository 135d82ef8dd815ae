use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::common::affinity::AffinityGuard;
use crate::common::platform::MsrDevice;
use crate::error::{PmuError, Result};

/// `/dev/cpu/N/msr` of one logical CPU
pub struct LinuxMsr {
    file: parking_lot::Mutex<File>,
    cpu_id: u32,
}

impl LinuxMsr {
    pub fn open(path: &Path, cpu: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => PmuError::AccessDenied(format!(
                    "{} for CPU {cpu} (root and the msr module are required)",
                    path.display()
                )),
                _ => PmuError::MsrError(format!(
                    "Failed to open {} for CPU {cpu}: {e}",
                    path.display()
                )),
            })?;

        tracing::debug!("Opened MSR handle {} for core {}", file.as_raw_fd(), cpu);

        Ok(Self {
            file: parking_lot::Mutex::new(file),
            cpu_id: cpu,
        })
    }

    fn seek(&self, file: &mut File, addr: u64) -> Result<()> {
        file.seek(SeekFrom::Start(addr)).map_err(|e| {
            PmuError::MsrError(format!(
                "Failed to seek to MSR 0x{:X} on CPU {}: {}",
                addr, self.cpu_id, e
            ))
        })?;
        Ok(())
    }
}

impl MsrDevice for LinuxMsr {
    fn cpu(&self) -> u32 {
        self.cpu_id
    }

    fn read(&self, addr: u64) -> Result<u64> {
        let _affinity = AffinityGuard::new(self.cpu_id)?;
        let mut file = self.file.lock();
        self.seek(&mut file, addr)?;

        let mut buffer = [0u8; 8];
        file.read_exact(&mut buffer).map_err(|e| {
            PmuError::MsrError(format!(
                "Failed to read MSR 0x{:X} on CPU {}: {}",
                addr, self.cpu_id, e
            ))
        })?;

        let value = u64::from_ne_bytes(buffer);
        tracing::debug!(
            "MSR read: CPU {} MSR 0x{:08x} = 0x{:016x}",
            self.cpu_id,
            addr,
            value
        );
        Ok(value)
    }

    fn write(&self, addr: u64, value: u64) -> Result<()> {
        let _affinity = AffinityGuard::new(self.cpu_id)?;
        let mut file = self.file.lock();
        self.seek(&mut file, addr)?;

        file.write_all(&value.to_ne_bytes()).map_err(|e| {
            PmuError::MsrError(format!(
                "Failed to write MSR 0x{:X} on CPU {}: {}",
                addr, self.cpu_id, e
            ))
        })?;

        tracing::debug!(
            "MSR write: CPU {} MSR 0x{:08x} <- 0x{:016x}",
            self.cpu_id,
            addr,
            value
        );
        Ok(())
    }
}
