use std::ffi::c_void;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::path::Path;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::common::platform::MmioDevice;
use crate::error::{PmuError, Result};

const PAGE_SIZE: u64 = 4096;

/// A physical address window mapped from `/dev/mem`
pub struct LinuxMmio {
    base: *mut c_void,
    map_len: usize,
    /// Distance from the page-aligned mapping start to the requested address
    skew: usize,
    size: usize,
}

// The mapping is plain device memory accessed with volatile loads/stores
unsafe impl Send for LinuxMmio {}
unsafe impl Sync for LinuxMmio {}

impl LinuxMmio {
    pub fn map(dev_mem: &Path, physical: u64, size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dev_mem)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    PmuError::AccessDenied(format!("{}: {e}", dev_mem.display()))
                }
                _ => PmuError::MmioError(format!("Failed to open {}: {e}", dev_mem.display())),
            })?;

        let aligned = physical & !(PAGE_SIZE - 1);
        let skew = (physical - aligned) as usize;
        let map_len = NonZeroUsize::new(skew + size)
            .ok_or_else(|| PmuError::MmioError("zero-length MMIO window".to_string()))?;
        let offset = libc::off_t::try_from(aligned).map_err(|_| {
            PmuError::MmioError(format!("physical address 0x{physical:x} out of range"))
        })?;

        // SAFETY: a fresh shared mapping of device memory; nothing else in
        // this process aliases it
        let base = unsafe {
            mmap(
                None,
                map_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                Some(&file),
                offset,
            )
        }
        .map_err(|e| PmuError::MmioError(format!("mmap of 0x{physical:x} failed: {e}")))?;

        tracing::debug!("Mapped MMIO 0x{:x} (+0x{:x})", physical, size);

        Ok(Self {
            base,
            map_len: map_len.get(),
            skew,
            size,
        })
    }

    fn ptr<T>(&self, offset: u64) -> Result<*mut T> {
        let width = std::mem::size_of::<T>() as u64;
        if offset % width != 0 || offset + width > self.size as u64 {
            return Err(PmuError::MmioError(format!(
                "offset 0x{offset:x} outside a 0x{:x}-byte window",
                self.size
            )));
        }
        // SAFETY: bounds and alignment checked above
        Ok(unsafe { (self.base as *mut u8).add(self.skew + offset as usize) as *mut T })
    }
}

impl MmioDevice for LinuxMmio {
    fn read32(&self, offset: u64) -> Result<u32> {
        let ptr = self.ptr::<u32>(offset)?;
        Ok(unsafe { std::ptr::read_volatile(ptr) })
    }

    fn write32(&self, offset: u64, value: u32) -> Result<()> {
        let ptr = self.ptr::<u32>(offset)?;
        unsafe { std::ptr::write_volatile(ptr, value) };
        Ok(())
    }

    fn read64(&self, offset: u64) -> Result<u64> {
        let ptr = self.ptr::<u64>(offset)?;
        Ok(unsafe { std::ptr::read_volatile(ptr) })
    }

    fn write64(&self, offset: u64, value: u64) -> Result<()> {
        let ptr = self.ptr::<u64>(offset)?;
        unsafe { std::ptr::write_volatile(ptr, value) };
        Ok(())
    }
}

impl Drop for LinuxMmio {
    fn drop(&mut self) {
        // SAFETY: base/map_len come from the successful mmap in `map`
        if let Err(e) = unsafe { munmap(self.base, self.map_len) } {
            tracing::warn!("munmap failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device() {
        let result = LinuxMmio::map(Path::new("/nonexistent/mem"), 0x1000, 0x100);
        assert!(matches!(result, Err(PmuError::MmioError(_))));
    }

    #[test]
    fn test_bounds_are_checked() {
        // A regular file stands in for /dev/mem
        let path = std::env::temp_dir().join(format!("pmuflow-mmio-{}", std::process::id()));
        std::fs::write(&path, vec![0u8; 8192]).expect("scratch file");

        let window = LinuxMmio::map(&path, 0x1010, 0x20).expect("map");
        window.write64(0x8, 0xDEAD_BEEF_0000_0001).expect("write");
        assert_eq!(window.read64(0x8).expect("read"), 0xDEAD_BEEF_0000_0001);
        assert_eq!(window.read32(0x8).expect("read"), 0x0000_0001);
        assert!(window.read64(0x20).is_err());
        assert!(window.read32(0x2).is_err());

        drop(window);
        let _ = std::fs::remove_file(&path);
    }
}
