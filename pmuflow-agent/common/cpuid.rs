use pmuflow_raw::{CpuModel, CpuSignature};

use crate::error::{PmuError, Result};

#[cfg(target_arch = "x86_64")]
pub fn cpuid(eax: u32, ecx: u32) -> (u32, u32, u32, u32) {
    let mut ebx: u32;
    let mut edx: u32;
    let mut eax_out = eax;
    let mut ecx_out = ecx;

    unsafe {
        std::arch::asm!(
            "mov {0:r}, rbx",
            "cpuid",
            "xchg {0:r}, rbx",
            out(reg) ebx,
            inout("eax") eax_out,
            inout("ecx") ecx_out,
            out("edx") edx,
            options(nostack, preserves_flags)
        );
    }

    (eax_out, ebx, ecx_out, edx)
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cpuid(_eax: u32, _ecx: u32) -> (u32, u32, u32, u32) {
    (0, 0, 0, 0)
}

/// Resolve the processor generation from a CPUID leaf 1 EAX value
pub fn detect_model(signature_eax: u32) -> Result<(CpuModel, CpuSignature)> {
    let sig = CpuSignature::from_eax(signature_eax);
    tracing::info!(
        "CPU: Family {:X}, Model {:X}, Stepping {:X}",
        sig.family,
        sig.model,
        sig.stepping
    );

    let model = CpuModel::identify(sig).ok_or_else(|| {
        PmuError::UnsupportedProcessor(format!(
            "family 0x{:X} model 0x{:X} stepping {}",
            sig.family, sig.model, sig.stepping
        ))
    })?;

    tracing::info!("Detected CPU architecture: {}", model.name());
    Ok((model, sig))
}

/// Architectural performance monitoring capabilities (leaf 0xA)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfmonInfo {
    pub version: u32,
    pub gp_counters: u32,
    pub gp_width: u32,
    pub fixed_counters: u32,
}

impl PerfmonInfo {
    pub fn from_leaf(eax: u32, edx: u32) -> Self {
        Self {
            version: eax & 0xFF,
            gp_counters: (eax >> 8) & 0xFF,
            gp_width: (eax >> 16) & 0xFF,
            fixed_counters: edx & 0x1F,
        }
    }

    pub fn query() -> Self {
        let (eax, _ebx, _ecx, edx) = cpuid(0xA, 0);
        Self::from_leaf(eax, edx)
    }
}

/// Bytes per MBM counter increment (CPUID leaf 0xF sub-leaf 1, EBX)
pub fn mbm_scaling_factor() -> u64 {
    let (_eax, ebx, _ecx, _edx) = cpuid(0x0F, 0x1);

    if ebx == 0 {
        tracing::warn!("MBM scaling factor is 0, defaulting to 1");
        1
    } else {
        tracing::info!("MBM scaling factor: {}", ebx);
        ebx as u64
    }
}

/// L3 monitoring (CMT) support: CPUID leaf 7 EBX bit 12 and leaf 0xF
pub fn rdt_monitoring_supported() -> bool {
    let (_eax, ebx, _ecx, _edx) = cpuid(0x7, 0);
    if ebx & (1 << 12) == 0 {
        return false;
    }
    let (_eax, _ebx, _ecx, edx) = cpuid(0xF, 0);
    edx & (1 << 1) != 0
}
