//! CPU model identification
//!
//! Maps the CPUID leaf 1 signature (family, model, stepping) to the processor
//! generations the architecture tables know about.

/// Decoded CPUID leaf 1 signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSignature {
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
}

impl CpuSignature {
    /// Decode the EAX value returned by CPUID leaf 1
    pub fn from_eax(eax: u32) -> Self {
        let stepping = eax & 0xF;
        let model = (eax >> 4) & 0xF;
        let family = (eax >> 8) & 0xF;
        let extended_model = (eax >> 16) & 0xF;
        let extended_family = (eax >> 20) & 0xFF;

        let display_family = if family == 0xF {
            family + extended_family
        } else {
            family
        };

        let display_model = if family == 0x6 || family == 0xF {
            (extended_model << 4) + model
        } else {
            model
        };

        Self {
            family: display_family,
            model: display_model,
            stepping,
        }
    }
}

/// Processor generations with a register-location table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuModel {
    /// Haswell-EP/EX (Xeon E5/E7 v3)
    HaswellX,
    /// Broadwell-EP/EX (Xeon E5/E7 v4)
    BroadwellX,
    /// Knights Landing / Knights Mill (Xeon Phi)
    KnightsLanding,
    /// Skylake-SP
    SkylakeX,
    /// Cascade Lake-SP (Skylake-SP stepping >= 5)
    CascadeLakeX,
    /// Cooper Lake-SP (Skylake-SP stepping >= 10)
    CooperLakeX,
    /// Ice Lake-SP
    IceLakeX,
    /// Snow Ridge (Atom server, Ice Lake uncore)
    SnowRidge,
    /// Sapphire Rapids
    SapphireRapids,
    /// Emerald Rapids
    EmeraldRapids,
    /// Skylake and later client parts (desktop/mobile)
    SkylakeClient,
    /// Ice Lake / Tiger Lake / Alder Lake client parts
    IceLakeClient,
}

impl CpuModel {
    pub fn name(&self) -> &'static str {
        match self {
            CpuModel::HaswellX => "Haswell-EP",
            CpuModel::BroadwellX => "Broadwell-EP",
            CpuModel::KnightsLanding => "Knights Landing",
            CpuModel::SkylakeX => "Skylake-SP",
            CpuModel::CascadeLakeX => "Cascade Lake-SP",
            CpuModel::CooperLakeX => "Cooper Lake-SP",
            CpuModel::IceLakeX => "Ice Lake-SP",
            CpuModel::SnowRidge => "Snow Ridge",
            CpuModel::SapphireRapids => "Sapphire Rapids",
            CpuModel::EmeraldRapids => "Emerald Rapids",
            CpuModel::SkylakeClient => "Skylake client",
            CpuModel::IceLakeClient => "Ice Lake client",
        }
    }

    /// Identify the generation from a decoded signature
    ///
    /// Returns `None` for non-Intel families and for models without a table.
    pub fn identify(sig: CpuSignature) -> Option<Self> {
        if sig.family != 0x6 {
            return None;
        }

        let model = match sig.model {
            0x3F => CpuModel::HaswellX,
            0x4F | 0x56 => CpuModel::BroadwellX,
            0x57 | 0x85 => CpuModel::KnightsLanding,
            0x55 => match sig.stepping {
                0..=4 => CpuModel::SkylakeX,
                5..=9 => CpuModel::CascadeLakeX,
                _ => CpuModel::CooperLakeX,
            },
            0x6A | 0x6C => CpuModel::IceLakeX,
            0x86 => CpuModel::SnowRidge,
            0x8F => CpuModel::SapphireRapids,
            0xCF => CpuModel::EmeraldRapids,
            0x4E | 0x5E | 0x8E | 0x9E | 0xA5 | 0xA6 => CpuModel::SkylakeClient,
            0x7D | 0x7E | 0x8C | 0x8D | 0x97 | 0x9A | 0xB7 | 0xBA | 0xBF => {
                CpuModel::IceLakeClient
            }
            _ => return None,
        };

        Some(model)
    }

    /// Server parts with PCI/MSR uncore PMUs
    pub fn is_server(&self) -> bool {
        !matches!(self, CpuModel::SkylakeClient | CpuModel::IceLakeClient)
    }

    /// Parts whose uncore follows the ICX+ unit control layout and programming
    pub fn has_icx_uncore(&self) -> bool {
        matches!(
            self,
            CpuModel::IceLakeX
                | CpuModel::SnowRidge
                | CpuModel::SapphireRapids
                | CpuModel::EmeraldRapids
        )
    }

    /// Parts that expose the hardware uncore discovery table
    pub fn has_uncore_discovery(&self) -> bool {
        matches!(self, CpuModel::SapphireRapids | CpuModel::EmeraldRapids)
    }
}
