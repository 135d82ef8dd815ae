//! Raw event descriptions for user-selected programming
//!
//! An event is written `<pmu>/config=<v>[,config1=<v>][,config2=<v>][,name=<s>]`,
//! numbers in decimal or `0x` hex.

use std::fmt;
use std::str::FromStr;

use crate::error::{PmuError, Result};
use crate::metrics::state::UnitKind;

/// PMU family a raw event is programmed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmuType {
    Core,
    Mc,
    M2m,
    Xpi,
    Cha,
    Iio,
    Pcu,
    Ha,
    Edc,
    Cxl,
    Idx,
}

impl PmuType {
    /// Uncore unit family backing this PMU type; `None` for core events
    pub fn unit_kind(self) -> Option<UnitKind> {
        match self {
            PmuType::Core => None,
            PmuType::Mc => Some(UnitKind::Mc),
            // Home agents and M2M share the memory-side boxes
            PmuType::M2m | PmuType::Ha => Some(UnitKind::M2m),
            PmuType::Xpi => Some(UnitKind::Xpi),
            PmuType::Cha => Some(UnitKind::Cha),
            PmuType::Iio => Some(UnitKind::Iio),
            PmuType::Pcu => Some(UnitKind::Pcu),
            PmuType::Edc => Some(UnitKind::Edc),
            PmuType::Cxl => Some(UnitKind::Cxl),
            PmuType::Idx => Some(UnitKind::Idx),
        }
    }
}

impl FromStr for PmuType {
    type Err = PmuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "core" | "cpu" => Ok(PmuType::Core),
            "imc" | "mc" => Ok(PmuType::Mc),
            "m2m" => Ok(PmuType::M2m),
            "upi" | "qpi" | "xpi" | "upi_ll" => Ok(PmuType::Xpi),
            "cha" | "cbo" => Ok(PmuType::Cha),
            "iio" => Ok(PmuType::Iio),
            "pcu" => Ok(PmuType::Pcu),
            "ha" => Ok(PmuType::Ha),
            "edc" => Ok(PmuType::Edc),
            "cxl" | "cxlcm" => Ok(PmuType::Cxl),
            "idx" | "dsa" | "iaa" | "qat" => Ok(PmuType::Idx),
            other => Err(PmuError::ConfigError(format!("unknown PMU type '{other}'"))),
        }
    }
}

impl fmt::Display for PmuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PmuType::Core => "core",
            PmuType::Mc => "imc",
            PmuType::M2m => "m2m",
            PmuType::Xpi => "xpi",
            PmuType::Cha => "cha",
            PmuType::Iio => "iio",
            PmuType::Pcu => "pcu",
            PmuType::Ha => "ha",
            PmuType::Edc => "edc",
            PmuType::Cxl => "cxl",
            PmuType::Idx => "idx",
        };
        f.write_str(name)
    }
}

/// One raw event: `config[0]` is the control register encoding. For core
/// events `config[1..]` are the offcore response values, for accelerator
/// events the filter values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEventConfig {
    pub config: [u64; 3],
    pub name: String,
}

fn parse_number(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| PmuError::ConfigError(format!("bad event value '{s}': {e}")))
}

impl RawEventConfig {
    /// Parse `<pmu>/<term>,<term>.../`
    pub fn parse(spec: &str) -> Result<(PmuType, RawEventConfig)> {
        let (pmu, terms) = spec
            .trim()
            .split_once('/')
            .ok_or_else(|| PmuError::ConfigError(format!("event '{spec}' lacks a PMU prefix")))?;
        let pmu: PmuType = pmu.parse()?;

        let mut event = RawEventConfig::default();
        let mut has_config = false;
        for term in terms.trim_end_matches('/').split(',') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let (key, value) = term
                .split_once('=')
                .ok_or_else(|| PmuError::ConfigError(format!("bad event term '{term}'")))?;
            match key.trim() {
                "config" => {
                    event.config[0] = parse_number(value)?;
                    has_config = true;
                }
                "config1" => event.config[1] = parse_number(value)?,
                "config2" => event.config[2] = parse_number(value)?,
                "name" => event.name = value.trim().to_string(),
                other => {
                    return Err(PmuError::ConfigError(format!("unknown event term '{other}'")))
                }
            }
        }
        if !has_config {
            return Err(PmuError::ConfigError(format!("event '{spec}' has no config")));
        }
        if event.name.is_empty() {
            event.name = format!("{}_0x{:x}", pmu, event.config[0]);
        }
        Ok((pmu, event))
    }
}
