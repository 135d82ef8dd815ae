use std::io;
use thiserror::Error;

use pmuflow_raw::discovery::DiscoveryError;

#[derive(Error, Debug)]
pub enum PmuError {
    #[error("MSR operation failed: {0}")]
    MsrError(String),

    #[error("PCI operation failed: {0}")]
    PciError(String),

    #[error("MMIO operation failed: {0}")]
    MmioError(String),

    #[error("Affinity operation failed: {0}")]
    AffinityError(String),

    #[error("Resctrl operation failed: {0}")]
    ResctrlError(String),

    #[error("RDT operation failed: {0}")]
    RdtError(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("PMU is in use by another agent: {0}")]
    PmuBusy(String),

    #[error("Unsupported processor: {0}")]
    UnsupportedProcessor(String),

    #[error("Width-extended register accepts only a reset (0), got 0x{0:x}")]
    InvalidRegisterWrite(u64),

    #[error("Uncore discovery failed: {0}")]
    DiscoveryError(#[from] DiscoveryError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Nix error: {0}")]
    NixError(#[from] nix::Error),

    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, PmuError>;

/// Outcome of a programming request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    MsrAccessDenied,
    PmuBusy,
    UnknownError,
}

impl PmuError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PmuError::AccessDenied(_) => ErrorCode::MsrAccessDenied,
            PmuError::PmuBusy(_) => ErrorCode::PmuBusy,
            PmuError::IoError(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                ErrorCode::MsrAccessDenied
            }
            PmuError::NixError(nix::Error::EACCES | nix::Error::EPERM) => {
                ErrorCode::MsrAccessDenied
            }
            _ => ErrorCode::UnknownError,
        }
    }
}

impl ErrorCode {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ErrorCode::Success,
            Err(e) => e.code(),
        }
    }
}
