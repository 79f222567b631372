use thiserror::Error;

use crate::types::ScanRunId;

/// Error taxonomy of the scanning engine.
///
/// `ProbeTimeout` is produced inside the probes and always absorbed into a
/// not-alive / filtered result; it never reaches a trigger-API caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Range {cidr} spans {addresses} addresses, above the limit of {limit}")]
    RangeTooLarge {
        cidr: String,
        addresses: u128,
        limit: u64,
    },

    #[error("A scan is already running for range {range}")]
    AlreadyRunning { range: String },

    #[error("Probe of {target} timed out after {timeout_ms}ms")]
    ProbeTimeout { target: String, timeout_ms: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Unknown scan run: {0}")]
    UnknownScan(ScanRunId),
}

impl ScanError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::Configuration(_) => "configuration_error",
            ScanError::RangeTooLarge { .. } => "range_too_large",
            ScanError::AlreadyRunning { .. } => "scan_already_running",
            ScanError::ProbeTimeout { .. } => "probe_timeout",
            ScanError::Persistence(_) => "persistence_error",
            ScanError::UnknownScan(_) => "unknown_scan",
        }
    }
}
