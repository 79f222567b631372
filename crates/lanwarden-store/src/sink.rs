//! The persistence boundary of the scanning engine.
//!
//! The coordinator only ever talks to storage through [`ResultSink`], so the
//! storage technology behind it is replaceable.

use async_trait::async_trait;

use lanwarden_core::{
    Device, DeviceId, PortFinding, ScanError, ScanRun, ScanRunId, ScanStatus, SecurityFinding,
};

/// Errors from result sinks.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Neo4j connection error: {0}")]
    Connection(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Result set rejected: {0}")]
    Rejected(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ScanError {
    fn from(e: StoreError) -> Self {
        ScanError::Persistence(e.to_string())
    }
}

/// Persistence interface consumed by the scan coordinator.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist the full result set of a completed scan run as one unit.
    ///
    /// Observers never see a partially written run: either every record
    /// becomes visible or none does.
    async fn save_scan_result(
        &self,
        run: &ScanRun,
        devices: &[Device],
        ports: &[PortFinding],
        findings: &[SecurityFinding],
    ) -> Result<(), StoreError>;

    /// All devices known for a range key, online and offline.
    async fn get_devices(&self, range: &str) -> Result<Vec<Device>, StoreError>;

    /// Findings of the most recent completed scan of a range key.
    async fn get_latest_findings(&self, range: &str) -> Result<Vec<SecurityFinding>, StoreError>;

    /// Latest port findings recorded for a device.
    async fn get_port_findings(&self, device_id: DeviceId) -> Result<Vec<PortFinding>, StoreError>;

    async fn get_scan_run(&self, id: ScanRunId) -> Result<Option<ScanRun>, StoreError>;
}

/// Reject result sets that would break attribution to a completed run.
pub fn validate_result_set(
    run: &ScanRun,
    devices: &[Device],
    ports: &[PortFinding],
    findings: &[SecurityFinding],
) -> Result<(), StoreError> {
    if run.status != ScanStatus::Completed {
        return Err(StoreError::Rejected(format!(
            "scan run {} is {}, only completed runs are persisted",
            run.id,
            run.status.as_str()
        )));
    }
    if let Some(d) = devices.iter().find(|d| d.range != run.range) {
        return Err(StoreError::Rejected(format!(
            "device {} belongs to range {}, not {}",
            d.id, d.range, run.range
        )));
    }
    if ports.iter().any(|p| p.scan_run_id != run.id)
        || findings.iter().any(|f| f.scan_run_id != run.id)
    {
        return Err(StoreError::Rejected(format!(
            "result set contains records not produced by scan run {}",
            run.id
        )));
    }
    Ok(())
}
