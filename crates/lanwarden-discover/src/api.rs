//! Trigger API facade.
//!
//! Transport-agnostic request/response types for `POST scan`, `GET scan/{id}`
//! and `POST scan/{id}/cancel`, plus device and finding read-throughs. Errors
//! leave as an [`ApiErrorBody`] carrying a stable code and a human-readable
//! message, never internal details.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lanwarden_core::types::range_key;
use lanwarden_core::{
    Device, NetworkRange, ScanError, ScanPhase, ScanRunId, ScanStatus, SecurityFinding,
};

use crate::coordinator::ScanCoordinator;

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerScanRequest {
    /// CIDR to scan (e.g., "192.168.2.0/24").
    pub range: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerScanResponse {
    pub scan_run_id: ScanRunId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanStatusResponse {
    pub scan_run_id: ScanRunId,
    pub range: String,
    pub status: ScanStatus,
    pub phase: ScanPhase,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub devices_found: u32,
    pub hosts_probed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelScanResponse {
    pub scan_run_id: ScanRunId,
    /// False when the run was already past probing or finished.
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

impl ApiErrorBody {
    fn invalid_scan_id(raw: &str) -> Self {
        Self {
            code: "invalid_scan_id".to_string(),
            message: format!("'{raw}' is not a valid scan id"),
        }
    }
}

impl From<ScanError> for ApiErrorBody {
    fn from(e: ScanError) -> Self {
        let message = match &e {
            ScanError::Persistence(detail) => {
                tracing::warn!(error = %detail, "Result storage error behind API call");
                "result storage is unavailable".to_string()
            }
            other => other.to_string(),
        };
        Self {
            code: e.code().to_string(),
            message,
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiErrorBody>;

/// Entry point for an outer API layer. Cheap to clone.
#[derive(Clone)]
pub struct ScanApi {
    coordinator: ScanCoordinator,
}

impl ScanApi {
    pub fn new(coordinator: ScanCoordinator) -> Self {
        Self { coordinator }
    }

    /// `POST scan(range)`
    pub fn trigger_scan(&self, request: &TriggerScanRequest) -> ApiResult<TriggerScanResponse> {
        let range = NetworkRange::configured(request.range.trim());
        let handle = self.coordinator.start_scan(&range)?;
        Ok(TriggerScanResponse {
            scan_run_id: handle.id,
        })
    }

    /// `GET scan/{id}`
    pub async fn scan_status(&self, id: &str) -> ApiResult<ScanStatusResponse> {
        let id = parse_id(id)?;
        let snapshot = self.coordinator.get_scan(id).await?;
        let run = snapshot.run;
        Ok(ScanStatusResponse {
            scan_run_id: run.id,
            range: run.range,
            status: run.status,
            phase: snapshot.phase,
            started_at: run.started_at,
            completed_at: run.completed_at,
            devices_found: run.devices_found,
            hosts_probed: run.hosts_probed,
            failure_reason: run.failure_reason,
        })
    }

    /// `POST scan/{id}/cancel`
    pub fn cancel_scan(&self, id: &str) -> ApiResult<CancelScanResponse> {
        let id = parse_id(id)?;
        let accepted = self.coordinator.cancel_scan(id)?;
        Ok(CancelScanResponse {
            scan_run_id: id,
            accepted,
        })
    }

    /// Devices known for a range, online and offline.
    pub async fn devices(&self, range: &str) -> ApiResult<Vec<Device>> {
        let key = range_key(range)?;
        let devices = self
            .coordinator
            .sink()
            .get_devices(&key)
            .await
            .map_err(ScanError::from)?;
        Ok(devices)
    }

    /// Findings of the latest completed scan of a range.
    pub async fn findings(&self, range: &str) -> ApiResult<Vec<SecurityFinding>> {
        let key = range_key(range)?;
        let findings = self
            .coordinator
            .sink()
            .get_latest_findings(&key)
            .await
            .map_err(ScanError::from)?;
        Ok(findings)
    }
}

fn parse_id(raw: &str) -> ApiResult<ScanRunId> {
    raw.trim()
        .parse()
        .map_err(|_| ApiErrorBody::invalid_scan_id(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use lanwarden_store::MemoryStore;

    use crate::classifier::{DeviceClassifier, OuiTable};
    use crate::config::DiscoverConfig;
    use crate::coordinator::{RangeLocks, ScanEngine};
    use crate::host_probe::{HostProbe, LivenessResult, ProbeMethod};
    use crate::neighbor::NeighborTable;
    use crate::port_probe::{PortObservation, PortProbe};

    struct OnlyFirstHost;

    #[async_trait]
    impl HostProbe for OnlyFirstHost {
        async fn probe(&self, addr: IpAddr, _timeout: Duration) -> LivenessResult {
            if addr.to_string().ends_with(".1") {
                LivenessResult::alive(ProbeMethod::Icmp, Some(Duration::from_millis(1)))
            } else {
                LivenessResult::not_alive()
            }
        }
    }

    struct TelnetOnly;

    #[async_trait]
    impl PortProbe for TelnetOnly {
        async fn scan_ports(
            &self,
            _addr: IpAddr,
            ports: &[u16],
            _timeout: Duration,
            _concurrency: usize,
        ) -> Vec<PortObservation> {
            ports
                .iter()
                .map(|p| match p {
                    23 => PortObservation::open(23, None),
                    other => PortObservation::closed(*other),
                })
                .collect()
        }
    }

    struct NoNeighbors;

    #[async_trait]
    impl NeighborTable for NoNeighbors {
        async fn snapshot(&self) -> crate::error::Result<HashMap<IpAddr, String>> {
            Ok(HashMap::new())
        }
    }

    fn api() -> ScanApi {
        let engine = ScanEngine {
            host_probe: Arc::new(OnlyFirstHost),
            port_probe: Arc::new(TelnetOnly),
            neighbors: Arc::new(NoNeighbors),
            classifier: DeviceClassifier::new(vec![Box::new(OuiTable::builtin())]),
            sink: Arc::new(MemoryStore::new()),
        };
        let config = DiscoverConfig {
            ports: vec![22, 23, 80],
            ..Default::default()
        };
        ScanApi::new(ScanCoordinator::new(config, engine, RangeLocks::new()).unwrap())
    }

    async fn wait_terminal(api: &ScanApi, id: &str) -> ScanStatusResponse {
        for _ in 0..100 {
            let status = api.scan_status(id).await.unwrap();
            if status.status != ScanStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scan {id} did not finish");
    }

    #[tokio::test]
    async fn test_trigger_status_and_read_through() {
        let api = api();
        let response = api
            .trigger_scan(&TriggerScanRequest {
                range: "192.168.9.0/30".to_string(),
            })
            .unwrap();
        let id = response.scan_run_id.to_string();

        let status = wait_terminal(&api, &id).await;
        assert_eq!(status.status, ScanStatus::Completed);
        assert_eq!(status.phase, ScanPhase::Completed);
        assert_eq!(status.devices_found, 1);
        assert_eq!(status.hosts_probed, 2);

        // Lookups accept any spelling of the range.
        let devices = api.devices("192.168.9.2/30").await.unwrap();
        assert_eq!(devices.len(), 1);
        let findings = api.findings("192.168.9.0/30").await.unwrap();
        assert!(findings.iter().any(|f| f.ports == vec![23]));

        let cancel = api.cancel_scan(&id).unwrap();
        assert!(!cancel.accepted);
    }

    #[tokio::test]
    async fn test_errors_map_to_codes() {
        let api = api();

        let err = api
            .trigger_scan(&TriggerScanRequest {
                range: "300.1.1.0/24".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.code, "configuration_error");

        let err = api
            .trigger_scan(&TriggerScanRequest {
                range: "10.0.0.0/8".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.code, "range_too_large");

        let err = api.scan_status("not-a-uuid").await.unwrap_err();
        assert_eq!(err.code, "invalid_scan_id");

        let unknown = ScanRunId::new().to_string();
        let err = api.scan_status(&unknown).await.unwrap_err();
        assert_eq!(err.code, "unknown_scan");
        let err = api.cancel_scan(&unknown).unwrap_err();
        assert_eq!(err.code, "unknown_scan");
    }

    #[test]
    fn test_persistence_errors_hide_details() {
        let body = ApiErrorBody::from(ScanError::Persistence(
            "Neo4j query error: bolt://10.0.0.5:7687 auth failed".to_string(),
        ));
        assert_eq!(body.code, "persistence_error");
        assert_eq!(body.message, "result storage is unavailable");

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "persistence_error");
    }
}
