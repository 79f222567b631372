//! In-process result sink.
//!
//! Used by the one-shot CLI mode and by tests. A whole result set is applied
//! under a single write lock, so readers observe either the previous state or
//! the complete new one.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use lanwarden_core::{
    Device, DeviceId, DeviceStatus, PortFinding, ScanRun, ScanRunId, SecurityFinding,
};

use crate::sink::{validate_result_set, ResultSink, StoreError};

#[derive(Default)]
struct Inner {
    /// range key → devices of that range
    devices: HashMap<String, BTreeMap<DeviceId, Device>>,
    ports: HashMap<DeviceId, Vec<PortFinding>>,
    /// range key → findings of the latest completed run
    findings: HashMap<String, Vec<SecurityFinding>>,
    runs: HashMap<ScanRunId, ScanRun>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted scan run, oldest first.
    pub fn runs(&self) -> Vec<ScanRun> {
        let mut runs: Vec<ScanRun> = self.inner.read().runs.values().cloned().collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }
}

#[async_trait]
impl ResultSink for MemoryStore {
    async fn save_scan_result(
        &self,
        run: &ScanRun,
        devices: &[Device],
        ports: &[PortFinding],
        findings: &[SecurityFinding],
    ) -> Result<(), StoreError> {
        validate_result_set(run, devices, ports, findings)?;

        let mut ports_by_device: HashMap<DeviceId, Vec<PortFinding>> = HashMap::new();
        for p in ports {
            ports_by_device.entry(p.device_id).or_default().push(p.clone());
        }

        let mut inner = self.inner.write();

        let range_devices = inner.devices.entry(run.range.clone()).or_default();
        for device in devices {
            let mut stored = device.clone();
            if let Some(existing) = range_devices.get(&device.id) {
                stored.last_seen = stored.last_seen.max(existing.last_seen);
            }
            range_devices.insert(device.id, stored);
        }

        // Port findings of devices observed this run are superseded wholesale.
        for device in devices.iter().filter(|d| d.status == DeviceStatus::Online) {
            let observed = ports_by_device.remove(&device.id).unwrap_or_default();
            inner.ports.insert(device.id, observed);
        }

        inner.findings.insert(run.range.clone(), findings.to_vec());
        inner.runs.insert(run.id, run.clone());

        tracing::debug!(
            scan_id = %run.id,
            range = %run.range,
            devices = devices.len(),
            ports = ports.len(),
            findings = findings.len(),
            "Result set stored in memory"
        );

        Ok(())
    }

    async fn get_devices(&self, range: &str) -> Result<Vec<Device>, StoreError> {
        Ok(self
            .inner
            .read()
            .devices
            .get(range)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_latest_findings(&self, range: &str) -> Result<Vec<SecurityFinding>, StoreError> {
        Ok(self
            .inner
            .read()
            .findings
            .get(range)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_port_findings(&self, device_id: DeviceId) -> Result<Vec<PortFinding>, StoreError> {
        Ok(self
            .inner
            .read()
            .ports
            .get(&device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_scan_run(&self, id: ScanRunId) -> Result<Option<ScanRun>, StoreError> {
        Ok(self.inner.read().runs.get(&id).cloned())
    }
}
