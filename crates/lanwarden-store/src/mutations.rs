//! Write operations for the scan-result graph.
//!
//! A result set is written inside one transaction. Devices and scan runs use
//! MERGE (upsert) semantics so re-discovery is idempotent; port findings and
//! security findings are replaced, never merged.

use neo4rs::{query, Txn};

use lanwarden_core::{Device, DeviceStatus, PortFinding, ScanRun, SecurityFinding};

use crate::client::GraphClient;
use crate::sink::StoreError;

impl GraphClient {
    /// Write a complete result set atomically. Rolls back on any failure.
    pub async fn write_result_set(
        &self,
        run: &ScanRun,
        devices: &[Device],
        ports: &[PortFinding],
        findings: &[SecurityFinding],
    ) -> Result<(), StoreError> {
        let mut txn = self.start_txn().await?;

        match write_in_txn(&mut txn, run, devices, ports, findings).await {
            Ok(()) => {
                txn.commit().await?;
                tracing::debug!(
                    scan_id = %run.id,
                    devices = devices.len(),
                    ports = ports.len(),
                    findings = findings.len(),
                    "Result set committed to Neo4j"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    tracing::warn!(scan_id = %run.id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn write_in_txn(
    txn: &mut Txn,
    run: &ScanRun,
    devices: &[Device],
    ports: &[PortFinding],
    findings: &[SecurityFinding],
) -> Result<(), StoreError> {
    upsert_scan_run(txn, run).await?;

    for device in devices {
        upsert_device(txn, device).await?;
    }

    // Supersede port findings of every device observed in this run.
    for device in devices.iter().filter(|d| d.status == DeviceStatus::Online) {
        let q = query(
            "MATCH (d:Device {id: $id})-[:HAS_PORT]->(p:Port)
             DETACH DELETE p",
        )
        .param("id", device.id.to_string());
        txn.run(q).await?;
    }

    for port in ports {
        let q = query(
            "MATCH (d:Device {id: $device_id})
             CREATE (d)-[:HAS_PORT]->(p:Port {
               device_id: $device_id, scan_run_id: $scan_run_id,
               port: $port, protocol: $protocol, state: $state,
               banner_hint: $banner_hint
             })",
        )
        .param("device_id", port.device_id.to_string())
        .param("scan_run_id", port.scan_run_id.to_string())
        .param("port", port.port as i64)
        .param("protocol", ser(&port.protocol))
        .param("state", ser(&port.state))
        .param("banner_hint", opt_string(&port.banner_hint));
        txn.run(q).await?;
    }

    // Latest findings of the range are replaced by this run's findings.
    let q = query(
        "MATCH (f:Finding {range: $range})
         DETACH DELETE f",
    )
    .param("range", run.range.clone());
    txn.run(q).await?;

    for finding in findings {
        let q = query(
            "MATCH (d:Device {id: $device_id})
             CREATE (d)-[:HAS_FINDING]->(f:Finding {
               range: $range, device_id: $device_id, scan_run_id: $scan_run_id,
               severity: $severity, category: $category,
               description: $description, ports: $ports,
               discovered_at: $discovered_at
             })",
        )
        .param("range", run.range.clone())
        .param("device_id", finding.device_id.to_string())
        .param("scan_run_id", finding.scan_run_id.to_string())
        .param("severity", ser(&finding.severity))
        .param("category", ser(&finding.category))
        .param("description", finding.description.clone())
        .param(
            "ports",
            finding.ports.iter().map(|p| *p as i64).collect::<Vec<i64>>(),
        )
        .param("discovered_at", finding.discovered_at.to_rfc3339());
        txn.run(q).await?;
    }

    Ok(())
}

async fn upsert_scan_run(txn: &mut Txn, run: &ScanRun) -> Result<(), StoreError> {
    let q = query(
        "MERGE (r:ScanRun {id: $id})
         SET r.range = $range, r.started_at = $started_at,
             r.completed_at = $completed_at, r.status = $status,
             r.devices_found = $devices_found, r.hosts_probed = $hosts_probed,
             r.failure_reason = $failure_reason",
    )
    .param("id", run.id.to_string())
    .param("range", run.range.clone())
    .param("started_at", run.started_at.to_rfc3339())
    .param(
        "completed_at",
        run.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
    )
    .param("status", ser(&run.status))
    .param("devices_found", run.devices_found as i64)
    .param("hosts_probed", run.hosts_probed as i64)
    .param("failure_reason", opt_string(&run.failure_reason));

    txn.run(q).await?;
    Ok(())
}

async fn upsert_device(txn: &mut Txn, device: &Device) -> Result<(), StoreError> {
    let q = query(
        "MERGE (d:Device {id: $id})
         ON CREATE SET d.first_seen = $first_seen
         SET d.range = $range, d.ip = $ip, d.mac_address = $mac_address,
             d.vendor = $vendor, d.device_type = $device_type,
             d.status = $status, d.last_scan_id = $last_scan_id,
             d.last_seen = CASE
               WHEN d.last_seen IS NULL OR d.last_seen < $last_seen THEN $last_seen
               ELSE d.last_seen
             END",
    )
    .param("id", device.id.to_string())
    .param("range", device.range.clone())
    .param("ip", device.ip.to_string())
    .param("mac_address", opt_string(&device.mac_address))
    .param("vendor", opt_string(&device.vendor))
    .param("device_type", ser(&device.device_type))
    .param("status", ser(&device.status))
    .param("last_scan_id", device.last_scan_id.to_string())
    .param("first_seen", device.first_seen.to_rfc3339())
    .param("last_seen", device.last_seen.to_rfc3339());

    txn.run(q).await?;
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────

fn opt_string(opt: &Option<String>) -> String {
    opt.clone().unwrap_or_default()
}

/// Serialize a unit enum to its serde name (`"router"`, `"open"`, ...).
fn ser<T: serde::Serialize>(val: &T) -> String {
    match serde_json::to_value(val) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}
