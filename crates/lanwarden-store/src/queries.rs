//! Read operations over the scan-result graph.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use neo4rs::query;
use serde::de::DeserializeOwned;

use lanwarden_core::{Device, DeviceId, PortFinding, ScanRun, ScanRunId, SecurityFinding};

use crate::client::GraphClient;
use crate::sink::StoreError;

impl GraphClient {
    /// All devices of a range key, ordered by address.
    pub async fn list_devices(&self, range: &str) -> Result<Vec<Device>, StoreError> {
        let q = query(
            "MATCH (d:Device {range: $range})
             RETURN d
             ORDER BY d.ip",
        )
        .param("range", range.to_string());

        let rows = self.query_rows(q).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let node: neo4rs::Node = row.get("d").map_err(|e| {
                StoreError::Serialization(format!("Failed to deserialize device: {e}"))
            })?;
            results.push(node_to_device(&node)?);
        }
        Ok(results)
    }

    /// Findings written by the latest completed scan of a range key.
    pub async fn list_findings(&self, range: &str) -> Result<Vec<SecurityFinding>, StoreError> {
        let q = query(
            "MATCH (f:Finding {range: $range})
             RETURN f
             ORDER BY f.device_id, f.category",
        )
        .param("range", range.to_string());

        let rows = self.query_rows(q).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let node: neo4rs::Node = row.get("f").map_err(|e| {
                StoreError::Serialization(format!("Failed to deserialize finding: {e}"))
            })?;
            results.push(node_to_finding(&node)?);
        }
        Ok(results)
    }

    /// Port findings currently attached to a device.
    pub async fn list_ports(&self, device_id: DeviceId) -> Result<Vec<PortFinding>, StoreError> {
        let q = query(
            "MATCH (:Device {id: $id})-[:HAS_PORT]->(p:Port)
             RETURN p
             ORDER BY p.port",
        )
        .param("id", device_id.to_string());

        let rows = self.query_rows(q).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let node: neo4rs::Node = row.get("p").map_err(|e| {
                StoreError::Serialization(format!("Failed to deserialize port: {e}"))
            })?;
            results.push(node_to_port(&node)?);
        }
        Ok(results)
    }

    pub async fn find_scan_run(&self, id: ScanRunId) -> Result<Option<ScanRun>, StoreError> {
        let q = query(
            "MATCH (r:ScanRun {id: $id})
             RETURN r",
        )
        .param("id", id.to_string());

        match self.query_one(q).await? {
            Some(row) => {
                let node: neo4rs::Node = row.get("r").map_err(|e| {
                    StoreError::Serialization(format!("Failed to deserialize scan run: {e}"))
                })?;
                Ok(Some(node_to_scan_run(&node)?))
            }
            None => Ok(None),
        }
    }
}

// ── Node conversion ──────────────────────────────────────────────

fn node_to_device(node: &neo4rs::Node) -> Result<Device, StoreError> {
    Ok(Device {
        id: DeviceId(uuid_prop(node, "id")?),
        range: string_prop(node, "range")?,
        ip: parsed_prop(node, "ip")?,
        mac_address: opt_string_prop(node, "mac_address"),
        vendor: opt_string_prop(node, "vendor"),
        device_type: enum_prop(node, "device_type")?,
        first_seen: time_prop(node, "first_seen")?,
        last_seen: time_prop(node, "last_seen")?,
        status: enum_prop(node, "status")?,
        last_scan_id: ScanRunId(uuid_prop(node, "last_scan_id")?),
    })
}

fn node_to_port(node: &neo4rs::Node) -> Result<PortFinding, StoreError> {
    Ok(PortFinding {
        device_id: DeviceId(uuid_prop(node, "device_id")?),
        scan_run_id: ScanRunId(uuid_prop(node, "scan_run_id")?),
        port: port_number(int_prop(node, "port")?)?,
        protocol: enum_prop(node, "protocol")?,
        state: enum_prop(node, "state")?,
        banner_hint: opt_string_prop(node, "banner_hint"),
    })
}

fn node_to_finding(node: &neo4rs::Node) -> Result<SecurityFinding, StoreError> {
    let ports: Vec<i64> = node.get("ports").unwrap_or_default();
    Ok(SecurityFinding {
        device_id: DeviceId(uuid_prop(node, "device_id")?),
        scan_run_id: ScanRunId(uuid_prop(node, "scan_run_id")?),
        severity: enum_prop(node, "severity")?,
        category: enum_prop(node, "category")?,
        description: string_prop(node, "description")?,
        ports: ports
            .into_iter()
            .map(port_number)
            .collect::<Result<_, _>>()?,
        discovered_at: time_prop(node, "discovered_at")?,
    })
}

fn node_to_scan_run(node: &neo4rs::Node) -> Result<ScanRun, StoreError> {
    let completed_at = match opt_string_prop(node, "completed_at") {
        Some(raw) => Some(parse_time("completed_at", &raw)?),
        None => None,
    };
    Ok(ScanRun {
        id: ScanRunId(uuid_prop(node, "id")?),
        range: string_prop(node, "range")?,
        started_at: time_prop(node, "started_at")?,
        completed_at,
        status: enum_prop(node, "status")?,
        devices_found: int_prop(node, "devices_found")? as u32,
        hosts_probed: int_prop(node, "hosts_probed")? as u32,
        failure_reason: opt_string_prop(node, "failure_reason"),
    })
}

// ── Property helpers ─────────────────────────────────────────────

fn string_prop(node: &neo4rs::Node, key: &str) -> Result<String, StoreError> {
    node.get::<String>(key)
        .map_err(|e| StoreError::Serialization(format!("Missing property {key}: {e}")))
}

/// Optional strings are stored as empty strings.
fn opt_string_prop(node: &neo4rs::Node, key: &str) -> Option<String> {
    node.get::<String>(key).ok().filter(|s| !s.is_empty())
}

fn int_prop(node: &neo4rs::Node, key: &str) -> Result<i64, StoreError> {
    node.get::<i64>(key)
        .map_err(|e| StoreError::Serialization(format!("Missing property {key}: {e}")))
}

fn uuid_prop(node: &neo4rs::Node, key: &str) -> Result<uuid::Uuid, StoreError> {
    parsed_prop(node, key)
}

fn parsed_prop<T>(node: &neo4rs::Node, key: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = string_prop(node, key)?;
    raw.parse::<T>()
        .map_err(|e| StoreError::Serialization(format!("Invalid {key} {raw:?}: {e}")))
}

fn time_prop(node: &neo4rs::Node, key: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_time(key, &string_prop(node, key)?)
}

fn parse_time(key: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("Invalid {key} {raw:?}: {e}")))
}

/// Read a unit enum stored under its serde name.
fn enum_prop<T: DeserializeOwned>(node: &neo4rs::Node, key: &str) -> Result<T, StoreError> {
    let raw = string_prop(node, key)?;
    serde_json::from_value(serde_json::Value::String(raw.clone()))
        .map_err(|e| StoreError::Serialization(format!("Invalid {key} {raw:?}: {e}")))
}

fn port_number(raw: i64) -> Result<u16, StoreError> {
    u16::try_from(raw).map_err(|_| StoreError::Serialization(format!("Invalid port number {raw}")))
}
