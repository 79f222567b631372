//! Scan lifecycle events.
//!
//! The coordinator publishes these on a broadcast channel so that callers and
//! subscribers learn about completion without polling the result sink.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DeviceId, DeviceType, ScanRunId};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// An event emitted by the scanning engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl ScanEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// The scan run this event belongs to.
    pub fn scan_id(&self) -> ScanRunId {
        match &self.payload {
            EventPayload::ScanStarted { scan_id, .. }
            | EventPayload::ScanCompleted { scan_id, .. }
            | EventPayload::ScanFailed { scan_id, .. }
            | EventPayload::ScanCancelled { scan_id, .. }
            | EventPayload::DeviceDiscovered { scan_id, .. }
            | EventPayload::DeviceOffline { scan_id, .. } => *scan_id,
        }
    }
}

/// The event payload, tagged by type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    // ── Scan lifecycle ────────────────────────────────────────
    ScanStarted {
        scan_id: ScanRunId,
        range: String,
        targets: u32,
    },
    ScanCompleted {
        scan_id: ScanRunId,
        range: String,
        devices_found: u32,
        hosts_probed: u32,
        findings: u32,
        new_devices: u32,
        changed_devices: u32,
        offline_devices: u32,
        duration_ms: u64,
    },
    ScanFailed {
        scan_id: ScanRunId,
        range: String,
        reason: String,
    },
    ScanCancelled {
        scan_id: ScanRunId,
        range: String,
    },

    // ── Device changes ────────────────────────────────────────
    /// A device was seen for the first time.
    DeviceDiscovered {
        scan_id: ScanRunId,
        device_id: DeviceId,
        ip: IpAddr,
        device_type: DeviceType,
    },
    /// A previously known device did not answer in this scan.
    DeviceOffline {
        scan_id: ScanRunId,
        device_id: DeviceId,
        ip: IpAddr,
        last_seen: DateTime<Utc>,
    },
}
