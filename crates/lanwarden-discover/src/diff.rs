//! Change detection: merge freshly observed devices with the persisted state
//! of the same range.
//!
//! Re-discovered devices keep their first-seen time and never lose a known
//! MAC, vendor, or type. Previously online devices that did not answer are
//! carried forward as offline.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use lanwarden_core::{Device, DeviceId, DeviceStatus};

/// The outcome of diffing one scan's devices against the stored ones.
#[derive(Debug, Clone)]
pub struct DiffResult {
    /// Devices to persist: every observed device plus newly offline ones.
    pub devices: Vec<Device>,
    pub new_devices: Vec<DeviceId>,
    pub newly_offline: Vec<DeviceId>,
    pub summary: DiffSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub total_scanned: u32,
    pub new_count: u32,
    pub changed_count: u32,
    pub unchanged_count: u32,
    pub offline_count: u32,
}

/// BLAKE3 fingerprint of a device's observable state. Timestamps and scan
/// attribution are excluded, so an unchanged host keeps its fingerprint.
pub fn fingerprint(device: &Device) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for field in [
        device.ip.to_string().as_str(),
        device.mac_address.as_deref().unwrap_or(""),
        device.vendor.as_deref().unwrap_or(""),
        device.device_type.as_str(),
        device.status.as_str(),
    ] {
        hasher.update(field.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize()
}

pub fn compute_diff(observed: Vec<Device>, previous: &[Device]) -> DiffResult {
    let previous_by_id: HashMap<DeviceId, &Device> = previous.iter().map(|d| (d.id, d)).collect();
    let mut seen: HashSet<DeviceId> = HashSet::new();
    let mut summary = DiffSummary::default();
    let mut devices = Vec::with_capacity(observed.len());
    let mut new_devices = Vec::new();

    for mut device in observed {
        seen.insert(device.id);
        summary.total_scanned += 1;

        match previous_by_id.get(&device.id) {
            None => {
                summary.new_count += 1;
                new_devices.push(device.id);
            }
            Some(prev) => {
                device.refine_from(prev);
                if fingerprint(&device) == fingerprint(prev) {
                    summary.unchanged_count += 1;
                } else {
                    summary.changed_count += 1;
                }
            }
        }
        devices.push(device);
    }

    let mut newly_offline = Vec::new();
    for prev in previous {
        if seen.contains(&prev.id) || prev.status == DeviceStatus::Offline {
            continue;
        }
        let mut offline = prev.clone();
        offline.status = DeviceStatus::Offline;
        newly_offline.push(offline.id);
        devices.push(offline);
    }
    summary.offline_count = newly_offline.len() as u32;

    DiffResult {
        devices,
        new_devices,
        newly_offline,
        summary,
    }
}
