//! lanwarden-core: Shared data model for the lanwarden scanning engine.
//!
//! This crate provides the types every other lanwarden crate speaks:
//! - Network ranges, devices, port findings, security findings, scan runs
//! - The scan coordinator's phase state machine
//! - Lifecycle events published when scans start and finish
//! - The engine's error taxonomy

pub mod error;
pub mod events;
pub mod types;

pub use error::ScanError;
pub use types::{
    Device, DeviceId, DeviceStatus, DeviceType, FindingCategory, NetworkRange, PortFinding,
    PortState, Protocol, RangeOrigin, ScanPhase, ScanRun, ScanRunId, ScanStatus,
    SecurityFinding, Severity,
};
