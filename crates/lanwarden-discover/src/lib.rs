//! lanwarden-discover: Network discovery and security-scanning engine.
//!
//! Resolves configured and local address space, probes hosts for liveness
//! and open TCP ports, classifies what answered, assesses exposed services,
//! and hands each completed scan to a result sink. At most one scan runs per
//! range at any time.

pub mod api;
pub mod banner;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod host_probe;
pub mod neighbor;
pub mod port_probe;
pub mod resolver;
pub mod risk;
pub mod scheduler;
