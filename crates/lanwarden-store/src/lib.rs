//! lanwarden-store: result sinks for scan results.
//!
//! The scanning engine persists through the [`ResultSink`] trait only. Two
//! implementations live here: [`MemoryStore`] for one-shot runs and tests,
//! and [`GraphClient`], which writes each completed scan run into Neo4j in a
//! single transaction.

pub mod client;
pub mod memory;
pub mod mutations;
pub mod queries;
pub mod sink;

pub use client::{GraphClient, GraphConfig};
pub use memory::MemoryStore;
pub use sink::{validate_result_set, ResultSink, StoreError};
