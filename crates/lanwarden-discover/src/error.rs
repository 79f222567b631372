//! Error types for the lanwarden-discover crate.

use thiserror::Error;

use lanwarden_core::ScanError;
use lanwarden_store::StoreError;

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiscoverError>;
