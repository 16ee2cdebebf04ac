//! Storage module.
//!
//! Durable keyed records for device identities and telemetry, plus atomic
//! JSON snapshot files for the discovery ledger and the trust-state file.

pub mod keyed;
pub mod models;
pub mod snapshot;

pub use keyed::*;
pub use models::*;
pub use snapshot::*;

use std::path::PathBuf;

use thiserror::Error;

use crate::error::ErrorKind;

/// Durable storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to encode record for key {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Unreadable records are a consistency problem; everything else is fatal.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Corrupt { .. } => ErrorKind::Consistency,
            StoreError::Io { .. } | StoreError::Encode { .. } => ErrorKind::Fatal,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            StoreError::Corrupt { .. } => "STORE_CORRUPT",
            StoreError::Io { .. } | StoreError::Encode { .. } => "STORE_UNAVAILABLE",
        }
    }
}
