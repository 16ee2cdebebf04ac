//! Error taxonomy.
//!
//! Each component has its own `thiserror` enum; `EngineError` composes them
//! for the engine surface. Every error reports an `ErrorKind` and a stable
//! reason code alongside its message.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::issuance::{CaError, IssuanceError};
use crate::storage::StoreError;
use crate::telemetry::TelemetryError;

/// Broad failure class, used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad caller input; retrying the same request fails the same way.
    InputValidation,
    /// External capability failed or timed out; safe to retry.
    Transient,
    /// Persisted state disagrees with itself.
    Consistency,
    /// Storage unavailable; the operation cannot proceed.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InputValidation => "input_validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Fatal => "fatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any failure surfaced by `TrustEngine`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("certificate authority unavailable: {0}")]
    Authority(#[from] CaError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Issuance(e) => e.kind(),
            EngineError::Discovery(e) => e.kind(),
            EngineError::Telemetry(e) => e.kind(),
            EngineError::Store(e) => e.kind(),
            EngineError::Config(e) => e.kind(),
            EngineError::Authority(_) => ErrorKind::Fatal,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            EngineError::Issuance(e) => e.reason_code(),
            EngineError::Discovery(e) => e.reason_code(),
            EngineError::Telemetry(e) => e.reason_code(),
            EngineError::Store(e) => e.reason_code(),
            EngineError::Config(e) => e.reason_code(),
            EngineError::Authority(_) => "CA_UNAVAILABLE",
        }
    }
}
