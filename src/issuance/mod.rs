//! Issuance authority module.
//!
//! Turns certificate-signing requests into signed device identities,
//! exactly once per device id:
//! - CSR inspection (format, self-signature, subject)
//! - Signing through a pluggable `CsrSigner` (local rcgen CA by default)
//! - Certificate metadata extraction through `CertificateParser`
//! - Single atomic commit into the identity store
//! - Retryable delivery of the signed certificate back to the device

pub mod authority;
pub mod ca;
pub mod csr;
pub mod deadline;
pub mod delivery;
pub mod gate;

pub use authority::*;
pub use ca::*;
pub use csr::*;
pub use delivery::*;
pub use gate::*;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::storage::StoreError;

/// Failure reported by an external capability (signer, parser, delivery).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError(message.into())
    }
}

/// Metadata read back from a signed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    pub common_name: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub serial: String,
    pub fingerprint_sha256: String,
}

/// CSR-signing capability.
pub trait CsrSigner: Send + Sync {
    /// Sign `csr` for `subject_cn`, returning the PEM certificate.
    fn sign(&self, csr: &[u8], subject_cn: &str, validity_days: u32) -> Result<Vec<u8>, BackendError>;
}

/// Certificate-parsing capability.
pub trait CertificateParser: Send + Sync {
    fn parse(&self, certificate: &[u8]) -> Result<CertificateSummary, BackendError>;
}

/// Sends a signed certificate back to its device.
pub trait CertificateDelivery: Send + Sync {
    fn deliver(&self, device_id: &str, certificate_pem: &[u8]) -> Result<(), BackendError>;
}

/// Issuance failures.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("invalid device id '{device_id}': {reason}")]
    InvalidDeviceId { device_id: String, reason: String },

    #[error("malformed CSR: {reason}")]
    MalformedCsr { reason: String },

    #[error("CSR subject '{found}' does not name device '{expected}'")]
    SubjectMismatch { expected: String, found: String },

    #[error("signing failed: {reason}")]
    SigningFailure { reason: String },

    #[error("signing timed out after {timeout:?}")]
    SigningTimeout { timeout: Duration },

    #[error("certificate for '{device_id}' issued but not delivered: {reason}")]
    DeliveryFailure { device_id: String, reason: String },

    #[error("device '{device_id}' is already provisioned")]
    AlreadyProvisioned { device_id: String },

    #[error("device '{device_id}' has no identity")]
    NotProvisioned { device_id: String },

    #[error("identity for '{device_id}' is revoked")]
    Revoked { device_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IssuanceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IssuanceError::InvalidDeviceId { .. }
            | IssuanceError::MalformedCsr { .. }
            | IssuanceError::SubjectMismatch { .. }
            | IssuanceError::AlreadyProvisioned { .. }
            | IssuanceError::NotProvisioned { .. }
            | IssuanceError::Revoked { .. } => ErrorKind::InputValidation,
            IssuanceError::SigningFailure { .. }
            | IssuanceError::SigningTimeout { .. }
            | IssuanceError::DeliveryFailure { .. } => ErrorKind::Transient,
            IssuanceError::Store(e) => e.kind(),
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            IssuanceError::InvalidDeviceId { .. } => "INVALID_DEVICE_ID",
            IssuanceError::MalformedCsr { .. } => "MALFORMED_CSR",
            IssuanceError::SubjectMismatch { .. } => "CSR_SUBJECT_MISMATCH",
            IssuanceError::SigningFailure { .. } => "SIGNING_FAILURE",
            IssuanceError::SigningTimeout { .. } => "SIGNING_TIMEOUT",
            IssuanceError::DeliveryFailure { .. } => "DELIVERY_FAILURE",
            IssuanceError::AlreadyProvisioned { .. } => "ALREADY_PROVISIONED",
            IssuanceError::NotProvisioned { .. } => "NOT_PROVISIONED",
            IssuanceError::Revoked { .. } => "REVOKED",
            IssuanceError::Store(e) => e.reason_code(),
        }
    }
}
