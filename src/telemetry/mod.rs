//! Telemetry module.
//!
//! Accepts device health/sensor payloads:
//! - `validation` - ordered payload checks producing a `TelemetrySample`
//! - `sanitizer` - content scanning for markup/script injection (log only)
//! - `ingest` - latest-sample-per-device store with timestamp ordering

pub mod ingest;
pub mod sanitizer;
pub mod validation;

pub use ingest::*;
pub use sanitizer::*;
pub use validation::*;

use std::fmt;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::storage::StoreError;

/// Why a payload was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadRejection {
    MalformedJson,
    TooLarge,
    NotAMapping,
    MissingDeviceId,
    InvalidDeviceId,
    InvalidTimestamp,
    InvalidStatus,
    SensorsNotAMapping,
}

impl PayloadRejection {
    pub fn code(&self) -> &'static str {
        match self {
            PayloadRejection::MalformedJson => "MALFORMED_JSON",
            PayloadRejection::TooLarge => "PAYLOAD_TOO_LARGE",
            PayloadRejection::NotAMapping => "PAYLOAD_NOT_MAPPING",
            PayloadRejection::MissingDeviceId => "MISSING_DEVICE_ID",
            PayloadRejection::InvalidDeviceId => "INVALID_DEVICE_ID",
            PayloadRejection::InvalidTimestamp => "INVALID_TIMESTAMP",
            PayloadRejection::InvalidStatus => "INVALID_STATUS",
            PayloadRejection::SensorsNotAMapping => "SENSORS_NOT_MAPPING",
        }
    }
}

impl fmt::Display for PayloadRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid telemetry payload ({rejection}): {detail}")]
    InvalidPayload {
        rejection: PayloadRejection,
        detail: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TelemetryError {
    pub(crate) fn invalid(rejection: PayloadRejection, detail: impl Into<String>) -> Self {
        TelemetryError::InvalidPayload {
            rejection,
            detail: detail.into(),
        }
    }

    pub fn rejection(&self) -> Option<PayloadRejection> {
        match self {
            TelemetryError::InvalidPayload { rejection, .. } => Some(*rejection),
            TelemetryError::Store(_) => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TelemetryError::InvalidPayload { .. } => ErrorKind::InputValidation,
            TelemetryError::Store(e) => e.kind(),
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            TelemetryError::InvalidPayload { rejection, .. } => rejection.code(),
            TelemetryError::Store(e) => e.reason_code(),
        }
    }
}
