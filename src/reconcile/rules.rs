//! Trust rule table.
//!
//! Every default the reconciler fills in lives here, together with the
//! issue classification derived from the resulting flags. Defaults are
//! conservative: anything not positively verified counts as failed.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const UNKNOWN_COMMON_NAME: &str = "Unknown";
pub const NO_SENSOR_DATA: &str = "N/A";

/// One row of the default table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRule {
    pub field: &'static str,
    pub source: &'static str,
    pub default_when_absent: &'static str,
}

/// Documented defaults, in record order.
pub const DEFAULT_RULES: &[FieldRule] = &[
    FieldRule { field: "certificate_status", source: "identity (and validity window at as_of)", default_when_absent: "false" },
    FieldRule { field: "key_status", source: "identity", default_when_absent: "false" },
    FieldRule { field: "revoked", source: "identity", default_when_absent: "false" },
    FieldRule { field: "mtls_status", source: "latest discovery record", default_when_absent: "false" },
    FieldRule { field: "mitm_status", source: "handshake ok and peer CN == identity CN", default_when_absent: "false" },
    FieldRule { field: "common_name", source: "identity", default_when_absent: UNKNOWN_COMMON_NAME },
    FieldRule { field: "status", source: "telemetry", default_when_absent: "none (unknown)" },
    FieldRule { field: "sensor_summary", source: "telemetry sensors", default_when_absent: NO_SENSOR_DATA },
];

/// Why a device needs attention, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IssueReason {
    CertFailed,
    KeyMissing,
    MTLSFailed,
    MITMRisk,
    Revoked,
}

impl IssueReason {
    pub fn label(&self) -> &'static str {
        match self {
            IssueReason::CertFailed => "Cert Failed",
            IssueReason::KeyMissing => "Key Missing",
            IssueReason::MTLSFailed => "mTLS Failed",
            IssueReason::MITMRisk => "MITM Risk",
            IssueReason::Revoked => "Revoked",
        }
    }
}

impl fmt::Display for IssueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityClass {
    None,
    Warning,
    Critical,
}

impl SeverityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityClass::None => "none",
            SeverityClass::Warning => "warning",
            SeverityClass::Critical => "critical",
        }
    }
}

/// Trust flags after defaults have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustFlags {
    pub certificate_status: bool,
    pub key_status: bool,
    pub mtls_status: bool,
    pub mitm_status: bool,
    pub revoked: bool,
}

impl TrustFlags {
    /// Nothing known about the device.
    pub const UNVERIFIED: TrustFlags = TrustFlags {
        certificate_status: false,
        key_status: false,
        mtls_status: false,
        mitm_status: false,
        revoked: false,
    };

    pub const HEALTHY: TrustFlags = TrustFlags {
        certificate_status: true,
        key_status: true,
        mtls_status: true,
        mitm_status: true,
        revoked: false,
    };
}

impl Default for TrustFlags {
    fn default() -> Self {
        TrustFlags::UNVERIFIED
    }
}

pub fn classify(flags: &TrustFlags) -> Vec<IssueReason> {
    [
        (!flags.certificate_status, IssueReason::CertFailed),
        (!flags.key_status, IssueReason::KeyMissing),
        (!flags.mtls_status, IssueReason::MTLSFailed),
        (!flags.mitm_status, IssueReason::MITMRisk),
        (flags.revoked, IssueReason::Revoked),
    ]
    .into_iter()
    .filter_map(|(failed, reason)| failed.then_some(reason))
    .collect()
}

/// `warning` only for a lone MITM risk; any other reason is critical.
pub fn severity(reasons: &[IssueReason]) -> SeverityClass {
    match reasons {
        [] => SeverityClass::None,
        [IssueReason::MITMRisk] => SeverityClass::Warning,
        _ => SeverityClass::Critical,
    }
}
