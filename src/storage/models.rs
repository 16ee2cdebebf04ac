//! Persisted models for device identities, discovery and telemetry.
//!
//! These are the records the engine writes to disk and feeds into the
//! trust reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Certificate validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ValidityWindow {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.from <= instant && instant <= self.to
    }
}

/// Whether the signed certificate has reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    NotRequired,
}

/// A certificate that was replaced by a forced reissue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupersededCertificate {
    pub serial: String,
    pub common_name: String,
    pub revoked_at: DateTime<Utc>,
}

/// Provisioned identity of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub certificate_common_name: String,
    pub issued_at: DateTime<Utc>,
    pub certificate_validity_window: ValidityWindow,

    // Status flags
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub key_status: bool,
    pub certificate_status: bool,

    // Certificate material
    pub serial: String,
    pub fingerprint_sha256: String,
    pub certificate_pem: String,

    /// Address the device was provisioned at, if known.
    pub address: Option<IpAddr>,
    pub delivery: DeliveryState,
    #[serde(default)]
    pub superseded: Vec<SupersededCertificate>,
}

impl DeviceIdentity {
    /// Live means issued and not revoked.
    pub fn is_live(&self) -> bool {
        !self.revoked
    }
}

/// One host seen by a discovery pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub ip: IpAddr,
    pub hostname: String,
    pub mac: String,
    pub mtls_status: bool,

    /// CN of the certificate the device presented on a successful handshake.
    pub peer_common_name: Option<String>,
    pub latency_ms: Option<f64>,
    pub probe_error: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Device health as reported in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Degraded,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Degraded => "degraded",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            "degraded" => Ok(DeviceStatus::Degraded),
            other => Err(format!("unknown device status '{}'", other)),
        }
    }
}

/// Sensor readings: subsystem -> metric -> value, kept verbatim.
pub type SensorMap = BTreeMap<String, Value>;

/// Latest telemetry reading for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub device_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: DeviceStatus,
    pub sensors: Option<SensorMap>,
    pub received_at: DateTime<Utc>,
}
