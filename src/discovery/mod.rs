//! Discovery module.
//!
//! Finds live hosts on a subnet and probes each for mutual-TLS acceptance:
//! - `subnet` - IPv4 CIDR parsing and host enumeration
//! - `sweep` - TCP connect liveness sweep with ARP-table MAC lookup
//! - `mtls` - rustls handshake probe presenting the engine's client identity
//! - `scanner` - bounded worker pool tying the two together

pub mod mtls;
pub mod scanner;
pub mod subnet;
pub mod sweep;

pub use mtls::*;
pub use scanner::*;
pub use subnet::*;
pub use sweep::*;

use std::net::IpAddr;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::ErrorKind;

/// Discovery failures. Probe failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("invalid subnet '{cidr}': {reason}")]
    InvalidSubnet { cidr: String, reason: String },
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InputValidation
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            DiscoveryError::InvalidSubnet { .. } => "INVALID_SUBNET",
        }
    }
}

/// A host reported up by an enumerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub mac: Option<String>,
}

impl HostEntry {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            hostname: None,
            mac: None,
        }
    }
}

/// Result of one mTLS handshake attempt.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeOutcome {
    pub accepted: bool,
    pub peer_common_name: Option<String>,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn accepted(peer_common_name: Option<String>, latency_ms: f64) -> Self {
        Self {
            accepted: true,
            peer_common_name,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Network liveness enumeration.
///
/// Implementations stop looking at `deadline` and return the hosts found so
/// far; a scan never loses hosts because enumeration ran long.
pub trait HostEnumerator: Send + Sync {
    fn hosts_up(&self, subnet: &Subnet, deadline: Instant) -> Vec<HostEntry>;
}

/// Client mTLS handshake against one host.
pub trait HandshakeProbe: Send + Sync {
    fn probe(&self, ip: IpAddr, port: u16, timeout: Duration) -> ProbeOutcome;
}
