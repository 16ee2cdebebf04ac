//! Trust reconciliation.
//!
//! Merges identities, the discovery ledger and the latest telemetry into
//! one `TrustRecord` per device. Pure: no clock, no randomness, sorted maps
//! in and out, so equal inputs give byte-identical output.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::{classify, severity, IssueReason, SeverityClass, TrustFlags, UNKNOWN_COMMON_NAME};
use super::sensors::summarize_sensors;
use crate::storage::{
    DeliveryState, DeviceIdentity, DeviceStatus, DiscoveryRecord, SensorMap, TelemetrySample,
};

/// Canonical per-device view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub device_id: String,
    pub common_name: String,

    // Trust flags (defaults applied)
    pub certificate_status: bool,
    pub key_status: bool,
    pub mtls_status: bool,
    pub mitm_status: bool,
    pub revoked: bool,

    // Certificate metadata
    pub provisioned: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub issued_at: Option<DateTime<Utc>>,
    pub serial: Option<String>,
    pub delivery: Option<DeliveryState>,

    // Network
    pub ip: Option<IpAddr>,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub latency_ms: Option<f64>,
    pub probe_error: Option<String>,

    // Telemetry
    pub status: Option<DeviceStatus>,
    pub sensor_summary: String,
    pub sensors: Option<SensorMap>,
    pub last_seen: Option<DateTime<Utc>>,

    /// Newest timestamp across every input that fed this record.
    pub last_updated: Option<DateTime<Utc>>,

    pub issue_reasons: Vec<IssueReason>,
    pub severity_class: SeverityClass,
}

impl TrustRecord {
    pub fn flags(&self) -> TrustFlags {
        TrustFlags {
            certificate_status: self.certificate_status,
            key_status: self.key_status,
            mtls_status: self.mtls_status,
            mitm_status: self.mitm_status,
            revoked: self.revoked,
        }
    }

    pub fn has_issues(&self) -> bool {
        !self.issue_reasons.is_empty()
    }
}

/// Reconcile without checking certificate validity against a clock.
pub fn reconcile(
    identities: &BTreeMap<String, DeviceIdentity>,
    discovery: &BTreeMap<IpAddr, DiscoveryRecord>,
    telemetry: &BTreeMap<String, TelemetrySample>,
) -> BTreeMap<String, TrustRecord> {
    reconcile_with(identities, discovery, telemetry, None)
}

/// Reconcile, additionally failing certificates outside their validity
/// window at `as_of`.
pub fn reconcile_at(
    identities: &BTreeMap<String, DeviceIdentity>,
    discovery: &BTreeMap<IpAddr, DiscoveryRecord>,
    telemetry: &BTreeMap<String, TelemetrySample>,
    as_of: DateTime<Utc>,
) -> BTreeMap<String, TrustRecord> {
    reconcile_with(identities, discovery, telemetry, Some(as_of))
}

/// Maps discovery records onto provisioned devices.
///
/// A record whose handshake authenticated as a live identity's certificate
/// belongs to that identity. Otherwise the identity provisioned at the
/// record's address takes it, and an unmatched host is keyed by its address.
#[derive(Debug, Clone, Default)]
pub struct DeviceIndex {
    by_common_name: HashMap<String, String>,
    by_address: HashMap<IpAddr, String>,
}

impl DeviceIndex {
    /// Live identities win over revoked ones; ties go to the smallest id.
    pub fn build(identities: &BTreeMap<String, DeviceIdentity>) -> Self {
        let mut index = Self::default();
        let mut address_live: HashMap<IpAddr, bool> = HashMap::new();
        for (device_id, identity) in identities {
            let live = identity.is_live();
            if live {
                index
                    .by_common_name
                    .entry(identity.certificate_common_name.clone())
                    .or_insert_with(|| device_id.clone());
            }
            let Some(ip) = identity.address else {
                continue;
            };
            match address_live.get(&ip) {
                Some(existing_live) if *existing_live || !live => {}
                _ => {
                    address_live.insert(ip, live);
                    index.by_address.insert(ip, device_id.clone());
                }
            }
        }
        index
    }

    pub fn device_for(&self, record: &DiscoveryRecord) -> String {
        let authenticated = record
            .peer_common_name
            .as_ref()
            .filter(|_| record.mtls_status)
            .and_then(|cn| self.by_common_name.get(cn));
        authenticated
            .or_else(|| self.by_address.get(&record.ip))
            .cloned()
            .unwrap_or_else(|| record.ip.to_string())
    }
}

fn reconcile_with(
    identities: &BTreeMap<String, DeviceIdentity>,
    discovery: &BTreeMap<IpAddr, DiscoveryRecord>,
    telemetry: &BTreeMap<String, TelemetrySample>,
    as_of: Option<DateTime<Utc>>,
) -> BTreeMap<String, TrustRecord> {
    let index = DeviceIndex::build(identities);

    // Latest discovery record per device; equal times keep the lower address.
    let mut sightings: BTreeMap<String, &DiscoveryRecord> = BTreeMap::new();
    for record in discovery.values() {
        let device_id = index.device_for(record);
        match sightings.get(&device_id) {
            Some(existing) if existing.observed_at >= record.observed_at => {}
            _ => {
                sightings.insert(device_id, record);
            }
        }
    }

    let device_ids: BTreeSet<&String> = identities
        .keys()
        .chain(sightings.keys())
        .chain(telemetry.keys())
        .collect();

    device_ids
        .into_iter()
        .map(|device_id| {
            let record = build_record(
                device_id,
                identities.get(device_id),
                sightings.get(device_id).copied(),
                telemetry.get(device_id),
                as_of,
            );
            (device_id.clone(), record)
        })
        .collect()
}

fn build_record(
    device_id: &str,
    identity: Option<&DeviceIdentity>,
    sighting: Option<&DiscoveryRecord>,
    sample: Option<&TelemetrySample>,
    as_of: Option<DateTime<Utc>>,
) -> TrustRecord {
    let mut flags = TrustFlags::UNVERIFIED;
    if let Some(identity) = identity {
        let in_window = as_of.map_or(true, |t| identity.certificate_validity_window.contains(t));
        flags.certificate_status = identity.certificate_status && in_window;
        flags.key_status = identity.key_status;
        flags.revoked = identity.revoked;
    }
    if let Some(sighting) = sighting {
        flags.mtls_status = sighting.mtls_status;
        flags.mitm_status = match (identity, &sighting.peer_common_name) {
            (Some(identity), Some(peer_cn)) => {
                sighting.mtls_status && *peer_cn == identity.certificate_common_name
            }
            _ => false,
        };
    }

    let issue_reasons = classify(&flags);
    let severity_class = severity(&issue_reasons);

    let last_seen = [
        sample.map(|s| s.timestamp.unwrap_or(s.received_at)),
        sighting.filter(|s| s.mtls_status).map(|s| s.observed_at),
    ]
    .into_iter()
    .flatten()
    .max();

    let last_updated = [
        identity.map(|i| i.issued_at),
        identity.and_then(|i| i.revoked_at),
        sighting.map(|s| s.observed_at),
        sample.and_then(|s| s.timestamp),
        sample.map(|s| s.received_at),
    ]
    .into_iter()
    .flatten()
    .max();

    TrustRecord {
        device_id: device_id.to_string(),
        common_name: identity
            .map(|i| i.certificate_common_name.clone())
            .unwrap_or_else(|| UNKNOWN_COMMON_NAME.to_string()),
        certificate_status: flags.certificate_status,
        key_status: flags.key_status,
        mtls_status: flags.mtls_status,
        mitm_status: flags.mitm_status,
        revoked: flags.revoked,
        provisioned: identity.is_some(),
        valid_from: identity.map(|i| i.certificate_validity_window.from),
        valid_to: identity.map(|i| i.certificate_validity_window.to),
        issued_at: identity.map(|i| i.issued_at),
        serial: identity.map(|i| i.serial.clone()),
        delivery: identity.map(|i| i.delivery),
        ip: sighting.map(|s| s.ip).or_else(|| identity.and_then(|i| i.address)),
        hostname: sighting.map(|s| s.hostname.clone()),
        mac: sighting.map(|s| s.mac.clone()),
        latency_ms: sighting.and_then(|s| s.latency_ms),
        probe_error: sighting.and_then(|s| s.probe_error.clone()),
        status: sample.map(|s| s.status),
        sensor_summary: summarize_sensors(sample.and_then(|s| s.sensors.as_ref())),
        sensors: sample.and_then(|s| s.sensors.clone()),
        last_seen,
        last_updated,
        issue_reasons,
        severity_class,
    }
}
