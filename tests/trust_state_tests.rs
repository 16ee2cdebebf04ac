//! Discovery, telemetry and reconciliation through the engine.

mod common;

use std::net::IpAddr;

use common::{csr_pem, harness};
use devtrust_core::discovery::ProbeOutcome;
use devtrust_core::telemetry::{PayloadRejection, TelemetryError};
use devtrust_core::{EngineError, IngestOutcome, IssueReason, IssueRequest, SeverityClass};
use serde_json::json;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn test_discover_slash_30_reports_each_live_host() {
    let h = harness();
    h.network
        .host("10.0.0.1", ProbeOutcome::accepted(Some("cam-1".into()), 4.2))
        .host("10.0.0.2", ProbeOutcome::rejected("handshake refused"));

    let records = h.engine.scan("10.0.0.0/30").unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].ip, ip("10.0.0.1"));
    assert!(records[0].mtls_status);
    assert_eq!(records[1].ip, ip("10.0.0.2"));
    assert!(!records[1].mtls_status);
    assert_eq!(h.engine.discovery().len(), 2);

    // Neither host is provisioned, so both are keyed by address and critical.
    let state = h.engine.get_trust_state();
    assert_eq!(state.len(), 2);
    assert!(state["10.0.0.1"].mtls_status);
    assert!(state["10.0.0.1"].issue_reasons.contains(&IssueReason::CertFailed));
    assert_eq!(state["10.0.0.2"].severity_class, SeverityClass::Critical);
}

#[test]
fn test_provisioned_device_verified_by_scan_is_healthy() {
    let h = harness();
    h.engine
        .provision_request(&IssueRequest::new("cam-1", csr_pem("cam-1")).at_address(ip("10.0.0.1")))
        .unwrap();
    h.network
        .host("10.0.0.1", ProbeOutcome::accepted(Some("cam-1".into()), 3.0));

    h.engine.scan("10.0.0.0/30").unwrap();
    let state = h.engine.get_trust_state();

    assert_eq!(state.len(), 1);
    let record = &state["cam-1"];
    assert!(record.mtls_status);
    assert!(record.mitm_status);
    assert!(!record.has_issues());
    assert_eq!(record.severity_class, SeverityClass::None);
    assert_eq!(record.ip, Some(ip("10.0.0.1")));
}

#[test]
fn test_device_provisioned_by_id_joins_its_scan_result() {
    let h = harness();
    h.engine.provision("cam-1", &csr_pem("cam-1"), false).unwrap();
    h.network
        .host("10.0.0.1", ProbeOutcome::accepted(Some("cam-1".into()), 3.0));

    h.engine.scan("10.0.0.0/30").unwrap();
    let state = h.engine.get_trust_state();

    assert_eq!(state.len(), 1);
    let record = &state["cam-1"];
    assert!(record.mtls_status);
    assert!(record.mitm_status);
    assert!(!record.has_issues());
    assert_eq!(record.ip, Some(ip("10.0.0.1")));
}

#[test]
fn test_unexpected_peer_certificate_is_mitm_warning() {
    let h = harness();
    h.engine
        .provision_request(&IssueRequest::new("cam-2", csr_pem("cam-2")).at_address(ip("10.0.0.2")))
        .unwrap();
    h.network
        .host("10.0.0.2", ProbeOutcome::accepted(Some("intruder".into()), 3.0));

    h.engine.scan("10.0.0.0/30").unwrap();
    let record = &h.engine.get_trust_state()["cam-2"];

    assert!(record.mtls_status);
    assert!(!record.mitm_status);
    assert_eq!(record.issue_reasons, vec![IssueReason::MITMRisk]);
    assert_eq!(record.severity_class, SeverityClass::Warning);

    let summary = h.engine.trust_summary();
    assert_eq!(summary.warning, 1);
    assert_eq!(summary.critical, 0);
}

#[test]
fn test_later_scan_updates_mtls_status() {
    let h = harness();
    h.network.host("10.0.0.1", ProbeOutcome::accepted(None, 2.0));
    h.engine.scan("10.0.0.0/30").unwrap();
    assert!(h.engine.get_trust_state()["10.0.0.1"].mtls_status);

    h.network.set_outcome("10.0.0.1", ProbeOutcome::rejected("timed out"));
    h.engine.scan("10.0.0.0/30").unwrap();
    let record = &h.engine.get_trust_state()["10.0.0.1"];
    assert!(!record.mtls_status);
    assert_eq!(record.probe_error.as_deref(), Some("timed out"));
}

#[test]
fn test_invalid_timestamp_is_rejected_without_record() {
    let h = harness();
    let err = h
        .engine
        .ingest_telemetry(&json!({"device_id": "d1", "timestamp": "not-a-date"}))
        .unwrap_err();

    match err {
        EngineError::Telemetry(TelemetryError::InvalidPayload { rejection, .. }) => {
            assert_eq!(rejection, PayloadRejection::InvalidTimestamp)
        }
        other => panic!("expected invalid payload, got {:?}", other),
    }
    assert!(h.engine.latest_telemetry("d1").is_none());
    assert!(h.engine.get_trust_state().is_empty());
}

#[test]
fn test_non_mapping_sensors_change_nothing() {
    let h = harness();
    h.engine
        .ingest_telemetry(&json!({"device_id": "d2", "status": "online", "sensors": {"cpu": {"usage_percent": 5}}}))
        .unwrap();
    let before = h.engine.latest_telemetry("d2").unwrap();

    let err = h
        .engine
        .ingest_telemetry(&json!({"device_id": "d2", "sensors": "hot"}))
        .unwrap_err();
    assert_eq!(err.reason_code(), "SENSORS_NOT_MAPPING");
    assert_eq!(h.engine.latest_telemetry("d2").unwrap(), before);
}

#[test]
fn test_telemetry_only_device_is_unverified() {
    let h = harness();
    h.engine
        .ingest_telemetry(&json!({
            "device_id": "sensor-9",
            "timestamp": "2026-03-01T10:00:00Z",
            "status": "online",
            "sensors": {"cpu": {"temp_celsius": 41.0}, "memory": {"used_percent": 20}}
        }))
        .unwrap();

    let record = &h.engine.get_trust_state()["sensor-9"];
    assert!(!record.certificate_status);
    assert!(!record.key_status);
    assert!(!record.mtls_status);
    assert_eq!(record.common_name, "Unknown");
    assert_eq!(record.sensor_summary, "41.0°C · Mem 20%");
    assert_eq!(record.severity_class, SeverityClass::Critical);
}

#[test]
fn test_stale_telemetry_is_ignored() {
    let h = harness();
    h.engine
        .ingest_telemetry(&json!({"device_id": "d3", "timestamp": "2026-03-01T10:00:00Z", "status": "online"}))
        .unwrap();

    let outcome = h
        .engine
        .ingest_telemetry(&json!({"device_id": "d3", "timestamp": "2026-03-01T09:00:00Z", "status": "offline"}))
        .unwrap();

    assert!(matches!(outcome, IngestOutcome::Stale { .. }));
    assert_eq!(
        h.engine.get_trust_state()["d3"].status.map(|s| s.as_str()),
        Some("online")
    );
}

#[test]
fn test_get_trust_state_is_repeatable() {
    let h = harness();
    h.network.host("10.0.0.1", ProbeOutcome::rejected("refused"));
    h.engine.provision("dev-1", &csr_pem("dev-1"), false).unwrap();
    h.engine.scan("10.0.0.0/30").unwrap();

    let first = h.engine.get_trust_state();
    let second = h.engine.get_trust_state();
    assert_eq!(first, second);
}
