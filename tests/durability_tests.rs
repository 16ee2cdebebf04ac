//! State survives engine restarts.

mod common;

use std::sync::Arc;

use common::{csr_pem, CountingSigner, FakeNetwork, TextParser};
use devtrust_core::discovery::{HandshakeProbe, HostEnumerator, ProbeOutcome};
use devtrust_core::engine::TrustStateFile;
use devtrust_core::{EngineComponents, EngineConfig, TrustEngine};
use serde_json::json;

fn durable_engine(config: &EngineConfig, network: &Arc<FakeNetwork>) -> TrustEngine {
    let components = EngineComponents::durable(
        config,
        Arc::new(CountingSigner::default()),
        Arc::new(TextParser::default()),
        Arc::clone(network) as Arc<dyn HostEnumerator>,
        Arc::clone(network) as Arc<dyn HandshakeProbe>,
    )
    .unwrap();
    TrustEngine::with_components(components).unwrap()
}

#[test]
fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::with_state_dir(dir.path());
    config.exclude_addresses = vec!["192.0.2.250".parse().unwrap()];
    let network = Arc::new(FakeNetwork::default());
    network.host("10.0.0.1", ProbeOutcome::accepted(Some("dev-1".into()), 1.5));

    let before = {
        let engine = durable_engine(&config, &network);
        engine.provision("dev-1", &csr_pem("dev-1"), false).unwrap();
        engine.scan("10.0.0.0/30").unwrap();
        engine
            .ingest_telemetry(&json!({"device_id": "dev-1", "timestamp": "2026-03-01T10:00:00Z"}))
            .unwrap();
        engine.get_trust_state()
    };

    let reopened = durable_engine(&config, &network);
    assert_eq!(before.len(), 1);
    assert!(before["dev-1"].mtls_status);
    assert_eq!(reopened.get_trust_state(), before);
    assert_eq!(reopened.discovery().len(), 1);
    assert!(reopened.identity("dev-1").is_some());
    assert!(reopened.latest_telemetry("dev-1").is_some());

    // Re-issuing after restart is still idempotent.
    let again = reopened.provision("dev-1", &csr_pem("dev-1"), false).unwrap();
    assert_eq!(again.serial, before["dev-1"].serial.clone().unwrap());
}

#[test]
fn test_trust_state_file_tracks_writes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::with_state_dir(dir.path());
    config.exclude_addresses = vec!["192.0.2.250".parse().unwrap()];
    let network = Arc::new(FakeNetwork::default());

    let engine = durable_engine(&config, &network);
    let file = TrustStateFile::new(Some(config.trust_state_path()));
    assert!(file.load().unwrap().is_empty());

    engine.provision("dev-2", &csr_pem("dev-2"), false).unwrap();
    let published = file.load().unwrap();
    assert!(published.contains_key("dev-2"));
    assert_eq!(engine.published_trust_state().unwrap(), published);
}

#[test]
fn test_local_ca_engine_issues_verifiable_certificates() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::with_state_dir(dir.path());
    config.exclude_addresses = vec!["192.0.2.250".parse().unwrap()];

    let (ca_pem, serial) = {
        let engine = TrustEngine::open(&config).unwrap();
        let identity = engine.provision("cam-7", &csr_pem("cam-7"), false).unwrap();
        assert_eq!(identity.certificate_common_name, "cam-7");
        assert!(identity.certificate_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        (engine.ca_certificate_pem().unwrap().to_string(), identity.serial)
    };

    let reopened = TrustEngine::open(&config).unwrap();
    assert_eq!(reopened.ca_certificate_pem(), Some(ca_pem.as_str()));
    assert_eq!(reopened.identity("cam-7").unwrap().serial, serial);
}

#[test]
fn test_delivery_dir_receives_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let outbox = dir.path().join("outbox");
    let mut config = EngineConfig::with_state_dir(dir.path().join("state"));
    config.exclude_addresses = vec!["192.0.2.250".parse().unwrap()];
    config.delivery_dir = Some(outbox.clone());

    let engine = TrustEngine::open(&config).unwrap();
    let identity = engine.provision("cam-8", &csr_pem("cam-8"), false).unwrap();

    let written = std::fs::read_to_string(outbox.join("cam-8.crt")).unwrap();
    assert_eq!(written, identity.certificate_pem);
}
