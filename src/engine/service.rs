//! Trust engine service.
//!
//! Owns the stores and capabilities and exposes the four fleet operations
//! plus revocation, redelivery and the alert digest. Every successful write
//! republishes the trust-state file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::ledger::DiscoveryLedger;
use super::trust_file::{TrustState, TrustStateFile};
use crate::config::EngineConfig;
use crate::discovery::{
    local_ipv4, HandshakeProbe, HostEnumerator, MtlsProber, ScanSettings, Scanner, TcpSweep,
};
use crate::error::EngineError;
use crate::issuance::{
    CertificateDelivery, CertificateParser, CsrSigner, DirectoryDelivery, IssuanceAuthority,
    IssuanceError, IssuanceSettings, IssueRequest, LocalCa, X509CertificateParser,
};
use crate::logging::LogContext;
use crate::reconcile::{reconcile_at, summarize, TrustSummary};
use crate::storage::{DeviceIdentity, DiscoveryRecord, KeyedStore, TelemetrySample};
use crate::telemetry::{BatchIngestResult, IngestOutcome, TelemetryIngest};
use crate::{log_error, log_info, log_warn};

/// Common name of the engine's own CA.
pub const CA_COMMON_NAME: &str = "DevTrust Fleet CA";

/// Parts an engine is assembled from. `TrustEngine::open` builds the
/// production set; tests swap in fakes.
pub struct EngineComponents {
    pub identities: Arc<KeyedStore<DeviceIdentity>>,
    pub telemetry: Arc<KeyedStore<TelemetrySample>>,
    pub signer: Arc<dyn CsrSigner>,
    pub parser: Arc<dyn CertificateParser>,
    pub delivery: Option<Arc<dyn CertificateDelivery>>,
    pub enumerator: Arc<dyn HostEnumerator>,
    pub prober: Arc<dyn HandshakeProbe>,
    pub issuance: IssuanceSettings,
    pub scan: ScanSettings,
    pub ledger: DiscoveryLedger,
    pub trust_state_path: Option<PathBuf>,
}

impl EngineComponents {
    /// Volatile components around the given capabilities.
    pub fn in_memory(
        signer: Arc<dyn CsrSigner>,
        parser: Arc<dyn CertificateParser>,
        enumerator: Arc<dyn HostEnumerator>,
        prober: Arc<dyn HandshakeProbe>,
    ) -> Self {
        Self {
            identities: Arc::new(KeyedStore::in_memory("identities")),
            telemetry: Arc::new(KeyedStore::in_memory("telemetry")),
            signer,
            parser,
            delivery: None,
            enumerator,
            prober,
            issuance: IssuanceSettings::default(),
            scan: ScanSettings::default(),
            ledger: DiscoveryLedger::in_memory(),
            trust_state_path: None,
        }
    }

    /// Durable stores, ledger and trust-state file under `config.state_dir`.
    pub fn durable(
        config: &EngineConfig,
        signer: Arc<dyn CsrSigner>,
        parser: Arc<dyn CertificateParser>,
        enumerator: Arc<dyn HostEnumerator>,
        prober: Arc<dyn HandshakeProbe>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let delivery = config
            .delivery_dir
            .as_ref()
            .map(|dir| Arc::new(DirectoryDelivery::new(dir)) as Arc<dyn CertificateDelivery>);

        Ok(Self {
            identities: Arc::new(KeyedStore::open("identities", config.identities_dir())?),
            telemetry: Arc::new(KeyedStore::open("telemetry", config.telemetry_dir())?),
            signer,
            parser,
            delivery,
            enumerator,
            prober,
            issuance: config.issuance_settings(),
            scan: scan_settings(config),
            ledger: DiscoveryLedger::open(config.discovery_ledger_path())?,
            trust_state_path: Some(config.trust_state_path()),
        })
    }
}

fn scan_settings(config: &EngineConfig) -> ScanSettings {
    let exclude = if config.exclude_addresses.is_empty() {
        local_ipv4().into_iter().collect()
    } else {
        config.exclude_addresses.clone()
    };
    ScanSettings {
        mtls_port: config.mtls_port,
        probe_timeout: config.probe_timeout(),
        scan_timeout: config.scan_timeout(),
        workers: config.probe_workers,
        exclude,
    }
}

pub struct TrustEngine {
    authority: IssuanceAuthority,
    scanner: Scanner,
    telemetry: TelemetryIngest,
    ledger: DiscoveryLedger,
    trust_file: TrustStateFile,
    ca_certificate_pem: Option<String>,
}

impl TrustEngine {
    /// Production engine: local CA, x509 parser, TCP sweep and mTLS prober,
    /// all state under `config.state_dir`.
    pub fn open(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let ca = Arc::new(LocalCa::open_or_create(&config.ca_dir(), CA_COMMON_NAME)?);
        let client = ca.mint_client_identity(&config.client_common_name, config.validity_days)?;
        let prober = MtlsProber::new(&client)?;
        let sweep = TcpSweep::new(
            config.sweep_ports.clone(),
            config.probe_timeout(),
            config.probe_workers,
        );

        let components = EngineComponents::durable(
            config,
            Arc::clone(&ca) as Arc<dyn CsrSigner>,
            Arc::new(X509CertificateParser),
            Arc::new(sweep),
            Arc::new(prober),
        )?;
        let engine = Self::with_components(components)?
            .with_ca_certificate(ca.certificate_pem().to_string());
        log::info!(
            "ENGINE_OPENED state_dir={} identities={} telemetry={} discovered={}",
            config.state_dir.display(),
            engine.authority.store().len(),
            engine.telemetry.store().len(),
            engine.ledger.len()
        );
        Ok(engine)
    }

    /// Assemble an engine and publish the initial trust view.
    pub fn with_components(components: EngineComponents) -> Result<Self, EngineError> {
        let engine = Self {
            authority: IssuanceAuthority::new(
                components.identities,
                components.signer,
                components.parser,
                components.delivery,
                components.issuance,
            ),
            scanner: Scanner::new(components.enumerator, components.prober, components.scan),
            telemetry: TelemetryIngest::new(components.telemetry),
            ledger: components.ledger,
            trust_file: TrustStateFile::new(components.trust_state_path),
            ca_certificate_pem: None,
        };
        engine.publish()?;
        Ok(engine)
    }

    fn with_ca_certificate(mut self, pem: String) -> Self {
        self.ca_certificate_pem = Some(pem);
        self
    }

    /// PEM of the CA devices should trust, when the engine runs its own.
    pub fn ca_certificate_pem(&self) -> Option<&str> {
        self.ca_certificate_pem.as_deref()
    }

    /// Issue an identity for `device_id` from `csr` (PEM or DER).
    pub fn provision(
        &self,
        device_id: &str,
        csr: &[u8],
        force: bool,
    ) -> Result<DeviceIdentity, EngineError> {
        self.provision_request(&IssueRequest::new(device_id, csr).force(force))
    }

    pub fn provision_request(&self, request: &IssueRequest) -> Result<DeviceIdentity, EngineError> {
        let result = self.authority.issue(request);
        self.after_issuance(&request.device_id, result)
    }

    /// Revoke the live identity of `device_id`.
    pub fn revoke(&self, device_id: &str) -> Result<DeviceIdentity, EngineError> {
        let identity = self.authority.revoke(device_id)?;
        self.publish()?;
        Ok(identity)
    }

    /// Retry delivery of an already signed certificate.
    pub fn redeliver(&self, device_id: &str) -> Result<DeviceIdentity, EngineError> {
        let result = self.authority.redeliver(device_id);
        self.after_issuance(device_id, result)
    }

    // A delivery failure still committed the identity, so the view is
    // refreshed before the error goes back to the caller.
    fn after_issuance(
        &self,
        device_id: &str,
        result: Result<DeviceIdentity, IssuanceError>,
    ) -> Result<DeviceIdentity, EngineError> {
        match result {
            Ok(identity) => {
                self.publish()?;
                Ok(identity)
            }
            Err(e @ IssuanceError::DeliveryFailure { .. }) => {
                if let Err(publish_error) = self.publish() {
                    let ctx = LogContext::new("publish").with_device(device_id);
                    log_error!(ctx, "TRUST_STATE_WRITE_FAILED", error = publish_error.to_string());
                }
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Discover hosts in `cidr`, record the pass and republish.
    pub fn scan(&self, cidr: &str) -> Result<Vec<DiscoveryRecord>, EngineError> {
        let records = self.scanner.discover(cidr)?;
        self.ledger.record_pass(&records)?;
        self.publish()?;
        Ok(records)
    }

    /// Validate and store one telemetry payload.
    pub fn ingest_telemetry(&self, payload: &Value) -> Result<IngestOutcome, EngineError> {
        let outcome = self.telemetry.ingest(payload)?;
        if outcome.is_stored() {
            self.publish()?;
        }
        Ok(outcome)
    }

    /// Same as `ingest_telemetry` for a raw JSON body.
    pub fn ingest_telemetry_json(&self, raw: &str) -> Result<IngestOutcome, EngineError> {
        let outcome = self.telemetry.ingest_json(raw)?;
        if outcome.is_stored() {
            self.publish()?;
        }
        Ok(outcome)
    }

    /// Ingest several payloads, publishing once at the end.
    pub fn ingest_telemetry_batch(&self, payloads: &[Value]) -> Result<BatchIngestResult, EngineError> {
        let result = self.telemetry.ingest_batch(payloads);
        if result.stored_count > 0 {
            self.publish()?;
        }
        Ok(result)
    }

    /// Current reconciled view. Reads only; nothing is written.
    pub fn get_trust_state(&self) -> TrustState {
        self.reconcile_now()
    }

    /// Counts and the capped alert list for the current view.
    pub fn trust_summary(&self) -> TrustSummary {
        summarize(&self.reconcile_now())
    }

    /// Last view written to the trust-state file.
    pub fn published_trust_state(&self) -> Result<TrustState, EngineError> {
        Ok(self.trust_file.load()?)
    }

    pub fn identity(&self, device_id: &str) -> Option<DeviceIdentity> {
        self.authority.store().get(device_id)
    }

    pub fn discovery(&self) -> BTreeMap<std::net::IpAddr, DiscoveryRecord> {
        self.ledger.snapshot()
    }

    pub fn latest_telemetry(&self, device_id: &str) -> Option<TelemetrySample> {
        self.telemetry.latest(device_id)
    }

    fn reconcile_now(&self) -> TrustState {
        reconcile_at(
            &self.authority.store().snapshot(),
            &self.ledger.snapshot(),
            &self.telemetry.snapshot(),
            Utc::now(),
        )
    }

    fn publish(&self) -> Result<TrustState, EngineError> {
        let state = self.trust_file.publish(|| self.reconcile_now())?;
        let issues = state.values().filter(|record| record.has_issues()).count();
        if issues > 0 {
            let ctx = LogContext::new("publish");
            log_warn!(ctx, "TRUST_STATE_ISSUES", devices = state.len(), with_issues = issues);
        } else {
            let ctx = LogContext::new("publish");
            log_info!(ctx, "TRUST_STATE_CLEAN", devices = state.len());
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{HostEntry, ProbeOutcome, Subnet};
    use crate::issuance::{BackendError, CertificateSummary};
    use crate::reconcile::{IssueReason, SeverityClass};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::net::IpAddr;
    use std::time::{Duration, Instant};

    struct PlainSigner;

    impl CsrSigner for PlainSigner {
        fn sign(&self, _csr: &[u8], subject_cn: &str, _days: u32) -> Result<Vec<u8>, BackendError> {
            Ok(format!("CERT:{}", subject_cn).into_bytes())
        }
    }

    struct PlainParser;

    impl CertificateParser for PlainParser {
        fn parse(&self, certificate: &[u8]) -> Result<CertificateSummary, BackendError> {
            let text = String::from_utf8_lossy(certificate);
            let now = Utc::now();
            Ok(CertificateSummary {
                common_name: text.trim_start_matches("CERT:").to_string(),
                valid_from: now - ChronoDuration::minutes(1),
                valid_to: now + ChronoDuration::days(365),
                serial: "01".to_string(),
                fingerprint_sha256: "00".repeat(32),
            })
        }
    }

    struct NoHosts;

    impl HostEnumerator for NoHosts {
        fn hosts_up(&self, _subnet: &Subnet, _deadline: Instant) -> Vec<HostEntry> {
            Vec::new()
        }
    }

    struct Closed;

    impl HandshakeProbe for Closed {
        fn probe(&self, _ip: IpAddr, _port: u16, _timeout: Duration) -> ProbeOutcome {
            ProbeOutcome::rejected("connection refused")
        }
    }

    fn engine() -> TrustEngine {
        let components = EngineComponents::in_memory(
            Arc::new(PlainSigner),
            Arc::new(PlainParser),
            Arc::new(NoHosts),
            Arc::new(Closed),
        );
        TrustEngine::with_components(components).unwrap()
    }

    fn csr(cn: &str) -> Vec<u8> {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        params.distinguished_name.push(rcgen::DnType::CommonName, cn);
        params.serialize_request(&key).unwrap().pem().unwrap().into_bytes()
    }

    #[test]
    fn test_fresh_engine_is_empty() {
        let engine = engine();
        assert!(engine.get_trust_state().is_empty());
        assert_eq!(engine.trust_summary().total_devices, 0);
        assert!(engine.ca_certificate_pem().is_none());
    }

    #[test]
    fn test_provisioned_device_without_probe_is_unverified() {
        let engine = engine();
        engine.provision("dev-1", &csr("dev-1"), false).unwrap();

        let state = engine.get_trust_state();
        let record = &state["dev-1"];
        assert!(record.certificate_status);
        assert!(record.key_status);
        assert!(!record.mtls_status);
        assert_eq!(record.severity_class, SeverityClass::Critical);
        assert!(record.issue_reasons.contains(&IssueReason::MTLSFailed));
    }

    #[test]
    fn test_revoke_marks_record_critical() {
        let engine = engine();
        engine.provision("dev-2", &csr("dev-2"), false).unwrap();
        engine.revoke("dev-2").unwrap();

        let record = &engine.get_trust_state()["dev-2"];
        assert!(record.issue_reasons.contains(&IssueReason::Revoked));
        assert_eq!(record.severity_class, SeverityClass::Critical);
    }

    #[test]
    fn test_rejected_telemetry_leaves_state_untouched() {
        let engine = engine();
        let err = engine
            .ingest_telemetry(&json!({"device_id": "d1", "sensors": [1, 2]}))
            .unwrap_err();
        assert_eq!(err.reason_code(), "SENSORS_NOT_MAPPING");
        assert!(engine.get_trust_state().is_empty());
    }

    #[test]
    fn test_invalid_subnet_is_input_error() {
        let engine = engine();
        let err = engine.scan("10.0.0.0").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InputValidation);
    }
}
