//! Shared fakes for engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use devtrust_core::discovery::{HandshakeProbe, HostEnumerator, HostEntry, ProbeOutcome, Subnet};
use devtrust_core::issuance::{
    BackendError, CertificateDelivery, CertificateParser, CertificateSummary, CsrSigner,
};
use devtrust_core::{EngineComponents, TrustEngine};
use parking_lot::Mutex;
use rcgen::{CertificateParams, DnType, KeyPair};

pub fn csr_pem(common_name: &str) -> Vec<u8> {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.serialize_request(&key).unwrap().pem().unwrap().into_bytes()
}

/// Signer producing `CERT|<cn>|<call number>` and counting calls.
#[derive(Default)]
pub struct CountingSigner {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingSigner {
    pub fn slow(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CsrSigner for CountingSigner {
    fn sign(&self, _csr: &[u8], subject_cn: &str, _days: u32) -> Result<Vec<u8>, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        Ok(format!("CERT|{}|{}", subject_cn, n).into_bytes())
    }
}

/// Parser for `CountingSigner` output with a fixed validity window.
pub struct TextParser {
    pub valid_from: DateTime<Utc>,
}

impl Default for TextParser {
    fn default() -> Self {
        Self {
            valid_from: Utc::now() - ChronoDuration::hours(1),
        }
    }
}

impl CertificateParser for TextParser {
    fn parse(&self, certificate: &[u8]) -> Result<CertificateSummary, BackendError> {
        let text = String::from_utf8_lossy(certificate);
        let mut parts = text.split('|').skip(1);
        let (Some(cn), Some(serial)) = (parts.next(), parts.next()) else {
            return Err(BackendError::new("not a test certificate"));
        };
        Ok(CertificateSummary {
            common_name: cn.to_string(),
            valid_from: self.valid_from,
            valid_to: self.valid_from + ChronoDuration::days(365),
            serial: format!("{:04}", serial.parse::<u32>().unwrap_or(0)),
            fingerprint_sha256: hex::encode(certificate),
        })
    }
}

/// Delivery channel failing its first `failures` attempts.
pub struct FlakyDelivery {
    remaining_failures: AtomicUsize,
    pub delivered: Mutex<Vec<String>>,
}

impl FlakyDelivery {
    pub fn failing(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
            delivered: Mutex::new(Vec::new()),
        }
    }
}

impl CertificateDelivery for FlakyDelivery {
    fn deliver(&self, device_id: &str, _pem: &[u8]) -> Result<(), BackendError> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BackendError::new("device unreachable"));
        }
        self.delivered.lock().push(device_id.to_string());
        Ok(())
    }
}

/// Scripted network: which hosts are up and how each answers the probe.
#[derive(Default)]
pub struct FakeNetwork {
    hosts: Mutex<Vec<HostEntry>>,
    outcomes: Mutex<HashMap<IpAddr, ProbeOutcome>>,
}

impl FakeNetwork {
    pub fn host(&self, ip: &str, outcome: ProbeOutcome) -> &Self {
        let ip: IpAddr = ip.parse().unwrap();
        self.hosts.lock().push(HostEntry::new(ip));
        self.outcomes.lock().insert(ip, outcome);
        self
    }

    pub fn set_outcome(&self, ip: &str, outcome: ProbeOutcome) {
        self.outcomes.lock().insert(ip.parse().unwrap(), outcome);
    }
}

impl HostEnumerator for FakeNetwork {
    fn hosts_up(&self, subnet: &Subnet, _deadline: Instant) -> Vec<HostEntry> {
        self.hosts
            .lock()
            .iter()
            .filter(|h| subnet.contains(h.ip))
            .cloned()
            .collect()
    }
}

impl HandshakeProbe for FakeNetwork {
    fn probe(&self, ip: IpAddr, _port: u16, _timeout: Duration) -> ProbeOutcome {
        self.outcomes
            .lock()
            .get(&ip)
            .cloned()
            .unwrap_or_else(|| ProbeOutcome::rejected("connection refused"))
    }
}

/// Fakes plus the engine built from them.
pub struct Harness {
    pub signer: Arc<CountingSigner>,
    pub network: Arc<FakeNetwork>,
    pub engine: Arc<TrustEngine>,
}

pub fn components(signer: Arc<CountingSigner>, network: Arc<FakeNetwork>) -> EngineComponents {
    EngineComponents::in_memory(
        signer,
        Arc::new(TextParser::default()),
        Arc::clone(&network) as Arc<dyn HostEnumerator>,
        network,
    )
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(customize: impl FnOnce(&mut EngineComponents)) -> Harness {
    let signer = Arc::new(CountingSigner::default());
    let network = Arc::new(FakeNetwork::default());
    let mut parts = components(Arc::clone(&signer), Arc::clone(&network));
    customize(&mut parts);
    let engine = Arc::new(TrustEngine::with_components(parts).unwrap());
    Harness {
        signer,
        network,
        engine,
    }
}
