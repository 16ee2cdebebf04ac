//! Discovery scanner.
//!
//! One pass: enumerate live hosts, drop excluded addresses, then probe each
//! remaining host for mTLS acceptance on a bounded worker pool. Probe
//! failures become `mtls_status=false`. Enumeration and probing share one
//! deadline; hosts found but not probed in time are still reported.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use super::{DiscoveryError, HandshakeProbe, HostEntry, HostEnumerator, ProbeOutcome, Subnet};
use crate::logging::structured::LogContext;
use crate::storage::DiscoveryRecord;

pub const UNKNOWN: &str = "unknown";

/// Scanner tunables.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub mtls_port: u16,
    pub probe_timeout: Duration,
    /// Overall budget for enumeration plus probing.
    pub scan_timeout: Duration,
    pub workers: usize,
    /// Never reported or probed (the scanner's own addresses).
    pub exclude: Vec<IpAddr>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            mtls_port: 443,
            probe_timeout: Duration::from_secs(3),
            scan_timeout: Duration::from_secs(120),
            workers: 32,
            exclude: Vec::new(),
        }
    }
}

pub struct Scanner {
    enumerator: Arc<dyn HostEnumerator>,
    prober: Arc<dyn HandshakeProbe>,
    settings: ScanSettings,
}

impl Scanner {
    pub fn new(
        enumerator: Arc<dyn HostEnumerator>,
        prober: Arc<dyn HandshakeProbe>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            enumerator,
            prober,
            settings,
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Run one discovery pass over `cidr`, sorted by address.
    ///
    /// Only a malformed CIDR is an error.
    pub fn discover(&self, cidr: &str) -> Result<Vec<DiscoveryRecord>, DiscoveryError> {
        let ctx = LogContext::new("scan");
        let subnet = Subnet::parse(cidr).map_err(|e| {
            log::warn!("{} SCAN_REJECTED cidr={} error={}", ctx, cidr, e);
            e
        })?;
        let started = Instant::now();
        let deadline = started + self.settings.scan_timeout;

        log::info!(
            "{} SCAN_START subnet={} candidates={} port={}",
            ctx,
            subnet,
            subnet.host_count(),
            self.settings.mtls_port
        );

        let hosts = self.enumerate(&subnet, deadline, &ctx);
        let hosts: Vec<HostEntry> = hosts
            .into_iter()
            .filter(|host| subnet.contains(host.ip) && !self.settings.exclude.contains(&host.ip))
            .collect();

        let mut records = self.probe_all(&hosts, deadline);
        records.sort_by_key(|record| record.ip);

        let accepted = records.iter().filter(|r| r.mtls_status).count();
        log::info!(
            "{} SCAN_COMPLETE subnet={} hosts={} mtls_ok={} elapsed_ms={}",
            ctx,
            subnet,
            records.len(),
            accepted,
            started.elapsed().as_millis()
        );
        Ok(records)
    }

    fn enumerate(&self, subnet: &Subnet, deadline: Instant, ctx: &LogContext) -> Vec<HostEntry> {
        let hosts = self.enumerator.hosts_up(subnet, deadline);
        if Instant::now() >= deadline {
            log::warn!(
                "{} ENUMERATION_DEADLINE subnet={} hosts={}",
                ctx,
                subnet,
                hosts.len()
            );
        }
        hosts
    }

    fn probe_all(&self, hosts: &[HostEntry], deadline: Instant) -> Vec<DiscoveryRecord> {
        let next = AtomicUsize::new(0);
        let records = Mutex::new(Vec::with_capacity(hosts.len()));

        thread::scope(|scope| {
            for _ in 0..self.settings.workers.max(1).min(hosts.len()) {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(host) = hosts.get(index) else {
                        break;
                    };
                    let outcome = if Instant::now() >= deadline {
                        ProbeOutcome::rejected("scan deadline exceeded before probe")
                    } else {
                        self.prober.probe(
                            host.ip,
                            self.settings.mtls_port,
                            self.settings.probe_timeout,
                        )
                    };
                    records.lock().push(to_record(host, outcome));
                });
            }
        });

        records.into_inner()
    }
}

fn to_record(host: &HostEntry, outcome: ProbeOutcome) -> DiscoveryRecord {
    DiscoveryRecord {
        ip: host.ip,
        hostname: host.hostname.clone().unwrap_or_else(|| UNKNOWN.to_string()),
        mac: host.mac.clone().unwrap_or_else(|| UNKNOWN.to_string()),
        mtls_status: outcome.accepted,
        peer_common_name: outcome.peer_common_name,
        latency_ms: outcome.latency_ms,
        probe_error: outcome.error,
        observed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedHosts(Vec<HostEntry>);

    impl HostEnumerator for FixedHosts {
        fn hosts_up(&self, _subnet: &Subnet, _deadline: Instant) -> Vec<HostEntry> {
            self.0.clone()
        }
    }

    struct ScriptedProbe(HashMap<IpAddr, bool>);

    impl HandshakeProbe for ScriptedProbe {
        fn probe(&self, ip: IpAddr, _port: u16, _timeout: Duration) -> ProbeOutcome {
            match self.0.get(&ip) {
                Some(true) => ProbeOutcome::accepted(Some(ip.to_string()), 1.0),
                _ => ProbeOutcome::rejected("handshake refused"),
            }
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn scanner(hosts: Vec<HostEntry>, accept: &[&str], settings: ScanSettings) -> Scanner {
        let probe = ScriptedProbe(accept.iter().map(|s| (ip(s), true)).collect());
        Scanner::new(Arc::new(FixedHosts(hosts)), Arc::new(probe), settings)
    }

    #[test]
    fn test_slash_30_scenario() {
        let hosts = vec![HostEntry::new(ip("10.0.0.2")), HostEntry::new(ip("10.0.0.1"))];
        let records = scanner(hosts, &["10.0.0.1"], ScanSettings::default())
            .discover("10.0.0.0/30")
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ip, ip("10.0.0.1"));
        assert!(records[0].mtls_status);
        assert_eq!(records[1].ip, ip("10.0.0.2"));
        assert!(!records[1].mtls_status);
        assert_eq!(records[1].probe_error.as_deref(), Some("handshake refused"));
        assert_eq!(records[1].hostname, UNKNOWN);
        assert_eq!(records[1].mac, UNKNOWN);
    }

    #[test]
    fn test_own_address_and_outsiders_excluded() {
        let hosts = vec![
            HostEntry::new(ip("10.0.0.1")),
            HostEntry::new(ip("10.0.0.2")),
            HostEntry::new(ip("10.9.9.9")),
        ];
        let settings = ScanSettings {
            exclude: vec![ip("10.0.0.2")],
            ..ScanSettings::default()
        };
        let records = scanner(hosts, &[], settings).discover("10.0.0.0/24").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ip, ip("10.0.0.1"));
    }

    #[test]
    fn test_invalid_subnet_is_the_only_error() {
        let err = scanner(Vec::new(), &[], ScanSettings::default())
            .discover("10.0.0.0/99")
            .unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_SUBNET");
    }

    #[test]
    fn test_empty_network() {
        let records = scanner(Vec::new(), &[], ScanSettings::default())
            .discover("10.0.0.0/24")
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_expired_deadline_returns_partial_results() {
        struct SlowProbe;
        impl HandshakeProbe for SlowProbe {
            fn probe(&self, _ip: IpAddr, _port: u16, _timeout: Duration) -> ProbeOutcome {
                thread::sleep(Duration::from_millis(150));
                ProbeOutcome::accepted(None, 1.0)
            }
        }

        let hosts: Vec<HostEntry> = (1..=6).map(|n| HostEntry::new(ip(&format!("10.0.0.{}", n)))).collect();
        let settings = ScanSettings {
            scan_timeout: Duration::from_millis(100),
            workers: 1,
            ..ScanSettings::default()
        };
        let scanner = Scanner::new(Arc::new(FixedHosts(hosts)), Arc::new(SlowProbe), settings);

        let records = scanner.discover("10.0.0.0/29").unwrap();
        assert_eq!(records.len(), 6);
        let probed = records.iter().filter(|r| r.mtls_status).count();
        assert!(probed >= 1 && probed < 6, "probed {}", probed);
    }

    #[test]
    fn test_slow_enumeration_keeps_found_hosts() {
        struct OverrunningSweep(Vec<HostEntry>);
        impl HostEnumerator for OverrunningSweep {
            fn hosts_up(&self, _subnet: &Subnet, deadline: Instant) -> Vec<HostEntry> {
                thread::sleep(deadline.saturating_duration_since(Instant::now()) + Duration::from_millis(20));
                self.0.clone()
            }
        }

        let hosts = vec![HostEntry::new(ip("10.0.0.1")), HostEntry::new(ip("10.0.0.2"))];
        let settings = ScanSettings {
            scan_timeout: Duration::from_millis(50),
            ..ScanSettings::default()
        };
        let probe = ScriptedProbe(HashMap::from([(ip("10.0.0.1"), true)]));
        let scanner = Scanner::new(Arc::new(OverrunningSweep(hosts)), Arc::new(probe), settings);

        let records = scanner.discover("10.0.0.0/30").unwrap();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert!(!record.mtls_status);
            assert_eq!(
                record.probe_error.as_deref(),
                Some("scan deadline exceeded before probe")
            );
        }
    }
}
