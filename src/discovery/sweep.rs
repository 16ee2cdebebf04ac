//! TCP connect liveness sweep.
//!
//! A host counts as up when any sweep port accepts or actively refuses a
//! connection; only silence (timeout, unreachable) means down. MAC addresses
//! come from the kernel ARP table, which the sweep itself populates.
//! Hostnames come from a bounded reverse lookup on the sweep worker.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{HostEntry, HostEnumerator, Subnet};
use crate::issuance::deadline::run_with_deadline;

const ARP_TABLE: &str = "/proc/net/arp";
const INCOMPLETE_MAC: &str = "00:00:00:00:00:00";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Default `HostEnumerator`.
#[derive(Debug, Clone)]
pub struct TcpSweep {
    pub ports: Vec<u16>,
    pub connect_timeout: Duration,
    pub workers: usize,
}

impl TcpSweep {
    pub fn new(ports: Vec<u16>, connect_timeout: Duration, workers: usize) -> Self {
        Self {
            ports,
            connect_timeout,
            workers: workers.max(1),
        }
    }

    fn is_up(&self, ip: IpAddr) -> bool {
        self.ports.iter().any(|&port| {
            match TcpStream::connect_timeout(&SocketAddr::new(ip, port), self.connect_timeout) {
                Ok(_) => true,
                Err(e) => e.kind() == ErrorKind::ConnectionRefused,
            }
        })
    }
}

impl HostEnumerator for TcpSweep {
    fn hosts_up(&self, subnet: &Subnet, deadline: Instant) -> Vec<HostEntry> {
        let candidates: Vec<IpAddr> = subnet.hosts().collect();
        let next = AtomicUsize::new(0);
        let checked = AtomicUsize::new(0);
        let up = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for _ in 0..self.workers.min(candidates.len()) {
                scope.spawn(|| loop {
                    if Instant::now() >= deadline {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(&ip) = candidates.get(index) else {
                        break;
                    };
                    checked.fetch_add(1, Ordering::Relaxed);
                    if self.is_up(ip) {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        let hostname = reverse_lookup(ip, remaining.min(LOOKUP_TIMEOUT));
                        up.lock().push((ip, hostname));
                    }
                });
            }
        });

        let mut up = up.into_inner();
        up.sort();

        let macs = read_arp_table(ARP_TABLE);
        let checked = checked.into_inner();
        if checked < candidates.len() {
            log::warn!(
                "SWEEP_TRUNCATED subnet={} candidates={} checked={} up={}",
                subnet,
                candidates.len(),
                checked,
                up.len()
            );
        }
        log::info!(
            "SWEEP_COMPLETE subnet={} candidates={} up={} arp_entries={}",
            subnet,
            candidates.len(),
            up.len(),
            macs.len()
        );

        up.into_iter()
            .map(|(ip, hostname)| HostEntry {
                ip,
                hostname,
                mac: macs.get(&ip).cloned(),
            })
            .collect()
    }
}

/// Reverse DNS name for `ip`, or `None` when nothing answers in `timeout`.
///
/// A resolver that echoes the numeric address back counts as no name.
pub fn reverse_lookup(ip: IpAddr, timeout: Duration) -> Option<String> {
    if timeout.is_zero() {
        return None;
    }
    match run_with_deadline("rdns", timeout, move || dns_lookup::lookup_addr(&ip)) {
        Ok(Ok(name)) => {
            let name = name.trim_end_matches('.').to_string();
            (!name.is_empty() && name.parse::<IpAddr>().is_err()).then_some(name)
        }
        Ok(Err(e)) => {
            log::debug!("RDNS_FAILED ip={} error={}", ip, e);
            None
        }
        Err(e) => {
            log::debug!("RDNS_ABANDONED ip={} error={:?}", ip, e);
            None
        }
    }
}

/// Parse a Linux `/proc/net/arp` style table into ip -> MAC.
///
/// Unreadable tables yield an empty map; MACs are best effort.
pub fn read_arp_table(path: &str) -> HashMap<IpAddr, String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_arp_table(&content),
        Err(e) => {
            log::debug!("ARP_TABLE_UNAVAILABLE path={} error={}", path, e);
            HashMap::new()
        }
    }
}

fn parse_arp_table(content: &str) -> HashMap<IpAddr, String> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let ip: IpAddr = fields.next()?.parse().ok()?;
            let mac = fields.nth(2)?;
            (mac != INCOMPLETE_MAC).then(|| (ip, mac.to_ascii_lowercase()))
        })
        .collect()
}

/// This host's outbound IPv4 address, found by routing a UDP socket.
///
/// No packet is sent; `connect` on UDP only selects a source address.
pub fn local_ipv4() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
