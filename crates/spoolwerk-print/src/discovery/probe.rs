// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPv4 subnet enumeration and bounded parallel probing.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::ScanResult;

use crate::diagnostics::{PortState, probe_port};

// ---------------------------------------------------------------------------
// Subnet
// ---------------------------------------------------------------------------

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// The network of `prefix` bits containing `addr`.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(SpoolwerkError::Config(format!("prefix /{prefix} is out of range")));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix));
        Ok(Self { network, prefix })
    }

    /// The subnet around a device address. IPv6 neighborhoods are too large
    /// to enumerate.
    pub fn containing(ip: IpAddr, prefix: u8) -> Result<Self> {
        match ip {
            IpAddr::V4(v4) => Self::new(v4, prefix),
            IpAddr::V6(v6) => Err(SpoolwerkError::Config(format!(
                "cannot enumerate the IPv6 neighborhood of {v6}"
            ))),
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix) == u32::from(self.network)
    }

    /// Usable host addresses, ascending.
    ///
    /// /31 and /32 have no network or broadcast address to skip.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let net = u32::from(self.network);
        let bcast = u32::from(self.broadcast());
        let (start, end) = if self.prefix >= 31 {
            (net, bcast)
        } else {
            (net + 1, bcast - 1)
        };
        (start..=end).map(Ipv4Addr::from)
    }

    pub fn host_count(&self) -> u64 {
        let span = u64::from(u32::from(self.broadcast()) - u32::from(self.network)) + 1;
        if self.prefix >= 31 { span } else { span - 2 }
    }

    /// The first usable host, conventionally the gateway.
    pub fn first_host(&self) -> Ipv4Addr {
        self.hosts().next().unwrap_or(self.network)
    }

    /// Up to `count` hosts spread evenly across the range.
    pub fn sample_hosts(&self, count: usize) -> Vec<Ipv4Addr> {
        let total = self.host_count() as usize;
        let step = (total / count.max(1)).max(1);
        self.hosts().step_by(step).take(count).collect()
    }
}

/// Netmask for `prefix` bits as a host-order integer.
fn mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p.min(32))),
    }
}

impl FromStr for Subnet {
    type Err = SpoolwerkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| SpoolwerkError::Config(format!("'{s}' is not in CIDR form")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| SpoolwerkError::Config(format!("'{s}': {e}")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| SpoolwerkError::Config(format!("'{s}': {e}")))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

// ---------------------------------------------------------------------------
// Parallel probe
// ---------------------------------------------------------------------------

/// How a candidate with an open port was judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Its hardware identity is the one we are looking for.
    IdentityMatch,
    /// Accepted without an identity check.
    Unverified,
    Reject,
}

/// Probe tuning for one pass.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    pub port: u16,
    /// Worker ceiling.
    pub concurrency: usize,
    /// Per-candidate connect timeout.
    pub timeout: Duration,
    /// Time outstanding workers get after the first acceptance.
    pub abandon_grace: Duration,
}

/// Probe `candidates` on `opts.port`, judging open ones with `judge`.
///
/// Workers stop being started as soon as one candidate is accepted. Those
/// already running get `abandon_grace` to finish and are then aborted.
/// Among acceptances seen by then the lowest address wins.
pub async fn probe_candidates<F, Fut>(
    candidates: Vec<IpAddr>,
    opts: ProbeOptions,
    judge: F,
) -> Option<ScanResult>
where
    F: Fn(IpAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Verdict> + Send + 'static,
{
    if candidates.is_empty() {
        return None;
    }
    let total = candidates.len();
    let permits = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let judge = Arc::new(judge);
    let mut workers = JoinSet::new();

    for ip in candidates {
        let permits = Arc::clone(&permits);
        let judge = Arc::clone(&judge);
        workers.spawn(async move {
            // A closed semaphore means a match was already found.
            let _permit = permits.acquire_owned().await.ok()?;
            let open =
                probe_port(SocketAddr::new(ip, opts.port), opts.timeout).await == PortState::Open;
            let verdict = if open { judge(ip).await } else { Verdict::Reject };
            Some((
                ScanResult {
                    ip,
                    port_open: open,
                    identity_match: verdict == Verdict::IdentityMatch,
                },
                verdict != Verdict::Reject,
            ))
        });
    }

    let mut accepted: Vec<ScanResult> = Vec::new();
    let mut scanned = 0usize;
    while let Some(joined) = workers.join_next().await {
        if let Ok(Some((result, ok))) = joined {
            scanned += 1;
            if result.port_open {
                debug!(ip = %result.ip, accepted = ok, "port open on candidate");
            }
            if ok {
                accepted.push(result);
                break;
            }
        }
    }

    if !accepted.is_empty() {
        permits.close();
        let _ = tokio::time::timeout(opts.abandon_grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Ok(Some((result, true))) = joined {
                    accepted.push(result);
                }
            }
        })
        .await;
        workers.abort_all();
    }

    let winner = accepted.into_iter().min_by_key(|r| r.ip);
    info!(
        candidates = total,
        scanned,
        found = ?winner.map(|r| r.ip),
        port = opts.port,
        "probe pass finished"
    );
    winner
}

/// Run `inspect` on every candidate with at most `concurrency` in flight and
/// collect the hits, ascending by address. Unlike `probe_candidates` nothing
/// stops early.
pub async fn sweep<F, Fut, T>(candidates: Vec<IpAddr>, concurrency: usize, inspect: F) -> Vec<T>
where
    F: Fn(IpAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<T>> + Send + 'static,
    T: Send + 'static,
{
    let total = candidates.len();
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let inspect = Arc::new(inspect);
    let mut workers = JoinSet::new();
    for ip in candidates {
        let permits = Arc::clone(&permits);
        let inspect = Arc::clone(&inspect);
        workers.spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            inspect(ip).await.map(|hit| (ip, hit))
        });
    }

    let mut hits = Vec::new();
    while let Some(joined) = workers.join_next().await {
        if let Ok(Some(hit)) = joined {
            hits.push(hit);
        }
    }
    hits.sort_by_key(|(ip, _)| *ip);
    info!(candidates = total, hits = hits.len(), "sweep finished");
    hits.into_iter().map(|(_, hit)| hit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn opts(port: u16) -> ProbeOptions {
        ProbeOptions {
            port,
            concurrency: 8,
            timeout: Duration::from_millis(300),
            abandon_grace: Duration::from_millis(50),
        }
    }

    #[test]
    fn subnet_masks_the_address() {
        let subnet: Subnet = "192.168.1.77/24".parse().expect("parse");
        assert_eq!(subnet.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(subnet.to_string(), "192.168.1.0/24");
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 1, 200)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 2, 1)));
    }

    #[test]
    fn hosts_skip_network_and_broadcast() {
        let subnet: Subnet = "10.0.0.0/29".parse().expect("parse");
        let hosts: Vec<_> = subnet.hosts().collect();
        assert_eq!(hosts.len(), 6);
        assert_eq!(subnet.host_count(), 6);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(hosts[5], Ipv4Addr::new(10, 0, 0, 6));
        assert_eq!(subnet.first_host(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn point_to_point_subnets_keep_both_addresses() {
        let subnet: Subnet = "10.0.0.4/31".parse().expect("parse");
        assert_eq!(subnet.hosts().count(), 2);
        let single: Subnet = "10.0.0.4/32".parse().expect("parse");
        assert_eq!(single.hosts().collect::<Vec<_>>(), vec![Ipv4Addr::new(10, 0, 0, 4)]);
    }

    #[test]
    fn samples_spread_across_range() {
        let subnet: Subnet = "10.0.0.0/24".parse().expect("parse");
        let samples = subnet.sample_hosts(5);
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(samples[1], Ipv4Addr::new(10, 0, 0, 51));
    }

    #[test]
    fn bad_cidr_is_rejected() {
        assert!("10.0.0.0".parse::<Subnet>().is_err());
        assert!("10.0.0.0/33".parse::<Subnet>().is_err());
        assert!("ten/8".parse::<Subnet>().is_err());
        assert!(Subnet::containing("::1".parse().expect("v6"), 64).is_err());
    }

    #[tokio::test]
    async fn finds_the_matching_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let candidates: Vec<IpAddr> = (1..=8)
            .map(|last| IpAddr::V4(Ipv4Addr::new(127, 0, 0, last)))
            .collect();

        let found = probe_candidates(candidates, opts(port), |ip| async move {
            if ip == IpAddr::V4(Ipv4Addr::LOCALHOST) {
                Verdict::IdentityMatch
            } else {
                Verdict::Reject
            }
        })
        .await
        .expect("match");
        assert_eq!(found.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(found.port_open);
        assert!(found.identity_match);
    }

    #[tokio::test]
    async fn open_port_with_wrong_identity_is_not_accepted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let candidates = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];

        let found = probe_candidates(candidates, opts(port), |_| async { Verdict::Reject }).await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn sweep_visits_every_candidate() {
        let candidates: Vec<IpAddr> = (1..=20)
            .map(|last| IpAddr::V4(Ipv4Addr::new(10, 9, 0, last)))
            .rev()
            .collect();
        let odd = sweep(candidates, 4, |ip| async move {
            match ip {
                IpAddr::V4(v4) if v4.octets()[3] % 2 == 1 => Some(v4.octets()[3]),
                _ => None,
            }
        })
        .await;
        assert_eq!(odd, vec![1, 3, 5, 7, 9, 11, 13, 15, 17, 19]);
    }

    #[tokio::test]
    async fn empty_candidate_list() {
        let found = probe_candidates(Vec::new(), opts(9), |_| async { Verdict::Unverified }).await;
        assert!(found.is_none());
    }
}
