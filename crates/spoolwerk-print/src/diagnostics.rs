// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connectivity diagnostics.
//
// Two users: the delivery path runs `preflight` before touching a printer so
// a dead address is reported as a location failure rather than a transfer
// failure, and the CLI runs `diagnose_subnet` to explain why a printer VLAN
// cannot be reached from this host.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info};

use spoolwerk_core::error::{Result, SpoolwerkError};

use crate::discovery::probe::Subnet;

/// Ports that almost every printer or host on an office network answers on.
const COMMON_PORTS: [u16; 4] = [80, 443, 445, 631];

/// Ports used to decide whether a sample host is alive.
const SAMPLE_PORTS: [u16; 3] = [80, 445, 631];

const GATEWAY_TIMEOUT: Duration = Duration::from_millis(1000);
const SAMPLE_TIMEOUT: Duration = Duration::from_millis(500);
const SAMPLE_COUNT: usize = 5;

/// What a single TCP connect attempt revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Something accepted the connection.
    Open,
    /// The host answered with a reset: it is there, the port is not.
    Closed,
    /// No answer before the timeout, or no route.
    Filtered,
}

/// Try one TCP connect and classify the outcome.
pub async fn probe_port(addr: SocketAddr, timeout: Duration) -> PortState {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => PortState::Open,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => PortState::Closed,
        Ok(Err(_)) | Err(_) => PortState::Filtered,
    }
}

/// Whether the host at `ip` answers on any common port, open or refused.
pub async fn host_reachable(ip: IpAddr, timeout: Duration) -> bool {
    let mut probes = JoinSet::new();
    for port in COMMON_PORTS {
        probes.spawn(probe_port(SocketAddr::new(ip, port), timeout));
    }
    while let Some(outcome) = probes.join_next().await {
        if matches!(outcome, Ok(PortState::Open | PortState::Closed)) {
            probes.abort_all();
            return true;
        }
    }
    false
}

/// Check that `addr` accepts connections before a delivery attempt.
///
/// An open port passes.  A host that answers elsewhere but not on the
/// delivery port yields `PortClosed`; a host that answers nowhere yields
/// `HostUnreachable`.  Each check carries its own `timeout`.
pub async fn preflight(addr: SocketAddr, timeout: Duration) -> Result<()> {
    match probe_port(addr, timeout).await {
        PortState::Open => {
            debug!(addr = %addr, "preflight passed");
            Ok(())
        }
        PortState::Closed => Err(SpoolwerkError::PortClosed(format!(
            "{addr} refused the connection"
        ))),
        PortState::Filtered => {
            if host_reachable(addr.ip(), timeout).await {
                Err(SpoolwerkError::PortClosed(format!(
                    "{} is up but port {} does not answer",
                    addr.ip(),
                    addr.port()
                )))
            } else {
                Err(SpoolwerkError::HostUnreachable(format!(
                    "{} did not answer within {}ms",
                    addr.ip(),
                    timeout.as_millis()
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subnet diagnosis
// ---------------------------------------------------------------------------

/// Result of diagnosing connectivity towards one subnet.
#[derive(Debug, Clone)]
pub struct SubnetReport {
    pub subnet: Subnet,
    /// Address this host uses for outbound traffic, if any.
    pub local_ip: Option<IpAddr>,
    pub same_network: bool,
    /// First host of the target subnet, assumed to be its gateway.
    pub target_gateway: Ipv4Addr,
    pub gateway_reachable: bool,
    /// The gateway answers on 80 or 443.
    pub has_route: bool,
    pub tested_hosts: usize,
    pub reachable_hosts: usize,
    pub recommendations: Vec<String>,
    pub duration: Duration,
}

/// Probe the gateway and a spread of sample hosts in `subnet`.
pub async fn diagnose_subnet(subnet: &Subnet) -> SubnetReport {
    let started = Instant::now();
    info!(subnet = %subnet, "starting subnet diagnosis");

    let local_ip = local_ip();
    let same_network = matches!(local_ip, Some(IpAddr::V4(v4)) if subnet.contains(v4));

    let target_gateway = subnet.first_host();
    let gateway = IpAddr::V4(target_gateway);
    let gateway_reachable =
        probe_port(SocketAddr::new(gateway, 80), GATEWAY_TIMEOUT).await == PortState::Open;
    let has_route = gateway_reachable
        || probe_port(SocketAddr::new(gateway, 443), GATEWAY_TIMEOUT).await == PortState::Open;

    let samples = subnet.sample_hosts(SAMPLE_COUNT);
    let mut probes = JoinSet::new();
    for host in samples.iter().copied() {
        probes.spawn(async move {
            for port in SAMPLE_PORTS {
                let addr = SocketAddr::new(IpAddr::V4(host), port);
                if probe_port(addr, SAMPLE_TIMEOUT).await == PortState::Open {
                    return true;
                }
            }
            false
        });
    }
    let mut reachable_hosts = 0;
    while let Some(outcome) = probes.join_next().await {
        if matches!(outcome, Ok(true)) {
            reachable_hosts += 1;
        }
    }

    let mut report = SubnetReport {
        subnet: *subnet,
        local_ip,
        same_network,
        target_gateway,
        gateway_reachable,
        has_route,
        tested_hosts: samples.len(),
        reachable_hosts,
        recommendations: Vec::new(),
        duration: Duration::ZERO,
    };
    report.recommendations = recommendations(&report);
    report.duration = started.elapsed();

    info!(
        subnet = %subnet,
        reachable = reachable_hosts,
        tested = report.tested_hosts,
        elapsed_ms = report.duration.as_millis() as u64,
        "subnet diagnosis complete"
    );
    report
}

/// The address the OS would use to reach the internet.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn local_ip() -> Option<IpAddr> {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:53")?;
            s.local_addr()
        })
        .ok()
        .map(|addr| addr.ip())
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
}

/// Advice derived from a finished report.
pub fn recommendations(report: &SubnetReport) -> Vec<String> {
    let mut out = Vec::new();

    if report.same_network {
        out.push("This host is on the same network; scanning should work directly.".into());
        return out;
    }

    out.push("The target is on a different network (possibly another VLAN).".into());

    if report.gateway_reachable {
        out.push("The target gateway is reachable.".into());
    } else {
        out.push(format!(
            "Gateway {} does not answer. Check inter-VLAN routing on the router or switch \
             (`ip route show` on Linux, `route print` on Windows).",
            report.target_gateway
        ));
    }

    if !report.has_route {
        out.push(format!(
            "No route to {}. Add a static route on this host or enable routing between the networks.",
            report.subnet
        ));
    }

    if report.reachable_hosts == 0 {
        out.push(
            "No live hosts detected. A firewall may be blocking traffic between the networks, \
             or the hosts are powered down."
                .into(),
        );
        out.push(
            "Allow SNMP (UDP 161), IPP (TCP 631) and SMB (TCP 445) through the firewall, \
             and enable SNMP with community 'public' on the printers."
                .into(),
        );
    } else {
        out.push(format!(
            "{} of {} sampled hosts answered; scanning should work for them.",
            report.reachable_hosts, report.tested_hosts
        ));
    }

    out
}

impl fmt::Display for SubnetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Network:          {}", self.subnet)?;
        match self.local_ip {
            Some(ip) => writeln!(f, "Local address:    {ip}")?,
            None => writeln!(f, "Local address:    unknown")?,
        }
        writeln!(f, "Same network:     {}", yes_no(self.same_network))?;
        writeln!(
            f,
            "Gateway:          {} ({})",
            self.target_gateway,
            if self.gateway_reachable { "reachable" } else { "no answer" }
        )?;
        writeln!(f, "Route:            {}", yes_no(self.has_route))?;
        writeln!(
            f,
            "Live hosts:       {}/{}",
            self.reachable_hosts, self.tested_hosts
        )?;
        writeln!(f, "Took:             {}ms", self.duration.as_millis())?;
        writeln!(f)?;
        for line in &self.recommendations {
            writeln!(f, "  - {line}")?;
        }
        Ok(())
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        addr
    }

    fn sample_report(same_network: bool, reachable_hosts: usize) -> SubnetReport {
        SubnetReport {
            subnet: "10.20.0.0/24".parse().expect("subnet"),
            local_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))),
            same_network,
            target_gateway: Ipv4Addr::new(10, 20, 0, 1),
            gateway_reachable: false,
            has_route: false,
            tested_hosts: 5,
            reachable_hosts,
            recommendations: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn listening_port_is_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        assert_eq!(probe_port(addr, Duration::from_secs(1)).await, PortState::Open);
        preflight(addr, Duration::from_secs(1)).await.expect("preflight");
    }

    #[tokio::test]
    async fn refused_port_is_closed() {
        let addr = closed_port().await;
        assert_eq!(probe_port(addr, Duration::from_secs(1)).await, PortState::Closed);

        let err = preflight(addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SpoolwerkError::PortClosed(_)), "got {err:?}");
    }

    #[test]
    fn same_network_needs_no_further_advice() {
        let advice = recommendations(&sample_report(true, 0));
        assert_eq!(advice.len(), 1);
        assert!(advice[0].contains("same network"));
    }

    #[test]
    fn unreachable_network_suggests_routing_and_firewall() {
        let advice = recommendations(&sample_report(false, 0)).join("\n");
        assert!(advice.contains("10.20.0.1"));
        assert!(advice.contains("static route"));
        assert!(advice.contains("UDP 161"));
    }

    #[test]
    fn live_hosts_are_counted_in_advice() {
        let advice = recommendations(&sample_report(false, 3)).join("\n");
        assert!(advice.contains("3 of 5 sampled hosts answered"));
    }

    #[tokio::test]
    async fn diagnose_loopback_samples_five_hosts() {
        let subnet: Subnet = "127.0.0.0/29".parse().expect("subnet");
        let report = diagnose_subnet(&subnet).await;
        assert_eq!(report.tested_hosts, 5);
        assert_eq!(report.target_gateway, Ipv4Addr::new(127, 0, 0, 1));
        assert!(!report.recommendations.is_empty());
        assert!(report.to_string().contains("127.0.0.0/29"));
    }
}
