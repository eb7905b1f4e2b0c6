// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Neighbor (ARP) table access.
//
// Linux exposes the table at /proc/net/arp.  Elsewhere the `arp` tool is
// asked instead and its output scanned line by line for an address and a
// hardware address.  Entries only exist for hosts on the local segment that
// talked to us recently, which is why callers touch a host before asking.

use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{debug, warn};

use spoolwerk_core::types::{IdentitySource, MacAddress, NetworkIdentity};

use super::IdentityResolver;

const PROC_ARP: &str = "/proc/net/arp";

/// ATF_COM: the entry is complete.
const FLAG_COMPLETE: u32 = 0x2;

/// Parse the kernel's `/proc/net/arp` table.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.1.40     0x1         0x2         3c:2a:f4:11:22:33     *        eth0
/// ```
pub fn parse_proc_arp(text: &str) -> Vec<NetworkIdentity> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 {
                return None;
            }
            let flags = u32::from_str_radix(cols[2].trim_start_matches("0x"), 16).ok()?;
            if flags & FLAG_COMPLETE == 0 {
                return None;
            }
            identity(cols[0], cols[3])
        })
        .collect()
}

/// Parse `arp -n` (Linux/BSD) or `arp -a` (Windows, macOS) output.
///
/// Any line holding both an IPv4 address and a MAC is an entry; the
/// surrounding layout varies too much between platforms to rely on columns.
pub fn parse_arp_output(text: &str) -> Vec<NetworkIdentity> {
    text.lines()
        .filter_map(|line| {
            let tokens = line
                .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
                .filter(|t| !t.is_empty());
            let mut ip = None;
            let mut mac = None;
            for token in tokens {
                if ip.is_none() && token.parse::<std::net::Ipv4Addr>().is_ok() {
                    ip = Some(token);
                } else if mac.is_none() && MacAddress::is_valid(token) {
                    mac = Some(token);
                }
            }
            identity(ip?, mac?)
        })
        .collect()
}

fn identity(ip: &str, mac: &str) -> Option<NetworkIdentity> {
    let ip: IpAddr = ip.parse().ok()?;
    let mac: MacAddress = mac.parse().ok()?;
    if mac.is_unspecified() {
        return None;
    }
    Some(NetworkIdentity {
        mac,
        ip,
        source: IdentitySource::NeighborCache,
    })
}

/// Read the current neighbor table.
///
/// Returns an empty table when neither source is available.
pub async fn read_neighbor_table() -> Vec<NetworkIdentity> {
    match tokio::fs::read_to_string(PROC_ARP).await {
        Ok(text) => return parse_proc_arp(&text),
        Err(e) => debug!(error = %e, "no /proc/net/arp, falling back to the arp tool"),
    }

    for flag in ["-n", "-a"] {
        match tokio::process::Command::new("arp").arg(flag).output().await {
            Ok(output) if output.status.success() => {
                return parse_arp_output(&String::from_utf8_lossy(&output.stdout));
            }
            Ok(output) => debug!(flag, status = %output.status, "arp exited unsuccessfully"),
            Err(e) => {
                warn!(error = %e, "arp tool unavailable; neighbor cache is empty");
                break;
            }
        }
    }
    Vec::new()
}

/// Hardware identities from the local neighbor table.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighborCache;

#[async_trait]
impl IdentityResolver for NeighborCache {
    async fn mac_for(&self, ip: IpAddr) -> Option<MacAddress> {
        read_neighbor_table()
            .await
            .into_iter()
            .find(|entry| entry.ip == ip)
            .map(|entry| entry.mac)
    }

    async fn ip_for(&self, mac: &MacAddress) -> Option<IpAddr> {
        read_neighbor_table()
            .await
            .into_iter()
            .find(|entry| entry.mac == *mac)
            .map(|entry| entry.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PROC_SAMPLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.40     0x1         0x2         3c:2a:f4:11:22:33     *        eth0
192.168.1.41     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.1      0x1         0x2         a0-b1-c2-d3-e4-f5     *        eth0
";

    #[test]
    fn proc_table_skips_incomplete_entries() {
        let table = parse_proc_arp(PROC_SAMPLE);
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40)));
        assert_eq!(table[0].mac.to_string(), "3C:2A:F4:11:22:33");
        assert_eq!(table[1].mac.to_string(), "A0:B1:C2:D3:E4:F5");
    }

    #[test]
    fn bsd_arp_output() {
        let out = "printer.lan (10.0.0.7) at 3c:2a:f4:11:22:33 on en0 ifscope [ethernet]\n\
                   ? (10.0.0.8) at (incomplete) on en0 ifscope [ethernet]\n";
        let table = parse_arp_output(out);
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[test]
    fn windows_arp_output() {
        let out = "Interface: 10.0.0.2 --- 0x4\n\
                   \x20 Internet Address      Physical Address      Type\n\
                   \x20 10.0.0.9              3c-2a-f4-11-22-33     dynamic\n";
        let table = parse_arp_output(out);
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(table[0].mac.to_string(), "3C:2A:F4:11:22:33");
    }
}
