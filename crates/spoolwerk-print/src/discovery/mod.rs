// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Identity & discovery: find where a known printer lives now, and find
// printers nobody has registered yet.

pub mod arp;
pub mod probe;
pub mod rediscover;
pub mod scan;
pub mod snmp;

use std::net::IpAddr;

use async_trait::async_trait;

use spoolwerk_core::types::MacAddress;

pub use arp::NeighborCache;
pub use probe::Subnet;
pub use rediscover::{Rediscovery, Relocation, Strategy, SystemResolver};
pub use scan::{DiscoveryReport, NetworkScan, PrintPorts};
pub use snmp::SnmpDescriber;

/// Maps between network addresses and hardware identities.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Hardware address currently answering at `ip`.
    async fn mac_for(&self, ip: IpAddr) -> Option<MacAddress>;
    /// Address currently associated with `mac`, if the mapping is cached.
    async fn ip_for(&self, mac: &MacAddress) -> Option<IpAddr>;
}

/// Reads a host's self-reported system description.
#[async_trait]
pub trait DescriptionSource: Send + Sync {
    async fn describe(&self, ip: IpAddr) -> Option<String>;
}

/// Name-to-address resolution.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Vec<IpAddr>;
}
