// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Rediscovery: re-locate a printer whose recorded address stopped answering.
//
// Strategies run in order and the first hit wins:
//
//   1. neighbor cache lookup of the recorded MAC, confirmed by an open port
//   2. parallel subnet probe accepting only an exact MAC match
//   3. name resolution of the alias, confirmed by an open port
//   4. SNMP sysDescr sharing a vendor/model token with the device
//   5. first open port in the subnet, only for devices with no MAC at all
//
// Strategies 3-5 cannot prove identity.  They never accept a candidate whose
// observed MAC differs from the recorded one, and they skip addresses that
// already belong to another device.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use spoolwerk_core::config::{DiscoveryConfig, TransportConfig};
use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{Device, MacAddress};

use super::probe::{ProbeOptions, Subnet, Verdict, probe_candidates};
use super::snmp::{SnmpDescriber, matches_model};
use super::{DescriptionSource, HostResolver, IdentityResolver, NeighborCache};
use crate::diagnostics::{PortState, probe_port};
use crate::store::{DeviceRepository, blocking};
use crate::transport::resolve_route;

/// Which strategy found the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    NeighborCache,
    SubnetProbe,
    HostName,
    Description,
    PortOnly,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeighborCache => "neighbor-cache",
            Self::SubnetProbe => "subnet-probe",
            Self::HostName => "host-name",
            Self::Description => "description",
            Self::PortOnly => "port-only",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful rediscovery.
#[derive(Debug, Clone, Serialize)]
pub struct Relocation {
    /// The device as persisted after the update.
    pub device: Device,
    pub previous_ip: IpAddr,
    pub strategy: Strategy,
    /// The new address was tied to the recorded hardware identity.
    pub verified: bool,
}

/// System DNS / hosts-file resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, name: &str) -> Vec<IpAddr> {
        match tokio::net::lookup_host((name, 0)).await {
            Ok(addrs) => addrs.map(|addr| addr.ip()).collect(),
            Err(e) => {
                debug!(name, error = %e, "name did not resolve");
                Vec::new()
            }
        }
    }
}

/// Runs the rediscovery strategies against one device at a time.
pub struct Rediscovery {
    devices: Arc<dyn DeviceRepository>,
    identity: Arc<dyn IdentityResolver>,
    descriptions: Arc<dyn DescriptionSource>,
    resolver: Arc<dyn HostResolver>,
    config: DiscoveryConfig,
    transport: TransportConfig,
}

impl Rediscovery {
    /// Rediscovery over the live neighbor cache, SNMP and system DNS.
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        config: DiscoveryConfig,
        transport: TransportConfig,
    ) -> Self {
        let descriptions = SnmpDescriber {
            community: config.snmp_community.clone(),
            timeout: config.snmp_timeout(),
        };
        Self {
            devices,
            identity: Arc::new(NeighborCache),
            descriptions: Arc::new(descriptions),
            resolver: Arc::new(SystemResolver),
            config,
            transport,
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_descriptions(mut self, descriptions: Arc<dyn DescriptionSource>) -> Self {
        self.descriptions = descriptions;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Find `device`'s current address and persist it.
    ///
    /// Fails with `IdentityNotFound` when every strategy comes up empty; the
    /// device record is left untouched in that case.
    #[instrument(skip_all, fields(device = %device.alias, ip = %device.ip))]
    pub async fn locate(&self, device: &Device) -> Result<Relocation> {
        let port = resolve_route(device, &self.transport).addr().port();
        info!(port, mac = ?device.mac.map(|m| m.to_string()), "starting rediscovery");

        match self.find(device, port).await? {
            Some((ip, strategy, verified)) => self.relocate(device, ip, strategy, verified).await,
            None => {
                warn!("rediscovery exhausted every strategy");
                Err(SpoolwerkError::IdentityNotFound(device.alias.clone()))
            }
        }
    }

    async fn find(&self, device: &Device, port: u16) -> Result<Option<(IpAddr, Strategy, bool)>> {
        if let Some(mac) = device.mac {
            if let Some(ip) = self.from_neighbor_cache(device, mac, port).await {
                return Ok(Some((ip, Strategy::NeighborCache, true)));
            }
            if let Some(ip) = self.probe_for_mac(device, mac, port).await {
                return Ok(Some((ip, Strategy::SubnetProbe, true)));
            }
        }

        let taken = self.addresses_of_others(device).await?;

        if let Some((ip, verified)) = self.from_host_name(device, port, &taken).await {
            return Ok(Some((ip, Strategy::HostName, verified)));
        }
        if let Some((ip, verified)) = self.from_description(device, port, &taken).await {
            return Ok(Some((ip, Strategy::Description, verified)));
        }
        if device.mac.is_none() && self.config.allow_unverified_fallback {
            if let Some(ip) = self.first_open_port(device, port, &taken).await {
                return Ok(Some((ip, Strategy::PortOnly, false)));
            }
        }
        Ok(None)
    }

    // -- Strategies ---------------------------------------------------------

    async fn from_neighbor_cache(&self, device: &Device, mac: MacAddress, port: u16) -> Option<IpAddr> {
        let ip = self.identity.ip_for(&mac).await?;
        if ip == device.ip {
            debug!(ip = %ip, "neighbor cache still points at the dead address");
            return None;
        }
        let state = probe_port(SocketAddr::new(ip, port), self.config.probe_timeout()).await;
        debug!(ip = %ip, ?state, "neighbor cache candidate");
        (state == PortState::Open).then_some(ip)
    }

    async fn probe_for_mac(&self, device: &Device, mac: MacAddress, port: u16) -> Option<IpAddr> {
        let candidates = self.candidates(device, &HashSet::new());
        let identity = Arc::clone(&self.identity);
        probe_candidates(candidates, self.probe_options(port), move |ip| {
            let identity = Arc::clone(&identity);
            async move {
                match identity.mac_for(ip).await {
                    Some(found) if found == mac => Verdict::IdentityMatch,
                    Some(found) => {
                        debug!(ip = %ip, found = %found, "open port but different hardware");
                        Verdict::Reject
                    }
                    None => Verdict::Reject,
                }
            }
        })
        .await
        .map(|result| result.ip)
    }

    async fn from_host_name(
        &self,
        device: &Device,
        port: u16,
        taken: &HashSet<IpAddr>,
    ) -> Option<(IpAddr, bool)> {
        if !looks_like_host_name(&device.alias) {
            return None;
        }
        for ip in self.resolver.resolve(&device.alias).await {
            if ip == device.ip || taken.contains(&ip) {
                continue;
            }
            if probe_port(SocketAddr::new(ip, port), self.config.probe_timeout()).await
                != PortState::Open
            {
                continue;
            }
            match judge_identity(self.identity.as_ref(), ip, device.mac).await {
                Verdict::Reject => continue,
                verdict => return Some((ip, verdict == Verdict::IdentityMatch)),
            }
        }
        None
    }

    async fn from_description(
        &self,
        device: &Device,
        port: u16,
        taken: &HashSet<IpAddr>,
    ) -> Option<(IpAddr, bool)> {
        let model = device.model.clone().filter(|m| !m.trim().is_empty())?;
        let candidates = self.candidates(device, taken);
        let descriptions = Arc::clone(&self.descriptions);
        let identity = Arc::clone(&self.identity);
        let expected = device.mac;
        probe_candidates(candidates, self.probe_options(port), move |ip| {
            let descriptions = Arc::clone(&descriptions);
            let identity = Arc::clone(&identity);
            let model = model.clone();
            async move {
                match descriptions.describe(ip).await {
                    Some(descr) if matches_model(&descr, &model) => {
                        judge_identity(identity.as_ref(), ip, expected).await
                    }
                    _ => Verdict::Reject,
                }
            }
        })
        .await
        .map(|result| (result.ip, result.identity_match))
    }

    async fn first_open_port(
        &self,
        device: &Device,
        port: u16,
        taken: &HashSet<IpAddr>,
    ) -> Option<IpAddr> {
        let candidates = self.candidates(device, taken);
        probe_candidates(candidates, self.probe_options(port), |_| async {
            Verdict::Unverified
        })
        .await
        .map(|result| result.ip)
    }

    // -- Helpers ------------------------------------------------------------

    /// Subnet hosts other than the dead address and `exclude`.
    fn candidates(&self, device: &Device, exclude: &HashSet<IpAddr>) -> Vec<IpAddr> {
        match Subnet::containing(device.ip, self.config.subnet_prefix) {
            Ok(subnet) => subnet
                .hosts()
                .map(IpAddr::V4)
                .filter(|ip| *ip != device.ip && !exclude.contains(ip))
                .collect(),
            Err(e) => {
                debug!(error = %e, "subnet cannot be enumerated");
                Vec::new()
            }
        }
    }

    fn probe_options(&self, port: u16) -> ProbeOptions {
        ProbeOptions {
            port,
            concurrency: self.config.probe_concurrency,
            timeout: self.config.probe_timeout(),
            abandon_grace: self.config.abandon_grace(),
        }
    }

    async fn addresses_of_others(&self, device: &Device) -> Result<HashSet<IpAddr>> {
        let repo = Arc::clone(&self.devices);
        let id = device.id;
        let all = blocking(move || repo.list_devices()).await?;
        Ok(all
            .into_iter()
            .filter(|other| other.id != id)
            .map(|other| other.ip)
            .collect())
    }

    async fn relocate(
        &self,
        device: &Device,
        ip: IpAddr,
        strategy: Strategy,
        verified: bool,
    ) -> Result<Relocation> {
        let uri = rewrite_endpoint(device, ip);
        let repo = Arc::clone(&self.devices);
        let id = device.id;
        let updated = blocking(move || {
            repo.update_address(id, ip, &uri)?;
            repo.device(id)
        })
        .await?
        .ok_or_else(|| SpoolwerkError::DeviceNotFound(id.to_string()))?;

        if verified {
            info!(from = %device.ip, to = %ip, %strategy, "device relocated");
        } else {
            warn!(
                from = %device.ip,
                to = %ip,
                %strategy,
                "device relocated without hardware verification"
            );
        }
        Ok(Relocation {
            device: updated,
            previous_ip: device.ip,
            strategy,
            verified,
        })
    }
}

/// Judge a candidate that cannot be proven by the strategy itself.
async fn judge_identity(
    identity: &dyn IdentityResolver,
    ip: IpAddr,
    expected: Option<MacAddress>,
) -> Verdict {
    let Some(expected) = expected else {
        return Verdict::Unverified;
    };
    match identity.mac_for(ip).await {
        Some(found) if found == expected => Verdict::IdentityMatch,
        Some(found) => {
            warn!(ip = %ip, expected = %expected, found = %found, "hardware mismatch, candidate refused");
            Verdict::Reject
        }
        None => Verdict::Unverified,
    }
}

/// Aliases without spaces that are not address literals may be DNS names.
fn looks_like_host_name(alias: &str) -> bool {
    !alias.is_empty()
        && alias.len() <= 253
        && alias.parse::<IpAddr>().is_err()
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

fn host_literal(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// The device's endpoint string with its host replaced by `new_ip`.
///
/// A recorded URI keeps its scheme, port and path; anything else is
/// regenerated from the transport.
pub fn rewrite_endpoint(device: &Device, new_ip: IpAddr) -> String {
    let needle = format!("://{}", host_literal(device.ip));
    if let Some(uri) = device.device_uri.as_deref() {
        if let Some(pos) = uri.find(&needle) {
            let rest = &uri[pos + needle.len()..];
            if rest.is_empty() || rest.starts_with(':') || rest.starts_with('/') {
                return format!("{}://{}{rest}", &uri[..pos], host_literal(new_ip));
            }
        }
    }
    Device::endpoint_for(device.transport, new_ip, device.port)
}
