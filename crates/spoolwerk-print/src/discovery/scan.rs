// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Network discovery: sweep a subnet for printers and register the new ones.
//
// A host counts as a printer when its raw port answers, or when its IPP or
// LPD port answers and its system description reads as a printer.  Hosts
// whose address or hardware identity is already registered are reported
// as known and left alone.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use spoolwerk_core::config::DiscoveryConfig;
use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{Device, MacAddress, NewDevice, TransportKind};

use super::probe::{Subnet, sweep};
use super::snmp::{SnmpDescriber, is_printer_description, model_from_description};
use super::{DescriptionSource, IdentityResolver, NeighborCache};
use crate::diagnostics::{PortState, probe_port};
use crate::store::{DeviceRepository, blocking};

/// Shortest prefix a sweep accepts.
pub const MIN_SWEEP_PREFIX: u8 = 16;

/// Ports checked on every host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintPorts {
    pub raw: u16,
    pub ipp: u16,
    pub lpd: u16,
}

impl Default for PrintPorts {
    fn default() -> Self {
        Self {
            raw: 9100,
            ipp: 631,
            lpd: 515,
        }
    }
}

/// A printer seen on the network.
#[derive(Debug, Clone)]
struct Sighting {
    ip: IpAddr,
    port: u16,
    transport: TransportKind,
    mac: Option<MacAddress>,
    description: Option<String>,
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub subnet: String,
    pub scanned: u64,
    /// Newly registered devices, each with its dedicated port assigned.
    pub registered: Vec<Device>,
    /// Printers that were already registered.
    pub known: Vec<IpAddr>,
}

/// Sweeps subnets and registers the printers it finds.
pub struct NetworkScan {
    devices: Arc<dyn DeviceRepository>,
    identity: Arc<dyn IdentityResolver>,
    descriptions: Arc<dyn DescriptionSource>,
    config: DiscoveryConfig,
    ports: PrintPorts,
    base_port: u16,
}

impl NetworkScan {
    /// A scanner over SNMP and the live neighbor cache. New devices get
    /// dedicated ports counted from `base_port`.
    pub fn new(devices: Arc<dyn DeviceRepository>, config: DiscoveryConfig, base_port: u16) -> Self {
        let descriptions = SnmpDescriber {
            community: config.snmp_community.clone(),
            timeout: config.snmp_timeout(),
        };
        Self {
            devices,
            identity: Arc::new(NeighborCache),
            descriptions: Arc::new(descriptions),
            config,
            ports: PrintPorts::default(),
            base_port,
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

    pub fn with_ports(mut self, ports: PrintPorts) -> Self {
        self.ports = ports;
        self
    }

    /// Sweep `subnet` and register every printer not already known.
    #[instrument(skip_all, fields(subnet = %subnet))]
    pub async fn discover(&self, subnet: &Subnet) -> Result<DiscoveryReport> {
        if subnet.prefix() < MIN_SWEEP_PREFIX {
            return Err(SpoolwerkError::Config(format!(
                "{subnet} is too large to sweep, use /{MIN_SWEEP_PREFIX} or longer"
            )));
        }
        let candidates: Vec<IpAddr> = subnet.hosts().map(IpAddr::V4).collect();
        let identity = Arc::clone(&self.identity);
        let descriptions = Arc::clone(&self.descriptions);
        let (ports, timeout) = (self.ports, self.config.probe_timeout());
        let sightings = sweep(candidates, self.config.probe_concurrency, move |ip| {
            let identity = Arc::clone(&identity);
            let descriptions = Arc::clone(&descriptions);
            async move {
                inspect_host(ip, ports, timeout, identity.as_ref(), descriptions.as_ref()).await
            }
        })
        .await;

        let mut report = DiscoveryReport {
            subnet: subnet.to_string(),
            scanned: subnet.host_count(),
            ..DiscoveryReport::default()
        };
        for sighting in sightings {
            let ip = sighting.ip;
            match self.register(sighting).await? {
                Some(device) => report.registered.push(device),
                None => report.known.push(ip),
            }
        }
        info!(
            registered = report.registered.len(),
            known = report.known.len(),
            "discovery finished"
        );
        Ok(report)
    }

    /// Register a sighting unless its address or hardware is taken.
    async fn register(&self, sighting: Sighting) -> Result<Option<Device>> {
        let devices = Arc::clone(&self.devices);
        let base_port = self.base_port;
        blocking(move || {
            let all = devices.list_devices()?;
            if let Some(existing) = all
                .iter()
                .find(|d| d.ip == sighting.ip || (sighting.mac.is_some() && d.mac == sighting.mac))
            {
                debug!(ip = %sighting.ip, device = %existing.alias, "printer already registered");
                return Ok(None);
            }

            let model = sighting.description.as_deref().and_then(model_from_description);
            let alias = alias_for(sighting.ip, model.as_deref(), &all);
            let new = NewDevice {
                alias,
                ip: sighting.ip,
                port: Some(sighting.port),
                transport: sighting.transport,
                mac: sighting.mac,
                model,
                location: None,
                shared: false,
            };
            let created = match devices.create_device(&new) {
                Ok(created) => created,
                Err(SpoolwerkError::DuplicateAlias(alias)) => {
                    warn!(ip = %sighting.ip, alias = %alias, "no free alias, printer not registered");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            let ipp_port = devices.assign_ipp_port(created.id, base_port)?;
            info!(
                device = %created.alias,
                ip = %created.ip,
                transport = %created.transport,
                ipp_port,
                "discovered printer registered"
            );
            devices
                .device(created.id)?
                .ok_or_else(|| SpoolwerkError::DeviceNotFound(created.id.to_string()))
                .map(Some)
        })
        .await
    }
}

/// Check the print ports on one host and decide whether it is a printer.
async fn inspect_host(
    ip: IpAddr,
    ports: PrintPorts,
    timeout: Duration,
    identity: &dyn IdentityResolver,
    descriptions: &dyn DescriptionSource,
) -> Option<Sighting> {
    let open =
        move |port: u16| async move { probe_port(SocketAddr::new(ip, port), timeout).await == PortState::Open };
    let (raw, ipp, lpd) = tokio::join!(open(ports.raw), open(ports.ipp), open(ports.lpd));
    if !(raw || ipp || lpd) {
        return None;
    }

    let description = descriptions.describe(ip).await;
    let confirmed = description.as_deref().is_some_and(is_printer_description);
    let (transport, port) = if ipp && confirmed {
        (TransportKind::Ipp, ports.ipp)
    } else if raw {
        (TransportKind::Raw, ports.raw)
    } else if lpd && confirmed {
        (TransportKind::Lpd, ports.lpd)
    } else {
        debug!(ip = %ip, ?description, "print port open but not a printer");
        return None;
    };
    Some(Sighting {
        ip,
        port,
        transport,
        mac: identity.mac_for(ip).await,
        description,
    })
}

/// The model name when free, else the model qualified by address, else a
/// name derived from the address alone.
fn alias_for(ip: IpAddr, model: Option<&str>, existing: &[Device]) -> String {
    let taken = |alias: &str| existing.iter().any(|d| d.alias.eq_ignore_ascii_case(alias));
    match model {
        Some(model) if !taken(model) => model.to_string(),
        Some(model) => format!("{model} {ip}"),
        None => format!("printer-{}", ip.to_string().replace(['.', ':'], "-")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct FakeIdentity(HashMap<IpAddr, MacAddress>);

    #[async_trait]
    impl IdentityResolver for FakeIdentity {
        async fn mac_for(&self, ip: IpAddr) -> Option<MacAddress> {
            self.0.get(&ip).copied()
        }

        async fn ip_for(&self, _mac: &MacAddress) -> Option<IpAddr> {
            None
        }
    }

    #[derive(Default)]
    struct FakeDescriptions(HashMap<IpAddr, String>);

    #[async_trait]
    impl DescriptionSource for FakeDescriptions {
        async fn describe(&self, ip: IpAddr) -> Option<String> {
            self.0.get(&ip).cloned()
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 11, last))
    }

    async fn listen(at: IpAddr, port: u16) -> TcpListener {
        TcpListener::bind(SocketAddr::new(at, port)).await.expect("bind")
    }

    fn port_of(listener: &TcpListener) -> u16 {
        listener.local_addr().expect("addr").port()
    }

    fn scanner(store: Arc<SqliteStore>, ports: PrintPorts) -> NetworkScan {
        let config = DiscoveryConfig {
            probe_timeout_ms: 300,
            ..DiscoveryConfig::default()
        };
        let identity = FakeIdentity(HashMap::from([(
            ip(2),
            MacAddress::new([0x00, 0x1B, 0xA9, 0x01, 0x02, 0x03]),
        )]));
        let descriptions = FakeDescriptions(HashMap::from([
            (ip(3), "HP LaserJet M404dn,JETDIRECT".to_string()),
            (ip(4), "EPSON WF-2850 network".to_string()),
            (ip(5), "Linux cups-host 6.1.0 x86_64".to_string()),
        ]));
        NetworkScan::new(store, config, 18_000)
            .with_identity(Arc::new(identity))
            .with_descriptions(Arc::new(descriptions))
            .with_ports(ports)
    }

    #[tokio::test]
    async fn sweep_registers_new_printers_with_dedicated_ports() {
        // .2 raw only, .3 IPP, .4 LPD, .5 a CUPS host, .6 already registered.
        let raw = listen(ip(2), 0).await;
        let ipp = listen(ip(3), 0).await;
        let lpd = listen(ip(4), 0).await;
        let ports = PrintPorts {
            raw: port_of(&raw),
            ipp: port_of(&ipp),
            lpd: port_of(&lpd),
        };
        let _cups = listen(ip(5), ports.ipp).await;
        let _known = listen(ip(6), ports.raw).await;

        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        store
            .create_device(&NewDevice::raw("Front Desk", ip(6), ports.raw))
            .expect("known");

        let subnet: Subnet = "127.0.11.0/29".parse().expect("subnet");
        let report = scanner(Arc::clone(&store), ports)
            .discover(&subnet)
            .await
            .expect("discover");

        assert_eq!(report.scanned, 6);
        assert_eq!(report.known, vec![ip(6)]);
        let found: Vec<(IpAddr, TransportKind, u16, &str)> = report
            .registered
            .iter()
            .map(|d| (d.ip, d.transport, d.port.unwrap_or(0), d.alias.as_str()))
            .collect();
        assert_eq!(
            found,
            vec![
                (ip(2), TransportKind::Raw, ports.raw, "printer-127-0-11-2"),
                (ip(3), TransportKind::Ipp, ports.ipp, "HP LaserJet"),
                (ip(4), TransportKind::Lpd, ports.lpd, "EPSON WF-2850"),
            ]
        );
        let ipp_ports: Vec<Option<u16>> = report.registered.iter().map(|d| d.ipp_port).collect();
        assert_eq!(ipp_ports, vec![Some(18_000), Some(18_001), Some(18_002)]);
        assert!(report.registered[0].mac.is_some());
        assert_eq!(report.registered[1].model.as_deref(), Some("HP LaserJet"));
        assert_eq!(store.list_devices().expect("list").len(), 4);

        // A second pass finds nothing new.
        let again = scanner(Arc::clone(&store), ports)
            .discover(&subnet)
            .await
            .expect("discover again");
        assert!(again.registered.is_empty());
        assert_eq!(again.known, vec![ip(2), ip(3), ip(4), ip(6)]);
    }

    #[tokio::test]
    async fn moved_hardware_is_not_registered_twice() {
        let raw = listen(IpAddr::V4(Ipv4Addr::new(127, 0, 12, 2)), 0).await;
        // One open port stands in for all three, so nothing else on the
        // host matters.
        let ports = PrintPorts {
            raw: port_of(&raw),
            ipp: port_of(&raw),
            lpd: port_of(&raw),
        };
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let mut known = NewDevice::raw("Lab", IpAddr::V4(Ipv4Addr::new(127, 0, 12, 5)), ports.raw);
        known.mac = Some(MacAddress::new([0x00, 0x1B, 0xA9, 0x01, 0x02, 0x03]));
        store.create_device(&known).expect("known");

        let identity = FakeIdentity(HashMap::from([(
            IpAddr::V4(Ipv4Addr::new(127, 0, 12, 2)),
            MacAddress::new([0x00, 0x1B, 0xA9, 0x01, 0x02, 0x03]),
        )]));
        let subnet: Subnet = "127.0.12.0/29".parse().expect("subnet");
        let report = scanner(Arc::clone(&store), ports)
            .with_identity(Arc::new(identity))
            .discover(&subnet)
            .await
            .expect("discover");

        assert!(report.registered.is_empty());
        assert_eq!(report.known, vec![IpAddr::V4(Ipv4Addr::new(127, 0, 12, 2))]);
    }

    #[tokio::test]
    async fn wide_subnets_are_refused() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let subnet: Subnet = "10.0.0.0/8".parse().expect("subnet");
        let err = scanner(store, PrintPorts::default())
            .discover(&subnet)
            .await
            .unwrap_err();
        assert!(matches!(err, SpoolwerkError::Config(_)));
    }

    #[test]
    fn duplicate_model_alias_is_qualified_by_address() {
        let store = SqliteStore::open_in_memory().expect("store");
        store
            .create_device(&NewDevice::raw("hp laserjet", ip(9), 9100))
            .expect("existing");
        let existing = store.list_devices().expect("list");
        assert_eq!(alias_for(ip(3), Some("HP LaserJet"), &existing), "HP LaserJet 127.0.11.3");
        assert_eq!(alias_for(ip(3), Some("Canon iR"), &existing), "Canon iR");
    }
}
