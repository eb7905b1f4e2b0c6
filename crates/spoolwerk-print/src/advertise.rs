// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// mDNS-SD advertisement of served printers.
//
// Each device is registered as its own `_ipp._tcp.local.` instance pointing
// at whichever port serves it.  Failure to advertise never stops the server.

use std::collections::HashMap;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{info, warn};

use spoolwerk_core::types::{Device, DeviceId};

/// mDNS service type for plain IPP.
pub const IPP_SERVICE_TYPE: &str = "_ipp._tcp.local.";

/// DNS-SD instance names are limited to 63 octets.
const MAX_INSTANCE_NAME: usize = 63;

/// Document formats listed in the `pdl` TXT key.
const PDL: &str = "application/octet-stream,application/postscript,application/vnd.hp-pcl,text/plain";

pub struct Advertiser {
    daemon: Option<ServiceDaemon>,
    hostname: String,
    registered: HashMap<DeviceId, String>,
}

impl Advertiser {
    /// The daemon is created on first use.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            daemon: None,
            hostname: hostname.into(),
            registered: HashMap::new(),
        }
    }

    /// Host name from `$HOSTNAME`, falling back to `spoolwerk`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("HOSTNAME").unwrap_or_else(|_| "spoolwerk".into()))
    }

    /// Devices currently advertised.
    pub fn advertised(&self) -> usize {
        self.registered.len()
    }

    /// Register `device` as reachable on `port` under `resource_path`.
    ///
    /// Re-publishing a device replaces its previous record.
    pub fn publish(&mut self, device: &Device, port: u16, resource_path: &str) {
        self.withdraw(device.id);

        let name = instance_name(&device.alias);
        let properties = txt_properties(device, resource_path);
        let service = match ServiceInfo::new(
            IPP_SERVICE_TYPE,
            &name,
            &format!("{}.local.", self.hostname),
            "",
            port,
            properties,
        ) {
            Ok(service) => service.enable_addr_auto(),
            Err(e) => {
                warn!(device = %device.alias, error = %e, "failed to build mDNS record");
                return;
            }
        };

        let fullname = service.get_fullname().to_owned();
        let Some(daemon) = self.daemon() else {
            return;
        };
        let registered = daemon.register(service);
        match registered {
            Ok(()) => {
                info!(name = %name, port, rp = resource_path, "mDNS service registered");
                self.registered.insert(device.id, fullname);
            }
            Err(e) => warn!(device = %device.alias, error = %e, "mDNS registration failed"),
        }
    }

    /// Remove a device's record, if advertised.
    pub fn withdraw(&mut self, id: DeviceId) {
        let Some(fullname) = self.registered.remove(&id) else {
            return;
        };
        if let Some(daemon) = &self.daemon {
            match daemon.unregister(&fullname) {
                Ok(_) => info!(name = %fullname, "mDNS service unregistered"),
                Err(e) => warn!(name = %fullname, error = %e, "failed to unregister mDNS service"),
            }
        }
    }

    /// Withdraw everything and stop the daemon.
    pub fn shutdown(&mut self) {
        let ids: Vec<DeviceId> = self.registered.keys().copied().collect();
        for id in ids {
            self.withdraw(id);
        }
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.shutdown() {
                warn!(error = %e, "failed to shut down mDNS daemon");
            }
        }
    }

    fn daemon(&mut self) -> Option<&ServiceDaemon> {
        if self.daemon.is_none() {
            match ServiceDaemon::new() {
                Ok(daemon) => self.daemon = Some(daemon),
                Err(e) => {
                    warn!(error = %e, "failed to create mDNS daemon for advertisement");
                    return None;
                }
            }
        }
        self.daemon.as_ref()
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Alias trimmed to the instance-name limit on a character boundary.
pub fn instance_name(alias: &str) -> String {
    let mut end = alias.len().min(MAX_INSTANCE_NAME);
    while !alias.is_char_boundary(end) {
        end -= 1;
    }
    alias[..end].trim_end().to_string()
}

/// TXT record for one device.
pub fn txt_properties(device: &Device, resource_path: &str) -> HashMap<String, String> {
    let mut props = HashMap::from([
        ("txtvers".to_string(), "1".to_string()),
        ("qtotal".to_string(), "1".to_string()),
        ("rp".to_string(), resource_path.trim_start_matches('/').to_string()),
        ("pdl".to_string(), PDL.to_string()),
        (
            "ty".to_string(),
            device.model.clone().unwrap_or_else(|| device.alias.clone()),
        ),
    ]);
    if let Some(location) = &device.location {
        props.insert("note".to_string(), location.clone());
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoolwerk_core::types::{DeviceId, TransportKind};
    use std::net::{IpAddr, Ipv4Addr};

    fn device(alias: &str) -> Device {
        Device {
            id: DeviceId(3),
            alias: alias.to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40)),
            port: Some(9100),
            transport: TransportKind::Raw,
            mac: None,
            model: None,
            location: None,
            shared: false,
            ipp_port: Some(8631),
            device_uri: None,
        }
    }

    #[test]
    fn txt_record_names_resource_and_model() {
        let mut lab = device("Lab");
        lab.model = Some("Epson WF-2850".into());
        lab.location = Some("Room 3".into());
        let props = txt_properties(&lab, "/ipp/print");
        assert_eq!(props["rp"], "ipp/print");
        assert_eq!(props["ty"], "Epson WF-2850");
        assert_eq!(props["note"], "Room 3");
    }

    #[test]
    fn txt_record_falls_back_to_alias() {
        let props = txt_properties(&device("Office"), "printers/Office");
        assert_eq!(props["ty"], "Office");
        assert!(!props.contains_key("note"));
    }

    #[test]
    fn long_aliases_are_cut_on_char_boundary() {
        let alias = "x".repeat(62) + "ü";
        let name = instance_name(&alias);
        assert_eq!(name.len(), 62);
        assert!(alias.starts_with(&name));
        assert_eq!(instance_name("Lab"), "Lab");
    }

    #[test]
    fn withdraw_unknown_device_is_noop() {
        let mut advertiser = Advertiser::new("testhost");
        advertiser.withdraw(DeviceId(9));
        assert_eq!(advertiser.advertised(), 0);
    }
}
