// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Delivery transport: pick the route for a device and push a payload down it.

use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use spoolwerk_core::config::TransportConfig;
use spoolwerk_core::error::Result;
use spoolwerk_core::types::{Device, Job, TransportKind};

use crate::diagnostics;
use crate::ipp_client::IppClient;
use crate::lpr_client::{self, LPR_PORT, LprJob};
use crate::raw_client::{self, RAW_PORT};

/// Standard IPP port.
pub const IPP_PORT: u16 = 631;

/// Ports that never carry print data even when recorded on a RAW device.
const NON_DATA_PORTS: [u16; 3] = [161, 162, IPP_PORT];

/// Where and how a payload will be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryRoute {
    /// Plain bytes to a JetDirect-style data port.
    Raw(SocketAddr),
    /// RFC 1179 submission to an LPD queue.
    Lpd { addr: SocketAddr, queue: String },
    /// IPP Print-Job to `uri`; `addr` is the socket the URI points at.
    Ipp { uri: String, addr: SocketAddr },
    /// Plain bytes to the relay host's IPP port.
    Relay(SocketAddr),
}

impl DeliveryRoute {
    pub fn addr(&self) -> SocketAddr {
        match self {
            Self::Raw(addr) | Self::Relay(addr) => *addr,
            Self::Lpd { addr, .. } | Self::Ipp { addr, .. } => *addr,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Raw(_) => "raw",
            Self::Lpd { .. } => "lpd",
            Self::Ipp { .. } => "ipp",
            Self::Relay(_) => "relay",
        }
    }
}

/// Resolve the delivery route for `device` at its current address.
pub fn resolve_route(device: &Device, config: &TransportConfig) -> DeliveryRoute {
    if device.shared {
        return DeliveryRoute::Relay(SocketAddr::new(device.ip, config.relay_port));
    }
    match device.transport {
        TransportKind::Raw => DeliveryRoute::Raw(SocketAddr::new(device.ip, raw_port(device.port))),
        // Vendor shares are reached through the printer's own data port.
        TransportKind::VendorShare => DeliveryRoute::Raw(SocketAddr::new(device.ip, RAW_PORT)),
        TransportKind::Lpd => DeliveryRoute::Lpd {
            addr: SocketAddr::new(device.ip, device.port.unwrap_or(LPR_PORT)),
            queue: config.lpd_queue.clone(),
        },
        TransportKind::Ipp => {
            let port = device.port.unwrap_or(IPP_PORT);
            let uri = device
                .device_uri
                .as_deref()
                .filter(|uri| uri.starts_with("ipp://") || uri.starts_with("ipps://"))
                .map(str::to_string)
                .unwrap_or_else(|| Device::endpoint_for(TransportKind::Ipp, device.ip, Some(port)));
            DeliveryRoute::Ipp {
                uri,
                addr: SocketAddr::new(device.ip, port),
            }
        }
    }
}

/// A recorded RAW port, unless it is missing or belongs to another service.
fn raw_port(port: Option<u16>) -> u16 {
    match port {
        Some(p) if p != 0 && !NON_DATA_PORTS.contains(&p) => p,
        _ => RAW_PORT,
    }
}

/// Something that can push a prepared payload to a device.
#[async_trait]
pub trait Deliverer: Send + Sync {
    /// Deliver `payload` for `job` to `device`. Returns bytes sent.
    async fn deliver(&self, device: &Device, job: &Job, payload: &[u8]) -> Result<u64>;
}

/// Network delivery over raw TCP, LPD or IPP.
#[derive(Debug, Clone, Default)]
pub struct Transport {
    config: TransportConfig,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl Deliverer for Transport {
    #[instrument(skip_all, fields(device = %device.alias, job_id = %job.id))]
    async fn deliver(&self, device: &Device, job: &Job, payload: &[u8]) -> Result<u64> {
        let route = resolve_route(device, &self.config);
        info!(route = route.label(), addr = %route.addr(), bytes = payload.len(), "delivering");

        // The IPP client reports every failure the same way, so the address
        // is always checked first on that route.
        if self.config.preflight || matches!(route, DeliveryRoute::Ipp { .. }) {
            diagnostics::preflight(route.addr(), self.config.preflight_timeout()).await?;
        }

        let sent = match &route {
            DeliveryRoute::Raw(addr) | DeliveryRoute::Relay(addr) => {
                raw_client::send_raw(*addr, payload, &self.config).await?
            }
            DeliveryRoute::Lpd { addr, queue } => {
                let lpr_job = LprJob {
                    number: (job.id.0.rem_euclid(1000)) as u16,
                    name: &job.file_name,
                    user: &job.owner,
                };
                lpr_client::send_lpr(*addr, queue, payload, &lpr_job, &self.config).await?
            }
            DeliveryRoute::Ipp { uri, .. } => {
                let client = IppClient::new(uri)?;
                let remote_id = client
                    .print_job(
                        payload.to_vec(),
                        &job.file_name,
                        &job.owner,
                        self.config.write_timeout(),
                    )
                    .await?;
                debug!(remote_id, "printer assigned job id");
                payload.len() as u64
            }
        };

        info!(route = route.label(), bytes = sent, "delivery complete");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use spoolwerk_core::error::SpoolwerkError;
    use spoolwerk_core::types::{DeviceId, JobId};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn device(transport: TransportKind, port: Option<u16>) -> Device {
        Device {
            id: DeviceId(1),
            alias: "Library".into(),
            ip: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            port,
            transport,
            mac: None,
            model: None,
            location: None,
            shared: false,
            ipp_port: None,
            device_uri: None,
        }
    }

    fn job() -> Job {
        Job {
            id: JobId(12),
            device_id: DeviceId(1),
            file_name: "notes.txt".into(),
            owner: "alice".into(),
            spool_path: None,
            payload_hash: None,
            payload_len: 0,
            created_at: Utc::now(),
        }
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            grace_ms: 10,
            linger_ms: 50,
            preflight_timeout_ms: 300,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn raw_port_skips_snmp_and_ipp() {
        let config = TransportConfig::default();
        let addr = |port| resolve_route(&device(TransportKind::Raw, port), &config).addr().port();
        assert_eq!(addr(None), 9100);
        assert_eq!(addr(Some(161)), 9100);
        assert_eq!(addr(Some(162)), 9100);
        assert_eq!(addr(Some(631)), 9100);
        assert_eq!(addr(Some(9101)), 9101);
    }

    #[test]
    fn shared_device_always_goes_to_relay_port() {
        let mut dev = device(TransportKind::Lpd, Some(515));
        dev.shared = true;
        let route = resolve_route(&dev, &TransportConfig::default());
        assert_eq!(
            route,
            DeliveryRoute::Relay(SocketAddr::new(dev.ip, 631))
        );
    }

    #[test]
    fn ipp_route_prefers_recorded_uri() {
        let mut dev = device(TransportKind::Ipp, None);
        let route = resolve_route(&dev, &TransportConfig::default());
        assert_eq!(
            route,
            DeliveryRoute::Ipp {
                uri: "ipp://10.1.2.3:631/ipp/print".into(),
                addr: SocketAddr::new(dev.ip, 631),
            }
        );

        dev.device_uri = Some("ipp://10.1.2.3:631/printers/lab".into());
        match resolve_route(&dev, &TransportConfig::default()) {
            DeliveryRoute::Ipp { uri, .. } => assert_eq!(uri, "ipp://10.1.2.3:631/printers/lab"),
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn lpd_route_uses_configured_queue() {
        let route = resolve_route(&device(TransportKind::Lpd, None), &TransportConfig::default());
        assert_eq!(route.addr().port(), 515);
        assert!(matches!(route, DeliveryRoute::Lpd { ref queue, .. } if queue == "lp"));
    }

    #[tokio::test]
    async fn raw_delivery_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut got = Vec::new();
            sock.read_to_end(&mut got).await.expect("read");
            got
        });

        let mut dev = device(TransportKind::Raw, Some(addr.port()));
        dev.ip = addr.ip();
        // Preflight opens its own connection first; switch it off so the
        // listener sees exactly one.
        let transport = Transport::new(TransportConfig {
            preflight: false,
            ..fast_config()
        });
        let sent = transport.deliver(&dev, &job(), b"hello").await.expect("deliver");
        assert_eq!(sent, 5);
        assert_eq!(server.await.expect("join"), b"hello");
    }

    #[tokio::test]
    async fn dead_address_is_a_location_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let mut dev = device(TransportKind::Raw, Some(addr.port()));
        dev.ip = addr.ip();
        let err = Transport::new(fast_config())
            .deliver(&dev, &job(), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, SpoolwerkError::PortClosed(_)), "got {err:?}");
        assert!(err.triggers_rediscovery());
    }
}
