// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Dedicated per-device listening ports.
//
// Every device gets its own port, assigned once and persisted, so clients
// that identify a printer only by host and port reach the right device
// without naming it.  A monitor task opens ports for newly registered
// devices and releases ports whose device has been deleted.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use spoolwerk_core::config::ListenerConfig;
use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{Device, DeviceId, ServerStatus};

use crate::listener::{Binding, ConnectionHandler, accept_loop};
use crate::store::blocking;

/// One open device port.
struct PortHandle {
    port: u16,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

struct PortsState {
    handler: ConnectionHandler,
    bind_ip: IpAddr,
    base_port: u16,
    ports: Mutex<HashMap<DeviceId, PortHandle>>,
    /// Held from the registry check through bind and insert, and across
    /// close, so two openers never race for the same port.
    transitions: tokio::sync::Mutex<()>,
    active_connections: Arc<AtomicU32>,
}

/// A cloneable handle that releases device ports on a running registry.
#[derive(Clone)]
pub struct PortReleaser {
    state: Arc<PortsState>,
}

impl PortReleaser {
    /// Release a device's port. Returns whether one was open.
    pub async fn release(&self, id: DeviceId) -> bool {
        self.state.close(id).await
    }
}

/// Registry of per-device listeners.
pub struct DedicatedPorts {
    state: Arc<PortsState>,
    monitor_interval: Duration,
    status: ServerStatus,
    shutdown: Arc<Notify>,
    monitor: Option<JoinHandle<()>>,
}

impl DedicatedPorts {
    pub fn new(handler: ConnectionHandler, config: &ListenerConfig) -> Result<Self> {
        let bind_ip: IpAddr = config.bind_addr.parse().map_err(|e| {
            SpoolwerkError::Config(format!("bind address '{}': {e}", config.bind_addr))
        })?;
        Ok(Self {
            state: Arc::new(PortsState {
                handler,
                bind_ip,
                base_port: config.dedicated_base_port,
                ports: Mutex::new(HashMap::new()),
                transitions: tokio::sync::Mutex::new(()),
                active_connections: Arc::new(AtomicU32::new(0)),
            }),
            monitor_interval: Duration::from_secs(config.monitor_interval_secs.max(1)),
            status: ServerStatus::Stopped,
            shutdown: Arc::new(Notify::new()),
            monitor: None,
        })
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    /// Open ports for every device and start the monitor.
    pub async fn start(&mut self) -> Result<()> {
        if self.status == ServerStatus::Running {
            return Ok(());
        }
        self.status = ServerStatus::Starting;
        let opened = self.state.sync().await?;
        info!(opened, "dedicated ports started");

        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.monitor_interval;
        self.monitor = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = state.sync().await {
                            error!(error = %e, "device port monitor pass failed");
                        }
                    }
                }
            }
            debug!("device port monitor stopped");
        }));
        self.status = ServerStatus::Running;
        Ok(())
    }

    /// Stop the monitor and release every port.
    pub async fn stop(&mut self) -> Result<()> {
        if self.status != ServerStatus::Running {
            return Ok(());
        }
        self.shutdown.notify_one();
        if let Some(handle) = self.monitor.take() {
            handle
                .await
                .map_err(|e| SpoolwerkError::Listener(format!("monitor join: {e}")))?;
        }
        let ids: Vec<DeviceId> = self.state.registry().keys().copied().collect();
        for id in ids {
            self.state.close(id).await;
        }
        self.status = ServerStatus::Stopped;
        info!("dedicated ports stopped");
        Ok(())
    }

    /// Reconcile open ports with the device table now.
    pub async fn sync(&self) -> Result<usize> {
        self.state.sync().await
    }

    /// Open the port for one device, assigning it first if needed.
    pub async fn open_device_port(&self, device: &Device) -> Result<u16> {
        self.state.open(device).await
    }

    /// Release a device's port. Returns whether one was open.
    pub async fn close_device_port(&self, id: DeviceId) -> bool {
        self.state.close(id).await
    }

    pub fn releaser(&self) -> PortReleaser {
        PortReleaser {
            state: Arc::clone(&self.state),
        }
    }

    pub fn port_for(&self, id: DeviceId) -> Option<u16> {
        self.state.registry().get(&id).map(|h| h.port)
    }

    /// Open ports, ascending by device.
    pub fn open_ports(&self) -> Vec<(DeviceId, u16)> {
        let mut ports: Vec<(DeviceId, u16)> = self
            .state
            .registry()
            .iter()
            .map(|(id, handle)| (*id, handle.port))
            .collect();
        ports.sort();
        ports
    }
}

impl PortsState {
    fn registry(&self) -> MutexGuard<'_, HashMap<DeviceId, PortHandle>> {
        self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Close ports of deleted devices and open ports for new ones.
    async fn sync(&self) -> Result<usize> {
        let devices = self.handler.ingestor().devices();
        let all = blocking(move || devices.list_devices()).await?;
        let live: HashSet<DeviceId> = all.iter().map(|d| d.id).collect();

        let stale: Vec<DeviceId> = self
            .registry()
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in stale {
            info!(device = %id, "device deleted, releasing its port");
            self.close(id).await;
        }

        let mut opened = 0;
        for device in &all {
            if self.registry().contains_key(&device.id) {
                continue;
            }
            match self.open(device).await {
                Ok(_) => opened += 1,
                Err(e) => warn!(device = %device.alias, error = %e, "device port not opened"),
            }
        }
        Ok(opened)
    }

    async fn open(&self, device: &Device) -> Result<u16> {
        let _transition = self.transitions.lock().await;
        if let Some(port) = self.registry().get(&device.id).map(|h| h.port) {
            return Ok(port);
        }

        // Re-read under the lock: the caller's copy may predate a removal.
        let devices = self.handler.ingestor().devices();
        let (id, base) = (device.id, self.base_port);
        let (port, assigned) = blocking(move || {
            let current = devices
                .device(id)?
                .ok_or_else(|| SpoolwerkError::DeviceNotFound(id.to_string()))?;
            match current.ipp_port {
                Some(port) => Ok((port, false)),
                None => devices.assign_ipp_port(id, base).map(|port| (port, true)),
            }
        })
        .await?;
        if assigned {
            info!(device = %device.alias, port, "dedicated port assigned");
        }

        let addr = SocketAddr::new(self.bind_ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SpoolwerkError::Listener(format!("bind {addr}: {e}")))?;

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shutdown),
            self.handler.clone(),
            Binding::Device(device.id),
            Arc::clone(&self.active_connections),
        ));
        self.registry().insert(
            device.id,
            PortHandle {
                port,
                shutdown,
                task,
            },
        );
        info!(device = %device.alias, %addr, "dedicated port listening");
        Ok(port)
    }

    async fn close(&self, id: DeviceId) -> bool {
        let _transition = self.transitions.lock().await;
        let Some(handle) = self.registry().remove(&id) else {
            return false;
        };
        handle.shutdown.notify_one();
        if let Err(e) = handle.task.await {
            warn!(device = %id, error = %e, "port task ended abnormally");
        }
        info!(device = %id, port = handle.port, "dedicated port closed");
        true
    }
}
