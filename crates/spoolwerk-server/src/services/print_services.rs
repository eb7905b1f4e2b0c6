// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Composition root. Opens storage and builds every print-side component
// from one `ServerConfig`.
//
// Administration commands run against the same store and spool as the
// daemon, so a device removed or a job cancelled from the CLI is seen by a
// running server on its next queue pass.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use spoolwerk_core::config::ServerConfig;
use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{Device, DeviceId, Job, JobId, MacAddress, NewDevice, QueueStats};
use spoolwerk_print::discovery::{DiscoveryReport, NetworkScan, Relocation, Subnet};
use spoolwerk_print::store::{DeviceRepository, JobRepository, blocking};
use spoolwerk_print::{
    Advertiser, ConnectionHandler, DedicatedPorts, Dispatcher, Ingestor, PortReleaser,
    Rediscovery, SharedListener, Spool, SqliteStore, Transport,
};

use super::data_dir::{self, CONFIG_FILE};

/// Load the configuration from `explicit`, or from the data directory's
/// `config.json` when present, or fall back to defaults.
pub fn load_config(explicit: Option<&Path>, data_dir: &Path) -> Result<ServerConfig> {
    if let Some(path) = explicit {
        return ServerConfig::load(path);
    }
    let path = data_dir.join(CONFIG_FILE);
    if path.exists() {
        ServerConfig::load(&path)
    } else {
        Ok(ServerConfig::default())
    }
}

/// Handles to every storage-backed component.
pub struct PrintServices {
    config: ServerConfig,
    data_dir: PathBuf,
    store: Arc<SqliteStore>,
    ingestor: Ingestor,
    rediscovery: Arc<Rediscovery>,
    /// Dedicated ports of the server started from this instance, if any.
    live_ports: Mutex<Option<PortReleaser>>,
}

impl PrintServices {
    /// Open the database and spool under `data_dir`.
    pub fn open(data_dir: PathBuf, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        data_dir::ensure(&data_dir)?;
        info!(path = %data_dir.display(), "initialising print services");

        let store = Arc::new(SqliteStore::open(config.storage.database_path(&data_dir))?);
        let spool = Spool::open(config.storage.spool_path(&data_dir))?;
        let ingestor = Ingestor::new(store.clone(), store.clone(), spool);
        let rediscovery = Arc::new(Rediscovery::new(
            store.clone(),
            config.discovery.clone(),
            config.transport.clone(),
        ));

        Ok(Self {
            config,
            data_dir,
            store,
            ingestor,
            rediscovery,
            live_ports: Mutex::new(None),
        })
    }

    /// A dispatcher wired to ingestion and rediscovery, not yet started.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::builder(
            self.store.clone(),
            self.store.clone(),
            self.ingestor.spool().clone(),
            Arc::new(Transport::new(self.config.transport.clone())),
            self.config.dispatcher.clone(),
        )
        .rediscovery(Arc::clone(&self.rediscovery))
        .wake(self.ingestor.wake_handle())
        .build()
    }

    // -- Daemon ---------------------------------------------------------------

    /// Start the dispatcher and every configured listener.
    pub async fn start(&self) -> Result<RunningServer> {
        let listener_config = &self.config.listener;
        let mut running = RunningServer {
            dispatcher: self.dispatcher(),
            shared: None,
            dedicated: None,
            advertiser: None,
        };
        running.dispatcher.start()?;

        let handler = ConnectionHandler::new(self.ingestor.clone(), listener_config);
        if let Some(port) = listener_config.shared_port {
            let bind = bind_addr(&listener_config.bind_addr, port)?;
            let mut shared = SharedListener::new(bind, handler.clone());
            if let Err(e) = shared.start().await {
                running.stop().await;
                return Err(e);
            }
            running.shared = Some(shared);
        }

        if listener_config.dedicated_ports {
            let started = async {
                let mut ports = DedicatedPorts::new(handler, listener_config)?;
                ports.start().await?;
                Ok::<_, SpoolwerkError>(ports)
            }
            .await;
            match started {
                Ok(ports) => {
                    *self.live_ports() = Some(ports.releaser());
                    running.dedicated = Some(ports);
                }
                Err(e) => {
                    running.stop().await;
                    return Err(e);
                }
            }
        }

        if listener_config.advertise_mdns {
            let devices = self.devices().await?;
            let mut advertiser = Advertiser::from_env();
            running.advertise(&mut advertiser, &devices);
            running.advertiser = Some(advertiser);
        }

        info!(
            data_dir = %self.data_dir.display(),
            shared = ?running.shared_addr(),
            dedicated = running.dedicated.as_ref().map(|d| d.open_ports().len()).unwrap_or(0),
            "spoolwerk serving"
        );
        Ok(running)
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let running = self.start().await?;
        shutdown.await;
        info!("shutdown requested");
        running.stop().await;
        Ok(())
    }

    // -- Devices --------------------------------------------------------------

    pub async fn add_device(&self, device: NewDevice) -> Result<Device> {
        if device.alias.trim().is_empty() {
            return Err(SpoolwerkError::Config("device alias must not be empty".into()));
        }
        let devices = self.store.clone();
        let created = blocking(move || devices.create_device(&device)).await?;
        info!(device = %created.alias, id = %created.id, "device registered");
        Ok(created)
    }

    pub async fn devices(&self) -> Result<Vec<Device>> {
        let devices = self.store.clone();
        blocking(move || devices.list_devices()).await
    }

    /// Remove a device, its queue and its spool files. A dedicated port
    /// opened by this instance is released at once rather than on the
    /// monitor's next pass.
    pub async fn remove_device(&self, alias: &str) -> Result<bool> {
        let device = self.ingestor.device_named(alias).await?;
        let removed = self.ingestor.remove_device(device.id).await?;
        let releaser = self.live_ports().clone();
        if let Some(releaser) = releaser {
            releaser.release(device.id).await;
        }
        Ok(removed)
    }

    fn live_ports(&self) -> std::sync::MutexGuard<'_, Option<PortReleaser>> {
        self.live_ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record or clear a device's hardware address.
    pub async fn set_mac(&self, alias: &str, mac: Option<MacAddress>) -> Result<Device> {
        let device = self.ingestor.device_named(alias).await?;
        let devices = self.store.clone();
        let id = device.id;
        blocking(move || {
            devices.set_mac(id, mac)?;
            devices
                .device(id)?
                .ok_or_else(|| SpoolwerkError::DeviceNotFound(id.to_string()))
        })
        .await
    }

    // -- Jobs -----------------------------------------------------------------

    /// Queued jobs, optionally for one device only.
    pub async fn jobs(&self, alias: Option<&str>) -> Result<Vec<Job>> {
        let jobs = self.store.clone();
        match alias {
            Some(alias) => {
                let id: DeviceId = self.ingestor.device_named(alias).await?.id;
                blocking(move || jobs.jobs_for_device(id)).await
            }
            None => blocking(move || jobs.list_jobs()).await,
        }
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<bool> {
        self.ingestor.cancel_job(id).await
    }

    pub async fn clear_queue(&self, alias: &str) -> Result<usize> {
        let device = self.ingestor.device_named(alias).await?;
        self.ingestor.clear_queue(device.id).await
    }

    /// Queue statistics as seen from storage. A separate process cannot see
    /// the daemon's in-flight set, so `in_flight` reads zero here.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.dispatcher().stats().await
    }

    // -- Discovery ------------------------------------------------------------

    /// Sweep `subnet` for printers and register the new ones, each with a
    /// dedicated port. A running server opens those ports on its next
    /// monitor pass.
    pub async fn discover(&self, subnet: &Subnet) -> Result<DiscoveryReport> {
        NetworkScan::new(
            self.store.clone(),
            self.config.discovery.clone(),
            self.config.listener.dedicated_base_port,
        )
        .discover(subnet)
        .await
    }

    // -- Rediscovery ----------------------------------------------------------

    /// Run the relocation strategies for one device now.
    pub async fn rediscover(&self, alias: &str) -> Result<Relocation> {
        let device = self.ingestor.device_named(alias).await?;
        self.rediscovery.locate(&device).await
    }
}

/// The live daemon: dispatcher plus listeners.
pub struct RunningServer {
    dispatcher: Dispatcher,
    shared: Option<SharedListener>,
    dedicated: Option<DedicatedPorts>,
    advertiser: Option<Advertiser>,
}

impl RunningServer {
    pub fn shared_addr(&self) -> Option<SocketAddr> {
        self.shared.as_ref().and_then(|s| s.local_addr())
    }

    pub fn dedicated_port(&self, id: DeviceId) -> Option<u16> {
        self.dedicated.as_ref().and_then(|d| d.port_for(id))
    }

    /// Stop listeners first so no job is accepted after the dispatcher halts.
    pub async fn stop(mut self) {
        if let Some(mut advertiser) = self.advertiser.take() {
            advertiser.shutdown();
        }
        if let Some(mut dedicated) = self.dedicated.take() {
            if let Err(e) = dedicated.stop().await {
                warn!(error = %e, "dedicated ports did not stop cleanly");
            }
        }
        if let Some(mut shared) = self.shared.take() {
            if let Err(e) = shared.stop().await {
                warn!(error = %e, "shared listener did not stop cleanly");
            }
        }
        if let Err(e) = self.dispatcher.stop().await {
            warn!(error = %e, "dispatcher did not stop cleanly");
        }
        info!("spoolwerk stopped");
    }

    /// Advertise each device on its dedicated port, or under its queue path
    /// on the shared port.
    fn advertise(&self, advertiser: &mut Advertiser, devices: &[Device]) {
        for device in devices {
            if let Some(port) = self.dedicated_port(device.id) {
                advertiser.publish(device, port, "ipp/print");
            } else if let Some(addr) = self.shared_addr() {
                let path = format!("printers/{}", device.alias.replace(' ', "%20"));
                advertiser.publish(device, addr.port(), &path);
            }
        }
    }
}

fn bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .map_err(|e| SpoolwerkError::Config(format!("bind address '{host}': {e}")))?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    fn services(dir: &Path, configure: impl FnOnce(&mut ServerConfig)) -> PrintServices {
        let mut config = ServerConfig::default();
        config.listener.bind_addr = "127.0.0.1".into();
        config.listener.shared_port = None;
        config.listener.dedicated_ports = false;
        configure(&mut config);
        PrintServices::open(dir.to_path_buf(), config).expect("open services")
    }

    fn lab(ip: Ipv4Addr, port: u16) -> NewDevice {
        NewDevice::raw("Lab", IpAddr::V4(ip), port)
    }

    /// A printer stand-in that reports every non-empty payload it receives.
    async fn fake_printer(ip: Ipv4Addr) -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind((ip, 0)).await.expect("bind printer");
        let port = listener.local_addr().expect("addr").port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut received = Vec::new();
                    if stream.read_to_end(&mut received).await.is_ok() && !received.is_empty() {
                        let _ = tx.send(received);
                    }
                });
            }
        });
        (port, rx)
    }

    #[tokio::test]
    async fn device_administration_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let svc = services(tmp.path(), |_| {});

        let device = svc
            .add_device(lab(Ipv4Addr::new(192, 168, 1, 40), 9100))
            .await
            .expect("add");
        assert_eq!(svc.devices().await.expect("list").len(), 1);

        let mac: MacAddress = "00-1b-a9-33-44-55".parse().expect("mac");
        let updated = svc.set_mac("Lab", Some(mac)).await.expect("set mac");
        assert_eq!(updated.mac, Some(mac));
        assert_eq!(updated.id, device.id);

        assert!(svc.remove_device("Lab").await.expect("remove"));
        assert!(matches!(
            svc.remove_device("Lab").await,
            Err(SpoolwerkError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_alias_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let svc = services(tmp.path(), |_| {});
        let err = svc
            .add_device(NewDevice::raw("  ", IpAddr::V4(Ipv4Addr::LOCALHOST), 9100))
            .await
            .unwrap_err();
        assert!(matches!(err, SpoolwerkError::Config(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = ServerConfig::default();
        config.dispatcher.max_concurrent = 0;
        assert!(PrintServices::open(tmp.path().to_path_buf(), config).is_err());
    }

    #[test]
    fn config_file_in_data_dir_is_picked_up() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            load_config(None, tmp.path()).expect("defaults"),
            ServerConfig::default()
        );

        let mut config = ServerConfig::default();
        config.dispatcher.max_concurrent = 7;
        config.save(tmp.path().join(CONFIG_FILE)).expect("save");
        let loaded = load_config(None, tmp.path()).expect("load");
        assert_eq!(loaded.dispatcher.max_concurrent, 7);
    }

    #[tokio::test]
    async fn stats_and_clear_reflect_the_queue() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let svc = services(tmp.path(), |_| {});
        let device = svc
            .add_device(lab(Ipv4Addr::new(192, 168, 1, 40), 9100))
            .await
            .expect("add");
        for n in 0..2u8 {
            svc.ingestor
                .submit(
                    &device,
                    spoolwerk_print::ingest::Submission::raw(vec![b'a' + n; 16], IpAddr::V4(Ipv4Addr::LOCALHOST)),
                )
                .await
                .expect("submit");
        }

        let stats = svc.stats().await.expect("stats");
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.active_devices, 1);
        assert!(!stats.running);

        let jobs = svc.jobs(Some("Lab")).await.expect("jobs");
        assert!(svc.cancel_job(jobs[0].id).await.expect("cancel"));
        assert_eq!(svc.clear_queue("Lab").await.expect("clear"), 1);
        assert!(svc.jobs(None).await.expect("jobs").is_empty());
    }

    #[tokio::test]
    async fn document_flows_from_shared_port_to_printer() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let printer_ip = Ipv4Addr::new(127, 0, 10, 2);
        let (printer_port, mut received) = fake_printer(printer_ip).await;

        let svc = services(tmp.path(), |config| {
            config.listener.shared_port = Some(0);
            config.listener.read_idle_timeout_secs = 2;
        });
        svc.add_device(lab(printer_ip, printer_port)).await.expect("add");

        let running = svc.start().await.expect("start");
        let addr = running.shared_addr().expect("shared addr");

        let mut client = TcpStream::connect(addr).await.expect("connect");
        client
            .write_all(b"hello from the shared port\n")
            .await
            .expect("write");
        client.shutdown().await.expect("shutdown");
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.expect("reply");
        assert!(!reply.is_empty());

        let payload = tokio::time::timeout(Duration::from_secs(10), received.recv())
            .await
            .expect("printer reached in time")
            .expect("payload");
        assert!(
            payload
                .windows(b"hello from the shared port".len())
                .any(|w| w == b"hello from the shared port")
        );

        // The queue drains once delivery completes.
        let mut drained = false;
        for _ in 0..50 {
            if svc.jobs(None).await.expect("jobs").is_empty() {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(drained, "job left in queue after delivery");
        running.stop().await;
    }

    #[tokio::test]
    async fn dedicated_ports_open_on_start() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = {
            let probe = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            probe.local_addr().expect("addr").port().min(u16::MAX - 10)
        };
        let svc = services(tmp.path(), |config| {
            config.listener.dedicated_ports = true;
            config.listener.dedicated_base_port = base;
        });
        let device = svc
            .add_device(lab(Ipv4Addr::new(192, 168, 1, 40), 9100))
            .await
            .expect("add");

        let running = svc.start().await.expect("start");
        assert_eq!(running.dedicated_port(device.id), Some(base));
        assert!(running.shared_addr().is_none());
        running.stop().await;
    }

    #[tokio::test]
    async fn removing_a_device_closes_its_port_at_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = {
            let free = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            free.local_addr().expect("addr").port().min(u16::MAX - 10)
        };
        let svc = services(tmp.path(), |config| {
            config.listener.dedicated_ports = true;
            config.listener.dedicated_base_port = base;
            config.listener.monitor_interval_secs = 3600;
        });
        let device = svc
            .add_device(lab(Ipv4Addr::new(192, 168, 1, 40), 9100))
            .await
            .expect("add");

        let running = svc.start().await.expect("start");
        let port = running.dedicated_port(device.id).expect("dedicated port");

        assert!(svc.remove_device("Lab").await.expect("remove"));
        assert!(running.dedicated_port(device.id).is_none());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        running.stop().await;
    }

    #[tokio::test]
    async fn discovery_registers_a_raw_printer_on_the_subnet() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let printer_ip = Ipv4Addr::new(127, 0, 13, 2);
        let _printer = TcpListener::bind((printer_ip, 9100)).await.expect("bind 9100");
        let svc = services(tmp.path(), |config| {
            config.listener.dedicated_base_port = 18_500;
            config.discovery.probe_timeout_ms = 300;
            config.discovery.snmp_timeout_ms = 200;
        });

        let subnet: Subnet = "127.0.13.0/30".parse().expect("subnet");
        let report = svc.discover(&subnet).await.expect("discover");
        assert_eq!(report.registered.len(), 1);
        let device = &report.registered[0];
        assert_eq!(device.ip, IpAddr::V4(printer_ip));
        assert_eq!(device.port, Some(9100));
        assert_eq!(device.ipp_port, Some(18_500));
        assert_eq!(svc.devices().await.expect("list"), report.registered);

        let again = svc.discover(&subnet).await.expect("discover again");
        assert!(again.registered.is_empty());
        assert_eq!(again.known, vec![IpAddr::V4(printer_ip)]);
    }
}
