// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Server configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpoolwerkError};

/// Top-level server settings, loaded from a JSON file.
///
/// Every section defaults independently, so a config file only needs the
/// keys it wants to override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listener: ListenerConfig,
    pub dispatcher: DispatcherConfig,
    pub transport: TransportConfig,
    pub discovery: DiscoveryConfig,
    pub storage: StorageConfig,
}

/// Front-end sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address all listeners bind to.
    pub bind_addr: String,
    /// Shared port multiplexing every device by name. `None` disables it.
    pub shared_port: Option<u16>,
    /// Open one dedicated port per device.
    pub dedicated_ports: bool,
    /// First dedicated port handed out.
    pub dedicated_base_port: u16,
    /// How often the dedicated-port monitor reconciles sockets with devices.
    pub monitor_interval_secs: u64,
    /// Upper bound on a single request body.
    pub max_request_bytes: usize,
    /// A client silent for this long is considered finished.
    pub read_idle_timeout_secs: u64,
    /// Advertise devices over mDNS as `_ipp._tcp.local.`.
    pub advertise_mdns: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            shared_port: Some(631),
            dedicated_ports: true,
            dedicated_base_port: 8631,
            monitor_interval_secs: 10,
            max_request_bytes: 64 * 1024 * 1024,
            read_idle_timeout_secs: 30,
            advertise_mdns: false,
        }
    }
}

/// Delay growth between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Queue dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Ceiling on concurrent deliveries across all devices.
    pub max_concurrent: usize,
    /// Attempts per job for ordinary network devices. Relay devices get one.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
    /// Cap for exponential backoff.
    pub max_retry_delay_ms: u64,
    /// Poll interval while jobs are known to exist.
    pub active_poll_ms: u64,
    /// Poll interval once the queue has drained.
    pub idle_poll_ms: u64,
    /// Pause after a failed dispatch cycle.
    pub error_pause_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_attempts: 3,
            retry_delay_ms: 5_000,
            backoff: Backoff::Fixed,
            max_retry_delay_ms: 60_000,
            active_poll_ms: 2_000,
            idle_poll_ms: 5_000,
            error_pause_ms: 5_000,
        }
    }
}

impl DispatcherConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn active_poll(&self) -> Duration {
        Duration::from_millis(self.active_poll_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn error_pause(&self) -> Duration {
        Duration::from_millis(self.error_pause_ms)
    }
}

/// Delivery transport tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// Budget for writing the whole payload.
    pub write_timeout_ms: u64,
    pub chunk_size: usize,
    /// Pause after the final flush before half-closing.
    pub grace_ms: u64,
    /// How long the read side stays open after the half-close.
    pub linger_ms: u64,
    /// Run the reachability + port diagnostic before each delivery.
    pub preflight: bool,
    pub preflight_timeout_ms: u64,
    /// Port a relay host accepts forwarded jobs on.
    pub relay_port: u16,
    /// LPD queue name.
    pub lpd_queue: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            write_timeout_ms: 60_000,
            chunk_size: 8 * 1024,
            grace_ms: 1_000,
            linger_ms: 500,
            preflight: true,
            preflight_timeout_ms: 2_000,
            relay_port: 631,
            lpd_queue: "lp".into(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn preflight_timeout(&self) -> Duration {
        Duration::from_millis(self.preflight_timeout_ms)
    }
}

/// Rediscovery tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Prefix length used to enumerate a device's subnet.
    pub subnet_prefix: u8,
    /// Worker ceiling for parallel subnet probes.
    pub probe_concurrency: usize,
    /// Per-candidate connect timeout.
    pub probe_timeout_ms: u64,
    /// How long outstanding probes get after a match before being aborted.
    pub abandon_grace_ms: u64,
    /// SNMP community for system-description queries.
    pub snmp_community: String,
    pub snmp_timeout_ms: u64,
    /// Allow the port-only fallback for devices without a hardware address.
    pub allow_unverified_fallback: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            subnet_prefix: 24,
            probe_concurrency: 50,
            probe_timeout_ms: 500,
            abandon_grace_ms: 100,
            snmp_community: "public".into(),
            snmp_timeout_ms: 1_000,
            allow_unverified_fallback: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn abandon_grace(&self) -> Duration {
        Duration::from_millis(self.abandon_grace_ms)
    }

    pub fn snmp_timeout(&self) -> Duration {
        Duration::from_millis(self.snmp_timeout_ms)
    }
}

/// On-disk locations. Relative paths resolve against the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    pub spool_dir: PathBuf,
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            spool_dir: PathBuf::from("print-spool"),
            database: PathBuf::from("spoolwerk.db"),
        }
    }
}

impl StorageConfig {
    /// Resolve the spool directory against `data_dir`.
    pub fn spool_path(&self, data_dir: &Path) -> PathBuf {
        resolve(data_dir, &self.spool_dir)
    }

    /// Resolve the database file against `data_dir`.
    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        resolve(data_dir, &self.database)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl ServerConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.max_concurrent == 0 {
            return Err(SpoolwerkError::Config(
                "dispatcher.max_concurrent must be at least 1".into(),
            ));
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(SpoolwerkError::Config(
                "dispatcher.max_attempts must be at least 1".into(),
            ));
        }
        if self.transport.chunk_size == 0 {
            return Err(SpoolwerkError::Config("transport.chunk_size must be non-zero".into()));
        }
        if !(16..=30).contains(&self.discovery.subnet_prefix) {
            return Err(SpoolwerkError::Config(format!(
                "discovery.subnet_prefix {} outside 16..=30",
                self.discovery.subnet_prefix
            )));
        }
        if self.discovery.probe_concurrency == 0 {
            return Err(SpoolwerkError::Config(
                "discovery.probe_concurrency must be at least 1".into(),
            ));
        }
        if self.listener.shared_port.is_none() && !self.listener.dedicated_ports {
            return Err(SpoolwerkError::Config(
                "at least one of listener.shared_port or listener.dedicated_ports is required"
                    .into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ServerConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let json = r#"{ "dispatcher": { "max_concurrent": 8 } }"#;
        let config: ServerConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.dispatcher.max_concurrent, 8);
        assert_eq!(config.dispatcher.max_attempts, 3);
        assert_eq!(config.listener.dedicated_base_port, 8631);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = ServerConfig::default();
        config.dispatcher.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn prefix_out_of_range_rejected() {
        let mut config = ServerConfig::default();
        config.discovery.subnet_prefix = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spoolwerk.json");
        let mut config = ServerConfig::default();
        config.listener.shared_port = Some(10631);
        config.save(&path).expect("save");
        let loaded = ServerConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn relative_paths_resolve_under_data_dir() {
        let storage = StorageConfig::default();
        let base = Path::new("/var/lib/spoolwerk");
        assert_eq!(
            storage.spool_path(base),
            PathBuf::from("/var/lib/spoolwerk/print-spool")
        );
    }
}
