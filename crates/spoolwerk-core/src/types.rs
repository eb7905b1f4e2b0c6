// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Spoolwerk print server.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SpoolwerkError;

/// Unique identifier for a registered printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub i64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a print job.
///
/// Ids are allocated in strictly increasing order, so comparing two ids
/// compares their creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How bytes reach a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportKind {
    /// JetDirect-style raw socket.
    Raw,
    /// Line printer daemon (RFC 1179).
    Lpd,
    /// Internet Printing Protocol.
    Ipp,
    /// Printer published through a vendor/OS share.
    VendorShare,
}

impl TransportKind {
    /// Stable string form used in the database and CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::Lpd => "LPD",
            Self::Ipp => "IPP",
            Self::VendorShare => "VENDOR_SHARE",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = SpoolwerkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RAW" | "JETDIRECT" | "SOCKET" => Ok(Self::Raw),
            "LPD" | "LPR" => Ok(Self::Lpd),
            "IPP" => Ok(Self::Ipp),
            "VENDOR_SHARE" | "VENDOR-SHARE" | "SMB" => Ok(Self::VendorShare),
            other => Err(SpoolwerkError::Config(format!("unknown transport '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Hardware identity
// ---------------------------------------------------------------------------

/// A link-layer (MAC) address.
///
/// Parsed from `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff` (any case) and
/// always displayed in the normalized `AA:BB:CC:DD:EE:FF` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether `s` is a well-formed MAC string in either accepted notation.
    pub fn is_valid(s: &str) -> bool {
        s.parse::<Self>().is_ok()
    }

    /// All-zero addresses show up in neighbor tables for incomplete entries.
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl FromStr for MacAddress {
    type Err = SpoolwerkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let separator = if trimmed.contains(':') { ':' } else { '-' };
        let parts: Vec<&str> = trimmed.split(separator).collect();
        if parts.len() != 6 {
            return Err(SpoolwerkError::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(SpoolwerkError::InvalidMac(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| SpoolwerkError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl TryFrom<String> for MacAddress {
    type Error = SpoolwerkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// A printer known to the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Display alias, unique across devices.
    pub alias: String,
    /// Last known network address. Rewritten only by rediscovery.
    pub ip: IpAddr,
    /// Recorded delivery port, if any. Resolution rules live in the transport.
    pub port: Option<u16>,
    pub transport: TransportKind,
    /// Hardware identity used to re-locate the device after an address change.
    pub mac: Option<MacAddress>,
    /// Vendor/model string, e.g. "HP LaserJet M404dn".
    pub model: Option<String>,
    pub location: Option<String>,
    /// Reachable only through a relay host at `ip`.
    pub shared: bool,
    /// Dedicated listening port assigned to this device.
    pub ipp_port: Option<u16>,
    /// Endpoint string derived from transport and address.
    pub device_uri: Option<String>,
}

impl Device {
    /// Build the endpoint string for a device at `ip`.
    pub fn endpoint_for(transport: TransportKind, ip: IpAddr, port: Option<u16>) -> String {
        match transport {
            TransportKind::Raw | TransportKind::VendorShare => {
                format!("socket://{}:{}", host_literal(ip), port.unwrap_or(9100))
            }
            TransportKind::Lpd => format!("lpd://{}/queue", host_literal(ip)),
            TransportKind::Ipp => {
                format!("ipp://{}:{}/ipp/print", host_literal(ip), port.unwrap_or(631))
            }
        }
    }

    /// The model string lowercased, or empty when unknown.
    pub fn model_lower(&self) -> String {
        self.model.as_deref().unwrap_or_default().to_lowercase()
    }
}

/// Format an address for use inside a URI authority.
fn host_literal(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Registration request for a new device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDevice {
    pub alias: String,
    pub ip: IpAddr,
    pub port: Option<u16>,
    pub transport: TransportKind,
    pub mac: Option<MacAddress>,
    pub model: Option<String>,
    pub location: Option<String>,
    pub shared: bool,
}

impl NewDevice {
    /// A raw-socket printer with no optional metadata.
    pub fn raw(alias: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            alias: alias.into(),
            ip,
            port: Some(port),
            transport: TransportKind::Raw,
            mac: None,
            model: None,
            location: None,
            shared: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// One print submission waiting in a device queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub device_id: DeviceId,
    pub file_name: String,
    /// Free-text submitter, usually the IPP requesting-user-name.
    pub owner: String,
    /// Spool file holding the payload.
    pub spool_path: Option<PathBuf>,
    /// SHA-256 of the spooled payload, hex encoded.
    pub payload_hash: Option<String>,
    pub payload_len: u64,
    pub created_at: DateTime<Utc>,
}

/// The fields a caller supplies when submitting a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub device_id: DeviceId,
    pub file_name: String,
    pub owner: String,
}

// ---------------------------------------------------------------------------
// Discovery records
// ---------------------------------------------------------------------------

/// Where an address/hardware association was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentitySource {
    /// The local neighbor (ARP) table.
    NeighborCache,
    /// A probe that touched the address and then read its identity.
    Probe,
}

/// An observed association between a hardware address and an IP.
///
/// Never persisted; used to validate a candidate before the device record
/// is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub mac: MacAddress,
    pub ip: IpAddr,
    pub source: IdentitySource,
}

/// Outcome of probing one candidate address during a discovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub ip: IpAddr,
    pub port_open: bool,
    pub identity_match: bool,
}

// ---------------------------------------------------------------------------
// Runtime status
// ---------------------------------------------------------------------------

/// Lifecycle state of a long-running component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

/// Snapshot of the dispatcher's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_jobs: u64,
    pub active_devices: u64,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn mac_normalizes_dash_notation() {
        let mac: MacAddress = "aa-bb-cc-0d-0e-ff".parse().expect("parse");
        assert_eq!(mac.to_string(), "AA:BB:CC:0D:0E:FF");
    }

    #[test]
    fn mac_rejects_malformed_strings() {
        assert!(!MacAddress::is_valid("aa:bb:cc:dd:ee"));
        assert!(!MacAddress::is_valid("aa:bb:cc:dd:ee:fg"));
        assert!(!MacAddress::is_valid("aabb.ccdd.eeff"));
        assert!(!MacAddress::is_valid("a:bb:cc:dd:ee:ff"));
        assert!(MacAddress::is_valid("00:1B:44:11:3A:B7"));
    }

    #[test]
    fn mac_serde_uses_normalized_string() {
        let mac: MacAddress = "00-1b-44-11-3a-b7".parse().expect("parse");
        let json = serde_json::to_string(&mac).expect("serialize");
        assert_eq!(json, "\"00:1B:44:11:3A:B7\"");
        let back: MacAddress = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, mac);
    }

    #[test]
    fn transport_parses_aliases() {
        assert_eq!("jetdirect".parse::<TransportKind>().ok(), Some(TransportKind::Raw));
        assert_eq!("lpr".parse::<TransportKind>().ok(), Some(TransportKind::Lpd));
        assert_eq!("SMB".parse::<TransportKind>().ok(), Some(TransportKind::VendorShare));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn endpoint_strings_follow_transport() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40));
        assert_eq!(
            Device::endpoint_for(TransportKind::Raw, ip, Some(9101)),
            "socket://192.168.1.40:9101"
        );
        assert_eq!(
            Device::endpoint_for(TransportKind::Lpd, ip, None),
            "lpd://192.168.1.40/queue"
        );
        assert_eq!(
            Device::endpoint_for(TransportKind::Ipp, ip, None),
            "ipp://192.168.1.40:631/ipp/print"
        );
    }

    #[test]
    fn job_ids_order_by_creation() {
        assert!(JobId(3) < JobId(10));
    }
}
