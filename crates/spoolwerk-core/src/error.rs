// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Spoolwerk.

use thiserror::Error;

/// Top-level error type for all Spoolwerk operations.
#[derive(Debug, Error)]
pub enum SpoolwerkError {
    // -- Protocol errors --
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("operation 0x{0:04X} is not supported")]
    UnsupportedOperation(u16),

    // -- Network errors --
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("port closed or filtered: {0}")]
    PortClosed(String),

    #[error("transfer timed out: {0}")]
    TransferTimeout(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("listener error: {0}")]
    Listener(String),

    // -- Identity errors --
    #[error("rediscovery exhausted for device '{0}'")]
    IdentityNotFound(String),

    #[error("invalid hardware address: {0}")]
    InvalidMac(String),

    // -- Lookup --
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("device alias already registered: {0}")]
    DuplicateAlias(String),

    // -- Storage / persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("spool error: {0}")]
    Spool(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // -- Configuration --
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The closed set of failure families a component can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed frame or unsupported operation; answered with a status.
    Protocol,
    /// Unreachable host, closed port, or a stalled transfer.
    Network,
    /// Rediscovery could not pin the device to an address.
    Identity,
    /// Spool or database failure.
    Storage,
    /// A referenced device or job does not exist.
    Lookup,
    /// Rejected configuration.
    Config,
}

impl SpoolwerkError {
    /// Classify this error into its family.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedFrame(_) | Self::UnsupportedOperation(_) => ErrorKind::Protocol,
            Self::HostUnreachable(_)
            | Self::PortClosed(_)
            | Self::TransferTimeout(_)
            | Self::Delivery(_)
            | Self::Listener(_) => ErrorKind::Network,
            Self::IdentityNotFound(_) | Self::InvalidMac(_) => ErrorKind::Identity,
            Self::DeviceNotFound(_) | Self::JobNotFound(_) | Self::DuplicateAlias(_) => {
                ErrorKind::Lookup
            }
            Self::Database(_) | Self::Spool(_) | Self::Io(_) | Self::Serialization(_) => {
                ErrorKind::Storage
            }
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether this failure means the device is not where we think it is.
    ///
    /// Only these two conditions start a rediscovery pass; a stalled
    /// transfer proves the host was there.
    pub fn triggers_rediscovery(&self) -> bool {
        matches!(self, Self::HostUnreachable(_) | Self::PortClosed(_))
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SpoolwerkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_classify_as_network() {
        assert_eq!(
            SpoolwerkError::PortClosed("10.0.0.5:9100".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            SpoolwerkError::TransferTimeout("10.0.0.5:9100".into()).kind(),
            ErrorKind::Network
        );
    }

    #[test]
    fn io_errors_are_storage() {
        let err: SpoolwerkError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn only_location_failures_trigger_rediscovery() {
        assert!(SpoolwerkError::HostUnreachable("x".into()).triggers_rediscovery());
        assert!(SpoolwerkError::PortClosed("x".into()).triggers_rediscovery());
        assert!(!SpoolwerkError::TransferTimeout("x".into()).triggers_rediscovery());
        assert!(!SpoolwerkError::Delivery("x".into()).triggers_rediscovery());
    }

    #[test]
    fn unsupported_operation_formats_hex() {
        let err = SpoolwerkError::UnsupportedOperation(0x0005);
        assert_eq!(err.to_string(), "operation 0x0005 is not supported");
    }
}
