// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry policy for deliveries.
//
// Ordinary network printers get a small fixed budget of attempts with a
// delay between them.  Relay devices get exactly one attempt: a relay host
// that is down now will still be down a few seconds later.

use std::time::Duration;

use tracing::{debug, info, warn};

use spoolwerk_core::config::{Backoff, DispatcherConfig};
use spoolwerk_core::error::{ErrorKind, SpoolwerkError};
use spoolwerk_core::types::Device;

/// Attempt budget and delay schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatcherConfig::default())
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after this delay.
    RetryAfter(Duration),
    /// The failure cannot be fixed by trying again.
    GiveUp,
    /// Every attempt in the budget has been spent.
    Exhausted,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_delay(),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            backoff: config.backoff,
        }
    }

    /// Number of attempts `device` is allowed per job.
    pub fn attempts_for(&self, device: &Device) -> u32 {
        if device.shared { 1 } else { self.max_attempts.max(1) }
    }

    /// Decide what follows failed attempt number `attempt` (1-based).
    pub fn decide(&self, err: &SpoolwerkError, attempt: u32, device: &Device) -> RetryDecision {
        if !is_retryable(err) {
            info!(device = %device.alias, error = %err, "failure is not retryable");
            return RetryDecision::GiveUp;
        }
        let budget = self.attempts_for(device);
        if attempt >= budget {
            warn!(device = %device.alias, attempt, max = budget, "retry limit exhausted");
            return RetryDecision::Exhausted;
        }
        let delay = self.delay_after(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
        RetryDecision::RetryAfter(delay)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Exponential mode: `min(base * 2^(attempt-1) + jitter, max_delay)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let base_ms = self.base_delay.as_millis() as u64;
                let exp_ms = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
                let total_ms = exp_ms.saturating_add(jitter(base_ms, attempt));
                Duration::from_millis(total_ms.min(self.max_delay.as_millis() as u64))
            }
        }
    }
}

/// Whether another attempt could succeed where this one failed.
///
/// Network failures are worth repeating.  A missing device or job, a bad
/// configuration or a protocol error will fail the same way every time.
pub fn is_retryable(err: &SpoolwerkError) -> bool {
    match err.kind() {
        ErrorKind::Network | ErrorKind::Identity => true,
        ErrorKind::Storage => matches!(err, SpoolwerkError::Io(_)),
        ErrorKind::Protocol | ErrorKind::Lookup | ErrorKind::Config => false,
    }
}

/// Deterministic spread in `[0, base)` keyed on the attempt number.
fn jitter(base_ms: u64, attempt: u32) -> u64 {
    let hash = (attempt as u64).wrapping_mul(6364136223846793005);
    hash % base_ms.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoolwerk_core::types::{DeviceId, TransportKind};
    use std::net::{IpAddr, Ipv4Addr};

    fn device(shared: bool) -> Device {
        Device {
            id: DeviceId(1),
            alias: "Lab".into(),
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            port: Some(9100),
            transport: TransportKind::Raw,
            mac: None,
            model: None,
            location: None,
            shared,
            ipp_port: None,
            device_uri: None,
        }
    }

    fn unreachable() -> SpoolwerkError {
        SpoolwerkError::HostUnreachable("10.0.0.5:9100".into())
    }

    #[test]
    fn relay_devices_get_one_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts_for(&device(true)), 1);
        assert_eq!(policy.attempts_for(&device(false)), 3);
        assert_eq!(
            policy.decide(&unreachable(), 1, &device(true)),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn retry_respects_max() {
        let policy = RetryPolicy::default();
        let dev = device(false);
        assert_eq!(
            policy.decide(&unreachable(), 1, &dev),
            RetryDecision::RetryAfter(Duration::from_secs(5))
        );
        assert!(matches!(
            policy.decide(&unreachable(), 2, &dev),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(policy.decide(&unreachable(), 3, &dev), RetryDecision::Exhausted);
    }

    #[test]
    fn missing_device_never_retries() {
        let policy = RetryPolicy::default();
        let err = SpoolwerkError::DeviceNotFound("Lab".into());
        assert_eq!(policy.decide(&err, 1, &device(false)), RetryDecision::GiveUp);
    }

    #[test]
    fn timeouts_are_retryable() {
        assert!(is_retryable(&SpoolwerkError::TransferTimeout("x".into())));
        assert!(!is_retryable(&SpoolwerkError::MalformedFrame("x".into())));
    }

    #[test]
    fn exponential_delay_grows_and_caps() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 10,
        };
        let d1 = policy.delay_after(1);
        let d2 = policy.delay_after(2);
        let d3 = policy.delay_after(3);
        assert!(d2 > d1);
        assert!(d3 > d2);
        assert_eq!(policy.delay_after(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), policy.delay_after(2));
    }
}
