// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Async IPP client for printers registered with the IPP transport.
//
// Only Print-Job (RFC 8011 §4.2.1) is needed on the delivery side.  The
// payload has already been normalized, so it is submitted as
// `application/octet-stream` and the printer sniffs the format itself.

use std::io::Cursor;
use std::time::Duration;

use ipp::prelude::*;
use tracing::{error, info, instrument};

use spoolwerk_core::error::{Result, SpoolwerkError};

/// Document format sent with every Print-Job.
const OCTET_STREAM: &str = "application/octet-stream";

/// Async IPP client bound to a single printer URI.
pub struct IppClient {
    uri: Uri,
}

impl IppClient {
    /// Create a client targeting `uri` (`ipp://host:631/ipp/print`).
    pub fn new(uri: &str) -> Result<Self> {
        let parsed: Uri = uri
            .parse()
            .map_err(|e| SpoolwerkError::Delivery(format!("invalid IPP URI '{uri}': {e}")))?;
        Ok(Self { uri: parsed })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Submit `document_bytes` as a Print-Job.
    ///
    /// Returns the job-id the printer assigned, or 0 when the printer
    /// accepted the job without reporting one.
    #[instrument(skip(self, document_bytes), fields(uri = %self.uri, job_name = %job_name))]
    pub async fn print_job(
        &self,
        document_bytes: Vec<u8>,
        job_name: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<i32> {
        let len = document_bytes.len();
        let payload = IppPayload::new(Cursor::new(document_bytes));

        let operation = IppOperationBuilder::print_job(self.uri.clone(), payload)
            .job_title(job_name)
            .user_name(user)
            .document_format(OCTET_STREAM)
            .build();

        let client = AsyncIppClient::new(self.uri.clone());

        info!(bytes = len, "sending Print-Job");
        let response = tokio::time::timeout(timeout, client.send(operation))
            .await
            .map_err(|_| {
                SpoolwerkError::TransferTimeout(format!(
                    "Print-Job to {} exceeded {}ms",
                    self.uri,
                    timeout.as_millis()
                ))
            })?
            .map_err(|e| SpoolwerkError::Delivery(format!("Print-Job: {e}")))?;

        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            error!(status = ?code, "Print-Job failed");
            return Err(SpoolwerkError::Delivery(format!(
                "Print-Job returned status {code:?}"
            )));
        }

        let job_id = extract_job_id(response.attributes()).unwrap_or(0);
        info!(job_id, "print job accepted by printer");
        Ok(job_id)
    }
}

/// Extract the `job-id` integer from a response's Job Attributes group.
fn extract_job_id(attrs: &IppAttributes) -> Option<i32> {
    attrs
        .groups_of(DelimiterTag::JobAttributes)
        .find_map(|group| match group.attributes().get("job-id")?.value() {
            IppValue::Integer(id) => Some(*id),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_invalid_uri() {
        let result = IppClient::new("not a valid uri %%%");
        assert!(result.is_err());
    }

    #[test]
    fn new_accepts_valid_ipp_uri() {
        let client = IppClient::new("ipp://192.168.1.100:631/ipp/print").expect("uri");
        assert_eq!(client.uri().port_u16(), Some(631));
    }
}
