// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw TCP print client (JetDirect, port 9100).
//
// The simplest possible print protocol: open a TCP socket and dump bytes.
// Relay hosts accept the same byte stream on their IPP port.  Network
// printers tend to drop trailing bytes when the socket is torn down right
// after the last write, so delivery ends with flush, a grace pause, a
// half-close and a short drain of whatever the printer sends back.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use spoolwerk_core::config::TransportConfig;
use spoolwerk_core::error::{Result, SpoolwerkError};

/// Default raw TCP port (HP JetDirect).
pub const RAW_PORT: u16 = 9100;

/// Open a TCP connection, classifying failures by what they say about the
/// device's location.
///
/// A refused connection means the host answered but nothing listens on the
/// port.  Timeouts and routing failures mean the host is not at `addr`.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            SpoolwerkError::HostUnreachable(format!(
                "connection to {addr} timed out after {}ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => {
                SpoolwerkError::PortClosed(format!("{addr}: {e}"))
            }
            _ => SpoolwerkError::HostUnreachable(format!("{addr}: {e}")),
        })?;
    Ok(stream)
}

/// Send document bytes directly to a raw socket.
///
/// Returns the number of bytes written.  A printer that never answers after
/// the half-close is normal for this transport.
pub async fn send_raw(
    addr: SocketAddr,
    document_bytes: &[u8],
    config: &TransportConfig,
) -> Result<u64> {
    info!(addr = %addr, total = document_bytes.len(), "connecting via raw TCP");
    let mut stream = connect(addr, config.connect_timeout()).await?;
    // Trailing bytes go out before the grace period starts.
    let _ = stream.set_nodelay(true);

    let sent = tokio::time::timeout(
        config.write_timeout(),
        write_chunked(&mut stream, document_bytes, config.chunk_size),
    )
    .await
    .map_err(|_| {
        SpoolwerkError::TransferTimeout(format!(
            "raw transfer to {addr} exceeded {}ms",
            config.write_timeout_ms
        ))
    })??;

    stream
        .flush()
        .await
        .map_err(|e| SpoolwerkError::Delivery(format!("raw TCP flush to {addr}: {e}")))?;

    tokio::time::sleep(config.grace()).await;

    stream
        .shutdown()
        .await
        .map_err(|e| SpoolwerkError::Delivery(format!("raw TCP half-close to {addr}: {e}")))?;

    let drained = drain(&mut stream, config.linger()).await;
    debug!(addr = %addr, drained, "raw TCP read side closed");

    info!(addr = %addr, total = sent, "raw TCP print job sent successfully");
    Ok(sent)
}

/// Write `data` in `chunk_size` pieces.
pub(crate) async fn write_chunked(
    stream: &mut TcpStream,
    data: &[u8],
    chunk_size: usize,
) -> Result<u64> {
    let mut sent: u64 = 0;
    for chunk in data.chunks(chunk_size.max(1)) {
        stream.write_all(chunk).await.map_err(|e| {
            SpoolwerkError::Delivery(format!("raw TCP send failed at byte {sent}: {e}"))
        })?;
        sent += chunk.len() as u64;
        debug!(sent, total = data.len(), "raw TCP progress");
    }
    Ok(sent)
}

/// Read and discard until EOF or `linger` elapses. Returns bytes read.
async fn drain(stream: &mut TcpStream, linger: Duration) -> usize {
    let mut buf = [0u8; 512];
    let mut total = 0;
    let _ = tokio::time::timeout(linger, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
    })
    .await;
    total
}
