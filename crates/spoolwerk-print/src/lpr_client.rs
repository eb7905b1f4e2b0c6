// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// LPR/LPD client (RFC 1179) for legacy printers.
//
// Open connection, send a "receive job" command, then a control file
// (metadata) and a data file (document bytes).  Every step is acknowledged
// with a single zero byte.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

use spoolwerk_core::config::TransportConfig;
use spoolwerk_core::error::{Result, SpoolwerkError};

use crate::raw_client;

/// Default LPR port.
pub const LPR_PORT: u16 = 515;

/// Host name written into control files.
const LPR_HOST: &str = "spoolwerk";

/// What the LPR client needs to know about the job.
#[derive(Debug, Clone)]
pub struct LprJob<'a> {
    /// Three-digit job number, 0..=999.
    pub number: u16,
    pub name: &'a str,
    pub user: &'a str,
}

/// Send a document via LPR/LPD protocol.
#[instrument(skip_all, fields(addr = %addr, job = job.name))]
pub async fn send_lpr(
    addr: SocketAddr,
    queue: &str,
    document_bytes: &[u8],
    job: &LprJob<'_>,
    config: &TransportConfig,
) -> Result<u64> {
    info!(addr = %addr, queue, "connecting via LPR");
    let mut stream = raw_client::connect(addr, config.connect_timeout()).await?;

    let transfer = async {
        // 0x02 <queue> LF: receive a printer job
        write_step(&mut stream, format!("\x02{queue}\n").as_bytes(), "receive-job").await?;
        read_ack(&mut stream, "receive-job").await?;

        let cf = control_file(job);
        let cf_name = format!("cfA{:03}{LPR_HOST}", job.number % 1000);
        let cf_header = format!("\x02{} {cf_name}\n", cf.len());
        write_step(&mut stream, cf_header.as_bytes(), "control header").await?;
        read_ack(&mut stream, "control header").await?;
        write_step(&mut stream, cf.as_bytes(), "control file").await?;
        write_step(&mut stream, &[0], "control terminator").await?;
        read_ack(&mut stream, "control file").await?;

        let df_header = format!(
            "\x03{} dfA{:03}{LPR_HOST}\n",
            document_bytes.len(),
            job.number % 1000
        );
        write_step(&mut stream, df_header.as_bytes(), "data header").await?;
        read_ack(&mut stream, "data header").await?;
        let sent =
            raw_client::write_chunked(&mut stream, document_bytes, config.chunk_size).await?;
        write_step(&mut stream, &[0], "data terminator").await?;
        read_ack(&mut stream, "data file").await?;
        Ok::<u64, SpoolwerkError>(sent)
    };

    let sent = tokio::time::timeout(config.write_timeout(), transfer)
        .await
        .map_err(|_| {
            SpoolwerkError::TransferTimeout(format!(
                "LPR transfer to {addr} exceeded {}ms",
                config.write_timeout_ms
            ))
        })??;

    let _ = stream.shutdown().await;
    info!(job = job.name, bytes = sent, "LPR job sent successfully");
    Ok(sent)
}

/// Build the RFC 1179 control file for one plain ("l") data file.
pub fn control_file(job: &LprJob<'_>) -> String {
    let number = job.number % 1000;
    let name = sanitize_line(job.name);
    let user = sanitize_line(job.user);
    format!(
        "H{LPR_HOST}\nP{user}\nJ{name}\nldfA{number:03}{LPR_HOST}\nUdfA{number:03}{LPR_HOST}\nN{name}\n"
    )
}

/// Control-file lines cannot carry newlines and are capped at 99 bytes.
fn sanitize_line(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .take(99)
        .collect()
}

async fn write_step(stream: &mut TcpStream, bytes: &[u8], stage: &str) -> Result<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| SpoolwerkError::Delivery(format!("LPR {stage}: {e}")))
}

async fn read_ack(stream: &mut TcpStream, stage: &str) -> Result<()> {
    let mut ack = [0u8; 1];
    stream
        .read_exact(&mut ack)
        .await
        .map_err(|e| SpoolwerkError::Delivery(format!("LPR {stage} ack: {e}")))?;
    if ack[0] != 0 {
        return Err(SpoolwerkError::Delivery(format!(
            "LPR printer rejected {stage} (ack 0x{:02X})",
            ack[0]
        )));
    }
    debug!(stage, "LPR ack");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn control_file_names_user_and_job() {
        let job = LprJob {
            number: 1042,
            name: "notes.txt",
            user: "alice",
        };
        let cf = control_file(&job);
        assert!(cf.starts_with("Hspoolwerk\nPalice\nJnotes.txt\n"));
        assert!(cf.contains("ldfA042spoolwerk\n"));
        assert!(cf.ends_with("Nnotes.txt\n"));
    }

    #[test]
    fn control_lines_drop_newlines() {
        assert_eq!(sanitize_line("evil\nHinjected"), "evilHinjected");
    }

    /// Minimal LPD that acknowledges every step and returns the data file.
    async fn fake_lpd(listener: TcpListener) -> (String, Vec<u8>) {
        let (sock, _) = listener.accept().await.expect("accept");
        let mut reader = tokio::io::BufReader::new(sock);

        let mut line = String::new();
        reader.read_line(&mut line).await.expect("command");
        let queue = line.trim_start_matches('\x02').trim_end().to_string();
        reader.get_mut().write_all(&[0]).await.expect("ack");

        // Control file header, body, terminator.
        line.clear();
        reader.read_line(&mut line).await.expect("cf header");
        let cf_len: usize = line[1..].split(' ').next().expect("len").parse().expect("num");
        reader.get_mut().write_all(&[0]).await.expect("ack");
        let mut cf = vec![0u8; cf_len + 1];
        reader.read_exact(&mut cf).await.expect("cf body");
        reader.get_mut().write_all(&[0]).await.expect("ack");

        // Data file header, body, terminator.
        line.clear();
        reader.read_line(&mut line).await.expect("df header");
        let df_len: usize = line[1..].split(' ').next().expect("len").parse().expect("num");
        reader.get_mut().write_all(&[0]).await.expect("ack");
        let mut df = vec![0u8; df_len + 1];
        reader.read_exact(&mut df).await.expect("df body");
        reader.get_mut().write_all(&[0]).await.expect("ack");

        df.pop();
        (queue, df)
    }

    #[tokio::test]
    async fn lpr_handshake_delivers_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(fake_lpd(listener));

        let job = LprJob {
            number: 7,
            name: "report.pcl",
            user: "bob",
        };
        let sent = send_lpr(addr, "lp", b"\x1bEdata", &job, &TransportConfig::default())
            .await
            .expect("send");

        let (queue, data) = server.await.expect("join");
        assert_eq!(sent, 6);
        assert_eq!(queue, "lp");
        assert_eq!(data, b"\x1bEdata");
    }
}
