// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Protocol listener: connection handling and the shared-port server.
//
// A connection is read to end of stream (or to the end of an HTTP body,
// sized or chunked), classified, and answered:
//
//   over the size limit -> request-entity-too-large (HTTP 413), nothing queued
//   empty stream        -> fixed 9-byte success frame (client probes)
//   no IPP header       -> whole stream queued as a document, bare status
//   IPP request         -> operation dispatch, full response
//
// The shared server resolves the target device from the printer URI.
// Dedicated per-device ports (see `dedicated`) reuse the same handler with
// the device fixed by the port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use spoolwerk_core::config::ListenerConfig;
use spoolwerk_core::error::{ErrorKind, Result, SpoolwerkError};
use spoolwerk_core::types::{Device, DeviceId, Job, JobId, ServerStatus};

use crate::ingest::{Ingestor, Submission};
use crate::store::blocking;
use crate::wire::{
    IppRequest, IppResponseBuilder, Inbound, JOB_STATE_PENDING, OP_CANCEL_JOB, OP_GET_JOBS,
    OP_GET_PRINTER_ATTRIBUTES, OP_LIST_DEVICES, OP_PRINT_JOB, PRINTER_STATE_IDLE, PROBE_OK_FRAME,
    STATUS_CLIENT_ERROR_BAD_REQUEST, STATUS_CLIENT_ERROR_NOT_FOUND,
    STATUS_CLIENT_ERROR_REQUEST_ENTITY_TOO_LARGE, STATUS_OK, STATUS_SERVER_ERROR_INTERNAL,
    STATUS_SERVER_ERROR_OPERATION_NOT_SUPPORTED, TAG_JOB_ATTRIBUTES, TAG_PRINTER_ATTRIBUTES,
    VALUE_TAG_MIME_MEDIA_TYPE, build_bare_status, build_status_response, classify_inbound,
    http_error_response, http_request_complete, is_plausible_version, wrap_http_response,
};

/// Connections handled at once per listening socket.
const MAX_CONNECTIONS: usize = 64;

const READ_CHUNK: usize = 8192;

/// Formats advertised in printer attributes.
const DOCUMENT_FORMATS: [&str; 5] = [
    "application/octet-stream",
    "application/pdf",
    "application/postscript",
    "application/vnd.hp-PCL",
    "text/plain",
];

/// Which device a listening socket speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Device chosen per request by printer URI.
    Shared,
    /// Every connection targets this device.
    Device(DeviceId),
}

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

/// Per-connection request handling shared by every listener.
#[derive(Clone)]
pub struct ConnectionHandler {
    ingestor: Ingestor,
    max_request_bytes: usize,
    idle_timeout: Duration,
}

impl ConnectionHandler {
    pub fn new(ingestor: Ingestor, config: &ListenerConfig) -> Self {
        Self {
            ingestor,
            max_request_bytes: config.max_request_bytes,
            idle_timeout: Duration::from_secs(config.read_idle_timeout_secs.max(1)),
        }
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    /// Read one request from `stream`, act on it and write the reply.
    #[instrument(skip_all, fields(conn = %Uuid::new_v4(), peer = %peer, binding = ?binding))]
    pub async fn handle(&self, mut stream: TcpStream, peer: SocketAddr, binding: Binding) -> Result<()> {
        let local = stream
            .local_addr()
            .map_err(|e| SpoolwerkError::Listener(format!("local address: {e}")))?;
        let data = match read_request(&mut stream, self.max_request_bytes, self.idle_timeout).await? {
            ReadOutcome::Complete(data) => data,
            ReadOutcome::TooLarge { head } => {
                let reply = too_large_reply(&head);
                return send_reply(&mut stream, peer, &reply).await;
            }
        };
        debug!(bytes = data.len(), "request read");

        let reply = match classify_inbound(data) {
            Inbound::Probe => {
                debug!("empty connection, answering probe");
                PROBE_OK_FRAME.to_vec()
            }
            Inbound::Raw { bytes, http } => {
                let body = self.accept_raw(bytes, peer, binding).await;
                if http { wrap_http_response(&body) } else { body }
            }
            Inbound::BadHttp => http_error_response(400, "Bad Request"),
            Inbound::Ipp { request, http } => {
                debug!(
                    version = %format!("{}.{}", request.version_major, request.version_minor),
                    operation = %format!("0x{:04X}", request.operation_id),
                    request_id = request.request_id,
                    doc_bytes = request.document_data.len(),
                    "parsed IPP request"
                );
                let body = self.dispatch_operation(&request, peer, binding, local).await;
                if http { wrap_http_response(&body) } else { body }
            }
        };

        send_reply(&mut stream, peer, &reply).await
    }

    /// Queue a protocol-less stream for the bound or default device.
    async fn accept_raw(&self, bytes: Vec<u8>, peer: SocketAddr, binding: Binding) -> Vec<u8> {
        let device = match self.bound_device(binding).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!("raw document arrived but no device is registered");
                return build_bare_status(STATUS_CLIENT_ERROR_NOT_FOUND, "no printer available");
            }
            Err(e) => {
                error!(error = %e, "raw document could not be routed");
                return build_bare_status(STATUS_SERVER_ERROR_INTERNAL, "internal error");
            }
        };

        match self
            .ingestor
            .submit(&device, Submission::raw(bytes, peer.ip()))
            .await
        {
            Ok(job) => {
                info!(job_id = %job.id, device = %device.alias, "raw document queued");
                build_bare_status(STATUS_OK, "successful-ok")
            }
            Err(e) => {
                error!(device = %device.alias, error = %e, "raw document rejected");
                build_bare_status(STATUS_SERVER_ERROR_INTERNAL, "internal error")
            }
        }
    }

    /// Device for a raw stream: the bound device, or the first registered.
    async fn bound_device(&self, binding: Binding) -> Result<Option<Device>> {
        match binding {
            Binding::Shared => self.ingestor.default_device().await,
            Binding::Device(id) => self.live_device(id).await,
        }
    }

    /// The bound device. A deleted device is an internal error: its port
    /// should already have been closed.
    async fn live_device(&self, id: DeviceId) -> Result<Option<Device>> {
        let devices = self.ingestor.devices();
        match blocking(move || devices.device(id)).await? {
            Some(device) => Ok(Some(device)),
            None => {
                error!(device = %id, "listener outlived its device; port should be released");
                Err(SpoolwerkError::Listener(format!("device {id} no longer exists")))
            }
        }
    }

    /// Device targeted by an IPP request. `Ok(None)` means not found.
    async fn target(&self, request: &IppRequest, binding: Binding) -> Result<Option<Device>> {
        match binding {
            Binding::Device(id) => self.live_device(id).await,
            Binding::Shared => {
                let Some(name) = request.printer_name() else {
                    return Ok(None);
                };
                let devices = self.ingestor.devices();
                blocking(move || {
                    if let Some(device) = devices.device_by_alias(&name)? {
                        return Ok(Some(device));
                    }
                    // Published URIs spell spaces as underscores.
                    if name.contains('_') {
                        devices.device_by_alias(&name.replace('_', " "))
                    } else {
                        Ok(None)
                    }
                })
                .await
            }
        }
    }

    // -- Operations ---------------------------------------------------------

    async fn dispatch_operation(
        &self,
        request: &IppRequest,
        peer: SocketAddr,
        binding: Binding,
        local: SocketAddr,
    ) -> Vec<u8> {
        let result = match request.operation_id {
            OP_PRINT_JOB => self.print_job(request, peer, binding, local).await,
            OP_GET_PRINTER_ATTRIBUTES => self.get_printer_attributes(request, binding, local).await,
            OP_GET_JOBS => self.get_jobs(request, binding, local).await,
            OP_CANCEL_JOB => self.cancel_job(request, binding).await,
            OP_LIST_DEVICES => self.list_devices(request, binding, local).await,
            other => Err(SpoolwerkError::UnsupportedOperation(other)),
        };

        match result {
            Ok(body) => body,
            Err(e) => {
                let status = status_for(&e);
                match status {
                    STATUS_SERVER_ERROR_INTERNAL => error!(error = %e, "request failed"),
                    _ => warn!(error = %e, status = %format!("0x{status:04X}"), "request refused"),
                }
                build_status_response(request, status, &e.to_string())
            }
        }
    }

    async fn print_job(
        &self,
        request: &IppRequest,
        peer: SocketAddr,
        binding: Binding,
        local: SocketAddr,
    ) -> Result<Vec<u8>> {
        let device = self
            .target(request, binding)
            .await?
            .ok_or_else(|| not_found(request))?;
        let submission = Submission::from_request(request, peer.ip());
        let job = self.ingestor.submit(&device, submission).await?;
        info!(job_id = %job.id, device = %device.alias, owner = %job.owner, "print job accepted");

        let mut resp = IppResponseBuilder::reply_to(request, STATUS_OK);
        resp.operation_group("successful-ok");
        resp.begin_group(TAG_JOB_ATTRIBUTES);
        encode_job(&mut resp, &job, &printer_uri(local, &device, binding));
        Ok(resp.build())
    }

    async fn get_printer_attributes(
        &self,
        request: &IppRequest,
        binding: Binding,
        local: SocketAddr,
    ) -> Result<Vec<u8>> {
        let device = self
            .target(request, binding)
            .await?
            .ok_or_else(|| not_found(request))?;
        let jobs = self.ingestor.jobs();
        let id = device.id;
        let queued = blocking(move || jobs.jobs_for_device(id)).await?.len();
        Ok(printer_attributes_response(
            request,
            &device,
            &printer_uri(local, &device, binding),
            queued,
        ))
    }

    async fn get_jobs(&self, request: &IppRequest, binding: Binding, local: SocketAddr) -> Result<Vec<u8>> {
        let device = self.target(request, binding).await?;
        if device.is_none() && (binding != Binding::Shared || request.printer_name().is_some()) {
            return Err(not_found(request));
        }

        let devices = self.ingestor.devices();
        let jobs = self.ingestor.jobs();
        let scope = device.as_ref().map(|d| d.id);
        let (all_devices, queued) = blocking(move || {
            let queued = match scope {
                Some(id) => jobs.jobs_for_device(id)?,
                None => jobs.list_jobs()?,
            };
            Ok((devices.list_devices()?, queued))
        })
        .await?;

        let mut resp = IppResponseBuilder::reply_to(request, STATUS_OK);
        resp.operation_group("successful-ok");
        for job in &queued {
            let Some(owner) = all_devices.iter().find(|d| d.id == job.device_id) else {
                continue;
            };
            resp.begin_group(TAG_JOB_ATTRIBUTES);
            encode_job(&mut resp, job, &printer_uri(local, owner, binding));
            resp.name_attr("job-name", &job.file_name)
                .name_attr("job-originating-user-name", &job.owner)
                .integer("job-k-octets", (job.payload_len.div_ceil(1024)).min(i32::MAX as u64) as i32);
        }
        debug!(jobs = queued.len(), "job list sent");
        Ok(resp.build())
    }

    async fn cancel_job(&self, request: &IppRequest, binding: Binding) -> Result<Vec<u8>> {
        let id = requested_job_id(request).ok_or_else(|| {
            SpoolwerkError::MalformedFrame("cancel-job without job-id".into())
        })?;
        let jobs = self.ingestor.jobs();
        let job = blocking(move || jobs.job(id))
            .await?
            .ok_or(SpoolwerkError::JobNotFound(id.0))?;
        if let Binding::Device(device) = binding {
            if job.device_id != device {
                return Err(SpoolwerkError::JobNotFound(id.0));
            }
        }
        if !self.ingestor.cancel_job(id).await? {
            return Err(SpoolwerkError::JobNotFound(id.0));
        }
        info!(job_id = %id, "job cancelled by client");
        Ok(build_status_response(request, STATUS_OK, "successful-ok"))
    }

    async fn list_devices(&self, request: &IppRequest, binding: Binding, local: SocketAddr) -> Result<Vec<u8>> {
        let devices = self.ingestor.devices();
        let jobs = self.ingestor.jobs();
        let (all, queued) = blocking(move || Ok((devices.list_devices()?, jobs.list_jobs()?))).await?;

        let mut resp = IppResponseBuilder::reply_to(request, STATUS_OK);
        resp.operation_group("successful-ok");
        for device in &all {
            let count = queued.iter().filter(|j| j.device_id == device.id).count();
            resp.begin_group(TAG_PRINTER_ATTRIBUTES);
            encode_printer(&mut resp, device, &printer_uri(local, device, binding), count);
        }
        info!(devices = all.len(), "device list sent");
        Ok(resp.build())
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Get-Printer-Attributes reply for `device`.
pub fn printer_attributes_response(
    request: &IppRequest,
    device: &Device,
    uri: &str,
    queued: usize,
) -> Vec<u8> {
    let mut resp = IppResponseBuilder::reply_to(request, STATUS_OK);
    resp.operation_group("successful-ok");
    resp.begin_group(TAG_PRINTER_ATTRIBUTES);
    encode_printer(&mut resp, device, uri, queued);
    resp.build()
}

fn encode_printer(resp: &mut IppResponseBuilder, device: &Device, uri: &str, queued: usize) {
    resp.name_attr("printer-name", &device.alias)
        .uri("printer-uri-supported", uri)
        .enum_attr("printer-state", PRINTER_STATE_IDLE)
        .keyword("printer-state-reasons", "none")
        .boolean("printer-is-accepting-jobs", true)
        .text("printer-make-and-model", device.model.as_deref().unwrap_or("Unknown"))
        .text("printer-location", device.location.as_deref().unwrap_or(""))
        .integer("queued-job-count", queued.min(i32::MAX as usize) as i32)
        .mime_type("document-format-default", DOCUMENT_FORMATS[0])
        .mime_type("document-format-supported", DOCUMENT_FORMATS[0]);
    for format in &DOCUMENT_FORMATS[1..] {
        resp.additional(VALUE_TAG_MIME_MEDIA_TYPE, format);
    }
    if let Some(endpoint) = device.device_uri.as_deref() {
        resp.uri("device-uri", endpoint);
    }
}

fn encode_job(resp: &mut IppResponseBuilder, job: &Job, printer_uri: &str) {
    let id = i32::try_from(job.id.0).unwrap_or(i32::MAX);
    resp.integer("job-id", id)
        .uri("job-uri", &format!("{printer_uri}/jobs/{id}"))
        .uri("job-printer-uri", printer_uri)
        .enum_attr("job-state", JOB_STATE_PENDING)
        .keyword("job-state-reasons", "none");
}

/// URI clients should use for `device` on this listener.
pub fn printer_uri(local: SocketAddr, device: &Device, binding: Binding) -> String {
    let host = match local {
        SocketAddr::V4(v4) => v4.ip().to_string(),
        SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
    };
    match binding {
        Binding::Shared => format!(
            "ipp://{host}:{}/printers/{}",
            local.port(),
            device.alias.replace('%', "%25").replace(' ', "%20")
        ),
        Binding::Device(_) => format!("ipp://{host}:{}/ipp/print", local.port()),
    }
}

fn requested_job_id(request: &IppRequest) -> Option<JobId> {
    let from_attr = request
        .operation_attributes()
        .and_then(|g| g.get_integer("job-id"))
        .map(i64::from);
    let from_uri = || {
        request
            .string_attr("job-uri")
            .and_then(|uri| uri.rsplit('/').next().and_then(|id| id.parse::<i64>().ok()))
    };
    from_attr.or_else(from_uri).map(JobId)
}

fn not_found(request: &IppRequest) -> SpoolwerkError {
    SpoolwerkError::DeviceNotFound(request.printer_name().unwrap_or_else(|| "(unnamed)".into()))
}

/// IPP status for a failed operation.
fn status_for(err: &SpoolwerkError) -> u16 {
    match err {
        SpoolwerkError::UnsupportedOperation(_) => STATUS_SERVER_ERROR_OPERATION_NOT_SUPPORTED,
        SpoolwerkError::MalformedFrame(_) => STATUS_CLIENT_ERROR_BAD_REQUEST,
        _ => match err.kind() {
            ErrorKind::Lookup => STATUS_CLIENT_ERROR_NOT_FOUND,
            _ => STATUS_SERVER_ERROR_INTERNAL,
        },
    }
}

// ---------------------------------------------------------------------------
// Reading and replying
// ---------------------------------------------------------------------------

/// Write `reply`, flush and close the connection.
async fn send_reply(stream: &mut TcpStream, peer: SocketAddr, reply: &[u8]) -> Result<()> {
    stream
        .write_all(reply)
        .await
        .map_err(|e| SpoolwerkError::Listener(format!("write reply to {peer}: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| SpoolwerkError::Listener(format!("flush reply to {peer}: {e}")))?;
    let _ = stream.shutdown().await;
    debug!(bytes = reply.len(), "reply sent");
    Ok(())
}

/// Outcome of reading one request.
#[derive(Debug)]
enum ReadOutcome {
    Complete(Vec<u8>),
    /// The limit was passed before the request ended. `head` holds the first
    /// bytes, enough to pick the reply format.
    TooLarge { head: Vec<u8> },
}

/// Read until end of stream, the end of an HTTP body, or the client going
/// quiet for `idle`. Past `max` bytes the rest of the stream is discarded.
async fn read_request(stream: &mut TcpStream, max: usize, idle: Duration) -> Result<ReadOutcome> {
    let mut data = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let Some(n) = read_some(stream, &mut chunk, idle).await? else {
            debug!(bytes = data.len(), "client finished sending");
            return Ok(ReadOutcome::Complete(data));
        };
        data.extend_from_slice(&chunk[..n]);
        if data.len() > max {
            break;
        }
        if http_request_complete(&data) {
            return Ok(ReadOutcome::Complete(data));
        }
    }

    warn!(limit = max, "request exceeds size limit, discarding");
    data.truncate(READ_CHUNK.min(max));
    // Drain what the client already sent so the refusal is not lost to a
    // reset. The whole drain gets one idle period.
    let drained = tokio::time::timeout(idle, async {
        let mut discarded = 0usize;
        while let Ok(Some(n)) = read_some(stream, &mut chunk, idle).await {
            discarded += n;
        }
        discarded
    })
    .await;
    debug!(discarded = ?drained.ok(), "oversized request drained");
    Ok(ReadOutcome::TooLarge { head: data })
}

/// One read. `None` at end of stream or after `idle` without data.
async fn read_some(stream: &mut TcpStream, buf: &mut [u8], idle: Duration) -> Result<Option<usize>> {
    match tokio::time::timeout(idle, stream.read(buf)).await {
        Ok(Ok(0)) => Ok(None),
        Ok(Ok(n)) => Ok(Some(n)),
        Ok(Err(e)) => Err(SpoolwerkError::Listener(format!("read: {e}"))),
        Err(_) => {
            debug!("client idle, treating stream as complete");
            Ok(None)
        }
    }
}

/// Refusal for a request over the size limit, framed like the request.
fn too_large_reply(head: &[u8]) -> Vec<u8> {
    if head.starts_with(b"POST ") {
        return http_error_response(413, "Payload Too Large");
    }
    let message = "request exceeds the size limit";
    if head.len() >= 8 && is_plausible_version(head[0]) {
        let request_id = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
        let mut resp = IppResponseBuilder::with_version(
            head[0],
            head[1],
            STATUS_CLIENT_ERROR_REQUEST_ENTITY_TOO_LARGE,
            request_id,
        );
        resp.operation_group(message);
        return resp.build();
    }
    build_bare_status(STATUS_CLIENT_ERROR_REQUEST_ENTITY_TOO_LARGE, message)
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Accept connections until `shutdown` fires, one task per connection.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    shutdown: Arc<Notify>,
    handler: ConnectionHandler,
    binding: Binding,
    active: Arc<AtomicU32>,
) {
    let slots = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!(port, "accept loop received shutdown signal");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let Ok(slot) = Arc::clone(&slots).acquire_owned().await else {
                            break;
                        };
                        debug!(peer = %peer, port, "incoming connection");
                        let handler = handler.clone();
                        let active = Arc::clone(&active);
                        tokio::spawn(async move {
                            active.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = handler.handle(stream, peer, binding).await {
                                warn!(peer = %peer, error = %e, "connection handler error");
                            }
                            active.fetch_sub(1, Ordering::Relaxed);
                            drop(slot);
                        });
                    }
                    Err(e) => error!(port, error = %e, "failed to accept connection"),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SharedListener
// ---------------------------------------------------------------------------

/// The single port that serves every device by name.
pub struct SharedListener {
    bind: SocketAddr,
    local_addr: Option<SocketAddr>,
    handler: ConnectionHandler,
    status: ServerStatus,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
    active_connections: Arc<AtomicU32>,
}

impl SharedListener {
    pub fn new(bind: SocketAddr, handler: ConnectionHandler) -> Self {
        Self {
            bind,
            local_addr: None,
            handler,
            status: ServerStatus::Stopped,
            shutdown: Arc::new(Notify::new()),
            task: None,
            active_connections: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    /// Bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind and start accepting.
    ///
    /// # Errors
    ///
    /// Returns `Listener` if the address cannot be bound.
    pub async fn start(&mut self) -> Result<()> {
        if self.status == ServerStatus::Running {
            debug!(addr = %self.bind, "shared listener already running");
            return Ok(());
        }
        self.status = ServerStatus::Starting;

        let listener = match TcpListener::bind(self.bind).await {
            Ok(listener) => listener,
            Err(e) => {
                self.status = ServerStatus::Error;
                return Err(SpoolwerkError::Listener(format!("bind {}: {e}", self.bind)));
            }
        };
        let local = listener
            .local_addr()
            .map_err(|e| SpoolwerkError::Listener(format!("local address: {e}")))?;
        self.local_addr = Some(local);
        info!(addr = %local, "shared IPP listener started");

        let shutdown = Arc::clone(&self.shutdown);
        let handler = self.handler.clone();
        let active = Arc::clone(&self.active_connections);
        self.task = Some(tokio::spawn(async move {
            accept_loop(listener, shutdown, handler, Binding::Shared, active).await;
        }));
        self.status = ServerStatus::Running;
        Ok(())
    }

    /// Stop accepting and wait for the loop to exit.
    pub async fn stop(&mut self) -> Result<()> {
        if self.status != ServerStatus::Running {
            return Ok(());
        }
        self.shutdown.notify_one();
        if let Some(handle) = self.task.take() {
            handle
                .await
                .map_err(|e| SpoolwerkError::Listener(format!("task join: {e}")))?;
        }
        self.status = ServerStatus::Stopped;
        info!(addr = ?self.local_addr, "shared IPP listener stopped");
        Ok(())
    }
}
