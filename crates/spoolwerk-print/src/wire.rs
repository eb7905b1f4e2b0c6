// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPP subset wire codec shared by the shared-port and dedicated-port
// listeners.
//
// # Framing
//
// Requests and responses use the RFC 8010 binary encoding.  Clients may wrap
// the IPP body in an HTTP POST envelope or send it bare over TCP.  Any stream
// whose first byte is not a plausible IPP major version is not IPP at all:
// it is a raw document that a client pushed at the printer port, and it is
// forwarded as-is rather than rejected.
//
// # Recognised operations
//
//   - Print-Job              (0x0002)
//   - Cancel-Job             (0x0008)
//   - Get-Jobs               (0x000A)
//   - Get-Printer-Attributes (0x000B)
//   - CUPS-Get-Printers      (0x4002)  lists every device

use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Tags (RFC 8010 section 3.5)
// ---------------------------------------------------------------------------

// Group delimiters. Any tag below 0x10 opens a group or ends the header.
pub const TAG_OPERATION_ATTRIBUTES: u8 = 0x01;
pub const TAG_JOB_ATTRIBUTES: u8 = 0x02;
pub const TAG_END_OF_ATTRIBUTES: u8 = 0x03;
pub const TAG_PRINTER_ATTRIBUTES: u8 = 0x04;
const MAX_DELIMITER_TAG: u8 = 0x0F;

// Value tags. Integers and enums are 4-byte big-endian, booleans 1 byte,
// everything else is a length-prefixed string.
pub const VALUE_TAG_INTEGER: u8 = 0x21;
pub const VALUE_TAG_BOOLEAN: u8 = 0x22;
pub const VALUE_TAG_ENUM: u8 = 0x23;
pub const VALUE_TAG_TEXT: u8 = 0x41;
pub const VALUE_TAG_NAME: u8 = 0x42;
pub const VALUE_TAG_KEYWORD: u8 = 0x44;
pub const VALUE_TAG_URI: u8 = 0x45;
pub const VALUE_TAG_CHARSET: u8 = 0x47;
pub const VALUE_TAG_NATURAL_LANGUAGE: u8 = 0x48;
pub const VALUE_TAG_MIME_MEDIA_TYPE: u8 = 0x49;

// ---------------------------------------------------------------------------
// Operation ids
// ---------------------------------------------------------------------------

pub const OP_PRINT_JOB: u16 = 0x0002;
pub const OP_CANCEL_JOB: u16 = 0x0008;
pub const OP_GET_JOBS: u16 = 0x000A;
pub const OP_GET_PRINTER_ATTRIBUTES: u16 = 0x000B;
/// CUPS-Get-Printers, used here as "list devices".
pub const OP_LIST_DEVICES: u16 = 0x4002;

// ---------------------------------------------------------------------------
// Status codes (RFC 8011 SS4.1.8)
// ---------------------------------------------------------------------------

pub const STATUS_OK: u16 = 0x0000;
pub const STATUS_CLIENT_ERROR_BAD_REQUEST: u16 = 0x0400;
pub const STATUS_CLIENT_ERROR_NOT_FOUND: u16 = 0x0406;
pub const STATUS_CLIENT_ERROR_REQUEST_ENTITY_TOO_LARGE: u16 = 0x0409;
pub const STATUS_SERVER_ERROR_INTERNAL: u16 = 0x0500;
pub const STATUS_SERVER_ERROR_OPERATION_NOT_SUPPORTED: u16 = 0x0501;

// ---------------------------------------------------------------------------
// State enums
// ---------------------------------------------------------------------------

/// Job is queued, waiting for the dispatcher.
pub const JOB_STATE_PENDING: i32 = 3;

/// Job is being delivered.
pub const JOB_STATE_PROCESSING: i32 = 5;

/// Printer is idle and accepting work.
pub const PRINTER_STATE_IDLE: i32 = 3;

/// Version written when there is no request to echo.
pub const IPP_VERSION_MAJOR: u8 = 0x01;
pub const IPP_VERSION_MINOR: u8 = 0x01;

/// Fixed success reply for connections that send nothing at all.
///
/// Clients probe printer ports by connecting and closing; they expect a
/// well-formed IPP 1.1 successful-ok with request-id 1.
pub const PROBE_OK_FRAME: [u8; 9] = [0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x03];

/// Whether a leading byte can start an IPP frame (versions 1.x through 3.x).
pub fn is_plausible_version(major: u8) -> bool {
    (1..=3).contains(&major)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One attribute as it appeared on the wire. Additional values of a
/// multi-valued attribute carry an empty name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppAttribute {
    pub value_tag: u8,
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppAttributeGroup {
    pub delimiter: u8,
    pub attributes: Vec<IppAttribute>,
}

impl IppAttributeGroup {
    pub fn get(&self, name: &str) -> Option<&IppAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Value of `name` if it is valid UTF-8.
    pub fn get_string(&self, name: &str) -> Option<String> {
        let attr = self.get(name)?;
        std::str::from_utf8(&attr.value).ok().map(str::to_owned)
    }

    /// Value of `name` if it is exactly four bytes wide.
    pub fn get_integer(&self, name: &str) -> Option<i32> {
        let attr = self.get(name)?;
        <[u8; 4]>::try_from(attr.value.as_slice())
            .ok()
            .map(i32::from_be_bytes)
    }
}

/// A decoded IPP message.
///
/// Responses share the layout, with the status code in `operation_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppRequest {
    pub version_major: u8,
    pub version_minor: u8,
    /// Operation id for requests, status code for responses.
    pub operation_id: u16,
    pub request_id: u32,
    pub attribute_groups: Vec<IppAttributeGroup>,
    /// Bytes after the end-of-attributes tag.
    pub document_data: Vec<u8>,
}

impl IppRequest {
    pub fn operation_attributes(&self) -> Option<&IppAttributeGroup> {
        self.group(TAG_OPERATION_ATTRIBUTES)
    }

    /// First group carrying the given delimiter.
    pub fn group(&self, delimiter: u8) -> Option<&IppAttributeGroup> {
        self.groups(delimiter).next()
    }

    /// Every group carrying the given delimiter, in order.
    pub fn groups(&self, delimiter: u8) -> impl Iterator<Item = &IppAttributeGroup> {
        self.attribute_groups
            .iter()
            .filter(move |g| g.delimiter == delimiter)
    }

    /// First string value for `name` across the operation and job groups.
    pub fn string_attr(&self, name: &str) -> Option<String> {
        self.attribute_groups
            .iter()
            .filter(|g| g.delimiter == TAG_OPERATION_ATTRIBUTES || g.delimiter == TAG_JOB_ATTRIBUTES)
            .find_map(|g| g.get_string(name))
            .filter(|s| !s.trim().is_empty())
    }

    /// The target device name, taken from the last path segment of
    /// `printer-uri` (or `job-printer-uri`).
    pub fn printer_name(&self) -> Option<String> {
        self.string_attr("printer-uri")
            .or_else(|| self.string_attr("job-printer-uri"))
            .and_then(|uri| printer_name_from_uri(&uri))
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Bounds-checked reader over a message body.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, what: &str) -> std::result::Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| format!("truncated {what} at offset {}", self.pos))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u16(&mut self, what: &str) -> std::result::Result<u16, String> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// A u16 length followed by that many bytes.
    fn prefixed(&mut self, what: &str) -> std::result::Result<&'a [u8], String> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// Decode an RFC 8010 message: an 8-byte header (version, operation or
/// status, request id), tagged attribute groups, then the document.
///
/// A header that never reaches the end-of-attributes tag is malformed.
pub fn parse_ipp_request(data: &[u8]) -> std::result::Result<IppRequest, String> {
    if data.len() < 8 {
        return Err(format!("IPP header needs 8 bytes, got {}", data.len()));
    }
    let mut cursor = Cursor { data, pos: 8 };
    let mut groups: Vec<IppAttributeGroup> = Vec::new();

    loop {
        let Some(tag) = cursor.peek() else {
            return Err("missing end-of-attributes tag".into());
        };
        cursor.pos += 1;

        if tag == TAG_END_OF_ATTRIBUTES {
            break;
        }
        if tag <= MAX_DELIMITER_TAG {
            groups.push(IppAttributeGroup {
                delimiter: tag,
                attributes: Vec::new(),
            });
            continue;
        }

        let name = String::from_utf8_lossy(cursor.prefixed("attribute name")?).into_owned();
        let value = cursor.prefixed("attribute value")?.to_vec();
        match groups.last_mut() {
            Some(group) => group.attributes.push(IppAttribute {
                value_tag: tag,
                name,
                value,
            }),
            None => warn!(attribute = %name, "IPP attribute before any group, discarded"),
        }
    }

    Ok(IppRequest {
        version_major: data[0],
        version_minor: data[1],
        operation_id: u16::from_be_bytes([data[2], data[3]]),
        request_id: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        attribute_groups: groups,
        document_data: cursor.rest().to_vec(),
    })
}

/// Last non-empty path segment of a printer URI, with `_` standing in for
/// spaces the way published URIs encode aliases.
///
/// `ipp://host:631/printers/Office_Laser` yields `Office_Laser`; callers try
/// both spellings against the device table.
pub fn printer_name_from_uri(uri: &str) -> Option<String> {
    let without_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let path = without_scheme.split_once('/').map(|(_, p)| p)?;
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(percent_decode)
}

/// Decode `%XX` escapes; malformed escapes are kept verbatim.
fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &bytes[i + 1..i + 3];
            if hex.iter().all(u8::is_ascii_hexdigit) {
                let hi = (hex[0] as char).to_digit(16).unwrap_or(0) as u8;
                let lo = (hex[1] as char).to_digit(16).unwrap_or(0) as u8;
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Incremental writer for response messages.
pub struct IppResponseBuilder {
    buf: Vec<u8>,
}

impl IppResponseBuilder {
    /// IPP/1.1 header.
    pub fn new(status_code: u16, request_id: u32) -> Self {
        Self::with_version(IPP_VERSION_MAJOR, IPP_VERSION_MINOR, status_code, request_id)
    }

    pub fn with_version(major: u8, minor: u8, status_code: u16, request_id: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&[major, minor]);
        buf.extend_from_slice(&status_code.to_be_bytes());
        buf.extend_from_slice(&request_id.to_be_bytes());
        Self { buf }
    }

    /// Response to `request`, echoing its version and request-id.
    pub fn reply_to(request: &IppRequest, status_code: u16) -> Self {
        Self::with_version(
            request.version_major,
            request.version_minor,
            status_code,
            request.request_id,
        )
    }

    /// Open the operation group with the mandatory charset and language pair.
    pub fn operation_group(&mut self, status_message: &str) -> &mut Self {
        self.begin_group(TAG_OPERATION_ATTRIBUTES)
            .charset("attributes-charset", "utf-8")
            .natural_language("attributes-natural-language", "en")
            .text("status-message", status_message)
    }

    pub fn begin_group(&mut self, delimiter: u8) -> &mut Self {
        self.buf.push(delimiter);
        self
    }

    pub fn text(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_TEXT, name, value.as_bytes())
    }

    pub fn name_attr(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_NAME, name, value.as_bytes())
    }

    pub fn keyword(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_KEYWORD, name, value.as_bytes())
    }

    /// Another value for the attribute written just before.
    pub fn additional(&mut self, value_tag: u8, value: &str) -> &mut Self {
        self.write_attr(value_tag, "", value.as_bytes())
    }

    pub fn uri(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_URI, name, value.as_bytes())
    }

    pub fn charset(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_CHARSET, name, value.as_bytes())
    }

    pub fn natural_language(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_NATURAL_LANGUAGE, name, value.as_bytes())
    }

    pub fn mime_type(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_attr(VALUE_TAG_MIME_MEDIA_TYPE, name, value.as_bytes())
    }

    pub fn integer(&mut self, name: &str, value: i32) -> &mut Self {
        self.write_attr(VALUE_TAG_INTEGER, name, &value.to_be_bytes())
    }

    pub fn enum_attr(&mut self, name: &str, value: i32) -> &mut Self {
        self.write_attr(VALUE_TAG_ENUM, name, &value.to_be_bytes())
    }

    pub fn boolean(&mut self, name: &str, value: bool) -> &mut Self {
        self.write_attr(VALUE_TAG_BOOLEAN, name, &[u8::from(value)])
    }

    /// Names and values longer than a u16 length field are truncated.
    pub fn write_attr(&mut self, value_tag: u8, name: &str, value: &[u8]) -> &mut Self {
        self.buf.push(value_tag);
        for field in [name.as_bytes(), value] {
            let field = &field[..field.len().min(u16::MAX as usize)];
            self.buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
            self.buf.extend_from_slice(field);
        }
        self
    }

    /// Close the header and return the encoded message.
    pub fn build(mut self) -> Vec<u8> {
        self.buf.push(TAG_END_OF_ATTRIBUTES);
        self.buf
    }
}

/// Status-only response with the standard operation group.
pub fn build_status_response(request: &IppRequest, status: u16, message: &str) -> Vec<u8> {
    let mut resp = IppResponseBuilder::reply_to(request, status);
    resp.operation_group(message);
    resp.build()
}

/// Status response for streams that carried no usable request header.
pub fn build_bare_status(status: u16, message: &str) -> Vec<u8> {
    let mut resp = IppResponseBuilder::new(status, 1);
    resp.operation_group(message);
    resp.build()
}

// ---------------------------------------------------------------------------
// Minimal HTTP envelope
// ---------------------------------------------------------------------------

/// How an HTTP body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Length(usize),
    Chunked,
    /// Neither header present: the body runs to end of stream.
    UntilClose,
}

/// Body location inside an HTTP POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpEnvelope {
    pub framing: BodyFraming,
    pub body_offset: usize,
}

/// Locate the body of an HTTP POST carrying IPP.
///
/// Anything that does not open with a POST request line is not wrapped, and
/// the whole stream is IPP or document bytes. `Transfer-Encoding: chunked`
/// takes precedence over `Content-Length`.
pub fn parse_http_envelope(data: &[u8]) -> Option<HttpEnvelope> {
    if !data.starts_with(b"POST ") {
        return None;
    }
    let header_end = find_subsequence(data, b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&data[..header_end]);
    let header = |name: &str| {
        head.split("\r\n")
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim().to_ascii_lowercase())
    };

    let chunked = header("transfer-encoding")
        .is_some_and(|te| te.split(',').any(|coding| coding.trim() == "chunked"));
    let framing = if chunked {
        BodyFraming::Chunked
    } else {
        match header("content-length").and_then(|len| len.parse().ok()) {
            Some(len) => BodyFraming::Length(len),
            None => BodyFraming::UntilClose,
        }
    };

    Some(HttpEnvelope {
        framing,
        body_offset: header_end + 4,
    })
}

/// Progress through a chunked body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// The terminating zero-size chunk and trailer were seen.
    Complete,
    /// More bytes are needed.
    Partial,
    Malformed,
}

/// Longest chunk-size line accepted, extensions included.
const MAX_CHUNK_LINE: usize = 1024;

/// Walk a chunked body, handing each chunk's data to `sink`.
fn walk_chunks(body: &[u8], mut sink: impl FnMut(&[u8])) -> ChunkState {
    let mut pos = 0;
    loop {
        let rest = &body[pos..];
        let Some(line_end) = find_subsequence(rest, b"\r\n") else {
            return if rest.len() > MAX_CHUNK_LINE {
                ChunkState::Malformed
            } else {
                ChunkState::Partial
            };
        };
        let line = String::from_utf8_lossy(&rest[..line_end]);
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let Ok(size) = usize::from_str_radix(size_field, 16) else {
            return ChunkState::Malformed;
        };
        let data_start = pos + line_end + 2;

        if size == 0 {
            // Optional trailer fields, then an empty line.
            let trailer = &body[data_start..];
            if trailer.starts_with(b"\r\n") || find_subsequence(trailer, b"\r\n\r\n").is_some() {
                return ChunkState::Complete;
            }
            return ChunkState::Partial;
        }

        let Some(data_end) = data_start.checked_add(size) else {
            return ChunkState::Malformed;
        };
        if body.len() < data_end + 2 {
            return ChunkState::Partial;
        }
        if &body[data_end..data_end + 2] != b"\r\n" {
            return ChunkState::Malformed;
        }
        sink(&body[data_start..data_end]);
        pos = data_end + 2;
    }
}

/// Where a chunked body stands, without copying it.
pub fn chunked_state(body: &[u8]) -> ChunkState {
    walk_chunks(body, |_| {})
}

/// Reassemble a complete chunked body.
pub fn decode_chunked(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    match walk_chunks(body, |chunk| out.extend_from_slice(chunk)) {
        ChunkState::Complete => Some(out),
        ChunkState::Partial | ChunkState::Malformed => None,
    }
}

/// Whether `data` holds a whole HTTP request, so reading can stop.
pub fn http_request_complete(data: &[u8]) -> bool {
    let Some(envelope) = parse_http_envelope(data) else {
        return false;
    };
    let body = &data[envelope.body_offset..];
    match envelope.framing {
        BodyFraming::Length(len) => body.len() >= len,
        BodyFraming::Chunked => chunked_state(body) != ChunkState::Partial,
        BodyFraming::UntilClose => false,
    }
}

pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Wrap an IPP body in a minimal `HTTP/1.1 200 OK`.
pub fn wrap_http_response(ipp_body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/ipp\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        ipp_body.len()
    )
    .into_bytes();
    out.extend_from_slice(ipp_body);
    out
}

/// Body-less HTTP error reply, e.g. `413 Payload Too Large`.
pub fn http_error_response(code: u16, reason: &str) -> Vec<u8> {
    format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").into_bytes()
}

// ---------------------------------------------------------------------------
// Inbound classification
// ---------------------------------------------------------------------------

/// What a client connection turned out to carry.
///
/// `http` records whether the payload arrived in an HTTP envelope, so the
/// reply can be wrapped the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The client connected and sent nothing.
    Probe,
    Ipp { request: IppRequest, http: bool },
    /// Protocol-less document bytes.
    Raw { bytes: Vec<u8>, http: bool },
    /// An HTTP POST whose chunked body is cut short or garbled.
    BadHttp,
}

/// Classify a fully-read client stream.
///
/// Streams without a plausible version pair, and plausible-looking streams
/// that fail to parse, both fall back to raw forwarding.
pub fn classify_inbound(data: Vec<u8>) -> Inbound {
    if data.is_empty() {
        return Inbound::Probe;
    }

    let (body, http) = match parse_http_envelope(&data) {
        Some(envelope) => {
            let rest = &data[envelope.body_offset..];
            let body = match envelope.framing {
                BodyFraming::Length(len) => rest[..len.min(rest.len())].to_vec(),
                BodyFraming::UntilClose => rest.to_vec(),
                BodyFraming::Chunked => match decode_chunked(rest) {
                    Some(body) => body,
                    None => {
                        warn!(bytes = rest.len(), "chunked HTTP body is incomplete or malformed");
                        return Inbound::BadHttp;
                    }
                },
            };
            (body, true)
        }
        None => (data, false),
    };

    if body.len() < 8 || !is_plausible_version(body[0]) {
        debug!(
            bytes = body.len(),
            first = body.first().copied(),
            "no IPP header -- treating stream as raw document"
        );
        return Inbound::Raw { bytes: body, http };
    }

    match parse_ipp_request(&body) {
        Ok(request) => Inbound::Ipp { request, http },
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "malformed IPP frame -- forwarding raw bytes");
            Inbound::Raw { bytes: body, http }
        }
    }
}
