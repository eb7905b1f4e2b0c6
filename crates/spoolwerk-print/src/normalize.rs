// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Payload normalizer.
//
// Classifies a spooled payload by its leading signature bytes.  Printer-ready
// formats pass through untouched; plain text is wrapped in a printer control
// language picked from the device's model string and re-encoded as Latin-1.

use tracing::{debug, info, warn};

use crate::wire;

/// Bytes inspected when deciding whether a payload is text.
const TEXT_SAMPLE_LEN: usize = 200;

/// Nested protocol frames followed before giving up.
const MAX_EMBED_DEPTH: usize = 4;

const ESC: u8 = 0x1B;
const FORM_FEED: u8 = 0x0C;

/// What a payload looks like from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    PostScript,
    Pcl,
    Png,
    Jpeg,
    /// An IPP frame that reached the spool as a document.
    Ipp,
    Text,
    Binary,
    /// Too short to classify.
    Unknown,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "PDF",
            Self::PostScript => "PostScript",
            Self::Pcl => "PCL",
            Self::Png => "PNG",
            Self::Jpeg => "JPEG",
            Self::Ipp => "IPP",
            Self::Text => "TEXT",
            Self::Binary => "BINARY",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Control language used to wrap plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlProfile {
    /// HP PCL 5, the default.
    Pcl,
    /// Epson ESC/P.
    EscP,
}

impl ControlProfile {
    /// Pick a profile from a vendor/model string.
    pub fn for_model(model: Option<&str>) -> Self {
        match model {
            Some(m) if m.to_ascii_uppercase().contains("EPSON") => Self::EscP,
            _ => Self::Pcl,
        }
    }

    /// Leading reset sequence.
    pub fn reset(&self) -> &'static [u8] {
        match self {
            Self::Pcl => b"\x1bE",
            Self::EscP => b"\x1b@",
        }
    }
}

/// Result of running the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub bytes: Vec<u8>,
    /// Format detected at the top level.
    pub format: DocumentFormat,
    /// Whether the bytes differ from the input.
    pub converted: bool,
}

/// Classify `data` by signature.
pub fn classify(data: &[u8]) -> DocumentFormat {
    if data.len() < 4 {
        return DocumentFormat::Unknown;
    }
    if data.starts_with(b"%PDF") {
        return DocumentFormat::Pdf;
    }
    if data.starts_with(b"%!") {
        return DocumentFormat::PostScript;
    }
    if data[0] == ESC && (data[1] == b'E' || data[1] == b'&') {
        return DocumentFormat::Pcl;
    }
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        return DocumentFormat::Png;
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return DocumentFormat::Jpeg;
    }
    if data.len() >= 8 && (0x01..=0x02).contains(&data[0]) {
        return DocumentFormat::Ipp;
    }

    let sample = &data[..data.len().min(TEXT_SAMPLE_LEN)];
    let printable = sample.iter().filter(|&&b| is_text_byte(b)).count();
    let threshold = (TEXT_SAMPLE_LEN as f64 * 0.9).min(data.len() as f64 * 0.9);
    if printable as f64 > threshold {
        DocumentFormat::Text
    } else {
        DocumentFormat::Binary
    }
}

/// Printable ASCII, common whitespace, or any byte of a multi-byte sequence.
fn is_text_byte(b: u8) -> bool {
    (32..127).contains(&b) || matches!(b, b'\t' | b'\n' | b'\r') || b & 0x80 != 0
}

/// Turn a spooled payload into bytes a printer can consume directly.
pub fn normalize(data: &[u8], model: Option<&str>) -> Normalized {
    let format = classify(data);
    let bytes = normalize_at_depth(data, format, model, 0);
    let converted = bytes != data;
    if converted {
        info!(
            format = format.as_str(),
            before = data.len(),
            after = bytes.len(),
            "payload normalized"
        );
    } else {
        debug!(format = format.as_str(), "payload already printer-ready");
    }
    Normalized {
        bytes,
        format,
        converted,
    }
}

fn normalize_at_depth(
    data: &[u8],
    format: DocumentFormat,
    model: Option<&str>,
    depth: usize,
) -> Vec<u8> {
    match format {
        DocumentFormat::Text => text_to_control_language(data, ControlProfile::for_model(model)),
        DocumentFormat::Ipp if depth < MAX_EMBED_DEPTH => match extract_embedded(data) {
            Some(inner) => {
                let inner_format = classify(inner);
                debug!(
                    inner = inner_format.as_str(),
                    offset = data.len() - inner.len(),
                    "document found inside protocol frame"
                );
                normalize_at_depth(inner, inner_format, model, depth + 1)
            }
            None => {
                warn!(bytes = data.len(), "protocol frame without a document -- forwarding as-is");
                data.to_vec()
            }
        },
        _ => data.to_vec(),
    }
}

/// Locate a real document inside an IPP frame.
///
/// A frame that parses cleanly yields its trailing document data.  Otherwise
/// the buffer is scanned for the first known document signature.
fn extract_embedded(data: &[u8]) -> Option<&[u8]> {
    if let Ok(request) = wire::parse_ipp_request(data) {
        if !request.document_data.is_empty() {
            let start = data.len() - request.document_data.len();
            return Some(&data[start..]);
        }
    }

    const SIGNATURES: [&[u8]; 6] = [
        b"%PDF",
        b"%!",
        b"\x1b%-12345X",
        b"\x1bE",
        &[0x89, b'P', b'N', b'G'],
        &[0xFF, 0xD8, 0xFF],
    ];
    SIGNATURES
        .iter()
        .filter_map(|sig| {
            data.get(1..)
                .and_then(|rest| wire::find_subsequence(rest, sig))
                .map(|pos| pos + 1)
        })
        .min()
        .map(|start| &data[start..])
}

/// Wrap plain text in the given control language.
pub fn text_to_control_language(text: &[u8], profile: ControlProfile) -> Vec<u8> {
    let body = encode_latin1(text);
    let mut out = Vec::with_capacity(body.len() + 48);

    match profile {
        ControlProfile::Pcl => {
            out.extend_from_slice(profile.reset());
            // ISO 8859-1 symbol set
            out.extend_from_slice(b"\x1b(9U");
            // portrait
            out.extend_from_slice(b"\x1b&l0O");
            // A4
            out.extend_from_slice(b"\x1b&l26A");
            // top margin
            out.extend_from_slice(b"\x1b&l5E");
            // Courier 12 pitch, 10 point
            out.extend_from_slice(b"\x1b(s0p12h10v0s0b3T");
        }
        ControlProfile::EscP => {
            out.extend_from_slice(profile.reset());
            // Latin-1 character table
            out.extend_from_slice(&[ESC, b'R', 3]);
            out.extend_from_slice(&[ESC, b'(', b't', 3, 0, 0, 13]);
            // 1/6 inch line spacing
            out.extend_from_slice(&[ESC, b'2']);
        }
    }

    out.extend_from_slice(&body);
    out.push(FORM_FEED);
    out
}

/// Re-encode text as ISO 8859-1.
///
/// Valid UTF-8 is transcoded, with characters outside Latin-1 replaced by
/// `?`.  Input that is not UTF-8 is assumed to already be single-byte.
pub fn encode_latin1(text: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(text) {
        Ok(s) => s
            .chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect(),
        Err(_) => text.to_vec(),
    }
}
