// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SNMPv1 sysDescr queries and printer-description heuristics.
//
// Only one request shape is ever needed: a GetRequest for
// sysDescr.0 (1.3.6.1.2.1.1.1.0).  The BER encoding is small enough to
// build and walk by hand.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use super::DescriptionSource;

pub const SNMP_PORT: u16 = 161;

/// BER-encoded OID 1.3.6.1.2.1.1.1.0 (sysDescr.0), without tag and length.
const SYS_DESCR_OID: [u8; 8] = [0x2B, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00];

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_GET_REQUEST: u8 = 0xA0;
const TAG_GET_RESPONSE: u8 = 0xA2;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Words that mark a description as a general-purpose computer.
const COMPUTER_WORDS: &[&str] = &[
    "ubuntu", "debian", "linux", "windows", "macos", "darwin", "pc", "workstation", "laptop",
    "desktop", "computer", "server",
];

/// Fragments that mark a computer even inside a longer word.
const COMPUTER_FRAGMENTS: &[&str] = &["cups/", "operating system"];

const PRINTER_WORDS: &[&str] = &[
    "printer", "impresora", "hp", "canon", "epson", "brother", "xerox", "ricoh", "samsung",
    "kyocera", "lexmark", "dell", "jetdirect", "laserjet", "deskjet", "officejet", "colorqube",
    "phaser", "workforce", "laserwriter",
];

/// Vendors whose name, followed by the next word, makes a usable model.
const VENDORS: &[&str] = &[
    "hp", "canon", "epson", "brother", "xerox", "ricoh", "samsung", "kyocera", "lexmark",
];

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn push_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = (len as u32).to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (4 - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    push_length(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

fn integer(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    // Drop redundant leading bytes while keeping the sign bit intact.
    let mut start = 0;
    while start < 3
        && ((bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0))
    {
        start += 1;
    }
    tlv(TAG_INTEGER, &bytes[start..])
}

/// Encode an SNMPv1 GetRequest for sysDescr.0.
pub fn encode_get_sys_descr(community: &str, request_id: i32) -> Vec<u8> {
    let varbind = tlv(
        TAG_SEQUENCE,
        &[tlv(TAG_OID, &SYS_DESCR_OID), tlv(TAG_NULL, &[])].concat(),
    );
    let pdu = tlv(
        TAG_GET_REQUEST,
        &[
            integer(request_id),
            integer(0),
            integer(0),
            tlv(TAG_SEQUENCE, &varbind),
        ]
        .concat(),
    );
    tlv(
        TAG_SEQUENCE,
        &[integer(0), tlv(TAG_OCTET_STRING, community.as_bytes()), pdu].concat(),
    )
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Cursor over BER tag-length-value items.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Read one item, returning its tag and content.
    fn next(&mut self) -> Option<(u8, &'a [u8])> {
        let tag = *self.buf.get(self.pos)?;
        let first = *self.buf.get(self.pos + 1)?;
        let mut pos = self.pos + 2;
        let len = if first < 0x80 {
            first as usize
        } else {
            let n = (first & 0x7F) as usize;
            if n == 0 || n > 4 {
                return None;
            }
            let bytes = self.buf.get(pos..pos + n)?;
            pos += n;
            bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
        };
        let content = self.buf.get(pos..pos.checked_add(len)?)?;
        self.pos = pos + len;
        Some((tag, content))
    }

    fn tagged(&mut self, tag: u8) -> Option<&'a [u8]> {
        match self.next()? {
            (t, content) if t == tag => Some(content),
            _ => None,
        }
    }
}

fn decode_integer(content: &[u8]) -> Option<i64> {
    if content.is_empty() || content.len() > 8 {
        return None;
    }
    let negative = content[0] & 0x80 != 0;
    let init: i64 = if negative { -1 } else { 0 };
    Some(content.iter().fold(init, |acc, b| (acc << 8) | *b as i64))
}

/// Extract the sysDescr string from a GetResponse to `request_id`.
pub fn decode_sys_descr(packet: &[u8], request_id: i32) -> Option<String> {
    let message = Reader::new(packet).tagged(TAG_SEQUENCE)?;
    let mut message = Reader::new(message);
    message.tagged(TAG_INTEGER)?;
    message.tagged(TAG_OCTET_STRING)?;
    let mut pdu = Reader::new(message.tagged(TAG_GET_RESPONSE)?);

    if decode_integer(pdu.tagged(TAG_INTEGER)?)? != i64::from(request_id) {
        return None;
    }
    if decode_integer(pdu.tagged(TAG_INTEGER)?)? != 0 {
        return None;
    }
    pdu.tagged(TAG_INTEGER)?;

    let mut varbinds = Reader::new(pdu.tagged(TAG_SEQUENCE)?);
    let mut varbind = Reader::new(varbinds.tagged(TAG_SEQUENCE)?);
    if varbind.tagged(TAG_OID)? != SYS_DESCR_OID {
        return None;
    }
    let value = varbind.tagged(TAG_OCTET_STRING)?;
    Some(String::from_utf8_lossy(value).trim().to_string())
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Ask `ip` for its sysDescr. `None` on timeout or any malformed answer.
pub async fn query_sys_descr(ip: IpAddr, community: &str, timeout: Duration) -> Option<String> {
    let bind: SocketAddr = match ip {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let request_id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed) & 0x7FFF_FFFF;
    let request = encode_get_sys_descr(community, request_id);

    let exchange = async {
        let socket = UdpSocket::bind(bind).await.ok()?;
        socket.connect(SocketAddr::new(ip, SNMP_PORT)).await.ok()?;
        socket.send(&request).await.ok()?;
        let mut buf = vec![0u8; 2048];
        let n = socket.recv(&mut buf).await.ok()?;
        decode_sys_descr(&buf[..n], request_id)
    };

    let descr = tokio::time::timeout(timeout, exchange).await.ok().flatten();
    debug!(ip = %ip, found = descr.is_some(), "SNMP sysDescr query");
    descr
}

/// `DescriptionSource` backed by live SNMP queries.
#[derive(Debug, Clone)]
pub struct SnmpDescriber {
    pub community: String,
    pub timeout: Duration,
}

#[async_trait]
impl DescriptionSource for SnmpDescriber {
    async fn describe(&self, ip: IpAddr) -> Option<String> {
        query_sys_descr(ip, &self.community, self.timeout).await
    }
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Whether a system description belongs to a printer rather than a computer
/// that happens to share one.
pub fn is_printer_description(descr: &str) -> bool {
    let lower = descr.to_lowercase();
    if COMPUTER_FRAGMENTS.iter().any(|f| lower.contains(f)) {
        return false;
    }
    let mut is_printer = false;
    for word in words(descr) {
        if COMPUTER_WORDS.contains(&word.as_str()) {
            return false;
        }
        is_printer |= PRINTER_WORDS.contains(&word.as_str());
    }
    is_printer
}

/// Whether `descr` describes a printer sharing a vendor or model token with
/// `model`.
pub fn matches_model(descr: &str, model: &str) -> bool {
    if !is_printer_description(descr) {
        return false;
    }
    let descr_words: Vec<String> = words(descr).collect();
    words(model)
        .filter(|token| token.len() >= 2 && !token.chars().all(|c| c.is_ascii_digit()))
        .any(|token| descr_words.contains(&token))
}

/// A short model name taken from a printer description: the first vendor
/// word plus the word after it, as written.
pub fn model_from_description(descr: &str) -> Option<String> {
    let tokens: Vec<&str> = descr
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|t| !t.is_empty())
        .collect();
    let at = tokens
        .iter()
        .position(|t| VENDORS.contains(&t.to_lowercase().as_str()))?;
    Some(match tokens.get(at + 1) {
        Some(next) => format!("{} {next}", tokens[at]),
        None => tokens[at].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a GetResponse the way an agent would.
    fn response(request_id: i32, error_status: i32, descr: &str) -> Vec<u8> {
        let varbind = tlv(
            TAG_SEQUENCE,
            &[tlv(TAG_OID, &SYS_DESCR_OID), tlv(TAG_OCTET_STRING, descr.as_bytes())].concat(),
        );
        let pdu = tlv(
            TAG_GET_RESPONSE,
            &[
                integer(request_id),
                integer(error_status),
                integer(0),
                tlv(TAG_SEQUENCE, &varbind),
            ]
            .concat(),
        );
        tlv(
            TAG_SEQUENCE,
            &[integer(0), tlv(TAG_OCTET_STRING, b"public"), pdu].concat(),
        )
    }

    #[test]
    fn request_encoding_is_exact() {
        let packet = encode_get_sys_descr("public", 1);
        let expected: Vec<u8> = vec![
            0x30, 0x26, // message
            0x02, 0x01, 0x00, // version 1
            0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', // community
            0xA0, 0x19, // GetRequest
            0x02, 0x01, 0x01, // request id
            0x02, 0x01, 0x00, // error status
            0x02, 0x01, 0x00, // error index
            0x30, 0x0E, 0x30, 0x0C, // varbind list, varbind
            0x06, 0x08, 0x2B, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, // sysDescr.0
            0x05, 0x00, // NULL
        ];
        assert_eq!(packet, expected);
    }

    #[test]
    fn integers_use_minimal_twos_complement() {
        assert_eq!(integer(0), vec![0x02, 0x01, 0x00]);
        assert_eq!(integer(128), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer(-1), vec![0x02, 0x01, 0xFF]);
        assert_eq!(decode_integer(&[0x00, 0x80]), Some(128));
        assert_eq!(decode_integer(&[0xFF]), Some(-1));
    }

    #[test]
    fn long_lengths_round_trip() {
        let descr = "x".repeat(300);
        let packet = response(9, 0, &descr);
        assert_eq!(decode_sys_descr(&packet, 9).as_deref(), Some(descr.as_str()));
    }

    #[test]
    fn response_for_other_request_is_ignored() {
        let packet = response(9, 0, "HP LaserJet");
        assert!(decode_sys_descr(&packet, 10).is_none());
        assert!(decode_sys_descr(&response(9, 2, "HP LaserJet"), 9).is_none());
        assert!(decode_sys_descr(&packet[..packet.len() - 3], 9).is_none());
    }

    #[test]
    fn printer_heuristics() {
        assert!(is_printer_description(
            "HP ETHERNET MULTI-ENVIRONMENT,ROM none,JETDIRECT,JD153"
        ));
        assert!(is_printer_description("EPSON Built-in Network Interface"));
        assert!(!is_printer_description("Linux cups-host 6.1.0 x86_64"));
        assert!(!is_printer_description("CUPS/2.4 shared HP printer"));
        assert!(!is_printer_description("Cisco IOS Software"));
    }

    #[test]
    fn model_tokens_must_overlap() {
        let descr = "HP ETHERNET MULTI-ENVIRONMENT,JETDIRECT";
        assert!(matches_model(descr, "HP LaserJet M404dn"));
        assert!(!matches_model(descr, "EPSON WF-2850"));
        assert!(!matches_model("Windows Server 2019", "Windows"));
    }

    #[test]
    fn model_is_vendor_and_next_word() {
        assert_eq!(
            model_from_description("HP LaserJet M404dn,JETDIRECT").as_deref(),
            Some("HP LaserJet")
        );
        assert_eq!(model_from_description("Network EPSON").as_deref(), Some("EPSON"));
        assert!(model_from_description("JETDIRECT print server").is_none());
    }
}
