//! Client-side HTTP Upgrade handshake (RFC 6455 Section 4) and
//! permessage-deflate negotiation (RFC 7692 Section 7).

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::codec::deflate::DeflateParams;
use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// The GUID appended to the key in the Sec-WebSocket-Accept calculation.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MIN_WINDOW_BITS: u8 = 8;
const MAX_WINDOW_BITS: u8 = 15;
const DEFAULT_WINDOW_BITS: u8 = 15;

/// Computes the Sec-WebSocket-Accept value for a Sec-WebSocket-Key:
/// Base64(SHA-1(key + GUID)).
///
/// # Example
///
/// ```
/// use wscl::protocol::handshake::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a fresh 16-byte nonce, base64-encoded, for Sec-WebSocket-Key.
#[must_use]
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    if getrandom::getrandom(&mut nonce).is_err() {
        // The key only has to be fresh per connection, not secret.
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0x5DEECE66D);
        nonce.copy_from_slice(&(nanos as u128).to_le_bytes());
    }
    BASE64.encode(nonce)
}

/// Find the end of the HTTP response head in `buf`.
///
/// Returns the index one past the blank-line terminator (`\r\n\r\n`) when
/// the head is complete.
#[must_use]
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// State for one client upgrade attempt: the generated key and the request
/// derived from it.
#[derive(Debug)]
pub struct ClientHandshake {
    key: String,
}

impl ClientHandshake {
    /// Start a handshake with a freshly generated key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: generate_key(),
        }
    }

    /// Build the HTTP/1.1 upgrade request for `cfg`.
    #[must_use]
    pub fn request(&self, cfg: &ClientConfig) -> String {
        let mut req = String::with_capacity(256);
        req.push_str(&format!("GET {} HTTP/1.1\r\n", cfg.request_uri));
        req.push_str(&format!("Host: {}\r\n", cfg.host_port()));
        req.push_str("Upgrade: websocket\r\n");
        req.push_str("Connection: Upgrade\r\n");
        req.push_str(&format!("Sec-WebSocket-Key: {}\r\n", self.key));
        req.push_str("Sec-WebSocket-Version: 13\r\n");
        for (name, value) in &cfg.headers {
            req.push_str(&format!("{name}: {value}\r\n"));
        }
        if cfg.compression {
            req.push_str("Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n");
        }
        req.push_str("\r\n");
        req
    }

    /// The accept value the server must echo for this key.
    #[must_use]
    pub fn expected_accept(&self) -> String {
        compute_accept_key(&self.key)
    }

    /// Validate the server's 101 response against this handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the status is not 101, the `Upgrade`
    /// or `Connection` headers are missing or wrong, or the accept value
    /// does not match.
    pub fn verify(&self, response: &HandshakeResponse) -> Result<()> {
        if response.status != 101 {
            return Err(Error::Handshake(format!(
                "expected status 101, got {}",
                response.status
            )));
        }

        let upgrade = response
            .header("upgrade")
            .ok_or_else(|| Error::Handshake("missing Upgrade header".into()))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::Handshake(format!("invalid Upgrade header: {upgrade}")));
        }

        let connection = response
            .header("connection")
            .ok_or_else(|| Error::Handshake("missing Connection header".into()))?;
        if !connection.to_ascii_lowercase().contains("upgrade") {
            return Err(Error::Handshake(format!(
                "invalid Connection header: {connection}"
            )));
        }

        let accept = response
            .header("sec-websocket-accept")
            .ok_or_else(|| Error::Handshake("missing Sec-WebSocket-Accept header".into()))?;
        if accept != self.expected_accept() {
            return Err(Error::Handshake("Sec-WebSocket-Accept mismatch".into()));
        }

        Ok(())
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed HTTP/1.1 response head.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    /// Status code from the status line.
    pub status: u16,
    /// Headers with lowercase names and trimmed values.
    headers: HashMap<String, String>,
}

impl HandshakeResponse {
    /// Parse a complete response head (through the blank line).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] for non-UTF-8 data or a malformed
    /// status line.
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| Error::Handshake("response head is not UTF-8".into()))?;

        let mut lines = text.lines();
        let status_line = lines
            .next()
            .ok_or_else(|| Error::Handshake("empty response".into()))?;

        // "HTTP/1.1 101 Switching Protocols"
        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| Error::Handshake("missing HTTP version".into()))?;
        if !version.starts_with("HTTP/1.1") {
            return Err(Error::Handshake(format!(
                "unexpected HTTP version: {version}"
            )));
        }
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Handshake(format!("bad status line: {status_line}")))?;

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Ok(Self { status, headers })
    }

    /// Look up a header by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// A single `name[=value]` parameter of an extension offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    /// Parameter name.
    pub name: String,
    /// Value, absent for flag parameters.
    pub value: Option<String>,
}

impl ExtensionParam {
    fn parse(s: &str) -> Self {
        match s.split_once('=') {
            Some((name, value)) => Self {
                name: name.trim().to_string(),
                value: Some(value.trim().trim_matches('"').to_string()),
            },
            None => Self {
                name: s.trim().to_string(),
                value: None,
            },
        }
    }
}

/// One extension offer from a Sec-WebSocket-Extensions header: a token with
/// optional `; name[=value]` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension token (e.g. `permessage-deflate`).
    pub name: String,
    /// Parameters in header order.
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    /// Parse a comma-separated Sec-WebSocket-Extensions value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] for an empty extension token.
    pub fn parse_header(value: &str) -> Result<Vec<Self>> {
        value
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(';');
        let name = parts.next().unwrap_or_default().trim().to_string();
        if name.is_empty() {
            return Err(Error::Handshake("empty extension token".into()));
        }
        let params = parts.map(ExtensionParam::parse).collect();
        Ok(Self { name, params })
    }
}

fn parse_window_bits(value: Option<&str>) -> Result<u8> {
    match value {
        None => Ok(DEFAULT_WINDOW_BITS),
        Some(s) => {
            let bits: u8 = s
                .parse()
                .map_err(|_| Error::Handshake(format!("invalid window bits: {s}")))?;
            if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
                return Err(Error::Handshake(format!(
                    "window bits must be {MIN_WINDOW_BITS}-{MAX_WINDOW_BITS}, got {bits}"
                )));
            }
            Ok(bits)
        }
    }
}

/// Interpret the server's Sec-WebSocket-Extensions header.
///
/// Returns the negotiated parameters when the server accepted our
/// permessage-deflate offer, `None` when the header is absent or empty.
///
/// # Errors
///
/// Returns [`Error::Handshake`] when the server accepts an extension we did
/// not offer, names an unknown extension, repeats the offer, or supplies an
/// unknown or out-of-range parameter.
pub fn negotiate_deflate(
    response: &HandshakeResponse,
    requested: bool,
) -> Result<Option<DeflateParams>> {
    let Some(value) = response.header("sec-websocket-extensions") else {
        return Ok(None);
    };

    let offers = ExtensionOffer::parse_header(value)?;
    if offers.is_empty() {
        return Ok(None);
    }

    let mut negotiated: Option<DeflateParams> = None;
    for offer in offers {
        if offer.name != "permessage-deflate" {
            return Err(Error::Handshake(format!(
                "server selected unsupported extension: {}",
                offer.name
            )));
        }
        if !requested {
            return Err(Error::Handshake(
                "server enabled permessage-deflate without an offer".into(),
            ));
        }
        if negotiated.is_some() {
            return Err(Error::Handshake(
                "duplicate permessage-deflate in response".into(),
            ));
        }

        let mut params = DeflateParams::default();
        for param in &offer.params {
            match param.name.as_str() {
                "server_no_context_takeover" => params.server_no_context_takeover = true,
                "client_no_context_takeover" => params.client_no_context_takeover = true,
                "server_max_window_bits" => {
                    params.server_max_window_bits = parse_window_bits(param.value.as_deref())?;
                }
                "client_max_window_bits" => {
                    params.client_max_window_bits = parse_window_bits(param.value.as_deref())?;
                }
                unknown => {
                    return Err(Error::Handshake(format!(
                        "unknown permessage-deflate parameter: {unknown}"
                    )));
                }
            }
        }
        negotiated = Some(params);
    }

    Ok(negotiated)
}
