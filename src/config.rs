//! Client configuration: target URL, timeouts, headers, and compression.

use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::tls::TlsOptions;

/// Fixed capacity of the outgoing send queue.
pub const SEND_QUEUE_CAPACITY: usize = 1024;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Immutable-after-connect configuration of a client connection.
///
/// Built through the setters on
/// [`WebSocketClient`](crate::client::WebSocketClient) before `connect()`;
/// the I/O thread takes a snapshot at start and never re-reads it.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Target host (DNS name or IP literal).
    pub host: String,
    /// Target port (defaults to 80 for `ws`, 443 for `wss`).
    pub port: u16,
    /// Request target: path plus optional query string.
    pub request_uri: String,
    /// Whether the transport is TLS (`wss` scheme).
    pub secure: bool,
    /// Deadline covering TCP connect, TLS handshake and HTTP upgrade.
    pub connect_timeout: Duration,
    /// Interval between outgoing Pings; `None` disables the ping timer.
    pub ping_interval: Option<Duration>,
    /// Read-inactivity timeout; `None` disables it. Expiry closes the
    /// connection with abnormal-closure semantics (1006).
    pub read_timeout: Option<Duration>,
    /// How long to wait for the peer's Close after ours was sent.
    pub close_grace: Duration,
    /// Extra headers appended verbatim to the upgrade request.
    pub headers: Vec<(String, String)>,
    /// TLS options applied when `secure` is set.
    pub tls: TlsOptions,
    /// Whether to offer permessage-deflate during the handshake.
    pub compression: bool,
    /// Deflate level (0-9) used when compression is negotiated.
    pub compression_level: u32,
    /// Upper bound on a reassembled or inflated message.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            request_uri: "/".to_string(),
            secure: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_interval: None,
            read_timeout: None,
            close_grace: DEFAULT_CLOSE_GRACE,
            headers: Vec::new(),
            tls: TlsOptions::default(),
            compression: false,
            compression_level: 6,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create an empty configuration; a URL must be applied before use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `ws://` or `wss://` URL into host, port, request URI and the
    /// secure flag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] for unparsable URLs, non-WebSocket
    /// schemes, or URLs without a host.
    pub fn apply_url(&mut self, raw: &str) -> Result<()> {
        let url = Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;

        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(Error::InvalidUrl(format!(
                    "unsupported scheme: {other} (expected ws or wss)"
                )));
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("{raw}: missing host")))?
            .to_string();

        let port = url
            .port()
            .unwrap_or(if secure { 443 } else { 80 });

        let mut request_uri = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };
        if let Some(query) = url.query() {
            request_uri.push('?');
            request_uri.push_str(query);
        }

        self.host = host;
        self.port = port;
        self.request_uri = request_uri;
        self.secure = secure;
        Ok(())
    }

    /// Check that the configuration carries a connect target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if no URL has been applied.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() || self.port == 0 {
            return Err(Error::InvalidUrl("no URL configured".into()));
        }
        if self.compression_level > 9 {
            return Err(Error::InvalidUrl(format!(
                "compression level must be 0-9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }

    /// `host:port` string used for the `Host` header and socket connect.
    #[must_use]
    pub fn host_port(&self) -> String {
        // Omit the default port from the Host header, as browsers do.
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
