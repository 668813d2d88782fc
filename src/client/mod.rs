//! The public client handle.
//!
//! [`WebSocketClient`] is configured on the caller's thread, then
//! `connect()` starts a dedicated I/O thread that owns the connection for
//! its whole life. The handle stays cheap: it shares only the state cell,
//! the bounded send queue, the stop flag and the callback table with the
//! I/O thread. Callbacks run on the I/O thread; they may call back into the
//! handle to queue replies, but must not block and must not call
//! [`disconnect`](WebSocketClient::disconnect).

mod driver;
mod state;

pub use state::ConnectionState;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use tokio::sync::Notify;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::message::close_code_is_valid;
use crate::queue::{Outgoing, SendQueue};
use crate::tls::TlsOptions;
use state::StateCell;

/// Callback invoked when the connection reaches OPEN.
pub type OpenCallback = Arc<dyn Fn() + Send + Sync>;
/// Callback invoked for every received text message.
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Callback invoked for every received binary message.
pub type BinaryCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Callback invoked exactly once when the connection reaches CLOSED after
/// having opened.
pub type CloseCallback = Arc<dyn Fn(u16, &str) + Send + Sync>;
/// Callback invoked at most once for a terminal local failure.
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_open: Option<OpenCallback>,
    on_message: Option<MessageCallback>,
    on_binary: Option<BinaryCallback>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
}

/// State shared between the handle and the I/O thread.
pub(crate) struct Shared {
    pub(crate) state: StateCell,
    pub(crate) queue: SendQueue,
    callbacks: Mutex<Callbacks>,
    stop: AtomicBool,
    stop_notify: Notify,
    close_fired: AtomicBool,
    error_fired: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: StateCell::new(),
            queue: SendQueue::new(),
            callbacks: Mutex::new(Callbacks::default()),
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
            close_fired: AtomicBool::new(false),
            error_fired: AtomicBool::new(false),
        }
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.stop_notify.notify_one();
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) async fn stop_notified(&self) {
        if self.stop_requested() {
            return;
        }
        self.stop_notify.notified().await;
    }

    pub(crate) async fn queue_notified(&self) {
        self.queue.notified().await;
    }

    // Dispatch helpers: each takes a snapshot under the mutex, then invokes
    // outside it so a callback can rebind callbacks or queue sends without
    // deadlocking.

    pub(crate) fn fire_open(&self) {
        let cb = self.callbacks().on_open.clone();
        if let Some(cb) = cb {
            cb();
        }
    }

    pub(crate) fn fire_text(&self, msg: &str) {
        let cb = self.callbacks().on_message.clone();
        if let Some(cb) = cb {
            cb(msg);
        }
    }

    pub(crate) fn fire_binary(&self, msg: &[u8]) {
        let cb = self.callbacks().on_binary.clone();
        if let Some(cb) = cb {
            cb(msg);
        }
    }

    /// One-shot close dispatch; later calls are ignored.
    pub(crate) fn fire_close(&self, code: u16, reason: &str) {
        if self.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let cb = self.callbacks().on_close.clone();
        if let Some(cb) = cb {
            cb(code, reason);
        }
    }

    /// One-shot error dispatch; later calls are ignored.
    pub(crate) fn fire_error(&self, err: &Error) {
        if self.error_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let cb = self.callbacks().on_error.clone();
        if let Some(cb) = cb {
            cb(err);
        }
    }
}

/// A callback-driven WebSocket client (RFC 6455) with optional
/// permessage-deflate compression (RFC 7692).
///
/// One instance drives one connection: configure it, register callbacks,
/// `connect()`, exchange messages, then `disconnect()`. All methods are
/// thread-safe; `disconnect()` must not be called from inside a callback.
///
/// ```no_run
/// use wscl::WebSocketClient;
///
/// let client = WebSocketClient::new();
/// client.set_url("ws://127.0.0.1:9001/").unwrap();
/// client.set_message_callback(|msg| println!("received: {msg}"));
/// client.connect().unwrap();
/// // ...
/// client.disconnect();
/// ```
pub struct WebSocketClient {
    shared: Arc<Shared>,
    config: Mutex<ClientConfig>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketClient {
    /// Create an unconfigured client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            config: Mutex::new(ClientConfig::new()),
            io_thread: Mutex::new(None),
        }
    }

    fn config(&self) -> std::sync::MutexGuard<'_, ClientConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the target URL (`ws://host[:port]/path` or `wss://...`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] for malformed or non-WebSocket URLs.
    pub fn set_url(&self, url: &str) -> Result<()> {
        self.config().apply_url(url)
    }

    /// Append a header to the upgrade request.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.config().headers.push((name.into(), value.into()));
    }

    /// Set the keepalive ping interval; `None` disables pings.
    pub fn set_ping_interval(&self, interval: Option<Duration>) {
        self.config().ping_interval = interval;
    }

    /// Set the deadline for TCP connect, TLS and the upgrade combined.
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.config().connect_timeout = timeout;
    }

    /// Set the read-inactivity timeout; `None` disables it.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.config().read_timeout = timeout;
    }

    /// Set TLS options for `wss://` connections.
    pub fn set_tls_options(&self, tls: TlsOptions) {
        self.config().tls = tls;
    }

    /// Offer permessage-deflate during the handshake.
    pub fn enable_compression(&self) {
        self.config().compression = true;
    }

    /// Set the deflate level (0-9) used when compression is negotiated.
    pub fn set_compression_level(&self, level: u32) {
        self.config().compression_level = level;
    }

    /// Register the open callback.
    pub fn set_open_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.shared.callbacks().on_open = Some(Arc::new(cb));
    }

    /// Register the text-message callback.
    pub fn set_message_callback(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.shared.callbacks().on_message = Some(Arc::new(cb));
    }

    /// Register the binary-message callback.
    pub fn set_binary_callback(&self, cb: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.callbacks().on_binary = Some(Arc::new(cb));
    }

    /// Register the close callback. It fires exactly once per connection
    /// that reached OPEN, with the effective close code and reason.
    pub fn set_close_callback(&self, cb: impl Fn(u16, &str) + Send + Sync + 'static) {
        self.shared.callbacks().on_close = Some(Arc::new(cb));
    }

    /// Register the error callback. It fires at most once, for
    /// configuration, network, TLS, handshake and resource failures.
    pub fn set_error_callback(&self, cb: impl Fn(&Error) + Send + Sync + 'static) {
        self.shared.callbacks().on_error = Some(Arc::new(cb));
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    /// Whether the connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Start the connection. Non-blocking: spawns the I/O thread and
    /// returns; progress is reported through the callbacks.
    ///
    /// Each client instance drives a single connection; a second `connect()`
    /// fails.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] when no URL was configured.
    /// - [`Error::Internal`] when already connected or the I/O thread cannot
    ///   be spawned.
    pub fn connect(&self) -> Result<()> {
        let config = self.config().clone();
        config.validate()?;

        if !self
            .shared
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(Error::Internal("connect() on an active client".to_string()));
        }

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("wscl-io".to_string())
            .spawn(move || driver::run(shared, config))
            .map_err(|e| {
                self.shared.state.store(ConnectionState::Closed);
                Error::Internal(format!("failed to spawn I/O thread: {e}"))
            })?;

        *self
            .io_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Queue a text message for sending.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] when the connection does not accept sends
    ///   (never connected, closing, or closed).
    /// - [`Error::SendQueueFull`] on back-pressure overflow.
    pub fn send_message(&self, text: impl Into<String>) -> Result<()> {
        if !self.state().accepts_sends() {
            return Err(Error::NotConnected);
        }
        self.shared.queue.push(Outgoing::Text(text.into()))
    }

    /// Queue a binary message for sending.
    ///
    /// # Errors
    ///
    /// Same conditions as [`send_message`](Self::send_message).
    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        if !self.state().accepts_sends() {
            return Err(Error::NotConnected);
        }
        self.shared.queue.push(Outgoing::Binary(data.into()))
    }

    /// Request a graceful close with the given code and reason. Items
    /// submitted after this are rejected.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCloseCode`] for codes that must not go on the wire.
    /// - [`Error::NotConnected`] when there is nothing to close.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> Result<()> {
        if !close_code_is_valid(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        if !self.state().accepts_sends() {
            return Err(Error::NotConnected);
        }
        self.shared.queue.push(Outgoing::Close {
            code,
            reason: reason.into(),
        })
    }

    /// Stop the connection and join the I/O thread. Blocking and
    /// idempotent; safe from any thread except the I/O thread itself.
    pub fn disconnect(&self) {
        self.shared.request_stop();
        let handle = self
            .io_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            debug!("joining I/O thread");
            let _ = handle.join();
        }
    }
}

impl Default for WebSocketClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_requires_url() {
        let client = WebSocketClient::new();
        assert!(matches!(client.connect(), Err(Error::InvalidUrl(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_send_before_connect_fails() {
        let client = WebSocketClient::new();
        assert!(matches!(
            client.send_message("hello"),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            client.send_binary(vec![1, 2, 3]),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_close_rejects_reserved_codes() {
        let client = WebSocketClient::new();
        for code in [999, 1004, 1005, 1006, 1015, 2999, 5000] {
            assert!(matches!(
                client.close(code, ""),
                Err(Error::InvalidCloseCode(c)) if c == code
            ));
        }
    }

    #[test]
    fn test_disconnect_without_connect_is_noop() {
        let client = WebSocketClient::new();
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_callbacks_can_be_rebound() {
        let client = WebSocketClient::new();
        client.set_message_callback(|_| {});
        client.set_message_callback(|_| {});
        client.shared.fire_text("no listener panic");
    }

    #[test]
    fn test_close_callback_is_one_shot() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let client = WebSocketClient::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        client.set_close_callback(move |code, _| {
            assert_eq!(code, 1000);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        client.shared.fire_close(1000, "");
        client.shared.fire_close(1002, "late");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_callback_is_one_shot() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let client = WebSocketClient::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        client.set_error_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        client.shared.fire_error(&Error::NotConnected);
        client.shared.fire_error(&Error::InvalidUtf8);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
