//! # wscl - Callback-driven WebSocket client engine
//!
//! `wscl` turns an ordered byte-stream transport (TCP or TLS) into a
//! message-oriented duplex channel per RFC 6455, with the
//! permessage-deflate extension of RFC 7692. Its protocol behavior is
//! validated against the Autobahn Test Suite.
//!
//! ## Model
//!
//! - One dedicated I/O thread per connection owns the transport, timers,
//!   compression contexts and all protocol state; no locks on the hot path.
//! - Application threads interact through a bounded send queue and receive
//!   events via callbacks invoked on the I/O thread.
//! - `wss://` support selects the TLS provider at runtime from the URL
//!   scheme (feature `tls-rustls`, on by default).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use wscl::WebSocketClient;
//!
//! let client = WebSocketClient::new();
//! client.set_url("wss://echo.example.com/chat").unwrap();
//! client.enable_compression();
//! client.set_open_callback(|| println!("open"));
//! client.set_message_callback(|msg| println!("text: {msg}"));
//! client.set_close_callback(|code, reason| println!("closed: {code} {reason}"));
//! client.connect().unwrap();
//! client.send_message("Hello").unwrap();
//! // ...
//! client.disconnect();
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
mod queue;
pub mod receiver;
pub mod tls;

pub use client::{ConnectionState, WebSocketClient};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use message::{close_code_is_valid, CloseCode};
pub use tls::TlsOptions;

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_public_types_are_send_sync() {
        assert_send_sync::<WebSocketClient>();
        assert_send_sync::<ClientConfig>();
        assert_send_sync::<Error>();
        assert_send_sync::<CloseCode>();
        assert_send_sync::<ConnectionState>();
        assert_send_sync::<TlsOptions>();
    }
}
