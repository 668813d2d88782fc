//! The I/O thread: owns the transport, all protocol state and every timer.
//!
//! One dedicated thread runs a current-thread tokio runtime. External
//! threads only touch the send queue (under its mutex) and the stop flag.
//! Everything else (the stream, the receive buffer, the zlib contexts, the
//! fragmentation state, the close bookkeeping) lives here and is never
//! locked. Callbacks are dispatched from this thread and run to completion.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

use crate::client::state::ConnectionState;
use crate::client::Shared;
use crate::codec::deflate::Deflater;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::frame::Frame;
use crate::protocol::handshake::{
    find_head_end, negotiate_deflate, ClientHandshake, HandshakeResponse,
};
use crate::protocol::mask::MaskKeySource;
use crate::protocol::opcode::OpCode;
use crate::queue::Outgoing;
use crate::receiver::{Receiver, Sinks};
use crate::tls::{connect_tls, MaybeTls};

/// Upper bound on the HTTP response head during the handshake.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Thread entry point. Builds the runtime, drives the connection to
/// completion, and guarantees a terminal callback on every exit path.
pub(crate) fn run(shared: Arc<Shared>, config: ClientConfig) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            shared.state.store(ConnectionState::Closed);
            shared.fire_error(&Error::Internal(format!("event loop start failed: {e}")));
            return;
        }
    };

    runtime.block_on(async {
        match establish(&shared, &config).await {
            Ok(session) => session.run().await,
            Err(err) => {
                // Connect/TLS/handshake failures report through the error
                // callback; the close callback stays silent because the
                // connection never opened.
                error!("connection setup failed: {err}");
                shared.state.store(ConnectionState::Closed);
                shared.fire_error(&err);
            }
        }
    });
}

/// Connect the transport and complete the HTTP upgrade, all under the
/// configured connect deadline.
async fn establish(shared: &Arc<Shared>, config: &ClientConfig) -> Result<Session> {
    let deadline = Instant::now() + config.connect_timeout;

    let tcp = timeout_at(deadline, TcpStream::connect((config.host.as_str(), config.port)))
        .await
        .map_err(|_| Error::Network(format!("connect to {}:{} timed out", config.host, config.port)))?
        .map_err(|e| Error::Network(format!("connect to {}:{} failed: {e}", config.host, config.port)))?;
    let _ = tcp.set_nodelay(true);

    let mut stream = if config.secure {
        timeout_at(deadline, connect_tls(&config.tls, &config.host, tcp))
            .await
            .map_err(|_| Error::Tls("TLS handshake timed out".to_string()))??
    } else {
        MaybeTls::Plain(tcp)
    };

    shared.state.store(ConnectionState::Handshaking);

    let handshake = ClientHandshake::new();
    let request = handshake.request(config);
    timeout_at(deadline, stream.write_all(request.as_bytes()))
        .await
        .map_err(|_| Error::Handshake("upgrade request timed out".to_string()))?
        .map_err(|e| Error::Network(e.to_string()))?;

    // Read the response head; anything past the blank line is frame data.
    let mut read_buf = BytesMut::with_capacity(4096);
    let head_end = loop {
        if let Some(end) = find_head_end(&read_buf) {
            break end;
        }
        if read_buf.len() > MAX_RESPONSE_HEAD {
            return Err(Error::Handshake("response head too large".to_string()));
        }
        let n = timeout_at(deadline, stream.read_buf(&mut read_buf))
            .await
            .map_err(|_| Error::Handshake("upgrade response timed out".to_string()))?
            .map_err(|e| Error::Network(e.to_string()))?;
        if n == 0 {
            return Err(Error::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }
    };
    let head = read_buf.split_to(head_end);

    let response = HandshakeResponse::parse(&head)?;
    handshake.verify(&response)?;
    let deflate = negotiate_deflate(&response, config.compression)?;

    let mut receiver = Receiver::new(config.max_message_size);
    let deflater = deflate.as_ref().map(|params| {
        receiver.enable_compression(params);
        Deflater::new(params, config.compression_level)
    });
    debug!(
        "upgrade complete (compression {})",
        if deflate.is_some() { "on" } else { "off" }
    );

    Ok(Session {
        shared: shared.clone(),
        stream,
        read_buf,
        receiver,
        deflater,
        compression: deflate.is_some(),
        masks: MaskKeySource::new(),
        ping_interval: config.ping_interval,
        read_timeout: config.read_timeout,
        close_grace: config.close_grace,
        close_sent: false,
        close_received: false,
        protocol_failed: false,
        effective_close: None,
        next_ping: None,
        close_deadline: None,
        idle_deadline: None,
    })
}

/// What woke the event loop.
enum Event {
    Stop,
    CloseGrace,
    Idle,
    Ping,
    Wakeup,
    Read(std::io::Result<usize>),
}

/// Collects what one batch of incoming bytes asked the connection to do.
struct RxActions<'a> {
    shared: &'a Shared,
    compression: bool,
    pongs: Vec<Vec<u8>>,
    close: Option<(u16, String)>,
    protocol_error: Option<(u16, String)>,
}

impl Sinks for RxActions<'_> {
    fn rx_compression_enabled(&self) -> bool {
        self.compression
    }

    fn rx_is_terminating(&self) -> bool {
        self.close.is_some() || self.protocol_error.is_some() || self.shared.stop_requested()
    }

    fn on_rx_text(&mut self, msg: String) {
        self.shared.fire_text(&msg);
    }

    fn on_rx_binary(&mut self, msg: Vec<u8>) {
        self.shared.fire_binary(&msg);
    }

    fn on_rx_ping(&mut self, payload: Vec<u8>) {
        self.pongs.push(payload);
    }

    fn on_rx_pong(&mut self, _payload: Vec<u8>) {
        // Pong payloads are not correlated with outstanding pings.
    }

    fn on_rx_close(&mut self, code: u16, reason: String) {
        self.close = Some((code, reason));
    }

    fn on_rx_protocol_error(&mut self, close_code: u16, why: &str) {
        warn!("protocol error from peer: {why} (closing with {close_code})");
        self.protocol_error = Some((close_code, why.to_string()));
    }
}

/// An open connection and everything it owns.
struct Session {
    shared: Arc<Shared>,
    stream: MaybeTls,
    read_buf: BytesMut,
    receiver: Receiver,
    deflater: Option<Deflater>,
    compression: bool,
    masks: MaskKeySource,

    ping_interval: Option<Duration>,
    read_timeout: Option<Duration>,
    close_grace: Duration,

    close_sent: bool,
    close_received: bool,
    /// Set after a protocol failure; incoming frames are no longer
    /// interpreted while the close handshake drains.
    protocol_failed: bool,
    /// Code/reason the close callback will report.
    effective_close: Option<(u16, String)>,

    next_ping: Option<Instant>,
    close_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
}

impl Session {
    async fn run(mut self) {
        self.shared.state.store(ConnectionState::Open);
        self.shared.fire_open();

        self.next_ping = self.ping_interval.map(|d| Instant::now() + d);
        self.bump_idle();

        // Flush anything the application queued before the handshake
        // finished.
        if self.flush_queue().await {
            return;
        }
        // Frame bytes may have arrived piggybacked on the upgrade response.
        if !self.read_buf.is_empty() && self.process_incoming().await {
            return;
        }

        loop {
            let event = {
                let shared = self.shared.clone();
                let stream = &mut self.stream;
                let read_buf = &mut self.read_buf;
                let close_at = self.close_deadline;
                let idle_at = self.idle_deadline;
                let ping_at = self.next_ping;

                tokio::select! {
                    biased;
                    () = shared.stop_notified() => Event::Stop,
                    () = sleep_until_opt(close_at) => Event::CloseGrace,
                    () = sleep_until_opt(idle_at) => Event::Idle,
                    () = sleep_until_opt(ping_at) => Event::Ping,
                    () = shared.queue_notified() => Event::Wakeup,
                    result = read_some(stream, read_buf) => Event::Read(result),
                }
            };

            let done = match event {
                Event::Stop => self.handle_stop().await,
                Event::CloseGrace => {
                    debug!("close-grace timer expired");
                    self.finish()
                }
                Event::Idle => {
                    warn!("read-inactivity timeout");
                    self.effective_close
                        .get_or_insert((1006, "abnormal closure".to_string()));
                    self.finish()
                }
                Event::Ping => self.handle_ping_tick().await,
                Event::Wakeup => self.flush_queue().await,
                Event::Read(Ok(0)) => {
                    if self.close_sent || self.close_received {
                        debug!("transport EOF while draining close");
                    } else {
                        warn!("transport EOF before close handshake");
                    }
                    self.effective_close
                        .get_or_insert((1006, "abnormal closure".to_string()));
                    self.finish()
                }
                Event::Read(Ok(_)) => {
                    self.bump_idle();
                    self.process_incoming().await
                }
                Event::Read(Err(e)) => {
                    self.shared.fire_error(&Error::Network(e.to_string()));
                    self.effective_close
                        .get_or_insert((1006, "abnormal closure".to_string()));
                    self.finish()
                }
            };

            if done {
                return;
            }
        }
    }

    fn bump_idle(&mut self) {
        self.idle_deadline = self.read_timeout.map(|d| Instant::now() + d);
    }

    /// Run the receiver over the buffered bytes and act on what it reports.
    /// Returns true when the connection reached its terminal state.
    async fn process_incoming(&mut self) -> bool {
        if self.protocol_failed {
            // Drain-only mode: the peer's bytes are irrelevant now, the
            // connection ends on its close, EOF, or the grace timer.
            self.read_buf.clear();
            return false;
        }

        let mut actions = RxActions {
            shared: &self.shared,
            compression: self.compression,
            pongs: Vec::new(),
            close: None,
            protocol_error: None,
        };
        self.receiver.on_data(&mut self.read_buf, &mut actions);

        let RxActions {
            pongs,
            close,
            protocol_error,
            ..
        } = actions;

        if !self.close_sent {
            for payload in pongs {
                if let Err(e) = self.write_frame(&Frame::pong(payload)).await {
                    return self.abort_on_write_error(e);
                }
            }
        }

        if let Some((code, why)) = protocol_error {
            return self.fail_protocol(code, &why).await;
        }
        if let Some((code, reason)) = close {
            return self.handle_remote_close(code, reason).await;
        }
        false
    }

    /// Remote close: echo it if we have not sent ours, then the handshake is
    /// complete from our side and the connection finishes.
    async fn handle_remote_close(&mut self, code: u16, reason: String) -> bool {
        debug!("close received: {code} \"{reason}\"");
        self.close_received = true;
        self.effective_close = Some((code, reason.clone()));

        if !self.close_sent {
            self.close_sent = true;
            self.shared
                .state
                .transition(ConnectionState::Open, ConnectionState::Closing);
            if let Err(e) = self.write_frame(&Frame::close(code, &reason)).await {
                return self.abort_on_write_error(e);
            }
        }
        self.finish()
    }

    /// Protocol failure: send one Close with the given code and drain until
    /// the peer answers or the grace timer fires. One-shot by construction:
    /// a second failure finds `close_sent` already set.
    async fn fail_protocol(&mut self, code: u16, why: &str) -> bool {
        self.protocol_failed = true;
        if self.close_sent {
            return self.finish();
        }
        self.close_sent = true;
        self.effective_close = Some((code, why.to_string()));
        self.shared
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing);
        if let Err(e) = self.write_frame(&Frame::close(code, why)).await {
            return self.abort_on_write_error(e);
        }
        self.arm_close_grace();
        false
    }

    /// Drain the send queue in submission order into one coalesced write.
    async fn flush_queue(&mut self) -> bool {
        let items = self.shared.queue.drain();
        if items.is_empty() {
            return false;
        }

        let mut out = BytesMut::new();
        let mut close_armed = false;
        for item in items {
            match item {
                Outgoing::Text(text) if !self.close_sent => {
                    self.encode_data(OpCode::Text, text.into_bytes(), &mut out);
                }
                Outgoing::Binary(data) if !self.close_sent => {
                    self.encode_data(OpCode::Binary, data, &mut out);
                }
                Outgoing::Close { code, reason } => {
                    if !self.close_sent {
                        self.close_sent = true;
                        self.effective_close.get_or_insert((code, reason.clone()));
                        self.shared
                            .state
                            .transition(ConnectionState::Open, ConnectionState::Closing);
                        Frame::close(code, &reason)
                            .write_into(&mut out, Some(self.masks.next_key()));
                        close_armed = true;
                    }
                    break;
                }
                // Data items behind a close request are suppressed.
                _ => {}
            }
        }

        if !out.is_empty() {
            if let Err(e) = self.write_bytes(&out).await {
                return self.abort_on_write_error(e);
            }
        }
        if close_armed {
            self.arm_close_grace();
        }
        false
    }

    /// Encode one data message into a single frame, compressing when
    /// negotiated. A failed compression downgrades this message to an
    /// uncompressed frame instead of closing the connection.
    fn encode_data(&mut self, opcode: OpCode, payload: Vec<u8>, out: &mut BytesMut) {
        let mut frame = Frame::new(true, opcode, payload);

        if let Some(deflater) = self.deflater.as_mut() {
            if !frame.payload.is_empty() {
                match deflater.compress(&frame.payload) {
                    Ok(compressed) => {
                        frame.payload = compressed;
                        frame.rsv1 = true;
                    }
                    Err(e) => warn!("sending uncompressed: {e}"),
                }
            }
        }

        frame.write_into(out, Some(self.masks.next_key()));
    }

    async fn handle_ping_tick(&mut self) -> bool {
        self.next_ping = self.ping_interval.map(|d| Instant::now() + d);
        if self.close_sent {
            return false;
        }
        debug!("ping timer fired");
        if let Err(e) = self.write_frame(&Frame::ping(Vec::new())).await {
            return self.abort_on_write_error(e);
        }
        false
    }

    /// `disconnect()` was requested: send a best-effort normal close and
    /// tear down immediately.
    async fn handle_stop(&mut self) -> bool {
        debug!("stop requested");
        if !self.close_sent {
            self.close_sent = true;
            self.effective_close = Some((1000, String::new()));
            let _ = self.write_frame(&Frame::close(1000, "")).await;
        }
        self.finish()
    }

    fn arm_close_grace(&mut self) {
        self.close_deadline = Some(Instant::now() + self.close_grace);
    }

    fn abort_on_write_error(&mut self, e: std::io::Error) -> bool {
        self.shared.fire_error(&Error::Network(e.to_string()));
        self.effective_close
            .get_or_insert((1006, "abnormal closure".to_string()));
        self.finish()
    }

    /// The single convergence point of every shutdown path: protocol error,
    /// orderly close from either side, grace expiry, stop, and transport
    /// loss all end here. Idempotent; the close callback is one-shot.
    fn finish(&mut self) -> bool {
        self.shared.state.store(ConnectionState::Closed);
        let (code, reason) = self
            .effective_close
            .clone()
            .unwrap_or((1006, "abnormal closure".to_string()));
        self.shared.fire_close(code, &reason);
        true
    }

    async fn write_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        let mut out = BytesMut::with_capacity(frame.wire_len(true));
        frame.write_into(&mut out, Some(self.masks.next_key()));
        self.write_bytes(&out).await
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }
}

/// Read more transport bytes into the buffer.
async fn read_some(stream: &mut MaybeTls, buf: &mut BytesMut) -> std::io::Result<usize> {
    buf.reserve(4096);
    stream.read_buf(buf).await
}

/// Sleep until `at`, or forever when the timer is unarmed.
async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
