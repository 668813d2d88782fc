//! Incoming-byte engine: frame extraction, fragmentation reassembly, close
//! validation and payload decoding, reported upward through [`Sinks`].
//!
//! The receiver owns every bit of receive-side protocol state (fragmentation
//! buffer, UTF-8 validator, inflate context) and is driven with raw transport
//! bytes. It never performs I/O itself; replies such as pongs and close
//! echoes are requested through the sink, which keeps the engine
//! unit-testable against a fake connection.

use bytes::BytesMut;
use log::debug;

use crate::codec::deflate::{DeflateParams, Inflater};
use crate::error::Error;
use crate::message::close_code_is_valid;
use crate::protocol::frame::{Frame, FrameRules, MAX_CLOSE_REASON};
use crate::protocol::opcode::OpCode;
use crate::protocol::utf8::Utf8Validator;

/// Upward callbacks from the receive engine to the connection.
pub trait Sinks {
    /// Whether permessage-deflate was negotiated (legalizes RSV1).
    fn rx_compression_enabled(&self) -> bool;
    /// Whether the connection is shutting down; stops frame processing.
    fn rx_is_terminating(&self) -> bool;
    /// A complete text message was received.
    fn on_rx_text(&mut self, msg: String);
    /// A complete binary message was received.
    fn on_rx_binary(&mut self, msg: Vec<u8>);
    /// A ping arrived; the connection must answer with an identical pong.
    fn on_rx_ping(&mut self, payload: Vec<u8>);
    /// A pong arrived (solicited or not).
    fn on_rx_pong(&mut self, payload: Vec<u8>);
    /// A close frame arrived; `code`/`reason` are already validated and are
    /// what the close reply should echo (1002 and an empty reason when the
    /// close payload itself was malformed).
    fn on_rx_close(&mut self, code: u16, reason: String);
    /// The peer violated the protocol; the connection must close with
    /// `close_code`.
    fn on_rx_protocol_error(&mut self, close_code: u16, why: &str);
}

/// Map a receive-path error to the close code it is answered with.
fn close_code_for(err: &Error) -> u16 {
    match err {
        Error::InvalidUtf8 | Error::Decompression(_) => 1007,
        Error::MessageTooLarge { .. } => 1009,
        _ => 1002,
    }
}

/// Receive-side protocol engine.
pub struct Receiver {
    max_message_size: usize,
    inflater: Option<Inflater>,

    // Fragmentation state, reset between messages.
    in_progress: bool,
    fragment_opcode: OpCode,
    fragment_compressed: bool,
    fragments: Vec<u8>,
    utf8: Utf8Validator,
}

impl Receiver {
    /// Create a receiver; `max_message_size` bounds a reassembled or
    /// inflated message.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            inflater: None,
            in_progress: false,
            fragment_opcode: OpCode::Binary,
            fragment_compressed: false,
            fragments: Vec::new(),
            utf8: Utf8Validator::new(),
        }
    }

    /// Install the inflate context after permessage-deflate was negotiated.
    pub fn enable_compression(&mut self, params: &DeflateParams) {
        self.inflater = Some(Inflater::new(params, self.max_message_size));
    }

    /// Consume as many complete frames from `buf` as are available,
    /// dispatching results through `sinks`. Partial frames stay buffered.
    pub fn on_data<S: Sinks>(&mut self, buf: &mut BytesMut, sinks: &mut S) {
        let rules = FrameRules {
            compression: sinks.rx_compression_enabled(),
            max_payload: self.max_message_size,
        };

        loop {
            if sinks.rx_is_terminating() {
                return;
            }

            let frame = match Frame::parse(buf, &rules) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => {
                    sinks.on_rx_protocol_error(close_code_for(&err), &err.to_string());
                    return;
                }
            };

            match frame.opcode {
                OpCode::Text | OpCode::Binary => self.handle_data_frame(frame, sinks),
                OpCode::Continuation => self.handle_continuation_frame(frame, sinks),
                OpCode::Close => self.handle_close_frame(&frame.payload, sinks),
                OpCode::Ping => sinks.on_rx_ping(frame.payload),
                OpCode::Pong => {
                    debug!("pong received ({} bytes)", frame.payload.len());
                    sinks.on_rx_pong(frame.payload);
                }
            }
        }
    }

    /// Whether a fragmented message is currently being reassembled.
    #[must_use]
    pub fn is_mid_message(&self) -> bool {
        self.in_progress
    }

    fn reset_fragmentation(&mut self) {
        self.in_progress = false;
        self.fragment_compressed = false;
        self.fragments = Vec::new();
        self.utf8.reset();
    }

    fn handle_data_frame<S: Sinks>(&mut self, frame: Frame, sinks: &mut S) {
        if self.in_progress {
            sinks.on_rx_protocol_error(1002, "new data frame while a message is in progress");
            return;
        }

        let compressed = frame.rsv1;

        if !frame.fin {
            self.in_progress = true;
            self.fragment_opcode = frame.opcode;
            self.fragment_compressed = compressed;
            self.fragments = frame.payload;

            if frame.opcode == OpCode::Text && !compressed {
                self.utf8.reset();
                if !self.utf8.accept(&self.fragments) {
                    self.reset_fragmentation();
                    sinks.on_rx_protocol_error(1007, "invalid UTF-8 in text message");
                }
            }
            return;
        }

        self.deliver(frame.opcode, compressed, frame.payload, false, sinks);
    }

    fn handle_continuation_frame<S: Sinks>(&mut self, frame: Frame, sinks: &mut S) {
        if !self.in_progress {
            sinks.on_rx_protocol_error(1002, "continuation frame without initial frame");
            return;
        }
        if frame.rsv1 {
            sinks.on_rx_protocol_error(1002, "RSV1 set on continuation frame");
            return;
        }

        if self.fragments.len() + frame.payload.len() > self.max_message_size {
            self.reset_fragmentation();
            sinks.on_rx_protocol_error(1009, "reassembled message too large");
            return;
        }
        self.fragments.extend_from_slice(&frame.payload);

        let text = self.fragment_opcode == OpCode::Text;
        if text && !self.fragment_compressed && !self.utf8.accept(&frame.payload) {
            self.reset_fragmentation();
            sinks.on_rx_protocol_error(1007, "invalid UTF-8 in text message");
            return;
        }

        if !frame.fin {
            return;
        }

        let opcode = self.fragment_opcode;
        let compressed = self.fragment_compressed;
        let payload = std::mem::take(&mut self.fragments);
        let incremental = text && !compressed;
        self.in_progress = false;
        self.fragment_compressed = false;
        self.deliver(opcode, compressed, payload, incremental, sinks);
    }

    /// Hand a complete message (still compressed if `compressed`) to the
    /// sink. `incrementally_validated` marks uncompressed text whose bytes
    /// already went through the streaming validator fragment by fragment.
    fn deliver<S: Sinks>(
        &mut self,
        opcode: OpCode,
        compressed: bool,
        payload: Vec<u8>,
        incrementally_validated: bool,
        sinks: &mut S,
    ) {
        let payload = if compressed {
            let Some(inflater) = self.inflater.as_mut() else {
                // RSV1 without negotiation is caught by the parser; reaching
                // this point means the negotiated flag and context diverged.
                sinks.on_rx_protocol_error(1002, "compressed frame without inflate context");
                return;
            };
            match inflater.decompress(&payload) {
                Ok(inflated) => {
                    inflater.finish_message();
                    inflated
                }
                Err(err) => {
                    self.reset_fragmentation();
                    sinks.on_rx_protocol_error(close_code_for(&err), &err.to_string());
                    return;
                }
            }
        } else {
            payload
        };

        match opcode {
            OpCode::Text => {
                if incrementally_validated {
                    if !self.utf8.is_final_valid() {
                        self.reset_fragmentation();
                        sinks.on_rx_protocol_error(1007, "invalid UTF-8 in text message");
                        return;
                    }
                } else {
                    self.utf8.reset();
                    if !self.utf8.accept(&payload) || !self.utf8.is_final_valid() {
                        self.reset_fragmentation();
                        sinks.on_rx_protocol_error(1007, "invalid UTF-8 in text message");
                        return;
                    }
                }
                self.utf8.reset();
                match String::from_utf8(payload) {
                    Ok(text) => sinks.on_rx_text(text),
                    Err(_) => sinks.on_rx_protocol_error(1007, "invalid UTF-8 in text message"),
                }
            }
            OpCode::Binary => sinks.on_rx_binary(payload),
            _ => sinks.on_rx_protocol_error(1002, "unexpected data opcode"),
        }
    }

    fn handle_close_frame<S: Sinks>(&mut self, payload: &[u8], sinks: &mut S) {
        let mut code = 1000u16;
        let mut reason = String::new();
        let mut malformed = false;

        if payload.len() == 1 {
            malformed = true;
        } else if payload.len() >= 2 {
            code = u16::from_be_bytes([payload[0], payload[1]]);
            if !close_code_is_valid(code) {
                malformed = true;
            }

            if payload.len() > 2 {
                let raw = &payload[2..];
                let raw = &raw[..raw.len().min(MAX_CLOSE_REASON)];
                match std::str::from_utf8(raw) {
                    Ok(text) => reason = text.to_string(),
                    Err(_) => malformed = true,
                }
            }
        }

        if malformed {
            sinks.on_rx_close(1002, String::new());
        } else {
            sinks.on_rx_close(code, reason);
        }
    }
}
