//! Frame parsing and serialization (RFC 6455 Section 5).
//!
//! The parser pulls complete frames out of a growable receive buffer and
//! enforces the framing rules a client must apply to server-to-client
//! traffic: no masking, no RSV2/RSV3, RSV1 only when compression was
//! negotiated, and strict control-frame limits. Bytes are consumed only once
//! an entire frame is present.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::mask::apply_mask;
use crate::protocol::opcode::OpCode;

/// Maximum payload of a control frame (RFC 6455 Section 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Maximum length of a close reason on the wire: 125 minus the 2-byte code.
pub const MAX_CLOSE_REASON: usize = 123;

/// Parsing rules that depend on negotiated connection state.
#[derive(Debug, Clone, Copy)]
pub struct FrameRules {
    /// Whether permessage-deflate was negotiated (legalizes RSV1 on data
    /// frames).
    pub compression: bool,
    /// Upper bound on a single frame payload; larger frames fail before
    /// they are buffered in full.
    pub max_payload: usize,
}

impl Default for FrameRules {
    fn default() -> Self {
        Self {
            compression: false,
            max_payload: usize::MAX,
        }
    }
}

/// A parsed or to-be-sent WebSocket frame.
///
/// RSV2 and RSV3 are absent by construction: the parser rejects them and the
/// writer never sets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Per-message-compressed bit (RSV1).
    pub rsv1: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Unmasked payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame with the given parameters.
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            rsv1: false,
            opcode,
            payload,
        }
    }

    /// Create an unfragmented text frame.
    #[must_use]
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Text, data.into())
    }

    /// Create an unfragmented binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Binary, data.into())
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Ping, data.into())
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Pong, data.into())
    }

    /// Create a close frame. The reason is truncated to the 123 bytes that
    /// fit next to the status code.
    #[must_use]
    pub fn close(code: u16, reason: &str) -> Self {
        let reason = truncate_utf8(reason, MAX_CLOSE_REASON);
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::new(true, OpCode::Close, payload)
    }

    /// Pull one complete frame out of `buf`, consuming exactly its bytes.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full frame;
    /// nothing is consumed in that case.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] for RSV misuse, a masked server frame, or a
    ///   fragmented/oversized control frame (close code 1002).
    /// - [`Error::ReservedOpcode`] for opcodes outside the RFC set (1002).
    /// - [`Error::MessageTooLarge`] when the declared payload length exceeds
    ///   `rules.max_payload` (close code 1009).
    pub fn parse(buf: &mut BytesMut, rules: &FrameRules) -> Result<Option<Frame>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let byte0 = buf[0];
        let byte1 = buf[1];

        let fin = (byte0 & 0x80) != 0;
        let rsv1 = (byte0 & 0x40) != 0;
        let rsv2 = (byte0 & 0x20) != 0;
        let rsv3 = (byte0 & 0x10) != 0;

        if rsv2 || rsv3 || (rsv1 && !rules.compression) {
            return Err(Error::Protocol("unexpected RSV bits".into()));
        }

        let opcode = OpCode::from_u8(byte0 & 0x0F)?;

        if (byte1 & 0x80) != 0 {
            return Err(Error::Protocol("masked frame from server".into()));
        }

        if opcode.is_control() {
            if !fin {
                return Err(Error::Protocol("fragmented control frame".into()));
            }
            if rsv1 {
                return Err(Error::Protocol("RSV1 set on control frame".into()));
            }
            // Any extended-length encoding already exceeds the control limit.
            if (byte1 & 0x7F) as usize > MAX_CONTROL_PAYLOAD {
                return Err(Error::Protocol("control frame payload too large".into()));
            }
        }

        let (payload_len, header_len): (u64, usize) = match byte1 & 0x7F {
            len @ 0..=125 => (u64::from(len), 2),
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
            }
            _ => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut len_bytes = [0u8; 8];
                len_bytes.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(len_bytes), 10)
            }
        };

        let payload_len = usize::try_from(payload_len).map_err(|_| Error::MessageTooLarge {
            size: usize::MAX,
            max: rules.max_payload,
        })?;
        if payload_len > rules.max_payload {
            return Err(Error::MessageTooLarge {
                size: payload_len,
                max: rules.max_payload,
            });
        }

        let total = header_len
            .checked_add(payload_len)
            .ok_or(Error::MessageTooLarge {
                size: payload_len,
                max: rules.max_payload,
            })?;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(header_len);
        let payload = buf.split_to(payload_len).to_vec();

        Ok(Some(Frame {
            fin,
            rsv1,
            opcode,
            payload,
        }))
    }

    /// Append the wire encoding of this frame to `out`, masking the payload
    /// when a key is supplied (client frames always are).
    pub fn write_into(&self, out: &mut BytesMut, mask: Option<[u8; 4]>) {
        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        if self.rsv1 {
            byte0 |= 0x40;
        }

        let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
        let len = self.payload.len();

        out.reserve(14 + len);
        out.put_u8(byte0);
        if len <= 125 {
            out.put_u8(mask_bit | len as u8);
        } else if len <= 65535 {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }

        match mask {
            Some(key) => {
                out.put_slice(&key);
                let start = out.len();
                out.put_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.put_slice(&self.payload),
        }
    }

    /// Number of bytes `write_into` will append.
    #[must_use]
    pub fn wire_len(&self, masked: bool) -> usize {
        let len = self.payload.len();
        let extended = if len <= 125 {
            0
        } else if len <= 65535 {
            2
        } else {
            8
        };
        2 + extended + if masked { 4 } else { 0 } + len
    }
}

/// Cut a string to at most `max` bytes without splitting a code point.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
