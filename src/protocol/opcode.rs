//! Frame opcodes as defined in RFC 6455 Section 5.2.

use crate::error::{Error, Result};

/// WebSocket frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame (0x0), follows an unfinished Text or Binary frame.
    Continuation = 0x0,
    /// Text frame (0x1); the complete message must be valid UTF-8.
    Text = 0x1,
    /// Binary frame (0x2).
    Binary = 0x2,
    /// Close frame (0x8); may carry a status code and reason.
    Close = 0x8,
    /// Ping frame (0x9); answered with a Pong echoing the payload.
    Ping = 0x9,
    /// Pong frame (0xA); accepted solicited or not.
    Pong = 0xA,
}

impl OpCode {
    /// Decode an opcode nibble.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedOpcode`] for any value outside
    /// {0x0, 0x1, 0x2, 0x8, 0x9, 0xA}.
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::ReservedOpcode(other)),
        }
    }

    /// Raw nibble value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control frame opcodes: Close, Ping, Pong.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Data frame opcodes: Continuation, Text, Binary.
    #[inline]
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, OpCode::Continuation | OpCode::Text | OpCode::Binary)
    }
}
