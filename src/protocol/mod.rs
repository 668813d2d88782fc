//! WebSocket wire protocol: frames, masking, UTF-8, handshake (RFC 6455).

pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;
pub mod utf8;

pub use frame::{Frame, FrameRules, MAX_CLOSE_REASON, MAX_CONTROL_PAYLOAD};
pub use handshake::{compute_accept_key, ClientHandshake, HandshakeResponse, WS_GUID};
pub use mask::{apply_mask, MaskKeySource};
pub use opcode::OpCode;
pub use utf8::Utf8Validator;
