//! Connection lifecycle states and the lock-free cell they live in.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a client connection.
///
/// Legal forward path:
/// `Disconnected → Connecting → Handshaking → Open → Closing → Closed`.
/// Any state may jump directly to `Closed` on a fatal error. `Closed` is
/// terminal for a connection attempt; `connect()` restarts from
/// `Disconnected`/`Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// No connection attempt in progress.
    #[default]
    Disconnected = 0,
    /// TCP (and TLS) connect in progress.
    Connecting = 1,
    /// HTTP Upgrade exchange in progress.
    Handshaking = 2,
    /// Messages flow in both directions.
    Open = 3,
    /// A Close frame was sent or received; draining until the handshake
    /// completes or the grace timer fires.
    Closing = 4,
    /// Fully closed; callbacks have fired.
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Handshaking,
            3 => ConnectionState::Open,
            4 => ConnectionState::Closing,
            5 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Whether application data may still be submitted for sending.
    #[must_use]
    pub const fn accepts_sends(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Handshaking | ConnectionState::Open
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Handshaking => "Handshaking",
            ConnectionState::Open => "Open",
            ConnectionState::Closing => "Closing",
            ConnectionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Shared state cell, readable from any thread and written by the I/O
/// thread (plus the `connect()` transition on the caller thread).
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Create a cell in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Unconditional transition.
    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition only from an expected state; returns whether it happened.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
