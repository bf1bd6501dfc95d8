//! Connection finite-state machine (FSM) types.
//!
//! This module defines the role of an endpoint and every state a
//! [`crate::connection::Connection`] can occupy.  State transitions are
//! *not* implemented here — they live in [`crate::connection`] — keeping
//! the types free of protocol plumbing.
//!
//! ```text
//!  Idle ──accept()───▶ Listening ──SYN/SYN|ACK──▶ Established
//!  Idle ──connect()──▶ Connecting ──SYN|ACK─────▶ Established
//!                          │                          │
//!                          │ refused / exhausted      │ disconnect() /
//!                          ▼                          ▼ FIN from peer
//!                        Closed ◀────── Closing ◀─────┘
//! ```

/// Whether the endpoint waits for a peer or reaches out to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Bound to a local port, passively awaiting a peer.
    Listener,
    /// Actively connecting to a listener's address.
    Initiator,
}

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket exists; no connection attempt made yet.
    Idle,
    /// Listener blocked in `accept`, waiting for a SYN.
    Listening,
    /// Initiator running the SYN / SYN|ACK exchange.
    Connecting,
    /// Handshake complete; data transfer allowed.
    Established,
    /// FIN sent, waiting for the peer's FIN|ACK.
    Closing,
    /// Connection over (gracefully or not); peer address cleared.
    Closed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
