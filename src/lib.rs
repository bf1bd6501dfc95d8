//! `rudp` — a reliable, in-order message transport over UDP.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │ send(msg) / recv(buf)
//!  ┌───▼───────────────────────────────┐
//!  │           Connection              │
//!  │ (owns socket, state, parameters)  │
//!  └───┬───────────────┬───────────────┘
//!      │ connect/accept│ send/recv
//!  ┌───▼──────┐   ┌────▼─────┐   frames   ┌───────────┐
//!  │Handshake │   │ Transfer │───────────▶│ Validator │
//!  └───┬──────┘   └────┬─────┘            └───────────┘
//!      │               │
//!  ┌───▼───────────────▼───┐
//!  │        Packet         │  (wire codec: header, checksum)
//!  └───┬───────────────────┘
//!      │ raw UDP datagrams
//!  ┌───▼───────┐
//!  │ RudpSocket│  (thin async wrapper around tokio UdpSocket)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]     — wire format (serialise / parse, checksum)
//! - [`socket`]     — async UDP socket abstraction
//! - [`validator`]  — inbound datagram classification
//! - [`state`]      — finite-state-machine types
//! - [`handshake`]  — SYN / SYN|ACK connection establishment
//! - [`transfer`]   — stop-and-wait fragmentation, retransmission, reassembly
//! - [`connection`] — per-connection lifecycle and public API
//! - [`simulator`]  — fault-injecting relay for testing
//!
//! # Protocol sketch
//!
//! A connection is established with a SYN / SYN|ACK exchange that also
//! carries each side's parameters (MTU, timeout, retry budget); the smaller
//! MTU wins.  Each message is fragmented, and every fragment is individually
//! acknowledged before the next is sent (stop-and-wait); the final fragment
//! carries a LAST flag that frames the message for the receiver.  Either
//! side closes with a FIN / FIN|ACK exchange.  All frames are covered by a
//! one's-complement checksum, and datagrams from unknown sources are
//! rejected without disturbing the retry accounting.

pub mod connection;
pub mod handshake;
pub mod packet;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod transfer;
pub mod validator;

pub use connection::{Config, Connection, RudpError};
pub use state::{ConnectionState, Role};
