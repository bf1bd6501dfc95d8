//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the complete state for one logical peer-to-peer
//! session: the UDP socket, the explicit FSM state (see [`crate::state`]),
//! the configured and negotiated parameters, and the peer's address once a
//! handshake has completed.  Its responsibilities are:
//! - Driving the finite-state machine.
//! - Delegating connection establishment to [`crate::handshake`] and data
//!   transfer to [`crate::transfer`].
//! - Enforcing the configuration invariants and the role/state guards on
//!   every public operation.
//!
//! A connection is one endpoint talking to at most one peer; it is driven
//! from a single task and holds no locks.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::handshake;
use crate::packet::{self, flags, SynPayload, HEADER_SIZE, SYN_PAYLOAD_SIZE};
use crate::socket::RudpSocket;
use crate::state::{ConnectionState, Role};
use crate::transfer::{self, Link};
use crate::validator::{classify, Verdict};

// ---------------------------------------------------------------------------
// Defaults and limits
// ---------------------------------------------------------------------------

/// Default MTU in bytes.
pub const MTU_DEFAULT: u16 = 1458;

/// Default wait for an ACK / SYN|ACK, in milliseconds.
pub const TIMEOUT_DEFAULT_MS: u16 = 100;

/// Default retry budget per fragment.
pub const MAX_RETRIES_DEFAULT: u16 = 50;

/// Smallest usable MTU: a frame must be able to carry the handshake
/// parameter payload.
pub const MTU_MIN: u16 = (HEADER_SIZE + SYN_PAYLOAD_SIZE) as u16;

/// Smallest accepted timeout, in milliseconds.
pub const TIMEOUT_MIN_MS: u16 = 10;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by connection operations.
///
/// A peer-initiated shutdown is deliberately *not* here: `send` and `recv`
/// report it as `Ok(0)` and the connection drops to closed.
#[derive(Debug, Error)]
pub enum RudpError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration or address outside the accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation requires an established connection.
    #[error("no active connection")]
    NotConnected,
    /// The operation is forbidden while a connection is established.
    #[error("there is already an active connection")]
    AlreadyConnected,
    /// The peer answered the handshake with a FIN.
    #[error("connection refused by peer")]
    ConnectionRefused,
    /// The retry budget was exhausted on a single exchange.
    #[error("maximum number of retries reached ({0})")]
    RetriesExhausted(u16),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tunable connection parameters, exchanged with the peer at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Largest frame (header included) this endpoint will send.
    pub mtu: u16,
    /// How long to wait for an ACK / SYN|ACK before retrying.
    pub timeout_ms: u16,
    /// Retry budget per fragment before the operation fails.
    pub max_retries: u16,
    /// Emit per-transfer statistics to the log.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: MTU_DEFAULT,
            timeout_ms: TIMEOUT_DEFAULT_MS,
            max_retries: MAX_RETRIES_DEFAULT,
            debug: false,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), RudpError> {
        if self.mtu < MTU_MIN {
            return Err(RudpError::InvalidArgument(format!(
                "MTU must be at least {MTU_MIN} bytes"
            )));
        }
        if self.timeout_ms < TIMEOUT_MIN_MS {
            return Err(RudpError::InvalidArgument(format!(
                "timeout must be at least {TIMEOUT_MIN_MS} ms"
            )));
        }
        if self.max_retries < 1 {
            return Err(RudpError::InvalidArgument(
                "max retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A handle to a single reliable connection over UDP.
///
/// Dropping an established connection fires one best-effort FIN at the peer
/// (`Drop` cannot await the full shutdown handshake); call
/// [`Connection::disconnect`] for the graceful FIN / FIN|ACK exchange.
#[derive(Debug)]
pub struct Connection {
    socket: RudpSocket,
    role: Role,
    state: ConnectionState,
    peer: Option<SocketAddr>,
    config: Config,
    /// The peer's advertised MTU; 0 until the handshake settles it.
    mtu_peer: u16,
}

impl Connection {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Create and bind the endpoint.
    ///
    /// A listener binds `0.0.0.0:local_port` with address reuse (0 lets the
    /// OS pick, with the result readable via [`Connection::local_addr`]); an
    /// initiator always gets an ephemeral port and ignores `local_port`.
    pub async fn open(role: Role, local_port: u16, config: Config) -> Result<Self, RudpError> {
        config.validate()?;

        let socket = match role {
            Role::Listener => {
                let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port));
                RudpSocket::bind_reuse(addr).await?
            }
            Role::Initiator => {
                let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
                RudpSocket::bind(addr).await?
            }
        };

        Ok(Self {
            socket,
            role,
            state: ConnectionState::Idle,
            peer: None,
            config,
            mtu_peer: 0,
        })
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Initiate a connection to a listener (initiator only).
    pub async fn connect(&mut self, peer: SocketAddr) -> Result<(), RudpError> {
        if self.role != Role::Initiator {
            return Err(RudpError::InvalidArgument(
                "listener endpoints cannot connect; use accept()".into(),
            ));
        }
        if self.is_connected() {
            return Err(RudpError::AlreadyConnected);
        }
        if !peer.is_ipv4() {
            return Err(RudpError::InvalidArgument(
                "only IPv4 peers are supported".into(),
            ));
        }

        self.state = ConnectionState::Connecting;
        let result = handshake::initiate(
            &self.socket,
            peer,
            self.syn_payload(),
            self.timeout(),
            self.config.max_retries,
        )
        .await;

        match result {
            Ok(theirs) => {
                self.peer = Some(peer);
                self.mtu_peer = theirs.mtu;
                self.state = ConnectionState::Established;
                log::info!("[rudp] connection established with {peer}");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    /// Wait for an initiator and establish the connection (listener only).
    pub async fn accept(&mut self) -> Result<(), RudpError> {
        if self.role != Role::Listener {
            return Err(RudpError::InvalidArgument(
                "initiator endpoints cannot accept; use connect()".into(),
            ));
        }
        if self.is_connected() {
            return Err(RudpError::AlreadyConnected);
        }

        self.state = ConnectionState::Listening;
        match handshake::listen(&self.socket, self.syn_payload()).await {
            Ok((peer, theirs)) => {
                self.peer = Some(peer);
                self.mtu_peer = theirs.mtu;
                self.state = ConnectionState::Established;
                log::info!("[rudp] connection established with {peer}");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Send one message to the peer.
    ///
    /// Returns the payload bytes acknowledged, or `Ok(0)` when the peer
    /// closed the connection mid-transfer.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, RudpError> {
        let link = self.link()?;
        let report = transfer::send_message(&link, data).await?;

        if self.config.debug {
            let s = report.stats;
            log::debug!(
                "[rudp] sent {} bytes over {} fragment(s)",
                report.bytes,
                s.fragments
            );
            log::debug!(
                "[rudp] wire overhead: {} bytes over {} datagram(s), {} retransmission(s)",
                s.wire_bytes,
                s.datagrams,
                s.retransmissions
            );
        }
        if report.peer_closed {
            self.drop_to_closed();
        }
        Ok(report.bytes)
    }

    /// Receive one message from the peer into `buf`.
    ///
    /// Blocks until the peer starts a message.  Returns the bytes written,
    /// or `Ok(0)` for an empty message or a peer-initiated shutdown (the
    /// latter also drops the connection to closed).
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RudpError> {
        let link = self.link()?;
        let report = transfer::recv_message(&link, buf).await?;

        if self.config.debug {
            let s = report.stats;
            log::debug!(
                "[rudp] received {} bytes over {} fragment(s)",
                report.bytes,
                s.fragments
            );
            log::debug!(
                "[rudp] wire overhead: {} bytes over {} datagram(s), {} duplicate(s)",
                s.wire_bytes,
                s.datagrams,
                s.duplicates
            );
        }
        if report.peer_closed {
            self.drop_to_closed();
        }
        Ok(report.bytes)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Graceful shutdown: send FIN, await the peer's FIN|ACK.
    ///
    /// Retry exhaustion is not an error here — the peer is unreachable and
    /// the connection is gone either way; a warning is logged and the state
    /// still drops to closed.
    pub async fn disconnect(&mut self) -> Result<(), RudpError> {
        if !self.is_connected() {
            return Err(RudpError::NotConnected);
        }
        let peer = self.peer.expect("established connection has a peer");

        self.state = ConnectionState::Closing;
        let fin = packet::control_frame(flags::FIN, 0);
        let mut buf = vec![0u8; usize::from(self.config.mtu)];

        for attempt in 1..=self.config.max_retries {
            self.socket.send_to(&fin, peer).await?;
            log::debug!(
                "[rudp] → FIN to {peer} (attempt {attempt}/{})",
                self.config.max_retries
            );

            loop {
                let received = self.socket.recv_timeout(&mut buf, self.timeout()).await?;
                let Some((n, src)) = received else {
                    log::debug!("[rudp] timeout waiting for FIN|ACK");
                    break;
                };
                if src != peer {
                    let reject = packet::control_frame(flags::FIN, 0);
                    let _ = self.socket.send_to(&reject, src).await;
                    continue;
                }
                match classify(&buf[..n], flags::FIN | flags::ACK, true) {
                    Verdict::Invalid => break,
                    // A crossing FIN cannot reach here (classify treats it
                    // as Invalid when FIN|ACK is expected), and PeerFin is
                    // unreachable for this expectation; be safe anyway.
                    Verdict::PeerFin => break,
                    Verdict::Valid(_) => {
                        log::info!("[rudp] connection closed with {peer}");
                        self.drop_to_closed();
                        return Ok(());
                    }
                }
            }
        }

        log::warn!(
            "[rudp] no FIN|ACK from {peer} after {} attempts; assuming the connection is closed",
            self.config.max_retries
        );
        self.drop_to_closed();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Getters
    // -----------------------------------------------------------------------

    /// The configured MTU of this endpoint.
    pub fn mtu(&self) -> u16 {
        self.config.mtu
    }

    /// The configured ACK timeout in milliseconds.
    pub fn timeout_ms(&self) -> u16 {
        self.config.timeout_ms
    }

    /// The configured per-fragment retry budget.
    pub fn max_retries(&self) -> u16 {
        self.config.max_retries
    }

    /// The peer's advertised MTU, available once connected.
    pub fn peer_mtu(&self) -> Result<u16, RudpError> {
        if !self.is_connected() {
            return Err(RudpError::NotConnected);
        }
        Ok(self.mtu_peer)
    }

    /// Whether per-transfer statistics are logged.
    pub fn debug(&self) -> bool {
        self.config.debug
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// Whether this endpoint was opened as a listener.
    pub fn is_listener(&self) -> bool {
        self.role == Role::Listener
    }

    /// Current FSM state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The resolved local address of the underlying socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    // -----------------------------------------------------------------------
    // Setters
    // -----------------------------------------------------------------------

    /// Change the MTU.  Forbidden while connected: the value was negotiated
    /// with the peer.
    pub fn set_mtu(&mut self, mtu: u16) -> Result<(), RudpError> {
        if self.is_connected() {
            return Err(RudpError::AlreadyConnected);
        }
        if mtu < MTU_MIN {
            return Err(RudpError::InvalidArgument(format!(
                "MTU must be at least {MTU_MIN} bytes"
            )));
        }
        self.config.mtu = mtu;
        Ok(())
    }

    /// Change the ACK timeout.  Forbidden while connected.
    pub fn set_timeout_ms(&mut self, timeout_ms: u16) -> Result<(), RudpError> {
        if self.is_connected() {
            return Err(RudpError::AlreadyConnected);
        }
        if timeout_ms < TIMEOUT_MIN_MS {
            return Err(RudpError::InvalidArgument(format!(
                "timeout must be at least {TIMEOUT_MIN_MS} ms"
            )));
        }
        self.config.timeout_ms = timeout_ms;
        Ok(())
    }

    /// Change the retry budget.  Forbidden while connected.
    pub fn set_max_retries(&mut self, max_retries: u16) -> Result<(), RudpError> {
        if self.is_connected() {
            return Err(RudpError::AlreadyConnected);
        }
        if max_retries < 1 {
            return Err(RudpError::InvalidArgument(
                "max retries must be at least 1".into(),
            ));
        }
        self.config.max_retries = max_retries;
        Ok(())
    }

    /// Toggle statistics logging.  Allowed in any state.
    pub fn set_debug(&mut self, debug: bool) {
        self.config.debug = debug;
    }

    /// Ignore the negotiated MTU and fragment by this endpoint's own MTU
    /// for subsequent sends.  Only meaningful while connected.
    pub fn force_own_mtu(&mut self) -> Result<(), RudpError> {
        if !self.is_connected() {
            return Err(RudpError::NotConnected);
        }
        self.mtu_peer = self.config.mtu;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// The MTU actually used for fragmentation: the smaller of the two
    /// endpoints' configured values.
    fn effective_mtu(&self) -> u16 {
        self.config.mtu.min(self.mtu_peer)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.config.timeout_ms))
    }

    fn syn_payload(&self) -> SynPayload {
        SynPayload {
            mtu: self.config.mtu,
            timeout_ms: self.config.timeout_ms,
            max_retries: self.config.max_retries,
            debug: u16::from(self.config.debug),
        }
    }

    /// Borrow the pieces the transfer engine works on.  Fails unless
    /// established.
    fn link(&self) -> Result<Link<'_>, RudpError> {
        if !self.is_connected() {
            return Err(RudpError::NotConnected);
        }
        Ok(Link {
            socket: &self.socket,
            peer: self.peer.expect("established connection has a peer"),
            payload_max: usize::from(self.effective_mtu()) - HEADER_SIZE,
            recv_buf_size: usize::from(self.config.mtu),
            timeout: self.timeout(),
            max_retries: self.config.max_retries,
        })
    }

    fn drop_to_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.peer = None;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(peer) = self.peer.take() {
            if self.state == ConnectionState::Established {
                // One unacknowledged FIN is the best Drop can do without an
                // executor; disconnect() is the graceful path.
                let fin = packet::control_frame(flags::FIN, 0);
                let _ = self.socket.try_send_to(&fin, peer);
                log::debug!("[rudp] dropped while established; sent best-effort FIN to {peer}");
            }
        }
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_protocol_defaults() {
        let config = Config::default();
        assert_eq!(config.mtu, 1458);
        assert_eq!(config.timeout_ms, 100);
        assert_eq!(config.max_retries, 50);
        assert!(!config.debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_tiny_mtu() {
        let config = Config {
            mtu: MTU_MIN - 1,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RudpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn config_rejects_tiny_timeout() {
        let config = Config {
            timeout_ms: TIMEOUT_MIN_MS - 1,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RudpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn config_rejects_zero_retries() {
        let config = Config {
            max_retries: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RudpError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn open_rejects_invalid_config() {
        let config = Config {
            mtu: 4,
            ..Config::default()
        };
        let result = Connection::open(Role::Listener, 0, config).await;
        assert!(matches!(result, Err(RudpError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn open_starts_idle_and_disconnected() {
        let conn = Connection::open(Role::Listener, 0, Config::default())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(!conn.is_connected());
        assert!(conn.is_listener());
        assert_ne!(conn.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn listener_cannot_connect() {
        let mut conn = Connection::open(Role::Listener, 0, Config::default())
            .await
            .unwrap();
        let peer = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            conn.connect(peer).await,
            Err(RudpError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn initiator_rejects_ipv6_peer() {
        let mut conn = Connection::open(Role::Initiator, 0, Config::default())
            .await
            .unwrap();
        let peer = "[::1]:9000".parse().unwrap();
        assert!(matches!(
            conn.connect(peer).await,
            Err(RudpError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let mut conn = Connection::open(Role::Initiator, 0, Config::default())
            .await
            .unwrap();
        assert!(matches!(
            conn.send(b"data").await,
            Err(RudpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn recv_requires_connection() {
        let mut conn = Connection::open(Role::Listener, 0, Config::default())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            conn.recv(&mut buf).await,
            Err(RudpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn disconnect_requires_connection() {
        let mut conn = Connection::open(Role::Initiator, 0, Config::default())
            .await
            .unwrap();
        assert!(matches!(
            conn.disconnect().await,
            Err(RudpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn peer_mtu_requires_connection() {
        let conn = Connection::open(Role::Initiator, 0, Config::default())
            .await
            .unwrap();
        assert!(matches!(conn.peer_mtu(), Err(RudpError::NotConnected)));
    }

    #[tokio::test]
    async fn force_own_mtu_requires_connection() {
        let mut conn = Connection::open(Role::Initiator, 0, Config::default())
            .await
            .unwrap();
        assert!(matches!(
            conn.force_own_mtu(),
            Err(RudpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn setters_work_while_disconnected() {
        let mut conn = Connection::open(Role::Initiator, 0, Config::default())
            .await
            .unwrap();

        conn.set_mtu(512).unwrap();
        assert_eq!(conn.mtu(), 512);

        conn.set_timeout_ms(250).unwrap();
        assert_eq!(conn.timeout_ms(), 250);

        conn.set_max_retries(5).unwrap();
        assert_eq!(conn.max_retries(), 5);

        conn.set_debug(true);
        assert!(conn.debug());
    }

    #[tokio::test]
    async fn setters_enforce_minimums() {
        let mut conn = Connection::open(Role::Initiator, 0, Config::default())
            .await
            .unwrap();
        assert!(conn.set_mtu(MTU_MIN - 1).is_err());
        assert!(conn.set_timeout_ms(TIMEOUT_MIN_MS - 1).is_err());
        assert!(conn.set_max_retries(0).is_err());
    }
}
