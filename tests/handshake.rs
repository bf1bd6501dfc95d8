//! Integration tests for connection establishment.
//!
//! Each test spins up real UDP sockets on loopback, runs the listener half
//! in a background task, and checks the states and negotiated parameters on
//! both sides.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use rudp::packet::{self, flags, HEADER_SIZE};
use rudp::{Config, Connection, ConnectionState, Role, RudpError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Open a listener on an OS-chosen port and return it with the loopback
/// address an initiator should dial.
async fn open_listener(config: Config) -> (Connection, SocketAddr) {
    let conn = Connection::open(Role::Listener, 0, config)
        .await
        .expect("open listener");
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), conn.local_addr().port());
    (conn, addr)
}

async fn open_initiator(config: Config) -> Connection {
    Connection::open(Role::Initiator, 0, config)
        .await
        .expect("open initiator")
}

/// A config with a short timeout and small retry budget so failure tests
/// finish quickly.
fn impatient() -> Config {
    Config {
        timeout_ms: 20,
        max_retries: 3,
        ..Config::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Both sides should reach `Established` after a clean handshake.
#[tokio::test]
async fn handshake_both_sides_reach_established() {
    let (mut listener, addr) = open_listener(Config::default()).await;

    let server = tokio::spawn(async move {
        listener.accept().await.expect("accept");
        listener
    });

    let mut initiator = open_initiator(Config::default()).await;
    tokio::time::timeout(Duration::from_secs(5), initiator.connect(addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    let listener = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("accept timed out")
        .expect("listener task panicked");

    assert!(initiator.is_connected());
    assert!(listener.is_connected());
    assert_eq!(initiator.state(), ConnectionState::Established);
    assert_eq!(listener.state(), ConnectionState::Established);
}

/// The handshake must carry each side's parameters to the other.
#[tokio::test]
async fn handshake_exchanges_parameters() {
    let listener_config = Config {
        mtu: 64,
        ..Config::default()
    };
    let (mut listener, addr) = open_listener(listener_config).await;

    let server = tokio::spawn(async move {
        listener.accept().await.expect("accept");
        listener
    });

    let mut initiator = open_initiator(Config::default()).await;
    initiator.connect(addr).await.expect("connect");
    let listener = server.await.unwrap();

    assert_eq!(initiator.peer_mtu().unwrap(), 64);
    assert_eq!(listener.peer_mtu().unwrap(), 1458);
}

/// Parameter setters are guarded once the connection is up; the MTU
/// override flips the negotiated value back to this endpoint's own.
#[tokio::test]
async fn established_connection_locks_parameters() {
    let listener_config = Config {
        mtu: 64,
        ..Config::default()
    };
    let (mut listener, addr) = open_listener(listener_config).await;

    let server = tokio::spawn(async move {
        listener.accept().await.expect("accept");
        listener
    });

    let mut initiator = open_initiator(Config::default()).await;
    initiator.connect(addr).await.expect("connect");
    let _listener = server.await.unwrap();

    assert!(matches!(
        initiator.set_mtu(512),
        Err(RudpError::AlreadyConnected)
    ));
    assert!(matches!(
        initiator.set_timeout_ms(500),
        Err(RudpError::AlreadyConnected)
    ));
    assert!(matches!(
        initiator.set_max_retries(10),
        Err(RudpError::AlreadyConnected)
    ));

    // Debug toggles in any state; the MTU override is Established-only.
    initiator.set_debug(true);
    assert_eq!(initiator.peer_mtu().unwrap(), 64);
    initiator.force_own_mtu().unwrap();
    assert_eq!(initiator.peer_mtu().unwrap(), 1458);
}

/// Connecting to an address where nobody listens must fail after the retry
/// budget rather than hang forever.
#[tokio::test]
async fn connect_to_silent_peer_exhausts_retries() {
    // Bind and immediately drop a socket so the port is unused; any SYN
    // sent there receives no reply.
    let silent_addr = {
        let tmp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        tmp.local_addr().unwrap()
    };

    let mut initiator = open_initiator(impatient()).await;
    let result = initiator.connect(silent_addr).await;

    assert!(
        matches!(result, Err(RudpError::RetriesExhausted(3))),
        "expected RetriesExhausted, got {result:?}"
    );
    assert_eq!(initiator.state(), ConnectionState::Closed);
}

/// A FIN answering our SYN is an explicit rejection: `connect` must fail
/// with `ConnectionRefused`, not retry.
#[tokio::test]
async fn fin_reply_refuses_the_connection() {
    // The "listener" here is a bare socket that rejects the handshake.
    let hostile = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let hostile_addr = hostile.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let (_, src) = hostile.recv_from(&mut buf).await.unwrap();
        let fin = packet::control_frame(flags::FIN, 0);
        hostile.send_to(&fin, src).await.unwrap();
    });

    let mut initiator = open_initiator(impatient()).await;
    let result = initiator.connect(hostile_addr).await;

    assert!(
        matches!(result, Err(RudpError::ConnectionRefused)),
        "expected ConnectionRefused, got {result:?}"
    );
    assert_eq!(initiator.state(), ConnectionState::Closed);
}

/// Garbage datagrams must not take a listener out of `accept`; the next
/// legitimate SYN still succeeds.
#[tokio::test]
async fn listener_survives_malformed_datagrams() {
    let (mut listener, addr) = open_listener(Config::default()).await;

    let server = tokio::spawn(async move {
        listener.accept().await.expect("accept");
        listener
    });

    let noisy = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    noisy.send_to(b"not a frame", addr).await.unwrap();
    // A corrupt SYN: valid layout, broken checksum.
    let mut bad_syn = packet::encode_frame(0, flags::SYN, &[0u8; 8]);
    bad_syn[HEADER_SIZE] ^= 0xFF;
    noisy.send_to(&bad_syn, addr).await.unwrap();

    // Let the noise land before the real SYN goes out.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut initiator = open_initiator(Config::default()).await;
    initiator.connect(addr).await.expect("connect");

    let listener = server.await.unwrap();
    assert!(listener.is_connected());
}

/// A second connect on an already-established initiator is refused locally.
#[tokio::test]
async fn connect_twice_is_rejected() {
    let (mut listener, addr) = open_listener(Config::default()).await;

    let server = tokio::spawn(async move {
        listener.accept().await.expect("accept");
        listener
    });

    let mut initiator = open_initiator(Config::default()).await;
    initiator.connect(addr).await.expect("connect");
    let _listener = server.await.unwrap();

    assert!(matches!(
        initiator.connect(addr).await,
        Err(RudpError::AlreadyConnected)
    ));
}
