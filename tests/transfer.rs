//! Integration tests for the stop-and-wait data path.
//!
//! Each test establishes a real connection over loopback with both
//! endpoints running as tokio tasks, then exercises one data-transfer
//! behavior end to end.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

use rudp::{Config, Connection, ConnectionState, Role};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Establish a connection between a fresh listener and initiator with the
/// given configs.  Returns `(initiator, listener)`.
async fn connected_pair(initiator_config: Config, listener_config: Config) -> (Connection, Connection) {
    let mut listener = Connection::open(Role::Listener, 0, listener_config)
        .await
        .expect("open listener");
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), listener.local_addr().port());

    let server = tokio::spawn(async move {
        listener.accept().await.expect("accept");
        listener
    });

    let mut initiator = Connection::open(Role::Initiator, 0, initiator_config)
        .await
        .expect("open initiator");
    initiator.connect(addr).await.expect("connect");

    (initiator, server.await.expect("listener task panicked"))
}

fn mtu_64() -> Config {
    Config {
        mtu: 64,
        ..Config::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Single-fragment message with default parameters.
#[tokio::test]
async fn single_fragment_roundtrip() {
    let (mut initiator, mut listener) = connected_pair(Config::default(), Config::default()).await;

    let server = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let n = listener.recv(&mut buf).await.expect("recv");
        (n, buf, listener)
    });

    let sent = initiator.send(b"READY").await.expect("send");
    assert_eq!(sent, 5);

    let (n, buf, _listener) = server.await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"READY");
}

/// A 200-byte message over MTU 64 travels as four fragments and reassembles
/// byte-exactly: `buf[i] == i mod 256`.
#[tokio::test]
async fn multi_fragment_reassembly() {
    let (mut initiator, mut listener) = connected_pair(mtu_64(), mtu_64()).await;

    let data: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();
    let expected = data.clone();

    let server = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let n = listener.recv(&mut buf).await.expect("recv");
        (n, buf)
    });

    let sent = initiator.send(&data).await.expect("send");
    assert_eq!(sent, 200);

    let (n, buf) = server.await.unwrap();
    assert_eq!(n, 200);
    assert_eq!(&buf[..200], &expected[..]);
}

/// Both directions carry data over the same connection.
#[tokio::test]
async fn bidirectional_ping_pong() {
    let (mut initiator, mut listener) = connected_pair(Config::default(), Config::default()).await;

    let server = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).await.expect("server recv");
        assert_eq!(&buf[..n], b"Ping!");
        listener.send(b"Pong!").await.expect("server send");
        listener
    });

    initiator.send(b"Ping!").await.expect("client send");

    let mut buf = [0u8; 64];
    let n = initiator.recv(&mut buf).await.expect("client recv");
    assert_eq!(&buf[..n], b"Pong!");

    let _listener = server.await.unwrap();
}

/// An empty message still travels (one LAST frame) and does not desync the
/// stream: the next message arrives intact.
#[tokio::test]
async fn empty_message_is_delivered_and_consumed() {
    let (mut initiator, mut listener) = connected_pair(Config::default(), Config::default()).await;

    let server = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let empty = listener.recv(&mut buf).await.expect("recv empty");
        let n = listener.recv(&mut buf).await.expect("recv follow-up");
        (empty, n, buf)
    });

    assert_eq!(initiator.send(&[]).await.expect("send empty"), 0);
    assert_eq!(initiator.send(b"after").await.expect("send follow-up"), 5);

    let (empty, n, buf) = server.await.unwrap();
    assert_eq!(empty, 0);
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"after");
}

/// A message larger than the receive buffer is truncated to capacity; the
/// bytes that fit are exact.
#[tokio::test]
async fn oversized_message_is_truncated() {
    let (mut initiator, mut listener) = connected_pair(Config::default(), Config::default()).await;

    let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
    let expected = data.clone();

    let server = tokio::spawn(async move {
        let mut buf = [0u8; 40];
        let n = listener.recv(&mut buf).await.expect("recv");
        (n, buf)
    });

    let sent = initiator.send(&data).await.expect("send");
    assert_eq!(sent, 100);

    let (n, buf) = server.await.unwrap();
    assert_eq!(n, 40);
    assert_eq!(&buf[..], &expected[..40]);
}

/// Messages keep their boundaries: A then B arrive as two receives, in
/// order, never interleaved.
#[tokio::test]
async fn message_boundaries_are_preserved() {
    let (mut initiator, mut listener) = connected_pair(mtu_64(), mtu_64()).await;

    let a: Vec<u8> = vec![0xAA; 150];
    let b: Vec<u8> = vec![0xBB; 90];

    let server = tokio::spawn(async move {
        let mut first = [0u8; 4096];
        let n1 = listener.recv(&mut first).await.expect("recv A");
        let mut second = [0u8; 4096];
        let n2 = listener.recv(&mut second).await.expect("recv B");
        (n1, first, n2, second)
    });

    initiator.send(&a).await.expect("send A");
    initiator.send(&b).await.expect("send B");

    let (n1, first, n2, second) = server.await.unwrap();
    assert_eq!(n1, 150);
    assert!(first[..150].iter().all(|&x| x == 0xAA));
    assert_eq!(n2, 90);
    assert!(second[..90].iter().all(|&x| x == 0xBB));
}

/// A large transfer over the default MTU survives intact.
#[tokio::test]
async fn large_message_roundtrip() {
    let (mut initiator, mut listener) = connected_pair(Config::default(), Config::default()).await;

    // Deterministic but non-trivial contents.
    let data: Vec<u8> = (0..100_000u32)
        .map(|i| (i.wrapping_mul(31).wrapping_add(7) % 256) as u8)
        .collect();
    let expected = data.clone();

    let server = tokio::spawn(async move {
        let mut buf = vec![0u8; 128 * 1024];
        let n = listener.recv(&mut buf).await.expect("recv");
        (n, buf)
    });

    let sent = initiator.send(&data).await.expect("send");
    assert_eq!(sent, data.len());

    let (n, buf) = server.await.unwrap();
    assert_eq!(n, expected.len());
    assert_eq!(&buf[..n], &expected[..]);
}

/// Graceful shutdown: the peer blocked in `recv` observes 0 and both sides
/// end up closed.
#[tokio::test]
async fn disconnect_wakes_blocked_receiver() {
    let (mut initiator, mut listener) = connected_pair(Config::default(), Config::default()).await;

    let server = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).await.expect("recv");
        (n, listener)
    });

    // Let the listener reach its blocking receive first.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    initiator.disconnect().await.expect("disconnect");

    let (n, listener) = server.await.unwrap();
    assert_eq!(n, 0, "peer shutdown must surface as a zero-byte receive");
    assert_eq!(listener.state(), ConnectionState::Closed);
    assert_eq!(initiator.state(), ConnectionState::Closed);
    assert!(!listener.is_connected());
    assert!(!initiator.is_connected());
}

/// After a shutdown, data operations report `NotConnected`.
#[tokio::test]
async fn operations_fail_after_disconnect() {
    let (mut initiator, mut listener) = connected_pair(Config::default(), Config::default()).await;

    let server = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let _ = listener.recv(&mut buf).await;
        listener
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    initiator.disconnect().await.expect("disconnect");
    let _listener = server.await.unwrap();

    assert!(initiator.send(b"late").await.is_err());
    let mut buf = [0u8; 8];
    assert!(initiator.recv(&mut buf).await.is_err());
}

/// A stranger's datagram neither reaches the application nor disturbs the
/// real transfer; the stranger is told FIN.
#[tokio::test]
async fn stranger_datagrams_are_rejected() {
    let (mut initiator, mut listener) = connected_pair(Config::default(), Config::default()).await;
    let listener_port = listener.local_addr().port();
    let listener_addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), listener_port);

    let server = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let n = listener.recv(&mut buf).await.expect("recv");
        (n, buf)
    });

    // A well-formed data frame from an address that is not the peer.
    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let forged = rudp::packet::encode_frame(
        0,
        rudp::packet::flags::PSH | rudp::packet::flags::LAST,
        b"forged",
    );
    stranger.send_to(&forged, listener_addr).await.unwrap();

    // Give the forged frame time to arrive ahead of the real message.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let sent = initiator.send(b"genuine").await.expect("send");
    assert_eq!(sent, 7);

    let (n, buf) = server.await.unwrap();
    assert_eq!(n, 7);
    assert_eq!(&buf[..7], b"genuine", "forged payload must not be delivered");

    // The stranger got a FIN rejection.
    let mut reject = [0u8; 64];
    let (n, _) = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        stranger.recv_from(&mut reject),
    )
    .await
    .expect("stranger should be answered")
    .unwrap();
    let header = rudp::packet::Header::parse(&reject[..n]).unwrap();
    assert_eq!(header.flags, rudp::packet::flags::FIN);
}
