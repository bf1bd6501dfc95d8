//! Connection establishment: the SYN / SYN|ACK exchange.
//!
//! Both sides piggyback their connection parameters ([`SynPayload`]) on the
//! handshake frames, so each endpoint learns the other's MTU, timeout,
//! retry budget, and debug setting before the first data fragment flows.
//! The effective MTU for the connection is the smaller of the two
//! configured values; the connection layer settles it from the returned
//! payload.
//!
//! The initiator retries its SYN up to the configured budget; the listener
//! waits indefinitely — a server with nobody talking to it is not an error.

use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::RudpError;
use crate::packet::{self, flags, SynPayload, HEADER_SIZE};
use crate::socket::RudpSocket;
use crate::validator::{classify, Verdict};

/// Initiator side: send SYN, await SYN|ACK, return the peer's parameters.
///
/// Datagrams from addresses other than `peer` are answered with a FIN and
/// do not consume the retry budget.  A FIN from the peer is an explicit
/// rejection and fails immediately with [`RudpError::ConnectionRefused`].
pub(crate) async fn initiate(
    socket: &RudpSocket,
    peer: SocketAddr,
    local: SynPayload,
    timeout: Duration,
    max_retries: u16,
) -> Result<SynPayload, RudpError> {
    let syn = packet::encode_frame(0, flags::SYN, &local.encode());
    let mut buf = vec![0u8; usize::from(local.mtu)];

    for attempt in 1..=max_retries {
        socket.send_to(&syn, peer).await?;
        log::debug!("[rudp] → SYN to {peer} (attempt {attempt}/{max_retries})");

        // Wait out this attempt; stranger datagrams restart the wait
        // without burning it.
        loop {
            let received = socket.recv_timeout(&mut buf, timeout).await?;
            let Some((n, src)) = received else {
                log::debug!("[rudp] timeout waiting for SYN|ACK ({attempt}/{max_retries})");
                break;
            };

            if src != peer {
                log::debug!("[rudp] handshake datagram from stranger {src}, rejecting with FIN");
                let fin = packet::control_frame(flags::FIN, 0);
                let _ = socket.send_to(&fin, src).await;
                continue;
            }

            match classify(&buf[..n], flags::SYN | flags::ACK, false) {
                Verdict::Invalid => {
                    log::debug!("[rudp] invalid handshake reply ({attempt}/{max_retries})");
                    break;
                }
                Verdict::PeerFin => {
                    log::debug!("[rudp] ← FIN from {peer}: connection refused");
                    return Err(RudpError::ConnectionRefused);
                }
                Verdict::Valid(_) => {
                    let Ok(theirs) = SynPayload::parse(&buf[HEADER_SIZE..n]) else {
                        log::debug!("[rudp] SYN|ACK without parameters, ignoring");
                        break;
                    };
                    if theirs.mtu < crate::connection::MTU_MIN {
                        log::debug!("[rudp] peer advertised unusable MTU {}", theirs.mtu);
                        break;
                    }
                    log::debug!(
                        "[rudp] ← SYN|ACK from {peer} (mtu={}, timeout={}ms, retries={})",
                        theirs.mtu,
                        theirs.timeout_ms,
                        theirs.max_retries
                    );
                    return Ok(theirs);
                }
            }
        }
    }

    log::debug!("[rudp] handshake with {peer} exhausted after {max_retries} attempts");
    Err(RudpError::RetriesExhausted(max_retries))
}

/// Listener side: wait for a SYN, reply SYN|ACK, return the peer's address
/// and parameters.
///
/// Invalid datagrams are dropped and the wait continues; a FIN aimed at the
/// listening socket fails the accept with [`RudpError::ConnectionRefused`].
pub(crate) async fn listen(
    socket: &RudpSocket,
    local: SynPayload,
) -> Result<(SocketAddr, SynPayload), RudpError> {
    let mut buf = vec![0u8; usize::from(local.mtu)];

    loop {
        // A listener with no peer yet may wait forever.
        let (n, src) = socket.recv_from(&mut buf).await?;

        match classify(&buf[..n], flags::SYN, false) {
            Verdict::Invalid => continue,
            Verdict::PeerFin => {
                log::debug!("[rudp] ← FIN while listening: accept aborted");
                return Err(RudpError::ConnectionRefused);
            }
            Verdict::Valid(_) => {
                // A SYN without usable parameters is malformed; keep
                // listening.
                let Ok(theirs) = SynPayload::parse(&buf[HEADER_SIZE..n]) else {
                    continue;
                };
                if theirs.mtu < crate::connection::MTU_MIN {
                    log::debug!("[rudp] peer advertised unusable MTU {}", theirs.mtu);
                    continue;
                }
                log::debug!(
                    "[rudp] ← SYN from {src} (mtu={}, timeout={}ms, retries={})",
                    theirs.mtu,
                    theirs.timeout_ms,
                    theirs.max_retries
                );

                let syn_ack =
                    packet::encode_frame(0, flags::SYN | flags::ACK, &local.encode());
                socket.send_to(&syn_ack, src).await?;
                log::debug!("[rudp] → SYN|ACK to {src}");
                return Ok((src, theirs));
            }
        }
    }
}
