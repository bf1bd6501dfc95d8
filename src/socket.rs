//! Async UDP socket abstraction.
//!
//! [`RudpSocket`] is a thin wrapper around `tokio::net::UdpSocket` that
//! moves raw datagrams.  All protocol logic lives elsewhere; this module
//! owns only byte I/O and the two receive disciplines the protocol needs:
//!
//! - [`RudpSocket::recv_from`] blocks until a datagram arrives.  Used only
//!   where the peer may legitimately take unbounded time: the listener's
//!   wait for a SYN and the receiver's wait for the first fragment of a
//!   message.
//! - [`RudpSocket::recv_timeout`] bounds the wait and reports expiry as
//!   `Ok(None)`, so the retry loops can distinguish a timeout from an OS
//!   failure.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// An async datagram socket bound to a local address.
#[derive(Debug)]
pub struct RudpSocket {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl RudpSocket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port; the resolved
    /// address is available in `local_addr`.
    pub async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Bind to `local_addr` with SO_REUSEADDR set, so a listener's
    /// well-known port can be rebound immediately after a restart.
    ///
    /// tokio's `UdpSocket` does not expose the option, so the socket is
    /// built through `socket2` and handed over once configured.
    pub async fn bind_reuse(local_addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&local_addr.into())?;
        socket.set_nonblocking(true)?;

        let inner = UdpSocket::from_std(socket.into())?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Send `frame` as a single datagram to `dest`.
    pub async fn send_to(&self, frame: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.inner.send_to(frame, dest).await?;
        Ok(())
    }

    /// Send `frame` to `dest` without awaiting.
    ///
    /// Used on the destruction path, where no executor is available.  A
    /// would-block result is reported as an error like any other.
    pub fn try_send_to(&self, frame: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.inner.try_send_to(frame, dest)?;
        Ok(())
    }

    /// Receive the next datagram, blocking until one arrives.
    ///
    /// Returns the datagram length and the source address.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    /// Receive the next datagram, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout expires with nothing received.
    pub async fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        match tokio::time::timeout(timeout, self.inner.recv_from(buf)).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}
