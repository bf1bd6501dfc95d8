//! Stop-and-wait data-transfer engine.
//!
//! One message is carried as a contiguous run of fragments with `seq_num`
//! 0, 1, 2, …, the last of which carries the LAST flag.  The sender
//! transmits one fragment, waits for its ACK, then moves on; the receiver
//! ACKs every fragment it accepts and re-ACKs the previous one on
//! duplicates and reordering.
//!
//! The pure state machines ([`Fragmenter`], [`Reassembler`]) manage the
//! slicing and in-order reassembly; [`send_message`] / [`recv_message`]
//! drive the retry loops over a [`Link`].  All socket I/O stays in the
//! driver functions, keeping the state machines unit-testable.
//!
//! # Retry accounting
//!
//! Per fragment, only *missing-fragment events* — timeouts, corrupt frames,
//! stale ACKs — consume the retry budget.  Datagrams from a stranger source
//! and duplicate fragments are handled on a skip-tick path: the stranger is
//! told FIN, the duplicate is re-ACKed, and the counter stays put, so
//! neither can starve a healthy transfer.

use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::RudpError;
use crate::packet::{self, flags, HEADER_SIZE};
use crate::socket::RudpSocket;
use crate::validator::{classify, Verdict};

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// Borrowed view of one established connection, as the engine needs it.
pub(crate) struct Link<'a> {
    pub socket: &'a RudpSocket,
    pub peer: SocketAddr,
    /// Payload bytes per fragment: effective MTU minus the header.
    pub payload_max: usize,
    /// Inbound datagram buffer size (the local MTU).
    pub recv_buf_size: usize,
    pub timeout: Duration,
    pub max_retries: u16,
}

impl Link<'_> {
    /// Tell a stranger source to go away.  Failures are ignored; the
    /// stranger is not owed reliability.
    async fn reject_stranger(&self, stranger: SocketAddr) {
        log::debug!("[rudp] datagram from stranger {stranger}, rejecting with FIN");
        let fin = packet::control_frame(flags::FIN, 0);
        let _ = self.socket.send_to(&fin, stranger).await;
    }

    /// Acknowledge a peer shutdown observed mid-operation.
    async fn acknowledge_fin(&self) {
        log::debug!("[rudp] ← FIN from {}; → FIN|ACK", self.peer);
        let fin_ack = packet::control_frame(flags::FIN | flags::ACK, 0);
        let _ = self.socket.send_to(&fin_ack, self.peer).await;
    }
}

// ---------------------------------------------------------------------------
// Transfer outcome and statistics
// ---------------------------------------------------------------------------

/// What a completed send looks like from the connection's side.
pub(crate) struct SendReport {
    /// Payload bytes acknowledged by the peer.
    pub bytes: usize,
    /// The peer sent FIN mid-transfer; the connection must drop to closed.
    pub peer_closed: bool,
    pub stats: SendStats,
}

/// What a completed receive looks like from the connection's side.
pub(crate) struct RecvReport {
    /// Payload bytes written into the caller's buffer.
    pub bytes: usize,
    pub peer_closed: bool,
    pub stats: RecvStats,
}

/// Wire-level accounting for one outbound message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendStats {
    /// Fragments acknowledged.
    pub fragments: u64,
    /// Datagrams actually put on the wire, retransmissions included.
    pub datagrams: u64,
    /// Bytes actually put on the wire, headers included.
    pub wire_bytes: u64,
    /// Fragment transmissions beyond the first attempt.
    pub retransmissions: u64,
}

/// Wire-level accounting for one inbound message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecvStats {
    /// Distinct fragments accepted.
    pub fragments: u64,
    /// Datagrams observed on the wire, duplicates included.
    pub datagrams: u64,
    /// Bytes observed on the wire, headers included.
    pub wire_bytes: u64,
    /// Duplicate fragments re-acknowledged and discarded.
    pub duplicates: u64,
}

// ---------------------------------------------------------------------------
// Fragmenter
// ---------------------------------------------------------------------------

/// One outbound fragment: a window into the caller's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub seq_num: u32,
    pub flags: u8,
    pub payload: &'a [u8],
}

/// Slices a message into PSH fragments of at most `payload_max` bytes.
///
/// An empty message still yields exactly one fragment (PSH|LAST with no
/// payload), so the receiver always sees a LAST to terminate on.
#[derive(Debug)]
pub struct Fragmenter<'a> {
    data: &'a [u8],
    payload_max: usize,
    next: u64,
    total: u64,
}

impl<'a> Fragmenter<'a> {
    /// # Panics
    ///
    /// Panics if `payload_max` is zero; the connection layer guarantees the
    /// effective MTU exceeds the header size.
    pub fn new(data: &'a [u8], payload_max: usize) -> Self {
        assert!(payload_max > 0, "payload_max must be positive");
        let total = (data.len().div_ceil(payload_max) as u64).max(1);
        Self {
            data,
            payload_max,
            next: 0,
            total,
        }
    }

    /// Number of fragments this message will occupy.
    pub fn expected_fragments(&self) -> u64 {
        self.total
    }
}

impl<'a> Iterator for Fragmenter<'a> {
    type Item = Fragment<'a>;

    fn next(&mut self) -> Option<Fragment<'a>> {
        if self.next == self.total {
            return None;
        }
        let seq = self.next;
        self.next += 1;

        let start = (seq as usize) * self.payload_max;
        let end = (start + self.payload_max).min(self.data.len());
        let last = seq + 1 == self.total;

        Some(Fragment {
            seq_num: seq as u32,
            flags: if last { flags::PSH | flags::LAST } else { flags::PSH },
            payload: &self.data[start.min(self.data.len())..end],
        })
    }
}

// ---------------------------------------------------------------------------
// Reassembler
// ---------------------------------------------------------------------------

/// Decision for one inbound fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// New in-order fragment; payload copied into place.
    Accepted {
        /// The message is complete (LAST seen) or the buffer is exhausted.
        finished: bool,
    },
    /// Same `seq_num` as the previous fragment; the ACK was likely lost.
    Duplicate,
    /// Neither the previous fragment nor its successor.
    OutOfOrder,
}

/// In-order reassembly into a caller-provided buffer.
///
/// Fragments land at `seq_num × payload_max`, computed in 64-bit space so
/// long messages over small MTUs cannot wrap the offset.  Payload beyond
/// the buffer's capacity is truncated.
#[derive(Debug)]
pub struct Reassembler<'a> {
    buf: &'a mut [u8],
    payload_max: usize,
    prev_seq: Option<u32>,
    /// Bytes actually written into `buf`.
    written: usize,
    /// Declared payload bytes observed, pre-truncation; drives the
    /// buffer-exhausted exit.
    observed: u64,
}

impl<'a> Reassembler<'a> {
    pub fn new(buf: &'a mut [u8], payload_max: usize) -> Self {
        assert!(payload_max > 0, "payload_max must be positive");
        Self {
            buf,
            payload_max,
            prev_seq: None,
            written: 0,
            observed: 0,
        }
    }

    /// Feed one validated fragment.
    ///
    /// On [`Feed::Duplicate`] and [`Feed::OutOfOrder`] the caller should
    /// re-ACK [`Reassembler::ack_seq`]; on [`Feed::Accepted`] it should ACK
    /// the fragment just fed.
    pub fn feed(&mut self, seq_num: u32, last: bool, payload: &[u8]) -> Feed {
        match self.prev_seq {
            Some(prev) if seq_num == prev => return Feed::Duplicate,
            Some(prev) if seq_num != prev.wrapping_add(1) => return Feed::OutOfOrder,
            _ => {}
        }

        let offset = u64::from(seq_num) * self.payload_max as u64;
        if offset < self.buf.len() as u64 {
            let offset = offset as usize;
            let n = payload.len().min(self.buf.len() - offset);
            self.buf[offset..offset + n].copy_from_slice(&payload[..n]);
            self.written = self.written.max(offset + n);
        }
        self.observed += payload.len() as u64;
        self.prev_seq = Some(seq_num);

        Feed::Accepted {
            finished: last || self.observed >= self.buf.len() as u64,
        }
    }

    /// Sequence number to acknowledge: the last fragment accepted.
    ///
    /// Meaningless before the first [`Feed::Accepted`]; the drivers only
    /// call it afterwards.
    pub fn ack_seq(&self) -> u32 {
        self.prev_seq.unwrap_or(0)
    }

    /// Bytes written into the caller's buffer so far.
    pub fn bytes(&self) -> usize {
        self.written
    }
}

// ---------------------------------------------------------------------------
// Send driver
// ---------------------------------------------------------------------------

/// Send one message over an established connection.
///
/// Returns the number of payload bytes acknowledged, or a report flagging
/// that the peer closed mid-transfer (normalised to 0 bytes by the caller).
pub(crate) async fn send_message(link: &Link<'_>, data: &[u8]) -> Result<SendReport, RudpError> {
    let fragmenter = Fragmenter::new(data, link.payload_max);
    let expected = fragmenter.expected_fragments();
    let mut stats = SendStats::default();
    let mut bytes = 0usize;
    let mut prev_ack: Option<u32> = None;
    let mut ack_buf = vec![0u8; link.recv_buf_size];

    log::debug!(
        "[rudp] sending {} bytes as {expected} fragment(s) of up to {} bytes",
        data.len(),
        link.payload_max
    );

    for fragment in fragmenter {
        let frame = packet::encode_frame(fragment.seq_num, fragment.flags, fragment.payload);
        let is_final = fragment.flags & flags::LAST != 0;
        let mut tries: u16 = 0;

        'fragment: loop {
            if tries == link.max_retries {
                return Err(RudpError::RetriesExhausted(link.max_retries));
            }
            if tries > 0 {
                stats.retransmissions += 1;
            }

            link.socket.send_to(&frame, link.peer).await?;
            stats.datagrams += 1;
            stats.wire_bytes += frame.len() as u64;
            log::debug!(
                "[rudp] → {} seq={} len={} (attempt {}/{})",
                if is_final { "PSH|LAST" } else { "PSH" },
                fragment.seq_num,
                fragment.payload.len(),
                tries + 1,
                link.max_retries
            );

            // Wait for the matching ACK; stranger datagrams do not consume
            // the attempt.
            loop {
                let received = link.socket.recv_timeout(&mut ack_buf, link.timeout).await?;
                let Some((n, src)) = received else {
                    log::debug!(
                        "[rudp] timeout waiting for ACK seq={} ({}/{})",
                        fragment.seq_num,
                        tries + 1,
                        link.max_retries
                    );
                    tries += 1;
                    continue 'fragment;
                };

                if src != link.peer {
                    link.reject_stranger(src).await;
                    continue;
                }

                match classify(&ack_buf[..n], flags::ACK, true) {
                    Verdict::Invalid => {
                        tries += 1;
                        continue 'fragment;
                    }
                    Verdict::PeerFin => {
                        link.acknowledge_fin().await;
                        return Ok(SendReport {
                            bytes: 0,
                            peer_closed: true,
                            stats,
                        });
                    }
                    Verdict::Valid(ack) => {
                        if prev_ack == Some(ack.seq_num) && !is_final {
                            // The peer re-ACKed the previous fragment; it
                            // saw this transmission as a duplicate.  Move on.
                            log::debug!(
                                "[rudp] ← duplicate ACK seq={}, continuing",
                                ack.seq_num
                            );
                            break 'fragment;
                        }
                        if u64::from(ack.seq_num) < u64::from(fragment.seq_num) {
                            log::debug!(
                                "[rudp] ← stale ACK seq={} while sending seq={}",
                                ack.seq_num,
                                fragment.seq_num
                            );
                            tries += 1;
                            continue 'fragment;
                        }
                        log::debug!("[rudp] ← ACK seq={}", ack.seq_num);
                        prev_ack = Some(ack.seq_num);
                        break 'fragment;
                    }
                }
            }
        }

        stats.fragments += 1;
        bytes += fragment.payload.len();
    }

    Ok(SendReport {
        bytes,
        peer_closed: false,
        stats,
    })
}

// ---------------------------------------------------------------------------
// Receive driver
// ---------------------------------------------------------------------------

/// Receive one message into `buf`, blocking until its first fragment
/// arrives.
pub(crate) async fn recv_message(
    link: &Link<'_>,
    buf: &mut [u8],
) -> Result<RecvReport, RudpError> {
    let mut stats = RecvStats::default();
    let mut frame_buf = vec![0u8; link.recv_buf_size];
    let mut reassembler = Reassembler::new(buf, link.payload_max);

    // First fragment: the peer may take as long as it likes to start a
    // message, so the wait is unbounded.  Invalid frames still consume the
    // retry budget.
    let mut tries: u16 = 0;
    let first = loop {
        if tries == link.max_retries {
            return Err(RudpError::RetriesExhausted(link.max_retries));
        }

        let (n, src) = link.socket.recv_from(&mut frame_buf).await?;
        stats.datagrams += 1;
        stats.wire_bytes += n as u64;

        if src != link.peer {
            link.reject_stranger(src).await;
            continue;
        }

        match classify(&frame_buf[..n], flags::PSH, true) {
            Verdict::Invalid => {
                tries += 1;
                continue;
            }
            Verdict::PeerFin => {
                link.acknowledge_fin().await;
                return Ok(RecvReport {
                    bytes: 0,
                    peer_closed: true,
                    stats,
                });
            }
            Verdict::Valid(header) => break (header, n),
        }
    };

    let (header, n) = first;
    let outcome = reassembler.feed(
        header.seq_num,
        header.flags & flags::LAST != 0,
        &frame_buf[HEADER_SIZE..n],
    );
    stats.fragments += 1;
    log::debug!(
        "[rudp] ← {} seq={} len={}; → ACK",
        if header.flags & flags::LAST != 0 { "PSH|LAST" } else { "PSH" },
        header.seq_num,
        header.length
    );
    let ack = packet::control_frame(flags::ACK, reassembler.ack_seq());
    link.socket.send_to(&ack, link.peer).await?;

    if matches!(outcome, Feed::Accepted { finished: true }) {
        return Ok(RecvReport {
            bytes: reassembler.bytes(),
            peer_closed: false,
            stats,
        });
    }

    // Subsequent fragments, each with a fresh retry budget.  Duplicates and
    // reordering re-ACK without consuming it.
    loop {
        let mut tries: u16 = 0;
        let (header, n) = loop {
            if tries == link.max_retries {
                return Err(RudpError::RetriesExhausted(link.max_retries));
            }

            let received = link.socket.recv_timeout(&mut frame_buf, link.timeout).await?;
            let Some((n, src)) = received else {
                log::debug!(
                    "[rudp] timeout waiting for fragment ({}/{})",
                    tries + 1,
                    link.max_retries
                );
                tries += 1;
                continue;
            };
            stats.datagrams += 1;
            stats.wire_bytes += n as u64;

            if src != link.peer {
                link.reject_stranger(src).await;
                continue;
            }

            match classify(&frame_buf[..n], flags::PSH, true) {
                Verdict::Invalid => {
                    tries += 1;
                    continue;
                }
                Verdict::PeerFin => {
                    link.acknowledge_fin().await;
                    return Ok(RecvReport {
                        bytes: 0,
                        peer_closed: true,
                        stats,
                    });
                }
                Verdict::Valid(header) => break (header, n),
            }
        };

        let last = header.flags & flags::LAST != 0;
        match reassembler.feed(header.seq_num, last, &frame_buf[HEADER_SIZE..n]) {
            Feed::Duplicate => {
                log::debug!(
                    "[rudp] ← duplicate fragment seq={}; → ACK seq={}",
                    header.seq_num,
                    reassembler.ack_seq()
                );
                stats.duplicates += 1;
                let ack = packet::control_frame(flags::ACK, reassembler.ack_seq());
                link.socket.send_to(&ack, link.peer).await?;
            }
            Feed::OutOfOrder => {
                log::debug!(
                    "[rudp] ← out-of-order fragment seq={}; → ACK seq={}",
                    header.seq_num,
                    reassembler.ack_seq()
                );
                let ack = packet::control_frame(flags::ACK, reassembler.ack_seq());
                link.socket.send_to(&ack, link.peer).await?;
            }
            Feed::Accepted { finished } => {
                stats.fragments += 1;
                log::debug!(
                    "[rudp] ← {} seq={} len={}; → ACK",
                    if last { "PSH|LAST" } else { "PSH" },
                    header.seq_num,
                    header.length
                );
                let ack = packet::control_frame(flags::ACK, header.seq_num);
                link.socket.send_to(&ack, link.peer).await?;
                if finished {
                    return Ok(RecvReport {
                        bytes: reassembler.bytes(),
                        peer_closed: false,
                        stats,
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
