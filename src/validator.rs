//! Inbound datagram classification.
//!
//! [`classify`] decides whether an arriving datagram is a well-formed frame
//! of the kind the current operation expects, and recognises an unsolicited
//! FIN for what it is: a rejection during handshake, or a shutdown request
//! mid-connection.
//!
//! The outcome is a three-valued [`Verdict`], never a sentinel integer.
//! This module only classifies; all socket I/O is the caller's
//! responsibility — on [`Verdict::PeerFin`] with an active connection, the
//! caller owes the peer a FIN|ACK and must drop its own state to closed.

use crate::packet::{self, flags, Header, HEADER_SIZE};

/// Outcome of classifying one inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A well-formed frame matching the expectation; header attached.
    Valid(Header),
    /// Malformed, corrupt, or the wrong kind of frame.  Retryable.
    Invalid,
    /// The peer sent a bare FIN: a handshake rejection when not connected,
    /// a shutdown request when connected.
    PeerFin,
}

/// Classify `datagram` against the flags the current operation expects.
///
/// `connected` selects how an unsolicited FIN is interpreted.  The checks,
/// in order:
///
/// 1. shorter than a header → [`Verdict::Invalid`];
/// 2. checksum mismatch → [`Verdict::Invalid`];
/// 3. declared length disagreeing with the datagram size → [`Verdict::Invalid`];
/// 4. a bare FIN (when not itself expected) → [`Verdict::PeerFin`] if it can
///    be a rejection or shutdown, [`Verdict::Invalid`] otherwise;
/// 5. any other flag mismatch → [`Verdict::Invalid`], except that a
///    data-receive expectation (`PSH`) also accepts `PSH|LAST`.
pub fn classify(datagram: &[u8], expected_flags: u8, connected: bool) -> Verdict {
    if datagram.len() < HEADER_SIZE {
        log::debug!(
            "[rudp] frame too small: {} bytes, minimum is {HEADER_SIZE}",
            datagram.len()
        );
        return Verdict::Invalid;
    }

    // Length is guaranteed by the size check above.
    let header = match Header::parse(datagram) {
        Ok(h) => h,
        Err(_) => return Verdict::Invalid,
    };

    if !packet::verify(datagram) {
        log::debug!(
            "[rudp] checksum mismatch on frame with flags {:#04x}",
            header.flags
        );
        return Verdict::Invalid;
    }

    if usize::from(header.length) != datagram.len() - HEADER_SIZE {
        log::debug!(
            "[rudp] length mismatch: declared {}, observed {}",
            header.length,
            datagram.len() - HEADER_SIZE
        );
        return Verdict::Invalid;
    }

    // An unsolicited FIN. During handshake it answers our SYN (an explicit
    // rejection); mid-connection it is a shutdown request the caller must
    // acknowledge with FIN|ACK before closing.
    if header.flags == flags::FIN
        && expected_flags != flags::FIN
        && expected_flags != (flags::FIN | flags::ACK)
    {
        if !connected {
            if expected_flags & flags::SYN != 0 {
                return Verdict::PeerFin;
            }
            log::debug!("[rudp] FIN received with no active connection");
            return Verdict::Invalid;
        }
        return Verdict::PeerFin;
    }

    if header.flags != expected_flags {
        // The receiver waits with a plain PSH expectation but the final
        // fragment legitimately carries PSH|LAST.
        let data_frame =
            expected_flags == flags::PSH && header.flags == (flags::PSH | flags::LAST);
        if !data_frame {
            log::debug!(
                "[rudp] flags mismatch: expected {:#04x}, got {:#04x}",
                expected_flags,
                header.flags
            );
            return Verdict::Invalid;
        }
    }

    Verdict::Valid(header)
}
