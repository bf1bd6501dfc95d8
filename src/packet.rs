//! Wire-format definitions for protocol frames.
//!
//! Every datagram exchanged between peers is a *frame*: a fixed 12-byte
//! header, optionally followed by payload bytes.  This module is responsible
//! for:
//! - Defining the on-wire binary layout (header fields, flags, the handshake
//!   parameter payload).
//! - Serialising frames into byte buffers ready for transmission.
//! - Parsing raw byte slices back into headers, returning errors for
//!   truncated input.
//! - Computing and verifying the one's-complement checksum.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Wire layout
//!
//! ```text
//!  0       4       6       8   9        12
//!  ├───────┼───────┼───────┼───┼────────┤
//!  │seq_num│length │chksum │flg│reserved│ payload …
//!  └───────┴───────┴───────┴───┴────────┘
//!     u32     u16     u16   u8   [u8;3]
//! ```
//!
//! All multi-byte fields are big-endian.  Frames carrying the SYN flag
//! append an 8-byte [`SynPayload`] with the sender's connection parameters.

use thiserror::Error;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Synchronise — connection is being established.
    pub const SYN: u8 = 0x01;
    /// Acknowledgement of a fragment (or of a SYN / FIN).
    pub const ACK: u8 = 0x02;
    /// Push — the frame carries message data.
    pub const PSH: u8 = 0x04;
    /// This is the last fragment of the current message.
    pub const LAST: u8 = 0x08;
    /// Finish — connection is closing (or a rejection notice).
    pub const FIN: u8 = 0x10;
}

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Size of the handshake parameter payload in bytes.
pub const SYN_PAYLOAD_SIZE: usize = 8;

/// Byte offset of the checksum field within the header.
const CHECKSUM_OFFSET: usize = 6;

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer shorter than the structure being parsed.
    #[error("buffer too short for a frame header")]
    BufferTooShort,
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fixed-size frame header.
///
/// `seq_num` restarts at 0 for every message and counts fragments, not
/// bytes.  `length` is the payload size after the header; control frames
/// carry 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Index of this fragment within the current message.
    pub seq_num: u32,
    /// Payload bytes following the header.
    pub length: u16,
    /// One's-complement checksum over the whole frame.
    pub checksum: u16,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
}

impl Header {
    /// Parse a header from the front of a raw datagram.
    ///
    /// Only splits the fields; checksum and length verification are the
    /// validator's job.  The three reserved bytes are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_SIZE {
            return Err(PacketError::BufferTooShort);
        }
        Ok(Self {
            seq_num: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            checksum: u16::from_be_bytes([buf[6], buf[7]]),
            flags: buf[8],
        })
    }

    /// Write the header into the first [`HEADER_SIZE`] bytes of `out`,
    /// zeroing the reserved bytes.
    fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.seq_num.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        out[8] = self.flags;
        out[9..12].fill(0);
    }
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// One's-complement 16-bit checksum over `bytes`.
///
/// The input is read as a sequence of big-endian 16-bit words; an odd
/// trailing byte is zero-padded on the right.  Carries out of the low 16
/// bits are folded back in until none remain, then the sum is inverted.
pub fn checksum(bytes: &[u8]) -> u16 {
    checksum_of(bytes.iter().copied())
}

/// Checksum of a frame with its checksum field treated as zero.
///
/// Used for verification: the sender computed the stored value over exactly
/// this view of the frame.
fn checksum_with_field_zeroed(frame: &[u8]) -> u16 {
    checksum_of(frame.iter().enumerate().map(|(i, &b)| {
        if i == CHECKSUM_OFFSET || i == CHECKSUM_OFFSET + 1 {
            0
        } else {
            b
        }
    }))
}

fn checksum_of<I: Iterator<Item = u8>>(mut bytes: I) -> u16 {
    let mut sum: u32 = 0;
    loop {
        match (bytes.next(), bytes.next()) {
            (Some(hi), Some(lo)) => sum += u32::from(u16::from_be_bytes([hi, lo])),
            (Some(hi), None) => {
                sum += u32::from(hi) << 8;
                break;
            }
            (None, _) => break,
        }
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Verify the checksum of a complete frame.
///
/// Returns `false` for frames shorter than a header.
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < HEADER_SIZE {
        return false;
    }
    let stored = u16::from_be_bytes([frame[CHECKSUM_OFFSET], frame[CHECKSUM_OFFSET + 1]]);
    checksum_with_field_zeroed(frame) == stored
}

// ---------------------------------------------------------------------------
// Frame construction
// ---------------------------------------------------------------------------

/// Serialise a complete frame: header plus `payload`, checksum filled in.
///
/// The header is first written with a zero checksum, then the checksum is
/// computed over the whole frame and patched into place.
pub fn encode_frame(seq_num: u32, frame_flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_SIZE + payload.len()];
    let header = Header {
        seq_num,
        length: payload.len() as u16,
        checksum: 0,
        flags: frame_flags,
    };
    header.write(&mut frame);
    frame[HEADER_SIZE..].copy_from_slice(payload);

    let sum = checksum(&frame);
    frame[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
    frame
}

/// Serialise a control frame (ACK, FIN, FIN|ACK): header only, no payload.
pub fn control_frame(frame_flags: u8, seq_num: u32) -> Vec<u8> {
    encode_frame(seq_num, frame_flags, &[])
}

// ---------------------------------------------------------------------------
// Handshake parameter payload
// ---------------------------------------------------------------------------

/// Connection parameters exchanged inside SYN and SYN|ACK frames.
///
/// `debug` is carried as a full 16-bit field on the wire (0 = off).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynPayload {
    /// The sender's configured MTU in bytes.
    pub mtu: u16,
    /// The sender's ACK timeout in milliseconds.
    pub timeout_ms: u16,
    /// The sender's retry budget per fragment.
    pub max_retries: u16,
    /// Non-zero when the sender runs in debug mode.
    pub debug: u16,
}

impl SynPayload {
    /// Serialise into the 8-byte wire representation.
    pub fn encode(&self) -> [u8; SYN_PAYLOAD_SIZE] {
        let mut out = [0u8; SYN_PAYLOAD_SIZE];
        out[0..2].copy_from_slice(&self.mtu.to_be_bytes());
        out[2..4].copy_from_slice(&self.timeout_ms.to_be_bytes());
        out[4..6].copy_from_slice(&self.max_retries.to_be_bytes());
        out[6..8].copy_from_slice(&self.debug.to_be_bytes());
        out
    }

    /// Parse the parameter payload from the bytes following a SYN header.
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < SYN_PAYLOAD_SIZE {
            return Err(PacketError::BufferTooShort);
        }
        Ok(Self {
            mtu: u16::from_be_bytes([buf[0], buf[1]]),
            timeout_ms: u16::from_be_bytes([buf[2], buf[3]]),
            max_retries: u16::from_be_bytes([buf[4], buf[5]]),
            debug: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
