//! UDP packet format for windowed file transfer.
//!
//! ```text
//! Data / control packet (sender -> receiver):
//! [0..4]   Sequence number (i32 BE)
//! [4..8]   Payload length  (i32 BE)
//! [8..]    Payload (up to MSS bytes)
//!
//! Acknowledgment (receiver -> sender):
//! [0..4]   Acknowledged sequence number, or ACK_IN_PROGRESS (i32 BE)
//! ```
//!
//! Sequence 0 carries the destination path, data starts at 1, and the
//! stream ends with an empty-payload EOF marker.

use bytes::Bytes;
use thiserror::Error;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Acknowledgment datagram size in bytes.
pub const ACK_SIZE: usize = 4;

/// Largest UDP payload on IPv4 (65535 - 20 IP - 8 UDP).
pub const MAX_DATAGRAM: usize = 65_507;

/// Largest payload any receiver will accept.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_SIZE;

/// Smallest MSS a sender may negotiate.
pub const MIN_MSS: usize = 512;

pub const DEFAULT_MSS: usize = 512;
pub const DEFAULT_WINDOW: usize = 4;

/// Sequence number of the filename packet.
pub const FILENAME_SEQ: i32 = 0;

/// Literal EOF marker sequence number.
pub const EOF_SEQ: i32 = -1;

/// First data sequence number.
pub const FIRST_DATA_SEQ: i32 = 1;

/// Ack value meaning "destination file is being written by another sender".
pub const ACK_IN_PROGRESS: i32 = -20;

/// Datagram-level decoding failures. The receiver drops the datagram and
/// keeps serving.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("datagram of {0} bytes is shorter than the 8-byte header")]
    TooShort(usize),
    #[error("negative payload length {0}")]
    NegativeLength(i32),
    #[error("payload length {declared} exceeds the {available} bytes present")]
    Truncated { declared: usize, available: usize },
    #[error("payload length {0} exceeds the maximum payload")]
    Oversized(usize),
    #[error("invalid sequence number {0}")]
    InvalidSequence(i32),
    #[error("filename payload is not valid UTF-8")]
    InvalidFilename,
}

/// One wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: i32,
    pub payload: Bytes,
}

/// What a decoded packet means to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Filename,
    Data,
    Eof,
}

impl Packet {
    pub fn new(sequence: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            payload: payload.into(),
        }
    }

    /// Build the sequence-0 packet naming the destination path.
    pub fn filename(path: &str) -> Self {
        Self::new(FILENAME_SEQ, Bytes::copy_from_slice(path.as_bytes()))
    }

    /// Build an EOF marker. Senders use the final `next` value, the
    /// alternate form is the literal `EOF_SEQ`.
    pub fn eof(sequence: i32) -> Self {
        Self::new(sequence, Bytes::new())
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Wire size of this packet.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Both EOF forms are accepted: the literal -1 and an empty data packet.
    pub fn kind(&self) -> PacketKind {
        match self.sequence {
            FILENAME_SEQ => PacketKind::Filename,
            EOF_SEQ => PacketKind::Eof,
            _ if self.payload.is_empty() => PacketKind::Eof,
            _ => PacketKind::Data,
        }
    }

    /// Destination path carried by a filename packet. A trailing NUL from
    /// C-style senders is stripped.
    pub fn filename_str(&self) -> Result<&str, FramingError> {
        let raw = match self.payload.iter().position(|&b| b == 0) {
            Some(nul) => &self.payload[..nul],
            None => &self.payload[..],
        };
        std::str::from_utf8(raw).map_err(|_| FramingError::InvalidFilename)
    }

    /// Serialize to a freshly allocated datagram.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        encode_packet(&mut buf, self);
        buf
    }
}

/// Encode a packet into the provided buffer. Returns bytes written.
///
/// # Panics
/// Panics if `buf` is smaller than `HEADER_SIZE + payload.len()`.
pub fn encode_packet(buf: &mut [u8], packet: &Packet) -> usize {
    let total = packet.encoded_len();
    assert!(buf.len() >= total);
    assert!(packet.payload.len() <= MAX_PAYLOAD);

    buf[0..4].copy_from_slice(&packet.sequence.to_be_bytes());
    buf[4..8].copy_from_slice(&(packet.payload.len() as i32).to_be_bytes());
    buf[HEADER_SIZE..total].copy_from_slice(&packet.payload);
    total
}

/// Decode a datagram. Trailing bytes past the declared payload length are
/// ignored, since fixed-size senders pad every datagram.
pub fn decode_packet(data: &[u8]) -> Result<Packet, FramingError> {
    if data.len() < HEADER_SIZE {
        return Err(FramingError::TooShort(data.len()));
    }
    let sequence = read_i32(&data[0..4]);
    let declared = read_i32(&data[4..8]);

    if sequence < EOF_SEQ {
        return Err(FramingError::InvalidSequence(sequence));
    }
    if declared < 0 {
        return Err(FramingError::NegativeLength(declared));
    }
    let declared = declared as usize;
    if declared > MAX_PAYLOAD {
        return Err(FramingError::Oversized(declared));
    }
    let available = data.len() - HEADER_SIZE;
    if declared > available {
        return Err(FramingError::Truncated { declared, available });
    }

    Ok(Packet {
        sequence,
        payload: Bytes::copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + declared]),
    })
}

pub fn encode_ack(sequence: i32) -> [u8; ACK_SIZE] {
    sequence.to_be_bytes()
}

/// Decode an acknowledgment. Returns None if the datagram is not exactly
/// one ack long.
pub fn decode_ack(data: &[u8]) -> Option<i32> {
    if data.len() != ACK_SIZE {
        return None;
    }
    Some(read_i32(data))
}

#[inline]
fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
