//! Per-session receive buffer for out-of-order data packets.
//!
//! Packets ahead of the expected sequence number are parked in a sparse
//! map. Whenever the expected packet is present, the longest contiguous run
//! starting there is written to the sink and dropped from the map.
//!
//! `capacity` bounds how far ahead of `expected` a packet may be parked.
//! A capacity of 1 degenerates to stop-and-wait: only the expected packet is
//! ever accepted.

use std::collections::BTreeMap;
use std::io::{self, Write};

use bytes::Bytes;

use crate::protocol::FIRST_DATA_SEQ;

/// Result of offering one data packet to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Newly parked, will be written once contiguous.
    Buffered,
    /// Already parked and waiting.
    Duplicate,
    /// Already written to the sink.
    Stale,
    /// Too far ahead of the expected sequence number.
    OutOfRange,
}

impl Insert {
    /// Whether the sender should be acknowledged. Duplicates and stale
    /// packets are re-acked since the first ack may have been lost.
    #[inline]
    pub fn should_ack(self) -> bool {
        !matches!(self, Insert::OutOfRange)
    }
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drained {
    pub first: i32,
    pub packets: u32,
    pub bytes: u64,
}

impl Drained {
    #[inline]
    pub fn last(&self) -> i32 {
        self.first + self.packets as i32 - 1
    }
}

#[derive(Debug)]
pub struct ReassemblyBuffer {
    expected: i32,
    capacity: usize,
    pending: BTreeMap<i32, Bytes>,
}

impl ReassemblyBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            expected: FIRST_DATA_SEQ,
            capacity: capacity.max(1),
            pending: BTreeMap::new(),
        }
    }

    /// Next sequence number required for in-order delivery.
    #[inline]
    pub fn expected(&self) -> i32 {
        self.expected
    }

    /// Number of packets parked ahead of `expected`.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start over for a new file.
    pub fn reset(&mut self) {
        self.expected = FIRST_DATA_SEQ;
        self.pending.clear();
    }

    /// Park a data packet. Never writes.
    pub fn insert(&mut self, seq: i32, payload: Bytes) -> Insert {
        if seq < self.expected {
            return Insert::Stale;
        }
        if (seq - self.expected) as usize >= self.capacity {
            return Insert::OutOfRange;
        }
        if self.pending.contains_key(&seq) {
            return Insert::Duplicate;
        }
        self.pending.insert(seq, payload);
        Insert::Buffered
    }

    /// Write the contiguous run starting at `expected` into `sink`.
    ///
    /// On a write error the failing packet stays parked and `expected`
    /// does not move past it.
    pub fn drain_into<W: Write>(&mut self, sink: &mut W) -> io::Result<Drained> {
        let mut drained = Drained {
            first: self.expected,
            ..Drained::default()
        };
        while let Some(payload) = self.pending.get(&self.expected) {
            sink.write_all(payload)?;
            drained.packets += 1;
            drained.bytes += payload.len() as u64;
            self.pending.remove(&self.expected);
            self.expected += 1;
        }
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seq: i32) -> Bytes {
        Bytes::from(vec![seq as u8; 3])
    }

    #[test]
    fn in_order_packets_flush_immediately() {
        let mut buf = ReassemblyBuffer::new(8);
        let mut out = Vec::new();
        for seq in 1..=3 {
            assert_eq!(buf.insert(seq, chunk(seq)), Insert::Buffered);
            let d = buf.drain_into(&mut out).unwrap();
            assert_eq!((d.first, d.packets), (seq, 1));
        }
        assert_eq!(out, vec![1, 1, 1, 2, 2, 2, 3, 3, 3]);
        assert_eq!(buf.expected(), 4);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn gap_holds_back_later_packets() {
        let mut buf = ReassemblyBuffer::new(8);
        let mut out = Vec::new();

        buf.insert(3, chunk(3));
        buf.insert(2, chunk(2));
        assert_eq!(buf.drain_into(&mut out).unwrap().packets, 0);
        assert!(out.is_empty());

        buf.insert(1, chunk(1));
        let d = buf.drain_into(&mut out).unwrap();
        assert_eq!((d.first, d.last(), d.bytes), (1, 3, 9));
        assert_eq!(out, vec![1, 1, 1, 2, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn duplicates_are_written_once() {
        let mut buf = ReassemblyBuffer::new(8);
        let mut out = Vec::new();

        assert_eq!(buf.insert(2, chunk(2)), Insert::Buffered);
        assert_eq!(buf.insert(2, chunk(2)), Insert::Duplicate);
        assert_eq!(buf.insert(1, chunk(1)), Insert::Buffered);
        buf.drain_into(&mut out).unwrap();

        assert_eq!(buf.insert(1, chunk(1)), Insert::Stale);
        assert_eq!(buf.insert(2, chunk(2)), Insert::Stale);
        assert_eq!(buf.drain_into(&mut out).unwrap().packets, 0);
        assert_eq!(out.len(), 6);
        assert!(Insert::Stale.should_ack());
        assert!(Insert::Duplicate.should_ack());
    }

    #[test]
    fn capacity_bounds_lookahead() {
        let mut buf = ReassemblyBuffer::new(4);
        assert_eq!(buf.insert(4, chunk(4)), Insert::Buffered);
        assert_eq!(buf.insert(5, chunk(5)), Insert::OutOfRange);
        assert!(!Insert::OutOfRange.should_ack());
    }

    #[test]
    fn capacity_one_is_stop_and_wait() {
        let mut buf = ReassemblyBuffer::new(1);
        let mut out = Vec::new();
        assert_eq!(buf.insert(2, chunk(2)), Insert::OutOfRange);
        assert_eq!(buf.insert(1, chunk(1)), Insert::Buffered);
        buf.drain_into(&mut out).unwrap();
        assert_eq!(buf.insert(2, chunk(2)), Insert::Buffered);
    }

    #[test]
    fn reset_starts_a_new_file() {
        let mut buf = ReassemblyBuffer::new(8);
        let mut out = Vec::new();
        buf.insert(1, chunk(1));
        buf.insert(5, chunk(5));
        buf.drain_into(&mut out).unwrap();
        buf.reset();
        assert_eq!(buf.expected(), 1);
        assert_eq!(buf.pending(), 0);
    }

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_error_keeps_packet_parked() {
        let mut buf = ReassemblyBuffer::new(8);
        buf.insert(1, chunk(1));
        assert!(buf.drain_into(&mut FailingSink).is_err());
        assert_eq!(buf.expected(), 1);
        assert_eq!(buf.pending(), 1);
    }
}
