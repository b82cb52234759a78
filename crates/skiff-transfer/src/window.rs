//! Sender-side selective-repeat window.
//!
//! Slots cover the sequence numbers `[base, next)`. A slot is retired only
//! when it and every slot before it are acknowledged, so `base` never moves
//! past a gap.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::protocol::{FIRST_DATA_SEQ, Packet};

#[derive(Debug)]
struct Slot {
    packet: Packet,
    acked: bool,
    retries: u32,
    sent_at: Instant,
}

/// What an incoming ack did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    /// Slot was already acknowledged.
    Duplicate,
    /// Below `base` or at/after `next`.
    OutOfWindow,
}

#[derive(Debug)]
pub struct SendWindow {
    base: i32,
    size: usize,
    slots: VecDeque<Slot>,
}

impl SendWindow {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            base: FIRST_DATA_SEQ,
            size,
            slots: VecDeque::with_capacity(size),
        }
    }

    /// Oldest unacknowledged sequence number.
    #[inline]
    pub fn base(&self) -> i32 {
        self.base
    }

    /// Sequence number the next pushed packet receives.
    #[inline]
    pub fn next(&self) -> i32 {
        self.base + self.slots.len() as i32
    }

    /// First sequence number outside the window.
    #[inline]
    pub fn window_end(&self) -> i32 {
        self.base + self.size as i32
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn has_room(&self) -> bool {
        self.slots.len() < self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Assign the next sequence number to `payload` and track it as sent
    /// at `now`. Returns `None` when the window is full.
    pub fn push(&mut self, payload: Bytes, now: Instant) -> Option<Packet> {
        if !self.has_room() {
            return None;
        }
        let packet = Packet::new(self.next(), payload);
        self.slots.push_back(Slot {
            packet: packet.clone(),
            acked: false,
            retries: 0,
            sent_at: now,
        });
        Some(packet)
    }

    pub fn mark_acked(&mut self, seq: i32) -> AckOutcome {
        let Some(slot) = self.slot_mut(seq) else {
            return AckOutcome::OutOfWindow;
        };
        if slot.acked {
            return AckOutcome::Duplicate;
        }
        slot.acked = true;
        AckOutcome::Acked
    }

    /// Retire the acknowledged prefix. Returns how many slots were freed.
    pub fn slide(&mut self) -> usize {
        let mut freed = 0;
        while self.slots.front().is_some_and(|s| s.acked) {
            self.slots.pop_front();
            self.base += 1;
            freed += 1;
        }
        freed
    }

    /// Every unacknowledged sequence number, oldest first.
    pub fn unacked(&self) -> Vec<i32> {
        self.slots
            .iter()
            .filter(|s| !s.acked)
            .map(|s| s.packet.sequence)
            .collect()
    }

    /// Unacknowledged sequence numbers last sent at least `timeout` ago.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<i32> {
        self.slots
            .iter()
            .filter(|s| !s.acked && now.saturating_duration_since(s.sent_at) >= timeout)
            .map(|s| s.packet.sequence)
            .collect()
    }

    /// Stamp a retransmission of `seq`. Returns the packet to resend and
    /// the slot's retry count including this one.
    pub fn record_retransmit(&mut self, seq: i32, now: Instant) -> Option<(Packet, u32)> {
        let slot = self.slot_mut(seq)?;
        if slot.acked {
            return None;
        }
        slot.retries += 1;
        slot.sent_at = now;
        Some((slot.packet.clone(), slot.retries))
    }

    fn slot_mut(&mut self, seq: i32) -> Option<&mut Slot> {
        if seq < self.base {
            return None;
        }
        self.slots.get_mut((seq - self.base) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> Bytes {
        Bytes::from_static(b"data")
    }

    #[test]
    fn never_more_than_window_in_flight() {
        let now = Instant::now();
        let mut w = SendWindow::new(4);
        for expected in 1..=4 {
            assert_eq!(w.push(chunk(), now).unwrap().sequence, expected);
        }
        assert!(!w.has_room());
        assert!(w.push(chunk(), now).is_none());
        assert_eq!((w.base(), w.next(), w.window_end()), (1, 5, 5));
    }

    #[test]
    fn base_slides_only_over_contiguous_acks() {
        let now = Instant::now();
        let mut w = SendWindow::new(4);
        for _ in 0..4 {
            w.push(chunk(), now);
        }

        assert_eq!(w.mark_acked(2), AckOutcome::Acked);
        assert_eq!(w.mark_acked(3), AckOutcome::Acked);
        assert_eq!(w.slide(), 0);
        assert_eq!(w.base(), 1);
        assert_eq!(w.unacked(), vec![1, 4]);

        assert_eq!(w.mark_acked(1), AckOutcome::Acked);
        assert_eq!(w.slide(), 3);
        assert_eq!(w.base(), 4);
        assert_eq!(w.in_flight(), 1);
        assert_eq!(w.push(chunk(), now).unwrap().sequence, 5);
    }

    #[test]
    fn stray_acks_are_classified() {
        let now = Instant::now();
        let mut w = SendWindow::new(2);
        w.push(chunk(), now);
        w.push(chunk(), now);

        assert_eq!(w.mark_acked(0), AckOutcome::OutOfWindow);
        assert_eq!(w.mark_acked(3), AckOutcome::OutOfWindow);
        assert_eq!(w.mark_acked(-20), AckOutcome::OutOfWindow);
        assert_eq!(w.mark_acked(2), AckOutcome::Acked);
        assert_eq!(w.mark_acked(2), AckOutcome::Duplicate);

        w.mark_acked(1);
        w.slide();
        assert_eq!(w.mark_acked(1), AckOutcome::OutOfWindow);
        assert!(w.is_empty());
    }

    #[test]
    fn per_slot_timers() {
        let start = Instant::now();
        let timeout = Duration::from_secs(1);
        let mut w = SendWindow::new(4);
        w.push(chunk(), start);
        w.push(chunk(), start + Duration::from_millis(600));

        let at = start + Duration::from_millis(1200);
        assert_eq!(w.expired(at, timeout), vec![1]);

        let (packet, retries) = w.record_retransmit(1, at).unwrap();
        assert_eq!((packet.sequence, retries), (1, 1));
        assert!(w.expired(at, timeout).is_empty());
        assert_eq!(w.record_retransmit(1, at).unwrap().1, 2);

        w.mark_acked(2);
        assert!(w.record_retransmit(2, at).is_none());
        assert!(w.record_retransmit(9, at).is_none());
    }
}
