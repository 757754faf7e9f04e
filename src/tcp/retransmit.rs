//! Per-connection retransmit queue: one timer slot, an ordered list of
//! unacknowledged segments (spec §4.8, §9).

use super::segment::TcpSegment;
use super::seq;
use std::time::Instant;

pub struct RetransmitEntry {
    pub seq: u32,
    pub segment: TcpSegment,
    pub sent_at: Instant,
    pub retry_count: u32,
}

#[derive(Default)]
pub struct RetransmitQueue {
    entries: Vec<RetransmitEntry>,
}

impl RetransmitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, seq: u32, segment: TcpSegment) {
        self.entries.push(RetransmitEntry {
            seq,
            segment,
            sent_at: Instant::now(),
            retry_count: 0,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry with `seq < ack` under wrap-safe comparison.
    pub fn remove_acked_before(&mut self, ack: u32) {
        self.entries.retain(|e| !seq::before(e.seq, ack));
    }

    /// Removes the entry at the given `seq`, if any — used when a segment
    /// queued for retransmission is superseded before it's ever acked (e.g.
    /// a simultaneous-open SYN|ACK replacing the original bare SYN).
    pub fn remove_seq(&mut self, seq: u32) {
        self.entries.retain(|e| e.seq != seq);
    }

    /// The earliest unacknowledged entry, if any.
    pub fn earliest(&self) -> Option<&RetransmitEntry> {
        self.entries.iter().min_by_key(|e| e.sent_at)
    }

    pub fn earliest_mut(&mut self) -> Option<&mut RetransmitEntry> {
        self.entries
            .iter_mut()
            .min_by_key(|e| e.sent_at)
    }

    pub fn touch_retransmitted(&mut self, seq: u32) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.seq == seq) {
            e.retry_count += 1;
            e.sent_at = Instant::now();
        }
    }

    /// True iff any entry in the queue has never been retransmitted — used
    /// to decide whether an acked segment's timing is a valid RTT sample
    /// (Karn's algorithm: skip samples from retransmitted segments).
    pub fn was_retransmitted(&self, seq: u32) -> bool {
        self.entries
            .iter()
            .find(|e| e.seq == seq)
            .map(|e| e.retry_count > 0)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::segment::TcpFlags;

    fn seg() -> TcpSegment {
        TcpSegment {
            src_port: 1,
            dst_port: 2,
            seq: 0,
            ack: 0,
            flags: TcpFlags::ACK,
            window: 1000,
            urgent: 0,
            options: Vec::new(),
            data: Vec::new(),
        }
    }

    #[test]
    fn remove_before_is_wrap_safe() {
        let mut q = RetransmitQueue::new();
        q.push(u32::MAX - 1, seg());
        q.push(5, seg());
        q.push(10, seg());
        // ack=2 wraps past MAX: entries with seq "before" 2 are removed,
        // i.e. seq = MAX - 1 (which precedes 2 after wraparound).
        q.remove_acked_before(2);
        assert_eq!(q.len(), 2);
        assert!(q.entries.iter().all(|e| e.seq == 5 || e.seq == 10));
    }

    #[test]
    fn remove_before_simple_case() {
        let mut q = RetransmitQueue::new();
        q.push(10, seg());
        q.push(20, seg());
        q.push(30, seg());
        q.remove_acked_before(20);
        assert_eq!(q.len(), 2);
    }
}
