//! Per-stream reorder buffer.
//!
//! Pure state: no locking, no I/O, and the clock is passed in, so the
//! playout decisions can be driven step by step.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::rtp::seq::{closest_seq, earliest_seq, seq_is_behind};

/// One buffered RTP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedPacket {
    pub seq: u16,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Buffered,
    /// Same sequence number already waiting; the new copy was dropped.
    Duplicate,
    /// Behind the playout cursor; already written or skipped.
    Late,
}

/// `nextSeq` jumped over missing packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapEvent {
    pub from: u16,
    pub to: u16,
    pub buffered: Vec<u16>,
}

/// Output of one drain pass, in playout order.
#[derive(Debug, Default)]
pub struct Drained {
    pub packets: Vec<BufferedPacket>,
    pub gaps: Vec<GapEvent>,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty() && self.gaps.is_empty()
    }
}

pub struct JitterBuffer {
    entries: HashMap<u16, BufferedPacket>,
    prefill_threshold: usize,
    prefill_done: bool,
    max_wait: Duration,
    next_seq: u16,
    stalled_since: Option<Instant>,
}

impl JitterBuffer {
    pub fn new(initial_seq: u16, prefill_threshold: usize, max_wait: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            prefill_threshold: prefill_threshold.max(1),
            prefill_done: false,
            max_wait,
            next_seq: initial_seq,
            stalled_since: None,
        }
    }

    pub fn insert(&mut self, seq: u16, timestamp: u32, payload: Vec<u8>) -> InsertOutcome {
        if self.entries.contains_key(&seq) {
            return InsertOutcome::Duplicate;
        }
        if self.prefill_done && seq_is_behind(seq, self.next_seq) {
            return InsertOutcome::Late;
        }
        self.entries.insert(
            seq,
            BufferedPacket {
                seq,
                timestamp,
                payload,
            },
        );
        InsertOutcome::Buffered
    }

    /// Flips to draining once enough packets are buffered; never flips back.
    /// On the transition `nextSeq` moves to the earliest buffered key so an
    /// out-of-order first datagram does not strand the packets before it.
    pub fn check_prefill(&mut self) -> bool {
        if !self.prefill_done && self.entries.len() >= self.prefill_threshold {
            self.prefill_done = true;
            self.rebase_to_earliest();
        }
        self.prefill_done
    }

    /// Ordered drain: pops `nextSeq` while present; when it is missing and
    /// the buffer holds at least the prefill threshold for longer than
    /// `max_wait`, resyncs to the closest buffered key.
    pub fn drain(&mut self, now: Instant) -> Drained {
        let mut out = Drained::default();
        if !self.prefill_done {
            return out;
        }
        while !self.entries.is_empty() {
            if let Some(pkt) = self.entries.remove(&self.next_seq) {
                self.next_seq = self.next_seq.wrapping_add(1);
                self.stalled_since = None;
                out.packets.push(pkt);
                continue;
            }
            let stalled_since = *self.stalled_since.get_or_insert(now);
            if self.entries.len() >= self.prefill_threshold
                && now.saturating_duration_since(stalled_since) > self.max_wait
            {
                out.gaps.push(self.resync());
                continue;
            }
            break;
        }
        if self.entries.is_empty() {
            self.stalled_since = None;
        }
        out
    }

    /// Empties the buffer in playout order regardless of prefill or
    /// `max_wait`; used when the stream is being closed.
    pub fn flush(&mut self) -> Drained {
        let mut out = Drained::default();
        if !self.prefill_done && !self.entries.is_empty() {
            self.rebase_to_earliest();
        }
        while !self.entries.is_empty() {
            match self.entries.remove(&self.next_seq) {
                Some(pkt) => {
                    self.next_seq = self.next_seq.wrapping_add(1);
                    out.packets.push(pkt);
                }
                None => out.gaps.push(self.resync()),
            }
        }
        self.stalled_since = None;
        out
    }

    fn resync(&mut self) -> GapEvent {
        let from = self.next_seq;
        let buffered = self.sorted_keys();
        let to = closest_seq(from, self.entries.keys().copied()).unwrap_or(from);
        self.next_seq = to;
        self.stalled_since = None;
        GapEvent { from, to, buffered }
    }

    fn rebase_to_earliest(&mut self) {
        if let Some(first) = earliest_seq(self.next_seq, self.entries.keys().copied()) {
            self.next_seq = first;
        }
    }

    /// Buffered keys in ring order starting at `nextSeq`.
    pub fn sorted_keys(&self) -> Vec<u16> {
        let base = self.next_seq;
        let mut keys: Vec<u16> = self.entries.keys().copied().collect();
        keys.sort_by_key(|k| k.wrapping_sub(base));
        keys
    }

    pub fn get(&self, seq: u16) -> Option<&BufferedPacket> {
        self.entries.get(&seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    pub fn prefill_done(&self) -> bool {
        self.prefill_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    fn payload(seq: u16) -> Vec<u8> {
        seq.to_le_bytes().to_vec()
    }

    fn fill(buf: &mut JitterBuffer, seqs: impl IntoIterator<Item = u16>) {
        for seq in seqs {
            assert_eq!(buf.insert(seq, seq as u32 * 960, payload(seq)), InsertOutcome::Buffered);
        }
    }

    fn seqs(drained: &Drained) -> Vec<u16> {
        drained.packets.iter().map(|p| p.seq).collect()
    }

    #[test]
    fn holds_until_prefill_threshold() {
        let now = Instant::now();
        let mut buf = JitterBuffer::new(0, 3, WAIT);
        fill(&mut buf, [0, 1]);
        assert!(!buf.check_prefill());
        assert!(buf.drain(now).is_empty());
        fill(&mut buf, [2]);
        assert!(buf.check_prefill());
        assert_eq!(seqs(&buf.drain(now)), vec![0, 1, 2]);
        assert_eq!(buf.next_seq(), 3);
        // Once started, stays started.
        assert!(buf.check_prefill());
    }

    #[test]
    fn reorders_shuffled_input() {
        let now = Instant::now();
        let mut buf = JitterBuffer::new(3, 6, WAIT);
        fill(&mut buf, [3, 5, 4, 8, 6, 7]);
        assert!(buf.check_prefill());
        assert_eq!(seqs(&buf.drain(now)), vec![3, 4, 5, 6, 7, 8]);
        assert!(buf.is_empty());
    }

    #[test]
    fn duplicate_keeps_first_payload() {
        let mut buf = JitterBuffer::new(0, 10, WAIT);
        assert_eq!(buf.insert(4, 0, vec![1, 1]), InsertOutcome::Buffered);
        assert_eq!(buf.insert(4, 0, vec![9, 9]), InsertOutcome::Duplicate);
        assert_eq!(buf.get(4).map(|p| p.payload.clone()), Some(vec![1, 1]));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn gap_resyncs_after_max_wait() {
        let t0 = Instant::now();
        let mut buf = JitterBuffer::new(0, 10, WAIT);
        fill(&mut buf, (0..10).chain(11..=20));
        assert!(buf.check_prefill());

        let first = buf.drain(t0);
        assert_eq!(seqs(&first), (0..10).collect::<Vec<_>>());
        assert!(first.gaps.is_empty());
        assert_eq!(buf.next_seq(), 10);

        assert!(buf.drain(t0 + Duration::from_millis(30)).is_empty());

        let second = buf.drain(t0 + Duration::from_millis(60));
        assert_eq!(second.gaps.len(), 1);
        assert_eq!(second.gaps[0].from, 10);
        assert_eq!(second.gaps[0].to, 11);
        assert_eq!(second.gaps[0].buffered, (11..=20).collect::<Vec<_>>());
        assert_eq!(seqs(&second), (11..=20).collect::<Vec<_>>());
        assert_eq!(buf.next_seq(), 21);
    }

    #[test]
    fn no_resync_below_threshold() {
        let t0 = Instant::now();
        let mut buf = JitterBuffer::new(0, 4, WAIT);
        fill(&mut buf, [0, 1, 2, 3]);
        assert!(buf.check_prefill());
        buf.drain(t0);
        fill(&mut buf, [5, 6]);
        assert!(buf.drain(t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(buf.next_seq(), 4);
    }

    #[test]
    fn resync_target_is_modular_closest() {
        let t0 = Instant::now();
        let mut buf = JitterBuffer::new(65533, 4, WAIT);
        buf.prefill_done = true;
        fill(&mut buf, [0, 1, 65534, 65535]);
        buf.drain(t0);
        let drained = buf.drain(t0 + WAIT * 2);
        assert_eq!(drained.gaps[0].to, 65534);
        assert_eq!(seqs(&drained), vec![65534, 65535, 0, 1]);
        assert_eq!(buf.next_seq(), 2);
    }

    #[test]
    fn drains_across_wrap() {
        let now = Instant::now();
        let mut buf = JitterBuffer::new(65534, 4, WAIT);
        fill(&mut buf, [0, 65535, 1, 65534]);
        assert!(buf.check_prefill());
        assert_eq!(seqs(&buf.drain(now)), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn late_packet_rejected_after_start() {
        let now = Instant::now();
        let mut buf = JitterBuffer::new(100, 2, WAIT);
        fill(&mut buf, [100, 101]);
        buf.check_prefill();
        buf.drain(now);
        assert_eq!(buf.insert(100, 0, payload(100)), InsertOutcome::Late);
        assert_eq!(buf.insert(99, 0, payload(99)), InsertOutcome::Late);
        assert_eq!(buf.insert(102, 0, payload(102)), InsertOutcome::Buffered);
    }

    #[test]
    fn prefill_rebases_to_earliest_key() {
        let now = Instant::now();
        // First datagram seen was 5; 3 and 4 arrived after it.
        let mut buf = JitterBuffer::new(5, 3, WAIT);
        fill(&mut buf, [5, 3, 4]);
        assert!(buf.check_prefill());
        assert_eq!(seqs(&buf.drain(now)), vec![3, 4, 5]);
    }

    #[test]
    fn flush_writes_partial_prefill_in_order() {
        let mut buf = JitterBuffer::new(7, 20, WAIT);
        fill(&mut buf, [9, 7, 12]);
        let drained = buf.flush();
        assert_eq!(seqs(&drained), vec![7, 9, 12]);
        assert_eq!(drained.gaps.len(), 2);
        assert!(buf.is_empty());
    }
}
