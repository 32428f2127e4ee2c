//! Sequence acceptance and reorder buffer for one receive link
//!
//! Decides, for every decoded packet, whether it is applied now, parked in the
//! reorder buffer until the hole before it fills, or dropped. Pure state: the
//! caller supplies the clock, so timing behaviour is testable without sockets.
use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::packet::{next_sequence, Packet, MAX_SEQUENCE};

/// What happened to a pushed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Applied in order (possibly releasing buffered successors)
    Applied,
    /// Already applied or older than the baseline, dropped
    Duplicate,
    /// Ahead of a hole, waiting in the reorder buffer
    Buffered,
    /// Too far ahead, applied as the new baseline; `lost` packets skipped
    Gap { lost: u64 },
    /// Far behind the baseline (sender restart or wrap), applied as the new baseline
    Restart,
    /// Sequence number 0 is reserved
    Invalid,
}

/// Reorder state machine for one link
#[derive(Debug)]
pub struct Sequencer {
    max_difference: u32,
    buffer_size: usize,
    lost_timeout: Duration,
    last_applied: u32,
    pending: BTreeMap<u32, Packet>,
    hole_since: Option<Instant>,
    lost: u64,
}

/// Steps from `from` to `to` walking forward through 1..=MAX_SEQUENCE
fn forward(from: u32, to: u32) -> u64 {
    if to >= from {
        u64::from(to - from)
    } else {
        u64::from(MAX_SEQUENCE - from) + u64::from(to)
    }
}

impl Sequencer {
    pub fn new(max_difference: u32, buffer_size: usize, lost_timeout: Duration) -> Self {
        Self {
            max_difference,
            buffer_size: buffer_size.max(1),
            lost_timeout,
            last_applied: 0,
            pending: BTreeMap::new(),
            hole_since: None,
            lost: 0,
        }
    }

    /// Sequence number of the last applied packet, 0 before the first one
    pub fn last_applied(&self) -> u32 {
        self.last_applied
    }

    /// Sequence number that would be applied immediately
    pub fn expected(&self) -> u32 {
        next_sequence(self.last_applied)
    }

    pub fn lost_packets(&self) -> u64 {
        self.lost
    }

    /// Whether a hole is currently open
    pub fn has_hole(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Forget the baseline and the buffer; the next packet starts a new baseline
    pub fn reset(&mut self) {
        self.last_applied = 0;
        self.pending.clear();
        self.hole_since = None;
    }

    /// Feed one packet; packets ready for application are appended to `out` in order
    pub fn push(&mut self, packet: Packet, now: Instant, out: &mut Vec<Packet>) -> Verdict {
        let seq = packet.sequence;
        if seq == 0 {
            return Verdict::Invalid;
        }

        if self.last_applied == 0 {
            self.apply(packet, out);
            self.drain(out);
            return Verdict::Applied;
        }

        let ahead = forward(self.last_applied, seq);
        if ahead == 0 {
            return Verdict::Duplicate;
        }

        if ahead == 1 {
            self.apply(packet, out);
            self.drain(out);
            return Verdict::Applied;
        }

        let limit = u64::from(self.max_difference) + 1;
        if ahead <= limit {
            if self.pending.len() >= self.buffer_size && !self.pending.contains_key(&seq) {
                // buffer exhausted: give up on the hole and re-evaluate against the new baseline
                self.flush(out);
                return self.push(packet, now, out);
            }

            self.pending.insert(seq, packet);
            self.hole_since.get_or_insert(now);
            return Verdict::Buffered;
        }

        let behind = forward(seq, self.last_applied);
        if behind <= u64::from(self.max_difference) {
            return Verdict::Duplicate;
        }

        self.pending.clear();
        self.hole_since = None;

        if seq > self.last_applied {
            let lost = ahead - 1;
            self.lost += lost;
            self.apply(packet, out);
            Verdict::Gap { lost }
        } else {
            self.apply(packet, out);
            Verdict::Restart
        }
    }

    /// Release buffered packets whose hole outlived the lost timeout
    ///
    /// Returns the number of packets counted as lost.
    pub fn poll(&mut self, now: Instant, out: &mut Vec<Packet>) -> u64 {
        match self.hole_since {
            Some(since) if now.saturating_duration_since(since) >= self.lost_timeout => self.flush(out),
            _ => 0,
        }
    }

    /// Apply every buffered packet in sequence order, counting the gaps as lost
    fn flush(&mut self, out: &mut Vec<Packet>) -> u64 {
        let base = self.last_applied;
        let mut ordered: Vec<Packet> = std::mem::take(&mut self.pending).into_values().collect();
        ordered.sort_by_key(|p| forward(base, p.sequence));

        let mut lost = 0;
        for packet in ordered {
            lost += forward(self.last_applied, packet.sequence).saturating_sub(1);
            self.apply(packet, out);
        }

        self.hole_since = None;
        self.lost += lost;
        lost
    }

    fn drain(&mut self, out: &mut Vec<Packet>) {
        while let Some(packet) = self.pending.remove(&self.expected()) {
            self.apply(packet, out);
        }
        if self.pending.is_empty() {
            self.hole_since = None;
        }
    }

    fn apply(&mut self, packet: Packet, out: &mut Vec<Packet>) {
        self.last_applied = packet.sequence;
        out.push(packet);
    }
}
