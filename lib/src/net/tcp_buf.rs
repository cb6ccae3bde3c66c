//! TCP send and receive buffers.

use std::{
    collections::{BTreeMap, VecDeque},
    time::Instant,
};

use super::seq;

/// Cap on unacked segments held for retransmission.
const SEND_BUFFER_SEGMENTS: usize = 256;

/// Cap on buffered out-of-order segments.
const RECV_BUFFER_SEGMENTS: usize = 64;

/// One unacked segment awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct SendSegment {
    pub seq_start: u32,
    pub seq_end: u32,
    pub payload: Vec<u8>,
    pub sent_at: Instant,
    pub retx_count: u32,
}

/// Bounded FIFO of unacked segments.
#[derive(Debug, Default)]
pub struct SendBuffer {
    segments: VecDeque<SendSegment>,
    bytes: usize,
}

/// Result of folding an ACK into the send buffer.
#[derive(Debug, Clone, Copy)]
pub struct Acked {
    /// Bytes removed from the buffer.
    pub bytes: u32,

    /// Timestamp of the newest fully-acked segment that was never
    /// retransmitted; eligible as an RTT sample under Karn's rule.
    pub rtt_sample: Option<Instant>,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another segment fits.
    pub fn has_room(&self) -> bool {
        self.segments.len() < SEND_BUFFER_SEGMENTS
    }

    pub fn push(&mut self, segment: SendSegment) {
        self.bytes += segment.payload.len();
        self.segments.push_back(segment);
    }

    /// Remove every segment fully covered by `ack` (mod-2³² comparison).
    pub fn ack(&mut self, ack: u32) -> Acked {
        let mut acked = Acked {
            bytes: 0,
            rtt_sample: None,
        };
        while let Some(front) = self.segments.front() {
            if !seq::le(front.seq_end, ack) {
                break;
            }
            let segment = self.segments.pop_front().expect("front exists");
            self.bytes -= segment.payload.len();
            acked.bytes += segment.payload.len() as u32;
            if segment.retx_count == 0 {
                acked.rtt_sample = Some(segment.sent_at);
            }
        }
        acked
    }

    /// The oldest unacked segment.
    pub fn oldest(&self) -> Option<&SendSegment> {
        self.segments.front()
    }

    /// Mark the oldest segment retransmitted now and return a copy to send.
    pub fn retransmit_oldest(&mut self, now: Instant) -> Option<SendSegment> {
        let front = self.segments.front_mut()?;
        front.retx_count += 1;
        front.sent_at = now;
        Some(front.clone())
    }

    /// Merge the oldest segment with its successors while they are adjacent
    /// in sequence space and the merge stays within `mss` bytes. Coalescing
    /// keeps timeout retransmissions from replaying tiny writes one by one.
    pub fn coalesce_oldest(&mut self, mss: usize) {
        while self.segments.len() >= 2 {
            let (a, b) = (&self.segments[0], &self.segments[1]);
            if a.seq_end != b.seq_start || a.payload.len() + b.payload.len() > mss {
                break;
            }
            let b = self.segments.remove(1).expect("len checked");
            let a = &mut self.segments[0];
            a.seq_end = b.seq_end;
            a.payload.extend_from_slice(&b.payload);
            a.retx_count = a.retx_count.max(b.retx_count);
        }
    }

    /// Bytes awaiting acknowledgment.
    pub fn in_flight(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }
}

/// Out-of-order receive buffer keyed by starting sequence number.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    segments: BTreeMap<u32, Vec<u8>>,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a segment that landed beyond the next expected sequence.
    /// Stale and duplicate starts are dropped; the buffer is bounded.
    pub fn insert(&mut self, seq_start: u32, payload: Vec<u8>, next_expected: u32) {
        if payload.is_empty() || seq::lt(seq_start, next_expected) {
            return;
        }
        if self.segments.len() >= RECV_BUFFER_SEGMENTS {
            return;
        }
        self.segments.entry(seq_start).or_insert(payload);
    }

    /// Drain every contiguous run starting at `next_expected`, advancing it.
    pub fn collect_contiguous(&mut self, next_expected: &mut u32) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let Some(payload) = self.segments.remove(next_expected) else {
                // Segments overlapping the expected point still fill the gap.
                let Some((&start, _)) = self
                    .segments
                    .iter()
                    .find(|(&start, payload)| {
                        seq::lt(start, *next_expected)
                            && seq::gt(seq::add(start, payload.len() as u32), *next_expected)
                    })
                else {
                    break;
                };
                let payload = self.segments.remove(&start).expect("found above");
                let skip = next_expected.wrapping_sub(start) as usize;
                out.extend_from_slice(&payload[skip..]);
                *next_expected = seq::add(start, payload.len() as u32);
                continue;
            };
            *next_expected = seq::add(*next_expected, payload.len() as u32);
            out.extend_from_slice(&payload);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }
}
