//! Reno congestion control, tuned for low-latency virtual transports.
//!
//! The initial window is ~10 MSS and the duplicate-ACK threshold is lowered
//! from 3 to 2: windows on a virtual link are small enough that three
//! duplicates often never arrive.

/// Duplicate ACKs that trigger fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 2;

/// Initial window in MSS units.
const INITIAL_WINDOW_MSS: u32 = 10;

#[derive(Debug, Clone)]
pub struct CongestionController {
    mss: u32,
    cwnd: u32,
    ssthresh: u32,
    dup_acks: u32,
    in_fast_recovery: bool,
}

/// What the caller should do after an ACK is folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Nothing to transmit beyond normal window growth.
    None,
    /// The duplicate threshold fired: retransmit the oldest segment now.
    FastRetransmit,
}

impl CongestionController {
    pub fn new(mss: u32) -> Self {
        let mss = mss.max(1);
        Self {
            mss,
            cwnd: INITIAL_WINDOW_MSS * mss,
            ssthresh: u32::MAX / 2,
            dup_acks: 0,
            in_fast_recovery: false,
        }
    }

    /// Bytes the network path will currently absorb.
    pub fn window(&self) -> u32 {
        self.cwnd
    }

    /// An ACK advancing the left edge by `acked` bytes.
    pub fn on_new_ack(&mut self, acked: u32) {
        self.dup_acks = 0;
        if self.in_fast_recovery {
            // Deflate back to the threshold set when recovery started.
            self.cwnd = self.ssthresh;
            self.in_fast_recovery = false;
            return;
        }
        if self.cwnd < self.ssthresh {
            // Slow start: grow by a segment per segment acked.
            self.cwnd = self.cwnd.saturating_add(acked.min(self.mss));
        } else {
            // Congestion avoidance: roughly one segment per RTT.
            let growth = (self.mss * self.mss / self.cwnd).max(1);
            self.cwnd = self.cwnd.saturating_add(growth);
        }
    }

    /// An ACK that repeats the previous ack number without covering new data.
    pub fn on_dup_ack(&mut self) -> AckOutcome {
        self.dup_acks += 1;
        if self.in_fast_recovery {
            // Each further duplicate signals another segment has left the
            // network; inflate to let new data out.
            self.cwnd = self.cwnd.saturating_add(self.mss);
            return AckOutcome::None;
        }
        if self.dup_acks >= DUP_ACK_THRESHOLD {
            self.ssthresh = (self.cwnd / 2).max(2 * self.mss);
            self.cwnd = self.ssthresh + DUP_ACK_THRESHOLD * self.mss;
            self.in_fast_recovery = true;
            return AckOutcome::FastRetransmit;
        }
        AckOutcome::None
    }

    /// A retransmission timeout collapses the window to one segment.
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2 * self.mss);
        self.cwnd = self.mss;
        self.dup_acks = 0;
        self.in_fast_recovery = false;
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.in_fast_recovery
    }
}
