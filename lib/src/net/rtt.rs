//! Round-trip time estimation.
//!
//! The standard smoothed-RTT recursion: SRTT ← (7·SRTT + R)/8,
//! RTTVAR ← (3·RTTVAR + |SRTT − R|)/4, RTO ← SRTT + 4·RTTVAR, with the
//! minimum lowered for virtual links where round trips are microseconds.
//! Samples from retransmitted segments are excluded by the caller (Karn's
//! rule); timeout backoff is a gentle 1.5× with a small iteration cap.

use std::time::Duration;

/// Floor for the retransmission timeout. Virtual links complete round trips
/// far faster than physical ones.
const MIN_RTO: Duration = Duration::from_millis(50);

/// Ceiling for the retransmission timeout.
const MAX_RTO: Duration = Duration::from_secs(10);

/// Cap on consecutive backoff steps.
const MAX_BACKOFF_STEPS: u32 = 6;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    backoff_steps: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: Duration::from_millis(500),
            backoff_steps: 0,
        }
    }

    /// Fold in a measurement from a segment that was never retransmitted.
    pub fn sample(&mut self, r: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2;
            }
            Some(srtt) => {
                let delta = if srtt > r { srtt - r } else { r - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + r) / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(r);
        self.rto = (srtt + self.rttvar * 4).clamp(MIN_RTO, MAX_RTO);
        self.backoff_steps = 0;
    }

    /// The current retransmission timeout, backoff included.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Widen the timeout after an expiry. Multiplies by 1.5 up to the step
    /// cap; a fresh sample resets the backoff.
    pub fn backoff(&mut self) {
        if self.backoff_steps >= MAX_BACKOFF_STEPS {
            return;
        }
        self.backoff_steps += 1;
        self.rto = (self.rto + self.rto / 2).min(MAX_RTO);
    }

    /// The smoothed estimate, if any sample has been folded in.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }
}
