//! Smoothed round-trip-time estimation and the retransmission timeouts
//! derived from it.

use crate::TIMEOUT_DISCONNECT_MS;

/// Floor of the smoothed RTT; paths faster than this gain nothing from
/// tighter timeouts and jittery samples below it destabilise retransmission.
pub const MIN_RTT_MS: u32 = 100;

/// Smoothed RTT before any sample has arrived.
pub const INITIAL_RTT_MS: u32 = 300;

/// Computes a smoothed RTT from acknowledgment samples and derives the
/// timeouts that drive retransmission.
///
/// Only first-transmission acknowledgments may feed samples in: a
/// retransmitted message's ACK cannot be attributed to one transmission,
/// and counting it would collapse the estimate under loss.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt_ms: INITIAL_RTT_MS,
        }
    }
}

impl RttEstimator {
    /// The current smoothed RTT in milliseconds.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.srtt_ms
    }

    /// Feeds one first-transmission sample in.
    pub fn update(&mut self, sample_ms: u32) {
        let smoothed = (3 * self.srtt_ms + sample_ms) / 4;
        self.srtt_ms = smoothed.clamp(MIN_RTT_MS, TIMEOUT_DISCONNECT_MS);
    }

    /// How long a transmission may go unacknowledged before it is inferred
    /// lost.
    #[must_use]
    pub const fn loss_timeout(&self) -> u32 {
        2 * self.srtt_ms
    }

    /// The shorter timeout applied once a rollup has confirmed that newer
    /// IDs arrived while this one did not.
    #[must_use]
    pub const fn nack_timeout(&self) -> u32 {
        self.srtt_ms
    }

    /// Exponential backoff for a node: zero before any retransmission,
    /// otherwise the spread between first and latest transmission, at
    /// least one smoothed RTT and at most four timeouts.
    #[must_use]
    pub const fn backoff(&self, retransmitted: bool, ts_firstsend: u32, ts_lastsend: u32) -> u32 {
        if !retransmitted {
            return 0;
        }
        let spread = ts_lastsend.wrapping_sub(ts_firstsend);
        let cap = 4 * self.loss_timeout();
        if spread < self.srtt_ms {
            self.srtt_ms
        } else if spread > cap {
            cap
        } else {
            spread
        }
    }
}
