//! Loss-driven rate governor.
//!
//! The governor meters outbound bytes per *epoch*, where one epoch is one
//! host tick. The budget adapts to observed loss: any loss during an epoch
//! halves the next epoch's budget, a loss-free epoch grows it by one
//! datagram. Loss is counted once per loss representative (the single
//! marked node per clustered datagram) whether the loss was inferred by
//! timeout or confirmed by a rollup, so one dropped datagram never counts
//! more than once however many messages it carried.
//!
//! The remaining budget is signed: transmission assembles whole datagrams
//! and may overshoot the epoch's budget by part of one cluster, which the
//! next refill then absorbs.

use crate::rtt::RttEstimator;

/// Rough wire size of one full datagram, used as the budget increment.
pub const EPOCH_MSS: i32 = 1400;

/// Epoch budget at connection start.
pub const INITIAL_EPOCH_BYTES: i32 = 16 * EPOCH_MSS;

/// Budget floor; the governor never chokes a connection entirely.
pub const MIN_EPOCH_BYTES: i32 = 2 * EPOCH_MSS;

/// Budget ceiling per epoch.
pub const MAX_EPOCH_BYTES: i32 = 1 << 22;

/// Per-connection flow governor and RTT state.
#[derive(Debug)]
pub struct FlowControl {
    rtt: RttEstimator,
    epoch_bytes: i32,
    epoch_remaining: i32,
    losses: u32,
    /// Latest average transit time reported by the remote in an ACK body.
    remote_trip_ms: u32,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            rtt: RttEstimator::default(),
            epoch_bytes: INITIAL_EPOCH_BYTES,
            epoch_remaining: INITIAL_EPOCH_BYTES,
            losses: 0,
            remote_trip_ms: 0,
        }
    }
}

impl FlowControl {
    /// Bytes still sendable this epoch; negative after an overshoot.
    #[must_use]
    pub const fn remaining_bytes(&self) -> i32 {
        self.epoch_remaining
    }

    /// The current epoch budget.
    #[must_use]
    pub const fn epoch_bytes(&self) -> i32 {
        self.epoch_bytes
    }

    /// The RTT estimator, for timeout queries.
    #[must_use]
    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Records wire bytes handed to the datagram sink, including IP/UDP
    /// overhead.
    pub fn on_datagram_sent(&mut self, wire_bytes: usize) {
        self.epoch_remaining -= wire_bytes as i32;
    }

    /// Records `count` loss representatives retransmitted since the last
    /// tick.
    pub fn on_loss(&mut self, count: u32) {
        self.losses += count;
    }

    /// Feeds one first-transmission RTT sample in.
    pub fn on_rtt_sample(&mut self, sample_ms: u32) {
        self.rtt.update(sample_ms);
    }

    /// Records the remote's reported average transit time.
    pub fn on_remote_trip(&mut self, trip_ms: u32) {
        self.remote_trip_ms = trip_ms;
    }

    /// Latest remote-reported average transit time in milliseconds.
    #[must_use]
    pub const fn remote_trip_ms(&self) -> u32 {
        self.remote_trip_ms
    }

    /// Loss events recorded since the last tick.
    #[must_use]
    pub const fn pending_losses(&self) -> u32 {
        self.losses
    }

    /// Closes the current epoch and opens the next: adapts the budget to
    /// the epoch's loss count, then refills.
    pub fn on_tick(&mut self) {
        if self.losses > 0 {
            self.epoch_bytes = (self.epoch_bytes / 2).max(MIN_EPOCH_BYTES);
        } else {
            self.epoch_bytes = (self.epoch_bytes + EPOCH_MSS).min(MAX_EPOCH_BYTES);
        }
        self.losses = 0;

        // carry an overshoot forward so a burst cannot double-spend
        let carry = self.epoch_remaining.min(0);
        self.epoch_remaining = self.epoch_bytes + carry;
    }
}
