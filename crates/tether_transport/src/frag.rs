//! Reassembles fragmented messages on the receive side.
//!
//! Each stream owns one reassembly slot: at most one fragmented message is
//! in flight per stream, because fragments are reliable and inherently
//! ordered. The first fragment carries a 2-byte total length; subsequent
//! fragments append until the buffer fills. A zero-length fragment aborts
//! the transfer in progress.
//!
//! A total length of [`FRAG_HUGE`] marks a *huge* message: no buffer is
//! allocated, each fragment streams straight to the application's huge
//! hook, and a zero-length fragment marks completion.

use {
    crate::packet::{FRAG_START_BYTES, FragStart},
    bytes::Bytes,
    octs::Read,
    tracing::warn,
};

/// What receiving one fragment produced.
#[derive(Debug, PartialEq, Eq)]
pub enum FragEvent {
    /// The fragment was absorbed; the message is still incomplete.
    Absorbed,
    /// The message completed; here is the whole payload.
    Message(Bytes),
    /// A piece of a huge message, to stream to the application.
    HugePiece(Bytes),
    /// The huge message in progress completed.
    HugeEnd,
    /// The transfer in progress was aborted by the sender.
    Aborted,
}

/// Failed to absorb a fragment; the slot has been reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FragError {
    /// The first fragment was too short to carry a start header and any
    /// payload.
    #[error("truncated fragment start")]
    TruncatedStart,
}

#[derive(Debug, Default)]
enum Slot {
    /// No fragmented message in progress.
    #[default]
    Idle,
    /// Reassembling into an allocated buffer.
    Assembling { buf: Vec<u8>, total_len: usize },
    /// Streaming a huge message; nothing is buffered.
    Huge,
}

/// The reassembly slot of one stream.
#[derive(Debug, Default)]
pub struct Reassembler {
    slot: Slot,
}

impl Reassembler {
    /// Whether a fragmented message is in progress.
    #[must_use]
    pub const fn in_progress(&self) -> bool {
        !matches!(self.slot, Slot::Idle)
    }

    /// Absorbs the payload of one FRAG message, in ACK-ID order.
    pub fn on_fragment(&mut self, mut data: Bytes) -> Result<FragEvent, FragError> {
        if let Slot::Idle = self.slot {
            // first fragment: total length precedes the payload
            if data.len() < FRAG_START_BYTES + 1 {
                warn!("Truncated fragment start ignored");
                return Err(FragError::TruncatedStart);
            }
            let start = data
                .read::<FragStart>()
                .map_err(|_| FragError::TruncatedStart)?;

            if start.is_huge() {
                self.slot = Slot::Huge;
            } else {
                self.slot = Slot::Assembling {
                    buf: Vec::with_capacity(usize::from(start.total_len)),
                    total_len: usize::from(start.total_len),
                };
            }
        }

        match &mut self.slot {
            Slot::Idle => unreachable!("slot was just initialized"),
            Slot::Huge => {
                if data.is_empty() {
                    self.slot = Slot::Idle;
                    Ok(FragEvent::HugeEnd)
                } else {
                    Ok(FragEvent::HugePiece(data))
                }
            }
            Slot::Assembling { buf, total_len } => {
                if data.is_empty() {
                    // sender-side abort signal
                    warn!("Aborted fragment transfer");
                    self.slot = Slot::Idle;
                    return Ok(FragEvent::Aborted);
                }

                let remaining = *total_len - buf.len();
                if data.len() >= remaining {
                    if data.len() > remaining {
                        warn!(
                            excess = data.len() - remaining,
                            "Fragment overflow truncated"
                        );
                    }
                    buf.extend_from_slice(&data[..remaining]);
                    let msg = Bytes::from(std::mem::take(buf));
                    self.slot = Slot::Idle;
                    Ok(FragEvent::Message(msg))
                } else {
                    buf.extend_from_slice(&data);
                    Ok(FragEvent::Absorbed)
                }
            }
        }
    }

    /// Drops any transfer in progress.
    pub fn reset(&mut self) {
        self.slot = Slot::Idle;
    }
}
