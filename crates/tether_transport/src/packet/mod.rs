//! Defines the structure of transport messages on the wire.
//!
//! This module contains the type definitions themselves, so the whole
//! protocol can be read at a glance; codec logic lives in the submodules.
//!
//! A datagram's plaintext is a sequence of *messages*. Each message starts
//! with a 1- or 2-byte header:
//!
//! ```text
//! byte 0: [C | R | I | SOP(2) | BLO(3)]   BLO = low 3 bits of (length - 1)
//! byte 1: [BHI(8)]  present iff C         BHI = high 8 bits of (length - 1)
//! ```
//!
//! - `C`: a second header byte follows (the message is longer than 8
//!   bytes);
//! - `R`: the message is reliable and consumes an ACK-ID on its stream;
//! - `I`: an ACK-ID tag follows the header;
//! - `SOP`: the super-opcode, [`SuperOpcode`];
//! - length: total payload bytes following the header and tag, biased so
//!   a wire field of 0 means 1 byte; the representable range is 1..=2048,
//!   plus an empty-payload marker (the two-byte form of a one-byte length,
//!   which the encoder otherwise never produces) for the fragment abort
//!   signal.
//!
//! When `I` is set, a self-delimiting 1–3 byte [`AckIdTag`] follows:
//!
//! ```text
//! tag 0: [C | ID(5)  | STREAM(2)]
//! tag 1: [C | ID(7)]                      present iff tag0.C
//! tag 2: [ID(8)]                          present iff tag1.C
//! ```
//!
//! yielding 5, 12, or 20 significant ID bits, reconstructed against the
//! receiver's next expected ID for that stream. When `R` is set and `I` is
//! not, the message implicitly takes the previous message's stream and the
//! next ACK-ID, so a burst of contiguous reliable messages carries one tag
//! total.
//!
//! The first fragment of a fragmented message carries a 2-byte little-endian
//! total length ([`FragStart`]) ahead of its payload; the sentinel `0xFFFF`
//! marks a *huge* message streamed to the application piecewise.
//!
//! An ACK message body is a trip-time field followed by rollup and range
//! fields ([`AckField`]); see [`ack`](self::ack).

mod ack;
mod ack_id;
mod frag;
mod header;

pub use ack::{AckFieldError, MAX_TRIP_TIME_MS, ROLLUP_ID_BITS};

use crate::stream::StreamId;

/// Mask of the low-length bits in header byte 0.
pub const LEN_LO_MASK: u8 = 0b0000_0111;

/// Bit shift moving the high length bits into header byte 1.
pub const LEN_HI_SHIFT: u32 = 3;

/// Bit shift of the super-opcode within header byte 0.
pub const SOP_SHIFT: u32 = 3;

/// Mask of the super-opcode after shifting.
pub const SOP_MASK: u8 = 0b11;

/// ACK-ID-attached bit in header byte 0.
pub const I_MASK: u8 = 0b0010_0000;

/// Reliable bit in header byte 0.
pub const R_MASK: u8 = 0b0100_0000;

/// Continuation bit in header byte 0, ACK-ID tag bytes, and varint fields.
pub const C_MASK: u8 = 0b1000_0000;

/// Largest payload length one message header can describe.
pub const MAX_MESSAGE_LEN: usize = 2048;

/// Worst-case encoded length of a message header.
pub const MAX_HEADER_BYTES: usize = 2;

/// Worst-case encoded length of an ACK-ID tag; retransmissions always use
/// this form because the receiver's next expected ID is unknowable then.
pub const MAX_ACK_ID_BYTES: usize = 3;

/// Encoded length of a fragment start header.
pub const FRAG_START_BYTES: usize = 2;

/// Total-length sentinel marking a huge message ([`FragStart::HUGE`]).
pub const FRAG_HUGE: u16 = u16::MAX;

// 3 low bits in byte 0 plus a full second byte describe lengths 1..=2048.
static_assertions::const_assert_eq!(MAX_MESSAGE_LEN, 1 << (LEN_HI_SHIFT + 8));
static_assertions::const_assert_eq!(LEN_LO_MASK as usize, (1 << LEN_HI_SHIFT) - 1);

/// Per-stream sequence number of a reliable message.
///
/// ACK-IDs are assigned monotonically at first transmission and stored as a
/// full `u32`; only the low bits travel on the wire, compressed against the
/// receiver's next expected value. All arithmetic wraps, and [`Ord`] is
/// wrap-aware: `a < b` iff the signed distance from `a` to `b` is positive.
/// Comparisons are only meaningful for IDs within half a reconstruction
/// window of each other, which the id-span guard maintains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AckId(pub u32);

/// Classifier of a transport message, 2 bits in the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuperOpcode {
    /// Application data, delivered as-is.
    Data,
    /// One piece of a fragmented message. Meaningless when unreliable.
    Frag,
    /// Selective acknowledgment body. Meaningless when reliable.
    Ack,
    /// Transport-internal message; first payload byte is an
    /// [`InternalOpcode`].
    Internal,
}

impl SuperOpcode {
    /// Reads a super-opcode from its 2-bit wire form.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & SOP_MASK {
            0 => Self::Data,
            1 => Self::Frag,
            2 => Self::Ack,
            _ => Self::Internal,
        }
    }

    /// This super-opcode's 2-bit wire form.
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Frag => 1,
            Self::Ack => 2,
            Self::Internal => 3,
        }
    }
}

/// Decoded form of the 1- or 2-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Payload bytes following the header and optional ACK-ID tag, in
    /// `0..=2048`.
    ///
    /// Zero occurs only as the fragment abort / huge-completion signal,
    /// carried in the otherwise-redundant two-byte form of a one-byte
    /// length.
    pub len: usize,
    /// Whether this message is reliable (`R`).
    pub reliable: bool,
    /// Whether an ACK-ID tag follows the header (`I`).
    pub with_ack_id: bool,
    /// The message's super-opcode.
    pub sop: SuperOpcode,
}

/// The compressed ACK-ID attached to a reliable message.
///
/// `bits` is the significant width (5, 12, or 20); `partial` holds the low
/// `bits` bits of the transmitted ID. The receiver recovers the full ID with
/// [`AckIdTag::reconstruct`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckIdTag {
    /// Stream the tagged message travels on.
    pub stream: StreamId,
    /// Significant ID bits carried: 5, 12, or 20.
    pub bits: u32,
    /// The low `bits` bits of the ACK-ID.
    pub partial: u32,
}

/// Total-length prefix carried by the first fragment of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragStart {
    /// Total reassembled length in bytes, or [`FRAG_HUGE`].
    pub total_len: u16,
}

impl FragStart {
    /// Start header of a huge message, streamed instead of reassembled.
    pub const HUGE: Self = Self {
        total_len: FRAG_HUGE,
    };

    /// Whether this starts a huge message.
    #[must_use]
    pub const fn is_huge(self) -> bool {
        self.total_len == FRAG_HUGE
    }
}

/// Average observed transit time in milliseconds, opening an ACK body.
///
/// Encoded in 1 byte below 128 ms, else 2 bytes (14 significant bits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TripTime(pub u32);

/// One field of a selective-ACK body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckField {
    /// Everything below the carried ID on `stream` has been received.
    Rollup {
        /// Stream being acknowledged.
        stream: StreamId,
        /// Low [`ROLLUP_ID_BITS`] bits of the receiver's next expected ID.
        partial: u32,
    },
    /// A run of additionally-received IDs beyond the last rollup.
    Range {
        /// Offset of the run's first ID from the previous emitted ID.
        start_offset: u32,
        /// Offset of the run's last ID from its first; 0 for a lone ID.
        end_offset: u32,
    },
}

/// First payload byte of a [`SuperOpcode::Internal`] message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalOpcode {
    /// Path-MTU probe; the payload is discardable keyed-PRF output sized to
    /// the candidate MTU.
    MtuProbe,
    /// Disconnect notice; the payload is a 1-byte reason.
    Disconnect,
    /// Random-length padding, discarded on receipt.
    Pad,
}

impl InternalOpcode {
    /// Reads an internal opcode from its wire byte, if this layer defines
    /// it; undefined opcodes are forwarded to the upper layer.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::MtuProbe),
            2 => Some(Self::Disconnect),
            3 => Some(Self::Pad),
            _ => None,
        }
    }

    /// This opcode's wire byte.
    #[must_use]
    pub const fn into_raw(self) -> u8 {
        match self {
            Self::MtuProbe => 1,
            Self::Disconnect => 2,
            Self::Pad => 3,
        }
    }
}
