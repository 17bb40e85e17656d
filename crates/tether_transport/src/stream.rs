//! Stream identities and the guarantees each stream provides.
//!
//! Reliable messages travel on one of four *streams*. Within a stream,
//! delivery guarantees depend on the stream's identity:
//!
//! - stream 0 is *unordered-reliable*: every message is delivered exactly
//!   once, but a message that arrives ahead of its predecessors is handed to
//!   the application immediately rather than held back;
//! - streams 1..3 are *ordered-reliable*: messages are delivered exactly
//!   once, in the order their ACK-IDs were assigned at first transmission;
//! - stream 3 is additionally the *bulk* stream: when bandwidth is divided
//!   between streams each tick, bulk absorbs whatever the others leave.
//!
//! No ordering is promised *between* streams. The unreliable mode does not
//! consume a stream at all; it rides the same datagrams with the reliable
//! bit clear.

use {
    core::fmt,
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
    std::convert::Infallible,
};

/// Identity of one of the four reliable streams.
///
/// On the wire a stream id occupies the low 2 bits of an ACK-ID tag or a
/// rollup field; it is never transmitted on its own. The [`Encode`] and
/// [`Decode`] impls exist for test harness convenience and carry the id as a
/// full byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u8);

impl StreamId {
    /// Number of reliable streams.
    pub const COUNT: usize = 4;

    /// The unordered-reliable stream.
    pub const UNORDERED: Self = Self(0);

    /// The bulk stream, lowest-priority claimant of leftover bandwidth.
    pub const BULK: Self = Self(3);

    /// Creates a stream id from a raw value, if it names a valid stream.
    #[must_use]
    pub const fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < Self::COUNT {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Creates a stream id from the low 2 bits of a wire byte.
    #[must_use]
    pub const fn from_wire_bits(raw: u8) -> Self {
        Self(raw & 0b11)
    }

    /// Raw value of this stream id, in `0..4`.
    #[must_use]
    pub const fn into_raw(self) -> u8 {
        self.0
    }

    /// This stream id as an index into per-stream state arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// All stream ids in transmission priority order: unordered first, bulk
    /// last.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..Self::COUNT as u8).map(Self)
    }

    /// Whether messages on this stream may be delivered as they arrive
    /// rather than in ACK-ID order.
    #[must_use]
    pub const fn is_unordered(self) -> bool {
        self.0 == Self::UNORDERED.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FixedEncodeLen for StreamId {
    const ENCODE_LEN: usize = u8::ENCODE_LEN;
}

impl Encode for StreamId {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for StreamId {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self::from_wire_bits(src.read()?))
    }
}
