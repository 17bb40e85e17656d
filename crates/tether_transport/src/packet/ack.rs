//! Wire form of the selective-ACK message body.
//!
//! The body opens with a [`TripTime`] field, then holds a sequence of
//! [`AckField`]s. The low bit of a field's first byte separates the two
//! kinds:
//!
//! - **rollup** (low bit 1): 3 bytes carrying the stream (2 bits) and 21
//!   low bits of the receiver's next expected ID: everything below that ID
//!   on that stream has been received;
//! - **range** (low bit 0): a pair of additionally-received IDs, encoded as
//!   offsets from the previous ID emitted in the same body (the last rollup
//!   or range end). Start offsets use the 5/12/20-bit continuation scheme,
//!   end offsets a 7/14/22-bit one; a flag bit distinguishes a lone ID from
//!   a `start..=end` run.
//!
//! Offsets make each maximal contiguous run of the receive-wait queue cost
//! only a few bytes, however far the IDs have advanced.

use {
    super::{AckField, C_MASK, TripTime},
    core::convert::Infallible,
    octs::{BufError, BufTooShortOr, Decode, Encode, EncodeLen, Read, Write},
};

/// Number of significant ID bits in a rollup field.
pub const ROLLUP_ID_BITS: u32 = 21;

/// Largest trip time representable on the wire, in milliseconds.
pub const MAX_TRIP_TIME_MS: u32 = (1 << 14) - 1;

impl TripTime {
    /// Creates a trip-time field, saturating at [`MAX_TRIP_TIME_MS`].
    #[must_use]
    pub const fn new(ms: u32) -> Self {
        if ms > MAX_TRIP_TIME_MS {
            Self(MAX_TRIP_TIME_MS)
        } else {
            Self(ms)
        }
    }
}

impl EncodeLen for TripTime {
    fn encode_len(&self) -> usize {
        if self.0 < u32::from(C_MASK) { 1 } else { 2 }
    }
}

impl Encode for TripTime {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        if self.0 < u32::from(C_MASK) {
            dst.write(&(self.0 as u8))?;
        } else {
            dst.write(&(((self.0 & 0x7f) as u8) | C_MASK))?;
            dst.write(&(((self.0 >> 7) & 0x7f) as u8))?;
        }
        Ok(())
    }
}

impl Decode for TripTime {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let byte0 = src.read::<u8>()?;
        let mut ms = u32::from(byte0 & 0x7f);
        if byte0 & C_MASK != 0 {
            ms |= u32::from(src.read::<u8>()?) << 7;
        }
        Ok(Self(ms))
    }
}

/// Failed to encode an [`AckField`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AckFieldError {
    /// A range start offset was too large for the 20-bit encoding.
    #[error("range start offset {offset} too large")]
    StartOffset {
        /// The rejected offset.
        offset: u32,
    },
    /// A range end offset was too large for the 22-bit encoding.
    #[error("range end offset {offset} too large")]
    EndOffset {
        /// The rejected offset.
        offset: u32,
    },
}

impl BufError for AckFieldError {}

impl AckField {
    /// Worst-case encoded length of one field.
    pub const MAX_ENCODE_LEN: usize = 6;
}

impl EncodeLen for AckField {
    fn encode_len(&self) -> usize {
        match *self {
            Self::Rollup { .. } => 3,
            Self::Range {
                start_offset,
                end_offset,
            } => {
                let start = if start_offset < 1 << 5 {
                    1
                } else if start_offset < 1 << 12 {
                    2
                } else {
                    3
                };
                let end = if end_offset == 0 {
                    0
                } else if end_offset < 1 << 7 {
                    1
                } else if end_offset < 1 << 14 {
                    2
                } else {
                    3
                };
                start + end
            }
        }
    }
}

impl Encode for AckField {
    type Error = AckFieldError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        match *self {
            Self::Rollup { stream, partial } => {
                dst.write(&(1 | (stream.into_raw() << 1) | (((partial & 0x1f) as u8) << 3)))?;
                dst.write(&(((partial >> 5) & 0xff) as u8))?;
                dst.write(&(((partial >> 13) & 0xff) as u8))?;
            }
            Self::Range {
                start_offset,
                end_offset,
            } => {
                if start_offset >= 1 << 20 {
                    return Err(AckFieldError::StartOffset {
                        offset: start_offset,
                    }
                    .into());
                }
                if end_offset >= 1 << 22 {
                    return Err(AckFieldError::EndOffset { offset: end_offset }.into());
                }

                let has_end = u8::from(end_offset != 0) << 1;
                let byte0 = has_end | (((start_offset & 0x1f) as u8) << 2);
                if start_offset < 1 << 5 {
                    dst.write(&byte0)?;
                } else if start_offset < 1 << 12 {
                    dst.write(&(byte0 | C_MASK))?;
                    dst.write(&(((start_offset >> 5) & 0x7f) as u8))?;
                } else {
                    dst.write(&(byte0 | C_MASK))?;
                    dst.write(&((((start_offset >> 5) & 0x7f) as u8) | C_MASK))?;
                    dst.write(&(((start_offset >> 12) & 0xff) as u8))?;
                }

                if end_offset != 0 {
                    if end_offset < 1 << 7 {
                        dst.write(&((end_offset & 0x7f) as u8))?;
                    } else if end_offset < 1 << 14 {
                        dst.write(&(((end_offset & 0x7f) as u8) | C_MASK))?;
                        dst.write(&(((end_offset >> 7) & 0x7f) as u8))?;
                    } else {
                        dst.write(&(((end_offset & 0x7f) as u8) | C_MASK))?;
                        dst.write(&((((end_offset >> 7) & 0x7f) as u8) | C_MASK))?;
                        dst.write(&(((end_offset >> 14) & 0xff) as u8))?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Decode for AckField {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let byte0 = src.read::<u8>()?;

        if byte0 & 1 != 0 {
            let byte1 = src.read::<u8>()?;
            let byte2 = src.read::<u8>()?;
            return Ok(Self::Rollup {
                stream: crate::stream::StreamId::from_wire_bits(byte0 >> 1),
                partial: u32::from(byte0 >> 3) | (u32::from(byte1) << 5) | (u32::from(byte2) << 13),
            });
        }

        let has_end = byte0 & 0b10 != 0;
        let mut start_offset = u32::from(byte0 >> 2) & 0x1f;
        if byte0 & C_MASK != 0 {
            let byte1 = src.read::<u8>()?;
            start_offset |= (u32::from(byte1) & 0x7f) << 5;
            if byte1 & C_MASK != 0 {
                start_offset |= u32::from(src.read::<u8>()?) << 12;
            }
        }

        let mut end_offset = 0;
        if has_end {
            let byte0 = src.read::<u8>()?;
            end_offset = u32::from(byte0) & 0x7f;
            if byte0 & C_MASK != 0 {
                let byte1 = src.read::<u8>()?;
                end_offset |= (u32::from(byte1) & 0x7f) << 7;
                if byte1 & C_MASK != 0 {
                    end_offset |= u32::from(src.read::<u8>()?) << 14;
                }
            }
        }

        Ok(Self::Range {
            start_offset,
            end_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::stream::StreamId, octs::BytesMut};

    fn round_trip(field: AckField) {
        let mut buf = BytesMut::new();
        buf.write(&field).unwrap();
        assert_eq!(field.encode_len(), buf.len());
        assert_eq!(field, buf.freeze().read::<AckField>().unwrap());
    }

    #[test]
    fn trip_time() {
        for ms in [0u32, 1, 127, 128, 1000, MAX_TRIP_TIME_MS] {
            let trip = TripTime::new(ms);
            let mut buf = BytesMut::new();
            buf.write(&trip).unwrap();
            assert_eq!(trip.encode_len(), buf.len());
            assert_eq!(trip, buf.freeze().read::<TripTime>().unwrap());
        }
        assert_eq!(TripTime(MAX_TRIP_TIME_MS), TripTime::new(u32::MAX));
    }

    #[test]
    fn rollup() {
        for stream in StreamId::all() {
            for partial in [0u32, 1, 31, 32, (1 << 13) - 1, 1 << 13, (1 << 21) - 1] {
                round_trip(AckField::Rollup { stream, partial });
            }
        }
    }

    #[test]
    fn range_widths() {
        for start_offset in [0u32, 1, 31, 32, (1 << 12) - 1, 1 << 12, (1 << 20) - 1] {
            for end_offset in [0u32, 1, 127, 128, (1 << 14) - 1, 1 << 14, (1 << 22) - 1] {
                round_trip(AckField::Range {
                    start_offset,
                    end_offset,
                });
            }
        }
    }

    #[test]
    fn lone_id_is_one_byte() {
        let field = AckField::Range {
            start_offset: 3,
            end_offset: 0,
        };
        assert_eq!(1, field.encode_len());
    }

    #[test]
    fn oversized_offsets_rejected() {
        let mut buf = BytesMut::new();
        assert!(
            buf.write(&AckField::Range {
                start_offset: 1 << 20,
                end_offset: 0,
            })
            .is_err()
        );
        assert!(
            buf.write(&AckField::Range {
                start_offset: 0,
                end_offset: 1 << 22,
            })
            .is_err()
        );
    }
}
