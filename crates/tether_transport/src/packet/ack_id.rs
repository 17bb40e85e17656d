use {
    super::{AckId, AckIdTag, C_MASK},
    crate::stream::StreamId,
    core::{cmp::Ordering, convert::Infallible},
    octs::{BufTooShortOr, Decode, Encode, EncodeLen, Read, Write},
};

/// Below this distance from the receiver's expected ID, the 1-byte (5-bit)
/// tag reconstructs unambiguously.
const ONE_BYTE_THRESH: u32 = 1 << 4;

/// Below this distance, the 2-byte (12-bit) tag reconstructs unambiguously.
const TWO_BYTE_THRESH: u32 = 1 << 11;

impl AckId {
    /// The ID assigned after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Signed distance from `self` to `rhs`, respecting wraparound.
    ///
    /// ```
    /// # use tether_transport::packet::AckId;
    /// assert_eq!(3, AckId(5).dist_to(AckId(8)));
    /// assert_eq!(-3, AckId(8).dist_to(AckId(5)));
    /// assert_eq!(1, AckId(u32::MAX).dist_to(AckId(0)));
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i32 {
        rhs.0.wrapping_sub(self.0) as i32
    }

    /// Reconstructs a full ID from its low `bits` bits, picking the unique
    /// value whose signed distance from `reference` lies in
    /// `[-2^(bits-1), 2^(bits-1))`.
    #[must_use]
    pub const fn reconstruct(bits: u32, reference: Self, partial: u32) -> Self {
        debug_assert!(bits >= 1 && bits < 32);
        let window = 1u32 << bits;
        let diff = partial.wrapping_sub(reference.0) & (window - 1);
        if diff < window >> 1 {
            Self(reference.0.wrapping_add(diff))
        } else {
            Self(reference.0.wrapping_add(diff).wrapping_sub(window))
        }
    }
}

impl Ord for AckId {
    /// Wrap-aware comparison: `a < b` iff the signed distance from `a` to
    /// `b` is positive. Only meaningful for IDs less than `2^31` apart,
    /// which the id-span guard keeps far from.
    fn cmp(&self, other: &Self) -> Ordering {
        0.cmp(&self.dist_to(*other))
    }
}

impl PartialOrd for AckId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl AckIdTag {
    /// Builds the narrowest tag for `id` that the receiver can still
    /// reconstruct, given the latest rolled-up estimate of its next
    /// expected ID.
    #[must_use]
    pub fn compress(stream: StreamId, id: AckId, remote_expected: AckId) -> Self {
        let diff = id.0.wrapping_sub(remote_expected.0);
        let bits = if diff < ONE_BYTE_THRESH {
            5
        } else if diff < TWO_BYTE_THRESH {
            12
        } else {
            20
        };
        Self {
            stream,
            bits,
            partial: id.0 & ((1 << bits) - 1),
        }
    }

    /// Builds the full 3-byte tag.
    ///
    /// Retransmissions cannot assume anything about the receiver's next
    /// expected ID, so they always use this form.
    #[must_use]
    pub const fn full(stream: StreamId, id: AckId) -> Self {
        Self {
            stream,
            bits: 20,
            partial: id.0 & ((1 << 20) - 1),
        }
    }

    /// Recovers the full ID against the receiver's next expected ID.
    #[must_use]
    pub const fn reconstruct(&self, expected: AckId) -> AckId {
        AckId::reconstruct(self.bits, expected, self.partial)
    }
}

impl EncodeLen for AckIdTag {
    fn encode_len(&self) -> usize {
        match self.bits {
            5 => 1,
            12 => 2,
            _ => 3,
        }
    }
}

impl Encode for AckIdTag {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let byte0 = self.stream.into_raw() | (((self.partial & 0x1f) as u8) << 2);
        match self.bits {
            5 => dst.write(&byte0)?,
            12 => {
                dst.write(&(byte0 | C_MASK))?;
                dst.write(&(((self.partial >> 5) & 0x7f) as u8))?;
            }
            _ => {
                dst.write(&(byte0 | C_MASK))?;
                dst.write(&((((self.partial >> 5) & 0x7f) as u8) | C_MASK))?;
                dst.write(&(((self.partial >> 12) & 0xff) as u8))?;
            }
        }
        Ok(())
    }
}

impl Decode for AckIdTag {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let byte0 = src.read::<u8>()?;
        let stream = StreamId::from_wire_bits(byte0);
        let mut partial = u32::from(byte0 >> 2) & 0x1f;
        let mut bits = 5;

        if byte0 & C_MASK != 0 {
            let byte1 = src.read::<u8>()?;
            partial |= (u32::from(byte1) & 0x7f) << 5;
            bits = 12;

            if byte1 & C_MASK != 0 {
                let byte2 = src.read::<u8>()?;
                partial |= u32::from(byte2) << 12;
                bits = 20;
            }
        }

        Ok(Self {
            stream,
            bits,
            partial,
        })
    }
}
