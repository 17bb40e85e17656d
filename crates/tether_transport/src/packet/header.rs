use {
    super::{
        C_MASK, I_MASK, LEN_HI_SHIFT, LEN_LO_MASK, MAX_MESSAGE_LEN, MessageHeader, R_MASK,
        SOP_SHIFT, SuperOpcode,
    },
    core::convert::Infallible,
    octs::{BufError, BufTooShortOr, Decode, Encode, EncodeLen, Read, Write},
};

/// Attempted to [`Encode`] a [`MessageHeader`] whose length is outside
/// `1..=2048`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("header length {len} outside 1..={MAX_MESSAGE_LEN}")]
pub struct LenOutOfRange {
    /// The rejected length.
    pub len: usize,
}

impl BufError for LenOutOfRange {}

impl MessageHeader {
    /// Encoded length of a header describing `len` payload bytes.
    ///
    /// `len` must be in `0..=2048`.
    #[must_use]
    pub const fn len_for(len: usize) -> usize {
        if len >= 1 && len - 1 <= LEN_LO_MASK as usize {
            1
        } else {
            2
        }
    }
}

impl EncodeLen for MessageHeader {
    fn encode_len(&self) -> usize {
        Self::len_for(self.len)
    }
}

impl Encode for MessageHeader {
    type Error = LenOutOfRange;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        if self.len > MAX_MESSAGE_LEN {
            return Err(LenOutOfRange { len: self.len }.into());
        }

        let mut byte0 = self.sop.into_bits() << SOP_SHIFT;
        if self.reliable {
            byte0 |= R_MASK;
        }
        if self.with_ack_id {
            byte0 |= I_MASK;
        }

        if self.len == 0 {
            // one-byte payloads never use the two-byte form, so a C-form
            // header with a zero field is free to mean "no payload"; the
            // fragment abort signal needs it
            dst.write(&(byte0 | C_MASK))?;
            dst.write(&0u8)?;
            return Ok(());
        }

        // the length field is biased: a wire value of 0 means 1 byte
        let field = (self.len - 1) as u16;
        byte0 |= field as u8 & LEN_LO_MASK;

        if field <= u16::from(LEN_LO_MASK) {
            dst.write(&byte0)?;
        } else {
            dst.write(&(byte0 | C_MASK))?;
            dst.write(&((field >> LEN_HI_SHIFT) as u8))?;
        }
        Ok(())
    }
}

impl Decode for MessageHeader {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let byte0 = src.read::<u8>()?;
        let mut field = u16::from(byte0 & LEN_LO_MASK);
        let mut len = usize::from(field) + 1;
        if byte0 & C_MASK != 0 {
            field |= u16::from(src.read::<u8>()?) << LEN_HI_SHIFT;
            // the redundant C-form of a one-byte length is the
            // empty-payload marker
            len = if field == 0 { 0 } else { usize::from(field) + 1 };
        }
        Ok(Self {
            len,
            reliable: byte0 & R_MASK != 0,
            with_ack_id: byte0 & I_MASK != 0,
            sop: SuperOpcode::from_bits(byte0 >> SOP_SHIFT),
        })
    }
}
