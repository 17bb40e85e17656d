use {
    super::{FRAG_START_BYTES, FragStart},
    core::convert::Infallible,
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

impl FixedEncodeLen for FragStart {
    const ENCODE_LEN: usize = FRAG_START_BYTES;
}

impl Encode for FragStart {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        // little-endian
        dst.write(&((self.total_len & 0xff) as u8))?;
        dst.write(&((self.total_len >> 8) as u8))?;
        Ok(())
    }
}

impl Decode for FragStart {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let lo = src.read::<u8>()?;
        let hi = src.read::<u8>()?;
        Ok(Self {
            total_len: u16::from(lo) | (u16::from(hi) << 8),
        })
    }
}
