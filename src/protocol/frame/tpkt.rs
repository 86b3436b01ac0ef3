use super::{
    super::error::{Error, Result},
    WireDecode, WireEncode,
};
use bytes::{BufMut, Bytes};

/// TPKT header size in bytes
pub const TPKT_HEADER_LEN: usize = 4;

/// TPKT (RFC1006) header: 4 bytes
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Tpkt {
    /// Always 0x03 for RFC1006
    pub version: u8,
    /// Reserved, always 0x00
    pub reserved: u8,
    /// Total length including this 4-byte header
    pub length: u16,
}

impl Tpkt {
    /// Build a TPKT header from payload length (payload includes COTP bytes).
    pub fn with_payload_len(payload_len: usize) -> Result<Self> {
        let total = TPKT_HEADER_LEN + payload_len;
        let length = u16::try_from(total).map_err(|_| Error::Encode {
            context: "TPKT length exceeds u16",
        })?;
        Ok(Self {
            version: 0x03,
            reserved: 0x00,
            length,
        })
    }
}

impl WireEncode for Tpkt {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        TPKT_HEADER_LEN
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        dst.put_u8(self.version);
        dst.put_u8(self.reserved);
        dst.put_u16(self.length);
        Ok(())
    }
}

impl WireDecode for Tpkt {
    type Error = Error;
    type Context = ();

    /// Parse the header of one complete TPKT frame and return its body (the
    /// COTP TPDU). Trailing bytes beyond the declared length are rejected.
    fn parse<'a>(
        input: &'a [u8],
        _parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        if input.len() < TPKT_HEADER_LEN {
            return Err(Error::InsufficientData {
                needed: TPKT_HEADER_LEN,
                available: input.len(),
            });
        }
        let (version, reserved) = (input[0], input[1]);
        if version != 0x03 || reserved != 0x00 {
            return Err(Error::ErrInvalidFrame);
        }
        let length = u16::from_be_bytes([input[2], input[3]]) as usize;
        if length < TPKT_HEADER_LEN || length != input.len() {
            return Err(Error::ErrInvalidFrame);
        }
        Ok((
            &input[TPKT_HEADER_LEN..],
            Tpkt {
                version,
                reserved,
                length: length as u16,
            },
        ))
    }
}
