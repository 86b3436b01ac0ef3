use super::{
    super::error::{Error, ErrorCode, Result},
    types::S7PduType,
    WireDecode, WireEncode,
};
use bytes::{BufMut, Bytes};

pub const S7_PROTOCOL_ID: u8 = 0x32;
/// Job / UserData header length
pub const S7_HEADER_LEN: usize = 10;
/// Ack / AckData header length (adds error class and code)
pub const S7_ACK_HEADER_LEN: usize = 12;

/// S7 Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Header {
    pub pdu_type: S7PduType,
    pub reserved: u16,
    /// Job reference; correlates a request with its reply
    pub pdu_ref: u16,
    pub param_len: u16,
    pub data_len: u16,
    /// Present for Ack/AckData only
    pub error: Option<ErrorCode>,
}

impl S7Header {
    pub fn new(pdu_type: S7PduType, pdu_ref: u16, param_len: u16, data_len: u16) -> Self {
        Self {
            pdu_type,
            reserved: 0,
            pdu_ref,
            param_len,
            data_len,
            error: pdu_type
                .has_error_field()
                .then(|| ErrorCode::new(0x00, 0x00)),
        }
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        if self.pdu_type.has_error_field() {
            S7_ACK_HEADER_LEN
        } else {
            S7_HEADER_LEN
        }
    }

    /// Header-level error reported by the peer, if any
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.filter(|code| !code.is_success())
    }
}

impl WireEncode for S7Header {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        self.header_len()
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        dst.put_u8(S7_PROTOCOL_ID);
        dst.put_u8(self.pdu_type as u8);
        dst.put_u16(self.reserved);
        dst.put_u16(self.pdu_ref);
        dst.put_u16(self.param_len);
        dst.put_u16(self.data_len);
        if self.pdu_type.has_error_field() {
            let code = self.error.unwrap_or(ErrorCode::new(0x00, 0x00));
            dst.put_u16(code.word());
        }
        Ok(())
    }
}

impl WireDecode for S7Header {
    type Error = Error;
    type Context = ();

    fn parse<'a>(
        input: &'a [u8],
        _parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        if input.len() < S7_HEADER_LEN {
            return Err(Error::InsufficientData {
                needed: S7_HEADER_LEN,
                available: input.len(),
            });
        }
        if input[0] != S7_PROTOCOL_ID {
            return Err(Error::ErrInvalidFrame);
        }
        let pdu_type = S7PduType::try_from(input[1]).map_err(|_| Error::ProtocolViolation {
            context: "unknown S7 PDU type",
        })?;
        let mut header = S7Header {
            pdu_type,
            reserved: u16::from_be_bytes([input[2], input[3]]),
            pdu_ref: u16::from_be_bytes([input[4], input[5]]),
            param_len: u16::from_be_bytes([input[6], input[7]]),
            data_len: u16::from_be_bytes([input[8], input[9]]),
            error: None,
        };
        let mut rest = &input[S7_HEADER_LEN..];
        if pdu_type.has_error_field() {
            if rest.len() < 2 {
                return Err(Error::InsufficientData {
                    needed: S7_ACK_HEADER_LEN,
                    available: input.len(),
                });
            }
            header.error = Some(ErrorCode::new(rest[0], rest[1]));
            rest = &rest[2..];
        }
        Ok((rest, header))
    }
}
