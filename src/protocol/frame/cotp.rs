use super::{
    super::error::{Error, Result},
    types::CotpType,
    WireDecode, WireEncode,
};
use bytes::{BufMut, Bytes};

/// Parameter code: TPDU size exponent
pub const PARAM_TPDU_SIZE: u8 = 0xC0;
/// Parameter code: calling (source) TSAP
pub const PARAM_SRC_TSAP: u8 = 0xC1;
/// Parameter code: called (destination) TSAP
pub const PARAM_DST_TSAP: u8 = 0xC2;

/// Fixed overhead of a COTP Data TPDU header (bytes): LI(1) + Type(1) + EOT/NR(1)
pub const COTP_DT_HEADER_LEN: usize = 3;

/// Smallest and largest TPDU size codes defined by ISO 8073 (128..=8192 bytes)
pub const TPDU_SIZE_CODE_MIN: u8 = 0x07;
pub const TPDU_SIZE_CODE_MAX: u8 = 0x0D;

/// COTP TPDU (subset sufficient for ISO-on-TCP + S7)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cotp {
    /// Connection Request
    Cr(ConnectParams),
    /// Connection Confirm
    Cc(ConnectParams),
    /// Disconnection Request
    Dr(DisconnectParams),
    /// Data TPDU header; the user payload follows on the wire
    Dt(DataParams),
}

impl Cotp {
    pub fn pdu_type(&self) -> CotpType {
        match self {
            Cotp::Cr(_) => CotpType::Cr,
            Cotp::Cc(_) => CotpType::Cc,
            Cotp::Dr(_) => CotpType::Dr,
            Cotp::Dt(_) => CotpType::Dt,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Cotp::Cr(p) | Cotp::Cc(p) => p.encoded_len(&()),
            Cotp::Dr(p) => p.encoded_len(&()),
            Cotp::Dt(p) => p.encoded_len(&()),
        }
    }
}

impl WireEncode for Cotp {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        // LI + type + body
        2 + self.body_len()
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, ctx: &Self::Context) -> Result<()> {
        let li = u8::try_from(1 + self.body_len()).map_err(|_| Error::Encode {
            context: "COTP header exceeds LI range",
        })?;
        dst.put_u8(li);
        dst.put_u8(self.pdu_type() as u8);
        match self {
            Cotp::Cr(p) | Cotp::Cc(p) => p.encode_to(dst, ctx),
            Cotp::Dr(p) => p.encode_to(dst, ctx),
            Cotp::Dt(p) => p.encode_to(dst, ctx),
        }
    }
}

impl WireDecode for Cotp {
    type Error = Error;
    type Context = ();

    /// Parse one COTP header.
    ///
    /// Consumes exactly `1 + LI` bytes; for DT the returned rest is the user
    /// payload.
    fn parse<'a>(
        input: &'a [u8],
        _parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        if input.len() < 2 {
            return Err(Error::InsufficientData {
                needed: 2,
                available: input.len(),
            });
        }
        let li = input[0] as usize;
        let total = 1 + li;
        if li < 1 || total > input.len() {
            return Err(Error::ProtocolViolation {
                context: "invalid COTP LI",
            });
        }
        let body = &input[2..total];
        let rest = &input[total..];
        let pdu_type = CotpType::try_from(input[1]).map_err(|_| Error::ProtocolViolation {
            context: "unknown COTP PDU type",
        })?;
        let cotp = match pdu_type {
            CotpType::Cr => Cotp::Cr(ConnectParams::parse_body(body)?),
            CotpType::Cc => Cotp::Cc(ConnectParams::parse_body(body)?),
            CotpType::Dr => Cotp::Dr(DisconnectParams::parse_body(body)?),
            CotpType::Dt => Cotp::Dt(DataParams::parse_body(body)?),
        };
        Ok((rest, cotp))
    }
}

/// Parameters shared by CR and CC TPDUs.
///
/// TSAPs are optional on decode: some peers omit them in the confirm. A CR
/// always carries all three parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    pub dst_ref: u16,
    pub src_ref: u16,
    /// Class/option byte (class 0 for ISO-on-TCP)
    pub class_option: u8,
    /// TPDU size exponent: size = 1 << code
    pub tpdu_size: Option<u8>,
    pub src_tsap: Option<u16>,
    pub dst_tsap: Option<u16>,
}

impl ConnectParams {
    /// Parameters of a client connection request
    pub fn request(src_ref: u16, tpdu_size: u8, src_tsap: u16, dst_tsap: u16) -> Self {
        Self {
            dst_ref: 0x0000,
            src_ref,
            class_option: 0x00,
            tpdu_size: Some(tpdu_size),
            src_tsap: Some(src_tsap),
            dst_tsap: Some(dst_tsap),
        }
    }

    pub fn tpdu_size_bytes(&self) -> Option<usize> {
        self.tpdu_size.and_then(tpdu_size_bytes_from_code)
    }

    fn parse_body(body: &[u8]) -> Result<Self> {
        if body.len() < 5 {
            return Err(Error::ErrInvalidFrame);
        }
        let mut params = ConnectParams {
            dst_ref: u16::from_be_bytes([body[0], body[1]]),
            src_ref: u16::from_be_bytes([body[2], body[3]]),
            class_option: body[4],
            tpdu_size: None,
            src_tsap: None,
            dst_tsap: None,
        };
        for (code, value) in TlvIter::new(&body[5..]) {
            let value = value?;
            match (code, value.len()) {
                (PARAM_TPDU_SIZE, 1) => params.tpdu_size = Some(value[0]),
                (PARAM_SRC_TSAP, 2) => {
                    params.src_tsap = Some(u16::from_be_bytes([value[0], value[1]]))
                }
                (PARAM_DST_TSAP, 2) => {
                    params.dst_tsap = Some(u16::from_be_bytes([value[0], value[1]]))
                }
                // unknown parameters are skipped
                _ => {}
            }
        }
        Ok(params)
    }
}

impl WireEncode for ConnectParams {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        5 + self.tpdu_size.map_or(0, |_| 3)
            + self.src_tsap.map_or(0, |_| 4)
            + self.dst_tsap.map_or(0, |_| 4)
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        dst.put_u16(self.dst_ref);
        dst.put_u16(self.src_ref);
        dst.put_u8(self.class_option);
        if let Some(size) = self.tpdu_size {
            write_tlv(dst, PARAM_TPDU_SIZE, &[size]);
        }
        if let Some(tsap) = self.src_tsap {
            write_tlv(dst, PARAM_SRC_TSAP, &tsap.to_be_bytes());
        }
        if let Some(tsap) = self.dst_tsap {
            write_tlv(dst, PARAM_DST_TSAP, &tsap.to_be_bytes());
        }
        Ok(())
    }
}

/// COTP Disconnection Request parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectParams {
    pub dst_ref: u16,
    pub src_ref: u16,
    /// Disconnect reason (0x80 = normal)
    pub reason: u8,
}

impl Default for DisconnectParams {
    fn default() -> Self {
        Self {
            dst_ref: 0x0000,
            src_ref: 0x0001,
            reason: 0x80,
        }
    }
}

impl DisconnectParams {
    fn parse_body(body: &[u8]) -> Result<Self> {
        if body.len() < 5 {
            return Err(Error::ErrInvalidFrame);
        }
        // trailing variable part (additional info) is tolerated and ignored
        for (_, value) in TlvIter::new(&body[5..]) {
            value?;
        }
        Ok(DisconnectParams {
            dst_ref: u16::from_be_bytes([body[0], body[1]]),
            src_ref: u16::from_be_bytes([body[2], body[3]]),
            reason: body[4],
        })
    }
}

impl WireEncode for DisconnectParams {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        5
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        dst.put_u16(self.dst_ref);
        dst.put_u16(self.src_ref);
        dst.put_u8(self.reason);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataParams {
    /// End of transmission: last TPDU of one S7 PDU
    pub eot: bool,
    pub tpdu_nr: u8,
}

impl Default for DataParams {
    fn default() -> Self {
        Self {
            eot: true,
            tpdu_nr: 0,
        }
    }
}

impl DataParams {
    fn parse_body(body: &[u8]) -> Result<Self> {
        let eot_nr = *body.first().ok_or(Error::ErrInvalidFrame)?;
        Ok(DataParams {
            eot: (eot_nr & 0x80) != 0,
            tpdu_nr: eot_nr & 0x7F,
        })
    }
}

impl WireEncode for DataParams {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        1
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        let nr = self.tpdu_nr & 0x7F;
        dst.put_u8(if self.eot { 0x80 | nr } else { nr });
        Ok(())
    }
}

/// Map TPDU size code (2^n) to actual byte size
pub fn tpdu_size_bytes_from_code(code: u8) -> Option<usize> {
    if (TPDU_SIZE_CODE_MIN..=TPDU_SIZE_CODE_MAX).contains(&code) {
        Some(1usize << code)
    } else {
        None
    }
}

/// Map a byte size to its TPDU size code; only exact powers of two in range qualify
pub fn tpdu_size_code_from_bytes(size: usize) -> Option<u8> {
    if !size.is_power_of_two() {
        return None;
    }
    let code = size.trailing_zeros() as u8;
    tpdu_size_bytes_from_code(code).map(|_| code)
}

#[inline]
fn write_tlv<B: BufMut>(dst: &mut B, code: u8, bytes: &[u8]) {
    dst.put_u8(code);
    dst.put_u8(bytes.len() as u8);
    dst.put_slice(bytes);
}

/// Iterator over `code, len, value` parameters of the COTP variable part
struct TlvIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = (u8, Result<&'a [u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 2 > self.data.len() {
            return None;
        }
        let code = self.data[self.pos];
        let len = self.data[self.pos + 1] as usize;
        let start = self.pos + 2;
        if start + len > self.data.len() {
            self.pos = self.data.len();
            return Some((code, Err(Error::ErrInvalidFrame)));
        }
        self.pos = start + len;
        Some((code, Ok(&self.data[start..start + len])))
    }
}
