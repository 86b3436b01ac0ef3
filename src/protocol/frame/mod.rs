pub mod cotp;
pub mod header;
pub mod item;
pub mod pdu;
pub mod tpkt;
pub mod tsap;
pub mod types;
pub mod userdata;

use super::{
    error::{Error, Result},
    wire::slice_from_parent,
};
pub use super::wire::{WireDecode, WireEncode};
use bytes::{BufMut, Bytes, BytesMut};

pub use cotp::{
    tpdu_size_bytes_from_code, tpdu_size_code_from_bytes, ConnectParams, Cotp, DataParams,
    DisconnectParams, COTP_DT_HEADER_LEN,
};
pub use header::{S7Header, S7_ACK_HEADER_LEN, S7_HEADER_LEN};
pub use item::{DataItem, ReadItem, S7VarSpec, WriteItem, DATA_ITEM_HEADER_LEN, VAR_SPEC_LEN};
pub use pdu::{S7Body, S7Pdu, SetupCommunication};
pub use tpkt::{Tpkt, TPKT_HEADER_LEN};
pub use tsap::{default_tsap_pair, ConnectionType, CpuType, Tsap, TsapPair};
pub use types::{
    BlockType, CpuFunctionGroup, CpuFunctionType, S7Area, S7DataVariableType, S7Function,
    S7PduType, S7ReturnCode, S7TransportSize,
};
pub use userdata::{Alarm, AlarmTransition, BlockInfo, UserDataParam};

/// A decoded transport datagram: TPKT header, COTP TPDU and, for DT, the
/// user payload (one S7 PDU or a fragment of one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S7Frame {
    pub tpkt: Tpkt,
    pub cotp: Cotp,
    pub payload: Bytes,
}

impl S7Frame {
    pub fn new(cotp: Cotp, payload: Bytes) -> Result<Self> {
        let tpkt = Tpkt::with_payload_len(cotp.encoded_len(&()) + payload.len())?;
        Ok(Self {
            tpkt,
            cotp,
            payload,
        })
    }

    /// Data TPDU carrying `payload`
    pub fn data(payload: Bytes, eot: bool) -> Result<Self> {
        Self::new(Cotp::Dt(DataParams { eot, tpdu_nr: 0 }), payload)
    }

    /// Encode a whole datagram into a fresh buffer
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len(&()));
        self.encode_to(&mut buf, &())?;
        Ok(buf.freeze())
    }
}

impl WireEncode for S7Frame {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, ctx: &Self::Context) -> usize {
        self.tpkt.encoded_len(ctx) + self.cotp.encoded_len(ctx) + self.payload.len()
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, ctx: &Self::Context) -> Result<()> {
        self.tpkt.encode_to(dst, ctx)?;
        self.cotp.encode_to(dst, ctx)?;
        dst.put_slice(&self.payload);
        Ok(())
    }
}

impl WireDecode for S7Frame {
    type Error = Error;
    type Context = ();

    fn parse<'a>(
        input: &'a [u8],
        parent: &Bytes,
        ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        let (body, tpkt) = Tpkt::parse(input, parent, ctx)?;
        let (payload, cotp) = Cotp::parse(body, parent, ctx)?;
        if !matches!(cotp, Cotp::Dt(_)) && !payload.is_empty() {
            return Err(Error::ProtocolViolation {
                context: "user data on a non-DT TPDU",
            });
        }
        Ok((
            &payload[payload.len()..],
            S7Frame {
                tpkt,
                cotp,
                payload: slice_from_parent(parent, payload),
            },
        ))
    }
}

/// Split one encoded S7 PDU into DT datagrams that fit `frame_size`.
///
/// Only the last segment carries EOT.
pub fn segment_pdu(pdu: Bytes, frame_size: usize) -> Result<Vec<S7Frame>> {
    let chunk = frame_size.saturating_sub(COTP_DT_HEADER_LEN);
    if chunk == 0 {
        return Err(Error::InvalidConfiguration("frame size"));
    }
    if pdu.len() <= chunk {
        return Ok(vec![S7Frame::data(pdu, true)?]);
    }
    let segments = pdu.len().div_ceil(chunk);
    (0..segments)
        .map(|idx| {
            let start = idx * chunk;
            let end = (start + chunk).min(pdu.len());
            S7Frame::data(pdu.slice(start..end), idx + 1 == segments)
        })
        .collect()
}
