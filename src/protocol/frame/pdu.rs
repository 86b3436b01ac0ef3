use super::{
    super::{
        error::{Error, Result},
        wire::slice_from_parent,
    },
    header::S7Header,
    item::{
        data_items_len, encode_data_items, parse_data_items, parse_var_specs, DataItem,
        S7VarSpec, WriteItem, VAR_SPEC_LEN,
    },
    types::{S7Function, S7PduType, S7ReturnCode},
    userdata::UserDataParam,
    WireDecode, WireEncode,
};
use bytes::{BufMut, Bytes, BytesMut};

/// One S7 PDU: header plus raw parameter and data sections.
///
/// This is what travels through the dispatcher; the typed view is produced on
/// demand with [`S7Pdu::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S7Pdu {
    pub header: S7Header,
    pub param: Bytes,
    pub data: Bytes,
}

impl S7Pdu {
    pub fn new(pdu_type: S7PduType, pdu_ref: u16, param: Bytes, data: Bytes) -> Result<Self> {
        let param_len = u16::try_from(param.len()).map_err(|_| Error::Encode {
            context: "parameter section too long",
        })?;
        let data_len = u16::try_from(data.len()).map_err(|_| Error::Encode {
            context: "data section too long",
        })?;
        Ok(Self {
            header: S7Header::new(pdu_type, pdu_ref, param_len, data_len),
            param,
            data,
        })
    }

    #[inline]
    pub fn pdu_ref(&self) -> u16 {
        self.header.pdu_ref
    }

    #[inline]
    pub fn set_pdu_ref(&mut self, pdu_ref: u16) {
        self.header.pdu_ref = pdu_ref;
    }

    /// First parameter byte: the function code for Job/AckData
    #[inline]
    pub fn function(&self) -> Option<u8> {
        self.param.first().copied()
    }

    /// Fail with the header-level error the peer reported, if any
    pub fn check_header(&self) -> Result<()> {
        match self.header.error_code() {
            Some(code) => Err(Error::S7Error { code }),
            None => Ok(()),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len(&()));
        self.encode_to(&mut buf, &())?;
        Ok(buf.freeze())
    }

    /// Typed view of parameter and data sections
    pub fn decode(&self) -> Result<S7Body> {
        let pdu_type = self.header.pdu_type;
        if pdu_type == S7PduType::UserData {
            let (_, param) = UserDataParam::parse(&self.param, &self.param, &())?;
            let data = if self.data.is_empty() {
                None
            } else {
                parse_data_items(&self.data, &self.data, 1)?.pop()
            };
            return Ok(S7Body::UserData { param, data });
        }
        if pdu_type == S7PduType::Ack {
            return Ok(S7Body::Ack);
        }

        let function = self.function().ok_or(Error::ProtocolViolation {
            context: "empty parameter section",
        })?;
        let function = S7Function::try_from(function).map_err(|_| Error::UnsupportedFeature {
            feature: "S7 function code",
        })?;
        let is_request = pdu_type == S7PduType::Job;
        match function {
            S7Function::SetupCommunication => {
                let setup = SetupCommunication::parse(&self.param)?;
                Ok(if is_request {
                    S7Body::SetupRequest(setup)
                } else {
                    S7Body::SetupResponse(setup)
                })
            }
            S7Function::ReadVar | S7Function::WriteVar => {
                let count = *self.param.get(1).ok_or(Error::InsufficientData {
                    needed: 2,
                    available: self.param.len(),
                })? as usize;
                match (function, is_request) {
                    (S7Function::ReadVar, true) => {
                        let specs = self.parse_specs(count)?;
                        Ok(S7Body::ReadVarRequest(specs))
                    }
                    (S7Function::ReadVar, false) => Ok(S7Body::ReadVarResponse(
                        parse_data_items(&self.data, &self.data, count)?,
                    )),
                    (_, true) => {
                        let specs = self.parse_specs(count)?;
                        let items = parse_data_items(&self.data, &self.data, count)?;
                        let items = specs
                            .into_iter()
                            .zip(items)
                            .map(|(spec, item)| WriteItem {
                                spec,
                                data: item.data,
                            })
                            .collect();
                        Ok(S7Body::WriteVarRequest(items))
                    }
                    (_, false) => {
                        if self.data.len() != count {
                            return Err(Error::ProtocolViolation {
                                context: "write response return code count mismatch",
                            });
                        }
                        Ok(S7Body::WriteVarResponse(
                            self.data.iter().map(|b| S7ReturnCode::from(*b)).collect(),
                        ))
                    }
                }
            }
        }
    }

    fn parse_specs(&self, count: usize) -> Result<Vec<S7VarSpec>> {
        let (rest, specs) = parse_var_specs(&self.param[2..], &self.param, count)?;
        if !rest.is_empty() {
            return Err(Error::ProtocolViolation {
                context: "trailing bytes after var specs",
            });
        }
        Ok(specs)
    }
}

impl WireEncode for S7Pdu {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, ctx: &Self::Context) -> usize {
        self.header.encoded_len(ctx) + self.param.len() + self.data.len()
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, ctx: &Self::Context) -> Result<()> {
        if self.header.param_len as usize != self.param.len()
            || self.header.data_len as usize != self.data.len()
        {
            return Err(Error::Encode {
                context: "header lengths disagree with sections",
            });
        }
        self.header.encode_to(dst, ctx)?;
        dst.put_slice(&self.param);
        dst.put_slice(&self.data);
        Ok(())
    }
}

impl WireDecode for S7Pdu {
    type Error = Error;
    type Context = ();

    /// Parse one complete S7 PDU; the declared section lengths must cover the
    /// input exactly.
    fn parse<'a>(
        input: &'a [u8],
        parent: &Bytes,
        ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        let (rest, header) = S7Header::parse(input, parent, ctx)?;
        let param_len = header.param_len as usize;
        let data_len = header.data_len as usize;
        if rest.len() != param_len + data_len {
            return Err(Error::ProtocolViolation {
                context: "S7 section lengths disagree with frame size",
            });
        }
        let param = slice_from_parent(parent, &rest[..param_len]);
        let data = slice_from_parent(parent, &rest[param_len..]);
        Ok((
            &rest[rest.len()..],
            S7Pdu {
                header,
                param,
                data,
            },
        ))
    }
}

/// Setup-communication parameter: concurrency limits and PDU size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupCommunication {
    /// Outstanding jobs the calling side may have
    pub amq_calling: u16,
    /// Outstanding jobs the called side accepts
    pub amq_called: u16,
    pub pdu_size: u16,
}

impl SetupCommunication {
    const LEN: usize = 8;

    fn parse(param: &[u8]) -> Result<Self> {
        if param.len() != Self::LEN {
            return Err(Error::ProtocolViolation {
                context: "setup communication parameter length",
            });
        }
        Ok(Self {
            amq_calling: u16::from_be_bytes([param[2], param[3]]),
            amq_called: u16::from_be_bytes([param[4], param[5]]),
            pdu_size: u16::from_be_bytes([param[6], param[7]]),
        })
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(S7Function::SetupCommunication as u8);
        dst.put_u8(0x00);
        dst.put_u16(self.amq_calling);
        dst.put_u16(self.amq_called);
        dst.put_u16(self.pdu_size);
    }
}

/// Typed S7 PDU body, one variant per supported message shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S7Body {
    SetupRequest(SetupCommunication),
    SetupResponse(SetupCommunication),
    ReadVarRequest(Vec<S7VarSpec>),
    ReadVarResponse(Vec<DataItem>),
    WriteVarRequest(Vec<WriteItem>),
    WriteVarResponse(Vec<S7ReturnCode>),
    UserData {
        param: UserDataParam,
        data: Option<DataItem>,
    },
    /// Bare acknowledgement without parameters (usually carries a header error)
    Ack,
}

impl S7Body {
    pub fn pdu_type(&self) -> S7PduType {
        match self {
            S7Body::SetupRequest(_)
            | S7Body::ReadVarRequest(_)
            | S7Body::WriteVarRequest(_) => S7PduType::Job,
            S7Body::SetupResponse(_) | S7Body::ReadVarResponse(_) | S7Body::WriteVarResponse(_) => {
                S7PduType::AckData
            }
            S7Body::UserData { .. } => S7PduType::UserData,
            S7Body::Ack => S7PduType::Ack,
        }
    }

    /// Encode into a PDU with the given job reference
    pub fn to_pdu(&self, pdu_ref: u16) -> Result<S7Pdu> {
        let mut param = BytesMut::new();
        let mut data = BytesMut::new();
        match self {
            S7Body::SetupRequest(setup) | S7Body::SetupResponse(setup) => {
                setup.encode_to(&mut param);
            }
            S7Body::ReadVarRequest(specs) => {
                put_function_and_count(&mut param, S7Function::ReadVar, specs.len())?;
                param.reserve(specs.len() * VAR_SPEC_LEN);
                for spec in specs {
                    spec.encode_to(&mut param, &())?;
                }
            }
            S7Body::ReadVarResponse(items) => {
                put_function_and_count(&mut param, S7Function::ReadVar, items.len())?;
                data.reserve(data_items_len(items));
                encode_data_items(items, &mut data)?;
            }
            S7Body::WriteVarRequest(items) => {
                put_function_and_count(&mut param, S7Function::WriteVar, items.len())?;
                for item in items {
                    item.spec.encode_to(&mut param, &())?;
                }
                let data_items: Vec<DataItem> = items.iter().map(WriteItem::to_data_item).collect();
                encode_data_items(&data_items, &mut data)?;
            }
            S7Body::WriteVarResponse(codes) => {
                put_function_and_count(&mut param, S7Function::WriteVar, codes.len())?;
                for code in codes {
                    data.put_u8((*code).into());
                }
            }
            S7Body::UserData { param: p, data: d } => {
                p.encode_to(&mut param, &())?;
                if let Some(item) = d {
                    item.encode_to(&mut data, &true)?;
                }
            }
            S7Body::Ack => {}
        }
        S7Pdu::new(self.pdu_type(), pdu_ref, param.freeze(), data.freeze())
    }
}

fn put_function_and_count(dst: &mut BytesMut, function: S7Function, count: usize) -> Result<()> {
    let count = u8::try_from(count).map_err(|_| Error::Encode {
        context: "too many items in one PDU",
    })?;
    dst.put_u8(function as u8);
    dst.put_u8(count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        error::ErrorCode,
        frame::{
            types::{S7Area, S7DataVariableType, S7TransportSize},
            userdata::UserDataParam,
        },
    };

    fn roundtrip(body: S7Body) {
        let pdu = body.to_pdu(0x1234).unwrap();
        let raw = pdu.to_bytes().unwrap();
        let (rest, parsed) = S7Pdu::parse(&raw, &raw, &()).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, pdu);
        assert_eq!(parsed.pdu_ref(), 0x1234);
        assert_eq!(parsed.decode().unwrap(), body);
    }

    #[test]
    fn setup_communication_job_is_bit_exact() {
        let pdu = S7Body::SetupRequest(SetupCommunication {
            amq_calling: 1,
            amq_called: 1,
            pdu_size: 960,
        })
        .to_pdu(0x0400)
        .unwrap();
        assert_eq!(
            &pdu.to_bytes().unwrap()[..],
            &[
                0x32, 0x01, 0x00, 0x00, 0x04, 0x00, 0x00, 0x08, 0x00, 0x00, 0xF0, 0x00, 0x00,
                0x01, 0x00, 0x01, 0x03, 0xC0
            ]
        );
    }

    #[test]
    fn every_body_kind_survives_roundtrip() {
        let spec = S7VarSpec::new(S7Area::DB, 250, 0, S7TransportSize::Byte, 4);
        roundtrip(S7Body::SetupResponse(SetupCommunication {
            amq_calling: 2,
            amq_called: 3,
            pdu_size: 480,
        }));
        roundtrip(S7Body::ReadVarRequest(vec![spec, spec.sub_range(4, 1)]));
        roundtrip(S7Body::ReadVarResponse(vec![
            DataItem::ok(
                S7DataVariableType::ByteWordDWord,
                Bytes::from_static(&[1, 2, 3]),
            ),
            DataItem::failed(S7ReturnCode::ObjectDoesNotExist),
        ]));
        roundtrip(S7Body::WriteVarRequest(vec![WriteItem::bytes(
            S7Area::M,
            0,
            16,
            Bytes::from_static(&[0xAA]),
        )]));
        roundtrip(S7Body::WriteVarResponse(vec![
            S7ReturnCode::Success,
            S7ReturnCode::AccessDenied,
        ]));
        roundtrip(S7Body::UserData {
            param: UserDataParam::request(
                crate::protocol::frame::CpuFunctionGroup::TimeFunctions,
                0x01,
                0,
            ),
            data: Some(DataItem::failed(S7ReturnCode::ObjectDoesNotExist)),
        });
    }

    #[test]
    fn largest_read_response_for_pdu_size_roundtrips() {
        // 480-byte PDU: 12 header + 2 param + 4 item header leaves 462 data bytes
        let data = Bytes::from((0..462u32).map(|v| v as u8).collect::<Vec<_>>());
        let body = S7Body::ReadVarResponse(vec![DataItem::ok(
            S7DataVariableType::ByteWordDWord,
            data,
        )]);
        let pdu = body.to_pdu(7).unwrap();
        assert_eq!(pdu.encoded_len(&()), 480);
        roundtrip(body);
    }

    #[test]
    fn header_error_is_surfaced() {
        let mut pdu = S7Body::Ack.to_pdu(9).unwrap();
        assert!(pdu.check_header().is_ok());
        pdu.header.error = Some(ErrorCode::new(0x85, 0x00));
        assert!(matches!(
            pdu.check_header(),
            Err(Error::S7Error { code }) if code.word() == 0x8500
        ));
    }

    #[test]
    fn section_length_mismatch_is_rejected() {
        let pdu = S7Body::ReadVarRequest(vec![S7VarSpec::new(
            S7Area::I,
            0,
            0,
            S7TransportSize::Byte,
            1,
        )])
        .to_pdu(1)
        .unwrap();
        let raw = pdu.to_bytes().unwrap();
        let cut = raw.slice(..raw.len() - 1);
        assert!(S7Pdu::parse(&cut, &cut, &()).is_err());
    }

    #[test]
    fn write_response_count_mismatch_is_rejected() {
        let pdu = S7Pdu::new(
            S7PduType::AckData,
            1,
            Bytes::from_static(&[0x05, 0x02]),
            Bytes::from_static(&[0xFF]),
        )
        .unwrap();
        assert!(pdu.decode().is_err());
    }
}
