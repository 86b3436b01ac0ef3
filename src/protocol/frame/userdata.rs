//! User-data services: block info, pending alarms and the CPU clock.
//!
//! Parameter layout (after the 3-byte head `00 01 12`):
//! - request:  `len=4, method=0x11, type|group, subfunction, sequence`
//! - response: `len=8, method=0x12, type|group, subfunction, sequence,
//!   data-unit-ref, last-data-unit, error(u16)`
//!
//! Continuation requests reuse the long form with method `0x12`.

use super::{
    super::error::{Error, ErrorCode, Result},
    item::DataItem,
    pdu::S7Body,
    types::{
        decode_block_timestamp, decode_datetime8, BlockType, CpuFunctionGroup, CpuFunctionType,
        S7DataVariableType, S7ReturnCode,
    },
    WireDecode, WireEncode,
};
use bytes::{BufMut, Bytes};
use chrono::NaiveDateTime;
use nom::number::complete::{be_u16, be_u32, u8 as nom_u8};

const PARAM_HEAD: [u8; 3] = [0x00, 0x01, 0x12];
const METHOD_REQUEST: u8 = 0x11;
const METHOD_RESPONSE: u8 = 0x12;

/// Subfunction: block info (group block functions)
pub const SUBFUNC_BLOCK_INFO: u8 = 0x03;
/// Subfunction: alarm query (group CPU functions)
pub const SUBFUNC_ALARM_QUERY: u8 = 0x13;
/// Subfunction: read clock (group time functions)
pub const SUBFUNC_READ_CLOCK: u8 = 0x01;

type NomError<'a> = nom::error::Error<&'a [u8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDataParam {
    /// 0x11 short request form, 0x12 long form (responses and continuations)
    pub method: u8,
    pub function_type: CpuFunctionType,
    pub group: CpuFunctionGroup,
    pub subfunction: u8,
    pub sequence_number: u8,
    pub data_unit_ref: u8,
    /// False while the peer has more data units for this request
    pub last_data_unit: bool,
    pub error: u16,
}

impl UserDataParam {
    /// Short-form request
    pub fn request(group: CpuFunctionGroup, subfunction: u8, sequence_number: u8) -> Self {
        Self {
            method: METHOD_REQUEST,
            function_type: CpuFunctionType::Request,
            group,
            subfunction,
            sequence_number,
            data_unit_ref: 0,
            last_data_unit: true,
            error: 0,
        }
    }

    /// Long-form request asking for the next data unit of `sequence_number`
    pub fn continuation(group: CpuFunctionGroup, subfunction: u8, sequence_number: u8) -> Self {
        Self {
            method: METHOD_RESPONSE,
            ..Self::request(group, subfunction, sequence_number)
        }
    }

    /// Long-form response
    pub fn response(
        group: CpuFunctionGroup,
        subfunction: u8,
        sequence_number: u8,
        last_data_unit: bool,
    ) -> Self {
        Self {
            method: METHOD_RESPONSE,
            function_type: CpuFunctionType::Response,
            last_data_unit,
            ..Self::request(group, subfunction, sequence_number)
        }
    }

    #[inline]
    fn is_long(&self) -> bool {
        self.method == METHOD_RESPONSE
    }

    /// Fail with the error word carried by a response parameter
    pub fn check_error(&self) -> Result<()> {
        if self.error == 0 {
            Ok(())
        } else {
            Err(Error::S7Error {
                code: ErrorCode::from_word(self.error),
            })
        }
    }
}

impl WireEncode for UserDataParam {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        if self.is_long() {
            12
        } else {
            8
        }
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        dst.put_slice(&PARAM_HEAD);
        dst.put_u8(if self.is_long() { 8 } else { 4 });
        dst.put_u8(self.method);
        dst.put_u8(((self.function_type as u8) << 4) | (self.group as u8 & 0x0F));
        dst.put_u8(self.subfunction);
        dst.put_u8(self.sequence_number);
        if self.is_long() {
            dst.put_u8(self.data_unit_ref);
            dst.put_u8(if self.last_data_unit { 0x00 } else { 0x01 });
            dst.put_u16(self.error);
        }
        Ok(())
    }
}

impl WireDecode for UserDataParam {
    type Error = Error;
    type Context = ();

    fn parse<'a>(
        input: &'a [u8],
        _parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        if input.len() < 8 || input[..3] != PARAM_HEAD {
            return Err(Error::ProtocolViolation {
                context: "user-data parameter head",
            });
        }
        let len = input[3] as usize;
        if input.len() != 4 + len || (len != 4 && len != 8) {
            return Err(Error::ProtocolViolation {
                context: "user-data parameter length",
            });
        }
        let method = input[4];
        let function_type = CpuFunctionType::try_from(input[5] >> 4).map_err(|_| Error::Decode {
            context: "user-data function type",
        })?;
        let group = CpuFunctionGroup::try_from(input[5] & 0x0F).map_err(|_| Error::Decode {
            context: "user-data function group",
        })?;
        let mut param = UserDataParam {
            method,
            function_type,
            group,
            subfunction: input[6],
            sequence_number: input[7],
            data_unit_ref: 0,
            last_data_unit: true,
            error: 0,
        };
        if len == 8 {
            param.data_unit_ref = input[8];
            param.last_data_unit = input[9] == 0x00;
            param.error = u16::from_be_bytes([input[10], input[11]]);
        }
        Ok((&input[input.len()..], param))
    }
}

/// Request data for the block info service: `30 <type> <5 ASCII digits> 41`
pub fn block_info_request(block_type: BlockType, number: u16) -> S7Body {
    let mut payload = Vec::with_capacity(8);
    payload.push(0x30);
    payload.push(block_type as u8);
    payload.extend_from_slice(format!("{number:05}").as_bytes());
    payload.push(0x41);
    S7Body::UserData {
        param: UserDataParam::request(CpuFunctionGroup::BlockFunctions, SUBFUNC_BLOCK_INFO, 0),
        data: Some(DataItem::ok(
            S7DataVariableType::OctetString,
            Bytes::from(payload),
        )),
    }
}

/// Query for all pending ALARM_S messages
pub fn alarm_query_request() -> S7Body {
    const QUERY: [u8; 12] = [
        0x00, 0x01, 0x12, 0x08, 0x1A, 0x00, 0x01, 0x34, 0x00, 0x00, 0x00, 0x04,
    ];
    S7Body::UserData {
        param: UserDataParam::request(CpuFunctionGroup::CpuFunctions, SUBFUNC_ALARM_QUERY, 0),
        data: Some(DataItem::ok(
            S7DataVariableType::OctetString,
            Bytes::from_static(&QUERY),
        )),
    }
}

pub fn read_clock_request() -> S7Body {
    S7Body::UserData {
        param: UserDataParam::request(CpuFunctionGroup::TimeFunctions, SUBFUNC_READ_CLOCK, 0),
        data: Some(DataItem::failed(S7ReturnCode::ObjectDoesNotExist)),
    }
}

/// Ask for the next data unit of a multi-PDU user-data response
pub fn continuation_request(param: &UserDataParam) -> S7Body {
    S7Body::UserData {
        param: UserDataParam::continuation(param.group, param.subfunction, param.sequence_number),
        data: Some(DataItem::failed(S7ReturnCode::ObjectDoesNotExist)),
    }
}

/// Numeric block metadata. Author/family/header names are kept raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Sub block type code as reported by the PLC (0x08 OB, 0x0A DB, 0x0C FC ...)
    pub sub_block_type: u8,
    pub number: u16,
    pub language: u8,
    pub flags: u8,
    /// Size in load memory
    pub load_size: u32,
    pub code_timestamp: Option<NaiveDateTime>,
    pub interface_timestamp: Option<NaiveDateTime>,
    pub sbb_length: u16,
    pub add_length: u16,
    pub local_data: u16,
    pub mc7_size: u16,
    pub author: Bytes,
    pub family: Bytes,
    pub header: Bytes,
    /// High nibble major, low nibble minor
    pub version: u8,
    pub checksum: u16,
}

impl BlockInfo {
    const MIN_LEN: usize = 70;

    pub fn parse(data: &Bytes) -> Result<Self> {
        if data.len() < Self::MIN_LEN {
            return Err(Error::InsufficientData {
                needed: Self::MIN_LEN,
                available: data.len(),
            });
        }
        let be16 = |at: usize| u16::from_be_bytes([data[at], data[at + 1]]);
        Ok(BlockInfo {
            flags: data[9],
            language: data[10],
            sub_block_type: data[11],
            number: be16(12),
            load_size: u32::from_be_bytes([data[14], data[15], data[16], data[17]]),
            code_timestamp: decode_block_timestamp(&data[22..28]),
            interface_timestamp: decode_block_timestamp(&data[28..34]),
            sbb_length: be16(34),
            add_length: be16(36),
            local_data: be16(38),
            mc7_size: be16(40),
            author: data.slice(42..50),
            family: data.slice(50..58),
            header: data.slice(58..66),
            version: data[66],
            checksum: be16(68),
        })
    }
}

/// Timestamp and associated values of one alarm transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmTransition {
    pub timestamp: Option<NaiveDateTime>,
    pub values: Vec<DataItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub alarm_type: u8,
    pub event_id: u32,
    pub event_state: u8,
    pub ack_state_going: u8,
    pub ack_state_coming: u8,
    pub coming: AlarmTransition,
    pub going: Option<AlarmTransition>,
}

/// Decode the concatenated data of an alarm query response.
///
/// Objects are back to back; each starts with its own length byte, which is
/// authoritative for locating the next object.
pub fn parse_alarms(data: &Bytes) -> Result<Vec<Alarm>> {
    let mut alarms = Vec::new();
    let mut rest: &[u8] = data;
    while !rest.is_empty() {
        let len = rest[0] as usize;
        if rest.len() < 1 + len {
            return Err(Error::InsufficientData {
                needed: 1 + len,
                available: rest.len(),
            });
        }
        let object = &rest[1..1 + len];
        alarms.push(parse_alarm_object(object, data)?);
        rest = &rest[1 + len..];
    }
    Ok(alarms)
}

fn parse_alarm_object(input: &[u8], parent: &Bytes) -> Result<Alarm> {
    let err = |_| Error::Decode {
        context: "alarm object",
    };
    let (i, _) = be_u16::<_, NomError>(input).map_err(err)?;
    let (i, alarm_type) = nom_u8::<_, NomError>(i).map_err(err)?;
    let (i, event_id) = be_u32::<_, NomError>(i).map_err(err)?;
    let (i, _) = nom_u8::<_, NomError>(i).map_err(err)?;
    let (i, event_state) = nom_u8::<_, NomError>(i).map_err(err)?;
    let (i, ack_state_going) = nom_u8::<_, NomError>(i).map_err(err)?;
    let (i, ack_state_coming) = nom_u8::<_, NomError>(i).map_err(err)?;
    let (i, coming) = parse_transition(i, parent)?;
    let going = if i.is_empty() {
        None
    } else {
        let (rest, going) = parse_transition(i, parent)?;
        if !rest.is_empty() {
            return Err(Error::ProtocolViolation {
                context: "trailing bytes in alarm object",
            });
        }
        Some(going)
    };
    Ok(Alarm {
        alarm_type,
        event_id,
        event_state,
        ack_state_going,
        ack_state_coming,
        coming,
        going,
    })
}

/// 8-byte BCD timestamp, value count, then that many data items
fn parse_transition<'a>(input: &'a [u8], parent: &Bytes) -> Result<(&'a [u8], AlarmTransition)> {
    if input.len() < 9 {
        return Err(Error::InsufficientData {
            needed: 9,
            available: input.len(),
        });
    }
    let timestamp = decode_datetime8(&input[..8]);
    let count = input[8] as usize;
    let mut rest = &input[9..];
    let mut values = Vec::with_capacity(count);
    for idx in 0..count {
        let (next, item) = DataItem::parse(rest, parent, &(idx + 1 == count))?;
        values.push(item);
        rest = next;
    }
    Ok((rest, AlarmTransition { timestamp, values }))
}

/// Decode the read-clock response data: reserved byte, century byte, DATE_AND_TIME
pub fn parse_clock(data: &[u8]) -> Result<NaiveDateTime> {
    if data.len() < 10 {
        return Err(Error::InsufficientData {
            needed: 10,
            available: data.len(),
        });
    }
    decode_datetime8(&data[2..10]).ok_or(Error::Decode {
        context: "clock value",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{item::encode_data_items, pdu::S7Pdu};
    use bytes::BytesMut;

    #[test]
    fn block_info_request_is_bit_exact() {
        let pdu = block_info_request(BlockType::DB, 1).to_pdu(0x0500).unwrap();
        assert_eq!(&pdu.param[..], &[0x00, 0x01, 0x12, 0x04, 0x11, 0x43, 0x03, 0x00]);
        assert_eq!(
            &pdu.data[..],
            &[0xFF, 0x09, 0x00, 0x08, 0x30, 0x41, 0x30, 0x30, 0x30, 0x30, 0x31, 0x41]
        );
    }

    #[test]
    fn alarm_query_request_is_bit_exact() {
        let pdu = alarm_query_request().to_pdu(1).unwrap();
        assert_eq!(&pdu.param[..], &[0x00, 0x01, 0x12, 0x04, 0x11, 0x44, 0x13, 0x00]);
        assert_eq!(&pdu.data[..4], &[0xFF, 0x09, 0x00, 0x0C]);
    }

    #[test]
    fn response_param_carries_follow_flag_and_error() {
        let param = UserDataParam {
            data_unit_ref: 3,
            error: 0xD209,
            ..UserDataParam::response(CpuFunctionGroup::CpuFunctions, 0x13, 5, false)
        };
        let mut buf = BytesMut::new();
        param.encode_to(&mut buf, &()).unwrap();
        assert_eq!(
            &buf[..],
            &[0x00, 0x01, 0x12, 0x08, 0x12, 0x84, 0x13, 0x05, 0x03, 0x01, 0xD2, 0x09]
        );
        let (_, back) = UserDataParam::parse(&buf, &Bytes::new(), &()).unwrap();
        assert_eq!(back, param);
        assert!(!back.last_data_unit);
        assert!(back.check_error().is_err());

        let next = continuation_request(&back).to_pdu(2).unwrap();
        assert_eq!(
            &next.param[..],
            &[0x00, 0x01, 0x12, 0x08, 0x12, 0x44, 0x13, 0x05, 0x00, 0x00, 0x00, 0x00]
        );
        assert!(S7Pdu::decode(&next).is_ok());
    }

    #[test]
    fn block_info_fields_at_fixed_offsets() {
        let mut raw = vec![0u8; 78];
        raw[9] = 0x01;
        raw[10] = 0x05;
        raw[11] = 0x0A;
        raw[12..14].copy_from_slice(&250u16.to_be_bytes());
        raw[14..18].copy_from_slice(&1234u32.to_be_bytes());
        raw[22..28].copy_from_slice(&[0, 0, 0, 0, 0, 1]);
        raw[38..40].copy_from_slice(&20u16.to_be_bytes());
        raw[40..42].copy_from_slice(&1000u16.to_be_bytes());
        raw[42..50].copy_from_slice(b"AUTHOR\0\0");
        raw[66] = 0x12;
        raw[68..70].copy_from_slice(&0xBEEFu16.to_be_bytes());
        let info = BlockInfo::parse(&Bytes::from(raw)).unwrap();
        assert_eq!(info.number, 250);
        assert_eq!(info.sub_block_type, 0x0A);
        assert_eq!(info.load_size, 1234);
        assert_eq!(info.local_data, 20);
        assert_eq!(info.mc7_size, 1000);
        assert_eq!(&info.author[..6], b"AUTHOR");
        assert_eq!(info.version, 0x12);
        assert_eq!(info.checksum, 0xBEEF);
        assert_eq!(
            info.code_timestamp.unwrap().to_string(),
            "1984-01-02 00:00:00"
        );
        assert!(BlockInfo::parse(&Bytes::from_static(&[0u8; 40])).is_err());
    }

    fn alarm_object(event_id: u32, with_going: bool) -> Vec<u8> {
        let mut body = vec![0x00, 0x00, 0x34];
        body.extend_from_slice(&event_id.to_be_bytes());
        body.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        body.extend_from_slice(&[0x24, 0x03, 0x15, 0x10, 0x20, 0x30, 0x00, 0x06]);
        body.push(1);
        let mut values = BytesMut::new();
        encode_data_items(
            &[DataItem::ok(
                S7DataVariableType::OctetString,
                Bytes::from_static(&[0xAB, 0xCD]),
            )],
            &mut values,
        )
        .unwrap();
        body.extend_from_slice(&values);
        if with_going {
            body.extend_from_slice(&[0x24, 0x03, 0x15, 0x11, 0x00, 0x00, 0x00, 0x06]);
            body.push(0);
        }
        let mut object = vec![body.len() as u8];
        object.extend(body);
        object
    }

    #[test]
    fn alarms_are_located_by_their_length_byte() {
        let mut raw = alarm_object(0x0001_0002, false);
        raw.extend(alarm_object(0x0003_0004, true));
        let alarms = parse_alarms(&Bytes::from(raw)).unwrap();
        assert_eq!(alarms.len(), 2);
        assert_eq!(alarms[0].event_id, 0x0001_0002);
        assert!(alarms[0].going.is_none());
        assert_eq!(&alarms[0].coming.values[0].data[..], &[0xAB, 0xCD]);
        let going = alarms[1].going.as_ref().unwrap();
        assert_eq!(going.timestamp.unwrap().to_string(), "2024-03-15 11:00:00");
        assert!(going.values.is_empty());
    }

    #[test]
    fn truncated_alarm_list_is_an_error() {
        let mut raw = alarm_object(1, false);
        raw.truncate(raw.len() - 3);
        assert!(parse_alarms(&Bytes::from(raw)).is_err());
        assert!(parse_alarms(&Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn clock_response() {
        let raw = [0x00, 0x20, 0x24, 0x03, 0x15, 0x10, 0x20, 0x30, 0x12, 0x36];
        let dt = parse_clock(&raw).unwrap();
        assert_eq!(dt.to_string(), "2024-03-15 10:20:30.123");
    }
}
