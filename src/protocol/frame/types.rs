use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// COTP TPDU type values (subset)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CotpType {
    /// Connection Request
    Cr = 0xE0,
    /// Connection Confirm
    Cc = 0xD0,
    /// Disconnection Request
    Dr = 0x80,
    /// Data
    Dt = 0xF0,
}

impl TryFrom<u8> for CotpType {
    type Error = ();

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0xE0 => Ok(CotpType::Cr),
            0xD0 => Ok(CotpType::Cc),
            0x80 => Ok(CotpType::Dr),
            0xF0 => Ok(CotpType::Dt),
            _ => Err(()),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7PduType {
    Job = 0x01,
    Ack = 0x02,
    AckData = 0x03,
    UserData = 0x07,
}

impl S7PduType {
    /// Ack and AckData carry the two extra error bytes in the header
    #[inline]
    pub fn has_error_field(self) -> bool {
        matches!(self, S7PduType::Ack | S7PduType::AckData)
    }
}

impl TryFrom<u8> for S7PduType {
    type Error = ();
    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0x01 => Ok(S7PduType::Job),
            0x02 => Ok(S7PduType::Ack),
            0x03 => Ok(S7PduType::AckData),
            0x07 => Ok(S7PduType::UserData),
            _ => Err(()),
        }
    }
}

/// S7 Function codes used by Job/AckData parameters
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7Function {
    ReadVar = 0x04,
    WriteVar = 0x05,
    SetupCommunication = 0xF0,
}

impl TryFrom<u8> for S7Function {
    type Error = ();

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0x04 => Ok(S7Function::ReadVar),
            0x05 => Ok(S7Function::WriteVar),
            0xF0 => Ok(S7Function::SetupCommunication),
            _ => Err(()),
        }
    }
}

/// S7 Memory/Area codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum S7Area {
    /// Direct peripheral access
    DP = 0x80,
    /// Inputs
    I = 0x81,
    /// Outputs
    O = 0x82,
    /// Merkers
    M = 0x83,
    /// Data Blocks (DB)
    DB = 0x84,
    /// Instance data blocks
    DI = 0x85,
    /// Local data
    L = 0x86,
    V = 0x87,
    /// Counters
    C = 0x1C,
    /// Timers
    T = 0x1D,
}

impl S7Area {
    /// Only data blocks carry a meaningful DB number
    #[inline]
    pub fn uses_db_number(self) -> bool {
        matches!(self, S7Area::DB | S7Area::DI)
    }
}

impl TryFrom<u8> for S7Area {
    type Error = ();
    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0x80 => Ok(S7Area::DP),
            0x81 => Ok(S7Area::I),
            0x82 => Ok(S7Area::O),
            0x83 => Ok(S7Area::M),
            0x84 => Ok(S7Area::DB),
            0x85 => Ok(S7Area::DI),
            0x86 => Ok(S7Area::L),
            0x87 => Ok(S7Area::V),
            0x1C => Ok(S7Area::C),
            0x1D => Ok(S7Area::T),
            _ => Err(()),
        }
    }
}

/// Transport size codes used in var specs
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum S7TransportSize {
    Bit = 0x01,
    Byte = 0x02,
    Char = 0x03,
    Word = 0x04,
    Int = 0x05,
    DWord = 0x06,
    DInt = 0x07,
    Real = 0x08,
    Date = 0x09,
    TimeOfDay = 0x0A,
    Time = 0x0B,
    S5Time = 0x0C,
    DateTime = 0x0F,
    Counter = 0x1C,
    Timer = 0x1D,
}

impl TryFrom<u8> for S7TransportSize {
    type Error = ();
    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        use S7TransportSize::*;
        Ok(match v {
            0x01 => Bit,
            0x02 => Byte,
            0x03 => Char,
            0x04 => Word,
            0x05 => Int,
            0x06 => DWord,
            0x07 => DInt,
            0x08 => Real,
            0x09 => Date,
            0x0A => TimeOfDay,
            0x0B => Time,
            0x0C => S5Time,
            0x0F => DateTime,
            0x1C => Counter,
            0x1D => Timer,
            _ => Err(())?,
        })
    }
}

impl S7TransportSize {
    /// Bytes per element on the wire. Bit is one byte.
    #[inline]
    pub fn element_bytes(self) -> usize {
        match self {
            S7TransportSize::Bit | S7TransportSize::Byte | S7TransportSize::Char => 1,
            S7TransportSize::Word
            | S7TransportSize::Int
            | S7TransportSize::Date
            | S7TransportSize::S5Time
            | S7TransportSize::Counter
            | S7TransportSize::Timer => 2,
            S7TransportSize::DWord
            | S7TransportSize::DInt
            | S7TransportSize::Real
            | S7TransportSize::TimeOfDay
            | S7TransportSize::Time => 4,
            S7TransportSize::DateTime => 8,
        }
    }

    /// Variable type used when this transport size travels in a write data item
    pub fn data_variable_type(self) -> S7DataVariableType {
        match self {
            S7TransportSize::Bit => S7DataVariableType::Bit,
            S7TransportSize::Int | S7TransportSize::Counter | S7TransportSize::Timer => {
                S7DataVariableType::Integer
            }
            S7TransportSize::DInt => S7DataVariableType::DInteger,
            S7TransportSize::Real => S7DataVariableType::Real,
            S7TransportSize::Char | S7TransportSize::DateTime => S7DataVariableType::OctetString,
            _ => S7DataVariableType::ByteWordDWord,
        }
    }
}

/// Per-item return code carried in read/write responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7ReturnCode {
    Reserved,
    Success,
    HardwareFault,
    AccessDenied,
    AddressOutOfRange,
    DataTypeNotSupported,
    DataTypeInconsistent,
    ObjectDoesNotExist,
    ObjectNotAvailable,
    Unknown(u8),
}

impl S7ReturnCode {
    #[inline]
    pub fn is_success(self) -> bool {
        self == S7ReturnCode::Success
    }
}

impl From<u8> for S7ReturnCode {
    fn from(v: u8) -> Self {
        match v {
            0x00 => S7ReturnCode::Reserved,
            0xFF => S7ReturnCode::Success,
            0x01 => S7ReturnCode::HardwareFault,
            0x03 => S7ReturnCode::AccessDenied,
            0x05 => S7ReturnCode::AddressOutOfRange,
            0x06 => S7ReturnCode::DataTypeNotSupported,
            0x07 => S7ReturnCode::DataTypeInconsistent,
            0x0A => S7ReturnCode::ObjectDoesNotExist,
            0x0B => S7ReturnCode::ObjectNotAvailable,
            other => S7ReturnCode::Unknown(other),
        }
    }
}

impl From<S7ReturnCode> for u8 {
    fn from(value: S7ReturnCode) -> Self {
        match value {
            S7ReturnCode::Reserved => 0x00,
            S7ReturnCode::Success => 0xFF,
            S7ReturnCode::HardwareFault => 0x01,
            S7ReturnCode::AccessDenied => 0x03,
            S7ReturnCode::AddressOutOfRange => 0x05,
            S7ReturnCode::DataTypeNotSupported => 0x06,
            S7ReturnCode::DataTypeInconsistent => 0x07,
            S7ReturnCode::ObjectDoesNotExist => 0x0A,
            S7ReturnCode::ObjectNotAvailable => 0x0B,
            S7ReturnCode::Unknown(v) => v,
        }
    }
}

/// Data variable type of a data item; decides how the length field is read
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7DataVariableType {
    /// No data
    Null = 0x00,
    /// Length field semantics: bytes
    Bit = 0x03,
    /// Length field semantics: bits
    ByteWordDWord = 0x04,
    /// Length field semantics: bits
    Integer = 0x05,
    /// Length field semantics: bytes
    DInteger = 0x06,
    /// Length field semantics: bytes
    Real = 0x07,
    /// Length field semantics: bytes
    OctetString = 0x09,
}

impl S7DataVariableType {
    /// Whether the item length field counts bits instead of bytes
    #[inline]
    pub fn length_in_bits(self) -> bool {
        matches!(
            self,
            S7DataVariableType::ByteWordDWord | S7DataVariableType::Integer
        )
    }
}

impl TryFrom<u8> for S7DataVariableType {
    type Error = ();
    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match v {
            0x00 => S7DataVariableType::Null,
            0x03 => S7DataVariableType::Bit,
            0x04 => S7DataVariableType::ByteWordDWord,
            0x05 => S7DataVariableType::Integer,
            0x06 => S7DataVariableType::DInteger,
            0x07 => S7DataVariableType::Real,
            0x09 => S7DataVariableType::OctetString,
            _ => Err(())?,
        })
    }
}

/// User-data function group (low nibble of the type/group byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFunctionGroup {
    ModeTransition = 0x00,
    ProgrammerCommands = 0x01,
    CyclicServices = 0x02,
    BlockFunctions = 0x03,
    CpuFunctions = 0x04,
    SecurityFunctions = 0x05,
    TimeFunctions = 0x07,
}

impl TryFrom<u8> for CpuFunctionGroup {
    type Error = ();
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(CpuFunctionGroup::ModeTransition),
            0x01 => Ok(CpuFunctionGroup::ProgrammerCommands),
            0x02 => Ok(CpuFunctionGroup::CyclicServices),
            0x03 => Ok(CpuFunctionGroup::BlockFunctions),
            0x04 => Ok(CpuFunctionGroup::CpuFunctions),
            0x05 => Ok(CpuFunctionGroup::SecurityFunctions),
            0x07 => Ok(CpuFunctionGroup::TimeFunctions),
            _ => Err(()),
        }
    }
}

/// User-data function type (high nibble of the type/group byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFunctionType {
    IndicationPush = 0x00,
    Request = 0x04,
    Response = 0x08,
}

impl TryFrom<u8> for CpuFunctionType {
    type Error = ();
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(CpuFunctionType::IndicationPush),
            0x04 => Ok(CpuFunctionType::Request),
            0x08 => Ok(CpuFunctionType::Response),
            _ => Err(()),
        }
    }
}

/// PLC block types as encoded (ASCII) in block-info requests
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    OB = 0x38,
    DB = 0x41,
    SDB = 0x42,
    FC = 0x43,
    SFC = 0x44,
    FB = 0x45,
    SFB = 0x46,
}

impl TryFrom<u8> for BlockType {
    type Error = ();
    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0x38 => Ok(BlockType::OB),
            0x41 => Ok(BlockType::DB),
            0x42 => Ok(BlockType::SDB),
            0x43 => Ok(BlockType::FC),
            0x44 => Ok(BlockType::SFC),
            0x45 => Ok(BlockType::FB),
            0x46 => Ok(BlockType::SFB),
            _ => Err(()),
        }
    }
}

/// Convert one BCD-encoded byte to decimal 0..=99
pub(crate) fn bcd_to_dec(b: u8) -> u8 {
    ((b >> 4) & 0x0F) * 10 + (b & 0x0F)
}

/// Convert decimal 0..=99 to one BCD byte
pub(crate) fn dec_to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// Decode 8-byte S7 DATE_AND_TIME (BCD) into `NaiveDateTime`.
///
/// Byte 6 carries the two leading millisecond digits, the high nibble of
/// byte 7 the last one; the low nibble of byte 7 is the weekday.
pub(crate) fn decode_datetime8(bytes: &[u8]) -> Option<NaiveDateTime> {
    if bytes.len() < 8 {
        return None;
    }
    let yy = bcd_to_dec(bytes[0]) as i32;
    let year = if yy < 90 { 2000 + yy } else { 1900 + yy };
    let month = bcd_to_dec(bytes[1]) as u32;
    let day = bcd_to_dec(bytes[2]) as u32;
    let hour = bcd_to_dec(bytes[3]) as u32;
    let minute = bcd_to_dec(bytes[4]) as u32;
    let second = bcd_to_dec(bytes[5]) as u32;
    let millis = bcd_to_dec(bytes[6]) as u32 * 10 + ((bytes[7] >> 4) & 0x0F) as u32;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_milli_opt(hour, minute, second, millis)
}

/// Encode `NaiveDateTime` as 8-byte S7 DATE_AND_TIME (BCD)
pub(crate) fn encode_datetime8(dt: &NaiveDateTime) -> [u8; 8] {
    use chrono::{Datelike, Timelike};
    let millis = (dt.nanosecond() / 1_000_000).min(999);
    let weekday = dt.weekday().number_from_sunday() as u8;
    [
        dec_to_bcd((dt.year() % 100) as u8),
        dec_to_bcd(dt.month() as u8),
        dec_to_bcd(dt.day() as u8),
        dec_to_bcd(dt.hour() as u8),
        dec_to_bcd(dt.minute() as u8),
        dec_to_bcd(dt.second() as u8),
        dec_to_bcd((millis / 10) as u8),
        (((millis % 10) as u8) << 4) | weekday,
    ]
}

/// Decode the 6-byte block timestamp: milliseconds since midnight (u32) and
/// days since 1984-01-01 (u16), both big-endian.
pub(crate) fn decode_block_timestamp(bytes: &[u8]) -> Option<NaiveDateTime> {
    if bytes.len() < 6 {
        return None;
    }
    let millis = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let days = u16::from_be_bytes([bytes[4], bytes[5]]);
    let base = NaiveDate::from_ymd_opt(1984, 1, 1)?.and_hms_opt(0, 0, 0)?;
    base.checked_add_signed(Duration::days(days as i64))?
        .checked_add_signed(Duration::milliseconds(millis as i64))
}
