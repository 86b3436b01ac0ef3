use super::frame::S7ReturnCode;
use std::{fmt, result::Result as StdResult};
use thiserror::Error as ThisError;

/// Unified S7 result type
pub type Result<T> = StdResult<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timeout")]
    ErrConnectTimeout,

    #[error("request timeout")]
    ErrRequestTimeout,

    #[error("invalid frame")]
    ErrInvalidFrame,

    #[error("unexpected PDU or function")]
    ErrUnexpectedPdu,

    #[error("invalid parameter")]
    ErrInvalidParam,

    /// Operation attempted while the connection is not `Ready`, or the
    /// connection dropped while the job was pending.
    #[error("not connected")]
    ErrNotConnected,

    #[error("invalid configuration for: {0}")]
    InvalidConfiguration(&'static str),

    /// Decode error for wire-format parsing failures that are not protocol violations but malformed/invalid bytes
    #[error("decode error: {context}")]
    Decode { context: &'static str },

    /// Encode error for wire-format serialization failures
    #[error("encode error: {context}")]
    Encode { context: &'static str },

    /// Protocol contract violated (e.g., reserved/invalid field values)
    #[error("protocol violation: {context}")]
    ProtocolViolation { context: &'static str },

    /// COTP connection establishment rejected or violated by the peer
    #[error("handshake rejected: {context}")]
    HandshakeRejected { context: &'static str },

    /// Input does not have enough bytes to complete the operation
    #[error("insufficient data: needed {needed} bytes, available {available} bytes")]
    InsufficientData { needed: usize, available: usize },

    /// Feature or PDU type is recognized but not supported by this implementation
    #[error("unsupported feature: {feature}")]
    UnsupportedFeature { feature: &'static str },

    /// S7 Ack/AckData header-level error.
    ///
    /// Returned when the PLC answers with a non-zero error class in the
    /// Ack/AckData header, or a non-zero error code in a user-data parameter.
    #[allow(clippy::enum_variant_names)]
    #[error("S7 error: {code}")]
    S7Error { code: ErrorCode },

    /// The single data item of a user-data reply carried a failure code
    #[error("item rejected by PLC: {code:?}")]
    ItemRejected { code: S7ReturnCode },

    #[error("Rack value {0} is out of range (0..=7)")]
    InvalidRack(u8),

    #[error("Slot value {0} is out of range (0..=31)")]
    InvalidSlot(u8),
}

impl Error {
    /// Whether the error means the connection itself is gone.
    ///
    /// Transport errors trigger the reconnect policy; everything else is
    /// scoped to a single job.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ErrConnectTimeout
                | Error::ErrNotConnected
                | Error::HandshakeRejected { .. }
        )
    }
}

/// Error class carried in the Ack/AckData header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NoError,
    ApplicationRelationship,
    ObjectDefinition,
    NoResourcesAvailable,
    ErrorOnServiceProcessing,
    ErrorOnSupplies,
    AccessError,
    Unknown(u8),
}

impl From<u8> for ErrorClass {
    fn from(v: u8) -> Self {
        match v {
            0x00 => ErrorClass::NoError,
            0x81 => ErrorClass::ApplicationRelationship,
            0x82 => ErrorClass::ObjectDefinition,
            0x83 => ErrorClass::NoResourcesAvailable,
            0x84 => ErrorClass::ErrorOnServiceProcessing,
            0x85 => ErrorClass::ErrorOnSupplies,
            0x87 => ErrorClass::AccessError,
            other => ErrorClass::Unknown(other),
        }
    }
}

impl From<ErrorClass> for u8 {
    fn from(v: ErrorClass) -> Self {
        match v {
            ErrorClass::NoError => 0x00,
            ErrorClass::ApplicationRelationship => 0x81,
            ErrorClass::ObjectDefinition => 0x82,
            ErrorClass::NoResourcesAvailable => 0x83,
            ErrorClass::ErrorOnServiceProcessing => 0x84,
            ErrorClass::ErrorOnSupplies => 0x85,
            ErrorClass::AccessError => 0x87,
            ErrorClass::Unknown(other) => other,
        }
    }
}

/// Combined header error word (`class << 8 | code`).
///
/// The well-known words are exposed through [`ErrorCode::describe`]; unknown
/// words are kept verbatim so callers can still match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    pub class: ErrorClass,
    pub code: u8,
}

impl ErrorCode {
    pub fn new(class: u8, code: u8) -> Self {
        Self {
            class: class.into(),
            code,
        }
    }

    /// Build from a 16-bit word as found in user-data parameters
    pub fn from_word(word: u16) -> Self {
        Self::new((word >> 8) as u8, (word & 0xFF) as u8)
    }

    pub fn word(&self) -> u16 {
        ((u8::from(self.class) as u16) << 8) | self.code as u16
    }

    pub fn is_success(&self) -> bool {
        self.word() == 0
    }

    pub fn describe(&self) -> &'static str {
        match self.word() {
            0x0000 => "success",
            0x0110 => "invalid block number",
            0x0111 => "invalid request length",
            0x0112 => "invalid parameter",
            0x0113 => "invalid block type",
            0x0114 => "block not found",
            0x0115 => "block already exists",
            0x0116 => "block is write-protected",
            0x011C => "protocol error",
            0x0140 => "insufficient memory",
            0x0141 => "job not processed",
            0x8001 => "service not allowed in current block state",
            0x8104 => "service not implemented or frame error",
            0x8204 => "object type mismatch",
            0x8301 => "memory or storage unavailable",
            0x8302 => "resources insufficient or CPU busy",
            0x8304 => "parallel upload not possible",
            0x8305 => "function unavailable",
            0x8401 => "invalid service sequence",
            0x8500 => "wrong PDU size",
            0x8702 => "address invalid",
            0xD209 => "block not found",
            0xD241 => "function protected by password",
            0xD602 => "information function unavailable",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} ({})", self.word(), self.describe())
    }
}
