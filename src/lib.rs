//! Asynchronous Siemens S7comm client over RFC1006 (ISO-on-TCP).
//!
//! [`S7Client`] connects to a PLC, negotiates the S7 PDU size and job window,
//! and exposes variable reads and writes, block info, pending alarms and the
//! PLC clock. Requests larger than one PDU are split transparently. A
//! blocking variant lives in [`blocking`].

pub mod blocking;
mod client;
mod config;
pub mod protocol;
mod supervisor;

pub use client::S7Client;
pub use config::{ClientConfig, TsapConfig};
pub use protocol::{
    error::{Error, ErrorClass, ErrorCode, Result},
    frame::{
        Alarm, AlarmTransition, BlockInfo, BlockType, ConnectionType, CpuType, S7Area,
        S7DataVariableType, S7ReturnCode, S7TransportSize, S7VarSpec, Tsap, TsapPair, WriteItem,
    },
    planner::ReadItemMerged,
    session::{ConnectionContext, ConnectionState, SessionEvent},
};
