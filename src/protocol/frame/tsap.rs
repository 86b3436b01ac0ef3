use super::super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize_repr, Deserialize_repr)]
#[repr(i16)]
pub enum CpuType {
    S7200 = 0,
    S7200Smart = 1,
    #[default]
    S7300 = 2,
    S7400 = 3,
    S71200 = 4,
    S71500 = 5,
}

/// Connection resource class; forms the high byte of the remote TSAP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ConnectionType {
    /// Programming device
    #[default]
    Pg = 0x01,
    /// Operator panel
    Op = 0x02,
    /// S7 basic communication
    Basic = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tsap(pub u16);

impl From<Tsap> for u16 {
    #[inline]
    fn from(tsap: Tsap) -> Self {
        tsap.0
    }
}

impl From<(u8, u8)> for Tsap {
    /// Create `Tsap` from (high, low) bytes
    #[inline]
    fn from(value: (u8, u8)) -> Self {
        Tsap(((value.0 as u16) << 8) | value.1 as u16)
    }
}

impl fmt::Display for Tsap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}:{:02X}", self.0 >> 8, self.0 & 0xFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsapPair {
    pub local: Tsap,
    pub remote: Tsap,
}

impl From<(u16, u16)> for TsapPair {
    #[inline]
    fn from(value: (u16, u16)) -> Self {
        TsapPair {
            local: Tsap(value.0),
            remote: Tsap(value.1),
        }
    }
}

#[inline]
fn validate_rack_slot(rack: u8, slot: u8) -> Result<()> {
    if rack > 0x07 {
        return Err(Error::InvalidRack(rack));
    }
    if slot > 0x1F {
        return Err(Error::InvalidSlot(slot));
    }
    Ok(())
}

/// Derive the TSAP pair for a CPU family from rack/slot.
///
/// The remote TSAP packs the connection type in the high byte and
/// `rack << 5 | slot` in the low byte.
pub fn default_tsap_pair(
    cpu: CpuType,
    connection_type: ConnectionType,
    rack: u8,
    slot: u8,
) -> Result<TsapPair> {
    validate_rack_slot(rack, slot)?;

    let pair = match cpu {
        CpuType::S7200 => TsapPair::from((0x4D57, 0x4D57)),
        CpuType::S7200Smart => TsapPair::from((0x1000, 0x0300)),
        CpuType::S7300 | CpuType::S7400 | CpuType::S71200 | CpuType::S71500 => TsapPair {
            local: Tsap(0x0100),
            remote: Tsap::from((connection_type as u8, (rack << 5) | slot)),
        },
    };

    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rack_slot_packing() {
        let pair = default_tsap_pair(CpuType::S71500, ConnectionType::Pg, 0, 1).unwrap();
        assert_eq!(pair.local, Tsap(0x0100));
        assert_eq!(pair.remote, Tsap(0x0101));

        let pair = default_tsap_pair(CpuType::S7400, ConnectionType::Basic, 1, 3).unwrap();
        assert_eq!(u16::from(pair.remote), 0x0323);
        assert_eq!(pair.remote.to_string(), "03:23");
    }

    #[test]
    fn out_of_range_rack_or_slot() {
        assert!(matches!(
            default_tsap_pair(CpuType::S7300, ConnectionType::Pg, 8, 0),
            Err(Error::InvalidRack(8))
        ));
        assert!(matches!(
            default_tsap_pair(CpuType::S7300, ConnectionType::Pg, 0, 32),
            Err(Error::InvalidSlot(32))
        ));
    }

    #[test]
    fn legacy_families_ignore_rack_slot() {
        let pair = default_tsap_pair(CpuType::S7200, ConnectionType::Op, 0, 0).unwrap();
        assert_eq!(pair, TsapPair::from((0x4D57, 0x4D57)));
    }
}
