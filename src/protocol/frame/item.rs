use super::{
    super::{
        error::{Error, Result},
        wire::slice_from_parent,
    },
    types::{S7Area, S7DataVariableType, S7ReturnCode, S7TransportSize},
    WireDecode, WireEncode,
};
use bytes::{BufMut, Bytes};
use nom::number::complete::{be_u16, be_u32, u8 as nom_u8};

/// Encoded size of one S7ANY var spec
pub const VAR_SPEC_LEN: usize = 12;
/// Return code, variable type and length in front of each data item
pub const DATA_ITEM_HEADER_LEN: usize = 4;

const VAR_SPEC_ITEM: u8 = 0x12;
const VAR_SPEC_ADDR_LEN: u8 = 0x0A;
const SYNTAX_ID_S7ANY: u8 = 0x10;

type NomError<'a> = nom::error::Error<&'a [u8]>;

/// S7 variable specification (S7ANY): one read or write item address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7VarSpec {
    pub transport_size: S7TransportSize,
    /// number of elements
    pub count: u16,
    /// DB number if area is DB, else 0
    pub db_number: u16,
    pub area: S7Area,
    /// byte offset
    pub byte_address: u32,
    /// bit index [0..7] for bit-level access
    pub bit_index: u8,
}

/// A read item is fully described by its address
pub type ReadItem = S7VarSpec;

impl S7VarSpec {
    pub fn new(
        area: S7Area,
        db_number: u16,
        byte_address: u32,
        transport_size: S7TransportSize,
        count: u16,
    ) -> Self {
        Self {
            transport_size,
            count,
            db_number: if area.uses_db_number() { db_number } else { 0 },
            area,
            byte_address,
            bit_index: 0,
        }
    }

    /// Single-bit address
    pub fn bit(area: S7Area, db_number: u16, byte_address: u32, bit_index: u8) -> Self {
        Self {
            bit_index: bit_index & 0x07,
            ..Self::new(area, db_number, byte_address, S7TransportSize::Bit, 1)
        }
    }

    #[inline]
    pub fn element_bytes(&self) -> usize {
        self.transport_size.element_bytes()
    }

    /// Total data bytes addressed by this spec
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.count as usize * self.element_bytes()
    }

    /// Same area and DB, starting `skip_elems` elements further, `count` elements long
    pub fn sub_range(&self, skip_elems: usize, count: u16) -> Self {
        Self {
            byte_address: self.byte_address + (skip_elems * self.element_bytes()) as u32,
            count,
            ..*self
        }
    }

    fn address_bits(&self) -> u32 {
        ((self.byte_address & 0x001F_FFFF) << 3) | (self.bit_index & 0x07) as u32
    }
}

impl WireEncode for S7VarSpec {
    type Error = Error;
    type Context = ();

    fn encoded_len(&self, _ctx: &Self::Context) -> usize {
        VAR_SPEC_LEN
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _ctx: &Self::Context) -> Result<()> {
        if self.byte_address > 0x001F_FFFF {
            return Err(Error::Encode {
                context: "byte address exceeds 21 bits",
            });
        }
        dst.put_u8(VAR_SPEC_ITEM);
        dst.put_u8(VAR_SPEC_ADDR_LEN);
        dst.put_u8(SYNTAX_ID_S7ANY);
        dst.put_u8(self.transport_size as u8);
        dst.put_u16(self.count);
        dst.put_u16(self.db_number);
        dst.put_u8(self.area as u8);
        let addr = self.address_bits();
        dst.put_u8((addr >> 16) as u8);
        dst.put_u8((addr >> 8) as u8);
        dst.put_u8(addr as u8);
        Ok(())
    }
}

impl WireDecode for S7VarSpec {
    type Error = Error;
    type Context = ();

    fn parse<'a>(
        input: &'a [u8],
        _parent: &Bytes,
        _ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        let (i, item) = nom_u8::<_, NomError>(input).map_err(|_| Error::ErrInvalidFrame)?;
        let (i, len) = nom_u8::<_, NomError>(i).map_err(|_| Error::ErrInvalidFrame)?;
        let (i, syntax) = nom_u8::<_, NomError>(i).map_err(|_| Error::ErrInvalidFrame)?;
        if item != VAR_SPEC_ITEM || len != VAR_SPEC_ADDR_LEN || syntax != SYNTAX_ID_S7ANY {
            return Err(Error::ProtocolViolation {
                context: "unsupported var spec syntax",
            });
        }
        let (i, ts) = nom_u8::<_, NomError>(i).map_err(|_| Error::ErrInvalidFrame)?;
        let transport_size = S7TransportSize::try_from(ts).map_err(|_| Error::ErrInvalidFrame)?;
        let (i, count) = be_u16::<_, NomError>(i).map_err(|_| Error::ErrInvalidFrame)?;
        let (i, db_number) = be_u16::<_, NomError>(i).map_err(|_| Error::ErrInvalidFrame)?;
        // area byte + 24-bit address read as one u32
        let (i, area_addr) = be_u32::<_, NomError>(i).map_err(|_| Error::ErrInvalidFrame)?;
        let area = S7Area::try_from((area_addr >> 24) as u8).map_err(|_| Error::ErrInvalidFrame)?;
        let addr = area_addr & 0x00FF_FFFF;
        Ok((
            i,
            S7VarSpec {
                transport_size,
                count,
                db_number,
                area,
                byte_address: addr >> 3,
                bit_index: (addr & 0x07) as u8,
            },
        ))
    }
}

/// Write item: address plus the bytes to store there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteItem {
    pub spec: S7VarSpec,
    pub data: Bytes,
}

impl WriteItem {
    /// Byte-addressed write covering `data.len()` bytes
    pub fn bytes(area: S7Area, db_number: u16, byte_address: u32, data: Bytes) -> Self {
        let count = data.len().min(u16::MAX as usize) as u16;
        Self {
            spec: S7VarSpec::new(area, db_number, byte_address, S7TransportSize::Byte, count),
            data,
        }
    }

    /// Data item representation used in a WriteVar job
    pub fn to_data_item(&self) -> DataItem {
        DataItem {
            return_code: S7ReturnCode::Reserved,
            variable_type: self.spec.transport_size.data_variable_type(),
            data: self.data.clone(),
        }
    }
}

/// One data item of a ReadVar response or a WriteVar request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    pub return_code: S7ReturnCode,
    pub variable_type: S7DataVariableType,
    pub data: Bytes,
}

impl DataItem {
    /// Failed read item: return code only, no data
    pub fn failed(return_code: S7ReturnCode) -> Self {
        Self {
            return_code,
            variable_type: S7DataVariableType::Null,
            data: Bytes::new(),
        }
    }

    /// Successful octet-string style item
    pub fn ok(variable_type: S7DataVariableType, data: Bytes) -> Self {
        Self {
            return_code: S7ReturnCode::Success,
            variable_type,
            data,
        }
    }

    #[inline]
    fn needs_pad(&self, is_last: bool) -> bool {
        !is_last && self.data.len() % 2 == 1
    }
}

impl WireEncode for DataItem {
    type Error = Error;
    /// `true` when this is the last item of the list (no trailing pad)
    type Context = bool;

    fn encoded_len(&self, is_last: &Self::Context) -> usize {
        DATA_ITEM_HEADER_LEN + self.data.len() + usize::from(self.needs_pad(*is_last))
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, is_last: &Self::Context) -> Result<()> {
        let len = if self.variable_type.length_in_bits() {
            self.data.len() * 8
        } else {
            self.data.len()
        };
        let len = u16::try_from(len).map_err(|_| Error::Encode {
            context: "data item too long",
        })?;
        dst.put_u8(self.return_code.into());
        dst.put_u8(self.variable_type as u8);
        dst.put_u16(len);
        dst.put_slice(&self.data);
        if self.needs_pad(*is_last) {
            dst.put_u8(0x00);
        }
        Ok(())
    }
}

impl WireDecode for DataItem {
    type Error = Error;
    /// `true` when this is the last item of the list (no trailing pad)
    type Context = bool;

    fn parse<'a>(
        input: &'a [u8],
        parent: &Bytes,
        is_last: &Self::Context,
    ) -> Result<(&'a [u8], Self)> {
        let (i, rc) = nom_u8::<_, NomError>(input).map_err(|_| Error::ErrInvalidFrame)?;
        let (i, vt) = nom_u8::<_, NomError>(i).map_err(|_| Error::ErrInvalidFrame)?;
        let (i, len) = be_u16::<_, NomError>(i).map_err(|_| Error::ErrInvalidFrame)?;
        let return_code = S7ReturnCode::from(rc);
        let variable_type = S7DataVariableType::try_from(vt).map_err(|_| Error::Decode {
            context: "unknown data variable type",
        })?;
        let byte_len = if variable_type.length_in_bits() {
            (len as usize).div_ceil(8)
        } else {
            len as usize
        };
        if i.len() < byte_len {
            return Err(Error::InsufficientData {
                needed: byte_len,
                available: i.len(),
            });
        }
        let item = DataItem {
            return_code,
            variable_type,
            data: slice_from_parent(parent, &i[..byte_len]),
        };
        let mut rest = &i[byte_len..];
        if item.needs_pad(*is_last) {
            if rest.is_empty() {
                return Err(Error::ProtocolViolation {
                    context: "missing fill byte between data items",
                });
            }
            rest = &rest[1..];
        }
        Ok((rest, item))
    }
}

/// Encode `items` back-to-back with fill bytes between odd-length items
pub fn encode_data_items<B: BufMut>(items: &[DataItem], dst: &mut B) -> Result<()> {
    let n = items.len();
    for (idx, item) in items.iter().enumerate() {
        item.encode_to(dst, &(idx + 1 == n))?;
    }
    Ok(())
}

pub fn data_items_len(items: &[DataItem]) -> usize {
    let n = items.len();
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| item.encoded_len(&(idx + 1 == n)))
        .sum()
}

/// Decode exactly `count` data items; leftover bytes are a protocol error
pub fn parse_data_items(input: &[u8], parent: &Bytes, count: usize) -> Result<Vec<DataItem>> {
    let mut rest = input;
    let mut items = Vec::with_capacity(count);
    for idx in 0..count {
        let (next, item) = DataItem::parse(rest, parent, &(idx + 1 == count))?;
        items.push(item);
        rest = next;
    }
    if !rest.is_empty() {
        return Err(Error::ProtocolViolation {
            context: "trailing bytes after data items",
        });
    }
    Ok(items)
}

/// Decode exactly `count` var specs and return the unconsumed tail
pub fn parse_var_specs<'a>(
    input: &'a [u8],
    parent: &Bytes,
    count: usize,
) -> Result<(&'a [u8], Vec<S7VarSpec>)> {
    let mut rest = input;
    let mut specs = Vec::with_capacity(count);
    for _ in 0..count {
        let (next, spec) = S7VarSpec::parse(rest, parent, &())?;
        specs.push(spec);
        rest = next;
    }
    Ok((rest, specs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn var_spec_packs_bit_address() {
        let spec = S7VarSpec::bit(S7Area::DB, 250, 10, 3);
        let mut buf = BytesMut::new();
        spec.encode_to(&mut buf, &()).unwrap();
        assert_eq!(
            &buf[..],
            &[0x12, 0x0A, 0x10, 0x01, 0x00, 0x01, 0x00, 0xFA, 0x84, 0x00, 0x00, 0x53]
        );
        let (rest, back) = S7VarSpec::parse(&buf, &buf.clone().freeze(), &()).unwrap();
        assert!(rest.is_empty());
        assert_eq!(back, spec);
    }

    #[test]
    fn db_number_dropped_outside_data_blocks() {
        let spec = S7VarSpec::new(S7Area::M, 7, 0, S7TransportSize::Word, 4);
        assert_eq!(spec.db_number, 0);
        assert_eq!(spec.byte_len(), 8);
        let sub = spec.sub_range(2, 2);
        assert_eq!(sub.byte_address, 4);
        assert_eq!(sub.count, 2);
    }

    #[test]
    fn data_items_are_padded_between_but_not_after() {
        let items = vec![
            DataItem::ok(
                S7DataVariableType::ByteWordDWord,
                Bytes::from_static(&[1, 2, 3]),
            ),
            DataItem::failed(S7ReturnCode::AddressOutOfRange),
            DataItem::ok(S7DataVariableType::OctetString, Bytes::from_static(&[9])),
        ];
        let mut buf = BytesMut::new();
        encode_data_items(&items, &mut buf).unwrap();
        assert_eq!(buf.len(), data_items_len(&items));
        assert_eq!(
            &buf[..],
            &[
                0xFF, 0x04, 0x00, 0x18, 1, 2, 3, 0x00, // bit length 24 + fill
                0x05, 0x00, 0x00, 0x00, // failed item
                0xFF, 0x09, 0x00, 0x01, 9 // last item, no fill
            ]
        );
        let parent = buf.freeze();
        let back = parse_data_items(&parent, &parent, 3).unwrap();
        assert_eq!(back, items);
    }

    #[test]
    fn truncated_item_list_is_an_error() {
        let raw = Bytes::from_static(&[0xFF, 0x04, 0x00, 0x20, 1, 2]);
        assert!(matches!(
            parse_data_items(&raw, &raw, 1),
            Err(Error::InsufficientData { needed: 4, .. })
        ));
        // claims two items, carries one
        let raw = Bytes::from_static(&[0xFF, 0x09, 0x00, 0x01, 7]);
        assert!(parse_data_items(&raw, &raw, 2).is_err());
        // garbage after the declared items
        let raw = Bytes::from_static(&[0xFF, 0x09, 0x00, 0x01, 7, 0xAA]);
        assert!(parse_data_items(&raw, &raw, 1).is_err());
    }
}
