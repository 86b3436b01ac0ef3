use super::{
    error::{Error, Result},
    frame::{
        DataItem, S7DataVariableType, S7ReturnCode, S7TransportSize, S7VarSpec, WriteItem,
        DATA_ITEM_HEADER_LEN, S7_ACK_HEADER_LEN, S7_HEADER_LEN, VAR_SPEC_LEN,
    },
};
use bytes::{Bytes, BytesMut};

// function + item_count
const S7_PARAM_BASE: usize = 2;
// bit-length items carry at most 0xFFFF bits
const MAX_BIT_LENGTH_BYTES: usize = u16::MAX as usize / 8;

/// Request planner for batching, splitting and merging.
///
/// Works at the S7 PDU level (header + param + data) and ignores COTP
/// segmentation, which the session handles.
#[derive(Debug, Clone, Copy)]
pub struct PlannerConfig {
    /// Negotiated S7 PDU size, header included
    pub pdu_size: u16,
    pub max_items_per_request: usize,
}

impl PlannerConfig {
    pub fn new(pdu_size: u16) -> Self {
        Self {
            pdu_size,
            max_items_per_request: 20,
        }
    }

    #[inline]
    pub fn with_max_items_per_request(mut self, max_items: usize) -> Self {
        self.max_items_per_request = max_items.max(1);
        self
    }

    /// Largest data payload of a single item in a ReadVar response
    pub fn max_read_chunk(&self) -> usize {
        (self.pdu_size as usize)
            .saturating_sub(S7_ACK_HEADER_LEN + S7_PARAM_BASE + DATA_ITEM_HEADER_LEN)
    }

    /// Largest data payload of a single item in a WriteVar request
    pub fn max_write_chunk(&self) -> usize {
        (self.pdu_size as usize).saturating_sub(
            S7_HEADER_LEN + S7_PARAM_BASE + VAR_SPEC_LEN + DATA_ITEM_HEADER_LEN,
        )
    }
}

/// Merged read result for one requested item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadItemMerged {
    /// Success only if every fragment succeeded; otherwise the first failing code
    pub return_code: S7ReturnCode,
    pub variable_type: S7DataVariableType,
    /// Item data in address order; empty on failure
    pub data: Bytes,
}

pub type ReadMerged = Vec<ReadItemMerged>;

#[derive(Debug, Clone, Copy)]
struct FragmentRef {
    batch: usize,
    index: usize,
    len: usize,
}

/// ReadVar batches plus the mapping back to the caller's items
#[derive(Debug, Clone)]
pub struct ReadPlan {
    pub batches: Vec<Vec<S7VarSpec>>,
    fragments: Vec<Vec<FragmentRef>>,
}

/// WriteVar batches plus the mapping back to the caller's items
#[derive(Debug, Clone)]
pub struct WritePlan {
    pub batches: Vec<Vec<WriteItem>>,
    fragments: Vec<Vec<(usize, usize)>>,
}

/// Running size of one PDU under construction
#[derive(Debug, Default)]
struct BatchSize {
    items: usize,
    /// Request bytes: header + param + data
    request: usize,
    /// Response bytes: header + param + data
    response: usize,
    /// Last item has odd length, so the next one adds a fill byte
    last_odd: bool,
}

impl BatchSize {
    fn empty(request_base: usize, response_base: usize) -> Self {
        Self {
            request: request_base,
            response: response_base,
            ..Default::default()
        }
    }

    fn pad(&self) -> usize {
        usize::from(self.items > 0 && self.last_odd)
    }
}

pub struct S7Planner;

impl S7Planner {
    /// Split oversized items and pack fragments into ReadVar batches whose
    /// request and response both fit the negotiated PDU size.
    pub fn plan_read(config: &PlannerConfig, specs: &[S7VarSpec]) -> Result<ReadPlan> {
        let pdu = config.pdu_size as usize;
        let mut batches: Vec<Vec<S7VarSpec>> = Vec::new();
        let mut current: Vec<S7VarSpec> = Vec::new();
        let mut fragments: Vec<Vec<FragmentRef>> = Vec::with_capacity(specs.len());
        let fresh = || {
            BatchSize::empty(
                S7_HEADER_LEN + S7_PARAM_BASE,
                S7_ACK_HEADER_LEN + S7_PARAM_BASE,
            )
        };
        let mut size = fresh();

        for spec in specs {
            let pieces = split_spec(spec, config.max_read_chunk())?;
            let mut refs = Vec::with_capacity(pieces.len());
            for piece in pieces {
                let len = piece.byte_len();
                let fits = size.items < config.max_items_per_request
                    && size.request + VAR_SPEC_LEN <= pdu
                    && size.response + size.pad() + DATA_ITEM_HEADER_LEN + len <= pdu;
                if !fits && !current.is_empty() {
                    batches.push(std::mem::take(&mut current));
                    size = fresh();
                }
                size.response += size.pad() + DATA_ITEM_HEADER_LEN + len;
                size.request += VAR_SPEC_LEN;
                size.items += 1;
                size.last_odd = len % 2 == 1;
                refs.push(FragmentRef {
                    batch: batches.len(),
                    index: current.len(),
                    len,
                });
                current.push(piece);
            }
            fragments.push(refs);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        Ok(ReadPlan { batches, fragments })
    }

    /// Split oversized writes and pack fragments into WriteVar batches.
    ///
    /// Each item's data must cover exactly the addressed range.
    pub fn plan_write(config: &PlannerConfig, items: &[WriteItem]) -> Result<WritePlan> {
        let pdu = config.pdu_size as usize;
        let mut batches: Vec<Vec<WriteItem>> = Vec::new();
        let mut current: Vec<WriteItem> = Vec::new();
        let mut fragments: Vec<Vec<(usize, usize)>> = Vec::with_capacity(items.len());
        let fresh = || {
            BatchSize::empty(
                S7_HEADER_LEN + S7_PARAM_BASE,
                S7_ACK_HEADER_LEN + S7_PARAM_BASE,
            )
        };
        let mut size = fresh();

        for item in items {
            if item.data.len() != item.spec.byte_len() {
                return Err(Error::ErrInvalidParam);
            }
            let pieces = split_spec(&item.spec, config.max_write_chunk())?;
            let mut refs = Vec::with_capacity(pieces.len());
            let mut offset = 0usize;
            for piece in pieces {
                let len = piece.byte_len();
                let data = item.data.slice(offset..offset + len);
                offset += len;
                let added = VAR_SPEC_LEN + size.pad() + DATA_ITEM_HEADER_LEN + len;
                let fits = size.items < config.max_items_per_request
                    && size.request + added <= pdu
                    && size.response < pdu;
                if !fits && !current.is_empty() {
                    batches.push(std::mem::take(&mut current));
                    size = fresh();
                }
                size.request += VAR_SPEC_LEN + size.pad() + DATA_ITEM_HEADER_LEN + len;
                size.response += 1;
                size.items += 1;
                size.last_odd = len % 2 == 1;
                refs.push((batches.len(), current.len()));
                current.push(WriteItem { spec: piece, data });
            }
            fragments.push(refs);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        Ok(WritePlan { batches, fragments })
    }
}

impl ReadPlan {
    /// Number of items the caller asked for
    pub fn item_count(&self) -> usize {
        self.fragments.len()
    }

    /// Reassemble per-item results from the ReadVar responses, one entry per
    /// batch in batch order.
    pub fn merge(&self, responses: &[Vec<DataItem>]) -> Result<ReadMerged> {
        if responses.len() != self.batches.len() {
            return Err(Error::ProtocolViolation {
                context: "read response count mismatch",
            });
        }
        for (batch, items) in self.batches.iter().zip(responses) {
            if batch.len() != items.len() {
                return Err(Error::ProtocolViolation {
                    context: "read response item count mismatch",
                });
            }
        }

        let mut merged = Vec::with_capacity(self.fragments.len());
        for refs in &self.fragments {
            let parts: Vec<&DataItem> = refs.iter().map(|r| &responses[r.batch][r.index]).collect();
            let variable_type = parts
                .first()
                .map_or(S7DataVariableType::Null, |p| p.variable_type);
            if let Some(failed) = parts.iter().find(|p| !p.return_code.is_success()) {
                merged.push(ReadItemMerged {
                    return_code: failed.return_code,
                    variable_type: failed.variable_type,
                    data: Bytes::new(),
                });
                continue;
            }
            for (part, r) in parts.iter().zip(refs) {
                if part.data.len() != r.len {
                    return Err(Error::ProtocolViolation {
                        context: "read item length mismatch",
                    });
                }
            }
            let data = match parts.as_slice() {
                [single] => single.data.clone(),
                _ => {
                    let total = refs.iter().map(|r| r.len).sum();
                    let mut buf = BytesMut::with_capacity(total);
                    for part in &parts {
                        buf.extend_from_slice(&part.data);
                    }
                    buf.freeze()
                }
            };
            merged.push(ReadItemMerged {
                return_code: S7ReturnCode::Success,
                variable_type,
                data,
            });
        }
        Ok(merged)
    }
}

impl WritePlan {
    pub fn item_count(&self) -> usize {
        self.fragments.len()
    }

    /// Per-item return codes from the WriteVar responses, one entry per batch
    pub fn merge(&self, responses: &[Vec<S7ReturnCode>]) -> Result<Vec<S7ReturnCode>> {
        if responses.len() != self.batches.len()
            || self
                .batches
                .iter()
                .zip(responses)
                .any(|(batch, codes)| batch.len() != codes.len())
        {
            return Err(Error::ProtocolViolation {
                context: "write response count mismatch",
            });
        }
        Ok(self
            .fragments
            .iter()
            .map(|refs| {
                refs.iter()
                    .map(|(batch, index)| responses[*batch][*index])
                    .find(|rc| !rc.is_success())
                    .unwrap_or(S7ReturnCode::Success)
            })
            .collect())
    }
}

/// Cut `spec` into element-aligned pieces of at most `max_bytes` data bytes
fn split_spec(spec: &S7VarSpec, max_bytes: usize) -> Result<Vec<S7VarSpec>> {
    if spec.count == 0 {
        return Err(Error::ErrInvalidParam);
    }
    if spec.transport_size == S7TransportSize::Bit {
        if spec.count != 1 {
            return Err(Error::ErrInvalidParam);
        }
        return Ok(vec![*spec]);
    }
    let limit = if spec.transport_size.data_variable_type().length_in_bits() {
        max_bytes.min(MAX_BIT_LENGTH_BYTES)
    } else {
        max_bytes
    };
    let elem = spec.element_bytes();
    let max_elems = limit / elem;
    if max_elems == 0 {
        return Err(Error::InvalidConfiguration("PDU size too small for one element"));
    }
    let total = spec.count as usize;
    if total <= max_elems {
        return Ok(vec![*spec]);
    }
    let mut pieces = Vec::with_capacity(total.div_ceil(max_elems));
    let mut done = 0usize;
    while done < total {
        let n = (total - done).min(max_elems);
        pieces.push(spec.sub_range(done, n as u16));
        done += n;
    }
    Ok(pieces)
}
