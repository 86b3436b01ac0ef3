use super::marker::{Marker, MarkerKind, MatchState};
use crate::protocol::{
    error::{Error, Result},
    frame::{tpkt::TPKT_HEADER_LEN, S7_HEADER_LEN},
};
use std::{collections::BTreeMap, sync::Arc};

/// Smallest meaningful TPKT datagram: header plus a 3-byte DT TPDU
pub const TPKT_MIN_DATAGRAM: usize = TPKT_HEADER_LEN + 3;

/// Diagnostic view of a datagram's header fields
pub type Attributes = BTreeMap<&'static str, u64>;

/// Shape of datagram a policy recognises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatagramKind {
    /// TPKT frame of unknown COTP type
    Transport,
    ConnectRequest,
    ConnectConfirm,
    DisconnectRequest,
    Data,
    /// Delimited by begin/end markers only
    Delimited,
}

/// How the total datagram length is determined once the header is buffered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthRule {
    /// Big-endian u16 at bytes 2..4 (RFC1006 TPKT)
    TpktHeader,
    /// Position of the end marker plus its size
    EndMarker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthOutcome {
    Known(usize),
    NeedMore(usize),
    /// Declared length can never be valid; resynchronise
    Invalid,
}

/// Immutable framing strategy for one datagram shape
#[derive(Debug, Clone)]
pub struct ProtocolPolicy {
    name: &'static str,
    kind: DatagramKind,
    markers: Vec<Marker>,
    length: LengthRule,
}

impl ProtocolPolicy {
    pub fn new(
        name: &'static str,
        kind: DatagramKind,
        markers: Vec<Marker>,
        length: LengthRule,
    ) -> Result<Self> {
        let ends = markers
            .iter()
            .filter(|m| m.kind() == MarkerKind::End)
            .count();
        if ends > 1 {
            return Err(Error::InvalidConfiguration("more than one end marker"));
        }
        if length == LengthRule::EndMarker && ends == 0 {
            return Err(Error::InvalidConfiguration("end-marker length without end marker"));
        }
        if !markers.iter().any(|m| m.kind() == MarkerKind::Begin) {
            return Err(Error::InvalidConfiguration("policy without begin marker"));
        }
        if markers.iter().any(Marker::is_empty) {
            return Err(Error::InvalidConfiguration("empty marker"));
        }
        Ok(Self {
            name,
            kind,
            markers,
            length,
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn kind(&self) -> DatagramKind {
        self.kind
    }

    pub fn begin_markers(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter().filter(|m| m.kind() == MarkerKind::Begin)
    }

    pub fn end_marker(&self) -> Option<&Marker> {
        self.markers.iter().find(|m| m.kind() == MarkerKind::End)
    }

    /// Combined extent of all begin markers; larger means more specific
    pub fn begin_extent(&self) -> usize {
        self.begin_markers().map(Marker::extent).max().unwrap_or(0)
    }

    /// Bytes that must be buffered before the length can be computed
    pub fn minimum_size(&self) -> usize {
        let header = match self.length {
            LengthRule::TpktHeader => TPKT_MIN_DATAGRAM,
            LengthRule::EndMarker => self.end_marker().map_or(0, Marker::extent),
        };
        header.max(self.begin_extent())
    }

    /// All begin markers must match for the policy to own the bytes at `start`
    pub fn match_begin(&self, buf: &[u8], start: usize) -> MatchState {
        let mut state = MatchState::Full;
        for marker in self.begin_markers() {
            match marker.match_at(buf, start) {
                MatchState::Mismatch => return MatchState::Mismatch,
                MatchState::Partial => state = MatchState::Partial,
                MatchState::Full => {}
            }
        }
        state
    }

    /// Total datagram length for a datagram starting at `buf[0]`
    pub fn datagram_length(&self, buf: &[u8]) -> LengthOutcome {
        match self.length {
            LengthRule::TpktHeader => {
                if buf.len() < TPKT_HEADER_LEN {
                    return LengthOutcome::NeedMore(TPKT_HEADER_LEN - buf.len());
                }
                let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if declared < TPKT_MIN_DATAGRAM {
                    LengthOutcome::Invalid
                } else {
                    LengthOutcome::Known(declared)
                }
            }
            LengthRule::EndMarker => match self.end_marker() {
                Some(end) => match end.find_from(buf, 0) {
                    Some(pos) => LengthOutcome::Known(pos + end.len()),
                    None => LengthOutcome::NeedMore(1),
                },
                None => LengthOutcome::Invalid,
            },
        }
    }

    /// Byte ranges of exclusive markers within one datagram of `len` bytes
    pub(crate) fn exclusive_ranges(&self, len: usize) -> Vec<std::ops::Range<usize>> {
        let mut ranges: Vec<_> = self
            .begin_markers()
            .filter(|m| m.is_exclusive())
            .map(|m| m.offset()..m.extent())
            .collect();
        if let Some(end) = self.end_marker().filter(|m| m.is_exclusive()) {
            ranges.push(len - end.len()..len);
        }
        ranges.sort_by_key(|r| r.start);
        ranges
    }

    /// Header fields of a raw datagram for logs and diagnostics
    pub fn attributes(&self, raw: &[u8]) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("length", raw.len() as u64);
        if self.length != LengthRule::TpktHeader || raw.len() < TPKT_MIN_DATAGRAM {
            return attrs;
        }
        attrs.insert("tpkt.length", u16::from_be_bytes([raw[2], raw[3]]) as u64);
        attrs.insert("cotp.type", raw[5] as u64);
        if self.kind == DatagramKind::Data {
            attrs.insert("cotp.eot", (raw[6] >> 7) as u64);
            let s7 = &raw[TPKT_MIN_DATAGRAM..];
            if s7.len() >= S7_HEADER_LEN && s7[0] == 0x32 {
                attrs.insert("s7.pdu_type", s7[1] as u64);
                attrs.insert("s7.pdu_ref", u16::from_be_bytes([s7[4], s7[5]]) as u64);
                attrs.insert("s7.param_len", u16::from_be_bytes([s7[6], s7[7]]) as u64);
                attrs.insert("s7.data_len", u16::from_be_bytes([s7[8], s7[9]]) as u64);
            }
        }
        attrs
    }
}

/// Which policy owns the bytes at the first plausible datagram start
#[derive(Debug, Clone)]
pub enum Selection {
    Found {
        start: usize,
        policy: Arc<ProtocolPolicy>,
    },
    /// A candidate at `start` can only be confirmed with `needed` more bytes
    Partial { start: usize, needed: usize },
    NoMatch,
}

/// Explicit set of framing policies, built once and shared by reference
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: Vec<Arc<ProtocolPolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, policy: ProtocolPolicy) -> &mut Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn policies(&self) -> &[Arc<ProtocolPolicy>] {
        &self.policies
    }

    /// RFC1006 datagrams: one policy per COTP TPDU type plus a generic TPKT
    /// fallback. The COTP type sits at offset 5 (TPKT 4 + LI 1).
    pub fn rfc1006() -> Result<Self> {
        const TPKT: &[u8] = &[0x03, 0x00];
        let typed = |name, kind, code: &'static [u8]| {
            ProtocolPolicy::new(
                name,
                kind,
                vec![Marker::begin(TPKT, 0), Marker::begin(code, 5)],
                LengthRule::TpktHeader,
            )
        };
        let mut registry = Self::new();
        registry
            .register(ProtocolPolicy::new(
                "tpkt",
                DatagramKind::Transport,
                vec![Marker::begin(TPKT, 0)],
                LengthRule::TpktHeader,
            )?)
            .register(typed("cotp-dt", DatagramKind::Data, &[0xF0])?)
            .register(typed("cotp-cr", DatagramKind::ConnectRequest, &[0xE0])?)
            .register(typed("cotp-cc", DatagramKind::ConnectConfirm, &[0xD0])?)
            .register(typed("cotp-dr", DatagramKind::DisconnectRequest, &[0x80])?);
        Ok(registry)
    }

    /// Find the earliest start where some policy's begin markers match.
    ///
    /// At one start the most specific full match wins, unless a more specific
    /// policy is still only partially verifiable, in which case the caller must
    /// wait for more bytes.
    pub fn select(&self, buf: &[u8]) -> Selection {
        for start in 0..buf.len() {
            let mut best: Option<&Arc<ProtocolPolicy>> = None;
            let mut pending: Option<(usize, usize)> = None;
            for policy in &self.policies {
                let extent = policy.begin_extent();
                match policy.match_begin(buf, start) {
                    MatchState::Full => {
                        if best.map_or(true, |b| extent > b.begin_extent()) {
                            best = Some(policy);
                        }
                    }
                    MatchState::Partial => {
                        let needed = (start + extent).saturating_sub(buf.len()).max(1);
                        if pending.map_or(true, |(e, _)| extent > e) {
                            pending = Some((extent, needed));
                        }
                    }
                    MatchState::Mismatch => {}
                }
            }
            if let Some((extent, needed)) = pending {
                if best.map_or(true, |b| extent > b.begin_extent()) {
                    return Selection::Partial { start, needed };
                }
            }
            if let Some(policy) = best {
                return Selection::Found {
                    start,
                    policy: Arc::clone(policy),
                };
            }
        }
        Selection::NoMatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_end_marker() {
        let err = ProtocolPolicy::new(
            "bad",
            DatagramKind::Delimited,
            vec![
                Marker::begin(&[0x02], 0),
                Marker::end(&[0x03], 1),
                Marker::end(&[0x04], 1),
            ],
            LengthRule::EndMarker,
        );
        assert!(matches!(err, Err(Error::InvalidConfiguration(_))));
        assert!(ProtocolPolicy::new(
            "no-end",
            DatagramKind::Delimited,
            vec![Marker::begin(&[0x02], 0)],
            LengthRule::EndMarker,
        )
        .is_err());
    }

    #[test]
    fn most_specific_policy_wins() {
        let registry = PolicyRegistry::rfc1006().unwrap();
        let cc = [0x03, 0x00, 0x00, 0x0B, 0x06, 0xD0, 0, 0, 0, 0, 0];
        match registry.select(&cc) {
            Selection::Found { start, policy } => {
                assert_eq!(start, 0);
                assert_eq!(policy.kind(), DatagramKind::ConnectConfirm);
            }
            other => panic!("unexpected {other:?}"),
        }
        // unknown COTP type falls back to the generic TPKT policy
        let odd = [0x03, 0x00, 0x00, 0x07, 0x02, 0x55, 0x00];
        match registry.select(&odd) {
            Selection::Found { policy, .. } => assert_eq!(policy.kind(), DatagramKind::Transport),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn specific_policy_not_yet_verifiable_waits() {
        let registry = PolicyRegistry::rfc1006().unwrap();
        match registry.select(&[0xAA, 0x03, 0x00, 0x00, 0x1F]) {
            Selection::Partial { start, needed } => {
                assert_eq!(start, 1);
                assert_eq!(needed, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            registry.select(&[0x11, 0x22, 0x33]),
            Selection::NoMatch
        ));
    }

    #[test]
    fn tpkt_length_rules() {
        let registry = PolicyRegistry::rfc1006().unwrap();
        let generic = &registry.policies()[0];
        assert_eq!(generic.minimum_size(), TPKT_MIN_DATAGRAM);
        assert_eq!(
            generic.datagram_length(&[0x03, 0x00, 0x00, 0x1F]),
            LengthOutcome::Known(31)
        );
        assert_eq!(
            generic.datagram_length(&[0x03, 0x00, 0x00, 0x00]),
            LengthOutcome::Invalid
        );
    }

    #[test]
    fn data_attributes_expose_s7_header() {
        let registry = PolicyRegistry::rfc1006().unwrap();
        let raw = [
            0x03, 0x00, 0x00, 0x11, 0x02, 0xF0, 0x80, 0x32, 0x03, 0x00, 0x00, 0x00, 0x2A, 0x00,
            0x00, 0x00, 0x00,
        ];
        let dt = registry
            .policies()
            .iter()
            .find(|p| p.kind() == DatagramKind::Data)
            .unwrap();
        let attrs = dt.attributes(&raw);
        assert_eq!(attrs["cotp.eot"], 1);
        assert_eq!(attrs["s7.pdu_ref"], 42);
        assert_eq!(attrs["s7.pdu_type"], 3);
    }
}
