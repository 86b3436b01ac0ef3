//! Marker-driven datagram extraction over an unstructured byte stream.
//!
//! The [`Framer`] runs a three-state loop (sync, length-sync, collect) over
//! the receive buffer. Sync finds the first offset where a registered policy's
//! begin markers match, length-sync waits for the policy's minimum header, and
//! collect takes exactly one datagram once the length is known. Unmatched
//! bytes are discarded as noise; a partial match at the buffer tail is kept.

pub mod marker;
pub mod policy;

pub use marker::{Marker, MarkerKind, MatchState};
pub use policy::{
    Attributes, DatagramKind, LengthOutcome, LengthRule, PolicyRegistry, ProtocolPolicy,
    Selection, TPKT_MIN_DATAGRAM,
};

use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;

/// Consecutive resynchronisations before a warning is emitted
const RESYNC_WARN_THRESHOLD: usize = 8;

/// One complete datagram taken from the stream
#[derive(Debug, Clone)]
pub struct ExtractedDatagram {
    pub policy: Arc<ProtocolPolicy>,
    pub bytes: Bytes,
}

/// Result of one extraction pass
#[derive(Debug, Default)]
pub struct ExtractionResult {
    /// Bytes removed from the buffer (datagrams plus discarded noise)
    pub consumed: usize,
    /// Additional bytes required before another attempt can succeed
    pub needed: usize,
    pub datagrams: Vec<ExtractedDatagram>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FramerStats {
    pub datagrams: u64,
    pub noise_bytes: u64,
    pub resyncs: u64,
}

pub struct Framer {
    registry: Arc<PolicyRegistry>,
    resync_streak: usize,
    stats: FramerStats,
}

impl Framer {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self {
            registry,
            resync_streak: 0,
            stats: FramerStats::default(),
        }
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Extract every complete datagram currently in `buf`.
    ///
    /// Consumed bytes are removed from the front of `buf`; an incomplete
    /// datagram (or partial marker) is left in place for the next call.
    pub fn extract(&mut self, buf: &mut BytesMut) -> ExtractionResult {
        let mut result = ExtractionResult::default();
        loop {
            if buf.is_empty() {
                result.needed = 0;
                return result;
            }

            // Sync
            let policy = match self.registry.select(buf) {
                Selection::Found { start, policy } => {
                    self.discard(buf, start, &mut result);
                    policy
                }
                Selection::Partial { start, needed } => {
                    self.discard(buf, start, &mut result);
                    result.needed = needed;
                    return result;
                }
                Selection::NoMatch => {
                    let len = buf.len();
                    self.discard(buf, len, &mut result);
                    result.needed = 0;
                    return result;
                }
            };

            // Length-sync
            let minimum = policy.minimum_size();
            if buf.len() < minimum {
                result.needed = minimum - buf.len();
                return result;
            }

            // Collect
            match policy.datagram_length(buf) {
                LengthOutcome::Known(len) if buf.len() >= len => {
                    let raw = buf.split_to(len).freeze();
                    result.consumed += len;
                    self.resync_streak = 0;
                    self.stats.datagrams += 1;
                    result.datagrams.push(ExtractedDatagram {
                        bytes: strip_exclusive(&policy, raw),
                        policy,
                    });
                }
                LengthOutcome::Known(len) => {
                    result.needed = len - buf.len();
                    return result;
                }
                LengthOutcome::NeedMore(n) => {
                    result.needed = n;
                    return result;
                }
                LengthOutcome::Invalid => {
                    self.resync_streak += 1;
                    self.stats.resyncs += 1;
                    if self.resync_streak == RESYNC_WARN_THRESHOLD {
                        tracing::warn!(
                            policy = policy.name(),
                            streak = self.resync_streak,
                            "Framer keeps resynchronising on invalid lengths"
                        );
                    }
                    let drop = minimum.min(buf.len());
                    self.discard(buf, drop, &mut result);
                }
            }
        }
    }

    fn discard(&mut self, buf: &mut BytesMut, n: usize, result: &mut ExtractionResult) {
        if n == 0 {
            return;
        }
        tracing::trace!(bytes = n, "Framer discarding unmatched bytes");
        buf.advance(n);
        result.consumed += n;
        self.stats.noise_bytes += n as u64;
    }
}

fn strip_exclusive(policy: &ProtocolPolicy, raw: Bytes) -> Bytes {
    let ranges = policy.exclusive_ranges(raw.len());
    if ranges.is_empty() {
        return raw;
    }
    let mut out = BytesMut::with_capacity(raw.len());
    let mut cursor = 0;
    for range in ranges {
        if range.start > cursor {
            out.extend_from_slice(&raw[cursor..range.start]);
        }
        cursor = cursor.max(range.end);
    }
    if cursor < raw.len() {
        out.extend_from_slice(&raw[cursor..]);
    }
    out.freeze()
}
