use super::{
    error::Result,
    frame::{S7Frame, WireDecode},
    framer::{Attributes, DatagramKind, ExtractedDatagram, ProtocolPolicy},
};
use bytes::Bytes;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u64);

impl MessageId {
    fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An immutable datagram received from the wire.
///
/// Keeps the raw bytes together with the policy that framed them so the
/// header fields can be inspected without decoding the whole frame.
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    created_at: Instant,
    origin: Option<SocketAddr>,
    policy: Arc<ProtocolPolicy>,
    raw: Bytes,
}

impl Message {
    pub(crate) fn inbound(datagram: ExtractedDatagram, origin: Option<SocketAddr>) -> Self {
        Self {
            id: MessageId::next(),
            created_at: Instant::now(),
            origin,
            policy: datagram.policy,
            raw: datagram.bytes,
        }
    }

    #[inline]
    pub fn id(&self) -> MessageId {
        self.id
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[inline]
    pub fn origin(&self) -> Option<SocketAddr> {
        self.origin
    }

    #[inline]
    pub fn kind(&self) -> DatagramKind {
        self.policy.kind()
    }

    #[inline]
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    #[inline]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn attributes(&self) -> Attributes {
        self.policy.attributes(&self.raw)
    }

    /// Decode TPKT and COTP; the DT payload stays a view of the raw bytes
    pub fn frame(&self) -> Result<S7Frame> {
        let (_, frame) = S7Frame::parse(&self.raw, &self.raw, &())?;
        Ok(frame)
    }
}
