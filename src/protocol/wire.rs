//! Capability traits shared by every on-wire structure.
//!
//! Encoders write into any `BufMut`; decoders parse from a borrowed slice and
//! return the unconsumed tail. `parent` is the owning `Bytes` of `input` so
//! that decoders can hand out zero-copy slices instead of allocating.

use bytes::{BufMut, Bytes};

pub trait WireEncode {
    type Error: std::fmt::Debug + Send + Sync + 'static;
    type Context;

    /// Exact number of bytes `encode_to` will write
    fn encoded_len(&self, ctx: &Self::Context) -> usize;

    fn encode_to<B: BufMut>(&self, dst: &mut B, ctx: &Self::Context) -> Result<(), Self::Error>;
}

pub trait WireDecode: Sized {
    type Error: std::fmt::Debug + Send + Sync + 'static;
    type Context;

    fn parse<'a>(
        input: &'a [u8],
        parent: &Bytes,
        ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self), Self::Error>;
}

/// Slice `sub` out of `parent` without copying when `sub` points into it.
///
/// Falls back to a copy when `sub` is not a view of `parent` (e.g. a slice of
/// a temporary buffer).
pub(crate) fn slice_from_parent(parent: &Bytes, sub: &[u8]) -> Bytes {
    if sub.is_empty() {
        return Bytes::new();
    }
    let base = parent.as_ptr() as usize;
    let start = sub.as_ptr() as usize;
    if start >= base && start + sub.len() <= base + parent.len() {
        parent.slice_ref(sub)
    } else {
        Bytes::copy_from_slice(sub)
    }
}
