use bytes::{Bytes, BytesMut};

/// Outcome of feeding one DT payload
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reassembled {
    Complete(Bytes),
    Pending,
    /// The partial PDU grew past the ceiling and was dropped
    Overflow(usize),
}

/// Concatenates COTP DT payloads until one carries EOT.
#[derive(Debug)]
pub(crate) struct Reassembler {
    buf: Option<BytesMut>,
    ceiling: usize,
    /// Set after an overflow; swallow fragments up to the next EOT
    discarding: bool,
}

impl Reassembler {
    pub(crate) fn new(ceiling: usize) -> Self {
        Self {
            buf: None,
            ceiling,
            discarding: false,
        }
    }

    pub(crate) fn push(&mut self, payload: Bytes, eot: bool) -> Reassembled {
        if self.discarding {
            if eot {
                self.discarding = false;
            }
            return Reassembled::Pending;
        }
        // single-fragment PDUs skip the copy
        if eot && self.buf.is_none() {
            return Reassembled::Complete(payload);
        }
        let buf = self
            .buf
            .get_or_insert_with(|| BytesMut::with_capacity(payload.len() * 2));
        if buf.len() + payload.len() > self.ceiling {
            let dropped = buf.len() + payload.len();
            self.buf = None;
            self.discarding = !eot;
            return Reassembled::Overflow(dropped);
        }
        buf.extend_from_slice(&payload);
        if !eot {
            return Reassembled::Pending;
        }
        match self.buf.take() {
            Some(all) => Reassembled::Complete(all.freeze()),
            None => Reassembled::Pending,
        }
    }
}
