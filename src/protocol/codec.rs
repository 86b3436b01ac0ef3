use super::{
    error::Error,
    frame::{S7Frame, WireEncode},
    framer::{ExtractedDatagram, Framer, PolicyRegistry},
    message::Message,
};
use bytes::BytesMut;
use std::{collections::VecDeque, net::SocketAddr, sync::Arc};
use tokio_util::codec::{Decoder, Encoder};

/// RFC1006 stream codec.
///
/// Inbound bytes go through the marker-driven [`Framer`] and come out as
/// [`Message`]s. Outbound frames are encoded directly.
pub struct Codec {
    framer: Framer,
    ready: VecDeque<ExtractedDatagram>,
    peer: Option<SocketAddr>,
}

impl Codec {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self {
            framer: Framer::new(registry),
            ready: VecDeque::new(),
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    fn next_ready(&mut self) -> Option<Message> {
        self.ready
            .pop_front()
            .map(|d| Message::inbound(d, self.peer))
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(msg) = self.next_ready() {
            return Ok(Some(msg));
        }
        let result = self.framer.extract(src);
        if result.needed > 0 {
            src.reserve(result.needed);
        }
        self.ready.extend(result.datagrams);
        Ok(self.next_ready())
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None => {
                if !buf.is_empty() {
                    tracing::debug!(bytes = buf.len(), "Dropping incomplete datagram at EOF");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<S7Frame> for Codec {
    type Error = Error;

    fn encode(&mut self, item: S7Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.encoded_len(&()));
        item.encode_to(dst, &())
    }
}
