use super::super::{
    codec::Codec,
    error::{Error, Result},
    frame::{
        tpdu_size_bytes_from_code, tpdu_size_code_from_bytes, ConnectParams, Cotp, S7Body,
        S7Frame, S7Pdu, SetupCommunication, TsapPair, WireDecode,
    },
};
use super::state::SessionConfig;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// COTP source reference used by this client
const LOCAL_REF: u16 = 0x0001;

/// COTP connection establishment state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CotpState {
    Disconnected,
    AwaitingConnectionConfirm,
    Connected { frame_size: usize },
    /// Protocol violation during connect; the transport must be dropped
    Broken,
}

/// Client side of the COTP CR/CC exchange.
#[derive(Debug)]
pub(crate) struct CotpHandshake {
    state: CotpState,
    tsap: TsapPair,
    tpdu_code: u8,
}

impl CotpHandshake {
    pub(crate) fn new(tsap: TsapPair, tpdu_size: usize) -> Result<Self> {
        let tpdu_code = tpdu_size_code_from_bytes(tpdu_size)
            .ok_or(Error::InvalidConfiguration("tpduSize"))?;
        Ok(Self {
            state: CotpState::Disconnected,
            tsap,
            tpdu_code,
        })
    }

    pub(crate) fn state(&self) -> CotpState {
        self.state
    }

    /// Build the CR TPDU and start waiting for the confirm
    pub(crate) fn connect_request(&mut self) -> Result<S7Frame> {
        if self.state != CotpState::Disconnected {
            return Err(Error::ProtocolViolation {
                context: "connection request outside Disconnected",
            });
        }
        let params = ConnectParams::request(
            LOCAL_REF,
            self.tpdu_code,
            self.tsap.local.into(),
            self.tsap.remote.into(),
        );
        let frame = S7Frame::new(Cotp::Cr(params), bytes::Bytes::new())?;
        self.state = CotpState::AwaitingConnectionConfirm;
        Ok(frame)
    }

    /// Apply the peer's answer to our CR; returns the granted frame size.
    pub(crate) fn on_confirm(&mut self, cotp: &Cotp) -> Result<usize> {
        if self.state != CotpState::AwaitingConnectionConfirm {
            self.state = CotpState::Broken;
            return Err(Error::ProtocolViolation {
                context: "connection confirm while not awaiting one",
            });
        }
        let params = match cotp {
            Cotp::Cc(params) => params,
            Cotp::Dr(_) => return Err(self.broken("peer refused the connection")),
            _ => return Err(self.broken("expected connection confirm")),
        };
        if !self.tsap_pairing_matches(params) {
            return Err(self.broken("TSAP pairing mismatch"));
        }
        let code = match params.tpdu_size {
            None => self.tpdu_code,
            Some(granted) if tpdu_size_bytes_from_code(granted).is_none() => {
                return Err(self.broken("invalid TPDU size in confirm"));
            }
            Some(granted) if granted > self.tpdu_code => {
                tracing::warn!(
                    requested = self.tpdu_code,
                    granted,
                    "Peer offered a larger TPDU size, keeping the requested one"
                );
                self.tpdu_code
            }
            Some(granted) => granted,
        };
        let frame_size = 1usize << code;
        self.state = CotpState::Connected { frame_size };
        Ok(frame_size)
    }

    /// Peers either echo the CR TSAPs or swap them; absent TSAPs are accepted.
    fn tsap_pairing_matches(&self, params: &ConnectParams) -> bool {
        let local = u16::from(self.tsap.local);
        let remote = u16::from(self.tsap.remote);
        match (params.src_tsap, params.dst_tsap) {
            (Some(src), Some(dst)) => (src, dst) == (local, remote) || (src, dst) == (remote, local),
            (Some(one), None) | (None, Some(one)) => one == local || one == remote,
            (None, None) => true,
        }
    }

    fn broken(&mut self, context: &'static str) -> Error {
        self.state = CotpState::Broken;
        Error::HandshakeRejected { context }
    }
}

/// Perform COTP CR/CC handshake on an already connected framed transport.
///
/// Returns the granted frame size.
pub(super) async fn iso_connect(
    framed: &mut Framed<TcpStream, Codec>,
    config: &SessionConfig,
) -> Result<usize> {
    let mut handshake = CotpHandshake::new(config.tsap, config.tpdu_size)?;
    framed.send(handshake.connect_request()?).await?;

    let msg = framed.next().await.ok_or(Error::HandshakeRejected {
        context: "connection closed before confirm",
    })??;
    let frame = msg.frame()?;
    let frame_size = handshake.on_confirm(&frame.cotp)?;
    tracing::debug!(frame_size, "COTP connected");
    Ok(frame_size)
}

/// Send S7 SetupCommunication and return the values granted by the peer.
pub(super) async fn negotiation(
    framed: &mut Framed<TcpStream, Codec>,
    config: &SessionConfig,
) -> Result<SetupCommunication> {
    let request = S7Body::SetupRequest(SetupCommunication {
        amq_calling: config.amq_calling,
        amq_called: config.amq_called,
        pdu_size: config.pdu_size,
    })
    .to_pdu(0)?;
    framed.send(S7Frame::data(request.to_bytes()?, true)?).await?;

    let msg = framed.next().await.ok_or(Error::HandshakeRejected {
        context: "connection closed during setup communication",
    })??;
    let frame = msg.frame()?;
    if !matches!(frame.cotp, Cotp::Dt(_)) {
        return Err(Error::ErrUnexpectedPdu);
    }
    let (_, pdu) = S7Pdu::parse(&frame.payload, &frame.payload, &())?;
    pdu.check_header()?;
    match pdu.decode()? {
        S7Body::SetupResponse(granted) => Ok(granted),
        _ => Err(Error::ErrUnexpectedPdu),
    }
}
