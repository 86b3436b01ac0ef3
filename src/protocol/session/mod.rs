mod dispatcher;
mod handshake;
mod reassembly;
mod state;

pub use state::{
    ConnectionContext, ConnectionState, SessionConfig, SessionEvent, SessionExit, MIN_PDU_SIZE,
};

use super::{
    codec::Codec,
    error::{Error, Result},
    frame::{
        userdata::{
            alarm_query_request, block_info_request, continuation_request, parse_alarms,
            parse_clock, read_clock_request,
        },
        segment_pdu, Alarm, BlockInfo, BlockType, Cotp, DataItem, DisconnectParams, S7Body,
        S7Frame, S7Pdu, S7ReturnCode, S7VarSpec, SetupCommunication, WireDecode, WireEncode,
        WriteItem,
    },
    framer::PolicyRegistry,
    message::Message,
    planner::{PlannerConfig, ReadMerged, S7Planner},
};
use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use chrono::NaiveDateTime;
use dispatcher::{Dispatcher, Resolution};
use futures::{
    future::join_all,
    stream::SplitSink,
};
use futures_util::{SinkExt, StreamExt};
use reassembly::{Reassembled, Reassembler};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    net::{lookup_host, TcpSocket, TcpStream},
    sync::{broadcast, mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore},
    time::{sleep, timeout, timeout_at},
};
use tokio_util::{codec::Framed, sync::CancellationToken};

type FramedTransport = Framed<TcpStream, Codec>;
type FrameSink = SplitSink<FramedTransport, S7Frame>;

/// Deadline used when nothing is pending
const IDLE_TICK: Duration = Duration::from_secs(3_600);
/// Budget for the best-effort disconnect request on close
const DISCONNECT_GRACE: Duration = Duration::from_millis(200);

/// A job queued for the IO loop
#[derive(Debug)]
struct SessionRequest {
    pdu: S7Pdu,
    /// Absolute deadline fixed at submission
    deadline: Instant,
    response_tx: oneshot::Sender<Result<S7Pdu>>,
    permit: OwnedSemaphorePermit,
}

/// One connection attempt to a PLC and everything that runs over it.
///
/// A session is single-use: [`Session::run`] drives the handshake and the IO
/// loop until the transport is lost or [`Session::shutdown`] is called.
/// Reconnecting means building a fresh session.
#[derive(Debug)]
pub struct Session {
    config: Arc<SessionConfig>,
    registry: Arc<PolicyRegistry>,
    request_tx: ArcSwapOption<mpsc::Sender<SessionRequest>>,
    request_semaphore: ArcSwapOption<Semaphore>,
    context: ArcSwapOption<ConnectionContext>,
    cancel: CancellationToken,
    events_tx: broadcast::Sender<SessionEvent>,
    lifecycle_tx: watch::Sender<ConnectionState>,
    lifecycle_rx: watch::Receiver<ConnectionState>,
}

impl Session {
    pub fn new(
        config: Arc<SessionConfig>,
        registry: Arc<PolicyRegistry>,
        events_tx: broadcast::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (lifecycle_tx, lifecycle_rx) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            config,
            registry,
            request_tx: ArcSwapOption::empty(),
            request_semaphore: ArcSwapOption::empty(),
            context: ArcSwapOption::empty(),
            cancel,
            events_tx,
            lifecycle_tx,
            lifecycle_rx,
        })
    }

    #[inline]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn lifecycle(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle_rx.clone()
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        *self.lifecycle_rx.borrow()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Negotiated parameters; `None` unless the session is `Ready`
    pub fn context(&self) -> Option<ConnectionContext> {
        self.context.load_full().map(|ctx| *ctx)
    }

    /// Wait until the session is `Ready` (true) or has ended (false)
    pub async fn wait_for_ready(&self) -> bool {
        let mut rx = self.lifecycle_rx.clone();
        let state = rx
            .wait_for(|s| s.is_ready() || s.is_terminal())
            .await
            .map(|s| *s);
        matches!(state, Ok(ConnectionState::Ready))
    }

    /// Ask the IO loop to stop; pending and queued jobs fail with `ErrNotConnected`
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(sem) = self.request_semaphore.load_full() {
            sem.close();
        }
    }

    #[inline]
    fn publish_lifecycle(&self, state: ConnectionState) {
        let _ = self.lifecycle_tx.send(state);
        let _ = self.events_tx.send(SessionEvent::LifecycleChanged(state));
    }

    /// Connect, negotiate and serve jobs until closed or the transport drops.
    ///
    /// Errors are returned only when the connection never reached `Ready`.
    pub async fn run(self: Arc<Self>) -> Result<SessionExit> {
        let established = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.publish_lifecycle(ConnectionState::Closed);
                return Ok(SessionExit::Closed);
            }
            res = timeout(self.config.connect_timeout, self.establish()) => res,
        };
        let (framed, ctx) = match established {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "S7 connect failed");
                self.publish_lifecycle(ConnectionState::Failed);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "S7 connect timed out"
                );
                self.publish_lifecycle(ConnectionState::Failed);
                return Err(Error::ErrConnectTimeout);
            }
        };
        Ok(self.serve(framed, ctx).await)
    }

    async fn establish(&self) -> Result<(FramedTransport, ConnectionContext)> {
        self.publish_lifecycle(ConnectionState::Connecting);
        let stream = open_transport(&self.config).await?;
        let peer = stream.peer_addr()?;
        tracing::debug!(%peer, "TCP connected");
        let _ = self.events_tx.send(SessionEvent::TransportUp { peer });
        self.publish_lifecycle(ConnectionState::TransportOpen);

        let codec = Codec::new(Arc::clone(&self.registry)).with_peer(peer);
        let mut framed = Framed::new(stream, codec);
        let frame_size = handshake::iso_connect(&mut framed, &self.config).await?;

        self.publish_lifecycle(ConnectionState::Negotiating);
        let granted = handshake::negotiation(&mut framed, &self.config).await?;
        let ctx = negotiate_context(&self.config, frame_size, granted)?;
        Ok((framed, ctx))
    }

    async fn serve(&self, framed: FramedTransport, ctx: ConnectionContext) -> SessionExit {
        let (request_tx, mut request_rx) = mpsc::channel(self.config.send_queue_capacity.max(1));
        self.request_tx.store(Some(Arc::new(request_tx)));
        self.request_semaphore
            .store(Some(Arc::new(Semaphore::new(ctx.window()))));
        self.context.store(Some(Arc::new(ctx)));
        tracing::info!(
            pdu_size = ctx.pdu_size,
            frame_size = ctx.frame_size,
            window = ctx.window(),
            "S7 session ready"
        );
        let _ = self.events_tx.send(SessionEvent::Negotiated(ctx));
        self.publish_lifecycle(ConnectionState::Ready);

        let (mut sink, mut stream) = framed.split();
        let mut dispatcher = Dispatcher::new(self.config.ref_grace);
        let mut reassembler = Reassembler::new(self.config.max_reassembly_bytes);
        let deadline_sleep = sleep(IDLE_TICK);
        tokio::pin!(deadline_sleep);

        let (exit, reason) = loop {
            let next = dispatcher
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_TICK);
            deadline_sleep
                .as_mut()
                .reset(tokio::time::Instant::from_std(next));

            tokio::select! {
                _ = self.cancel.cancelled() => break (SessionExit::Closed, "closed on request"),
                req = request_rx.recv() => match req {
                    Some(request) => {
                        if let Err(e) = self
                            .dispatch(request, &mut dispatcher, &mut sink, ctx.frame_size)
                            .await
                        {
                            tracing::warn!(error = %e, "S7 send failed");
                            break (SessionExit::TransportLost, "send failed");
                        }
                    }
                    None => break (SessionExit::Closed, "request channel closed"),
                },
                msg = stream.next() => match msg {
                    Some(Ok(msg)) => {
                        if let Some(reason) = self.on_message(msg, &mut dispatcher, &mut reassembler) {
                            break (SessionExit::TransportLost, reason);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "S7 receive failed");
                        break (SessionExit::TransportLost, "receive failed");
                    }
                    None => break (SessionExit::TransportLost, "peer closed the connection"),
                },
                _ = &mut deadline_sleep => {
                    for pdu_ref in dispatcher.expire(Instant::now()) {
                        tracing::debug!(pdu_ref, "S7 job timed out");
                        let _ = self.events_tx.send(SessionEvent::RequestTimeout { pdu_ref });
                    }
                }
            }
        };

        self.teardown(exit, reason, &mut dispatcher, &mut request_rx, sink)
            .await;
        exit
    }

    async fn dispatch(
        &self,
        request: SessionRequest,
        dispatcher: &mut Dispatcher,
        sink: &mut FrameSink,
        frame_size: usize,
    ) -> Result<()> {
        let SessionRequest {
            mut pdu,
            deadline,
            response_tx,
            permit,
        } = request;
        // caller already gave up
        if response_tx.is_closed() {
            return Ok(());
        }
        let now = Instant::now();
        if deadline <= now {
            let _ = response_tx.send(Err(Error::ErrRequestTimeout));
            return Ok(());
        }
        let Some(pdu_ref) = dispatcher.allocate_ref(now) else {
            let _ = response_tx.send(Err(Error::ProtocolViolation {
                context: "no free job reference",
            }));
            return Ok(());
        };
        pdu.set_pdu_ref(pdu_ref);
        let frames = match pdu
            .to_bytes()
            .and_then(|raw| segment_pdu(raw, frame_size))
        {
            Ok(frames) => frames,
            Err(e) => {
                let _ = response_tx.send(Err(e));
                return Ok(());
            }
        };
        dispatcher.register(pdu_ref, response_tx, permit, deadline);
        tracing::trace!(pdu_ref, fragments = frames.len(), "Sending S7 job");

        // inbound frames wait until the whole job is flushed
        for frame in frames {
            if let Err(e) = sink.feed(frame).await {
                dispatcher.fail(pdu_ref, Error::ErrNotConnected);
                return Err(e);
            }
        }
        if let Err(e) = sink.flush().await {
            dispatcher.fail(pdu_ref, Error::ErrNotConnected);
            return Err(e);
        }
        Ok(())
    }

    /// Returns a reason when the message ends the connection
    fn on_message(
        &self,
        msg: Message,
        dispatcher: &mut Dispatcher,
        reassembler: &mut Reassembler,
    ) -> Option<&'static str> {
        let S7Frame { cotp, payload, .. } = match msg.frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id = %msg.id(), policy = msg.policy_name(), error = %e, "Dropping malformed datagram");
                return None;
            }
        };
        match cotp {
            Cotp::Dt(params) => match reassembler.push(payload, params.eot) {
                Reassembled::Complete(raw) => self.on_pdu(raw, dispatcher),
                Reassembled::Pending => {}
                Reassembled::Overflow(bytes) => {
                    tracing::warn!(
                        bytes,
                        ceiling = self.config.max_reassembly_bytes,
                        "COTP reassembly overflow, dropping partial PDU"
                    );
                    let _ = self
                        .events_tx
                        .send(SessionEvent::ReassemblyOverflow { bytes });
                }
            },
            Cotp::Dr(params) => {
                tracing::info!(reason = params.reason, "Peer sent disconnect request");
                return Some("peer disconnect request");
            }
            other => {
                tracing::debug!(tpdu = ?other.pdu_type(), "Ignoring unexpected TPDU");
            }
        }
        None
    }

    fn on_pdu(&self, raw: Bytes, dispatcher: &mut Dispatcher) {
        match S7Pdu::parse(&raw, &raw, &()) {
            Ok((_, pdu)) => {
                if let Resolution::Miss(pdu_ref) = dispatcher.resolve(pdu) {
                    tracing::warn!(pdu_ref, "Discarding S7 reply without a pending job");
                    let _ = self
                        .events_tx
                        .send(SessionEvent::CorrelationMiss { pdu_ref });
                }
            }
            Err(e) => tracing::warn!(error = %e, len = raw.len(), "Dropping undecodable S7 PDU"),
        }
    }

    async fn teardown(
        &self,
        exit: SessionExit,
        reason: &'static str,
        dispatcher: &mut Dispatcher,
        request_rx: &mut mpsc::Receiver<SessionRequest>,
        mut sink: FrameSink,
    ) {
        self.request_tx.store(None);
        if let Some(sem) = self.request_semaphore.swap(None) {
            sem.close();
        }
        self.context.store(None);
        if exit == SessionExit::Closed {
            self.publish_lifecycle(ConnectionState::Closing);
        }

        request_rx.close();
        let mut failed = dispatcher.drain();
        while let Ok(queued) = request_rx.try_recv() {
            let _ = queued.response_tx.send(Err(Error::ErrNotConnected));
            failed += 1;
        }
        if failed > 0 {
            tracing::debug!(failed, "Failed pending S7 jobs on teardown");
        }

        let _ = self
            .events_tx
            .send(SessionEvent::TransportDown { reason });
        match exit {
            SessionExit::Closed => {
                match S7Frame::new(Cotp::Dr(DisconnectParams::default()), Bytes::new()) {
                    Ok(dr) => {
                        let _ = timeout(DISCONNECT_GRACE, sink.send(dr)).await;
                    }
                    Err(e) => tracing::debug!(error = %e, "Could not build disconnect request"),
                }
                let _ = timeout(DISCONNECT_GRACE, sink.close()).await;
                tracing::info!("S7 session closed");
                self.publish_lifecycle(ConnectionState::Closed);
            }
            SessionExit::TransportLost => {
                tracing::warn!(reason, "S7 transport lost");
                self.publish_lifecycle(ConnectionState::Failed);
            }
        }
    }

    /// Send one job and wait for its reply.
    ///
    /// Fails fast with `ErrNotConnected` unless the session is `Ready`, and
    /// with `ErrInvalidParam` when the encoded PDU exceeds the negotiated size.
    /// The request timeout runs from this call, including any wait for a
    /// free window slot.
    pub async fn submit(&self, body: &S7Body) -> Result<S7Pdu> {
        if !self.is_ready() {
            return Err(Error::ErrNotConnected);
        }
        let ctx = self.context().ok_or(Error::ErrNotConnected)?;
        let pdu = body.to_pdu(0)?;
        if pdu.encoded_len(&()) > ctx.pdu_size as usize {
            return Err(Error::ErrInvalidParam);
        }

        let deadline = Instant::now() + self.config.request_timeout;
        let semaphore = self
            .request_semaphore
            .load_full()
            .ok_or(Error::ErrNotConnected)?;
        let permit = timeout_at(
            tokio::time::Instant::from_std(deadline),
            semaphore.acquire_owned(),
        )
        .await
        .map_err(|_| Error::ErrRequestTimeout)?
        .map_err(|_| Error::ErrNotConnected)?;
        let sender = self.request_tx.load_full().ok_or(Error::ErrNotConnected)?;

        let (response_tx, response_rx) = oneshot::channel();
        timeout_at(
            tokio::time::Instant::from_std(deadline),
            sender.send(SessionRequest {
                pdu,
                deadline,
                response_tx,
                permit,
            }),
        )
        .await
        .map_err(|_| Error::ErrRequestTimeout)?
        .map_err(|_| Error::ErrNotConnected)?;
        let reply = response_rx.await.map_err(|_| Error::ErrNotConnected)??;
        reply.check_header()?;
        Ok(reply)
    }

    fn planner_config(&self) -> Result<PlannerConfig> {
        let ctx = self.context().ok_or(Error::ErrNotConnected)?;
        Ok(PlannerConfig::new(ctx.pdu_size)
            .with_max_items_per_request(self.config.max_items_per_request))
    }

    /// Read any number of variables, splitting into as many PDUs as needed.
    ///
    /// Batches run concurrently up to the negotiated window; results come
    /// back in input order with per-item return codes.
    pub async fn read_var(&self, specs: &[S7VarSpec]) -> Result<ReadMerged> {
        let plan = S7Planner::plan_read(&self.planner_config()?, specs)?;
        tracing::debug!(
            items = specs.len(),
            batches = plan.batches.len(),
            "Planned S7 read"
        );
        let replies = join_all(plan.batches.iter().map(|batch| self.read_batch(batch))).await;
        let replies = replies.into_iter().collect::<Result<Vec<_>>>()?;
        plan.merge(&replies)
    }

    async fn read_batch(&self, batch: &[S7VarSpec]) -> Result<Vec<DataItem>> {
        let reply = self
            .submit(&S7Body::ReadVarRequest(batch.to_vec()))
            .await?;
        match reply.decode()? {
            S7Body::ReadVarResponse(items) if items.len() == batch.len() => Ok(items),
            _ => Err(Error::ErrUnexpectedPdu),
        }
    }

    /// Write any number of items; one return code per input item
    pub async fn write_var(&self, items: &[WriteItem]) -> Result<Vec<S7ReturnCode>> {
        let plan = S7Planner::plan_write(&self.planner_config()?, items)?;
        tracing::debug!(
            items = items.len(),
            batches = plan.batches.len(),
            "Planned S7 write"
        );
        let replies = join_all(plan.batches.iter().map(|batch| self.write_batch(batch))).await;
        let replies = replies.into_iter().collect::<Result<Vec<_>>>()?;
        plan.merge(&replies)
    }

    async fn write_batch(&self, batch: &[WriteItem]) -> Result<Vec<S7ReturnCode>> {
        let reply = self
            .submit(&S7Body::WriteVarRequest(batch.to_vec()))
            .await?;
        match reply.decode()? {
            S7Body::WriteVarResponse(codes) if codes.len() == batch.len() => Ok(codes),
            _ => Err(Error::ErrUnexpectedPdu),
        }
    }

    /// Run a user-data request, following continuations until the last data unit
    pub async fn user_data(&self, request: S7Body) -> Result<Bytes> {
        let mut reply = self.submit(&request).await?;
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut total = 0usize;
        loop {
            let (param, data) = match reply.decode()? {
                S7Body::UserData { param, data } => (param, data),
                _ => return Err(Error::ErrUnexpectedPdu),
            };
            param.check_error()?;
            if let Some(item) = data {
                if !item.return_code.is_success() {
                    return Err(Error::ItemRejected {
                        code: item.return_code,
                    });
                }
                total += item.data.len();
                if total > self.config.max_reassembly_bytes {
                    return Err(Error::ProtocolViolation {
                        context: "user-data reply exceeds reassembly ceiling",
                    });
                }
                chunks.push(item.data);
            }
            if param.last_data_unit {
                break;
            }
            tracing::trace!(sequence = param.sequence_number, "Requesting next user-data unit");
            reply = self.submit(&continuation_request(&param)).await?;
        }
        Ok(match chunks.as_slice() {
            [single] => single.clone(),
            _ => {
                let mut joined = BytesMut::with_capacity(total);
                for chunk in &chunks {
                    joined.extend_from_slice(chunk);
                }
                joined.freeze()
            }
        })
    }

    pub async fn read_block_info(&self, block_type: BlockType, number: u16) -> Result<BlockInfo> {
        let data = self.user_data(block_info_request(block_type, number)).await?;
        BlockInfo::parse(&data)
    }

    pub async fn read_pending_alarms(&self) -> Result<Vec<Alarm>> {
        let data = self.user_data(alarm_query_request()).await?;
        parse_alarms(&data)
    }

    pub async fn read_clock(&self) -> Result<NaiveDateTime> {
        let data = self.user_data(read_clock_request()).await?;
        parse_clock(&data)
    }
}

async fn open_transport(config: &SessionConfig) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in lookup_host((config.host.as_str(), config.port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(config.keep_alive)?;
        if let Some(size) = config.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(config.tcp_nodelay)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "TCP connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => Error::Io(e),
        None => Error::InvalidConfiguration("host"),
    })
}

/// Combine requested and granted setup values; the smaller one wins.
fn negotiate_context(
    config: &SessionConfig,
    frame_size: usize,
    granted: SetupCommunication,
) -> Result<ConnectionContext> {
    if granted.pdu_size > config.pdu_size {
        tracing::warn!(
            requested = config.pdu_size,
            granted = granted.pdu_size,
            "Peer granted a larger PDU size, keeping the requested one"
        );
    }
    let pdu_size = granted.pdu_size.min(config.pdu_size);
    if pdu_size < MIN_PDU_SIZE {
        return Err(Error::HandshakeRejected {
            context: "negotiated PDU size below 240",
        });
    }
    Ok(ConnectionContext {
        local_tsap: config.tsap.local,
        remote_tsap: config.tsap.remote,
        frame_size,
        pdu_size,
        max_amq_calling: granted.amq_calling.min(config.amq_calling).max(1),
        max_amq_called: granted.amq_called.min(config.amq_called).max(1),
    })
}
