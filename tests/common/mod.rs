#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use s7_client::protocol::{
    codec::Codec,
    frame::{
        item::encode_data_items, segment_pdu, ConnectParams, Cotp, CpuFunctionGroup, DataItem,
        DisconnectParams, S7Area, S7Body, S7DataVariableType, S7Frame, S7Pdu, S7ReturnCode,
        SetupCommunication, UserDataParam, WireDecode,
    },
    framer::PolicyRegistry,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::codec::Framed;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Behaviour knobs of the simulated PLC
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// PDU size granted in the setup-communication reply
    pub grant_pdu_size: u16,
    pub grant_amq: u16,
    /// Largest TPDU size code the mock accepts
    pub max_tpdu_code: u8,
    /// Delay before each job reply
    pub reply_delay: Duration,
    /// Answer every job with a stray reply first
    pub misroute: bool,
    /// Leave this many read jobs unanswered
    pub swallow_reads: usize,
    /// Leave the first read job touching this byte offset unanswered
    pub swallow_read_at: Option<u32>,
    /// Answer the connection request with a disconnect request
    pub reject_connect: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            grant_pdu_size: 480,
            grant_amq: 8,
            max_tpdu_code: 0x0A,
            reply_delay: Duration::ZERO,
            misroute: false,
            swallow_reads: 0,
            swallow_read_at: None,
            reject_connect: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockStats {
    pub connections: AtomicUsize,
    pub read_pdus: AtomicUsize,
    pub write_pdus: AtomicUsize,
    pub user_data_pdus: AtomicUsize,
    pub inflight: AtomicUsize,
    pub max_inflight: AtomicUsize,
    /// (src, dst) TSAPs seen in connection requests
    pub connect_tsaps: Mutex<Vec<(Option<u16>, Option<u16>)>>,
    pub setup_requests: Mutex<Vec<SetupCommunication>>,
}

impl MockStats {
    fn job_started(&self) {
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(now, Ordering::SeqCst);
    }

    fn job_finished(&self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process S7 server answering over the crate's own codec
pub struct MockPlc {
    pub addr: SocketAddr,
    pub stats: Arc<MockStats>,
    memory: Arc<Mutex<HashMap<u16, Vec<u8>>>>,
    kick_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockPlc {
    pub async fn start(options: MockOptions) -> MockPlc {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(MockStats::default());
        let memory = Arc::new(Mutex::new(HashMap::new()));
        let (kick_tx, _) = broadcast::channel(4);
        let registry = Arc::new(PolicyRegistry::rfc1006().unwrap());
        let options = Arc::new(options);
        let swallowed = Arc::new(AtomicUsize::new(0));
        let swallowed_at = Arc::new(AtomicBool::new(false));

        let task = {
            let stats = Arc::clone(&stats);
            let memory = Arc::clone(&memory);
            let kick_tx = kick_tx.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    stats.connections.fetch_add(1, Ordering::SeqCst);
                    let conn = Connection {
                        options: Arc::clone(&options),
                        stats: Arc::clone(&stats),
                        memory: Arc::clone(&memory),
                        swallowed: Arc::clone(&swallowed),
                        swallowed_at: Arc::clone(&swallowed_at),
                    };
                    tokio::spawn(conn.serve(stream, Arc::clone(&registry), kick_tx.subscribe()));
                }
            })
        };

        MockPlc {
            addr,
            stats,
            memory,
            kick_tx,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Drop every open connection
    pub fn kick(&self) {
        let _ = self.kick_tx.send(());
    }

    pub fn db(&self, number: u16) -> Vec<u8> {
        self.memory
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fill_db(&self, number: u16, data: &[u8]) {
        self.memory.lock().unwrap().insert(number, data.to_vec());
    }
}

impl Drop for MockPlc {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.kick_tx.send(());
    }
}

#[derive(Clone)]
struct Connection {
    options: Arc<MockOptions>,
    stats: Arc<MockStats>,
    memory: Arc<Mutex<HashMap<u16, Vec<u8>>>>,
    swallowed: Arc<AtomicUsize>,
    swallowed_at: Arc<AtomicBool>,
}

impl Connection {
    async fn serve(
        self,
        stream: TcpStream,
        registry: Arc<PolicyRegistry>,
        mut kick_rx: broadcast::Receiver<()>,
    ) {
        let framed = Framed::new(stream, Codec::new(registry));
        let (mut sink, mut stream) = framed.split();
        let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<S7Frame>>(64);
        let writer = tokio::spawn(async move {
            while let Some(frames) = reply_rx.recv().await {
                for frame in frames {
                    if sink.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        });

        let mut frame_size = 1usize << self.options.max_tpdu_code;
        let mut partial = BytesMut::new();
        loop {
            let msg = tokio::select! {
                _ = kick_rx.recv() => break,
                msg = stream.next() => match msg {
                    Some(Ok(msg)) => msg,
                    _ => break,
                },
            };
            let frame = msg.frame().unwrap();
            match frame.cotp {
                Cotp::Cr(cr) => {
                    self.stats
                        .connect_tsaps
                        .lock()
                        .unwrap()
                        .push((cr.src_tsap, cr.dst_tsap));
                    let reply = if self.options.reject_connect {
                        Cotp::Dr(DisconnectParams::default())
                    } else {
                        let code = cr
                            .tpdu_size
                            .unwrap_or(self.options.max_tpdu_code)
                            .min(self.options.max_tpdu_code);
                        frame_size = 1usize << code;
                        Cotp::Cc(ConnectParams {
                            dst_ref: cr.src_ref,
                            src_ref: 0x0044,
                            class_option: 0,
                            tpdu_size: Some(code),
                            src_tsap: cr.src_tsap,
                            dst_tsap: cr.dst_tsap,
                        })
                    };
                    let cc = S7Frame::new(reply, Bytes::new()).unwrap();
                    let _ = reply_tx.send(vec![cc]).await;
                }
                Cotp::Dt(dt) => {
                    partial.extend_from_slice(&frame.payload);
                    if !dt.eot {
                        continue;
                    }
                    let raw = partial.split().freeze();
                    let (_, pdu) = S7Pdu::parse(&raw, &raw, &()).unwrap();
                    let conn = self.clone();
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        conn.answer(pdu, frame_size, reply_tx).await;
                    });
                }
                Cotp::Dr(_) => break,
                _ => {}
            }
        }
        writer.abort();
    }

    async fn answer(self, pdu: S7Pdu, frame_size: usize, reply_tx: mpsc::Sender<Vec<S7Frame>>) {
        let pdu_ref = pdu.pdu_ref();
        let body = pdu.decode().unwrap();
        if let S7Body::SetupRequest(setup) = body {
            self.stats.setup_requests.lock().unwrap().push(setup);
            let granted = S7Body::SetupResponse(SetupCommunication {
                amq_calling: self.options.grant_amq,
                amq_called: self.options.grant_amq,
                pdu_size: self.options.grant_pdu_size,
            });
            send(&reply_tx, granted.to_pdu(pdu_ref).unwrap(), frame_size).await;
            return;
        }

        self.stats.job_started();
        if !self.options.reply_delay.is_zero() {
            sleep(self.options.reply_delay).await;
        }
        let reply = match body {
            S7Body::ReadVarRequest(specs) => {
                self.stats.read_pdus.fetch_add(1, Ordering::SeqCst);
                if self.swallowed.load(Ordering::SeqCst) < self.options.swallow_reads {
                    self.swallowed.fetch_add(1, Ordering::SeqCst);
                    self.stats.job_finished();
                    return;
                }
                let targeted = self.options.swallow_read_at.is_some_and(|offset| {
                    specs.iter().any(|spec| spec.byte_address == offset)
                });
                if targeted && !self.swallowed_at.swap(true, Ordering::SeqCst) {
                    self.stats.job_finished();
                    return;
                }
                let memory = self.memory.lock().unwrap();
                let items = specs
                    .iter()
                    .map(|spec| {
                        if spec.area != S7Area::DB {
                            return DataItem::failed(S7ReturnCode::AddressOutOfRange);
                        }
                        let start = spec.byte_address as usize;
                        let mut data = vec![0u8; spec.byte_len()];
                        if let Some(db) = memory.get(&spec.db_number) {
                            for (idx, byte) in data.iter_mut().enumerate() {
                                *byte = db.get(start + idx).copied().unwrap_or(0);
                            }
                        }
                        DataItem::ok(spec.transport_size.data_variable_type(), Bytes::from(data))
                    })
                    .collect();
                S7Body::ReadVarResponse(items)
            }
            S7Body::WriteVarRequest(items) => {
                self.stats.write_pdus.fetch_add(1, Ordering::SeqCst);
                let mut memory = self.memory.lock().unwrap();
                let codes = items
                    .iter()
                    .map(|item| {
                        if item.spec.area != S7Area::DB {
                            return S7ReturnCode::AccessDenied;
                        }
                        let db = memory.entry(item.spec.db_number).or_default();
                        let start = item.spec.byte_address as usize;
                        let end = start + item.data.len();
                        if db.len() < end {
                            db.resize(end, 0);
                        }
                        db[start..end].copy_from_slice(&item.data);
                        S7ReturnCode::Success
                    })
                    .collect();
                S7Body::WriteVarResponse(codes)
            }
            S7Body::UserData { param, .. } => {
                self.stats.user_data_pdus.fetch_add(1, Ordering::SeqCst);
                user_data_reply(&param)
            }
            other => panic!("mock PLC got unexpected body {other:?}"),
        };
        self.stats.job_finished();

        if self.options.misroute {
            let stray = reply.to_pdu(pdu_ref.wrapping_add(1000)).unwrap();
            send(&reply_tx, stray, frame_size).await;
        }
        send(&reply_tx, reply.to_pdu(pdu_ref).unwrap(), frame_size).await;
    }
}

async fn send(reply_tx: &mpsc::Sender<Vec<S7Frame>>, pdu: S7Pdu, frame_size: usize) {
    let frames = segment_pdu(pdu.to_bytes().unwrap(), frame_size).unwrap();
    let _ = reply_tx.send(frames).await;
}

/// Sequence number the mock hands out for multi-unit user-data replies
pub const ALARM_SEQUENCE: u8 = 0x05;

fn user_data_reply(param: &UserDataParam) -> S7Body {
    let octets = |data: Vec<u8>| {
        Some(DataItem::ok(
            S7DataVariableType::OctetString,
            Bytes::from(data),
        ))
    };
    match param.group {
        CpuFunctionGroup::BlockFunctions => S7Body::UserData {
            param: UserDataParam::response(param.group, param.subfunction, 0, true),
            data: octets(block_info_bytes()),
        },
        // alarms come back in two data units
        CpuFunctionGroup::CpuFunctions => {
            let all = [alarm_object(0x0001_0002), alarm_object(0x0003_0004)].concat();
            let split = all.len() / 2 + 3;
            if param.sequence_number == 0 {
                S7Body::UserData {
                    param: UserDataParam::response(
                        param.group,
                        param.subfunction,
                        ALARM_SEQUENCE,
                        false,
                    ),
                    data: octets(all[..split].to_vec()),
                }
            } else {
                assert_eq!(param.sequence_number, ALARM_SEQUENCE);
                S7Body::UserData {
                    param: UserDataParam::response(
                        param.group,
                        param.subfunction,
                        ALARM_SEQUENCE,
                        true,
                    ),
                    data: octets(all[split..].to_vec()),
                }
            }
        }
        CpuFunctionGroup::TimeFunctions => S7Body::UserData {
            param: UserDataParam::response(param.group, param.subfunction, 0, true),
            data: octets(vec![
                0x00, 0x20, 0x24, 0x03, 0x15, 0x10, 0x20, 0x30, 0x12, 0x36,
            ]),
        },
        other => panic!("mock PLC has no user-data group {other:?}"),
    }
}

fn block_info_bytes() -> Vec<u8> {
    let mut raw = vec![0u8; 78];
    raw[9] = 0x01;
    raw[10] = 0x05;
    raw[11] = 0x0A;
    raw[12..14].copy_from_slice(&250u16.to_be_bytes());
    raw[14..18].copy_from_slice(&1234u32.to_be_bytes());
    raw[40..42].copy_from_slice(&1000u16.to_be_bytes());
    raw[42..50].copy_from_slice(b"MOCK\0\0\0\0");
    raw[66] = 0x11;
    raw
}

fn alarm_object(event_id: u32) -> Vec<u8> {
    let mut body = vec![0x00, 0x00, 0x34];
    body.extend_from_slice(&event_id.to_be_bytes());
    body.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    body.extend_from_slice(&[0x24, 0x03, 0x15, 0x10, 0x20, 0x30, 0x00, 0x06]);
    body.push(1);
    let mut values = BytesMut::new();
    encode_data_items(
        &[DataItem::ok(
            S7DataVariableType::OctetString,
            Bytes::from_static(&[0xAB, 0xCD]),
        )],
        &mut values,
    )
    .unwrap();
    body.extend_from_slice(&values);
    let mut object = vec![body.len() as u8];
    object.extend(body);
    object
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn client_config(plc: &MockPlc) -> s7_client::ClientConfig {
    s7_client::ClientConfig::new("127.0.0.1")
        .with_port(plc.port())
        .with_tsap(0x0100, 0x0300)
}
