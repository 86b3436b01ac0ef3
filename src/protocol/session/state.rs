use super::super::frame::{Tsap, TsapPair};
use std::{net::SocketAddr, time::Duration};

/// Smallest S7 PDU size accepted from configuration or negotiation
pub const MIN_PDU_SIZE: u16 = 240;

/// Connection lifecycle shared by the session and the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection attempt yet
    #[default]
    Idle,
    /// Resolving and opening the TCP socket
    Connecting,
    /// TCP is up, COTP connection request in flight
    TransportOpen,
    /// COTP connected, setup-communication in flight
    Negotiating,
    /// Jobs are accepted
    Ready,
    /// Explicit close in progress
    Closing,
    /// Closed on request; no reconnect follows
    Closed,
    /// Transport lost or handshake failed
    Failed,
}

impl ConnectionState {
    #[inline]
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }

    /// States a single session attempt never leaves on its own
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Parameters negotiated during COTP connect and setup-communication.
///
/// Written once per connection and read-only afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext {
    pub local_tsap: Tsap,
    pub remote_tsap: Tsap,
    /// Granted COTP TPDU size in bytes (COTP header included)
    pub frame_size: usize,
    /// Negotiated S7 PDU size
    pub pdu_size: u16,
    pub max_amq_calling: u16,
    pub max_amq_called: u16,
}

impl ConnectionContext {
    /// Jobs that may be outstanding at once
    #[inline]
    pub fn window(&self) -> usize {
        self.max_amq_calling.min(self.max_amq_called).max(1) as usize
    }
}

/// Session events for observability.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    LifecycleChanged(ConnectionState),
    TransportUp { peer: SocketAddr },
    Negotiated(ConnectionContext),
    TransportDown { reason: &'static str },
    /// Partial COTP PDU dropped after exceeding the reassembly ceiling
    ReassemblyOverflow { bytes: usize },
    /// Reply whose reference matched no pending job
    CorrelationMiss { pdu_ref: u16 },
    RequestTimeout { pdu_ref: u16 },
}

/// Why a session's IO loop stopped after reaching `Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Closed on request
    Closed,
    TransportLost,
}

/// Session configuration for the S7 handshake and runtime behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub tsap: TsapPair,
    /// Requested COTP TPDU size in bytes
    pub tpdu_size: usize,
    /// Requested S7 PDU size
    pub pdu_size: u16,
    pub amq_calling: u16,
    pub amq_called: u16,
    /// Budget for TCP connect, COTP connect and setup-communication together
    pub connect_timeout: Duration,
    /// Per-job deadline
    pub request_timeout: Duration,
    pub send_queue_capacity: usize,
    pub max_items_per_request: usize,
    /// How long a timed-out job reference stays unused
    pub ref_grace: Duration,
    pub max_reassembly_bytes: usize,
    pub keep_alive: bool,
    pub tcp_nodelay: bool,
    pub recv_buffer_size: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 102,
            tsap: TsapPair::from((0x0100, 0x0102)),
            tpdu_size: 1024,
            pdu_size: 960,
            amq_calling: 8,
            amq_called: 8,
            connect_timeout: Duration::from_millis(5_000),
            request_timeout: Duration::from_millis(3_000),
            send_queue_capacity: 256,
            max_items_per_request: 20,
            ref_grace: Duration::from_millis(10_000),
            max_reassembly_bytes: 65_536,
            keep_alive: true,
            tcp_nodelay: true,
            recv_buffer_size: None,
        }
    }
}
