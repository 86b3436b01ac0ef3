use crate::protocol::{
    error::{Error, Result},
    frame::{
        default_tsap_pair, tpdu_size_code_from_bytes, ConnectionType, CpuType, TsapPair,
    },
    session::{SessionConfig, MIN_PDU_SIZE},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the TSAP pair for the COTP connect is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TsapConfig {
    /// Derive from the CPU family, connection type, rack and slot
    RackSlot { rack: u8, slot: u8 },
    /// Use the given pair verbatim
    Tsap { local: u16, remote: u16 },
}

impl Default for TsapConfig {
    fn default() -> Self {
        TsapConfig::RackSlot { rack: 0, slot: 2 }
    }
}

/// Client configuration.
///
/// Every field has a default, so `{}` and `{"host": "10.0.0.5"}` are valid
/// JSON configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub cpu: CpuType,
    pub tsap: TsapConfig,
    pub connection_type: ConnectionType,
    /// SO_RCVBUF for the socket; OS default when absent
    pub recv_buffer_size: Option<u32>,
    pub keep_alive: bool,
    pub tcp_nodelay: bool,
    /// Reconnect after the transport is lost
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    /// Requested Max AmQ calling; the PLC may grant fewer
    pub max_amq_calling: u16,
    /// Requested Max AmQ called; the PLC may grant fewer
    pub max_amq_called: u16,
    /// Requested S7 PDU size; the PLC may grant less
    pub pdu_size: u16,
    /// Requested COTP TPDU size, a power of two in 128..=8192
    pub tpdu_size: usize,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub send_queue_capacity: usize,
    pub max_items_per_request: usize,
    pub ref_grace_ms: u64,
    pub max_reassembly_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 102,
            cpu: CpuType::default(),
            tsap: TsapConfig::default(),
            connection_type: ConnectionType::default(),
            recv_buffer_size: None,
            keep_alive: true,
            tcp_nodelay: true,
            auto_reconnect: true,
            reconnect_interval_ms: 2_000,
            max_amq_calling: 8,
            max_amq_called: 8,
            pdu_size: 960,
            tpdu_size: 1024,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 3_000,
            send_queue_capacity: 256,
            max_items_per_request: 20,
            ref_grace_ms: 10_000,
            max_reassembly_bytes: 65_536,
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_rack_slot(mut self, rack: u8, slot: u8) -> Self {
        self.tsap = TsapConfig::RackSlot { rack, slot };
        self
    }

    pub fn with_tsap(mut self, local: u16, remote: u16) -> Self {
        self.tsap = TsapConfig::Tsap { local, remote };
        self
    }

    pub fn with_pdu_size(mut self, pdu_size: u16) -> Self {
        self.pdu_size = pdu_size;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool, interval: Duration) -> Self {
        self.auto_reconnect = enabled;
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    #[inline]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Resolve the TSAP pair, validating rack and slot when derived
    pub fn tsap_pair(&self) -> Result<TsapPair> {
        match self.tsap {
            TsapConfig::RackSlot { rack, slot } => {
                default_tsap_pair(self.cpu, self.connection_type, rack, slot)
            }
            TsapConfig::Tsap { local, remote } => Ok(TsapPair::from((local, remote))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfiguration("host"));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfiguration("port"));
        }
        if self.pdu_size < MIN_PDU_SIZE {
            return Err(Error::InvalidConfiguration("pduSize"));
        }
        if tpdu_size_code_from_bytes(self.tpdu_size).is_none() {
            return Err(Error::InvalidConfiguration("tpduSize"));
        }
        if self.max_amq_calling == 0 {
            return Err(Error::InvalidConfiguration("maxAmqCalling"));
        }
        if self.max_amq_called == 0 {
            return Err(Error::InvalidConfiguration("maxAmqCalled"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfiguration("connectTimeoutMs"));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfiguration("requestTimeoutMs"));
        }
        if self.send_queue_capacity == 0 {
            return Err(Error::InvalidConfiguration("sendQueueCapacity"));
        }
        if self.max_items_per_request == 0 {
            return Err(Error::InvalidConfiguration("maxItemsPerRequest"));
        }
        if self.max_reassembly_bytes < self.pdu_size as usize {
            return Err(Error::InvalidConfiguration("maxReassemblyBytes"));
        }
        if self.auto_reconnect && self.reconnect_interval_ms == 0 {
            return Err(Error::InvalidConfiguration("reconnectIntervalMs"));
        }
        if self.recv_buffer_size == Some(0) {
            return Err(Error::InvalidConfiguration("recvBufferSize"));
        }
        self.tsap_pair()?;
        Ok(())
    }

    /// Validate and map onto the per-connection session parameters
    pub fn to_session_config(&self) -> Result<SessionConfig> {
        self.validate()?;
        Ok(SessionConfig {
            host: self.host.clone(),
            port: self.port,
            tsap: self.tsap_pair()?,
            tpdu_size: self.tpdu_size,
            pdu_size: self.pdu_size,
            amq_calling: self.max_amq_calling,
            amq_called: self.max_amq_called,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            send_queue_capacity: self.send_queue_capacity,
            max_items_per_request: self.max_items_per_request,
            ref_grace: Duration::from_millis(self.ref_grace_ms),
            max_reassembly_bytes: self.max_reassembly_bytes,
            keep_alive: self.keep_alive,
            tcp_nodelay: self.tcp_nodelay,
            recv_buffer_size: self.recv_buffer_size,
        })
    }
}
