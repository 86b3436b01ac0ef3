use crate::{
    config::ClientConfig,
    protocol::{
        error::{Error, Result},
        frame::{
            Alarm, BlockInfo, BlockType, S7Area, S7ReturnCode, S7TransportSize, S7VarSpec,
            WriteItem,
        },
        framer::PolicyRegistry,
        planner::ReadItemMerged,
        session::{ConnectionContext, ConnectionState, Session, SessionConfig, SessionEvent},
    },
    supervisor::{ReconnectPolicy, Supervisor, SupervisorLinks},
};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::NaiveDateTime;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::instrument;

/// Asynchronous S7 client.
///
/// One client drives one logical connection. Operations fail immediately
/// with [`Error::ErrNotConnected`] unless the connection is `Ready`; they
/// may be issued concurrently and are bounded by the negotiated window.
#[derive(Debug)]
pub struct S7Client {
    config: Arc<ClientConfig>,
    session_config: Arc<SessionConfig>,
    registry: Arc<PolicyRegistry>,
    supervisor: Mutex<Option<Supervisor>>,
    current: Arc<ArcSwapOption<Session>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl S7Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_registry(config, Arc::new(PolicyRegistry::rfc1006()?))
    }

    /// Use a caller-built policy registry for framing
    pub fn with_registry(config: ClientConfig, registry: Arc<PolicyRegistry>) -> Result<Self> {
        let session_config = Arc::new(config.to_session_config()?);
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(256);
        Ok(Self {
            config: Arc::new(config),
            session_config,
            registry,
            supervisor: Mutex::new(None),
            current: Arc::new(ArcSwapOption::empty()),
            state_tx,
            events_tx,
        })
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Negotiated parameters while `Ready`
    pub fn context(&self) -> Option<ConnectionContext> {
        self.current.load_full().and_then(|session| session.context())
    }

    /// Connect and negotiate; returns once the connection is `Ready`.
    ///
    /// Calling it while connected is a no-op. After a successful connect a
    /// lost transport is re-established in the background when
    /// `autoReconnect` is enabled.
    #[instrument(level = "info", skip_all, fields(host = %self.config.host, port = self.config.port))]
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.supervisor.lock().await;
        if let Some(supervisor) = guard.as_mut() {
            if supervisor.is_running() && self.state().is_ready() {
                return Ok(());
            }
            supervisor.stop().await;
        }
        *guard = None;

        let supervisor = Supervisor::start(
            Arc::clone(&self.session_config),
            Arc::clone(&self.registry),
            ReconnectPolicy {
                enabled: self.config.auto_reconnect,
                interval: self.config.reconnect_interval(),
            },
            SupervisorLinks {
                current: Arc::clone(&self.current),
                state_tx: self.state_tx.clone(),
                events_tx: self.events_tx.clone(),
            },
        )
        .await?;
        *guard = Some(supervisor);
        Ok(())
    }

    /// Close the connection; pending jobs fail with `ErrNotConnected` and no
    /// reconnect follows.
    #[instrument(level = "info", skip_all)]
    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.supervisor.lock().await;
        if let Some(mut supervisor) = guard.take() {
            supervisor.stop().await;
        }
        Ok(())
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.current
            .load_full()
            .filter(|session| session.is_ready())
            .ok_or(Error::ErrNotConnected)
    }

    /// Read `count` elements of `transport_size` starting at `offset`.
    ///
    /// Reads larger than one PDU are split and reassembled transparently.
    #[instrument(level = "debug", skip_all, fields(area = ?area, db = db_number, offset = offset, count = count))]
    pub async fn read(
        &self,
        area: S7Area,
        db_number: u16,
        offset: u32,
        transport_size: S7TransportSize,
        count: u16,
    ) -> Result<Bytes> {
        let spec = S7VarSpec::new(area, db_number, offset, transport_size, count);
        let mut merged = self.session()?.read_var(&[spec]).await?;
        match merged.pop() {
            Some(item) if item.return_code.is_success() => Ok(item.data),
            Some(item) => Err(Error::ItemRejected {
                code: item.return_code,
            }),
            None => Err(Error::ErrUnexpectedPdu),
        }
    }

    /// Read a single bit
    #[instrument(level = "debug", skip_all, fields(area = ?area, db = db_number, offset = offset, bit = bit))]
    pub async fn read_bit(&self, area: S7Area, db_number: u16, offset: u32, bit: u8) -> Result<bool> {
        let spec = S7VarSpec::bit(area, db_number, offset, bit);
        let mut merged = self.session()?.read_var(&[spec]).await?;
        match merged.pop() {
            Some(item) if item.return_code.is_success() => {
                Ok(item.data.first().is_some_and(|b| b & 0x01 != 0))
            }
            Some(item) => Err(Error::ItemRejected {
                code: item.return_code,
            }),
            None => Err(Error::ErrUnexpectedPdu),
        }
    }

    /// Read several variables; one result per spec, in input order
    #[instrument(level = "debug", skip_all, fields(items = specs.len()))]
    pub async fn read_multi(&self, specs: &[S7VarSpec]) -> Result<Vec<ReadItemMerged>> {
        self.session()?.read_var(specs).await
    }

    /// Write `data` as bytes starting at `offset`
    #[instrument(level = "debug", skip_all, fields(area = ?area, db = db_number, offset = offset, len = data.len()))]
    pub async fn write(&self, area: S7Area, db_number: u16, offset: u32, data: Bytes) -> Result<()> {
        if data.len() > u16::MAX as usize {
            return Err(Error::ErrInvalidParam);
        }
        let item = WriteItem::bytes(area, db_number, offset, data);
        let codes = self.session()?.write_var(&[item]).await?;
        match codes.first() {
            Some(code) if code.is_success() => Ok(()),
            Some(code) => Err(Error::ItemRejected { code: *code }),
            None => Err(Error::ErrUnexpectedPdu),
        }
    }

    /// Write a single bit
    #[instrument(level = "debug", skip_all, fields(area = ?area, db = db_number, offset = offset, bit = bit))]
    pub async fn write_bit(
        &self,
        area: S7Area,
        db_number: u16,
        offset: u32,
        bit: u8,
        value: bool,
    ) -> Result<()> {
        let item = WriteItem {
            spec: S7VarSpec::bit(area, db_number, offset, bit),
            data: Bytes::copy_from_slice(&[value as u8]),
        };
        let codes = self.session()?.write_var(&[item]).await?;
        match codes.first() {
            Some(code) if code.is_success() => Ok(()),
            Some(code) => Err(Error::ItemRejected { code: *code }),
            None => Err(Error::ErrUnexpectedPdu),
        }
    }

    /// Write several items; one return code per item, in input order
    #[instrument(level = "debug", skip_all, fields(items = items.len()))]
    pub async fn write_multi(&self, items: &[WriteItem]) -> Result<Vec<S7ReturnCode>> {
        self.session()?.write_var(items).await
    }

    #[instrument(level = "debug", skip_all, fields(block_type = ?block_type, number = number))]
    pub async fn read_block_info(&self, block_type: BlockType, number: u16) -> Result<BlockInfo> {
        self.session()?.read_block_info(block_type, number).await
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn read_pending_alarms(&self) -> Result<Vec<Alarm>> {
        self.session()?.read_pending_alarms().await
    }

    /// PLC wall clock
    #[instrument(level = "debug", skip_all)]
    pub async fn read_clock(&self) -> Result<NaiveDateTime> {
        self.session()?.read_clock().await
    }
}
