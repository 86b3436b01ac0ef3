//! Blocking facade over the async client.
//!
//! Every call has the same semantics as its async counterpart. The client
//! owns a small tokio runtime that keeps the connection's IO loop running
//! between calls; do not use it from inside another async runtime.

use crate::{
    client,
    config::ClientConfig,
    protocol::{
        error::Result,
        frame::{
            Alarm, BlockInfo, BlockType, S7Area, S7ReturnCode, S7TransportSize, S7VarSpec,
            WriteItem,
        },
        planner::ReadItemMerged,
        session::{ConnectionContext, ConnectionState},
    },
};
use bytes::Bytes;
use chrono::NaiveDateTime;
use tokio::{
    runtime::{Builder, Runtime},
    sync::watch,
};

#[derive(Debug)]
pub struct S7Client {
    inner: client::S7Client,
    runtime: Runtime,
}

impl S7Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let inner = client::S7Client::new(config)?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("s7-client-io")
            .enable_all()
            .build()?;
        Ok(Self { inner, runtime })
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.config()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.subscribe_state()
    }

    pub fn context(&self) -> Option<ConnectionContext> {
        self.inner.context()
    }

    pub fn connect(&self) -> Result<()> {
        self.runtime.block_on(self.inner.connect())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.runtime.block_on(self.inner.disconnect())
    }

    pub fn read(
        &self,
        area: S7Area,
        db_number: u16,
        offset: u32,
        transport_size: S7TransportSize,
        count: u16,
    ) -> Result<Bytes> {
        self.runtime.block_on(
            self.inner
                .read(area, db_number, offset, transport_size, count),
        )
    }

    pub fn read_bit(&self, area: S7Area, db_number: u16, offset: u32, bit: u8) -> Result<bool> {
        self.runtime
            .block_on(self.inner.read_bit(area, db_number, offset, bit))
    }

    pub fn read_multi(&self, specs: &[S7VarSpec]) -> Result<Vec<ReadItemMerged>> {
        self.runtime.block_on(self.inner.read_multi(specs))
    }

    pub fn write(&self, area: S7Area, db_number: u16, offset: u32, data: Bytes) -> Result<()> {
        self.runtime
            .block_on(self.inner.write(area, db_number, offset, data))
    }

    pub fn write_bit(
        &self,
        area: S7Area,
        db_number: u16,
        offset: u32,
        bit: u8,
        value: bool,
    ) -> Result<()> {
        self.runtime
            .block_on(self.inner.write_bit(area, db_number, offset, bit, value))
    }

    pub fn write_multi(&self, items: &[WriteItem]) -> Result<Vec<S7ReturnCode>> {
        self.runtime.block_on(self.inner.write_multi(items))
    }

    pub fn read_block_info(&self, block_type: BlockType, number: u16) -> Result<BlockInfo> {
        self.runtime
            .block_on(self.inner.read_block_info(block_type, number))
    }

    pub fn read_pending_alarms(&self) -> Result<Vec<Alarm>> {
        self.runtime.block_on(self.inner.read_pending_alarms())
    }

    pub fn read_clock(&self) -> Result<NaiveDateTime> {
        self.runtime.block_on(self.inner.read_clock())
    }
}

impl Drop for S7Client {
    fn drop(&mut self) {
        let _ = self.runtime.block_on(self.inner.disconnect());
    }
}
