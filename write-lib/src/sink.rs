use async_trait::async_trait;

use crate::{SessionId, WriteResult};

/// Sequential append handle for one write target.
///
/// A handle is owned by exactly one request. `commit` makes the appended bytes
/// visible under the target identifier, `close` releases the handle without
/// publishing anything, `abort` actively discards partial state.
#[async_trait]
pub trait WriterHandle: Send {
    /// Returns the number of bytes accepted; anything short of `data.len()` is
    /// a failed write for the caller.
    async fn append(&mut self, data: &[u8]) -> WriteResult<usize>;
    async fn flush(&mut self) -> WriteResult<()>;
    async fn commit(&mut self) -> WriteResult<()>;
    async fn close(&mut self) -> WriteResult<()>;
    async fn abort(&mut self) -> WriteResult<()>;
}

pub type BoxedWriterHandle = Box<dyn WriterHandle>;

#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn open_writer(
        &self,
        target_id: &str,
        destination_path: &str,
    ) -> WriteResult<BoxedWriterHandle>;
}

/// Temporary space accounting in the tiered store.
#[async_trait]
pub trait SpaceReserver: Send + Sync {
    /// Fails with `WriteError::CapacityExhausted` when no tier can hold the bytes.
    async fn reserve(
        &self,
        session_id: SessionId,
        target_id: &str,
        additional_bytes: u64,
    ) -> WriteResult<()>;

    /// Shrinks the reservation of a committed target down to the bytes kept.
    async fn settle(
        &self,
        _session_id: SessionId,
        _target_id: &str,
        _kept_bytes: u64,
    ) -> WriteResult<()> {
        Ok(())
    }

    /// Returns the whole reservation of a target that was never committed.
    async fn release(&self, _session_id: SessionId, _target_id: &str) -> WriteResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait SessionTracker: Send + Sync {
    async fn cleanup_session(&self, session_id: SessionId) -> WriteResult<()>;
}

/// Named counters. Recording must never fail a write, so there is no error path.
pub trait MetricsSink: Send + Sync {
    fn inc_counter(&self, name: &str, value: u64);
}

/// Metrics sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_counter(&self, _name: &str, _value: u64) {}
}
