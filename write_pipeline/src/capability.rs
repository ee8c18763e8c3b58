use async_trait::async_trait;
use write_lib::{BoxedWriterHandle, RequestType, WriteRequestDescriptor, WriteResult};

/// How a request ended, as seen by the storage-facing hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    Completed,
    Cancelled,
}

/// The storage-facing operations a write flavor plugs into the generic engine.
///
/// Implementations only supply storage calls; ordering, flow control and the
/// choice of terminal action stay with the engine.
#[async_trait]
pub trait WriteCapability: Send + Sync + 'static {
    /// The message type tag this flavor serves.
    fn request_type(&self) -> RequestType;

    /// Minimum reservation step, never smaller than one storage buffer unit.
    fn reserve_increment(&self) -> u64;

    async fn open_writer(
        &self,
        descriptor: &WriteRequestDescriptor,
    ) -> WriteResult<BoxedWriterHandle>;

    async fn reserve(
        &self,
        descriptor: &WriteRequestDescriptor,
        additional_bytes: u64,
    ) -> WriteResult<()>;

    /// Only called on the error-cleanup path.
    async fn cleanup_session(&self, descriptor: &WriteRequestDescriptor) -> WriteResult<()>;

    fn record_bytes_written(&self, bytes: u64);

    /// Called once after a complete or cancel path finished, to settle
    /// reservations. Failures are logged by the engine and never change the
    /// request outcome.
    async fn finish(
        &self,
        _descriptor: &WriteRequestDescriptor,
        _kind: FinishKind,
        _bytes_written: u64,
        _bytes_reserved: u64,
    ) -> WriteResult<()> {
        Ok(())
    }
}
