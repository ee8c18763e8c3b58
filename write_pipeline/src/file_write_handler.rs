use std::sync::Arc;

use async_trait::async_trait;
use write_lib::{
    BoxedWriterHandle, MetricsSink, RequestType, SessionTracker, SpaceReserver, StorageSink,
    WritePipelineConfig, WriteRequestDescriptor, WriteResult,
};

use crate::capability::{FinishKind, WriteCapability};
use crate::write_handler::WriteRequestHandler;

pub const BLOCK_BYTES_WRITTEN_METRIC: &str = "worker_bytes_written_block";
pub const UFS_BYTES_WRITTEN_METRIC: &str = "worker_bytes_written_ufs";

pub fn bytes_written_metric(request_type: RequestType) -> &'static str {
    match request_type {
        RequestType::Block => BLOCK_BYTES_WRITTEN_METRIC,
        RequestType::UfsFile => UFS_BYTES_WRITTEN_METRIC,
    }
}

/// Block/file writes: file-backed writers, space reserved in the tiered store
/// ahead of the write cursor, a bytes-written counter and session cleanup on
/// failure.
pub struct FileWriteCapability {
    request_type: RequestType,
    sink: Arc<dyn StorageSink>,
    space: Arc<dyn SpaceReserver>,
    sessions: Arc<dyn SessionTracker>,
    metrics: Arc<dyn MetricsSink>,
    reserve_increment: u64,
}

impl FileWriteCapability {
    pub fn new(
        request_type: RequestType,
        sink: Arc<dyn StorageSink>,
        space: Arc<dyn SpaceReserver>,
        sessions: Arc<dyn SessionTracker>,
        metrics: Arc<dyn MetricsSink>,
        config: &WritePipelineConfig,
    ) -> Self {
        Self {
            request_type,
            sink,
            space,
            sessions,
            metrics,
            reserve_increment: config.effective_reserve_increment(),
        }
    }
}

#[async_trait]
impl WriteCapability for FileWriteCapability {
    fn request_type(&self) -> RequestType {
        self.request_type
    }

    fn reserve_increment(&self) -> u64 {
        self.reserve_increment
    }

    async fn open_writer(
        &self,
        descriptor: &WriteRequestDescriptor,
    ) -> WriteResult<BoxedWriterHandle> {
        self.sink
            .open_writer(&descriptor.target_id, &descriptor.destination_path)
            .await
    }

    async fn reserve(
        &self,
        descriptor: &WriteRequestDescriptor,
        additional_bytes: u64,
    ) -> WriteResult<()> {
        self.space
            .reserve(
                descriptor.session_id,
                &descriptor.target_id,
                additional_bytes,
            )
            .await
    }

    async fn cleanup_session(&self, descriptor: &WriteRequestDescriptor) -> WriteResult<()> {
        self.sessions.cleanup_session(descriptor.session_id).await
    }

    fn record_bytes_written(&self, bytes: u64) {
        self.metrics
            .inc_counter(bytes_written_metric(self.request_type), bytes);
    }

    async fn finish(
        &self,
        descriptor: &WriteRequestDescriptor,
        kind: FinishKind,
        bytes_written: u64,
        bytes_reserved: u64,
    ) -> WriteResult<()> {
        if bytes_reserved == 0 {
            return Ok(());
        }
        match kind {
            FinishKind::Completed => {
                self.space
                    .settle(descriptor.session_id, &descriptor.target_id, bytes_written)
                    .await
            }
            FinishKind::Cancelled => {
                self.space
                    .release(descriptor.session_id, &descriptor.target_id)
                    .await
            }
        }
    }
}

pub type FileWriteHandler = WriteRequestHandler<FileWriteCapability>;
