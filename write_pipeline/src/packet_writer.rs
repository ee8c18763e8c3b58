use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use write_lib::{DataChunk, WriteError, WriteResponse, WriteResult};

use crate::capability::{FinishKind, WriteCapability};
use crate::packet_queue::Packet;
use crate::request_context::{RequestContext, TerminalState};
use crate::writer_pool::WriterPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed { bytes_written: u64 },
    Cancelled { bytes_written: u64 },
    Failed(WriteError),
}

impl RequestOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RequestOutcome::Completed { .. })
    }

    pub fn to_response(&self, request_id: u64) -> WriteResponse {
        match self {
            RequestOutcome::Completed { bytes_written } => {
                WriteResponse::completed(request_id, *bytes_written)
            }
            RequestOutcome::Cancelled { bytes_written } => {
                WriteResponse::cancelled(request_id, *bytes_written)
            }
            RequestOutcome::Failed(err) => WriteResponse::failed(request_id, err),
        }
    }
}

enum TerminalAction {
    Complete,
    Cancel,
    Cleanup(WriteError),
}

/// Drains one request's packet queue into its storage writer, in order, and
/// then runs exactly one terminal action.
pub struct PacketWriter<C: WriteCapability> {
    context: RequestContext,
    capability: Arc<C>,
    pool: WriterPool,
    responses: mpsc::UnboundedSender<WriteResponse>,
    outcome_tx: watch::Sender<Option<RequestOutcome>>,
}

impl<C: WriteCapability> PacketWriter<C> {
    pub fn new(
        context: RequestContext,
        capability: Arc<C>,
        pool: WriterPool,
        responses: mpsc::UnboundedSender<WriteResponse>,
        outcome_tx: watch::Sender<Option<RequestOutcome>>,
    ) -> Self {
        Self {
            context,
            capability,
            pool,
            responses,
            outcome_tx,
        }
    }

    pub async fn run(mut self) -> RequestOutcome {
        let request_id = self.context.request_id();
        let action = self.process_packets().await;

        let discarded = self.context.queue().close();
        if discarded > 0 {
            debug!(
                "PacketWriter: request {} discarded {} queued packets",
                request_id, discarded
            );
        }

        let outcome = self.execute(action).await;
        // the handler sees the request as finished before the client does
        self.outcome_tx.send_replace(Some(outcome.clone()));
        self.respond(outcome.to_response(request_id));
        outcome
    }

    async fn process_packets(&mut self) -> TerminalAction {
        let queue = self.context.queue().clone();
        loop {
            match self.context.signal().get() {
                TerminalState::Cancelling => return TerminalAction::Cancel,
                TerminalState::Erroring => return TerminalAction::Cleanup(self.signal_reason()),
                TerminalState::None | TerminalState::Completing => {}
            }

            let packet = match queue.next().await {
                Some(packet) => packet,
                None => continue,
            };

            match packet {
                Packet::Data(chunk) => {
                    let len = chunk.len();
                    let result = self.write_chunk(chunk).await;
                    queue.release(len);
                    if let Err(err) = result {
                        self.context.signal().force_error(err.clone());
                        return TerminalAction::Cleanup(err);
                    }
                }
                Packet::Flush => {
                    if let Err(err) = self.flush().await {
                        self.context.signal().force_error(err.clone());
                        return TerminalAction::Cleanup(err);
                    }
                    let offset = self.context.position();
                    self.respond(WriteResponse::flushed(self.context.request_id(), offset));
                }
                Packet::EndOfStream => {
                    return match self.context.signal().get() {
                        TerminalState::Cancelling => TerminalAction::Cancel,
                        TerminalState::Erroring => TerminalAction::Cleanup(self.signal_reason()),
                        TerminalState::None | TerminalState::Completing => {
                            TerminalAction::Complete
                        }
                    };
                }
            }
        }
    }

    async fn write_chunk(&mut self, chunk: DataChunk) -> WriteResult<()> {
        let expected = self.context.position();
        if chunk.position != expected {
            return Err(WriteError::OutOfOrder {
                expected,
                actual: chunk.position,
            });
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let len = chunk.len();
        let end = expected + len;
        if let Some(declared) = self.context.descriptor().declared_length {
            if end > declared {
                return Err(WriteError::ProtocolViolation(format!(
                    "write to offset {} exceeds declared length {}",
                    end, declared
                )));
            }
        }

        let reserved = self.context.bytes_reserved();
        if reserved < end {
            let to_reserve = self.capability.reserve_increment().max(end - reserved);
            let _permit = self.pool.acquire().await?;
            self.capability
                .reserve(self.context.descriptor(), to_reserve)
                .await?;
            self.context.set_bytes_reserved(reserved + to_reserve);
        }

        let permit = self.pool.acquire().await?;
        if !self.context.has_writer() {
            let writer = self
                .capability
                .open_writer(self.context.descriptor())
                .await?;
            self.context.set_writer(writer)?;
            debug!(
                "PacketWriter: request {} opened writer for {}",
                self.context.request_id(),
                self.context.descriptor().target_id
            );
        }
        let accepted = self.context.writer_mut()?.append(&chunk.payload).await?;
        drop(permit);

        if accepted as u64 != len {
            return Err(WriteError::StorageIo(format!(
                "partial write at offset {}: {} of {} bytes accepted",
                expected, accepted, len
            )));
        }
        self.capability.record_bytes_written(len);
        self.context.advance(len);
        Ok(())
    }

    async fn flush(&mut self) -> WriteResult<()> {
        if !self.context.has_writer() {
            return Ok(());
        }
        let _permit = self.pool.acquire().await?;
        self.context.writer_mut()?.flush().await
    }

    async fn execute(&mut self, action: TerminalAction) -> RequestOutcome {
        match action {
            TerminalAction::Complete => match self.complete_request().await {
                Ok(()) => {
                    self.finish(FinishKind::Completed).await;
                    info!(
                        "PacketWriter: request {} completed, {} bytes to {}",
                        self.context.request_id(),
                        self.context.position(),
                        self.context.descriptor().destination_path
                    );
                    RequestOutcome::Completed {
                        bytes_written: self.context.position(),
                    }
                }
                Err(err) => {
                    self.context.signal().force_error(err.clone());
                    self.cleanup_request(err).await
                }
            },
            TerminalAction::Cancel => {
                self.cancel_request().await;
                self.finish(FinishKind::Cancelled).await;
                info!(
                    "PacketWriter: request {} cancelled after {} bytes",
                    self.context.request_id(),
                    self.context.position()
                );
                RequestOutcome::Cancelled {
                    bytes_written: self.context.position(),
                }
            }
            TerminalAction::Cleanup(err) => self.cleanup_request(err).await,
        }
    }

    async fn complete_request(&mut self) -> WriteResult<()> {
        if let Some(declared) = self.context.descriptor().declared_length {
            if self.context.position() != declared {
                return Err(WriteError::ProtocolViolation(format!(
                    "request ended at offset {} but declared length is {}",
                    self.context.position(),
                    declared
                )));
            }
        }
        if !self.context.has_writer() {
            return Ok(());
        }

        let _permit = self.pool.acquire().await?;
        self.context.writer_mut()?.commit().await?;
        match self.context.take_writer() {
            Some(mut writer) => writer.close().await,
            None => Ok(()),
        }
    }

    async fn cancel_request(&mut self) {
        if let Some(mut writer) = self.context.take_writer() {
            let _permit = self.pool.acquire().await.ok();
            if let Err(err) = writer.close().await {
                warn!(
                    "PacketWriter: close writer of cancelled request {} failed: {}",
                    self.context.request_id(),
                    err
                );
            }
        }
    }

    async fn cleanup_request(&mut self, err: WriteError) -> RequestOutcome {
        warn!(
            "PacketWriter: request {} failed at offset {}: {}",
            self.context.request_id(),
            self.context.position(),
            err
        );
        let _permit = self.pool.acquire().await.ok();
        if let Err(cleanup_err) = self
            .capability
            .cleanup_session(self.context.descriptor())
            .await
        {
            warn!(
                "PacketWriter: cleanup {} failed: {}",
                self.context.descriptor().session_id,
                cleanup_err
            );
        }
        if let Some(mut writer) = self.context.take_writer() {
            if let Err(abort_err) = writer.abort().await {
                error!(
                    "PacketWriter: abort writer of request {} failed: {}",
                    self.context.request_id(),
                    abort_err
                );
            }
        }
        RequestOutcome::Failed(err)
    }

    async fn finish(&mut self, kind: FinishKind) {
        if let Err(err) = self
            .capability
            .finish(
                self.context.descriptor(),
                kind,
                self.context.position(),
                self.context.bytes_reserved(),
            )
            .await
        {
            warn!(
                "PacketWriter: settle reservation of request {} failed: {}",
                self.context.request_id(),
                err
            );
        }
    }

    fn signal_reason(&self) -> WriteError {
        self.context
            .signal()
            .reason()
            .unwrap_or_else(|| WriteError::InvalidState("request marked as failed".to_string()))
    }

    fn respond(&self, response: WriteResponse) {
        if self.responses.send(response).is_err() {
            debug!(
                "PacketWriter: response channel closed, request {}",
                self.context.request_id()
            );
        }
    }
}
