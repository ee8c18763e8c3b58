use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use write_lib::{
    DataChunk, MessageBody, WriteError, WriteMessage, WritePipelineConfig, WriteRequestDescriptor,
    WriteResponse, WriteResult,
};

use crate::capability::WriteCapability;
use crate::handler_chain::MessageHandler;
use crate::packet_queue::{Packet, PacketQueue, Watermarks};
use crate::packet_writer::{PacketWriter, RequestOutcome};
use crate::request_context::{RequestContext, TerminalSignal, TerminalState};
use crate::writer_pool::WriterPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Active,
    Completing,
    Cancelling,
    Erroring,
    Closed,
}

/// What the handler did with one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A new request context and its packet writer were created.
    Started,
    Enqueued,
    /// A terminal signal was raised for the active request.
    Signalled,
    /// Late, duplicate or otherwise inapplicable; acknowledged as a no-op.
    Dropped,
    /// Refused with an error response.
    Rejected,
}

struct ActiveRequest {
    request_id: u64,
    queue: Arc<PacketQueue>,
    signal: Arc<TerminalSignal>,
    outcome_rx: watch::Receiver<Option<RequestOutcome>>,
}

impl ActiveRequest {
    fn is_finished(&self) -> bool {
        self.outcome_rx.borrow().is_some()
    }

    /// Raises an error for the request and wakes its packet writer.
    fn fail(&self, err: WriteError) -> bool {
        if self.signal.try_set_error(err) {
            self.queue.interrupt();
            return true;
        }
        false
    }
}

/// Waits for a request's terminal outcome without polling.
#[derive(Clone)]
pub struct CompletionWatcher {
    request_id: u64,
    outcome_rx: watch::Receiver<Option<RequestOutcome>>,
}

impl CompletionWatcher {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn outcome(&self) -> Option<RequestOutcome> {
        self.outcome_rx.borrow().clone()
    }

    pub async fn wait(&mut self, timeout: Duration) -> WriteResult<RequestOutcome> {
        let request_id = self.request_id;
        match tokio::time::timeout(timeout, self.outcome_rx.wait_for(Option::is_some)).await {
            Err(_) => Err(WriteError::InvalidState(format!(
                "request {} did not finish within {:?}",
                request_id, timeout
            ))),
            Ok(Err(_)) => Err(WriteError::InvalidState(format!(
                "packet writer of request {} stopped without an outcome",
                request_id
            ))),
            Ok(Ok(outcome)) => (*outcome).clone().ok_or_else(|| {
                WriteError::InvalidState(format!("request {} has no outcome", request_id))
            }),
        }
    }
}

/// Owns the read side of one channel for one write flavor.
///
/// Runs on the network event loop and never blocks: it classifies messages,
/// creates request contexts, pushes packets into the request's queue and
/// raises terminal signals. Everything else about a request belongs to its
/// packet writer. Requests on a channel are served one at a time.
pub struct WriteRequestHandler<C: WriteCapability> {
    capability: Arc<C>,
    config: WritePipelineConfig,
    pool: WriterPool,
    responses: mpsc::UnboundedSender<WriteResponse>,
    active: Option<ActiveRequest>,
    /// Ids of requests that already reached an outcome on this channel.
    finished_ids: HashSet<u64>,
    channel_closed: bool,
}

impl<C: WriteCapability> WriteRequestHandler<C> {
    pub fn new(
        capability: Arc<C>,
        config: WritePipelineConfig,
        pool: WriterPool,
        responses: mpsc::UnboundedSender<WriteResponse>,
    ) -> WriteResult<Self> {
        config.validate()?;
        Ok(Self {
            capability,
            config,
            pool,
            responses,
            active: None,
            finished_ids: HashSet::new(),
            channel_closed: false,
        })
    }

    pub fn capability(&self) -> &Arc<C> {
        &self.capability
    }

    pub fn state(&self) -> HandlerState {
        match &self.active {
            None if self.channel_closed => HandlerState::Closed,
            None => HandlerState::Idle,
            Some(active) if active.is_finished() => HandlerState::Closed,
            Some(active) => match active.signal.get() {
                TerminalState::None => HandlerState::Active,
                TerminalState::Completing => HandlerState::Completing,
                TerminalState::Cancelling => HandlerState::Cancelling,
                TerminalState::Erroring => HandlerState::Erroring,
            },
        }
    }

    /// Whether this handler serves the message's write flavor. Never consumes
    /// the message.
    pub fn accept_message(&self, msg: &WriteMessage) -> bool {
        msg.request_type == self.capability.request_type()
    }

    pub fn on_message(&mut self, msg: WriteMessage) -> MessageOutcome {
        if !self.accept_message(&msg) {
            return MessageOutcome::Rejected;
        }
        let request_id = msg.request_id;
        match msg.body {
            MessageBody::Open(descriptor) => self.open_request(request_id, descriptor),
            MessageBody::Data {
                position,
                length,
                payload,
            } => {
                let max_chunk_size = self.config.max_chunk_size;
                let Some(active) = self.running_request(request_id) else {
                    debug!(
                        "WriteRequestHandler: drop data for inactive request {}",
                        request_id
                    );
                    return MessageOutcome::Dropped;
                };
                let actual = payload.len() as u64;
                if actual != length || actual > max_chunk_size {
                    active.fail(WriteError::ProtocolViolation(format!(
                        "chunk at offset {} declares {} bytes, carries {}, limit {}",
                        position, length, actual, max_chunk_size
                    )));
                    return MessageOutcome::Rejected;
                }
                if active.queue.push(Packet::Data(DataChunk::new(position, payload))) {
                    MessageOutcome::Enqueued
                } else {
                    MessageOutcome::Dropped
                }
            }
            MessageBody::Flush => match self.running_request(request_id) {
                Some(active) if active.queue.push(Packet::Flush) => MessageOutcome::Enqueued,
                _ => MessageOutcome::Dropped,
            },
            MessageBody::EndOfStream => self.on_end_of_request(request_id),
            MessageBody::Cancel => self.cancel_request(request_id),
        }
    }

    fn open_request(
        &mut self,
        request_id: u64,
        descriptor: WriteRequestDescriptor,
    ) -> MessageOutcome {
        if self.channel_closed {
            return MessageOutcome::Dropped;
        }
        if self.finished_ids.contains(&request_id) {
            debug!(
                "WriteRequestHandler: drop open for finished request {}",
                request_id
            );
            return MessageOutcome::Dropped;
        }
        if let Some(active) = &self.active {
            if active.request_id == request_id {
                debug!(
                    "WriteRequestHandler: drop duplicate open for request {}",
                    request_id
                );
                return MessageOutcome::Dropped;
            }
            if !active.is_finished() {
                self.respond(WriteResponse::failed(
                    request_id,
                    &WriteError::ProtocolViolation(format!(
                        "request {} is still active on this channel",
                        active.request_id
                    )),
                ));
                return MessageOutcome::Rejected;
            }
        }

        if let Err(err) = self.check_descriptor(&descriptor) {
            warn!(
                "WriteRequestHandler: reject request {} for {}: {}",
                request_id, descriptor.destination_path, err
            );
            self.respond(WriteResponse::failed(request_id, &err));
            return MessageOutcome::Rejected;
        }

        info!(
            "WriteRequestHandler: open {} request {} {} -> {}",
            descriptor.request_type.as_str(),
            request_id,
            descriptor.target_id,
            descriptor.destination_path
        );
        let queue = Arc::new(PacketQueue::new(Watermarks::new(
            self.config.high_watermark_bytes,
            self.config.low_watermark_bytes,
        )));
        let signal = Arc::new(TerminalSignal::new());
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let context = RequestContext::new(request_id, descriptor, queue.clone(), signal.clone());
        let writer = PacketWriter::new(
            context,
            self.capability.clone(),
            self.pool.clone(),
            self.responses.clone(),
            outcome_tx,
        );
        self.pool.spawn(writer.run());
        if let Some(previous) = self.active.take() {
            self.finished_ids.insert(previous.request_id);
        }
        self.active = Some(ActiveRequest {
            request_id,
            queue,
            signal,
            outcome_rx,
        });
        MessageOutcome::Started
    }

    fn check_descriptor(&self, descriptor: &WriteRequestDescriptor) -> WriteResult<()> {
        if descriptor.request_type != self.capability.request_type() {
            return Err(WriteError::ProtocolViolation(format!(
                "descriptor type {} does not match handler type {}",
                descriptor.request_type.as_str(),
                self.capability.request_type().as_str()
            )));
        }
        descriptor.validate(&self.config)
    }

    /// The active request with this id, if it still accepts packets.
    fn running_request(&self, request_id: u64) -> Option<&ActiveRequest> {
        self.active.as_ref().filter(|active| {
            active.request_id == request_id
                && !active.signal.get().is_terminal()
                && !active.is_finished()
        })
    }

    /// Client-signalled completion: the sentinel follows the last data packet.
    pub fn on_end_of_request(&mut self, request_id: u64) -> MessageOutcome {
        let Some(active) = self.running_request(request_id) else {
            return MessageOutcome::Dropped;
        };
        if !active.signal.try_set(TerminalState::Completing) {
            return MessageOutcome::Dropped;
        }
        if active.queue.push(Packet::EndOfStream) {
            MessageOutcome::Enqueued
        } else {
            MessageOutcome::Dropped
        }
    }

    fn cancel_request(&mut self, request_id: u64) -> MessageOutcome {
        let Some(active) = self.running_request(request_id) else {
            return MessageOutcome::Dropped;
        };
        if active.signal.try_set(TerminalState::Cancelling) {
            info!("WriteRequestHandler: client cancelled request {}", request_id);
            active.queue.interrupt();
            return MessageOutcome::Signalled;
        }
        MessageOutcome::Dropped
    }

    /// The transport closed the channel. An unfinished request takes the
    /// cancel path unless it already has a terminal signal.
    pub fn on_channel_closed(&mut self) {
        self.channel_closed = true;
        if let Some(active) = &self.active {
            if active.signal.try_set(TerminalState::Cancelling) {
                info!(
                    "WriteRequestHandler: channel closed, cancel request {}",
                    active.request_id
                );
                active.queue.interrupt();
            }
        }
    }

    /// A channel-level failure. An unfinished request takes the
    /// error-cleanup path unless it already has a terminal signal.
    pub fn on_error(&mut self, err: WriteError) {
        if let Some(active) = &self.active {
            let request_id = active.request_id;
            if active.fail(err.clone()) {
                warn!(
                    "WriteRequestHandler: channel error on request {}: {}",
                    request_id, err
                );
            }
        }
    }

    /// True while the active request's queue is over its high watermark and
    /// has not yet drained to the low watermark.
    pub fn is_reading_paused(&self) -> bool {
        match &self.active {
            Some(active) => active.queue.is_reads_paused(),
            None => false,
        }
    }

    pub async fn wait_read_ready(&self) {
        if let Some(active) = &self.active {
            active.queue.wait_reads_resumed().await;
        }
    }

    pub fn buffered_bytes(&self) -> u64 {
        match &self.active {
            Some(active) => active.queue.buffered_bytes(),
            None => 0,
        }
    }

    pub fn completion_watcher(&self) -> Option<CompletionWatcher> {
        self.active.as_ref().map(|active| CompletionWatcher {
            request_id: active.request_id,
            outcome_rx: active.outcome_rx.clone(),
        })
    }

    /// Waits for the current request's packet writer to finish.
    pub async fn join(&self) -> Option<RequestOutcome> {
        let active = self.active.as_ref()?;
        let mut outcome_rx = active.outcome_rx.clone();
        let outcome = match outcome_rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => Some(RequestOutcome::Failed(WriteError::InvalidState(format!(
                "packet writer of request {} stopped without an outcome",
                active.request_id
            )))),
        };
        outcome
    }

    fn respond(&self, response: WriteResponse) {
        if self.responses.send(response).is_err() {
            debug!("WriteRequestHandler: response channel closed");
        }
    }
}

#[async_trait]
impl<C: WriteCapability> MessageHandler for WriteRequestHandler<C> {
    fn accept_message(&self, msg: &WriteMessage) -> bool {
        WriteRequestHandler::accept_message(self, msg)
    }

    fn on_message(&mut self, msg: WriteMessage) -> MessageOutcome {
        WriteRequestHandler::on_message(self, msg)
    }

    fn on_channel_closed(&mut self) {
        WriteRequestHandler::on_channel_closed(self)
    }

    fn on_error(&mut self, err: WriteError) {
        WriteRequestHandler::on_error(self, err)
    }

    fn is_reading_paused(&self) -> bool {
        WriteRequestHandler::is_reading_paused(self)
    }

    async fn wait_read_ready(&self) {
        WriteRequestHandler::wait_read_ready(self).await
    }

    async fn join(&self) -> Option<RequestOutcome> {
        WriteRequestHandler::join(self).await
    }
}
