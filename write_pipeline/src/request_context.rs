use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use write_lib::{BoxedWriterHandle, WriteError, WriteRequestDescriptor, WriteResult};

use crate::packet_queue::PacketQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TerminalState {
    None = 0,
    Completing = 1,
    Cancelling = 2,
    Erroring = 3,
}

impl TerminalState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TerminalState::Completing,
            2 => TerminalState::Cancelling,
            3 => TerminalState::Erroring,
            _ => TerminalState::None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TerminalState::None)
    }
}

/// Single-assignment terminal flag shared by the handler and the packet writer.
///
/// The first completion trigger wins; later close/error/eof events are no-ops.
/// Only the packet writer may overwrite it, to force the error path after a
/// storage failure.
#[derive(Debug)]
pub struct TerminalSignal {
    state: AtomicU8,
    reason: Mutex<Option<WriteError>>,
}

impl Default for TerminalSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSignal {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TerminalState::None as u8),
            reason: Mutex::new(None),
        }
    }

    pub fn get(&self) -> TerminalState {
        TerminalState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn try_set(&self, state: TerminalState) -> bool {
        self.state
            .compare_exchange(
                TerminalState::None as u8,
                state as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn try_set_error(&self, err: WriteError) -> bool {
        let mut reason = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.try_set(TerminalState::Erroring) {
            return false;
        }
        *reason = Some(err);
        true
    }

    pub(crate) fn force_error(&self, err: WriteError) {
        let mut reason = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        self.state
            .store(TerminalState::Erroring as u8, Ordering::SeqCst);
        *reason = Some(err);
    }

    pub fn reason(&self) -> Option<WriteError> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Per-request state. Created by the handler, then owned by the request's
/// packet writer; the handler keeps only the queue and the terminal signal.
pub struct RequestContext {
    request_id: u64,
    descriptor: WriteRequestDescriptor,
    current_position: u64,
    bytes_reserved: u64,
    writer: Option<BoxedWriterHandle>,
    writer_created: bool,
    queue: Arc<PacketQueue>,
    signal: Arc<TerminalSignal>,
}

impl RequestContext {
    pub fn new(
        request_id: u64,
        descriptor: WriteRequestDescriptor,
        queue: Arc<PacketQueue>,
        signal: Arc<TerminalSignal>,
    ) -> Self {
        Self {
            request_id,
            descriptor,
            current_position: 0,
            bytes_reserved: 0,
            writer: None,
            writer_created: false,
            queue,
            signal,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn descriptor(&self) -> &WriteRequestDescriptor {
        &self.descriptor
    }

    pub fn position(&self) -> u64 {
        self.current_position
    }

    pub fn advance(&mut self, len: u64) {
        self.current_position += len;
    }

    pub fn bytes_reserved(&self) -> u64 {
        self.bytes_reserved
    }

    pub fn set_bytes_reserved(&mut self, bytes_reserved: u64) {
        self.bytes_reserved = bytes_reserved;
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.queue.buffered_bytes()
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    pub fn signal(&self) -> &Arc<TerminalSignal> {
        &self.signal
    }

    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }

    /// At most one writer handle is ever attached to a request.
    pub fn set_writer(&mut self, writer: BoxedWriterHandle) -> WriteResult<()> {
        if self.writer_created {
            return Err(WriteError::InvalidState(format!(
                "request {} already created a writer",
                self.request_id
            )));
        }
        self.writer_created = true;
        self.writer = Some(writer);
        Ok(())
    }

    pub fn writer_mut(&mut self) -> WriteResult<&mut BoxedWriterHandle> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer),
            None => Err(WriteError::InvalidState(format!(
                "request {} has no writer",
                self.request_id
            ))),
        }
    }

    /// Detaches the writer for a terminal action; later calls return `None`.
    pub fn take_writer(&mut self) -> Option<BoxedWriterHandle> {
        self.writer.take()
    }
}
