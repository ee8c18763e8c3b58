use async_trait::async_trait;
use log::debug;
use write_lib::{WriteError, WriteMessage};

use crate::packet_writer::RequestOutcome;
use crate::write_handler::MessageOutcome;

/// A per-channel protocol handler that can be chained with handlers for other
/// message types.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn accept_message(&self, msg: &WriteMessage) -> bool;
    fn on_message(&mut self, msg: WriteMessage) -> MessageOutcome;
    fn on_channel_closed(&mut self);
    fn on_error(&mut self, err: WriteError);
    fn is_reading_paused(&self) -> bool;
    async fn wait_read_ready(&self);
    async fn join(&self) -> Option<RequestOutcome>;
}

/// Offers each inbound message to its handlers in order; the first one that
/// accepts it consumes it.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Box<dyn MessageHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handler: Box<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Returns the message back when no handler accepts it.
    pub fn dispatch(&mut self, msg: WriteMessage) -> Result<MessageOutcome, WriteMessage> {
        match self.handlers.iter_mut().find(|h| h.accept_message(&msg)) {
            Some(handler) => Ok(handler.on_message(msg)),
            None => {
                debug!(
                    "HandlerChain: no handler for {} message of request {}",
                    msg.body.name(),
                    msg.request_id
                );
                Err(msg)
            }
        }
    }

    pub fn on_channel_closed(&mut self) {
        for handler in self.handlers.iter_mut() {
            handler.on_channel_closed();
        }
    }

    pub fn on_error(&mut self, err: WriteError) {
        for handler in self.handlers.iter_mut() {
            handler.on_error(err.clone());
        }
    }

    pub fn is_reading_paused(&self) -> bool {
        self.handlers.iter().any(|h| h.is_reading_paused())
    }

    /// Resolves once no handler asks for reads to be paused.
    pub async fn wait_read_ready(&self) {
        while self.is_reading_paused() {
            for handler in self.handlers.iter() {
                handler.wait_read_ready().await;
            }
        }
    }

    /// Waits for every handler's current request to reach its outcome.
    pub async fn join_all(&self) -> Vec<RequestOutcome> {
        let mut outcomes = Vec::new();
        for handler in self.handlers.iter() {
            if let Some(outcome) = handler.join().await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }
}
