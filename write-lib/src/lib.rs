mod config;
mod protocol;
mod sink;

pub use config::*;
pub use protocol::*;
pub use sink::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("out of order write: expected offset {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),
    #[error("storage I/O error: {0}")]
    StorageIo(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl WriteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            WriteError::OutOfOrder { .. } => ErrorCode::OutOfOrderWrite,
            WriteError::ProtocolViolation(_) | WriteError::Decode(_) => {
                ErrorCode::ProtocolViolation
            }
            WriteError::CapacityExhausted(_) => ErrorCode::CapacityExhausted,
            WriteError::StorageIo(_) => ErrorCode::StorageFailure,
            WriteError::Cancelled => ErrorCode::Cancelled,
            WriteError::Unsupported(_) => ErrorCode::Unsupported,
            WriteError::InvalidConfig(_) | WriteError::InvalidState(_) => ErrorCode::Internal,
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::OutOfOrderWrite | ErrorCode::ProtocolViolation
        )
    }
}

pub type WriteResult<T> = std::result::Result<T, WriteError>;

impl From<std::io::Error> for WriteError {
    fn from(err: std::io::Error) -> Self {
        WriteError::StorageIo(err.to_string())
    }
}

/// Error code carried back to the client in a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    OutOfOrderWrite,
    ProtocolViolation,
    CapacityExhausted,
    StorageFailure,
    Cancelled,
    Unsupported,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::OutOfOrderWrite => "out_of_order_write",
            ErrorCode::ProtocolViolation => "protocol_violation",
            ErrorCode::CapacityExhausted => "capacity_exhausted",
            ErrorCode::StorageFailure => "storage_failure",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::Internal => "internal",
        }
    }
}
