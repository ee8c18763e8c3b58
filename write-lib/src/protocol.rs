use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ErrorCode, WriteError, WritePipelineConfig, WriteResult};

/// Write flavor tag. A handler only consumes messages of the type it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Block,
    UfsFile,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Block => "block",
            RequestType::UfsFile => "ufs_file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Identifies what a write request targets. Immutable once the request begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequestDescriptor {
    pub session_id: SessionId,
    #[serde(alias = "file_id")]
    pub target_id: String,
    #[serde(alias = "ufs_path")]
    pub destination_path: String,
    pub request_type: RequestType,
    #[serde(default)]
    pub declared_length: Option<u64>,
}

impl WriteRequestDescriptor {
    pub fn new(
        session_id: SessionId,
        target_id: impl Into<String>,
        destination_path: impl Into<String>,
        request_type: RequestType,
    ) -> Self {
        Self {
            session_id,
            target_id: target_id.into(),
            destination_path: destination_path.into(),
            request_type,
            declared_length: None,
        }
    }

    pub fn with_declared_length(mut self, length: u64) -> Self {
        self.declared_length = Some(length);
        self
    }

    /// Checks identifier and path limits before any request state is created.
    pub fn validate(&self, config: &WritePipelineConfig) -> WriteResult<()> {
        if self.target_id.is_empty() {
            return Err(WriteError::ProtocolViolation(
                "target id is empty".to_string(),
            ));
        }
        if self.target_id.len() > config.max_target_id_len {
            return Err(WriteError::ProtocolViolation(format!(
                "target id too long: {} > {}",
                self.target_id.len(),
                config.max_target_id_len
            )));
        }
        if self.target_id.contains('/') || self.target_id.contains('\0') {
            return Err(WriteError::ProtocolViolation(format!(
                "target id contains illegal characters: {:?}",
                self.target_id
            )));
        }

        if self.destination_path.len() > config.max_path_len {
            return Err(WriteError::ProtocolViolation(format!(
                "destination path too long: {} > {}",
                self.destination_path.len(),
                config.max_path_len
            )));
        }
        let mut components = 0usize;
        for component in self.destination_path.split('/').filter(|c| !c.is_empty()) {
            if component == ".." {
                return Err(WriteError::ProtocolViolation(format!(
                    "destination path escapes its root: {}",
                    self.destination_path
                )));
            }
            if component.len() > config.max_component_len {
                return Err(WriteError::ProtocolViolation(format!(
                    "path component name too long: {} > {}",
                    component.len(),
                    config.max_component_len
                )));
            }
            components += 1;
        }
        if components == 0 {
            return Err(WriteError::ProtocolViolation(
                "destination path is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// A byte range tagged with its logical start position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub position: u64,
    pub payload: Bytes,
}

impl DataChunk {
    pub fn new(position: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            position,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn end(&self) -> u64 {
        self.position + self.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Open(WriteRequestDescriptor),
    Data {
        position: u64,
        length: u64,
        payload: Bytes,
    },
    Flush,
    EndOfStream,
    Cancel,
}

impl MessageBody {
    pub fn name(&self) -> &'static str {
        match self {
            MessageBody::Open(_) => "open",
            MessageBody::Data { .. } => "data",
            MessageBody::Flush => "flush",
            MessageBody::EndOfStream => "eof",
            MessageBody::Cancel => "cancel",
        }
    }
}

/// An inbound write-protocol message as decoded by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMessage {
    pub request_type: RequestType,
    pub request_id: u64,
    pub body: MessageBody,
}

impl WriteMessage {
    pub fn open(request_id: u64, descriptor: WriteRequestDescriptor) -> Self {
        Self {
            request_type: descriptor.request_type,
            request_id,
            body: MessageBody::Open(descriptor),
        }
    }

    pub fn data(
        request_type: RequestType,
        request_id: u64,
        position: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        Self {
            request_type,
            request_id,
            body: MessageBody::Data {
                position,
                length: payload.len() as u64,
                payload,
            },
        }
    }

    pub fn flush(request_type: RequestType, request_id: u64) -> Self {
        Self {
            request_type,
            request_id,
            body: MessageBody::Flush,
        }
    }

    pub fn end_of_stream(request_type: RequestType, request_id: u64) -> Self {
        Self {
            request_type,
            request_id,
            body: MessageBody::EndOfStream,
        }
    }

    pub fn cancel(request_type: RequestType, request_id: u64) -> Self {
        Self {
            request_type,
            request_id,
            body: MessageBody::Cancel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseKind {
    Completed { bytes_written: u64 },
    Flushed { offset: u64 },
    Cancelled { bytes_written: u64 },
    Failed { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub request_id: u64,
    #[serde(flatten)]
    pub kind: ResponseKind,
}

impl WriteResponse {
    pub fn completed(request_id: u64, bytes_written: u64) -> Self {
        Self {
            request_id,
            kind: ResponseKind::Completed { bytes_written },
        }
    }

    pub fn flushed(request_id: u64, offset: u64) -> Self {
        Self {
            request_id,
            kind: ResponseKind::Flushed { offset },
        }
    }

    pub fn cancelled(request_id: u64, bytes_written: u64) -> Self {
        Self {
            request_id,
            kind: ResponseKind::Cancelled { bytes_written },
        }
    }

    pub fn failed(request_id: u64, err: &WriteError) -> Self {
        Self {
            request_id,
            kind: ResponseKind::Failed {
                code: err.code(),
                message: err.to_string(),
            },
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match &self.kind {
            ResponseKind::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, ResponseKind::Flushed { .. })
    }
}
