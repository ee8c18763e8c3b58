//! Length-prefixed frames carried over a worker connection.
//!
//! ```text
//! | magic 0x57 | ver 0x01 | header_len u32 BE | payload_len u32 BE | JSON header | payload |
//! ```
//!
//! Requests carry a [`WireHeader`]; responses carry a `WriteResponse` and an
//! empty payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use write_lib::{
    MessageBody, RequestType, WriteError, WriteMessage, WriteRequestDescriptor, WriteResponse,
    WriteResult,
};

pub const FRAME_MAGIC: u8 = 0x57;
pub const FRAME_VERSION: u8 = 0x01;
pub const FIXED_HEADER_LEN: usize = 10;
pub const MAX_HEADER_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireBody {
    Open {
        descriptor: WriteRequestDescriptor,
    },
    Data {
        offset: u64,
        /// Defaults to the payload size.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        length: Option<u64>,
    },
    Flush,
    Eof,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    pub request_type: RequestType,
    pub request_id: u64,
    #[serde(flatten)]
    pub body: WireBody,
}

impl WireHeader {
    pub fn from_message(msg: &WriteMessage) -> (Self, Bytes) {
        let (body, payload) = match &msg.body {
            MessageBody::Open(descriptor) => (
                WireBody::Open {
                    descriptor: descriptor.clone(),
                },
                Bytes::new(),
            ),
            MessageBody::Data {
                position,
                length,
                payload,
            } => (
                WireBody::Data {
                    offset: *position,
                    length: Some(*length),
                },
                payload.clone(),
            ),
            MessageBody::Flush => (WireBody::Flush, Bytes::new()),
            MessageBody::EndOfStream => (WireBody::Eof, Bytes::new()),
            MessageBody::Cancel => (WireBody::Cancel, Bytes::new()),
        };
        (
            Self {
                request_type: msg.request_type,
                request_id: msg.request_id,
                body,
            },
            payload,
        )
    }

    pub fn into_message(self, payload: Bytes) -> WriteMessage {
        let body = match self.body {
            WireBody::Open { descriptor } => MessageBody::Open(descriptor),
            WireBody::Data { offset, length } => MessageBody::Data {
                position: offset,
                length: length.unwrap_or(payload.len() as u64),
                payload,
            },
            WireBody::Flush => MessageBody::Flush,
            WireBody::Eof => MessageBody::EndOfStream,
            WireBody::Cancel => MessageBody::Cancel,
        };
        WriteMessage {
            request_type: self.request_type,
            request_id: self.request_id,
            body,
        }
    }
}

async fn write_frame<W>(stream: &mut W, header: &[u8], payload: &[u8]) -> WriteResult<()>
where
    W: AsyncWrite + Unpin,
{
    let header_len = u32::try_from(header.len())
        .map_err(|_| WriteError::Decode("frame header exceeds 4 GiB".to_string()))?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| WriteError::Decode("frame payload exceeds 4 GiB".to_string()))?;

    let mut fixed = [0u8; FIXED_HEADER_LEN];
    fixed[0] = FRAME_MAGIC;
    fixed[1] = FRAME_VERSION;
    fixed[2..6].copy_from_slice(&header_len.to_be_bytes());
    fixed[6..10].copy_from_slice(&payload_len.to_be_bytes());

    stream.write_all(&fixed).await?;
    stream.write_all(header).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one frame. `None` means the peer closed the stream at a frame
/// boundary.
async fn read_frame<R>(stream: &mut R, max_payload: u64) -> WriteResult<Option<(Vec<u8>, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let magic = match stream.read_u8().await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if magic != FRAME_MAGIC {
        return Err(WriteError::Decode(format!(
            "bad frame magic: expected 0x{:02X}, got 0x{:02X}",
            FRAME_MAGIC, magic
        )));
    }

    let mut fixed = [0u8; FIXED_HEADER_LEN - 1];
    stream.read_exact(&mut fixed).await?;
    if fixed[0] != FRAME_VERSION {
        return Err(WriteError::Decode(format!(
            "unsupported frame version: {}",
            fixed[0]
        )));
    }
    let header_len = u32::from_be_bytes([fixed[1], fixed[2], fixed[3], fixed[4]]) as usize;
    let payload_len = u32::from_be_bytes([fixed[5], fixed[6], fixed[7], fixed[8]]) as u64;
    if header_len > MAX_HEADER_LEN {
        return Err(WriteError::Decode(format!(
            "frame header too large: {} > {}",
            header_len, MAX_HEADER_LEN
        )));
    }
    if payload_len > max_payload {
        return Err(WriteError::Decode(format!(
            "frame payload too large: {} > {}",
            payload_len, max_payload
        )));
    }

    let mut header = vec![0u8; header_len];
    stream.read_exact(&mut header).await?;
    let mut payload = vec![0u8; payload_len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Some((header, Bytes::from(payload))))
}

pub async fn write_message<W>(stream: &mut W, msg: &WriteMessage) -> WriteResult<()>
where
    W: AsyncWrite + Unpin,
{
    let (header, payload) = WireHeader::from_message(msg);
    let header = serde_json::to_vec(&header)
        .map_err(|e| WriteError::Decode(format!("encode frame header failed: {}", e)))?;
    write_frame(stream, &header, &payload).await
}

pub async fn read_message<R>(stream: &mut R, max_payload: u64) -> WriteResult<Option<WriteMessage>>
where
    R: AsyncRead + Unpin,
{
    let Some((header, payload)) = read_frame(stream, max_payload).await? else {
        return Ok(None);
    };
    let header: WireHeader = serde_json::from_slice(&header)
        .map_err(|e| WriteError::Decode(format!("decode frame header failed: {}", e)))?;
    Ok(Some(header.into_message(payload)))
}

pub async fn write_response<W>(stream: &mut W, response: &WriteResponse) -> WriteResult<()>
where
    W: AsyncWrite + Unpin,
{
    let header = serde_json::to_vec(response)
        .map_err(|e| WriteError::Decode(format!("encode response failed: {}", e)))?;
    write_frame(stream, &header, &[]).await
}

pub async fn read_response<R>(stream: &mut R) -> WriteResult<Option<WriteResponse>>
where
    R: AsyncRead + Unpin,
{
    let Some((header, _)) = read_frame(stream, 0).await? else {
        return Ok(None);
    };
    let response = serde_json::from_slice(&header)
        .map_err(|e| WriteError::Decode(format!("decode response failed: {}", e)))?;
    Ok(Some(response))
}
