use serde::{Deserialize, Serialize};

use crate::{WriteError, WriteResult};

pub const DEFAULT_FILE_BUFFER_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WritePipelineConfig {
    /// Buffer-size unit of the storage layer; reservations never go below it.
    #[serde(alias = "buffer_size")]
    pub file_buffer_size: u64,
    /// Minimum reservation step. 0 means one `file_buffer_size`.
    pub reserve_increment: u64,
    /// Reads from the transport pause once buffered bytes exceed this.
    #[serde(alias = "high_watermark")]
    pub high_watermark_bytes: u64,
    /// Paused reads resume once buffered bytes drop to this.
    #[serde(alias = "low_watermark")]
    pub low_watermark_bytes: u64,
    pub max_chunk_size: u64,
    pub max_path_len: usize,
    pub max_component_len: usize,
    pub max_target_id_len: usize,
    pub writer_threads: usize,
    pub max_concurrent_writes: usize,
}

impl Default for WritePipelineConfig {
    fn default() -> Self {
        Self {
            file_buffer_size: DEFAULT_FILE_BUFFER_SIZE,
            reserve_increment: 0,
            high_watermark_bytes: 8 * 1024 * 1024,
            low_watermark_bytes: 4 * 1024 * 1024,
            max_chunk_size: 4 * 1024 * 1024,
            max_path_len: 4096,
            max_component_len: 255,
            max_target_id_len: 255,
            writer_threads: 4,
            max_concurrent_writes: 16,
        }
    }
}

impl WritePipelineConfig {
    pub fn validate(&self) -> WriteResult<()> {
        if self.file_buffer_size == 0 {
            return Err(WriteError::InvalidConfig(
                "file_buffer_size must be positive".to_string(),
            ));
        }
        if self.max_chunk_size == 0 || self.high_watermark_bytes == 0 {
            return Err(WriteError::InvalidConfig(
                "max_chunk_size and high_watermark_bytes must be positive".to_string(),
            ));
        }
        if self.low_watermark_bytes >= self.high_watermark_bytes {
            return Err(WriteError::InvalidConfig(format!(
                "low watermark {} must be below high watermark {}",
                self.low_watermark_bytes, self.high_watermark_bytes
            )));
        }
        if self.max_chunk_size > self.high_watermark_bytes {
            return Err(WriteError::InvalidConfig(format!(
                "max_chunk_size {} exceeds high watermark {}",
                self.max_chunk_size, self.high_watermark_bytes
            )));
        }
        if self.writer_threads == 0 || self.max_concurrent_writes == 0 {
            return Err(WriteError::InvalidConfig(
                "writer_threads and max_concurrent_writes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn effective_reserve_increment(&self) -> u64 {
        self.reserve_increment.max(self.file_buffer_size)
    }
}
