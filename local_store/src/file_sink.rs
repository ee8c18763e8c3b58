use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fs2::FileExt;
use log::{debug, info, warn};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use write_lib::{BoxedWriterHandle, StorageSink, WriteError, WriteResult, WriterHandle};

/// File-backed storage: every writer appends to its own tmp file, `commit`
/// renames it into the data directory.
pub struct LocalFileSink {
    root: PathBuf,
    next_seq: AtomicU64,
}

impl LocalFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Destination paths always resolve under the data directory.
    pub fn final_path(&self, destination_path: &str) -> PathBuf {
        self.data_dir()
            .join(destination_path.trim_start_matches('/'))
    }

    fn tmp_path(&self, target_id: &str) -> PathBuf {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.tmp_dir().join(format!("{}.{}.tmp", target_id, seq))
    }
}

#[async_trait]
impl StorageSink for LocalFileSink {
    async fn open_writer(
        &self,
        target_id: &str,
        destination_path: &str,
    ) -> WriteResult<BoxedWriterHandle> {
        let tmp_path = self.tmp_path(target_id);
        fs::create_dir_all(self.tmp_dir()).await.map_err(|e| {
            warn!("open_writer: create tmp dir failed! {}", e);
            WriteError::StorageIo(e.to_string())
        })?;

        let file = File::create(&tmp_path).await.map_err(|e| {
            warn!("open_writer: create file failed! {}", e);
            WriteError::StorageIo(e.to_string())
        })?;
        let std_file = file.into_std().await;
        std_file.try_lock_exclusive().map_err(|e| {
            warn!("open_writer: lock file failed! {}", e);
            WriteError::StorageIo(e.to_string())
        })?;

        debug!(
            "open_writer: {} -> {}",
            target_id,
            tmp_path.to_string_lossy()
        );
        Ok(Box::new(LocalFileWriter {
            target_id: target_id.to_string(),
            tmp_path,
            final_path: self.final_path(destination_path),
            file: Some(File::from_std(std_file)),
            state: WriterState::Open,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Committed,
    Aborted,
    Closed,
}

pub struct LocalFileWriter {
    target_id: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
    state: WriterState,
}

impl LocalFileWriter {
    fn open_file(&mut self) -> WriteResult<&mut File> {
        match (self.state, self.file.as_mut()) {
            (WriterState::Open, Some(file)) => Ok(file),
            (state, _) => Err(WriteError::InvalidState(format!(
                "writer of {} is {:?}",
                self.target_id, state
            ))),
        }
    }
}

#[async_trait]
impl WriterHandle for LocalFileWriter {
    async fn append(&mut self, data: &[u8]) -> WriteResult<usize> {
        let file = self.open_file()?;
        file.write_all(data).await.map_err(|e| {
            warn!("append: write file failed! {}", e);
            WriteError::StorageIo(e.to_string())
        })?;
        Ok(data.len())
    }

    async fn flush(&mut self) -> WriteResult<()> {
        let file = self.open_file()?;
        file.flush().await?;
        Ok(())
    }

    async fn commit(&mut self) -> WriteResult<()> {
        let file = self.open_file()?;
        file.flush().await?;
        file.sync_all().await.map_err(|e| {
            warn!("commit: sync file failed! {}", e);
            WriteError::StorageIo(e.to_string())
        })?;

        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!("commit: create dir failed! {}", e);
                WriteError::StorageIo(e.to_string())
            })?;
        }
        // hard_link refuses an existing target
        fs::hard_link(&self.tmp_path, &self.final_path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    WriteError::StorageIo(format!(
                        "target file already exists: {}",
                        self.final_path.to_string_lossy()
                    ))
                } else {
                    warn!("commit: link file failed! {}", e);
                    WriteError::StorageIo(e.to_string())
                }
            })?;
        if let Err(e) = fs::remove_file(&self.tmp_path).await {
            warn!(
                "commit: remove tmp file {} failed! {}",
                self.tmp_path.to_string_lossy(),
                e
            );
        }

        self.state = WriterState::Committed;
        info!(
            "commit: {} -> {}",
            self.target_id,
            self.final_path.to_string_lossy()
        );
        Ok(())
    }

    /// Releases the file. Uncommitted bytes stay in the tmp file.
    async fn close(&mut self) -> WriteResult<()> {
        self.file.take();
        if self.state == WriterState::Open {
            self.state = WriterState::Closed;
            debug!(
                "close: {} left incomplete at {}",
                self.target_id,
                self.tmp_path.to_string_lossy()
            );
        }
        Ok(())
    }

    async fn abort(&mut self) -> WriteResult<()> {
        if self.state == WriterState::Committed {
            return Err(WriteError::InvalidState(format!(
                "writer of {} is already committed",
                self.target_id
            )));
        }
        self.file.take();
        self.state = WriterState::Aborted;
        match fs::remove_file(&self.tmp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("abort: remove file failed! {}", e);
                Err(WriteError::StorageIo(e.to_string()))
            }
        }
    }
}
