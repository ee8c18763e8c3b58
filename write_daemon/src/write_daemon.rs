use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use write_lib::{RequestType, WriteError, WritePipelineConfig, WriteResponse, WriteResult};
use write_pipeline::{FileWriteCapability, FileWriteHandler, HandlerChain, WriterPool};

use local_store::{LocalFileSink, TierConfig, TieredSpaceManager, WorkerMetrics};

use crate::frame::{read_message, write_response};

pub const DEFAULT_WRITE_DAEMON_CONFIG_PATH: &str = "/opt/buckyos/etc/write_daemon.json";

#[derive(Debug, Clone)]
pub struct WriteDaemonRunOptions {
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriteDaemonConfig {
    #[serde(alias = "listen", alias = "bind_addr")]
    pub listen_addr: String,
    #[serde(alias = "worker")]
    pub worker_id: String,
    #[serde(alias = "store_path", alias = "root_path")]
    pub store_root: PathBuf,
    #[serde(alias = "targets")]
    pub tiers: Vec<TierConfig>,
    /// Write flavors served on every connection, in handler-chain order.
    pub request_types: Vec<RequestType>,
    pub pipeline: WritePipelineConfig,
}

impl Default for WriteDaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:29999".to_string(),
            worker_id: "worker-1".to_string(),
            store_root: PathBuf::from("/opt/buckyos/var/write_daemon"),
            tiers: vec![
                TierConfig::new("mem", 1024 * 1024 * 1024),
                TierConfig::new("ssd", 64 * 1024 * 1024 * 1024),
            ],
            request_types: vec![RequestType::Block, RequestType::UfsFile],
            pipeline: WritePipelineConfig::default(),
        }
    }
}

fn read_json_config<T: DeserializeOwned>(path: &Path) -> WriteResult<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        WriteError::InvalidConfig(format!("read {} failed: {}", path.display(), e))
    })?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| WriteError::InvalidConfig(format!("parse {} failed: {}", path.display(), e)))
}

/// A missing config file means defaults.
pub fn load_config(path: &Path) -> WriteResult<WriteDaemonConfig> {
    let config = if path.exists() {
        read_json_config::<WriteDaemonConfig>(path)?
    } else {
        info!("config {} not found, using defaults", path.display());
        WriteDaemonConfig::default()
    };
    config.pipeline.validate()?;
    if config.request_types.is_empty() {
        return Err(WriteError::InvalidConfig(
            "request_types must not be empty".to_string(),
        ));
    }
    Ok(config)
}

/// One storage worker: the local store plus a handler chain per connection.
pub struct WriteDaemon {
    config: WriteDaemonConfig,
    sink: Arc<LocalFileSink>,
    space: Arc<TieredSpaceManager>,
    metrics: Arc<WorkerMetrics>,
    pool: WriterPool,
}

impl WriteDaemon {
    pub fn new(config: WriteDaemonConfig, pool: WriterPool) -> WriteResult<Self> {
        std::fs::create_dir_all(&config.store_root).map_err(|e| {
            WriteError::StorageIo(format!(
                "create store root {} failed: {}",
                config.store_root.display(),
                e
            ))
        })?;
        let sink = Arc::new(LocalFileSink::new(&config.store_root));
        let space = Arc::new(TieredSpaceManager::new(&config.tiers)?);
        let metrics = Arc::new(WorkerMetrics::new(config.worker_id.clone()));
        Ok(Self {
            config,
            sink,
            space,
            metrics,
            pool,
        })
    }

    pub fn config(&self) -> &WriteDaemonConfig {
        &self.config
    }

    pub fn sink(&self) -> &Arc<LocalFileSink> {
        &self.sink
    }

    pub fn space(&self) -> &Arc<TieredSpaceManager> {
        &self.space
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    fn new_chain(
        &self,
        responses: &mpsc::UnboundedSender<WriteResponse>,
    ) -> WriteResult<HandlerChain> {
        let mut chain = HandlerChain::new();
        for request_type in self.config.request_types.iter() {
            let capability = FileWriteCapability::new(
                *request_type,
                self.sink.clone(),
                self.space.clone(),
                self.space.clone(),
                self.metrics.clone(),
                &self.config.pipeline,
            );
            let handler = FileWriteHandler::new(
                Arc::new(capability),
                self.config.pipeline.clone(),
                self.pool.clone(),
                responses.clone(),
            )?;
            chain.push(Box::new(handler));
        }
        Ok(chain)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> WriteResult<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("WriteDaemon: accepted connection from {}", peer);
            let daemon = self.clone();
            tokio::spawn(async move {
                if let Err(err) = daemon.serve_connection(stream).await {
                    warn!("WriteDaemon: connection from {} failed: {}", peer, err);
                }
            });
        }
    }

    /// The connection event loop. Reads frames only while no handler asks
    /// for back-pressure; responses are written by a separate task.
    pub async fn serve_connection(&self, stream: TcpStream) -> WriteResult<()> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteResponse>();
        let mut chain = self.new_chain(&tx)?;

        let response_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                if let Err(err) = write_response(&mut writer, &response).await {
                    debug!("WriteDaemon: write response failed: {}", err);
                    break;
                }
            }
        });

        let max_payload = self.config.pipeline.max_chunk_size;
        loop {
            if chain.is_reading_paused() {
                chain.wait_read_ready().await;
            }
            match read_message(&mut reader, max_payload).await {
                Ok(Some(msg)) => {
                    if let Err(msg) = chain.dispatch(msg) {
                        let err = WriteError::Unsupported(format!(
                            "no handler for {} request",
                            msg.request_type.as_str()
                        ));
                        let _ = tx.send(WriteResponse::failed(msg.request_id, &err));
                    }
                }
                Ok(None) => {
                    debug!("WriteDaemon: {} closed the connection", peer);
                    break;
                }
                Err(err) => {
                    warn!("WriteDaemon: read from {} failed: {}", peer, err);
                    chain.on_error(err);
                    break;
                }
            }
        }

        chain.on_channel_closed();
        let outcomes = chain.join_all().await;
        debug!(
            "WriteDaemon: {} done, {} requests settled",
            peer,
            outcomes.len()
        );
        drop(chain);
        drop(tx);
        let _ = response_task.await;
        Ok(())
    }
}

pub fn run_write_daemon(options: WriteDaemonRunOptions) -> WriteResult<()> {
    let config = load_config(&options.config_path)?;
    let pool = WriterPool::dedicated(
        config.pipeline.writer_threads,
        config.pipeline.max_concurrent_writes,
    )?;

    // decode and classify run on one thread; storage calls run on the pool
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| WriteError::InvalidState(format!("build runtime failed: {}", e)))?;

    runtime.block_on(async move {
        let listen_addr = config.listen_addr.clone();
        let daemon = Arc::new(WriteDaemon::new(config, pool)?);
        let listener = TcpListener::bind(&listen_addr).await.map_err(|e| {
            WriteError::StorageIo(format!("bind {} failed: {}", listen_addr, e))
        })?;
        info!(
            "write_daemon listening on {}, store_root={}",
            listen_addr,
            daemon.config().store_root.display()
        );
        daemon.serve(listener).await
    })
}
