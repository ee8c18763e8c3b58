use std::future::Future;
use std::sync::Arc;

use log::info;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use write_lib::{WriteError, WriteResult};

struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        // the pool may be dropped from inside another runtime
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Where packet writers run, and how many storage calls may be in flight at
/// once across all of them.
#[derive(Clone)]
pub struct WriterPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_concurrent_writes: usize,
    _runtime: Option<Arc<OwnedRuntime>>,
}

impl WriterPool {
    /// Runs packet writers on the runtime of the caller.
    pub fn current(max_concurrent_writes: usize) -> WriteResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| WriteError::InvalidState(format!("no tokio runtime: {}", e)))?;
        Ok(Self::with_handle(handle, max_concurrent_writes))
    }

    pub fn with_handle(handle: Handle, max_concurrent_writes: usize) -> Self {
        let max_concurrent_writes = max_concurrent_writes.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_concurrent_writes)),
            max_concurrent_writes,
            _runtime: None,
        }
    }

    /// Builds a dedicated multi-thread runtime so storage I/O never shares
    /// threads with the network event loop.
    pub fn dedicated(threads: usize, max_concurrent_writes: usize) -> WriteResult<Self> {
        let threads = threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("packet-writer")
            .enable_all()
            .build()
            .map_err(|e| WriteError::InvalidState(format!("build writer runtime failed: {}", e)))?;
        info!(
            "WriterPool: started {} writer threads, {} concurrent storage calls",
            threads, max_concurrent_writes
        );
        let mut pool = Self::with_handle(runtime.handle().clone(), max_concurrent_writes);
        pool._runtime = Some(Arc::new(OwnedRuntime(Some(runtime))));
        Ok(pool)
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Held for the duration of one storage call.
    pub async fn acquire(&self) -> WriteResult<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WriteError::InvalidState("writer pool is shut down".to_string()))
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_concurrent_writes(&self) -> usize {
        self.max_concurrent_writes
    }
}
