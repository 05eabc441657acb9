//! Dedicated-thread processor with worker lanes.
//!
//! Each lane is one OS thread draining its own bounded channel. Keyed
//! submission hashes the key onto a lane, so all items for one key are
//! handled serially in submission order; unkeyed submission round-robins for
//! throughput. Lanes back-pressure independently.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use super::channel::{ChannelError, ChannelOptions, DispatchChannel, FullMode};

/// Result type for worker pool operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors surfaced by the dedicated-thread processor.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Worker count must be at least 1")]
    InvalidWorkerCount,

    #[error("Lane capacity must be at least 1")]
    InvalidCapacity,

    #[error("Processor has shut down")]
    ShutDown,

    #[error("Operation cancelled")]
    Cancelled,
}

/// Worker pool options.
#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    /// Number of worker lanes (threads).
    pub workers: usize,
    /// Per-lane bounded queue capacity.
    pub lane_capacity: usize,
    /// Behaviour of a lane queue at capacity.
    pub full_mode: FullMode,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            lane_capacity: 256,
            full_mode: FullMode::Wait,
        }
    }
}

/// Distributes items across dedicated worker threads.
pub struct DedicatedThreadProcessor<T> {
    lanes: Vec<Arc<DispatchChannel<T>>>,
    handles: Vec<std::thread::JoinHandle<()>>,
    next_lane: AtomicUsize,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl<T: Send + 'static> DedicatedThreadProcessor<T> {
    /// Create a pool and start its worker threads.
    pub fn new<F>(options: WorkerPoolOptions, handler: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if options.workers == 0 {
            return Err(WorkerError::InvalidWorkerCount);
        }
        if options.lane_capacity == 0 {
            return Err(WorkerError::InvalidCapacity);
        }

        let handler = Arc::new(handler);
        let processed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let mut lanes = Vec::with_capacity(options.workers);
        let mut handles = Vec::with_capacity(options.workers);

        for lane_index in 0..options.workers {
            let channel = Arc::new(
                DispatchChannel::new(ChannelOptions::bounded(
                    options.lane_capacity,
                    options.full_mode,
                ))
                .expect("capacity is non-zero"),
            );
            lanes.push(Arc::clone(&channel));

            let handler = Arc::clone(&handler);
            let processed = Arc::clone(&processed);
            let failed = Arc::clone(&failed);
            let cancel = CancellationToken::new();

            let handle = std::thread::Builder::new()
                .name(format!("dispatch-worker-{lane_index}"))
                .spawn(move || loop {
                    match channel.read(&cancel) {
                        Ok(item) => {
                            if catch_unwind(AssertUnwindSafe(|| handler(item))).is_err() {
                                failed.fetch_add(1, Ordering::Relaxed);
                                error!(lane = lane_index, "Worker handler panicked, item dropped");
                            } else {
                                processed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(ChannelError::Completed) | Err(ChannelError::Faulted(_)) => break,
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Ok(Self {
            lanes,
            handles,
            next_lane: AtomicUsize::new(0),
            processed,
            failed,
        })
    }

    /// Submit an item to the next lane round-robin.
    pub fn submit(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        let lane = self.next_lane.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        self.submit_to(lane, item, cancel)
    }

    /// Submit an item to the lane owning `key`.
    ///
    /// All items for one key land on the same lane and are handled in
    /// submission order.
    pub fn submit_keyed(&self, key: &str, item: T, cancel: &CancellationToken) -> Result<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let lane = (hasher.finish() as usize) % self.lanes.len();
        self.submit_to(lane, item, cancel)
    }

    fn submit_to(&self, lane: usize, item: T, cancel: &CancellationToken) -> Result<()> {
        match self.lanes[lane].write(item, cancel) {
            Ok(()) => Ok(()),
            Err(ChannelError::Cancelled) => Err(WorkerError::Cancelled),
            Err(_) => Err(WorkerError::ShutDown),
        }
    }

    /// Number of worker lanes.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Items handled successfully.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Items dropped because the handler panicked.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Drain all lanes and join the worker threads.
    pub fn shutdown(mut self) {
        for lane in &self.lanes {
            lane.complete();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
    }
}

impl<T> Drop for DedicatedThreadProcessor<T> {
    fn drop(&mut self) {
        for lane in &self.lanes {
            lane.complete();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
