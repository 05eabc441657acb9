//! Micro-batch processor.
//!
//! Coalesces submitted items into batches bounded by size and age and hands
//! each batch to a user callback on a dedicated background thread. Input is
//! always a bounded channel, so producers back-pressure instead of growing an
//! unbounded in-memory buffer.
//!
//! Failure semantics: a callback error or panic drops that batch and the loop
//! keeps consuming. Delivery to the callback is at-most-once per batch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::channel::{ChannelError, ChannelOptions, DispatchChannel, FullMode};

/// Input queue headroom relative to the batch size.
const INPUT_CAPACITY_FACTOR: usize = 8;
/// Floor for the input queue so tiny batch sizes still buffer reasonably.
const INPUT_CAPACITY_MIN: usize = 64;

/// Result type for batch processor operations.
pub type Result<T> = std::result::Result<T, BatchError>;

/// Errors surfaced by the batch processor.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("max_batch_size must be at least 1")]
    InvalidBatchSize,

    #[error("max_batch_delay must be greater than zero")]
    InvalidBatchDelay,

    #[error("Processor has shut down")]
    ShutDown,

    #[error("Operation cancelled")]
    Cancelled,
}

/// Batch coalescing options.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Upper bound on items per batch.
    pub max_batch_size: usize,
    /// A partial batch flushes no later than this after its first item.
    pub max_batch_delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(50),
        }
    }
}

/// Error type a batch callback may return.
pub type BatchHandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Groups items into batches and invokes a callback per batch.
pub struct BatchProcessor<T> {
    input: Arc<DispatchChannel<T>>,
    worker_cancel: CancellationToken,
    worker: Option<std::thread::JoinHandle<()>>,
    processed_batches: Arc<AtomicU64>,
    dropped_batches: Arc<AtomicU64>,
}

impl<T: Send + 'static> BatchProcessor<T> {
    /// Create a processor and start its background thread.
    ///
    /// `process` receives every batch; batches are never empty and never
    /// exceed `max_batch_size`.
    pub fn new<F>(options: BatchOptions, mut process: F) -> Result<Self>
    where
        F: FnMut(Vec<T>) -> std::result::Result<(), BatchHandlerError> + Send + 'static,
    {
        if options.max_batch_size == 0 {
            return Err(BatchError::InvalidBatchSize);
        }
        if options.max_batch_delay.is_zero() {
            return Err(BatchError::InvalidBatchDelay);
        }

        let capacity = (options.max_batch_size * INPUT_CAPACITY_FACTOR).max(INPUT_CAPACITY_MIN);
        let input = Arc::new(
            DispatchChannel::new(ChannelOptions::bounded(capacity, FullMode::Wait))
                .expect("capacity is non-zero"),
        );
        let worker_cancel = CancellationToken::new();
        let processed_batches = Arc::new(AtomicU64::new(0));
        let dropped_batches = Arc::new(AtomicU64::new(0));

        let worker = {
            let input = Arc::clone(&input);
            let cancel = worker_cancel.clone();
            let processed = Arc::clone(&processed_batches);
            let dropped = Arc::clone(&dropped_batches);
            let max_batch_size = options.max_batch_size;
            let max_batch_delay = options.max_batch_delay;

            std::thread::Builder::new()
                .name("dispatch-batch".to_string())
                .spawn(move || {
                    let mut flush = move |batch: Vec<T>| {
                        let size = batch.len();
                        let outcome = catch_unwind(AssertUnwindSafe(|| process(batch)));
                        match outcome {
                            Ok(Ok(())) => {
                                processed.fetch_add(1, Ordering::Relaxed);
                                debug!(batch_size = size, "Batch processed");
                            }
                            Ok(Err(e)) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                                error!(batch_size = size, error = %e, "Batch callback failed, batch dropped");
                            }
                            Err(_) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                                error!(batch_size = size, "Batch callback panicked, batch dropped");
                            }
                        }
                    };

                    loop {
                        let first = match input.read(&cancel) {
                            Ok(item) => item,
                            Err(ChannelError::Cancelled) => {
                                warn!(pending = input.len(), "Batch loop cancelled, pending items dropped");
                                return;
                            }
                            Err(_) => return,
                        };

                        let deadline = Instant::now() + max_batch_delay;
                        let mut batch = Vec::with_capacity(max_batch_size);
                        batch.push(first);
                        let mut completed = false;

                        while batch.len() < max_batch_size {
                            match input.read_deadline(deadline, &cancel) {
                                Ok(item) => batch.push(item),
                                Err(ChannelError::TimedOut) => break,
                                Err(ChannelError::Cancelled) => {
                                    warn!(
                                        pending = batch.len() + input.len(),
                                        "Batch loop cancelled, pending items dropped"
                                    );
                                    return;
                                }
                                Err(_) => {
                                    completed = true;
                                    break;
                                }
                            }
                        }

                        flush(batch);
                        if completed {
                            return;
                        }
                    }
                })
                .expect("failed to spawn batch worker thread")
        };

        Ok(Self {
            input,
            worker_cancel,
            worker: Some(worker),
            processed_batches,
            dropped_batches,
        })
    }

    /// Submit one item, blocking under input back-pressure.
    ///
    /// A cancelled token returns without enqueuing.
    pub fn submit(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        match self.input.write(item, cancel) {
            Ok(()) => Ok(()),
            Err(ChannelError::Cancelled) => Err(BatchError::Cancelled),
            Err(_) => Err(BatchError::ShutDown),
        }
    }

    /// Batches delivered successfully.
    pub fn processed_batches(&self) -> u64 {
        self.processed_batches.load(Ordering::Relaxed)
    }

    /// Batches dropped because the callback failed or panicked.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    /// Flush pending items and stop the background thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    /// Stop without flushing: pending items are dropped.
    pub fn abort(mut self) {
        self.worker_cancel.cancel();
        self.input.complete();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Batch worker thread panicked during abort");
            }
        }
    }

    fn shutdown_inner(&mut self) {
        self.input.complete();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Batch worker thread panicked during shutdown");
            }
        }
    }
}

impl<T> Drop for BatchProcessor<T> {
    fn drop(&mut self) {
        self.input.complete();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
