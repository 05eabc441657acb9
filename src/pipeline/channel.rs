//! Typed queue with back-pressure, drop modes, and completion.
//!
//! `DispatchChannel` is the pipeline's transfer primitive: unbounded, or
//! bounded with a full-mode of `Wait` (producers block), `DropNewest`
//! (incoming item discarded), or `DropOldest` (head evicted to make room).
//! Blocking operations suspend through the configured [`WaitStrategy`], so
//! the same queue can busy-spin on a latency-critical path and park
//! everywhere else.
//!
//! Completion follows the usual channel shape: `complete()` signals no more
//! items, readers drain what remains and then observe `Completed` (or the
//! fault passed to `complete_with`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::wait::{HybridWait, WaitOutcome, WaitStrategy};

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors surfaced by channel operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel capacity must be at least 1")]
    InvalidCapacity,

    #[error("Channel completed")]
    Completed,

    #[error("Channel faulted: {0}")]
    Faulted(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Wait deadline passed")]
    TimedOut,
}

/// Behaviour of a bounded channel at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullMode {
    /// Back-pressure producers until a reader frees a slot.
    #[default]
    Wait,
    /// Silently discard the incoming item.
    DropNewest,
    /// Evict the head to make room for the incoming item.
    DropOldest,
}

/// Capacity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// `try_write` never fails for capacity reasons.
    Unbounded,
    /// At most `capacity` queued items, with `full_mode` at the limit.
    Bounded {
        /// Maximum queued items.
        capacity: usize,
        /// Behaviour at the limit.
        full_mode: FullMode,
    },
}

impl Default for ChannelMode {
    fn default() -> Self {
        Self::Bounded {
            capacity: 1000,
            full_mode: FullMode::Wait,
        }
    }
}

/// Channel construction options.
///
/// `single_reader`/`single_writer` are hints that permit fast paths;
/// correctness holds regardless of how many threads actually touch each side.
#[derive(Clone)]
pub struct ChannelOptions {
    /// Capacity mode.
    pub mode: ChannelMode,
    /// Hint: at most one reader thread.
    pub single_reader: bool,
    /// Hint: at most one writer thread.
    pub single_writer: bool,
    /// Strategy used by blocking reads and writes.
    pub wait_strategy: Arc<dyn WaitStrategy>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            mode: ChannelMode::default(),
            single_reader: false,
            single_writer: false,
            wait_strategy: Arc::new(HybridWait::default()),
        }
    }
}

impl ChannelOptions {
    /// Unbounded channel with the default wait strategy.
    pub fn unbounded() -> Self {
        Self {
            mode: ChannelMode::Unbounded,
            ..Self::default()
        }
    }

    /// Bounded channel with the given capacity and full-mode.
    pub fn bounded(capacity: usize, full_mode: FullMode) -> Self {
        Self {
            mode: ChannelMode::Bounded {
                capacity,
                full_mode,
            },
            ..Self::default()
        }
    }

    /// Replace the wait strategy.
    pub fn with_wait_strategy(mut self, strategy: Arc<dyn WaitStrategy>) -> Self {
        self.wait_strategy = strategy;
        self
    }
}

struct ChannelState<T> {
    queue: VecDeque<T>,
    completed: bool,
    fault: Option<String>,
}

/// Typed queue with pluggable blocking behaviour.
pub struct DispatchChannel<T> {
    state: Mutex<ChannelState<T>>,
    strategy: Arc<dyn WaitStrategy>,
    capacity: Option<usize>,
    full_mode: FullMode,
    dropped: AtomicU64,
}

impl<T> DispatchChannel<T> {
    /// Create a channel from options.
    pub fn new(options: ChannelOptions) -> Result<Self> {
        let (capacity, full_mode) = match options.mode {
            ChannelMode::Unbounded => (None, FullMode::Wait),
            ChannelMode::Bounded {
                capacity,
                full_mode,
            } => {
                if capacity == 0 {
                    return Err(ChannelError::InvalidCapacity);
                }
                (Some(capacity), full_mode)
            }
        };
        Ok(Self {
            state: Mutex::new(ChannelState {
                queue: VecDeque::new(),
                completed: false,
                fault: None,
            }),
            strategy: options.wait_strategy,
            capacity,
            full_mode,
            dropped: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attempt a non-blocking write.
    ///
    /// Returns `false` when the channel is completed, or full in `Wait`
    /// mode. Drop modes always accept the write (the discarded item is
    /// counted in [`DispatchChannel::dropped_count`]).
    pub fn try_write(&self, item: T) -> bool {
        let accepted = {
            let mut state = self.lock();
            if state.completed {
                return false;
            }
            match self.capacity {
                Some(capacity) if state.queue.len() >= capacity => match self.full_mode {
                    FullMode::Wait => false,
                    FullMode::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    FullMode::DropOldest => {
                        state.queue.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        state.queue.push_back(item);
                        true
                    }
                },
                _ => {
                    state.queue.push_back(item);
                    true
                }
            }
        };
        if accepted {
            self.strategy.signal_all();
        }
        accepted
    }

    /// Write, blocking under `Wait` back-pressure until a slot frees.
    pub fn write(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        let mut pending = Some(item);
        loop {
            if cancel.is_cancelled() {
                return Err(ChannelError::Cancelled);
            }
            {
                let mut state = self.lock();
                if state.completed {
                    return Err(ChannelError::Completed);
                }
                let has_room = match self.capacity {
                    Some(capacity) => state.queue.len() < capacity,
                    None => true,
                };
                if has_room || self.full_mode != FullMode::Wait {
                    match (has_room, self.full_mode) {
                        (true, _) => state.queue.push_back(pending.take().unwrap()),
                        (false, FullMode::DropNewest) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            drop(pending.take());
                        }
                        (false, FullMode::DropOldest) => {
                            state.queue.pop_front();
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            state.queue.push_back(pending.take().unwrap());
                        }
                        (false, FullMode::Wait) => unreachable!(),
                    }
                }
            }
            if pending.is_none() {
                self.strategy.signal_all();
                return Ok(());
            }
            match self.strategy.wait_for(
                &|| {
                    let state = self.lock();
                    state.completed
                        || match self.capacity {
                            Some(capacity) => state.queue.len() < capacity,
                            None => true,
                        }
                },
                cancel,
                None,
            ) {
                WaitOutcome::Ready => continue,
                WaitOutcome::Cancelled => return Err(ChannelError::Cancelled),
                WaitOutcome::TimedOut => return Err(ChannelError::TimedOut),
            }
        }
    }

    /// Attempt a non-blocking read.
    pub fn try_read(&self) -> Option<T> {
        let item = self.lock().queue.pop_front();
        if item.is_some() {
            self.strategy.signal_all();
        }
        item
    }

    /// Read, blocking until an item arrives or the channel completes.
    pub fn read(&self, cancel: &CancellationToken) -> Result<T> {
        self.read_inner(cancel, None)
    }

    /// Read with a deadline; `TimedOut` when nothing arrived in time.
    pub fn read_deadline(&self, deadline: Instant, cancel: &CancellationToken) -> Result<T> {
        self.read_inner(cancel, Some(deadline))
    }

    fn read_inner(&self, cancel: &CancellationToken, deadline: Option<Instant>) -> Result<T> {
        loop {
            if cancel.is_cancelled() {
                return Err(ChannelError::Cancelled);
            }
            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    drop(state);
                    self.strategy.signal_all();
                    return Ok(item);
                }
                if state.completed {
                    return Err(match state.fault.clone() {
                        Some(fault) => ChannelError::Faulted(fault),
                        None => ChannelError::Completed,
                    });
                }
            }
            match self.strategy.wait_for(
                &|| {
                    let state = self.lock();
                    !state.queue.is_empty() || state.completed
                },
                cancel,
                deadline,
            ) {
                WaitOutcome::Ready => continue,
                WaitOutcome::Cancelled => return Err(ChannelError::Cancelled),
                WaitOutcome::TimedOut => return Err(ChannelError::TimedOut),
            }
        }
    }

    /// Block until an item is readable.
    ///
    /// Returns `Ok(false)` only once the writer side has completed and the
    /// queue has drained.
    pub fn wait_to_read(&self, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        match self.strategy.wait_for(
            &|| {
                let state = self.lock();
                !state.queue.is_empty() || state.completed
            },
            cancel,
            None,
        ) {
            WaitOutcome::Ready => {
                let state = self.lock();
                Ok(!state.queue.is_empty())
            }
            WaitOutcome::Cancelled => Err(ChannelError::Cancelled),
            WaitOutcome::TimedOut => Err(ChannelError::TimedOut),
        }
    }

    /// Block until a write would be accepted.
    ///
    /// Returns `Ok(false)` once the channel is completed.
    pub fn wait_to_write(&self, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        match self.strategy.wait_for(
            &|| {
                let state = self.lock();
                state.completed
                    || match self.capacity {
                        Some(capacity) => state.queue.len() < capacity,
                        None => true,
                    }
            },
            cancel,
            None,
        ) {
            WaitOutcome::Ready => Ok(!self.lock().completed),
            WaitOutcome::Cancelled => Err(ChannelError::Cancelled),
            WaitOutcome::TimedOut => Err(ChannelError::TimedOut),
        }
    }

    /// Exact queued item count.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True when no items are queued.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Items discarded by `DropNewest`/`DropOldest`.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once `complete` or `complete_with` has been called.
    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// Signal that no more items will be written.
    ///
    /// Queued items remain readable; after drain, reads observe
    /// [`ChannelError::Completed`].
    pub fn complete(&self) {
        {
            let mut state = self.lock();
            state.completed = true;
        }
        self.strategy.signal_all();
    }

    /// Complete with an error surfaced to the reader once drained.
    pub fn complete_with(&self, error: impl Into<String>) {
        {
            let mut state = self.lock();
            state.completed = true;
            state.fault = Some(error.into());
        }
        self.strategy.signal_all();
    }
}

impl<T: Clone> DispatchChannel<T> {
    /// Clone the head item without removing it.
    pub fn try_peek(&self) -> Option<T> {
        self.lock().queue.front().cloned()
    }
}

impl<T> Drop for DispatchChannel<T> {
    fn drop(&mut self) {
        // Release any thread still blocked in the wait strategy.
        self.strategy.signal_all();
    }
}
