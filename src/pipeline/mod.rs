//! In-process message pipeline.
//!
//! The consumer half of the substrate: a back-pressured typed channel with
//! pluggable wait strategies, a micro-batch processor that groups items by
//! size or age, a dedicated-thread processor that spreads work across worker
//! lanes, and a ring-buffer latency tracker.
//!
//! The pipeline is thread-based. Wait strategies (spin/yield/park) are
//! OS-thread concepts, so readers and writers block real threads; the async
//! half of the crate hands work across this boundary through the channel.

pub mod batch;
pub mod channel;
pub mod latency;
pub mod wait;
pub mod worker;

pub use batch::{BatchError, BatchOptions, BatchProcessor};
pub use channel::{ChannelError, ChannelMode, ChannelOptions, DispatchChannel, FullMode};
pub use latency::{LatencyStatistics, LatencyTracker};
pub use wait::{HybridWait, ParkWait, SpinWait, WaitOutcome, WaitStrategy, YieldWait};
pub use worker::{DedicatedThreadProcessor, WorkerPoolOptions};
