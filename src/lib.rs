//! Dispatch - messaging and orchestration substrate
//!
//! Moves application events from producers to handlers with at-least-once
//! durability, coordinates long-running workflows (sagas) with timeouts and
//! idempotency, and keeps a tamper-evident audit trail of sensitive actions.
//!
//! The four pillars:
//! - [`outbox`]: transactional outbox with per-transport fan-out, bounded
//!   retries, and a background drain loop
//! - [`pipeline`]: back-pressured channel, micro-batcher, worker lanes, and
//!   latency tracking for the in-process consumer path
//! - [`saga`]: per-instance saga state, durable timeouts, idempotency, and
//!   monitoring queries
//! - [`audit`]: hash-chained append-only log with integrity verification,
//!   role-gated reads, alerting, and retention
//!
//! Brokers, persistence drivers, and front-ends stay behind the seams in
//! [`transport`], [`dispatcher`], [`serializer`], and the store traits; the
//! crate ships in-memory implementations everywhere and SQLite-backed outbox
//! and audit stores behind the `sqlite` feature.

pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod hashing;
pub mod health;
pub mod outbox;
pub mod pipeline;
pub mod saga;
pub mod serializer;
pub mod transport;

pub use config::{DispatchConfig, init_logging};
pub use dispatcher::{DispatchContext, Dispatcher, MessageEnvelope, MessageTypeRegistry};
pub use serializer::{JsonSerializer, Serializer};
pub use transport::{TransportAdapter, TransportRegistry};
