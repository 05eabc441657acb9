//! Outbox store contract.
//!
//! Stores keep staged/scheduled/failed messages and, for fan-out messages,
//! one delivery row per (message, transport) pair. The publisher owns all
//! state transitions; stores only persist them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{OutboundMessage, TransportDelivery};

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Errors surfaced by outbox stores and the publisher.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Message '{0}' already staged")]
    Duplicate(String),

    #[error("Message '{0}' not found")]
    NotFound(String),

    #[error("No transport registered under '{0}'")]
    TransportNotRegistered(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<crate::serializer::SerializerError> for OutboxError {
    fn from(e: crate::serializer::SerializerError) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Staged/scheduled/failed messages plus per-transport delivery rows.
///
/// `mark_sent` is terminal: implementations must never move a `Published`
/// row back to any other status. `mark_transport_sent` promotes the parent
/// message to `Published` once every delivery row is `Sent`.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new message in its staged state.
    async fn stage(&self, message: OutboundMessage) -> Result<()>;

    /// Persist a new message together with its per-transport delivery rows.
    async fn stage_with_transports(
        &self,
        message: OutboundMessage,
        deliveries: Vec<TransportDelivery>,
    ) -> Result<()>;

    /// Fetch a message by id.
    async fn get_by_id(&self, id: &str) -> Result<Option<OutboundMessage>>;

    /// Oldest `Staged`/`Scheduled` messages whose delivery time has arrived.
    async fn get_unsent(&self, limit: usize) -> Result<Vec<OutboundMessage>>;

    /// Oldest `Scheduled` messages whose delivery time has arrived.
    async fn get_scheduled(&self, limit: usize) -> Result<Vec<OutboundMessage>>;

    /// Record a successful dispatch: status becomes `Published`.
    async fn mark_sent(&self, id: &str) -> Result<()>;

    /// Record a failed dispatch: status becomes `Failed` with the error and
    /// the new retry count.
    async fn mark_failed(&self, id: &str, error: &str, retry_count: u32) -> Result<()>;

    /// `Failed` messages still under the retry budget, oldest first.
    async fn get_failed(
        &self,
        max_retries: u32,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>>;

    /// Pending delivery rows for one transport, oldest parent first.
    async fn get_pending_transport_deliveries(
        &self,
        transport_name: &str,
        limit: usize,
    ) -> Result<Vec<TransportDelivery>>;

    /// All delivery rows for one message.
    async fn get_transport_deliveries(&self, message_id: &str) -> Result<Vec<TransportDelivery>>;

    /// Record a successful transport send; promotes the parent to
    /// `Published` when this was the last outstanding row.
    async fn mark_transport_sent(&self, message_id: &str, transport_name: &str) -> Result<()>;

    /// Record a failed transport send on one delivery row.
    async fn mark_transport_failed(
        &self,
        message_id: &str,
        transport_name: &str,
        error: &str,
    ) -> Result<()>;
}
