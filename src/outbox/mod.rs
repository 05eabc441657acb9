//! Transactional outbox engine.
//!
//! Outbound messages are staged alongside business state and drained to the
//! configured transports by a background publisher, giving at-least-once
//! delivery after the enclosing transaction commits. This module contains:
//! - Outbox row types (`OutboundMessage`, `TransportDelivery`)
//! - `OutboxStore` trait: staged/scheduled/failed rows plus per-transport
//!   fan-out rows
//! - `OutboxPublisher`: drains batches, records outcomes, keeps statistics
//! - Background processing loop fired on a configurable cadence
//! - Implementations: in-memory, SQLite (feature `sqlite`)

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod background;
pub mod memory;
pub mod publisher;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;

pub use background::{spawn_outbox_processor, OutboxProcessingOptions, OutboxProcessorHandle};
pub use memory::InMemoryOutboxStore;
pub use publisher::{OutboxPublisher, PublisherStatistics, PublishingResult};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOutboxStore;
pub use store::{OutboxError, OutboxStore, Result};

// ============================================================================
// Row Types
// ============================================================================

/// Lifecycle state of a staged outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Staged and awaiting the next publisher pass.
    Staged,
    /// Staged with a future delivery time.
    Scheduled,
    /// Delivered on the default path, or all transport rows sent. Terminal.
    Published,
    /// Last dispatch attempt failed; eligible for retry while under budget.
    Failed,
}

impl MessageStatus {
    /// Stable string form used by the durable stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Scheduled => "scheduled",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "staged" => Some(Self::Staged),
            "scheduled" => Some(Self::Scheduled),
            "published" => Some(Self::Published),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A staged outbound message.
///
/// Created by `stage`, mutated only by publisher bookkeeping, never deleted
/// by the core (archival is a store concern).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Stable unique identifier.
    pub id: String,
    /// Message type tag (consumer-side routing key).
    pub message_type: String,
    /// Opaque payload bytes produced by the registered serializer.
    pub payload: Vec<u8>,
    /// Logical queue/topic name.
    pub destination: String,
    /// Transport headers.
    pub headers: HashMap<String, String>,
    /// Correlation id propagated from the producing operation.
    pub correlation_id: Option<String>,
    /// Deliver at or after this instant; `None` means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub status: MessageStatus,
    /// Number of failed dispatch attempts. Monotonically non-decreasing.
    pub retry_count: u32,
    /// Message from the most recent failure.
    pub last_error: Option<String>,
    /// Staging time.
    pub created_at: DateTime<Utc>,
    /// Most recent dispatch attempt, if any.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl OutboundMessage {
    /// Build a message in its initial staged state.
    ///
    /// The status is `Scheduled` when `scheduled_at` is set and in the
    /// future at stage time, `Staged` otherwise.
    pub fn new(
        id: impl Into<String>,
        message_type: impl Into<String>,
        payload: Vec<u8>,
        destination: impl Into<String>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        let status = match scheduled_at {
            Some(at) if at > now => MessageStatus::Scheduled,
            _ => MessageStatus::Staged,
        };
        Self {
            id: id.into(),
            message_type: message_type.into(),
            payload,
            destination: destination.into(),
            headers: HashMap::new(),
            correlation_id: None,
            scheduled_at,
            status,
            retry_count: 0,
            last_error: None,
            created_at: now,
            last_attempt_at: None,
        }
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// True once the message may be picked up by the publisher.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => at <= now,
            None => true,
        }
    }
}

/// Delivery state of one per-transport fan-out row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportDeliveryStatus {
    /// Not yet attempted, or awaiting another attempt.
    Pending,
    /// Delivered through this transport.
    Sent,
    /// Last attempt through this transport failed.
    Failed,
}

impl TransportDeliveryStatus {
    /// Stable string form used by the durable stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One logical message delivered to one named transport.
///
/// A message with fan-out rows becomes `Published` only when every row is
/// `Sent`; each row is tracked independently until then.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportDelivery {
    /// Parent message id.
    pub message_id: String,
    /// Registered transport name.
    pub transport_name: String,
    /// Transport-specific destination.
    pub destination: String,
    /// Delivery state for this transport.
    pub status: TransportDeliveryStatus,
    /// Failed attempts on this transport.
    pub retry_count: u32,
    /// Message from the most recent failure on this transport.
    pub last_error: Option<String>,
}

impl TransportDelivery {
    /// Build a pending fan-out row.
    pub fn pending(
        message_id: impl Into<String>,
        transport_name: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            transport_name: transport_name.into(),
            destination: destination.into(),
            status: TransportDeliveryStatus::Pending,
            retry_count: 0,
            last_error: None,
        }
    }
}
