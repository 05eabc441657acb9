//! Saga coordination.
//!
//! A saga is a long-running business process: an instance with evolving
//! opaque state, driven by inbound events and durable timeouts. This module
//! contains:
//! - `SagaInstance` and the `Saga` behaviour trait application code implements
//! - `IdempotencyProvider`: event-level deduplication per saga
//! - `TimeoutStore`: durable schedule/cancel/deliver of saga timeouts
//! - `SagaStateStore` and its TTL-aware cache overlay
//! - `SagaCoordinator`: lifecycle, event dispatch, monitoring queries
//! - Timeout delivery loop and the saga health probe

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatcher::MessageEnvelope;

pub mod cache;
pub mod coordinator;
pub mod delivery;
pub mod health;
pub mod idempotency;
pub mod store;
pub mod timeouts;

pub use cache::{CachedSagaStore, CachedSagaStoreOptions};
pub use coordinator::{SagaCoordinator, SagaHandleResult};
pub use delivery::{
    spawn_timeout_delivery, SagaTimeoutOptions, TimeoutDeliveryHandle, TIMEOUT_DELIVERY_JOB_NAME,
};
pub use health::{SagaHealthCheck, SagaHealthOptions, SagaHealthReport};
pub use idempotency::{IdempotencyProvider, InMemoryIdempotencyProvider};
pub use store::{InMemorySagaStore, SagaStateStore};
pub use timeouts::{InMemoryTimeoutStore, SagaTimeout, TimeoutStore};

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;

/// Errors surfaced by saga stores and the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Saga '{0}' not found")]
    NotFound(String),

    #[error("Version conflict on saga '{saga_id}': expected {expected}, found {actual}")]
    VersionConflict {
        saga_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Saga handler failed: {0}")]
    Handler(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Operation cancelled")]
    Cancelled,
}

// ============================================================================
// Instance
// ============================================================================

/// One saga's persisted state.
///
/// Completed instances are read-only; `is_completed` implies `completed_at`
/// is set. The `version` counter backs conditional updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Instance identity.
    pub saga_id: String,
    /// Registered saga type name.
    pub saga_type: String,
    /// Opaque state payload owned by the saga type.
    pub state: Vec<u8>,
    /// True once the process has finished.
    pub is_completed: bool,
    /// Monotonic write counter for conditional updates.
    pub version: u64,
    /// First-event time.
    pub created_at: DateTime<Utc>,
    /// Most recent mutation time.
    pub updated_at: DateTime<Utc>,
    /// Completion time, set exactly when `is_completed` becomes true.
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent handler failure, for the monitoring surface.
    pub failure_reason: Option<String>,
}

impl SagaInstance {
    /// Create a fresh open instance.
    pub fn new(saga_id: impl Into<String>, saga_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            saga_id: saga_id.into(),
            saga_type: saga_type.into(),
            state: Vec::new(),
            is_completed: false,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failure_reason: None,
        }
    }
}

// ============================================================================
// Behaviour
// ============================================================================

/// A timeout the saga asks the coordinator to schedule.
#[derive(Debug, Clone)]
pub struct TimeoutRequest {
    /// Stable timeout identity; re-scheduling the same id replaces it.
    pub timeout_id: String,
    /// Fully qualified message type tag delivered when due.
    pub timeout_type: String,
    /// Serialized timeout payload; `None` delivers the type's default.
    pub payload: Option<Vec<u8>>,
    /// Delivery time.
    pub due_at: DateTime<Utc>,
}

/// An outbound message the saga asks the coordinator to stage.
#[derive(Debug, Clone)]
pub struct SagaOutboundMessage {
    /// Message type tag.
    pub message_type: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
    /// Logical destination.
    pub destination: String,
}

/// Everything one `handle` call asks the coordinator to do.
#[derive(Debug, Clone, Default)]
pub struct SagaOutcome {
    /// Replacement state payload; `None` leaves state untouched.
    pub new_state: Option<Vec<u8>>,
    /// Messages to stage in the outbox after the state persists.
    pub outbound: Vec<SagaOutboundMessage>,
    /// Timeouts to schedule.
    pub schedule_timeouts: Vec<TimeoutRequest>,
    /// Timeout ids to cancel.
    pub cancel_timeouts: Vec<String>,
    /// Mark the instance completed.
    pub complete: bool,
}

impl SagaOutcome {
    /// Outcome that changes nothing.
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Outcome that replaces the state payload.
    pub fn with_state(state: Vec<u8>) -> Self {
        Self {
            new_state: Some(state),
            ..Self::default()
        }
    }

    /// Stage an outbound message.
    pub fn stage(
        mut self,
        message_type: impl Into<String>,
        payload: Vec<u8>,
        destination: impl Into<String>,
    ) -> Self {
        self.outbound.push(SagaOutboundMessage {
            message_type: message_type.into(),
            payload,
            destination: destination.into(),
        });
        self
    }

    /// Schedule a timeout.
    pub fn schedule_timeout(mut self, request: TimeoutRequest) -> Self {
        self.schedule_timeouts.push(request);
        self
    }

    /// Cancel a previously scheduled timeout.
    pub fn cancel_timeout(mut self, timeout_id: impl Into<String>) -> Self {
        self.cancel_timeouts.push(timeout_id.into());
        self
    }

    /// Mark the saga completed.
    pub fn completed(mut self) -> Self {
        self.complete = true;
        self
    }
}

/// Behaviour of one saga type.
///
/// Implementations are registered with the coordinator; `handle` runs under
/// the per-instance lock, so it must not call back into the coordinator.
#[async_trait]
pub trait Saga: Send + Sync {
    /// Registered type name.
    fn saga_type(&self) -> &str;

    /// Whether this saga consumes the given message type.
    fn handles(&self, message_type: &str) -> bool;

    /// Extract the saga id the event correlates to.
    ///
    /// `None` means the event carries no usable correlation and is ignored.
    fn correlate(&self, envelope: &MessageEnvelope) -> Option<String>;

    /// Event-level idempotency key; `None` disables deduplication for this
    /// event.
    fn idempotency_key(&self, _envelope: &MessageEnvelope) -> Option<String> {
        None
    }

    /// Apply one event to the instance.
    async fn handle(
        &self,
        instance: &SagaInstance,
        envelope: &MessageEnvelope,
    ) -> std::result::Result<SagaOutcome, SagaError>;
}
