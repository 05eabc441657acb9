//! Durable saga timeouts.
//!
//! A timeout is a scheduled message re-delivered to its owning saga at or
//! after `due_at`. Scheduling the same `timeout_id` again replaces the prior
//! row; cancellation and delivery of unknown ids are no-ops so callers never
//! race the delivery loop.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{Result, SagaError};

/// One scheduled saga timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaTimeout {
    /// Timeout identity; re-scheduling replaces.
    pub timeout_id: String,
    /// Owning saga instance.
    pub saga_id: String,
    /// Owning saga type.
    pub saga_type: String,
    /// Fully qualified message type tag delivered when due.
    pub timeout_type: String,
    /// Serialized payload; `None` delivers a default-constructed message.
    pub payload: Option<Vec<u8>>,
    /// Delivery time.
    pub due_at: DateTime<Utc>,
    /// Scheduling time.
    pub scheduled_at: DateTime<Utc>,
}

/// Schedules, cancels, and retrieves due timeouts.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Persist a timeout; the same `timeout_id` replaces the prior row.
    async fn schedule(&self, timeout: SagaTimeout) -> Result<()>;

    /// Cancel one timeout. Unknown ids are no-ops.
    async fn cancel(&self, saga_id: &str, timeout_id: &str) -> Result<()>;

    /// Cancel every timeout belonging to one saga. Idempotent.
    async fn cancel_all(&self, saga_id: &str) -> Result<()>;

    /// Timeouts with `due_at <= now`, ascending by `due_at`, capped at
    /// `limit`.
    async fn get_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SagaTimeout>>;

    /// Remove a delivered timeout. Unknown ids are no-ops.
    async fn mark_delivered(&self, timeout_id: &str) -> Result<()>;
}

/// In-memory [`TimeoutStore`].
#[derive(Default)]
pub struct InMemoryTimeoutStore {
    timeouts: RwLock<HashMap<String, SagaTimeout>>,
}

impl InMemoryTimeoutStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outstanding timeouts.
    pub async fn count(&self) -> usize {
        self.timeouts.read().await.len()
    }
}

#[async_trait]
impl TimeoutStore for InMemoryTimeoutStore {
    async fn schedule(&self, timeout: SagaTimeout) -> Result<()> {
        if timeout.timeout_id.is_empty() {
            return Err(SagaError::InvalidArgument("timeout_id must not be empty"));
        }
        if timeout.saga_id.is_empty() {
            return Err(SagaError::InvalidArgument("saga_id must not be empty"));
        }
        if timeout.due_at < timeout.scheduled_at {
            return Err(SagaError::InvalidArgument(
                "due_at must not precede scheduled_at",
            ));
        }
        let mut timeouts = self.timeouts.write().await;
        timeouts.insert(timeout.timeout_id.clone(), timeout);
        Ok(())
    }

    async fn cancel(&self, saga_id: &str, timeout_id: &str) -> Result<()> {
        let mut timeouts = self.timeouts.write().await;
        if let Some(existing) = timeouts.get(timeout_id) {
            if existing.saga_id == saga_id {
                timeouts.remove(timeout_id);
            }
        }
        Ok(())
    }

    async fn cancel_all(&self, saga_id: &str) -> Result<()> {
        let mut timeouts = self.timeouts.write().await;
        timeouts.retain(|_, t| t.saga_id != saga_id);
        Ok(())
    }

    async fn get_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SagaTimeout>> {
        let timeouts = self.timeouts.read().await;
        let mut due: Vec<SagaTimeout> = timeouts
            .values()
            .filter(|t| t.due_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| t.due_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_delivered(&self, timeout_id: &str) -> Result<()> {
        let mut timeouts = self.timeouts.write().await;
        timeouts.remove(timeout_id);
        Ok(())
    }
}
