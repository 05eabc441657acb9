//! Event-level idempotency per saga.
//!
//! A processed `(saga_id, key)` pair means "already applied"; marking the
//! same pair again is a no-op. The in-memory implementation is a read-mostly
//! set behind a std `RwLock` so checks stay cheap on the hot path.

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Result, SagaError};

/// Deduplicates event keys per saga.
#[async_trait]
pub trait IdempotencyProvider: Send + Sync {
    /// Whether `(saga_id, key)` has been processed.
    async fn is_processed(
        &self,
        saga_id: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Record `(saga_id, key)` as processed. Duplicate marks are no-ops.
    async fn mark_processed(
        &self,
        saga_id: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

fn validate(saga_id: &str, key: &str, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SagaError::Cancelled);
    }
    if saga_id.is_empty() {
        return Err(SagaError::InvalidArgument("saga_id must not be empty"));
    }
    if key.is_empty() {
        return Err(SagaError::InvalidArgument("idempotency key must not be empty"));
    }
    Ok(())
}

/// In-memory [`IdempotencyProvider`].
#[derive(Default)]
pub struct InMemoryIdempotencyProvider {
    processed: RwLock<HashSet<(String, String)>>,
}

impl InMemoryIdempotencyProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded pairs.
    pub fn count(&self) -> usize {
        self.processed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl IdempotencyProvider for InMemoryIdempotencyProvider {
    async fn is_processed(
        &self,
        saga_id: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        validate(saga_id, key, cancel)?;
        let processed = self.processed.read().unwrap_or_else(|e| e.into_inner());
        Ok(processed.contains(&(saga_id.to_string(), key.to_string())))
    }

    async fn mark_processed(
        &self,
        saga_id: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        validate(saga_id, key, cancel)?;
        let mut processed = self.processed.write().unwrap_or_else(|e| e.into_inner());
        processed.insert((saga_id.to_string(), key.to_string()));
        Ok(())
    }
}
