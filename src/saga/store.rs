//! Saga state persistence.
//!
//! The raw store contract plus an in-memory implementation. Monitoring
//! queries (stuck/failed/running) live on the store because they are pure
//! reads over instance rows; the coordinator re-exposes them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use super::{Result, SagaError, SagaInstance};

/// Persists saga instances.
#[async_trait]
pub trait SagaStateStore: Send + Sync {
    /// Load one instance.
    async fn load(&self, saga_id: &str) -> Result<Option<SagaInstance>>;

    /// Insert or overwrite one instance unconditionally.
    async fn save(&self, instance: &SagaInstance) -> Result<()>;

    /// Write only when the stored version matches `expected_version`.
    ///
    /// A mismatch returns [`SagaError::VersionConflict`] without writing.
    async fn update_conditional(
        &self,
        instance: &SagaInstance,
        expected_version: u64,
    ) -> Result<()>;

    /// Instances of one type ordered by `saga_id`, starting after `cursor`.
    async fn list_by_type(
        &self,
        saga_type: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>>;

    /// Open instances whose last update is older than `threshold`.
    async fn query_stuck(&self, threshold: Duration, limit: usize) -> Result<Vec<SagaInstance>>;

    /// Open instances with a recorded failure reason.
    async fn query_failed(&self, limit: usize) -> Result<Vec<SagaInstance>>;

    /// Count of open instances, optionally filtered by type.
    async fn running_count(&self, saga_type: Option<&str>) -> Result<u64>;
}

/// In-memory [`SagaStateStore`].
#[derive(Default)]
pub struct InMemorySagaStore {
    instances: RwLock<HashMap<String, SagaInstance>>,
}

impl InMemorySagaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances in any state.
    pub async fn count(&self) -> usize {
        self.instances.read().await.len()
    }
}

#[async_trait]
impl SagaStateStore for InMemorySagaStore {
    async fn load(&self, saga_id: &str) -> Result<Option<SagaInstance>> {
        Ok(self.instances.read().await.get(saga_id).cloned())
    }

    async fn save(&self, instance: &SagaInstance) -> Result<()> {
        if instance.saga_id.is_empty() {
            return Err(SagaError::InvalidArgument("saga_id must not be empty"));
        }
        let mut instances = self.instances.write().await;
        instances.insert(instance.saga_id.clone(), instance.clone());
        Ok(())
    }

    async fn update_conditional(
        &self,
        instance: &SagaInstance,
        expected_version: u64,
    ) -> Result<()> {
        let mut instances = self.instances.write().await;
        let current = instances
            .get(&instance.saga_id)
            .ok_or_else(|| SagaError::NotFound(instance.saga_id.clone()))?;
        if current.version != expected_version {
            return Err(SagaError::VersionConflict {
                saga_id: instance.saga_id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        instances.insert(instance.saga_id.clone(), instance.clone());
        Ok(())
    }

    async fn list_by_type(
        &self,
        saga_type: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>> {
        let instances = self.instances.read().await;
        let mut matching: Vec<SagaInstance> = instances
            .values()
            .filter(|i| i.saga_type == saga_type)
            .filter(|i| match cursor {
                Some(cursor) => i.saga_id.as_str() > cursor,
                None => true,
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.saga_id.cmp(&b.saga_id));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn query_stuck(&self, threshold: Duration, limit: usize) -> Result<Vec<SagaInstance>> {
        let cutoff = Utc::now() - threshold;
        let instances = self.instances.read().await;
        let mut stuck: Vec<SagaInstance> = instances
            .values()
            .filter(|i| !i.is_completed && i.updated_at < cutoff)
            .cloned()
            .collect();
        stuck.sort_by_key(|i| i.updated_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn query_failed(&self, limit: usize) -> Result<Vec<SagaInstance>> {
        let instances = self.instances.read().await;
        let mut failed: Vec<SagaInstance> = instances
            .values()
            .filter(|i| !i.is_completed && i.failure_reason.is_some())
            .cloned()
            .collect();
        failed.sort_by_key(|i| i.updated_at);
        failed.truncate(limit);
        Ok(failed)
    }

    async fn running_count(&self, saga_type: Option<&str>) -> Result<u64> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| !i.is_completed)
            .filter(|i| match saga_type {
                Some(t) => i.saga_type == t,
                None => true,
            })
            .count() as u64)
    }
}
