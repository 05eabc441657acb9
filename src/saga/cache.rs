//! TTL-aware cache overlay for the saga state store.
//!
//! Open instances churn quickly, so they get a short TTL; completed
//! instances are immutable, so they can sit in cache much longer. The
//! overlay caches whole instances, which makes it impossible to serve a
//! closed saga as open or the reverse. Writes either invalidate (strict) or
//! refresh (optimistic) the entry depending on configuration.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::store::SagaStateStore;
use super::{Result, SagaInstance};

/// Cache overlay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachedSagaStoreOptions {
    /// Master switch; when false every call passes straight through.
    pub enable_caching: bool,
    /// Keep an in-process cache (the only kind this overlay ships).
    pub use_local_cache: bool,
    /// Maximum cached instances; the stalest entry is evicted at the limit.
    pub local_cache_size_limit: usize,
    /// Fallback TTL in seconds when a split TTL is zero. Default: 5 minutes.
    pub default_cache_ttl_secs: u64,
    /// TTL for open instances, in seconds. Default: 1 minute.
    pub active_saga_cache_ttl_secs: u64,
    /// TTL for completed instances, in seconds. Default: 1 hour.
    pub completed_saga_cache_ttl_secs: u64,
    /// Drop the entry on write (strict) instead of refreshing it
    /// (optimistic).
    pub invalidate_cache_on_update: bool,
}

impl Default for CachedSagaStoreOptions {
    fn default() -> Self {
        Self {
            enable_caching: true,
            use_local_cache: true,
            local_cache_size_limit: 10_000,
            default_cache_ttl_secs: 5 * 60,
            active_saga_cache_ttl_secs: 60,
            completed_saga_cache_ttl_secs: 60 * 60,
            invalidate_cache_on_update: true,
        }
    }
}

impl CachedSagaStoreOptions {
    fn ttl_for(&self, instance: &SagaInstance) -> Duration {
        let secs = if instance.is_completed {
            self.completed_saga_cache_ttl_secs
        } else {
            self.active_saga_cache_ttl_secs
        };
        let secs = if secs == 0 {
            self.default_cache_ttl_secs
        } else {
            secs
        };
        Duration::from_secs(secs)
    }

    fn caching_active(&self) -> bool {
        self.enable_caching && self.use_local_cache && self.local_cache_size_limit > 0
    }
}

struct CacheEntry {
    instance: SagaInstance,
    cached_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Caching wrapper around any [`SagaStateStore`].
pub struct CachedSagaStore {
    inner: Arc<dyn SagaStateStore>,
    options: CachedSagaStoreOptions,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl CachedSagaStore {
    /// Wrap `inner` with the given options.
    pub fn new(inner: Arc<dyn SagaStateStore>, options: CachedSagaStoreOptions) -> Self {
        Self {
            inner,
            options,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of cached entries (fresh or stale).
    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop one entry.
    pub fn invalidate(&self, saga_id: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(saga_id);
    }

    fn cache_get(&self, saga_id: &str) -> Option<SagaInstance> {
        if !self.options.caching_active() {
            return None;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(saga_id) {
            Some(entry) if entry.is_fresh() => Some(entry.instance.clone()),
            Some(_) => {
                cache.remove(saga_id);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, instance: &SagaInstance) {
        if !self.options.caching_active() {
            return;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= self.options.local_cache_size_limit
            && !cache.contains_key(&instance.saga_id)
        {
            // Evict the stalest entry to stay under the limit.
            if let Some(stalest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(id, _)| id.clone())
            {
                cache.remove(&stalest);
                debug!(saga_id = %stalest, "Saga cache evicted stalest entry");
            }
        }
        cache.insert(
            instance.saga_id.clone(),
            CacheEntry {
                instance: instance.clone(),
                cached_at: Instant::now(),
                ttl: self.options.ttl_for(instance),
            },
        );
    }

    fn after_write(&self, instance: &SagaInstance) {
        if self.options.invalidate_cache_on_update {
            self.invalidate(&instance.saga_id);
        } else {
            self.cache_put(instance);
        }
    }
}

#[async_trait]
impl SagaStateStore for CachedSagaStore {
    async fn load(&self, saga_id: &str) -> Result<Option<SagaInstance>> {
        if let Some(instance) = self.cache_get(saga_id) {
            return Ok(Some(instance));
        }
        let loaded = self.inner.load(saga_id).await?;
        if let Some(ref instance) = loaded {
            self.cache_put(instance);
        }
        Ok(loaded)
    }

    async fn save(&self, instance: &SagaInstance) -> Result<()> {
        self.inner.save(instance).await?;
        self.after_write(instance);
        Ok(())
    }

    async fn update_conditional(
        &self,
        instance: &SagaInstance,
        expected_version: u64,
    ) -> Result<()> {
        match self.inner.update_conditional(instance, expected_version).await {
            Ok(()) => {
                self.after_write(instance);
                Ok(())
            }
            Err(e) => {
                // The cached copy may be what misled the caller.
                self.invalidate(&instance.saga_id);
                Err(e)
            }
        }
    }

    async fn list_by_type(
        &self,
        saga_type: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>> {
        self.inner.list_by_type(saga_type, cursor, limit).await
    }

    async fn query_stuck(
        &self,
        threshold: ChronoDuration,
        limit: usize,
    ) -> Result<Vec<SagaInstance>> {
        self.inner.query_stuck(threshold, limit).await
    }

    async fn query_failed(&self, limit: usize) -> Result<Vec<SagaInstance>> {
        self.inner.query_failed(limit).await
    }

    async fn running_count(&self, saga_type: Option<&str>) -> Result<u64> {
        self.inner.running_count(saga_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::store::InMemorySagaStore;

    fn make_store(options: CachedSagaStoreOptions) -> (CachedSagaStore, Arc<InMemorySagaStore>) {
        let inner = Arc::new(InMemorySagaStore::new());
        (CachedSagaStore::new(inner.clone(), options), inner)
    }

    #[tokio::test]
    async fn test_load_populates_cache() {
        let (store, inner) = make_store(CachedSagaStoreOptions::default());
        inner.save(&SagaInstance::new("s1", "t")).await.unwrap();

        assert_eq!(store.cache_len(), 0);
        store.load("s1").await.unwrap().unwrap();
        assert_eq!(store.cache_len(), 1);

        // Second load is served from cache even if the inner row changes
        // underneath (within TTL).
        let mut mutated = SagaInstance::new("s1", "t");
        mutated.version = 99;
        inner.save(&mutated).await.unwrap();
        let cached = store.load("s1").await.unwrap().unwrap();
        assert_eq!(cached.version, 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_passes_through() {
        let options = CachedSagaStoreOptions {
            enable_caching: false,
            ..Default::default()
        };
        let (store, inner) = make_store(options);
        inner.save(&SagaInstance::new("s1", "t")).await.unwrap();

        store.load("s1").await.unwrap().unwrap();
        assert_eq!(store.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_on_update() {
        let (store, _inner) = make_store(CachedSagaStoreOptions::default());
        let instance = SagaInstance::new("s1", "t");
        store.save(&instance).await.unwrap();
        // Strict mode: the write dropped any entry.
        assert_eq!(store.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_refresh_on_update() {
        let options = CachedSagaStoreOptions {
            invalidate_cache_on_update: false,
            ..Default::default()
        };
        let (store, _inner) = make_store(options);
        let instance = SagaInstance::new("s1", "t");
        store.save(&instance).await.unwrap();
        assert_eq!(store.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_completion_state_never_misreported() {
        let options = CachedSagaStoreOptions {
            invalidate_cache_on_update: false,
            ..Default::default()
        };
        let (store, _inner) = make_store(options);

        let mut instance = SagaInstance::new("s1", "t");
        store.save(&instance).await.unwrap();
        assert!(!store.load("s1").await.unwrap().unwrap().is_completed);

        instance.is_completed = true;
        instance.completed_at = Some(chrono::Utc::now());
        instance.version = 1;
        store.save(&instance).await.unwrap();
        assert!(store.load("s1").await.unwrap().unwrap().is_completed);
    }

    #[tokio::test]
    async fn test_expired_entry_reloads() {
        let options = CachedSagaStoreOptions {
            active_saga_cache_ttl_secs: 0,
            default_cache_ttl_secs: 0,
            invalidate_cache_on_update: false,
            ..Default::default()
        };
        // Both TTLs zero collapse to a zero-duration TTL: every entry is
        // immediately stale.
        let (store, inner) = make_store(options);
        inner.save(&SagaInstance::new("s1", "t")).await.unwrap();

        store.load("s1").await.unwrap().unwrap();
        let mut mutated = SagaInstance::new("s1", "t");
        mutated.version = 7;
        inner.save(&mutated).await.unwrap();

        let reloaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(reloaded.version, 7);
    }

    #[tokio::test]
    async fn test_size_limit_evicts_stalest() {
        let options = CachedSagaStoreOptions {
            local_cache_size_limit: 2,
            invalidate_cache_on_update: false,
            ..Default::default()
        };
        let (store, _inner) = make_store(options);

        store.save(&SagaInstance::new("a", "t")).await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.save(&SagaInstance::new("b", "t")).await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.save(&SagaInstance::new("c", "t")).await.unwrap();

        assert_eq!(store.cache_len(), 2);
        let cache = store.cache.lock().unwrap();
        assert!(!cache.contains_key("a"));
        assert!(cache.contains_key("b"));
        assert!(cache.contains_key("c"));
    }

    #[tokio::test]
    async fn test_version_conflict_invalidates() {
        let options = CachedSagaStoreOptions {
            invalidate_cache_on_update: false,
            ..Default::default()
        };
        let (store, inner) = make_store(options);
        let mut instance = SagaInstance::new("s1", "t");
        store.save(&instance).await.unwrap();

        // Another writer bumps the version behind the cache's back.
        let mut other = instance.clone();
        other.version = 5;
        inner.save(&other).await.unwrap();

        instance.version = 1;
        let result = store.update_conditional(&instance, 0).await;
        assert!(result.is_err());
        assert_eq!(store.cache_len(), 0);
    }
}
