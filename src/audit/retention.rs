//! Time-based audit retention.
//!
//! A background sweep deletes events older than the retention horizon, up to
//! `batch_size` per pass, optionally archiving them first. Deleting the
//! oldest part of a hash chain would normally break verification, so the
//! behaviour is an explicit option: `Anchor` records the first surviving
//! event's expected predecessor hash as a checkpoint the integrity walk
//! accepts; `RefuseBreak` only ever deletes when nothing would survive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::store::{AuditStore, ChainAnchor};
use super::{AuditError, AuditEvent, Result};
use crate::health::JobHeartbeats;

/// Heartbeat key recorded by the sweep loop.
pub const RETENTION_JOB_NAME: &str = "audit-retention";

/// How retention treats the chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionCheckpointMode {
    /// Record an anchor checkpoint so the surviving range verifies.
    #[default]
    Anchor,
    /// Refuse any deletion that would leave survivors behind the cut.
    RefuseBreak,
}

/// Retention configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditRetentionOptions {
    /// Events older than this many days are eligible. Default: 7 years.
    pub retention_period_days: u64,
    /// Delay between sweep passes, in seconds. Default: 1 day.
    pub cleanup_interval_secs: u64,
    /// Maximum rows deleted per pass. Default: 10 000.
    pub batch_size: usize,
    /// Hand rows to the archiver before deleting them.
    pub archive_before_delete: bool,
    /// Chain-head behaviour.
    pub checkpoint_mode: RetentionCheckpointMode,
}

impl Default for AuditRetentionOptions {
    fn default() -> Self {
        Self {
            retention_period_days: 7 * 365,
            cleanup_interval_secs: 24 * 60 * 60,
            batch_size: 10_000,
            archive_before_delete: false,
            checkpoint_mode: RetentionCheckpointMode::Anchor,
        }
    }
}

impl AuditRetentionOptions {
    /// Retention horizon as a `chrono` duration.
    pub fn retention_period(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_period_days as i64)
    }

    /// Sweep cadence.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Receives expiring events before deletion.
#[async_trait]
pub trait AuditArchiver: Send + Sync {
    /// Persist `events` somewhere colder. An error aborts the pass before
    /// anything is deleted.
    async fn archive(&self, events: &[AuditEvent]) -> Result<()>;
}

/// One-pass retention service; the background loop calls [`run_once`].
///
/// [`run_once`]: AuditRetentionService::run_once
pub struct AuditRetentionService {
    store: Arc<dyn AuditStore>,
    archiver: Option<Arc<dyn AuditArchiver>>,
    options: AuditRetentionOptions,
}

impl AuditRetentionService {
    /// Create a service over `store`.
    pub fn new(store: Arc<dyn AuditStore>, options: AuditRetentionOptions) -> Self {
        Self {
            store,
            archiver: None,
            options,
        }
    }

    /// Attach the archival collaborator.
    pub fn with_archiver(mut self, archiver: Arc<dyn AuditArchiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Delete (and optionally archive) one batch past the horizon.
    ///
    /// Returns the number of deleted events.
    pub async fn run_once(&self) -> Result<usize> {
        let horizon = Utc::now() - self.options.retention_period();
        let batch = self
            .store
            .oldest_events(horizon, self.options.batch_size)
            .await?;
        let Some(last) = batch.last() else {
            return Ok(0);
        };

        if self.options.checkpoint_mode == RetentionCheckpointMode::RefuseBreak {
            let latest = self.store.latest_sequence().await?;
            if latest != Some(last.sequence_number) {
                warn!(
                    batch = batch.len(),
                    "Retention refused: deletion would leave survivors behind the cut"
                );
                return Ok(0);
            }
        }

        if self.options.archive_before_delete {
            let archiver = self.archiver.as_ref().ok_or(AuditError::Configuration(
                "archive_before_delete set but no archiver configured",
            ))?;
            archiver.archive(&batch).await?;
        }

        let anchor = ChainAnchor {
            sequence: last.sequence_number + 1,
            previous_event_hash: last.event_hash.clone(),
        };
        let deleted = self.store.delete_up_to(last.sequence_number, anchor).await?;
        info!(
            deleted = deleted,
            up_to_sequence = last.sequence_number,
            "Audit retention pass complete"
        );
        Ok(deleted)
    }
}

/// Handle to a running retention sweep.
pub struct RetentionSweepHandle {
    cancel: watch::Sender<bool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl RetentionSweepHandle {
    /// Signal the sweep to stop after the current pass.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop and wait for the sweep to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Spawn the retention sweep loop.
pub fn spawn_retention_sweep(
    service: Arc<AuditRetentionService>,
    heartbeats: Option<Arc<JobHeartbeats>>,
) -> RetentionSweepHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let interval = service.options.cleanup_interval();

    let handle = tokio::spawn(async move {
        info!(
            cleanup_interval_secs = interval.as_secs(),
            "Audit retention sweep started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Some(ref heartbeats) = heartbeats {
                        heartbeats.beat(RETENTION_JOB_NAME);
                    }
                    if let Err(e) = service.run_once().await {
                        error!(error = %e, "Audit retention pass failed");
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        info!("Audit retention sweep stopped");
                        break;
                    }
                }
            }
        }
    });

    RetentionSweepHandle {
        cancel: cancel_tx,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::memory::InMemoryAuditStore;
    use crate::audit::{AuditEventType, AuditOutcome};
    use tokio::sync::Mutex;

    fn make_event(action: &str) -> AuditEvent {
        AuditEvent::new(AuditEventType::System, action, "system", AuditOutcome::Success)
    }

    /// Store seeded with `count` events whose timestamps sit in the past.
    async fn aged_store(count: usize) -> Arc<InMemoryAuditStore> {
        let store = Arc::new(InMemoryAuditStore::default());
        for n in 0..count {
            let mut event = make_event(&format!("Action{n}"));
            event.timestamp = Utc::now() - chrono::Duration::days(10);
            store.store(event).await.unwrap();
        }
        store
    }

    fn short_retention(mode: RetentionCheckpointMode) -> AuditRetentionOptions {
        AuditRetentionOptions {
            retention_period_days: 1,
            batch_size: 10,
            checkpoint_mode: mode,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_defaults() {
        let options = AuditRetentionOptions::default();
        assert_eq!(options.retention_period_days, 2555);
        assert_eq!(options.cleanup_interval(), Duration::from_secs(86_400));
        assert_eq!(options.batch_size, 10_000);
        assert!(!options.archive_before_delete);
        assert_eq!(options.checkpoint_mode, RetentionCheckpointMode::Anchor);
    }

    #[tokio::test]
    async fn test_run_once_deletes_expired_and_anchors() {
        let store = aged_store(3).await;
        // One fresh event that must survive.
        store.store(make_event("Fresh")).await.unwrap();

        let service = AuditRetentionService::new(
            store.clone(),
            short_retention(RetentionCheckpointMode::Anchor),
        );
        let deleted = service.run_once().await.unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(store.len().await, 1);
        assert!(store.anchor().await.is_some());
        assert!(store
            .verify_chain_integrity(None, None)
            .await
            .unwrap()
            .is_valid());
    }

    #[tokio::test]
    async fn test_run_once_respects_batch_size() {
        let store = aged_store(5).await;
        let options = AuditRetentionOptions {
            retention_period_days: 1,
            batch_size: 2,
            ..Default::default()
        };
        let service = AuditRetentionService::new(store.clone(), options);

        assert_eq!(service.run_once().await.unwrap(), 2);
        assert_eq!(store.len().await, 3);
        assert_eq!(service.run_once().await.unwrap(), 2);
        assert_eq!(service.run_once().await.unwrap(), 1);
        assert_eq!(service.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nothing_expired_is_noop() {
        let store = Arc::new(InMemoryAuditStore::default());
        store.store(make_event("Fresh")).await.unwrap();

        let service = AuditRetentionService::new(
            store.clone(),
            short_retention(RetentionCheckpointMode::Anchor),
        );
        assert_eq!(service.run_once().await.unwrap(), 0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_refuse_break_blocks_partial_deletion() {
        let store = aged_store(3).await;
        store.store(make_event("Fresh")).await.unwrap();

        let service = AuditRetentionService::new(
            store.clone(),
            short_retention(RetentionCheckpointMode::RefuseBreak),
        );
        assert_eq!(service.run_once().await.unwrap(), 0);
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn test_refuse_break_allows_full_wipe() {
        let store = aged_store(3).await;
        let service = AuditRetentionService::new(
            store.clone(),
            short_retention(RetentionCheckpointMode::RefuseBreak),
        );
        assert_eq!(service.run_once().await.unwrap(), 3);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_archive_before_delete() {
        struct CollectingArchiver {
            archived: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl AuditArchiver for CollectingArchiver {
            async fn archive(&self, events: &[AuditEvent]) -> Result<()> {
                let mut archived = self.archived.lock().await;
                archived.extend(events.iter().map(|e| e.event_id.clone()));
                Ok(())
            }
        }

        let store = aged_store(2).await;
        let archiver = Arc::new(CollectingArchiver {
            archived: Mutex::new(Vec::new()),
        });
        let options = AuditRetentionOptions {
            retention_period_days: 1,
            archive_before_delete: true,
            ..Default::default()
        };
        let service =
            AuditRetentionService::new(store.clone(), options).with_archiver(archiver.clone());

        assert_eq!(service.run_once().await.unwrap(), 2);
        assert_eq!(archiver.archived.lock().await.len(), 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_archiver_is_configuration_error() {
        let store = aged_store(1).await;
        let options = AuditRetentionOptions {
            retention_period_days: 1,
            archive_before_delete: true,
            ..Default::default()
        };
        let service = AuditRetentionService::new(store.clone(), options);

        assert!(matches!(
            service.run_once().await,
            Err(AuditError::Configuration(_))
        ));
        // Nothing deleted on the failed pass.
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_archiver_failure_aborts_before_delete() {
        struct BrokenArchiver;
        #[async_trait]
        impl AuditArchiver for BrokenArchiver {
            async fn archive(&self, _: &[AuditEvent]) -> Result<()> {
                Err(AuditError::Storage("cold storage down".to_string()))
            }
        }

        let store = aged_store(2).await;
        let options = AuditRetentionOptions {
            retention_period_days: 1,
            archive_before_delete: true,
            ..Default::default()
        };
        let service = AuditRetentionService::new(store.clone(), options)
            .with_archiver(Arc::new(BrokenArchiver));

        assert!(service.run_once().await.is_err());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_background_sweep_runs_and_stops() {
        let store = aged_store(2).await;
        let options = AuditRetentionOptions {
            retention_period_days: 1,
            cleanup_interval_secs: 0,
            ..Default::default()
        };
        // Zero interval makes the loop tick immediately in tests.
        let service = Arc::new(AuditRetentionService::new(store.clone(), options));
        let heartbeats = Arc::new(JobHeartbeats::new());
        let handle = spawn_retention_sweep(service, Some(heartbeats.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert!(store.is_empty().await);
        assert!(heartbeats.last_beat(RETENTION_JOB_NAME).is_some());
    }
}
