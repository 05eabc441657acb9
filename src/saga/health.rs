//! Saga health probe.
//!
//! Maps stuck/failed instance counts to a health status:
//! `stuck >= unhealthy_stuck_threshold` is unhealthy, else
//! `failed >= degraded_failed_threshold` is degraded, else healthy. A probe
//! failure is itself unhealthy, with the error attached to the report.

use std::sync::Arc;

use chrono::Duration;
use serde::Deserialize;
use tracing::warn;

use super::store::SagaStateStore;
use crate::health::HealthStatus;

/// Saga health thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaHealthOptions {
    /// Query limit for the stuck-instance probe.
    pub stuck_limit: usize,
    /// Query limit for the failed-instance probe.
    pub failed_limit: usize,
    /// Stuck count at or above which the check is unhealthy.
    pub unhealthy_stuck_threshold: usize,
    /// Failed count at or above which the check is degraded.
    pub degraded_failed_threshold: usize,
    /// Age in minutes past which an open instance counts as stuck.
    pub stuck_threshold_minutes: i64,
}

impl Default for SagaHealthOptions {
    fn default() -> Self {
        Self {
            stuck_limit: 100,
            failed_limit: 100,
            unhealthy_stuck_threshold: 10,
            degraded_failed_threshold: 5,
            stuck_threshold_minutes: 30,
        }
    }
}

/// Result of one saga health probe.
#[derive(Debug, Clone)]
pub struct SagaHealthReport {
    /// Overall classification.
    pub status: HealthStatus,
    /// Open instance count.
    pub running: u64,
    /// Stuck instance count (capped by `stuck_limit`).
    pub stuck: usize,
    /// Failed instance count (capped by `failed_limit`).
    pub failed: usize,
    /// Threshold used for the stuck query, in minutes.
    pub stuck_threshold_minutes: i64,
    /// Probe error, when the check itself failed.
    pub error: Option<String>,
}

/// Probes a saga store and classifies its health.
pub struct SagaHealthCheck {
    store: Arc<dyn SagaStateStore>,
    options: SagaHealthOptions,
}

impl SagaHealthCheck {
    /// Create a check over `store`.
    pub fn new(store: Arc<dyn SagaStateStore>, options: SagaHealthOptions) -> Self {
        Self { store, options }
    }

    /// Run one probe.
    pub async fn check(&self) -> SagaHealthReport {
        let threshold = Duration::minutes(self.options.stuck_threshold_minutes);

        let probe = async {
            let running = self.store.running_count(None).await?;
            let stuck = self
                .store
                .query_stuck(threshold, self.options.stuck_limit)
                .await?
                .len();
            let failed = self
                .store
                .query_failed(self.options.failed_limit)
                .await?
                .len();
            Ok::<_, super::SagaError>((running, stuck, failed))
        };

        match probe.await {
            Ok((running, stuck, failed)) => {
                let status = if stuck >= self.options.unhealthy_stuck_threshold {
                    HealthStatus::Unhealthy
                } else if failed >= self.options.degraded_failed_threshold {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                SagaHealthReport {
                    status,
                    running,
                    stuck,
                    failed,
                    stuck_threshold_minutes: self.options.stuck_threshold_minutes,
                    error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Saga health probe failed");
                SagaHealthReport {
                    status: HealthStatus::Unhealthy,
                    running: 0,
                    stuck: 0,
                    failed: 0,
                    stuck_threshold_minutes: self.options.stuck_threshold_minutes,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
