//! Health surface: job heartbeats.
//!
//! Every background worker records a heartbeat keyed by job name on each
//! tick. The registry maps heartbeat age to a health status with two
//! thresholds; a job that never beat is unhealthy. Saga-specific health
//! lives in `saga::health` and reuses [`HealthStatus`].

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Tri-state health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Operating, but a threshold has been crossed.
    Degraded,
    /// Not operating, or past the unhealthy threshold.
    Unhealthy,
}

/// Heartbeat age thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatOptions {
    /// Age past which a job is degraded, in seconds. Default: 5 minutes.
    pub degraded_threshold_secs: u64,
    /// Age past which a job is unhealthy, in seconds. Default: 10 minutes.
    pub unhealthy_threshold_secs: u64,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            degraded_threshold_secs: 5 * 60,
            unhealthy_threshold_secs: 10 * 60,
        }
    }
}

impl HeartbeatOptions {
    /// Degraded threshold as a `Duration`.
    pub fn degraded_threshold(&self) -> Duration {
        Duration::from_secs(self.degraded_threshold_secs)
    }

    /// Unhealthy threshold as a `Duration`.
    pub fn unhealthy_threshold(&self) -> Duration {
        Duration::from_secs(self.unhealthy_threshold_secs)
    }
}

/// Health of one named job.
#[derive(Debug, Clone)]
pub struct JobHealth {
    /// Job name.
    pub job: String,
    /// Most recent heartbeat, if any.
    pub last_beat: Option<DateTime<Utc>>,
    /// Classification at report time.
    pub status: HealthStatus,
}

/// Registry of background job heartbeats.
///
/// Uses a std lock so threaded workers can beat without an async context.
#[derive(Default)]
pub struct JobHeartbeats {
    beats: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl JobHeartbeats {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat for `job` at the current instant.
    pub fn beat(&self, job: &str) {
        let mut beats = self.beats.write().unwrap_or_else(|e| e.into_inner());
        beats.insert(job.to_string(), Utc::now());
    }

    /// Most recent heartbeat for `job`.
    pub fn last_beat(&self, job: &str) -> Option<DateTime<Utc>> {
        let beats = self.beats.read().unwrap_or_else(|e| e.into_inner());
        beats.get(job).copied()
    }

    /// Classify one job by heartbeat age. Missing heartbeat is unhealthy.
    pub fn status(&self, job: &str, options: &HeartbeatOptions) -> HealthStatus {
        match self.last_beat(job) {
            None => HealthStatus::Unhealthy,
            Some(last) => classify_age(Utc::now() - last, options),
        }
    }

    /// Snapshot of every registered job's health.
    pub fn report(&self, options: &HeartbeatOptions) -> Vec<JobHealth> {
        let beats = self.beats.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut report: Vec<JobHealth> = beats
            .iter()
            .map(|(job, last)| JobHealth {
                job: job.clone(),
                last_beat: Some(*last),
                status: classify_age(now - *last, options),
            })
            .collect();
        report.sort_by(|a, b| a.job.cmp(&b.job));
        report
    }
}

fn classify_age(age: chrono::Duration, options: &HeartbeatOptions) -> HealthStatus {
    let age = age.to_std().unwrap_or(Duration::ZERO);
    if age >= options.unhealthy_threshold() {
        HealthStatus::Unhealthy
    } else if age >= options.degraded_threshold() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
