//! Rule-based audit alerting.
//!
//! Rules are pure predicates over audit events, registered under a unique
//! name (re-registration replaces). Matching events produce alerts through a
//! notification channel, throttled by a token bucket that refills to
//! `max_alerts_per_minute` over a rolling minute. A buggy rule must never
//! stop the pipeline: predicate panics are swallowed and evaluation moves to
//! the next rule.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AuditError, AuditEvent, Result};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// When rules are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertEvaluationMode {
    /// Evaluate each event as it arrives.
    #[default]
    RealTime,
    /// Evaluate whole batches; the alert quota applies across the batch.
    Batch,
}

/// Alert engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditAlertOptions {
    /// Evaluation mode. Default: real-time.
    pub evaluation_mode: AlertEvaluationMode,
    /// Alert quota per rolling minute. Default: 100.
    pub max_alerts_per_minute: u32,
}

impl Default for AuditAlertOptions {
    fn default() -> Self {
        Self {
            evaluation_mode: AlertEvaluationMode::RealTime,
            max_alerts_per_minute: 100,
        }
    }
}

/// A registered alert rule.
pub struct AuditAlertRule {
    /// Unique rule name; re-registration replaces.
    pub name: String,
    /// Pure predicate over events.
    pub condition: Arc<dyn Fn(&AuditEvent) -> bool + Send + Sync>,
    /// Severity attached to emitted alerts.
    pub severity: AlertSeverity,
    /// Optional channel routing hint carried on the alert.
    pub notification_channel: Option<String>,
}

impl AuditAlertRule {
    /// Build a rule.
    pub fn new(
        name: impl Into<String>,
        severity: AlertSeverity,
        condition: impl Fn(&AuditEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            condition: Arc::new(condition),
            severity,
            notification_channel: None,
        }
    }

    /// Attach a channel routing hint.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.notification_channel = Some(channel.into());
        self
    }
}

/// An alert produced by a matching rule.
#[derive(Debug, Clone)]
pub struct AuditAlert {
    /// Name of the matching rule.
    pub rule_name: String,
    /// Severity from the rule.
    pub severity: AlertSeverity,
    /// Channel routing hint from the rule.
    pub notification_channel: Option<String>,
    /// The matching event.
    pub event: AuditEvent,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

/// Delivers alerts to operators.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Deliver one alert.
    async fn notify(&self, alert: AuditAlert) -> Result<()>;
}

/// Recording channel for tests.
#[derive(Default)]
pub struct RecordingNotificationChannel {
    alerts: Mutex<Vec<AuditAlert>>,
}

impl RecordingNotificationChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delivered alerts.
    pub async fn alert_count(&self) -> usize {
        self.alerts.lock().await.len()
    }

    /// Snapshot of delivered alerts in order.
    pub async fn alerts(&self) -> Vec<AuditAlert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingNotificationChannel {
    async fn notify(&self, alert: AuditAlert) -> Result<()> {
        self.alerts.lock().await.push(alert);
        Ok(())
    }
}

/// Rolling-minute token bucket.
struct AlertQuota {
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
}

impl AlertQuota {
    fn new(max_per_minute: u32) -> Self {
        let capacity = max_per_minute as f64;
        Self {
            tokens: capacity,
            capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.capacity / 60.0).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Evaluates rules against events and dispatches rate-limited alerts.
pub struct AuditAlertEngine {
    rules: RwLock<Vec<AuditAlertRule>>,
    channel: Arc<dyn NotificationChannel>,
    options: AuditAlertOptions,
    quota: Mutex<AlertQuota>,
    evaluations: AtomicU64,
    alerts_sent: AtomicU64,
    alerts_suppressed: AtomicU64,
}

impl AuditAlertEngine {
    /// Create an engine dispatching through `channel`.
    pub fn new(channel: Arc<dyn NotificationChannel>, options: AuditAlertOptions) -> Self {
        let quota = AlertQuota::new(options.max_alerts_per_minute);
        Self {
            rules: RwLock::new(Vec::new()),
            channel,
            options,
            quota: Mutex::new(quota),
            evaluations: AtomicU64::new(0),
            alerts_sent: AtomicU64::new(0),
            alerts_suppressed: AtomicU64::new(0),
        }
    }

    /// Configured evaluation mode.
    pub fn evaluation_mode(&self) -> AlertEvaluationMode {
        self.options.evaluation_mode
    }

    /// Register a rule; an existing rule with the same name is replaced.
    pub async fn register_rule(&self, rule: AuditAlertRule) -> Result<()> {
        if rule.name.is_empty() {
            return Err(AuditError::InvalidArgument("rule name must not be empty"));
        }
        let mut rules = self.rules.write().await;
        if let Some(existing) = rules.iter_mut().find(|r| r.name == rule.name) {
            info!(rule = %rule.name, "Alert rule replaced");
            *existing = rule;
        } else {
            info!(rule = %rule.name, "Alert rule registered");
            rules.push(rule);
        }
        Ok(())
    }

    /// Remove a rule by name. Unknown names are no-ops.
    pub async fn unregister_rule(&self, name: &str) {
        let mut rules = self.rules.write().await;
        rules.retain(|r| r.name != name);
    }

    /// Number of registered rules.
    pub async fn rule_count(&self) -> usize {
        self.rules.read().await.len()
    }

    /// Evaluate every rule against one event.
    pub async fn evaluate(&self, event: &AuditEvent, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }
        if event.event_id.is_empty() {
            return Err(AuditError::InvalidArgument("event_id must not be empty"));
        }

        let rules = self.rules.read().await;
        for rule in rules.iter() {
            if cancel.is_cancelled() {
                return Err(AuditError::Cancelled);
            }
            self.evaluations.fetch_add(1, Ordering::Relaxed);

            let condition = Arc::clone(&rule.condition);
            let matched = match catch_unwind(AssertUnwindSafe(|| condition(event))) {
                Ok(matched) => matched,
                Err(_) => {
                    error!(rule = %rule.name, "Alert rule panicked, skipped");
                    continue;
                }
            };
            if !matched {
                continue;
            }

            if !self.quota.lock().await.try_consume() {
                self.alerts_suppressed.fetch_add(1, Ordering::Relaxed);
                warn!(rule = %rule.name, event_id = %event.event_id, "Alert suppressed by quota");
                continue;
            }

            let alert = AuditAlert {
                rule_name: rule.name.clone(),
                severity: rule.severity,
                notification_channel: rule.notification_channel.clone(),
                event: event.clone(),
                timestamp: Utc::now(),
            };
            match self.channel.notify(alert).await {
                Ok(()) => {
                    self.alerts_sent.fetch_add(1, Ordering::Relaxed);
                    debug!(rule = %rule.name, event_id = %event.event_id, "Alert dispatched");
                }
                Err(e) => {
                    error!(rule = %rule.name, error = %e, "Alert notification failed");
                }
            }
        }
        Ok(())
    }

    /// Evaluate a batch; the quota applies across the whole batch.
    pub async fn evaluate_batch(
        &self,
        events: &[AuditEvent],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for event in events {
            self.evaluate(event, cancel).await?;
        }
        Ok(())
    }

    /// Total condition evaluations.
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// Alerts delivered.
    pub fn alerts_sent(&self) -> u64 {
        self.alerts_sent.load(Ordering::Relaxed)
    }

    /// Alerts dropped by the quota.
    pub fn alerts_suppressed(&self) -> u64 {
        self.alerts_suppressed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, AuditOutcome};

    fn make_event(outcome: AuditOutcome) -> AuditEvent {
        AuditEvent::new(AuditEventType::Authentication, "User.Login", "user-1", outcome)
    }

    fn engine_with(
        max_alerts_per_minute: u32,
    ) -> (AuditAlertEngine, Arc<RecordingNotificationChannel>) {
        let channel = Arc::new(RecordingNotificationChannel::new());
        let engine = AuditAlertEngine::new(
            channel.clone(),
            AuditAlertOptions {
                max_alerts_per_minute,
                ..Default::default()
            },
        );
        (engine, channel)
    }

    #[tokio::test]
    async fn test_matching_rule_dispatches_alert() {
        let (engine, channel) = engine_with(100);
        engine
            .register_rule(AuditAlertRule::new(
                "failed-logins",
                AlertSeverity::Warning,
                |event| event.outcome == AuditOutcome::Failure,
            ))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        engine
            .evaluate(&make_event(AuditOutcome::Failure), &cancel)
            .await
            .unwrap();
        engine
            .evaluate(&make_event(AuditOutcome::Success), &cancel)
            .await
            .unwrap();

        let alerts = channel.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_name, "failed-logins");
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(engine.evaluation_count(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_caps_alerts_not_evaluations() {
        let (engine, channel) = engine_with(2);
        engine
            .register_rule(AuditAlertRule::new(
                "everything",
                AlertSeverity::Info,
                |_| true,
            ))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        for _ in 0..5 {
            engine
                .evaluate(&make_event(AuditOutcome::Success), &cancel)
                .await
                .unwrap();
        }

        assert_eq!(channel.alert_count().await, 2);
        assert_eq!(engine.evaluation_count(), 5);
        assert_eq!(engine.alerts_sent(), 2);
        assert_eq!(engine.alerts_suppressed(), 3);
    }

    #[tokio::test]
    async fn test_batch_mode_applies_quota_across_batch() {
        let (engine, channel) = engine_with(2);
        engine
            .register_rule(AuditAlertRule::new(
                "everything",
                AlertSeverity::Info,
                |_| true,
            ))
            .await
            .unwrap();

        let batch: Vec<AuditEvent> = (0..5).map(|_| make_event(AuditOutcome::Success)).collect();
        engine
            .evaluate_batch(&batch, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(channel.alert_count().await, 2);
    }

    #[tokio::test]
    async fn test_panicking_rule_does_not_stop_pipeline() {
        let (engine, channel) = engine_with(100);
        engine
            .register_rule(AuditAlertRule::new("buggy", AlertSeverity::Critical, |_| {
                panic!("rule bug")
            }))
            .await
            .unwrap();
        engine
            .register_rule(AuditAlertRule::new("sound", AlertSeverity::Info, |_| true))
            .await
            .unwrap();

        engine
            .evaluate(&make_event(AuditOutcome::Success), &CancellationToken::new())
            .await
            .unwrap();

        let alerts = channel.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_name, "sound");
    }

    #[tokio::test]
    async fn test_reregistration_replaces_rule() {
        let (engine, channel) = engine_with(100);
        engine
            .register_rule(AuditAlertRule::new("r", AlertSeverity::Info, |_| true))
            .await
            .unwrap();
        engine
            .register_rule(AuditAlertRule::new("r", AlertSeverity::Critical, |_| false))
            .await
            .unwrap();
        assert_eq!(engine.rule_count().await, 1);

        engine
            .evaluate(&make_event(AuditOutcome::Success), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(channel.alert_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_rule_name_rejected() {
        let (engine, _channel) = engine_with(100);
        let result = engine
            .register_rule(AuditAlertRule::new("", AlertSeverity::Info, |_| true))
            .await;
        assert!(matches!(result, Err(AuditError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let (engine, _channel) = engine_with(100);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine.evaluate(&make_event(AuditOutcome::Success), &cancel).await;
        assert!(matches!(result, Err(AuditError::Cancelled)));
    }

    #[tokio::test]
    async fn test_channel_failure_logged_not_propagated() {
        struct FailingChannel;
        #[async_trait]
        impl NotificationChannel for FailingChannel {
            async fn notify(&self, _: AuditAlert) -> Result<()> {
                Err(AuditError::Notification("pager down".to_string()))
            }
        }

        let engine = AuditAlertEngine::new(Arc::new(FailingChannel), AuditAlertOptions::default());
        engine
            .register_rule(AuditAlertRule::new("r", AlertSeverity::Info, |_| true))
            .await
            .unwrap();

        // The failure is recorded, not raised.
        engine
            .evaluate(&make_event(AuditOutcome::Success), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(engine.alerts_sent(), 0);
    }
}
