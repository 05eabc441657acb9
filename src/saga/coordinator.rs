//! Saga coordinator.
//!
//! Owns the saga lifecycle: resolves the saga type for an incoming event,
//! looks up or creates the instance under a per-instance lock, checks
//! idempotency, applies the saga's `handle`, persists the result, then
//! schedules/cancels timeouts and stages outbound messages in the outbox.
//! The per-instance lock serialises event application per `saga_id` and is
//! released before the outbox sees anything.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::idempotency::IdempotencyProvider;
use super::store::SagaStateStore;
use super::timeouts::{SagaTimeout, TimeoutStore};
use super::{Result, Saga, SagaError, SagaInstance, SagaOutcome};
use crate::dispatcher::MessageEnvelope;
use crate::outbox::{OutboundMessage, OutboxStore};

/// How the coordinator disposed of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaHandleResult {
    /// No registered saga consumes this message type, or the event carried
    /// no usable correlation.
    Ignored,
    /// The event's idempotency key was already processed for this saga.
    Duplicate,
    /// The event was applied.
    Applied {
        /// Instance the event was applied to.
        saga_id: String,
        /// Whether this event completed the saga.
        completed: bool,
    },
}

/// Coordinates saga instances, their timeouts, and their outbound messages.
pub struct SagaCoordinator {
    sagas: Vec<Arc<dyn Saga>>,
    store: Arc<dyn SagaStateStore>,
    timeouts: Arc<dyn TimeoutStore>,
    idempotency: Arc<dyn IdempotencyProvider>,
    outbox: Arc<dyn OutboxStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SagaCoordinator {
    /// Create a coordinator with no registered sagas.
    pub fn new(
        store: Arc<dyn SagaStateStore>,
        timeouts: Arc<dyn TimeoutStore>,
        idempotency: Arc<dyn IdempotencyProvider>,
        outbox: Arc<dyn OutboxStore>,
    ) -> Self {
        Self {
            sagas: Vec::new(),
            store,
            timeouts,
            idempotency,
            outbox,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a saga type. Resolution is first-match in registration
    /// order.
    pub fn register(mut self, saga: Arc<dyn Saga>) -> Self {
        info!(saga_type = %saga.saga_type(), "Saga registered");
        self.sagas.push(saga);
        self
    }

    async fn instance_lock(&self, saga_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(saga_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply one event to whichever saga consumes its message type.
    pub async fn handle_event(
        &self,
        envelope: MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<SagaHandleResult> {
        if cancel.is_cancelled() {
            return Err(SagaError::Cancelled);
        }

        let Some(saga) = self
            .sagas
            .iter()
            .find(|s| s.handles(&envelope.message_type))
        else {
            debug!(message_type = %envelope.message_type, "No saga consumes message type");
            return Ok(SagaHandleResult::Ignored);
        };

        let Some(saga_id) = saga.correlate(&envelope) else {
            warn!(
                saga_type = %saga.saga_type(),
                message_type = %envelope.message_type,
                "Event carried no correlation, ignored"
            );
            return Ok(SagaHandleResult::Ignored);
        };

        let lock = self.instance_lock(&saga_id).await;
        let guard = lock.lock().await;

        let idempotency_key = saga.idempotency_key(&envelope);
        if let Some(ref key) = idempotency_key {
            if self.idempotency.is_processed(&saga_id, key, cancel).await? {
                debug!(saga_id = %saga_id, key = %key, "Duplicate event skipped");
                return Ok(SagaHandleResult::Duplicate);
            }
        }

        let (mut instance, is_new) = match self.store.load(&saga_id).await? {
            Some(instance) => (instance, false),
            None => (
                SagaInstance::new(saga_id.clone(), saga.saga_type()),
                true,
            ),
        };

        if instance.is_completed {
            debug!(saga_id = %saga_id, "Event for completed saga ignored");
            return Ok(SagaHandleResult::Ignored);
        }

        let outcome = match saga.handle(&instance, &envelope).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Record the failure for the monitoring surface, then
                // surface the handler error unchanged.
                let description = e.to_string();
                instance.failure_reason = Some(description.clone());
                instance.updated_at = Utc::now();
                let expected = instance.version;
                instance.version += 1;
                let persist = if is_new {
                    self.store.save(&instance).await
                } else {
                    self.store.update_conditional(&instance, expected).await
                };
                if let Err(persist_err) = persist {
                    error!(saga_id = %saga_id, error = %persist_err, "Failed to record saga failure");
                }
                error!(saga_id = %saga_id, error = %description, "Saga handler failed");
                return Err(SagaError::Handler(description));
            }
        };

        let completed = self
            .apply_outcome(&mut instance, is_new, &outcome)
            .await?;

        if let Some(ref key) = idempotency_key {
            self.idempotency.mark_processed(&saga_id, key, cancel).await?;
        }

        // Timeout bookkeeping happens while the instance is still ours.
        for timeout_id in &outcome.cancel_timeouts {
            self.timeouts.cancel(&saga_id, timeout_id).await?;
        }
        if completed {
            self.timeouts.cancel_all(&saga_id).await?;
        } else {
            for request in &outcome.schedule_timeouts {
                // A handler may ask for an already-due timeout; clamp so the
                // schedule invariant (due_at >= scheduled_at) holds.
                let scheduled_at = Utc::now().min(request.due_at);
                self.timeouts
                    .schedule(SagaTimeout {
                        timeout_id: request.timeout_id.clone(),
                        saga_id: saga_id.clone(),
                        saga_type: instance.saga_type.clone(),
                        timeout_type: request.timeout_type.clone(),
                        payload: request.payload.clone(),
                        due_at: request.due_at,
                        scheduled_at,
                    })
                    .await?;
            }
        }

        // Release the per-instance lock before touching the outbox.
        drop(guard);

        for outbound in &outcome.outbound {
            let message = OutboundMessage::new(
                Uuid::new_v4().to_string(),
                outbound.message_type.clone(),
                outbound.payload.clone(),
                outbound.destination.clone(),
                None,
            )
            .with_correlation_id(saga_id.clone());
            self.outbox
                .stage(message)
                .await
                .map_err(|e| SagaError::Storage(e.to_string()))?;
        }

        debug!(
            saga_id = %saga_id,
            completed = completed,
            outbound = outcome.outbound.len(),
            "Saga event applied"
        );
        Ok(SagaHandleResult::Applied { saga_id, completed })
    }

    async fn apply_outcome(
        &self,
        instance: &mut SagaInstance,
        is_new: bool,
        outcome: &SagaOutcome,
    ) -> Result<bool> {
        if let Some(ref state) = outcome.new_state {
            instance.state = state.clone();
        }
        instance.failure_reason = None;
        instance.updated_at = Utc::now();
        if outcome.complete {
            instance.is_completed = true;
            instance.completed_at = Some(instance.updated_at);
        }
        let expected = instance.version;
        instance.version += 1;

        if is_new {
            self.store.save(instance).await?;
        } else {
            self.store.update_conditional(instance, expected).await?;
        }
        Ok(outcome.complete)
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Open instances whose last update is older than `threshold`.
    pub async fn stuck_sagas(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<SagaInstance>> {
        self.store.query_stuck(threshold, limit).await
    }

    /// Open instances with a recorded failure.
    pub async fn failed_sagas(&self, limit: usize) -> Result<Vec<SagaInstance>> {
        self.store.query_failed(limit).await
    }

    /// Count of open instances, optionally by type.
    pub async fn running_count(&self, saga_type: Option<&str>) -> Result<u64> {
        self.store.running_count(saga_type).await
    }
}
