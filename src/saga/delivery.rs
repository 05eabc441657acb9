//! Durable timeout delivery.
//!
//! Polls the timeout store for due rows and dispatches each through the
//! in-process dispatcher. Two failure classes are kept apart: a timeout
//! whose type cannot be resolved (or is not saga-capable) can never be
//! delivered, so it is marked delivered and logged; a dispatcher failure
//! might succeed next pass, so the row stays in the store. The loop
//! survives per-cycle errors.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::timeouts::TimeoutStore;
use crate::dispatcher::{DispatchContext, Dispatcher, MessageEnvelope, MessageTypeRegistry};
use crate::health::JobHeartbeats;

/// Heartbeat key recorded by the loop.
pub const TIMEOUT_DELIVERY_JOB_NAME: &str = "saga-timeout-delivery";

/// Timeout delivery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaTimeoutOptions {
    /// Delay between polls, in milliseconds. Default: 100.
    pub poll_interval_ms: u64,
    /// Maximum timeouts delivered per pass. Default: 50.
    pub batch_size: usize,
    /// Log every delivery at debug level.
    pub enable_verbose_logging: bool,
}

impl Default for SagaTimeoutOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            batch_size: 50,
            enable_verbose_logging: false,
        }
    }
}

/// Handle to a running timeout delivery loop.
pub struct TimeoutDeliveryHandle {
    cancel: watch::Sender<bool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TimeoutDeliveryHandle {
    /// Signal the loop to stop after the current pass.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Run one delivery pass: poll due timeouts and dispatch them.
///
/// Returns the number of timeouts marked delivered.
pub async fn run_delivery_pass(
    timeouts: &dyn TimeoutStore,
    registry: &MessageTypeRegistry,
    dispatcher: &dyn Dispatcher,
    options: &SagaTimeoutOptions,
    cancel: &CancellationToken,
) -> crate::saga::Result<usize> {
    let due = timeouts.get_due(Utc::now(), options.batch_size).await?;
    let mut delivered = 0usize;

    for timeout in due {
        if cancel.is_cancelled() {
            break;
        }

        let Some(registered) = registry.resolve(&timeout.timeout_type).await else {
            warn!(
                timeout_id = %timeout.timeout_id,
                saga_id = %timeout.saga_id,
                timeout_type = %timeout.timeout_type,
                "Timeout type not registered, marking delivered"
            );
            timeouts.mark_delivered(&timeout.timeout_id).await?;
            delivered += 1;
            continue;
        };

        if !registered.saga_message {
            warn!(
                timeout_id = %timeout.timeout_id,
                saga_id = %timeout.saga_id,
                timeout_type = %timeout.timeout_type,
                "Timeout type is not saga-capable, marking delivered"
            );
            timeouts.mark_delivered(&timeout.timeout_id).await?;
            delivered += 1;
            continue;
        }

        let payload = timeout
            .payload
            .clone()
            .unwrap_or_else(|| registered.default_payload.clone());
        let mut envelope = MessageEnvelope::new(timeout.timeout_type.clone(), payload);
        envelope
            .headers
            .insert("saga-id".to_string(), timeout.saga_id.clone());
        envelope
            .headers
            .insert("timeout-id".to_string(), timeout.timeout_id.clone());
        let context = DispatchContext::timeout_delivery(Some(timeout.saga_id.clone()));

        match dispatcher.dispatch(envelope, context, cancel).await {
            Ok(()) => {
                timeouts.mark_delivered(&timeout.timeout_id).await?;
                delivered += 1;
                if options.enable_verbose_logging {
                    debug!(
                        timeout_id = %timeout.timeout_id,
                        saga_id = %timeout.saga_id,
                        "Timeout delivered"
                    );
                }
            }
            Err(e) => {
                // Left in the store; the next poll retries.
                error!(
                    timeout_id = %timeout.timeout_id,
                    saga_id = %timeout.saga_id,
                    error = %e,
                    "Timeout dispatch failed, will retry next pass"
                );
            }
        }
    }

    Ok(delivered)
}

/// Spawn the timeout delivery loop.
pub fn spawn_timeout_delivery(
    timeouts: Arc<dyn TimeoutStore>,
    registry: Arc<MessageTypeRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    options: SagaTimeoutOptions,
    heartbeats: Option<Arc<JobHeartbeats>>,
) -> TimeoutDeliveryHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let interval = std::time::Duration::from_millis(options.poll_interval_ms);
        let pass_cancel = CancellationToken::new();
        info!(
            poll_interval_ms = options.poll_interval_ms,
            batch_size = options.batch_size,
            "Saga timeout delivery started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Some(ref heartbeats) = heartbeats {
                        heartbeats.beat(TIMEOUT_DELIVERY_JOB_NAME);
                    }
                    if let Err(e) = run_delivery_pass(
                        timeouts.as_ref(),
                        registry.as_ref(),
                        dispatcher.as_ref(),
                        &options,
                        &pass_cancel,
                    )
                    .await
                    {
                        error!(error = %e, "Timeout delivery pass failed");
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        info!("Saga timeout delivery stopped");
                        break;
                    }
                }
            }
        }
    });

    TimeoutDeliveryHandle {
        cancel: cancel_tx,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatchSource, MockDispatcher};
    use crate::saga::timeouts::{InMemoryTimeoutStore, SagaTimeout};
    use chrono::Duration;

    fn due_timeout(id: &str, timeout_type: &str) -> SagaTimeout {
        let now = Utc::now();
        SagaTimeout {
            timeout_id: id.to_string(),
            saga_id: "ord-1".to_string(),
            saga_type: "order-fulfillment".to_string(),
            timeout_type: timeout_type.to_string(),
            payload: None,
            due_at: now - Duration::minutes(1),
            scheduled_at: now - Duration::minutes(2),
        }
    }

    struct Fixture {
        timeouts: InMemoryTimeoutStore,
        registry: MessageTypeRegistry,
        dispatcher: MockDispatcher,
        options: SagaTimeoutOptions,
    }

    async fn fixture() -> Fixture {
        let registry = MessageTypeRegistry::new();
        registry.register_saga_message("orders.ShippingTimedOut").await;
        Fixture {
            timeouts: InMemoryTimeoutStore::new(),
            registry,
            dispatcher: MockDispatcher::new(),
            options: SagaTimeoutOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_due_timeout_dispatched_and_marked() {
        let f = fixture().await;
        f.timeouts
            .schedule(due_timeout("t1", "orders.ShippingTimedOut"))
            .await
            .unwrap();

        let delivered = run_delivery_pass(
            &f.timeouts,
            &f.registry,
            &f.dispatcher,
            &f.options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(f.timeouts.count().await, 0);

        let dispatches = f.dispatcher.dispatches().await;
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].envelope.message_type, "orders.ShippingTimedOut");
        assert_eq!(dispatches[0].envelope.payload, b"{}");
        assert_eq!(dispatches[0].context.source, DispatchSource::TimeoutDelivery);
        assert_eq!(
            dispatches[0].context.correlation_id.as_deref(),
            Some("ord-1")
        );
    }

    #[tokio::test]
    async fn test_unresolvable_type_marked_delivered_without_dispatch() {
        let f = fixture().await;
        f.timeouts
            .schedule(due_timeout("t1", "orders.UnknownTimeout"))
            .await
            .unwrap();

        let delivered = run_delivery_pass(
            &f.timeouts,
            &f.registry,
            &f.dispatcher,
            &f.options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(f.timeouts.count().await, 0);
        assert_eq!(f.dispatcher.dispatched_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_saga_type_marked_delivered() {
        let f = fixture().await;
        f.registry
            .register(crate::dispatcher::RegisteredMessageType {
                name: "metrics.Flush".to_string(),
                saga_message: false,
                default_payload: vec![],
            })
            .await;
        f.timeouts
            .schedule(due_timeout("t1", "metrics.Flush"))
            .await
            .unwrap();

        let delivered = run_delivery_pass(
            &f.timeouts,
            &f.registry,
            &f.dispatcher,
            &f.options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(f.dispatcher.dispatched_count().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_failure_leaves_timeout_for_retry() {
        let f = fixture().await;
        f.timeouts
            .schedule(due_timeout("t1", "orders.ShippingTimedOut"))
            .await
            .unwrap();
        f.dispatcher.set_fail_with("saga busy").await;

        let delivered = run_delivery_pass(
            &f.timeouts,
            &f.registry,
            &f.dispatcher,
            &f.options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(delivered, 0);
        assert_eq!(f.timeouts.count().await, 1);

        // Recovery on a later pass.
        f.dispatcher.clear_failure().await;
        let delivered = run_delivery_pass(
            &f.timeouts,
            &f.registry,
            &f.dispatcher,
            &f.options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(f.timeouts.count().await, 0);
    }

    #[tokio::test]
    async fn test_stored_payload_wins_over_default() {
        let f = fixture().await;
        let mut timeout = due_timeout("t1", "orders.ShippingTimedOut");
        timeout.payload = Some(br#"{"attempt":2}"#.to_vec());
        f.timeouts.schedule(timeout).await.unwrap();

        run_delivery_pass(
            &f.timeouts,
            &f.registry,
            &f.dispatcher,
            &f.options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let dispatches = f.dispatcher.dispatches().await;
        assert_eq!(dispatches[0].envelope.payload, br#"{"attempt":2}"#);
    }

    #[tokio::test]
    async fn test_pass_respects_batch_size() {
        let f = fixture().await;
        for n in 0..5 {
            f.timeouts
                .schedule(due_timeout(&format!("t{n}"), "orders.ShippingTimedOut"))
                .await
                .unwrap();
        }
        let options = SagaTimeoutOptions {
            batch_size: 2,
            ..Default::default()
        };

        let delivered = run_delivery_pass(
            &f.timeouts,
            &f.registry,
            &f.dispatcher,
            &options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(f.timeouts.count().await, 3);
    }

    #[tokio::test]
    async fn test_background_loop_delivers_and_stops() {
        let timeouts: Arc<InMemoryTimeoutStore> = Arc::new(InMemoryTimeoutStore::new());
        let registry = Arc::new(MessageTypeRegistry::new());
        registry.register_saga_message("orders.ShippingTimedOut").await;
        let dispatcher = Arc::new(MockDispatcher::new());

        timeouts
            .schedule(due_timeout("t1", "orders.ShippingTimedOut"))
            .await
            .unwrap();

        let options = SagaTimeoutOptions {
            poll_interval_ms: 10,
            ..Default::default()
        };
        let heartbeats = Arc::new(JobHeartbeats::new());
        let handle = spawn_timeout_delivery(
            timeouts.clone(),
            registry,
            dispatcher.clone(),
            options,
            Some(heartbeats.clone()),
        );

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        handle.shutdown().await;

        assert_eq!(timeouts.count().await, 0);
        assert_eq!(dispatcher.dispatched_count().await, 1);
        assert!(heartbeats.last_beat(TIMEOUT_DELIVERY_JOB_NAME).is_some());
    }
}
