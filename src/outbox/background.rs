//! Background outbox processing loop.
//!
//! Fires publisher cycles on a configurable cadence: pending, then scheduled
//! (when enabled), then the failed-retry pass. Cycle errors are logged and
//! swallowed; repeated failures degrade the cadence with a bounded backoff so
//! a broken store is not hammered at full rate. Stop is cooperative: the
//! current cycle finishes, then the loop exits.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::publisher::OutboxPublisher;
use crate::health::JobHeartbeats;

/// Heartbeat key recorded by the loop.
pub const OUTBOX_JOB_NAME: &str = "outbox-processor";

/// Cap on cadence degradation: the delay never exceeds base × 2^MAX.
const MAX_BACKOFF_DOUBLINGS: u32 = 3;

/// Outbox loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxProcessingOptions {
    /// Delay between publisher cycles, in milliseconds. Default: 5000.
    pub polling_interval_ms: u64,
    /// Retry budget applied by the failed-retry pass. Default: 3.
    pub max_retries: u32,
    /// Run the scheduled-message pass each cycle. Default: true.
    pub process_scheduled_messages: bool,
    /// Run the failed-retry pass each cycle. Default: true.
    pub retry_failed_messages: bool,
    /// Master switch; when false the loop never touches the store.
    pub enabled: bool,
}

impl Default for OutboxProcessingOptions {
    fn default() -> Self {
        Self {
            polling_interval_ms: 5_000,
            max_retries: 3,
            process_scheduled_messages: true,
            retry_failed_messages: true,
            enabled: true,
        }
    }
}

impl OutboxProcessingOptions {
    /// Cadence as a `Duration`.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

/// Handle to a running outbox processing loop.
pub struct OutboxProcessorHandle {
    cancel: watch::Sender<bool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl OutboxProcessorHandle {
    /// Signal the loop to stop after the current cycle.
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

/// Delay for the next cycle after `consecutive_failures` failed cycles.
fn degraded_delay(base: Duration, consecutive_failures: u32) -> Duration {
    let doublings = consecutive_failures.min(MAX_BACKOFF_DOUBLINGS);
    base.saturating_mul(1 << doublings)
}

/// Spawn the outbox processing loop.
///
/// When `options.enabled` is false, the returned handle owns a loop that has
/// already exited without polling the store.
pub fn spawn_outbox_processor(
    publisher: Arc<OutboxPublisher>,
    options: OutboxProcessingOptions,
    heartbeats: Option<Arc<JobHeartbeats>>,
) -> OutboxProcessorHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    if !options.enabled {
        info!("Outbox processing disabled by configuration");
        return OutboxProcessorHandle {
            cancel: cancel_tx,
            handle: None,
        };
    }

    let handle = tokio::spawn(async move {
        let base_interval = options.polling_interval();
        let mut consecutive_failures = 0u32;
        info!(
            polling_interval_ms = options.polling_interval_ms,
            max_retries = options.max_retries,
            "Outbox processor started"
        );

        loop {
            let delay = degraded_delay(base_interval, consecutive_failures);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Some(ref heartbeats) = heartbeats {
                        heartbeats.beat(OUTBOX_JOB_NAME);
                    }
                    match run_cycle(&publisher, &options).await {
                        Ok(()) => {
                            if consecutive_failures > 0 {
                                info!("Outbox cycle recovered, cadence restored");
                            }
                            consecutive_failures = 0;
                        }
                        Err(e) => {
                            consecutive_failures = consecutive_failures.saturating_add(1);
                            error!(
                                error = %e,
                                consecutive_failures = consecutive_failures,
                                "Outbox cycle failed"
                            );
                        }
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        info!("Outbox processor stopped");
                        break;
                    }
                }
            }
        }
    });

    OutboxProcessorHandle {
        cancel: cancel_tx,
        handle: Some(handle),
    }
}

async fn run_cycle(
    publisher: &OutboxPublisher,
    options: &OutboxProcessingOptions,
) -> super::store::Result<()> {
    let cancel = CancellationToken::new();

    let pending = publisher.publish_pending(&cancel).await?;
    if pending.success_count + pending.failure_count > 0 {
        debug!(
            published = pending.success_count,
            failed = pending.failure_count,
            "Pending pass complete"
        );
    }

    if options.process_scheduled_messages {
        publisher.publish_scheduled(&cancel).await?;
    }
    if options.retry_failed_messages {
        publisher.retry_failed(options.max_retries, &cancel).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MockDispatcher;
    use crate::outbox::{InMemoryOutboxStore, MessageStatus, OutboxStore};
    use crate::serializer::JsonSerializer;
    use crate::transport::TransportRegistry;
    use crate::outbox::OutboundMessage;

    fn make_publisher(
        store: Arc<InMemoryOutboxStore>,
        dispatcher: Arc<MockDispatcher>,
    ) -> Arc<OutboxPublisher> {
        Arc::new(OutboxPublisher::new(
            store,
            dispatcher,
            Arc::new(JsonSerializer),
            Arc::new(TransportRegistry::new()),
        ))
    }

    #[test]
    fn test_options_defaults() {
        let options = OutboxProcessingOptions::default();
        assert_eq!(options.polling_interval(), Duration::from_secs(5));
        assert_eq!(options.max_retries, 3);
        assert!(options.process_scheduled_messages);
        assert!(options.retry_failed_messages);
        assert!(options.enabled);
    }

    #[test]
    fn test_degraded_delay_is_bounded() {
        let base = Duration::from_millis(100);
        assert_eq!(degraded_delay(base, 0), base);
        assert_eq!(degraded_delay(base, 1), base * 2);
        assert_eq!(degraded_delay(base, 3), base * 8);
        // Cap holds however long the outage lasts.
        assert_eq!(degraded_delay(base, 30), base * 8);
    }

    #[tokio::test]
    async fn test_disabled_loop_never_polls() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let dispatcher = Arc::new(MockDispatcher::new());
        store
            .stage(OutboundMessage::new("m1", "T", vec![], "q1", None))
            .await
            .unwrap();

        let options = OutboxProcessingOptions {
            enabled: false,
            polling_interval_ms: 1,
            ..Default::default()
        };
        let handle = spawn_outbox_processor(
            make_publisher(store.clone(), dispatcher.clone()),
            options,
            None,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert_eq!(dispatcher.dispatched_count().await, 0);
        let row = store.get_by_id("m1").await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Staged);
    }

    #[tokio::test]
    async fn test_loop_drains_staged_messages() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let dispatcher = Arc::new(MockDispatcher::new());
        store
            .stage(OutboundMessage::new("m1", "T", vec![], "q1", None))
            .await
            .unwrap();

        let options = OutboxProcessingOptions {
            polling_interval_ms: 10,
            ..Default::default()
        };
        let handle = spawn_outbox_processor(
            make_publisher(store.clone(), dispatcher.clone()),
            options,
            None,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;

        let row = store.get_by_id("m1").await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Published);
        assert_eq!(dispatcher.dispatched_count().await, 1);
    }

    #[tokio::test]
    async fn test_loop_survives_dispatch_failures_and_retries() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let dispatcher = Arc::new(MockDispatcher::new());
        dispatcher.set_fail_with("handler offline").await;
        store
            .stage(OutboundMessage::new("m1", "T", vec![], "q1", None))
            .await
            .unwrap();

        let options = OutboxProcessingOptions {
            polling_interval_ms: 10,
            max_retries: 5,
            ..Default::default()
        };
        let handle = spawn_outbox_processor(
            make_publisher(store.clone(), dispatcher.clone()),
            options,
            None,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        dispatcher.clear_failure().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;

        let row = store.get_by_id("m1").await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Published);
    }

    #[tokio::test]
    async fn test_heartbeat_recorded() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let dispatcher = Arc::new(MockDispatcher::new());
        let heartbeats = Arc::new(JobHeartbeats::new());

        let options = OutboxProcessingOptions {
            polling_interval_ms: 10,
            ..Default::default()
        };
        let handle = spawn_outbox_processor(
            make_publisher(store, dispatcher),
            options,
            Some(heartbeats.clone()),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert!(heartbeats.last_beat(OUTBOX_JOB_NAME).is_some());
    }
}
