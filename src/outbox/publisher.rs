//! Outbox publisher.
//!
//! Drains staged, scheduled, and failed messages to the in-process
//! dispatcher, and pending fan-out rows to their transport adapters. Every
//! per-message outcome is recorded on the row; only catastrophic store
//! errors propagate to the caller. Cumulative counters are kept for the
//! statistics surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::store::{OutboxError, OutboxStore, Result};
use super::{OutboundMessage, TransportDelivery};
use crate::dispatcher::{DispatchContext, Dispatcher, MessageEnvelope};
use crate::serializer::{serialize_message, Serializer};
use crate::transport::TransportRegistry;

/// Default number of rows drained per pass.
const DEFAULT_BATCH_SIZE: usize = 100;

/// Header carrying the serializer's content type on staged messages.
const CONTENT_TYPE_HEADER: &str = "content-type";

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishingResult {
    /// Messages dispatched and marked sent.
    pub success_count: usize,
    /// Messages that failed and were recorded on the row.
    pub failure_count: usize,
    /// Per-message error descriptions, in drain order.
    pub errors: Vec<String>,
}

/// Cumulative publisher counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublisherStatistics {
    /// Drain operations executed.
    pub operations: u64,
    /// Messages published across all operations.
    pub messages_published: u64,
    /// Message failures across all operations.
    pub messages_failed: u64,
    /// Rolling success rate percentage. 100 when nothing was attempted.
    pub success_rate: f64,
}

/// Drains the outbox to the dispatcher and to transport adapters.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    dispatcher: Arc<dyn Dispatcher>,
    serializer: Arc<dyn Serializer>,
    transports: Arc<TransportRegistry>,
    batch_size: usize,
    operations: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
}

impl OutboxPublisher {
    /// Create a publisher with the default batch size.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        dispatcher: Arc<dyn Dispatcher>,
        serializer: Arc<dyn Serializer>,
        transports: Arc<TransportRegistry>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            serializer,
            transports,
            batch_size: DEFAULT_BATCH_SIZE,
            operations: AtomicU64::new(0),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Override the per-pass batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Serialize and stage one message.
    ///
    /// Returns the staged row. The message is not dispatched here; the next
    /// drain pass (or the background loop) picks it up.
    pub async fn publish<T: Serialize>(
        &self,
        message: &T,
        message_type: &str,
        destination: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<OutboundMessage> {
        if message_type.is_empty() {
            return Err(OutboxError::InvalidArgument("message_type must not be empty"));
        }
        if destination.is_empty() {
            return Err(OutboxError::InvalidArgument("destination must not be empty"));
        }

        let payload = serialize_message(self.serializer.as_ref(), message)?;
        let staged = OutboundMessage::new(
            Uuid::new_v4().to_string(),
            message_type,
            payload,
            destination,
            scheduled_at,
        )
        .with_header(CONTENT_TYPE_HEADER, self.serializer.content_type());

        self.store.stage(staged.clone()).await?;
        debug!(id = %staged.id, message_type = %message_type, destination = %destination, "Message staged");
        Ok(staged)
    }

    /// Serialize and stage one message with a pending fan-out row for every
    /// registered transport.
    pub async fn publish_to_all_transports<T: Serialize>(
        &self,
        message: &T,
        message_type: &str,
        destination: &str,
    ) -> Result<OutboundMessage> {
        if message_type.is_empty() {
            return Err(OutboxError::InvalidArgument("message_type must not be empty"));
        }
        if destination.is_empty() {
            return Err(OutboxError::InvalidArgument("destination must not be empty"));
        }
        let names = self.transports.names().await;
        if names.is_empty() {
            return Err(OutboxError::InvalidArgument(
                "no transports registered for fan-out staging",
            ));
        }

        let payload = serialize_message(self.serializer.as_ref(), message)?;
        let staged = OutboundMessage::new(
            Uuid::new_v4().to_string(),
            message_type,
            payload,
            destination,
            None,
        )
        .with_header(CONTENT_TYPE_HEADER, self.serializer.content_type());

        let deliveries = names
            .iter()
            .map(|name| TransportDelivery::pending(&staged.id, name, destination))
            .collect();
        self.store
            .stage_with_transports(staged.clone(), deliveries)
            .await?;
        debug!(id = %staged.id, transports = names.len(), "Message staged with fan-out rows");
        Ok(staged)
    }

    /// Drain one batch of unsent messages through the dispatcher.
    pub async fn publish_pending(&self, cancel: &CancellationToken) -> Result<PublishingResult> {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }
        let batch = self.store.get_unsent(self.batch_size).await?;
        self.dispatch_batch(batch, cancel).await
    }

    /// Drain one batch of scheduled messages whose delivery time arrived.
    pub async fn publish_scheduled(&self, cancel: &CancellationToken) -> Result<PublishingResult> {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }
        let batch = self.store.get_scheduled(self.batch_size).await?;
        self.dispatch_batch(batch, cancel).await
    }

    /// Re-dispatch failed messages still under the retry budget.
    pub async fn retry_failed(
        &self,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<PublishingResult> {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }
        let batch = self
            .store
            .get_failed(max_retries, None, self.batch_size)
            .await?;
        if !batch.is_empty() {
            info!(count = batch.len(), max_retries = max_retries, "Retrying failed messages");
        }
        self.dispatch_batch(batch, cancel).await
    }

    async fn dispatch_batch(
        &self,
        batch: Vec<OutboundMessage>,
        cancel: &CancellationToken,
    ) -> Result<PublishingResult> {
        let mut result = PublishingResult::default();

        for message in batch {
            // Cancellation lets the current message finish but starts no more.
            if cancel.is_cancelled() {
                warn!(
                    published = result.success_count,
                    "Drain cancelled mid-batch, remaining messages left staged"
                );
                break;
            }

            let envelope = MessageEnvelope {
                message_type: message.message_type.clone(),
                payload: message.payload.clone(),
                headers: message.headers.clone(),
            };
            let context = DispatchContext::outbox(message.correlation_id.clone());

            match self.dispatcher.dispatch(envelope, context, cancel).await {
                Ok(()) => {
                    self.store.mark_sent(&message.id).await?;
                    result.success_count += 1;
                    debug!(id = %message.id, destination = %message.destination, "Message published");
                }
                Err(e) => {
                    let description = e.to_string();
                    self.store
                        .mark_failed(&message.id, &description, message.retry_count + 1)
                        .await?;
                    result.failure_count += 1;
                    error!(
                        id = %message.id,
                        retry_count = message.retry_count + 1,
                        error = %description,
                        "Message dispatch failed"
                    );
                    result.errors.push(format!("{}: {}", message.id, description));
                }
            }
        }

        self.record_operation(&result);
        Ok(result)
    }

    /// Send pending fan-out rows through one transport's adapter.
    pub async fn publish_pending_transport_deliveries(
        &self,
        transport_name: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<PublishingResult> {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }
        let adapter = self
            .transports
            .resolve(transport_name)
            .await
            .ok_or_else(|| OutboxError::TransportNotRegistered(transport_name.to_string()))?;

        let rows = self
            .store
            .get_pending_transport_deliveries(transport_name, limit)
            .await?;
        let mut result = PublishingResult::default();

        for row in rows {
            if cancel.is_cancelled() {
                warn!(
                    transport = %transport_name,
                    sent = result.success_count,
                    "Transport drain cancelled mid-batch"
                );
                break;
            }

            let Some(message) = self.store.get_by_id(&row.message_id).await? else {
                warn!(
                    id = %row.message_id,
                    transport = %transport_name,
                    "Delivery row without parent message, skipping"
                );
                continue;
            };

            match adapter.send(&message, &row.destination, cancel).await {
                Ok(()) => {
                    self.store
                        .mark_transport_sent(&row.message_id, transport_name)
                        .await?;
                    result.success_count += 1;
                    debug!(id = %row.message_id, transport = %transport_name, "Transport delivery sent");
                }
                Err(e) => {
                    let description = e.to_string();
                    self.store
                        .mark_transport_failed(&row.message_id, transport_name, &description)
                        .await?;
                    result.failure_count += 1;
                    error!(
                        id = %row.message_id,
                        transport = %transport_name,
                        error = %description,
                        "Transport delivery failed"
                    );
                    result.errors.push(format!("{}: {}", row.message_id, description));
                }
            }
        }

        self.record_operation(&result);
        Ok(result)
    }

    fn record_operation(&self, result: &PublishingResult) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.published
            .fetch_add(result.success_count as u64, Ordering::Relaxed);
        self.failed
            .fetch_add(result.failure_count as u64, Ordering::Relaxed);
    }

    /// Cumulative counters since construction.
    pub fn statistics(&self) -> PublisherStatistics {
        let published = self.published.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let attempted = published + failed;
        let success_rate = if attempted == 0 {
            100.0
        } else {
            (published as f64 / attempted as f64) * 100.0
        };
        PublisherStatistics {
            operations: self.operations.load(Ordering::Relaxed),
            messages_published: published,
            messages_failed: failed,
            success_rate,
        }
    }

}
