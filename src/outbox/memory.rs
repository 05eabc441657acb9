//! In-memory outbox store.
//!
//! Reference implementation of [`OutboxStore`] used in tests and
//! single-process deployments. Staging order is preserved so drains see
//! oldest-first without a sort on every query.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::store::{OutboxError, OutboxStore, Result};
use super::{MessageStatus, OutboundMessage, TransportDelivery, TransportDeliveryStatus};

#[derive(Default)]
struct Inner {
    messages: HashMap<String, OutboundMessage>,
    staging_order: Vec<String>,
    deliveries: HashMap<String, Vec<TransportDelivery>>,
}

/// Thread-safe in-memory [`OutboxStore`].
#[derive(Default)]
pub struct InMemoryOutboxStore {
    inner: RwLock<Inner>,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of messages in any status.
    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn stage(&self, message: OutboundMessage) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.messages.contains_key(&message.id) {
            return Err(OutboxError::Duplicate(message.id));
        }
        inner.staging_order.push(message.id.clone());
        inner.messages.insert(message.id.clone(), message);
        Ok(())
    }

    async fn stage_with_transports(
        &self,
        message: OutboundMessage,
        deliveries: Vec<TransportDelivery>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.messages.contains_key(&message.id) {
            return Err(OutboxError::Duplicate(message.id));
        }
        inner.staging_order.push(message.id.clone());
        inner.deliveries.insert(message.id.clone(), deliveries);
        inner.messages.insert(message.id.clone(), message);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<OutboundMessage>> {
        Ok(self.inner.read().await.messages.get(id).cloned())
    }

    async fn get_unsent(&self, limit: usize) -> Result<Vec<OutboundMessage>> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        Ok(inner
            .staging_order
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| {
                matches!(m.status, MessageStatus::Staged | MessageStatus::Scheduled)
                    && m.is_due(now)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_scheduled(&self, limit: usize) -> Result<Vec<OutboundMessage>> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        Ok(inner
            .staging_order
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| m.status == MessageStatus::Scheduled && m.is_due(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        message.status = MessageStatus::Published;
        message.last_attempt_at = Some(Utc::now());
        message.last_error = None;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str, retry_count: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        // Published is terminal.
        if message.status == MessageStatus::Published {
            return Ok(());
        }
        message.status = MessageStatus::Failed;
        message.last_error = Some(error.to_string());
        message.retry_count = message.retry_count.max(retry_count);
        message.last_attempt_at = Some(Utc::now());
        Ok(())
    }

    async fn get_failed(
        &self,
        max_retries: u32,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .staging_order
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| m.status == MessageStatus::Failed && m.retry_count < max_retries)
            .filter(|m| match since {
                Some(since) => m.created_at >= since,
                None => true,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_pending_transport_deliveries(
        &self,
        transport_name: &str,
        limit: usize,
    ) -> Result<Vec<TransportDelivery>> {
        let inner = self.inner.read().await;
        Ok(inner
            .staging_order
            .iter()
            .filter_map(|id| inner.deliveries.get(id))
            .flatten()
            .filter(|d| {
                d.transport_name == transport_name && d.status == TransportDeliveryStatus::Pending
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_transport_deliveries(&self, message_id: &str) -> Result<Vec<TransportDelivery>> {
        let inner = self.inner.read().await;
        Ok(inner.deliveries.get(message_id).cloned().unwrap_or_default())
    }

    async fn mark_transport_sent(&self, message_id: &str, transport_name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let rows = inner
            .deliveries
            .get_mut(message_id)
            .ok_or_else(|| OutboxError::NotFound(message_id.to_string()))?;
        let row = rows
            .iter_mut()
            .find(|d| d.transport_name == transport_name)
            .ok_or_else(|| OutboxError::NotFound(format!("{message_id}/{transport_name}")))?;
        row.status = TransportDeliveryStatus::Sent;
        row.last_error = None;

        let all_sent = rows.iter().all(|d| d.status == TransportDeliveryStatus::Sent);
        if all_sent {
            if let Some(message) = inner.messages.get_mut(message_id) {
                message.status = MessageStatus::Published;
                message.last_attempt_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn mark_transport_failed(
        &self,
        message_id: &str,
        transport_name: &str,
        error: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let rows = inner
            .deliveries
            .get_mut(message_id)
            .ok_or_else(|| OutboxError::NotFound(message_id.to_string()))?;
        let row = rows
            .iter_mut()
            .find(|d| d.transport_name == transport_name)
            .ok_or_else(|| OutboxError::NotFound(format!("{message_id}/{transport_name}")))?;
        row.status = TransportDeliveryStatus::Failed;
        row.last_error = Some(error.to_string());
        row.retry_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_message(id: &str) -> OutboundMessage {
        OutboundMessage::new(id, "TestMessage", vec![1], "q1", None)
    }

    #[tokio::test]
    async fn test_stage_and_get_unsent_oldest_first() {
        let store = InMemoryOutboxStore::new();
        store.stage(make_message("m1")).await.unwrap();
        store.stage(make_message("m2")).await.unwrap();
        store.stage(make_message("m3")).await.unwrap();

        let unsent = store.get_unsent(10).await.unwrap();
        let ids: Vec<&str> = unsent.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);

        let limited = store.get_unsent(2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_stage_rejected() {
        let store = InMemoryOutboxStore::new();
        store.stage(make_message("m1")).await.unwrap();
        let result = store.stage(make_message("m1")).await;
        assert!(matches!(result, Err(OutboxError::Duplicate(id)) if id == "m1"));
    }

    #[tokio::test]
    async fn test_scheduled_message_held_until_due() {
        let store = InMemoryOutboxStore::new();
        let future = OutboundMessage::new(
            "future",
            "T",
            vec![],
            "q1",
            Some(Utc::now() + Duration::minutes(10)),
        );
        let past = OutboundMessage::new(
            "past",
            "T",
            vec![],
            "q1",
            Some(Utc::now() - Duration::minutes(10)),
        );
        store.stage(future).await.unwrap();
        store.stage(past).await.unwrap();

        let unsent = store.get_unsent(10).await.unwrap();
        let ids: Vec<&str> = unsent.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["past"]);
    }

    #[tokio::test]
    async fn test_mark_sent_is_terminal() {
        let store = InMemoryOutboxStore::new();
        store.stage(make_message("m1")).await.unwrap();
        store.mark_sent("m1").await.unwrap();

        // A late failure report must not regress a published row.
        store.mark_failed("m1", "late error", 1).await.unwrap();
        let message = store.get_by_id("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Published);
        assert!(store.get_unsent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_selection_respects_budget() {
        let store = InMemoryOutboxStore::new();
        store.stage(make_message("m1")).await.unwrap();
        store.stage(make_message("m2")).await.unwrap();
        store.mark_failed("m1", "boom", 1).await.unwrap();
        store.mark_failed("m2", "boom", 3).await.unwrap();

        let failed = store.get_failed(3, None, 10).await.unwrap();
        let ids: Vec<&str> = failed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1"]);
    }

    #[tokio::test]
    async fn test_fanout_promotion_requires_all_sent() {
        let store = InMemoryOutboxStore::new();
        let deliveries = vec![
            TransportDelivery::pending("m1", "kafka", "orders"),
            TransportDelivery::pending("m1", "sqs", "orders"),
        ];
        store
            .stage_with_transports(make_message("m1"), deliveries)
            .await
            .unwrap();

        store.mark_transport_sent("m1", "kafka").await.unwrap();
        let message = store.get_by_id("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Staged);

        store.mark_transport_sent("m1", "sqs").await.unwrap();
        let message = store.get_by_id("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Published);
    }

    #[tokio::test]
    async fn test_transport_failure_records_error() {
        let store = InMemoryOutboxStore::new();
        store
            .stage_with_transports(
                make_message("m1"),
                vec![TransportDelivery::pending("m1", "kafka", "orders")],
            )
            .await
            .unwrap();

        store
            .mark_transport_failed("m1", "kafka", "transport unavailable")
            .await
            .unwrap();

        let rows = store.get_transport_deliveries("m1").await.unwrap();
        assert_eq!(rows[0].status, TransportDeliveryStatus::Failed);
        assert_eq!(rows[0].last_error.as_deref(), Some("transport unavailable"));
        assert_eq!(rows[0].retry_count, 1);

        // Failed rows are not pending.
        let pending = store.get_pending_transport_deliveries("kafka", 10).await.unwrap();
        assert!(pending.is_empty());
    }
}
