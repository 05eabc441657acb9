//! In-memory audit store.
//!
//! Reference implementation of [`AuditStore`]. A single mutex is the
//! append critical section: sequence allocation, previous-hash read, hash
//! computation, and insert happen under one lock, which is the only place
//! those steps may interleave.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::canonical::compute_event_hash;
use super::store::{
    validate_event, AuditIntegrityResult, AuditQuery, AuditStore, ChainAnchor,
    MAX_REPORTED_VIOLATIONS,
};
use super::{AuditError, AuditEvent, AuditEventId, Result};
use crate::hashing::{HashFunction, Sha256Hash};

struct ChainState {
    /// Ascending by sequence number; deletes only ever remove a prefix.
    events: Vec<AuditEvent>,
    anchor: Option<ChainAnchor>,
}

/// Thread-safe in-memory [`AuditStore`].
pub struct InMemoryAuditStore {
    state: Mutex<ChainState>,
    hash: Arc<dyn HashFunction>,
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new(Arc::new(Sha256Hash))
    }
}

impl InMemoryAuditStore {
    /// Create an empty store over the given hash function.
    pub fn new(hash: Arc<dyn HashFunction>) -> Self {
        Self {
            state: Mutex::new(ChainState {
                events: Vec::new(),
                anchor: None,
            }),
            hash,
        }
    }

    /// Number of stored events.
    pub async fn len(&self) -> usize {
        self.state.lock().await.events.len()
    }

    /// True when no events are stored.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.events.is_empty()
    }

    /// Current chain anchor, set by retention.
    pub async fn anchor(&self) -> Option<ChainAnchor> {
        self.state.lock().await.anchor.clone()
    }

    #[cfg(test)]
    pub(crate) async fn tamper(&self, event_id: &str, mutate: impl FnOnce(&mut AuditEvent)) {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.event_id == event_id)
            .expect("tamper target exists");
        mutate(event);
    }
}

/// Walk `events` (ascending by sequence) recomputing the chain.
///
/// Shared by the store implementations so the in-memory and SQLite walks
/// cannot drift apart.
pub(crate) fn verify_events(
    hash: &dyn HashFunction,
    events: &[AuditEvent],
    anchor: Option<&ChainAnchor>,
    full_range: bool,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> AuditIntegrityResult {
    let mut first_violation: Option<(String, String)> = None;
    let mut violation_count = 0usize;
    let mut record = |event_id: &str, description: String| {
        if violation_count < MAX_REPORTED_VIOLATIONS {
            violation_count += 1;
        }
        if first_violation.is_none() {
            first_violation = Some((event_id.to_string(), description));
        }
    };

    let mut previous: Option<&AuditEvent> = None;
    for event in events {
        // Establish the expected predecessor hash where it is knowable.
        let expected_previous: Option<String> = match previous {
            Some(prev) if event.sequence_number == prev.sequence_number + 1 => {
                Some(prev.event_hash.clone())
            }
            Some(prev) => {
                if full_range {
                    record(
                        &event.event_id,
                        format!(
                            "sequence gap: {} follows {}",
                            event.sequence_number, prev.sequence_number
                        ),
                    );
                }
                None
            }
            None => match anchor {
                Some(anchor) if anchor.sequence == event.sequence_number => {
                    Some(anchor.previous_event_hash.clone())
                }
                _ if full_range => Some(String::new()),
                _ => None,
            },
        };

        if let Some(expected) = expected_previous {
            if event.previous_event_hash != expected {
                record(
                    &event.event_id,
                    format!(
                        "previous hash mismatch at sequence {}",
                        event.sequence_number
                    ),
                );
            }
        }

        let recomputed = compute_event_hash(hash, event, &event.previous_event_hash);
        if recomputed != event.event_hash {
            record(
                &event.event_id,
                format!("hash mismatch at sequence {}", event.sequence_number),
            );
        }

        previous = Some(event);
    }

    let events_verified = events.len();
    match first_violation {
        None => AuditIntegrityResult::Valid {
            events_verified,
            start,
            end,
        },
        Some((first_violation_event_id, description)) => AuditIntegrityResult::Invalid {
            events_verified,
            start,
            end,
            first_violation_event_id,
            description,
            violation_count,
        },
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn store(&self, mut event: AuditEvent) -> Result<AuditEventId> {
        validate_event(&event)?;

        let mut state = self.state.lock().await;
        let (sequence, previous_hash) = match state.events.last() {
            Some(last) => (last.sequence_number + 1, last.event_hash.clone()),
            None => match state.anchor {
                Some(ref anchor) => (anchor.sequence, anchor.previous_event_hash.clone()),
                None => (1, String::new()),
            },
        };

        event.sequence_number = sequence;
        event.previous_event_hash = previous_hash.clone();
        event.event_hash = compute_event_hash(self.hash.as_ref(), &event, &previous_hash);

        let receipt = AuditEventId {
            event_id: event.event_id.clone(),
            event_hash: event.event_hash.clone(),
            sequence_number: sequence,
            recorded_at: Utc::now(),
        };
        state.events.push(event);
        Ok(receipt)
    }

    async fn get_by_id(&self, event_id: &str) -> Result<Option<AuditEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        query.validate()?;
        let state = self.state.lock().await;
        let mut matching: Vec<AuditEvent> = state
            .events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        if query.ascending {
            matching.sort_by_key(|e| (e.timestamp, e.sequence_number));
        } else {
            matching.sort_by_key(|e| std::cmp::Reverse((e.timestamp, e.sequence_number)));
        }
        Ok(matching
            .into_iter()
            .skip(query.skip)
            .take(query.max_results)
            .collect())
    }

    async fn verify_chain_integrity(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<AuditIntegrityResult> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(AuditError::InvalidArgument(
                    "start_date must not be after end_date",
                ));
            }
        }

        let state = self.state.lock().await;
        let full_range = start.is_none() && end.is_none();
        let walked: Vec<AuditEvent> = state
            .events
            .iter()
            .filter(|e| start.is_none_or(|s| e.timestamp >= s))
            .filter(|e| end.is_none_or(|n| e.timestamp <= n))
            .cloned()
            .collect();

        Ok(verify_events(
            self.hash.as_ref(),
            &walked,
            state.anchor.as_ref(),
            full_range,
            start,
            end,
        ))
    }

    async fn oldest_events(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .take_while(|e| e.timestamp < older_than)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_up_to(&self, sequence: u64, anchor: ChainAnchor) -> Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.events.len();
        state.events.retain(|e| e.sequence_number > sequence);
        state.anchor = Some(anchor);
        Ok(before - state.events.len())
    }

    async fn latest_sequence(&self) -> Result<Option<u64>> {
        let state = self.state.lock().await;
        Ok(state.events.last().map(|e| e.sequence_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, AuditOutcome, DataClassification};
    use chrono::Duration;

    fn make_event(action: &str, actor: &str) -> AuditEvent {
        AuditEvent::new(
            AuditEventType::DataAccess,
            action,
            actor,
            AuditOutcome::Success,
        )
    }

    async fn seeded_store(count: usize) -> InMemoryAuditStore {
        let store = InMemoryAuditStore::default();
        for n in 0..count {
            store
                .store(make_event(&format!("Action{n}"), "user-1"))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_append_assigns_chain_fields() {
        let store = InMemoryAuditStore::default();
        let first = store.store(make_event("A", "u")).await.unwrap();
        let second = store.store(make_event("B", "u")).await.unwrap();

        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);

        let stored_second = store.get_by_id(&second.event_id).await.unwrap().unwrap();
        assert_eq!(stored_second.previous_event_hash, first.event_hash);
        assert!(!stored_second.event_hash.is_empty());
    }

    #[tokio::test]
    async fn test_append_rejects_invalid_events() {
        let store = InMemoryAuditStore::default();
        let mut event = make_event("A", "u");
        event.actor_id = String::new();
        assert!(matches!(
            store.store(event).await,
            Err(AuditError::InvalidArgument(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unmodified_chain_verifies() {
        let store = seeded_store(10).await;
        let result = store.verify_chain_integrity(None, None).await.unwrap();
        assert_eq!(
            result,
            AuditIntegrityResult::Valid {
                events_verified: 10,
                start: None,
                end: None
            }
        );
    }

    #[tokio::test]
    async fn test_empty_chain_is_valid() {
        let store = InMemoryAuditStore::default();
        let result = store.verify_chain_integrity(None, None).await.unwrap();
        assert!(result.is_valid());
    }

    #[tokio::test]
    async fn test_tampered_content_detected() {
        let store = InMemoryAuditStore::default();
        let _e1 = store.store(make_event("A", "u")).await.unwrap();
        let e2 = store.store(make_event("B", "u")).await.unwrap();
        let _e3 = store.store(make_event("C", "u")).await.unwrap();

        store
            .tamper(&e2.event_id, |event| {
                event.action = "B-tampered".to_string();
            })
            .await;

        let result = store.verify_chain_integrity(None, None).await.unwrap();
        match result {
            AuditIntegrityResult::Invalid {
                first_violation_event_id,
                violation_count,
                events_verified,
                ..
            } => {
                assert_eq!(first_violation_event_id, e2.event_id);
                assert_eq!(violation_count, 1);
                assert_eq!(events_verified, 3);
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reordered_hash_detected() {
        let store = InMemoryAuditStore::default();
        let e1 = store.store(make_event("A", "u")).await.unwrap();
        let e2 = store.store(make_event("B", "u")).await.unwrap();

        // Swap the second event's previous pointer to fake reordering.
        store
            .tamper(&e2.event_id, |event| {
                event.previous_event_hash = "forged".to_string();
            })
            .await;
        let _ = e1;

        let result = store.verify_chain_integrity(None, None).await.unwrap();
        assert!(!result.is_valid());
    }

    #[tokio::test]
    async fn test_inverted_range_rejected() {
        let store = seeded_store(1).await;
        let now = Utc::now();
        let result = store
            .verify_chain_integrity(Some(now), Some(now - Duration::hours(1)))
            .await;
        assert!(matches!(result, Err(AuditError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_query_default_order_is_descending() {
        let store = seeded_store(3).await;
        let events = store.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[0].sequence_number > events[2].sequence_number);

        let ascending = store
            .query(&AuditQuery {
                ascending: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ascending[0].sequence_number, 1);
    }

    #[tokio::test]
    async fn test_query_pagination() {
        let store = seeded_store(10).await;
        let page = store
            .query(&AuditQuery {
                ascending: true,
                skip: 4,
                max_results: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        let sequences: Vec<u64> = page.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequences, [5, 6, 7]);
    }

    #[tokio::test]
    async fn test_query_filters_by_classification_and_actor() {
        let store = InMemoryAuditStore::default();
        store
            .store(
                make_event("Read", "alice").with_classification(DataClassification::Restricted),
            )
            .await
            .unwrap();
        store
            .store(make_event("Read", "bob").with_classification(DataClassification::Internal))
            .await
            .unwrap();

        let restricted = store
            .query(&AuditQuery {
                min_classification: Some(DataClassification::Confidential),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(restricted.len(), 1);
        assert_eq!(restricted[0].actor_id, "alice");

        let bobs = store.query(&AuditQuery::default().for_actor("bob")).await.unwrap();
        assert_eq!(bobs.len(), 1);
    }

    #[tokio::test]
    async fn test_retention_anchor_keeps_chain_verifiable() {
        let store = seeded_store(5).await;

        let horizon = Utc::now() + Duration::seconds(1);
        let prefix = store.oldest_events(horizon, 2).await.unwrap();
        assert_eq!(prefix.len(), 2);
        let last = prefix.last().unwrap();

        let deleted = store
            .delete_up_to(
                last.sequence_number,
                ChainAnchor {
                    sequence: last.sequence_number + 1,
                    previous_event_hash: last.event_hash.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.len().await, 3);

        // Surviving range verifies thanks to the anchor.
        let result = store.verify_chain_integrity(None, None).await.unwrap();
        assert_eq!(
            result,
            AuditIntegrityResult::Valid {
                events_verified: 3,
                start: None,
                end: None
            }
        );

        // Appends continue the chain after the wipe point.
        let next = store.store(make_event("F", "u")).await.unwrap();
        assert_eq!(next.sequence_number, 6);
        assert!(store
            .verify_chain_integrity(None, None)
            .await
            .unwrap()
            .is_valid());
    }

    #[tokio::test]
    async fn test_append_after_full_wipe_continues_sequence() {
        let store = seeded_store(3).await;
        let last_seq = store.latest_sequence().await.unwrap().unwrap();
        let all = store
            .oldest_events(Utc::now() + Duration::seconds(1), 10)
            .await
            .unwrap();
        let last_hash = all.last().unwrap().event_hash.clone();

        store
            .delete_up_to(
                last_seq,
                ChainAnchor {
                    sequence: last_seq + 1,
                    previous_event_hash: last_hash.clone(),
                },
            )
            .await
            .unwrap();
        assert!(store.is_empty().await);

        let next = store.store(make_event("D", "u")).await.unwrap();
        assert_eq!(next.sequence_number, last_seq + 1);
        let stored = store.get_by_id(&next.event_id).await.unwrap().unwrap();
        assert_eq!(stored.previous_event_hash, last_hash);
    }

    #[tokio::test]
    async fn test_oldest_events_stop_at_horizon() {
        let store = InMemoryAuditStore::default();
        store.store(make_event("A", "u")).await.unwrap();
        let horizon = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.store(make_event("B", "u")).await.unwrap();

        let prefix = store.oldest_events(horizon, 10).await.unwrap();
        assert_eq!(prefix.len(), 1);
        assert_eq!(prefix[0].action, "A");
    }
}
