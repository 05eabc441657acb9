//! Audit store contract and query model.
//!
//! Appends are atomic with respect to sequence allocation and
//! previous-hash read; implementations keep that critical section as small
//! as a single writer or a short lock. Reads never mutate. Retention
//! deletes only contiguous prefixes and records a [`ChainAnchor`] so the
//! surviving range stays verifiable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    AuditError, AuditEvent, AuditEventId, AuditEventType, AuditOutcome, DataClassification, Result,
};

/// Violations counted before an integrity walk stops describing them.
pub const MAX_REPORTED_VIOLATIONS: usize = 100;

/// Default page size for queries.
pub const DEFAULT_MAX_RESULTS: usize = 100;

/// Checkpoint recorded when retention truncates the chain head.
///
/// The integrity walk accepts `previous_event_hash` as the expected
/// predecessor hash of the event at `sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainAnchor {
    /// Sequence number of the first surviving event.
    pub sequence: u64,
    /// Expected `previous_event_hash` of that event.
    pub previous_event_hash: String,
}

/// Filterable audit query.
///
/// Default ordering is descending by timestamp; `ascending` flips it.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    /// Inclusive lower bound on `timestamp`.
    pub start_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `timestamp`.
    pub end_date: Option<DateTime<Utc>>,
    /// Keep events whose type is in this set.
    pub event_types: Option<Vec<AuditEventType>>,
    /// Keep events whose outcome is in this set.
    pub outcomes: Option<Vec<AuditOutcome>>,
    /// Exact actor match.
    pub actor_id: Option<String>,
    /// Exact resource match.
    pub resource_id: Option<String>,
    /// Exact resource-type match.
    pub resource_type: Option<String>,
    /// Exact tenant match.
    pub tenant_id: Option<String>,
    /// Exact correlation match.
    pub correlation_id: Option<String>,
    /// Drop events classified below this level (and unclassified events).
    pub min_classification: Option<DataClassification>,
    /// Substring match on `action`.
    pub action_contains: Option<String>,
    /// Exact caller-address match.
    pub ip_address: Option<String>,
    /// Ascending by timestamp instead of the default descending.
    pub ascending: bool,
    /// Rows skipped before the page starts.
    pub skip: usize,
    /// Page size.
    pub max_results: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            event_types: None,
            outcomes: None,
            actor_id: None,
            resource_id: None,
            resource_type: None,
            tenant_id: None,
            correlation_id: None,
            min_classification: None,
            action_contains: None,
            ip_address: None,
            ascending: false,
            skip: 0,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

impl AuditQuery {
    /// Reject inverted date ranges before any side effect.
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(AuditError::InvalidArgument(
                    "start_date must not be after end_date",
                ));
            }
        }
        Ok(())
    }

    /// Restrict to a date range.
    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    /// Restrict to one actor.
    pub fn for_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Restrict to one tenant.
    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Restrict to a set of event types.
    pub fn with_event_types(mut self, event_types: Vec<AuditEventType>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Whether `event` passes every filter.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(start) = self.start_date {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if event.timestamp > end {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(ref outcomes) = self.outcomes {
            if !outcomes.contains(&event.outcome) {
                return false;
            }
        }
        if let Some(ref actor_id) = self.actor_id {
            if event.actor_id != *actor_id {
                return false;
            }
        }
        if let Some(ref resource_id) = self.resource_id {
            if event.resource_id.as_ref() != Some(resource_id) {
                return false;
            }
        }
        if let Some(ref resource_type) = self.resource_type {
            if event.resource_type.as_ref() != Some(resource_type) {
                return false;
            }
        }
        if let Some(ref tenant_id) = self.tenant_id {
            if event.tenant_id.as_ref() != Some(tenant_id) {
                return false;
            }
        }
        if let Some(ref correlation_id) = self.correlation_id {
            if event.correlation_id.as_ref() != Some(correlation_id) {
                return false;
            }
        }
        if let Some(min) = self.min_classification {
            match event.resource_classification {
                Some(classification) if classification >= min => {}
                _ => return false,
            }
        }
        if let Some(ref needle) = self.action_contains {
            if !event.action.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(ref ip) = self.ip_address {
            if event.ip_address.as_ref() != Some(ip) {
                return false;
            }
        }
        true
    }
}

/// Outcome of an integrity verification walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditIntegrityResult {
    /// Every recomputed hash matched.
    Valid {
        /// Events walked.
        events_verified: usize,
        /// Requested range start.
        start: Option<DateTime<Utc>>,
        /// Requested range end.
        end: Option<DateTime<Utc>>,
    },
    /// At least one mismatch.
    Invalid {
        /// Events walked.
        events_verified: usize,
        /// Requested range start.
        start: Option<DateTime<Utc>>,
        /// Requested range end.
        end: Option<DateTime<Utc>>,
        /// Event id of the first mismatch.
        first_violation_event_id: String,
        /// Human-readable description of the first mismatch.
        description: String,
        /// Total mismatches found, capped at
        /// [`MAX_REPORTED_VIOLATIONS`].
        violation_count: usize,
    },
}

impl AuditIntegrityResult {
    /// True for the `Valid` variant.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Append-only hash-chained audit event repository.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Validate, chain, and persist one event.
    ///
    /// Assigns `sequence_number`, `previous_event_hash`, and `event_hash`
    /// atomically; the input's chain fields are ignored.
    async fn store(&self, event: AuditEvent) -> Result<AuditEventId>;

    /// Fetch one event.
    async fn get_by_id(&self, event_id: &str) -> Result<Option<AuditEvent>>;

    /// Filtered, ordered, paginated read.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>>;

    /// Recompute the chain over `[start, end]` (by timestamp; both open
    /// ends allowed) walking ascending sequence numbers.
    async fn verify_chain_integrity(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<AuditIntegrityResult>;

    /// Contiguous prefix of events older than `older_than`, ascending by
    /// sequence, capped at `limit`.
    ///
    /// Stops at the first event at or past the horizon even when older
    /// events follow, so deletion never punches a hole in the chain.
    async fn oldest_events(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>>;

    /// Delete every event with `sequence_number <= sequence` and record
    /// `anchor` as the new chain head checkpoint. Returns the deleted count.
    async fn delete_up_to(&self, sequence: u64, anchor: ChainAnchor) -> Result<usize>;

    /// Highest assigned sequence number, if any event exists.
    async fn latest_sequence(&self) -> Result<Option<u64>>;
}

/// Entry validation shared by store implementations.
pub(crate) fn validate_event(event: &AuditEvent) -> Result<()> {
    if event.event_id.is_empty() {
        return Err(AuditError::InvalidArgument("event_id must not be empty"));
    }
    if event.action.is_empty() {
        return Err(AuditError::InvalidArgument("action must not be empty"));
    }
    if event.actor_id.is_empty() {
        return Err(AuditError::InvalidArgument("actor_id must not be empty"));
    }
    if event.timestamp.timestamp_millis() == 0 {
        return Err(AuditError::InvalidArgument(
            "timestamp must not be the default instant",
        ));
    }
    Ok(())
}
