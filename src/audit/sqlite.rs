//! SQLite-backed audit store.
//!
//! Durable [`AuditStore`] with the chain-append critical section implemented
//! as a store-level mutex: sequence allocation, previous-hash read, hash
//! computation, and insert never interleave. Classification is stored twice,
//! as its string form and as a numeric rank so minimum-classification
//! filters run in SQL.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{
    ColumnDef, Expr, Iden, Index, OnConflict, Order, Query, SqliteQueryBuilder, Table,
};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::info;

use super::canonical::compute_event_hash;
use super::memory::verify_events;
use super::store::{
    validate_event, AuditIntegrityResult, AuditQuery, AuditStore, ChainAnchor,
};
use super::{
    AuditError, AuditEvent, AuditEventId, AuditEventType, AuditOutcome, DataClassification, Result,
};
use crate::hashing::{HashFunction, Sha256Hash};

/// Audit event table schema.
#[derive(Iden)]
enum AuditEvents {
    Table,
    #[iden = "event_id"]
    EventId,
    #[iden = "event_type"]
    EventType,
    #[iden = "action"]
    Action,
    #[iden = "outcome"]
    Outcome,
    #[iden = "timestamp"]
    Timestamp,
    #[iden = "actor_id"]
    ActorId,
    #[iden = "actor_type"]
    ActorType,
    #[iden = "resource_id"]
    ResourceId,
    #[iden = "resource_type"]
    ResourceType,
    #[iden = "resource_classification"]
    ResourceClassification,
    #[iden = "classification_rank"]
    ClassificationRank,
    #[iden = "tenant_id"]
    TenantId,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "session_id"]
    SessionId,
    #[iden = "ip_address"]
    IpAddress,
    #[iden = "user_agent"]
    UserAgent,
    #[iden = "reason"]
    Reason,
    #[iden = "metadata"]
    Metadata,
    #[iden = "sequence_number"]
    SequenceNumber,
    #[iden = "previous_event_hash"]
    PreviousEventHash,
    #[iden = "event_hash"]
    EventHash,
}

/// Single-row table holding the retention checkpoint.
#[derive(Iden)]
enum AuditChainAnchor {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "sequence"]
    Sequence,
    #[iden = "previous_event_hash"]
    PreviousEventHash,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuditError::Storage(format!("bad timestamp '{s}': {e}")))
}

fn storage_err(e: sqlx::Error) -> AuditError {
    AuditError::Storage(e.to_string())
}

fn classification_rank(classification: DataClassification) -> i64 {
    match classification {
        DataClassification::Public => 0,
        DataClassification::Internal => 1,
        DataClassification::Confidential => 2,
        DataClassification::Restricted => 3,
    }
}

/// SQLite implementation of [`AuditStore`].
pub struct SqliteAuditStore {
    pool: sqlx::SqlitePool,
    hash: Arc<dyn HashFunction>,
    /// Append critical section.
    append_lock: Mutex<()>,
}

impl SqliteAuditStore {
    /// Create a store over an existing pool with SHA-256 chaining.
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self::with_hash(pool, Arc::new(Sha256Hash))
    }

    /// Create a store over an existing pool and hash function.
    pub fn with_hash(pool: sqlx::SqlitePool, hash: Arc<dyn HashFunction>) -> Self {
        Self {
            pool,
            hash,
            append_lock: Mutex::new(()),
        }
    }

    /// Initialize the audit tables. Safe to call repeatedly.
    pub async fn init(&self) -> Result<()> {
        let create_events = Table::create()
            .table(AuditEvents::Table)
            .if_not_exists()
            .col(ColumnDef::new(AuditEvents::EventId).text().primary_key())
            .col(ColumnDef::new(AuditEvents::EventType).text().not_null())
            .col(ColumnDef::new(AuditEvents::Action).text().not_null())
            .col(ColumnDef::new(AuditEvents::Outcome).text().not_null())
            .col(ColumnDef::new(AuditEvents::Timestamp).text().not_null())
            .col(ColumnDef::new(AuditEvents::ActorId).text().not_null())
            .col(ColumnDef::new(AuditEvents::ActorType).text())
            .col(ColumnDef::new(AuditEvents::ResourceId).text())
            .col(ColumnDef::new(AuditEvents::ResourceType).text())
            .col(ColumnDef::new(AuditEvents::ResourceClassification).text())
            .col(ColumnDef::new(AuditEvents::ClassificationRank).integer())
            .col(ColumnDef::new(AuditEvents::TenantId).text())
            .col(ColumnDef::new(AuditEvents::CorrelationId).text())
            .col(ColumnDef::new(AuditEvents::SessionId).text())
            .col(ColumnDef::new(AuditEvents::IpAddress).text())
            .col(ColumnDef::new(AuditEvents::UserAgent).text())
            .col(ColumnDef::new(AuditEvents::Reason).text())
            .col(ColumnDef::new(AuditEvents::Metadata).text().not_null())
            .col(
                ColumnDef::new(AuditEvents::SequenceNumber)
                    .big_integer()
                    .not_null()
                    .unique_key(),
            )
            .col(
                ColumnDef::new(AuditEvents::PreviousEventHash)
                    .text()
                    .not_null(),
            )
            .col(ColumnDef::new(AuditEvents::EventHash).text().not_null())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_events)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let create_ts_index = Index::create()
            .if_not_exists()
            .name("idx_audit_events_timestamp")
            .table(AuditEvents::Table)
            .col(AuditEvents::Timestamp)
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_ts_index)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let create_anchor = Table::create()
            .table(AuditChainAnchor::Table)
            .if_not_exists()
            .col(ColumnDef::new(AuditChainAnchor::Id).integer().primary_key())
            .col(
                ColumnDef::new(AuditChainAnchor::Sequence)
                    .big_integer()
                    .not_null(),
            )
            .col(
                ColumnDef::new(AuditChainAnchor::PreviousEventHash)
                    .text()
                    .not_null(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_anchor)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        info!("Audit tables initialized (SQLite)");
        Ok(())
    }

    async fn load_anchor(&self) -> Result<Option<ChainAnchor>> {
        let select = Query::select()
            .columns([AuditChainAnchor::Sequence, AuditChainAnchor::PreviousEventHash])
            .from(AuditChainAnchor::Table)
            .and_where(Expr::col(AuditChainAnchor::Id).eq(1))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&select)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|row| ChainAnchor {
            sequence: row.get::<i64, _>("sequence") as u64,
            previous_event_hash: row.get("previous_event_hash"),
        }))
    }

    async fn chain_tail(&self) -> Result<Option<(u64, String)>> {
        let select = Query::select()
            .columns([AuditEvents::SequenceNumber, AuditEvents::EventHash])
            .from(AuditEvents::Table)
            .order_by(AuditEvents::SequenceNumber, Order::Desc)
            .limit(1)
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&select)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|row| {
            (
                row.get::<i64, _>("sequence_number") as u64,
                row.get("event_hash"),
            )
        }))
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEvent> {
        let event_type_str: String = row.get("event_type");
        let event_type = AuditEventType::parse(&event_type_str)
            .ok_or_else(|| AuditError::Storage(format!("unknown event type '{event_type_str}'")))?;
        let outcome_str: String = row.get("outcome");
        let outcome = AuditOutcome::parse(&outcome_str)
            .ok_or_else(|| AuditError::Storage(format!("unknown outcome '{outcome_str}'")))?;
        let classification: Option<String> = row.get("resource_classification");
        let resource_classification = classification
            .as_deref()
            .map(|s| {
                DataClassification::parse(s)
                    .ok_or_else(|| AuditError::Storage(format!("unknown classification '{s}'")))
            })
            .transpose()?;
        let metadata_json: String = row.get("metadata");
        let metadata: HashMap<String, String> = serde_json::from_str(&metadata_json)
            .map_err(|e| AuditError::Storage(format!("bad metadata json: {e}")))?;
        let timestamp: String = row.get("timestamp");

        Ok(AuditEvent {
            event_id: row.get("event_id"),
            event_type,
            action: row.get("action"),
            outcome,
            timestamp: parse_ts(&timestamp)?,
            actor_id: row.get("actor_id"),
            actor_type: row.get("actor_type"),
            resource_id: row.get("resource_id"),
            resource_type: row.get("resource_type"),
            resource_classification,
            tenant_id: row.get("tenant_id"),
            correlation_id: row.get("correlation_id"),
            session_id: row.get("session_id"),
            ip_address: row.get("ip_address"),
            user_agent: row.get("user_agent"),
            reason: row.get("reason"),
            metadata,
            sequence_number: row.get::<i64, _>("sequence_number") as u64,
            previous_event_hash: row.get("previous_event_hash"),
            event_hash: row.get("event_hash"),
        })
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn store(&self, mut event: AuditEvent) -> Result<AuditEventId> {
        validate_event(&event)?;

        let _guard = self.append_lock.lock().await;
        let (sequence, previous_hash) = match self.chain_tail().await? {
            Some((sequence, hash)) => (sequence + 1, hash),
            None => match self.load_anchor().await? {
                Some(anchor) => (anchor.sequence, anchor.previous_event_hash),
                None => (1, String::new()),
            },
        };

        event.sequence_number = sequence;
        event.previous_event_hash = previous_hash.clone();
        event.event_hash = compute_event_hash(self.hash.as_ref(), &event, &previous_hash);

        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| AuditError::Storage(e.to_string()))?;
        let insert = Query::insert()
            .into_table(AuditEvents::Table)
            .columns([
                AuditEvents::EventId,
                AuditEvents::EventType,
                AuditEvents::Action,
                AuditEvents::Outcome,
                AuditEvents::Timestamp,
                AuditEvents::ActorId,
                AuditEvents::ActorType,
                AuditEvents::ResourceId,
                AuditEvents::ResourceType,
                AuditEvents::ResourceClassification,
                AuditEvents::ClassificationRank,
                AuditEvents::TenantId,
                AuditEvents::CorrelationId,
                AuditEvents::SessionId,
                AuditEvents::IpAddress,
                AuditEvents::UserAgent,
                AuditEvents::Reason,
                AuditEvents::Metadata,
                AuditEvents::SequenceNumber,
                AuditEvents::PreviousEventHash,
                AuditEvents::EventHash,
            ])
            .values_panic([
                event.event_id.clone().into(),
                event.event_type.as_str().into(),
                event.action.clone().into(),
                event.outcome.as_str().into(),
                fmt_ts(event.timestamp).into(),
                event.actor_id.clone().into(),
                event.actor_type.clone().into(),
                event.resource_id.clone().into(),
                event.resource_type.clone().into(),
                event
                    .resource_classification
                    .map(|c| c.as_str().to_string())
                    .into(),
                event.resource_classification.map(classification_rank).into(),
                event.tenant_id.clone().into(),
                event.correlation_id.clone().into(),
                event.session_id.clone().into(),
                event.ip_address.clone().into(),
                event.user_agent.clone().into(),
                event.reason.clone().into(),
                metadata.into(),
                sequence.into(),
                event.previous_event_hash.clone().into(),
                event.event_hash.clone().into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&insert)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(AuditEventId {
            event_id: event.event_id,
            event_hash: event.event_hash,
            sequence_number: sequence,
            recorded_at: Utc::now(),
        })
    }

    async fn get_by_id(&self, event_id: &str) -> Result<Option<AuditEvent>> {
        let select = Query::select()
            .expr(Expr::cust("*"))
            .from(AuditEvents::Table)
            .and_where(Expr::col(AuditEvents::EventId).eq(event_id))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&select)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(Self::row_to_event).transpose()
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        query.validate()?;

        let select = {
            let mut select = Query::select();
            select.expr(Expr::cust("*")).from(AuditEvents::Table);
            if let Some(start) = query.start_date {
                select.and_where(Expr::col(AuditEvents::Timestamp).gte(fmt_ts(start)));
            }
            if let Some(end) = query.end_date {
                select.and_where(Expr::col(AuditEvents::Timestamp).lte(fmt_ts(end)));
            }
            if let Some(ref types) = query.event_types {
                let values: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
                select.and_where(Expr::col(AuditEvents::EventType).is_in(values));
            }
            if let Some(ref outcomes) = query.outcomes {
                let values: Vec<&str> = outcomes.iter().map(|o| o.as_str()).collect();
                select.and_where(Expr::col(AuditEvents::Outcome).is_in(values));
            }
            if let Some(ref actor_id) = query.actor_id {
                select.and_where(Expr::col(AuditEvents::ActorId).eq(actor_id.as_str()));
            }
            if let Some(ref resource_id) = query.resource_id {
                select.and_where(Expr::col(AuditEvents::ResourceId).eq(resource_id.as_str()));
            }
            if let Some(ref resource_type) = query.resource_type {
                select.and_where(Expr::col(AuditEvents::ResourceType).eq(resource_type.as_str()));
            }
            if let Some(ref tenant_id) = query.tenant_id {
                select.and_where(Expr::col(AuditEvents::TenantId).eq(tenant_id.as_str()));
            }
            if let Some(ref correlation_id) = query.correlation_id {
                select.and_where(Expr::col(AuditEvents::CorrelationId).eq(correlation_id.as_str()));
            }
            if let Some(min) = query.min_classification {
                select.and_where(
                    Expr::col(AuditEvents::ClassificationRank).gte(classification_rank(min)),
                );
            }
            if let Some(ref needle) = query.action_contains {
                select.and_where(Expr::col(AuditEvents::Action).like(format!("%{needle}%")));
            }
            if let Some(ref ip) = query.ip_address {
                select.and_where(Expr::col(AuditEvents::IpAddress).eq(ip.as_str()));
            }
            let order = if query.ascending { Order::Asc } else { Order::Desc };
            select
                .order_by(AuditEvents::Timestamp, order.clone())
                .order_by(AuditEvents::SequenceNumber, order)
                .offset(query.skip as u64)
                .limit(query.max_results as u64)
                .to_string(SqliteQueryBuilder)
        };

        let rows = sqlx::query(&select)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(Self::row_to_event).collect()
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

        let select = {
            let mut select = Query::select();
            select.expr(Expr::cust("*")).from(AuditEvents::Table);
            if let Some(start) = start {
                select.and_where(Expr::col(AuditEvents::Timestamp).gte(fmt_ts(start)));
            }
            if let Some(end) = end {
                select.and_where(Expr::col(AuditEvents::Timestamp).lte(fmt_ts(end)));
            }
            select
                .order_by(AuditEvents::SequenceNumber, Order::Asc)
                .to_string(SqliteQueryBuilder)
        };

        let rows = sqlx::query(&select)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        let events: Vec<AuditEvent> = rows
            .iter()
            .map(Self::row_to_event)
            .collect::<Result<_>>()?;
        let anchor = self.load_anchor().await?;
        let full_range = start.is_none() && end.is_none();

        Ok(verify_events(
            self.hash.as_ref(),
            &events,
            anchor.as_ref(),
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
        let select = Query::select()
            .expr(Expr::cust("*"))
            .from(AuditEvents::Table)
            .order_by(AuditEvents::SequenceNumber, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&select)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        let mut prefix = Vec::new();
        for row in &rows {
            let event = Self::row_to_event(row)?;
            // Contiguity: stop at the first event inside the horizon.
            if event.timestamp >= older_than {
                break;
            }
            prefix.push(event);
        }
        Ok(prefix)
    }

    async fn delete_up_to(&self, sequence: u64, anchor: ChainAnchor) -> Result<usize> {
        let delete = Query::delete()
            .from_table(AuditEvents::Table)
            .and_where(Expr::col(AuditEvents::SequenceNumber).lte(sequence))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&delete)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let upsert = Query::insert()
            .into_table(AuditChainAnchor::Table)
            .columns([
                AuditChainAnchor::Id,
                AuditChainAnchor::Sequence,
                AuditChainAnchor::PreviousEventHash,
            ])
            .values_panic([
                1.into(),
                anchor.sequence.into(),
                anchor.previous_event_hash.into(),
            ])
            .on_conflict(
                OnConflict::column(AuditChainAnchor::Id)
                    .update_columns([
                        AuditChainAnchor::Sequence,
                        AuditChainAnchor::PreviousEventHash,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&upsert)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(result.rows_affected() as usize)
    }

    async fn latest_sequence(&self) -> Result<Option<u64>> {
        Ok(self.chain_tail().await?.map(|(sequence, _)| sequence))
    }
}
