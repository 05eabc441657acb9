//! SQLite-backed outbox store.
//!
//! Durable [`OutboxStore`] for single-node deployments. Schema is created by
//! an idempotent `init()`; timestamps are stored as fixed-width RFC 3339
//! text so lexicographic order matches chronological order, and headers as a
//! JSON object column.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{
    ColumnDef, Cond, Expr, Iden, Index, Order, Query, SqliteQueryBuilder, Table,
};
use sqlx::Row;
use tracing::info;

use super::store::{OutboxError, OutboxStore, Result};
use super::{
    MessageStatus, OutboundMessage, TransportDelivery, TransportDeliveryStatus,
};

/// Outbox table schema.
#[derive(Iden)]
enum Outbox {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "message_type"]
    MessageType,
    #[iden = "payload"]
    Payload,
    #[iden = "destination"]
    Destination,
    #[iden = "headers"]
    Headers,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "scheduled_at"]
    ScheduledAt,
    #[iden = "status"]
    Status,
    #[iden = "retry_count"]
    RetryCount,
    #[iden = "last_error"]
    LastError,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "last_attempt_at"]
    LastAttemptAt,
}

/// Per-transport delivery table schema.
#[derive(Iden)]
enum OutboxTransport {
    Table,
    #[iden = "message_id"]
    MessageId,
    #[iden = "transport_name"]
    TransportName,
    #[iden = "destination"]
    Destination,
    #[iden = "status"]
    Status,
    #[iden = "retry_count"]
    RetryCount,
    #[iden = "last_error"]
    LastError,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OutboxError::Storage(format!("bad timestamp '{s}': {e}")))
}

fn storage_err(e: sqlx::Error) -> OutboxError {
    OutboxError::Storage(e.to_string())
}

/// SQLite implementation of [`OutboxStore`].
pub struct SqliteOutboxStore {
    pool: sqlx::SqlitePool,
}

impl SqliteOutboxStore {
    /// Create a store over an existing pool.
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the outbox tables. Safe to call repeatedly.
    pub async fn init(&self) -> Result<()> {
        let create_outbox = Table::create()
            .table(Outbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Outbox::Id).text().primary_key())
            .col(ColumnDef::new(Outbox::MessageType).text().not_null())
            .col(ColumnDef::new(Outbox::Payload).blob().not_null())
            .col(ColumnDef::new(Outbox::Destination).text().not_null())
            .col(ColumnDef::new(Outbox::Headers).text().not_null())
            .col(ColumnDef::new(Outbox::CorrelationId).text())
            .col(ColumnDef::new(Outbox::ScheduledAt).text())
            .col(ColumnDef::new(Outbox::Status).text().not_null())
            .col(
                ColumnDef::new(Outbox::RetryCount)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(ColumnDef::new(Outbox::LastError).text())
            .col(ColumnDef::new(Outbox::CreatedAt).text().not_null())
            .col(ColumnDef::new(Outbox::LastAttemptAt).text())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_outbox)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let create_status_index = Index::create()
            .if_not_exists()
            .name("idx_outbox_status_created_at")
            .table(Outbox::Table)
            .col(Outbox::Status)
            .col(Outbox::CreatedAt)
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_status_index)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let create_transport = Table::create()
            .table(OutboxTransport::Table)
            .if_not_exists()
            .col(ColumnDef::new(OutboxTransport::MessageId).text().not_null())
            .col(
                ColumnDef::new(OutboxTransport::TransportName)
                    .text()
                    .not_null(),
            )
            .col(
                ColumnDef::new(OutboxTransport::Destination)
                    .text()
                    .not_null(),
            )
            .col(ColumnDef::new(OutboxTransport::Status).text().not_null())
            .col(
                ColumnDef::new(OutboxTransport::RetryCount)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(ColumnDef::new(OutboxTransport::LastError).text())
            .primary_key(
                Index::create()
                    .col(OutboxTransport::MessageId)
                    .col(OutboxTransport::TransportName),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_transport)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let create_transport_index = Index::create()
            .if_not_exists()
            .name("idx_outbox_transport_status")
            .table(OutboxTransport::Table)
            .col(OutboxTransport::TransportName)
            .col(OutboxTransport::Status)
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_transport_index)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        info!("Outbox tables initialized (SQLite)");
        Ok(())
    }

    async fn insert_message(&self, message: &OutboundMessage) -> Result<()> {
        let headers = serde_json::to_string(&message.headers)
            .map_err(|e| OutboxError::Storage(e.to_string()))?;
        let insert = Query::insert()
            .into_table(Outbox::Table)
            .columns([
                Outbox::Id,
                Outbox::MessageType,
                Outbox::Payload,
                Outbox::Destination,
                Outbox::Headers,
                Outbox::CorrelationId,
                Outbox::ScheduledAt,
                Outbox::Status,
                Outbox::RetryCount,
                Outbox::LastError,
                Outbox::CreatedAt,
                Outbox::LastAttemptAt,
            ])
            .values_panic([
                message.id.clone().into(),
                message.message_type.clone().into(),
                message.payload.clone().into(),
                message.destination.clone().into(),
                headers.into(),
                message.correlation_id.clone().into(),
                message.scheduled_at.map(fmt_ts).into(),
                message.status.as_str().into(),
                message.retry_count.into(),
                message.last_error.clone().into(),
                fmt_ts(message.created_at).into(),
                message.last_attempt_at.map(fmt_ts).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&insert).execute(&self.pool).await.map_err(|e| {
            if let sqlx::Error::Database(ref db) = e {
                if db.message().contains("UNIQUE") {
                    return OutboxError::Duplicate(message.id.clone());
                }
            }
            storage_err(e)
        })?;
        Ok(())
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<OutboundMessage> {
        let headers_json: String = row.get("headers");
        let headers = serde_json::from_str(&headers_json)
            .map_err(|e| OutboxError::Storage(format!("bad headers json: {e}")))?;
        let status_str: String = row.get("status");
        let status = MessageStatus::parse(&status_str)
            .ok_or_else(|| OutboxError::Storage(format!("unknown status '{status_str}'")))?;
        let scheduled_at: Option<String> = row.get("scheduled_at");
        let last_attempt_at: Option<String> = row.get("last_attempt_at");
        let created_at: String = row.get("created_at");

        Ok(OutboundMessage {
            id: row.get("id"),
            message_type: row.get("message_type"),
            payload: row.get("payload"),
            destination: row.get("destination"),
            headers,
            correlation_id: row.get("correlation_id"),
            scheduled_at: scheduled_at.as_deref().map(parse_ts).transpose()?,
            status,
            retry_count: row.get::<i64, _>("retry_count") as u32,
            last_error: row.get("last_error"),
            created_at: parse_ts(&created_at)?,
            last_attempt_at: last_attempt_at.as_deref().map(parse_ts).transpose()?,
        })
    }

    fn row_to_delivery(row: &sqlx::sqlite::SqliteRow) -> Result<TransportDelivery> {
        let status_str: String = row.get("status");
        let status = TransportDeliveryStatus::parse(&status_str)
            .ok_or_else(|| OutboxError::Storage(format!("unknown status '{status_str}'")))?;
        Ok(TransportDelivery {
            message_id: row.get("message_id"),
            transport_name: row.get("transport_name"),
            destination: row.get("destination"),
            status,
            retry_count: row.get::<i64, _>("retry_count") as u32,
            last_error: row.get("last_error"),
        })
    }

    async fn fetch_messages(&self, select: String) -> Result<Vec<OutboundMessage>> {
        let rows = sqlx::query(&select)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(Self::row_to_message).collect()
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn stage(&self, message: OutboundMessage) -> Result<()> {
        self.insert_message(&message).await
    }

    async fn stage_with_transports(
        &self,
        message: OutboundMessage,
        deliveries: Vec<TransportDelivery>,
    ) -> Result<()> {
        self.insert_message(&message).await?;
        for delivery in deliveries {
            let insert = Query::insert()
                .into_table(OutboxTransport::Table)
                .columns([
                    OutboxTransport::MessageId,
                    OutboxTransport::TransportName,
                    OutboxTransport::Destination,
                    OutboxTransport::Status,
                    OutboxTransport::RetryCount,
                    OutboxTransport::LastError,
                ])
                .values_panic([
                    delivery.message_id.into(),
                    delivery.transport_name.into(),
                    delivery.destination.into(),
                    delivery.status.as_str().into(),
                    delivery.retry_count.into(),
                    delivery.last_error.into(),
                ])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&insert)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<OutboundMessage>> {
        let select = Query::select()
            .expr(Expr::cust("*"))
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Id).eq(id))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&select)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn get_unsent(&self, limit: usize) -> Result<Vec<OutboundMessage>> {
        let now = fmt_ts(Utc::now());
        let select = Query::select()
            .expr(Expr::cust("*"))
            .from(Outbox::Table)
            .cond_where(
                Cond::any()
                    .add(Expr::col(Outbox::Status).eq(MessageStatus::Staged.as_str()))
                    .add(
                        Cond::all()
                            .add(Expr::col(Outbox::Status).eq(MessageStatus::Scheduled.as_str()))
                            .add(Expr::col(Outbox::ScheduledAt).lte(now.clone())),
                    ),
            )
            .order_by(Outbox::CreatedAt, Order::Asc)
            .order_by_expr(Expr::cust("rowid"), Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);
        self.fetch_messages(select).await
    }

    async fn get_scheduled(&self, limit: usize) -> Result<Vec<OutboundMessage>> {
        let now = fmt_ts(Utc::now());
        let select = Query::select()
            .expr(Expr::cust("*"))
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Status).eq(MessageStatus::Scheduled.as_str()))
            .and_where(Expr::col(Outbox::ScheduledAt).lte(now))
            .order_by(Outbox::CreatedAt, Order::Asc)
            .order_by_expr(Expr::cust("rowid"), Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);
        self.fetch_messages(select).await
    }

    async fn mark_sent(&self, id: &str) -> Result<()> {
        let update = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Status, MessageStatus::Published.as_str())
            .value(Outbox::LastError, Option::<String>::None)
            .value(Outbox::LastAttemptAt, fmt_ts(Utc::now()))
            .and_where(Expr::col(Outbox::Id).eq(id))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&update)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str, retry_count: u32) -> Result<()> {
        // Published is terminal, so the guard is part of the predicate.
        let update = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Status, MessageStatus::Failed.as_str())
            .value(Outbox::LastError, error)
            .value(Outbox::RetryCount, retry_count)
            .value(Outbox::LastAttemptAt, fmt_ts(Utc::now()))
            .and_where(Expr::col(Outbox::Id).eq(id))
            .and_where(Expr::col(Outbox::Status).ne(MessageStatus::Published.as_str()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&update)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_failed(
        &self,
        max_retries: u32,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>> {
        let select = {
            let mut select = Query::select();
            select
                .expr(Expr::cust("*"))
                .from(Outbox::Table)
                .and_where(Expr::col(Outbox::Status).eq(MessageStatus::Failed.as_str()))
                .and_where(Expr::col(Outbox::RetryCount).lt(max_retries));
            if let Some(since) = since {
                select.and_where(Expr::col(Outbox::CreatedAt).gte(fmt_ts(since)));
            }
            select
                .order_by(Outbox::CreatedAt, Order::Asc)
                .order_by_expr(Expr::cust("rowid"), Order::Asc)
                .limit(limit as u64)
                .to_string(SqliteQueryBuilder)
        };
        self.fetch_messages(select).await
    }

    async fn get_pending_transport_deliveries(
        &self,
        transport_name: &str,
        limit: usize,
    ) -> Result<Vec<TransportDelivery>> {
        let select = Query::select()
            .expr(Expr::cust("*"))
            .from(OutboxTransport::Table)
            .and_where(Expr::col(OutboxTransport::TransportName).eq(transport_name))
            .and_where(
                Expr::col(OutboxTransport::Status).eq(TransportDeliveryStatus::Pending.as_str()),
            )
            .order_by_expr(Expr::cust("rowid"), Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&select)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(Self::row_to_delivery).collect()
    }

    async fn get_transport_deliveries(&self, message_id: &str) -> Result<Vec<TransportDelivery>> {
        let select = Query::select()
            .expr(Expr::cust("*"))
            .from(OutboxTransport::Table)
            .and_where(Expr::col(OutboxTransport::MessageId).eq(message_id))
            .order_by_expr(Expr::cust("rowid"), Order::Asc)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&select)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(Self::row_to_delivery).collect()
    }

    async fn mark_transport_sent(&self, message_id: &str, transport_name: &str) -> Result<()> {
        let update = Query::update()
            .table(OutboxTransport::Table)
            .value(OutboxTransport::Status, TransportDeliveryStatus::Sent.as_str())
            .value(OutboxTransport::LastError, Option::<String>::None)
            .and_where(Expr::col(OutboxTransport::MessageId).eq(message_id))
            .and_where(Expr::col(OutboxTransport::TransportName).eq(transport_name))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&update)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(format!(
                "{message_id}/{transport_name}"
            )));
        }

        let outstanding = Query::select()
            .expr(Expr::cust("COUNT(*) AS outstanding"))
            .from(OutboxTransport::Table)
            .and_where(Expr::col(OutboxTransport::MessageId).eq(message_id))
            .and_where(
                Expr::col(OutboxTransport::Status).ne(TransportDeliveryStatus::Sent.as_str()),
            )
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&outstanding)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let outstanding: i64 = row.get("outstanding");
        if outstanding == 0 {
            self.mark_sent(message_id).await?;
        }
        Ok(())
    }

    async fn mark_transport_failed(
        &self,
        message_id: &str,
        transport_name: &str,
        error: &str,
    ) -> Result<()> {
        let update = Query::update()
            .table(OutboxTransport::Table)
            .value(
                OutboxTransport::Status,
                TransportDeliveryStatus::Failed.as_str(),
            )
            .value(OutboxTransport::LastError, error)
            .value(
                OutboxTransport::RetryCount,
                Expr::col(OutboxTransport::RetryCount).add(1),
            )
            .and_where(Expr::col(OutboxTransport::MessageId).eq(message_id))
            .and_where(Expr::col(OutboxTransport::TransportName).eq(transport_name))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&update)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(format!(
                "{message_id}/{transport_name}"
            )));
        }
        Ok(())
    }
}
