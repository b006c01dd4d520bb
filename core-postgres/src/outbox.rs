//! Postgres-backed [`OutboxRepository`] (C7).
//!
//! Claim uses `FOR UPDATE SKIP LOCKED` over the lowest-revision pending
//! record per stream, giving the per-stream FIFO invariant (spec §4.7)
//! without a separate lock table.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use esrc_core::model::{OutboxRecord, OutboxStatus, StreamId};
use esrc_core::outbox::{NewOutboxRecord, OutboxError, OutboxRepository};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn transient(err: sqlx::Error) -> OutboxError {
    OutboxError::Transient(err.into())
}

fn parse_status(s: &str) -> OutboxStatus {
    match s {
        "inflight" => OutboxStatus::Inflight,
        "done" => OutboxStatus::Done,
        "dead" => OutboxStatus::Dead,
        _ => OutboxStatus::Pending,
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, sqlx::Error> {
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        stream_id: StreamId::from(row.try_get::<String, _>("stream_id")?),
        stream_revision: row.try_get::<i64, _>("stream_revision")? as u64,
        event_type: row.try_get("event_type")?,
        tenant: row.try_get("tenant")?,
        correlation_id: row.try_get("correlation_id")?,
        queue_name: row.try_get("queue_name")?,
        payload: row.try_get("payload")?,
        enqueued_at: row.try_get("enqueued_at")?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        next_attempt_at: row.try_get("next_attempt_at")?,
        status: parse_status(row.try_get::<String, _>("status")?.as_str()),
    })
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn append(&self, records: Vec<NewOutboxRecord>) -> Result<Vec<i64>, OutboxError> {
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            let row = sqlx::query(
                "INSERT INTO outbox (stream_id, stream_revision, event_type, tenant, correlation_id, queue_name, payload, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
                 RETURNING id",
            )
            .bind(record.stream_id.as_str())
            .bind(record.stream_revision as i64)
            .bind(&record.event_type)
            .bind(&record.tenant)
            .bind(&record.correlation_id)
            .bind(&record.queue_name)
            .bind(&record.payload)
            .fetch_one(&self.pool)
            .await
            .map_err(transient)?;

            ids.push(row.get("id"));
        }

        Ok(ids)
    }

    async fn claim(&self, queue_name: &str, n: usize, lease: Duration) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut tx = self.pool.begin().await.map_err(transient)?;

        // For every stream with outstanding (pending or inflight) work on
        // this queue, only its lowest revision is eligible; a row-level
        // lock on that set, taken with SKIP LOCKED, is the whole CAS.
        let rows = sqlx::query(
            "WITH heads AS (
                 SELECT DISTINCT ON (stream_id) id
                 FROM outbox
                 WHERE queue_name = $1 AND status IN ('pending', 'inflight')
                 ORDER BY stream_id, stream_revision ASC
             )
             SELECT o.* FROM outbox o
             JOIN heads ON heads.id = o.id
             WHERE o.status = 'pending' AND o.next_attempt_at <= now()
             ORDER BY o.stream_id, o.stream_revision
             LIMIT $2
             FOR UPDATE SKIP LOCKED",
        )
        .bind(queue_name)
        .bind(n as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(transient)?;

        let mut claimed = Vec::with_capacity(rows.len());
        let lease_expiry = Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());

        for row in &rows {
            let record = row_to_record(row).map_err(transient)?;

            sqlx::query("UPDATE outbox SET status = 'inflight', lease_expires_at = $2 WHERE id = $1")
                .bind(record.id)
                .bind(lease_expiry)
                .execute(&mut *tx)
                .await
                .map_err(transient)?;

            claimed.push(OutboxRecord {
                status: OutboxStatus::Inflight,
                ..record
            });
        }

        tx.commit().await.map_err(transient)?;

        Ok(claimed)
    }

    async fn ack(&self, ids: &[i64]) -> Result<(), OutboxError> {
        sqlx::query("UPDATE outbox SET status = 'done' WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(transient)?;

        Ok(())
    }

    async fn nack(&self, ids: &[i64], backoff: Duration, max_attempts: u32) -> Result<(), OutboxError> {
        let backoff_interval = chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());
        let next_attempt_at = Utc::now() + backoff_interval;

        sqlx::query(
            "UPDATE outbox
             SET attempts = attempts + 1,
                 next_attempt_at = $2,
                 status = CASE WHEN attempts + 1 > $3 THEN 'dead' ELSE 'pending' END
             WHERE id = ANY($1)",
        )
        .bind(ids)
        .bind(next_attempt_at)
        .bind(max_attempts as i32)
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, OutboxError> {
        let result = sqlx::query("UPDATE outbox SET status = 'pending' WHERE status = 'inflight' AND lease_expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(transient)?;

        Ok(result.rows_affected() as usize)
    }
}
