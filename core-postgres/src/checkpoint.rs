//! Postgres-backed [`CheckpointStore`] (C3), authoritative on restart.
//!
//! Backed by `projection_checkpoint`; `set_if_newer` is a single
//! `INSERT ... ON CONFLICT DO UPDATE WHERE` clause, making the
//! compare-and-advance atomic end-to-end per spec §4.3.

use async_trait::async_trait;
use esrc_core::checkpoint::{CheckpointError, CheckpointStore};
use esrc_core::model::Position;
use sqlx::{PgPool, Row};

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn transient(err: sqlx::Error) -> CheckpointError {
    CheckpointError::Transient(Error::from(err).into())
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Position>, CheckpointError> {
        let row = sqlx::query("SELECT commit_position, prepare_position FROM projection_checkpoint WHERE subscription_id = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;

        Ok(row.map(|r| Position::new(r.get::<i64, _>("commit_position") as u64, r.get::<i64, _>("prepare_position") as u64)))
    }

    async fn set(&self, key: &str, position: Position, _ttl: Option<std::time::Duration>) -> Result<(), CheckpointError> {
        sqlx::query(
            "INSERT INTO projection_checkpoint (subscription_id, commit_position, prepare_position, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (subscription_id) DO UPDATE
               SET commit_position = EXCLUDED.commit_position,
                   prepare_position = EXCLUDED.prepare_position,
                   updated_at = now()",
        )
        .bind(key)
        .bind(position.commit as i64)
        .bind(position.prepare as i64)
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        Ok(())
    }

    async fn set_if_newer(&self, key: &str, position: Position, _ttl: Option<std::time::Duration>) -> Result<bool, CheckpointError> {
        let result = sqlx::query(
            "INSERT INTO projection_checkpoint (subscription_id, commit_position, prepare_position, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (subscription_id) DO UPDATE
               SET commit_position = EXCLUDED.commit_position,
                   prepare_position = EXCLUDED.prepare_position,
                   updated_at = now()
               WHERE projection_checkpoint.commit_position <= EXCLUDED.commit_position",
        )
        .bind(key)
        .bind(position.commit as i64)
        .bind(position.prepare as i64)
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM projection_checkpoint WHERE subscription_id = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(transient)?;

        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CheckpointError> {
        let rows = sqlx::query("SELECT subscription_id FROM projection_checkpoint WHERE subscription_id LIKE $1")
            .bind(format!("{prefix}%"))
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;

        Ok(rows.into_iter().map(|r| r.get("subscription_id")).collect())
    }

    async fn get_all(&self, prefix: &str) -> Result<Vec<(String, Position)>, CheckpointError> {
        let rows = sqlx::query("SELECT subscription_id, commit_position, prepare_position FROM projection_checkpoint WHERE subscription_id LIKE $1")
            .bind(format!("{prefix}%"))
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let key: String = r.get("subscription_id");
                let position = Position::new(r.get::<i64, _>("commit_position") as u64, r.get::<i64, _>("prepare_position") as u64);
                (key, position)
            })
            .collect())
    }

    async fn clear(&self, prefix: &str) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM projection_checkpoint WHERE subscription_id LIKE $1")
            .bind(format!("{prefix}%"))
            .execute(&self.pool)
            .await
            .map_err(transient)?;

        Ok(())
    }
}
