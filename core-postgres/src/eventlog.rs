//! Postgres-backed [`EventLogClient`].
//!
//! Grounded on `eventually-postgres/src/store.rs`'s `EventStore`: a
//! connection-pooled client backed by a handful of hand-written SQL
//! statements, swapped from `bb8`/`tokio_postgres` onto `sqlx`'s pool +
//! `FOR UPDATE` row locking for the CAS append.

use std::time::Duration;

use async_trait::async_trait;
use esrc_core::error::{ConflictError, ExpectedRevisionReport};
use esrc_core::eventlog::{AppendResult, EventLogClient, EventLogError, EventStream, ExpectedRevision, NewEvent};
use esrc_core::model::{Event, Position, StreamId};
use futures::stream::{self, StreamExt};
use sqlx::{PgPool, Row};

use crate::error::Error;

/// Postgres-backed event log client.
#[derive(Debug, Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
    /// Polling interval used by `subscribe`'s live-tail loop, in absence
    /// of LISTEN/NOTIFY wiring.
    poll_interval: Duration,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, Error> {
    Ok(Event {
        id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        data: row.try_get("data")?,
        metadata: row.try_get("metadata")?,
        stream_revision: row.try_get::<i64, _>("stream_revision")? as u64,
        global_position: Position::new(
            row.try_get::<i64, _>("commit_position")? as u64,
            row.try_get::<i64, _>("prepare_position")? as u64,
        ),
        link_position: None,
        recorded_at: row.try_get("recorded_at")?,
    })
}

#[async_trait]
impl EventLogClient for PostgresEventLog {
    #[tracing::instrument(name = "postgres.event_log.append", skip(self, events), fields(stream_id = %stream), err)]
    async fn append(&self, stream: &StreamId, expected: ExpectedRevision, events: Vec<NewEvent>) -> Result<AppendResult, EventLogError> {
        let mut tx = self.pool.begin().await.map_err(|e| EventLogError::Transient(Error::from(e).into()))?;

        let current: Option<i64> = sqlx::query_scalar("SELECT next_revision FROM streams WHERE stream_id = $1 FOR UPDATE")
            .bind(stream.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| EventLogError::Transient(Error::from(e).into()))?;

        let exists = current.is_some();
        let current_revision = current.unwrap_or(0) as u64;

        let expectation_met = match expected {
            ExpectedRevision::Any => true,
            ExpectedRevision::NoStream => !exists,
            ExpectedRevision::StreamExists => exists,
            ExpectedRevision::Exact(v) => current_revision == v,
        };

        if !expectation_met {
            let expected_report = match expected {
                ExpectedRevision::Any => unreachable!(),
                ExpectedRevision::NoStream => ExpectedRevisionReport::NoStream,
                ExpectedRevision::StreamExists => ExpectedRevisionReport::StreamExists,
                ExpectedRevision::Exact(v) => ExpectedRevisionReport::Exact(v),
            };

            return Err(EventLogError::Conflict(ConflictError {
                expected: expected_report,
                actual: current_revision,
            }));
        }

        if events.is_empty() {
            tx.commit().await.map_err(|e| EventLogError::Transient(Error::from(e).into()))?;
            return Ok(AppendResult {
                first_revision: current_revision,
                last_revision: current_revision.saturating_sub(1),
                last_position: Position::new(0, 0),
            });
        }

        if !exists {
            sqlx::query("INSERT INTO streams (stream_id, next_revision) VALUES ($1, 0)")
                .bind(stream.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| EventLogError::Transient(Error::from(e).into()))?;
        }

        let first_revision = current_revision;
        let mut last_commit = 0i64;

        for (i, new_event) in events.iter().enumerate() {
            let revision = (first_revision + i as u64) as i64;

            let row = sqlx::query(
                "INSERT INTO events (event_id, stream_id, stream_revision, event_type, data, metadata)
                 VALUES (gen_random_uuid(), $1, $2, $3, $4, $5)
                 RETURNING commit_position",
            )
            .bind(stream.as_str())
            .bind(revision)
            .bind(&new_event.event_type)
            .bind(&new_event.data)
            .bind(&new_event.metadata)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| EventLogError::Transient(Error::from(e).into()))?;

            last_commit = row.try_get("commit_position").map_err(|e| EventLogError::Transient(Error::from(e).into()))?;
        }

        let last_revision = first_revision + events.len() as u64 - 1;

        sqlx::query("UPDATE streams SET next_revision = $2 WHERE stream_id = $1")
            .bind(stream.as_str())
            .bind(last_revision as i64 + 1)
            .execute(&mut *tx)
            .await
            .map_err(|e| EventLogError::Transient(Error::from(e).into()))?;

        tx.commit().await.map_err(|e| EventLogError::Transient(Error::from(e).into()))?;

        Ok(AppendResult {
            first_revision,
            last_revision,
            last_position: Position::new(last_commit as u64, 0),
        })
    }

    fn read_forward(&self, stream: &StreamId, from_revision: u64, limit: Option<usize>) -> EventStream<'_> {
        let pool = self.pool.clone();
        let stream_id = stream.clone();

        Box::pin(stream::once(async move {
            let rows = sqlx::query(
                "SELECT event_id, event_type, data, metadata, stream_revision, commit_position, prepare_position, recorded_at
                 FROM events WHERE stream_id = $1 AND stream_revision >= $2
                 ORDER BY stream_revision ASC LIMIT $3",
            )
            .bind(stream_id.as_str())
            .bind(from_revision as i64)
            .bind(limit.unwrap_or(i64::MAX as usize) as i64)
            .fetch_all(&pool)
            .await;

            match rows {
                Ok(rows) => stream::iter(rows.iter().map(row_to_event).map(|r| r.map_err(|e| EventLogError::Transient(e.into()))).collect::<Vec<_>>()),
                Err(e) => stream::iter(vec![Err(EventLogError::Transient(Error::from(e).into()))]),
            }
        })
        .flatten())
    }

    fn read_backward(&self, stream: &StreamId, limit: usize) -> EventStream<'_> {
        let pool = self.pool.clone();
        let stream_id = stream.clone();

        Box::pin(stream::once(async move {
            let rows = sqlx::query(
                "SELECT event_id, event_type, data, metadata, stream_revision, commit_position, prepare_position, recorded_at
                 FROM events WHERE stream_id = $1
                 ORDER BY stream_revision DESC LIMIT $2",
            )
            .bind(stream_id.as_str())
            .bind(limit as i64)
            .fetch_all(&pool)
            .await;

            match rows {
                Ok(rows) => stream::iter(rows.iter().map(row_to_event).map(|r| r.map_err(|e| EventLogError::Transient(e.into()))).collect::<Vec<_>>()),
                Err(e) => stream::iter(vec![Err(EventLogError::Transient(Error::from(e).into()))]),
            }
        })
        .flatten())
    }

    fn subscribe(&self, stream: &StreamId, from_position: Position) -> EventStream<'_> {
        if let Some(category) = stream.category_prefix() {
            return self.subscribe_category(category.to_owned(), from_position);
        }

        let pool = self.pool.clone();
        let stream_id = stream.clone();
        let poll_interval = self.poll_interval;

        // No LISTEN/NOTIFY wiring: the live tail is a bounded poll loop,
        // re-reading anything past the last position seen. Redelivery
        // across polls is expected and tolerated by the at-least-once
        // contract.
        Box::pin(stream::unfold(from_position.commit as i64, move |cursor| {
            let pool = pool.clone();
            let stream_id = stream_id.clone();

            async move {
                loop {
                    let rows = sqlx::query(
                        "SELECT event_id, event_type, data, metadata, stream_revision, commit_position, prepare_position, recorded_at
                         FROM events WHERE stream_id = $1 AND commit_position >= $2
                         ORDER BY commit_position ASC LIMIT 256",
                    )
                    .bind(stream_id.as_str())
                    .bind(cursor)
                    .fetch_all(&pool)
                    .await;

                    match rows {
                        Ok(rows) if !rows.is_empty() => {
                            let next_cursor = rows.last().and_then(|r| r.try_get::<i64, _>("commit_position").ok()).map(|c| c + 1).unwrap_or(cursor);

                            let events: Vec<Result<Event, EventLogError>> =
                                rows.iter().map(row_to_event).map(|r| r.map_err(|e| EventLogError::Transient(e.into()))).collect();

                            return Some((stream::iter(events), next_cursor));
                        }
                        Ok(_) => {
                            tokio::time::sleep(poll_interval).await;
                        }
                        Err(e) => {
                            return Some((stream::iter(vec![Err(EventLogError::Transient(Error::from(e).into()))]), cursor));
                        }
                    }
                }
            }
        })
        .flatten())
    }

    /// Live-tails every stream whose identity falls under `category`
    /// (the `<context>.<aggregate>.v<schema>` prefix), numbering each
    /// resolved event with a category-local `link_position` ordinal per
    /// spec §4.1, distinct from the event's own `global_position`.
    fn subscribe_category(&self, category: String, from_position: Position) -> EventStream<'_> {
        let pool = self.pool.clone();
        let poll_interval = self.poll_interval;
        let like_pattern = format!("{category}-%");

        Box::pin(stream::unfold((from_position.commit as i64, from_position.commit), move |(cursor, ordinal)| {
            let pool = pool.clone();
            let like_pattern = like_pattern.clone();

            async move {
                let mut ordinal = ordinal;

                loop {
                    let rows = sqlx::query(
                        "SELECT event_id, event_type, data, metadata, stream_revision, commit_position, prepare_position, recorded_at
                         FROM events WHERE stream_id LIKE $1 AND commit_position >= $2
                         ORDER BY commit_position ASC, prepare_position ASC LIMIT 256",
                    )
                    .bind(&like_pattern)
                    .bind(cursor)
                    .fetch_all(&pool)
                    .await;

                    match rows {
                        Ok(rows) if !rows.is_empty() => {
                            let next_cursor = rows.last().and_then(|r| r.try_get::<i64, _>("commit_position").ok()).map(|c| c + 1).unwrap_or(cursor);

                            let events: Vec<Result<Event, EventLogError>> = rows
                                .iter()
                                .map(row_to_event)
                                .map(|r| {
                                    r.map(|mut event| {
                                        event.link_position = Some(Position::new(ordinal, 0));
                                        ordinal += 1;
                                        event
                                    })
                                    .map_err(|e| EventLogError::Transient(e.into()))
                                })
                                .collect();

                            return Some((stream::iter(events), (next_cursor, ordinal)));
                        }
                        Ok(_) => {
                            tokio::time::sleep(poll_interval).await;
                        }
                        Err(e) => {
                            return Some((stream::iter(vec![Err(EventLogError::Transient(Error::from(e).into()))]), (cursor, ordinal)));
                        }
                    }
                }
            }
        })
        .flatten())
    }
}
