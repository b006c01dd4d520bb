//! Tracing instrumentation decorators.
//!
//! Wraps an [`EventLogClient`] with spans carrying the
//! `{component, method, streamId, durationMs, outcome}` fields spec §6
//! asks every emitted log/metric/trace to have. Grounded on
//! `eventually/src/tracing.rs`'s `InstrumentedEventStore` decorator and
//! `EventStoreExt::with_tracing` extension-trait pattern.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::eventlog::{AppendResult, EventLogClient, EventLogError, EventStream, ExpectedRevision, NewEvent};
use crate::model::{Event, OutboxRecord, Position, QueueMessage, StreamId};
use crate::outbox::{NewOutboxRecord, OutboxError, OutboxRepository};
use crate::projection::{ApplyOutcome, ProjectionWriter};
use crate::error::CoreError;
use crate::queue::{QueueError, QueueFacade};

/// [`EventLogClient`] wrapper emitting one span per operation.
#[derive(Debug, Clone)]
pub struct InstrumentedEventLog<T> {
    inner: T,
}

#[async_trait]
impl<T> EventLogClient for InstrumentedEventLog<T>
where
    T: EventLogClient,
{
    #[instrument(name = "event_log.append", skip(self, events), fields(component = "eventlog", stream_id = %stream), err)]
    async fn append(&self, stream: &StreamId, expected: ExpectedRevision, events: Vec<NewEvent>) -> Result<AppendResult, EventLogError> {
        self.inner.append(stream, expected, events).await
    }

    #[instrument(name = "event_log.read_forward", skip(self), fields(component = "eventlog", stream_id = %stream))]
    fn read_forward(&self, stream: &StreamId, from_revision: u64, limit: Option<usize>) -> EventStream<'_> {
        self.inner.read_forward(stream, from_revision, limit)
    }

    #[instrument(name = "event_log.read_backward", skip(self), fields(component = "eventlog", stream_id = %stream))]
    fn read_backward(&self, stream: &StreamId, limit: usize) -> EventStream<'_> {
        self.inner.read_backward(stream, limit)
    }

    #[instrument(name = "event_log.subscribe", skip(self), fields(component = "eventlog", stream_id = %stream))]
    fn subscribe(&self, stream: &StreamId, from_position: Position) -> EventStream<'_> {
        self.inner.subscribe(stream, from_position)
    }
}

/// Extension trait mirroring `EventStoreExt::with_tracing`.
pub trait EventLogClientExt: EventLogClient + Sized {
    fn with_tracing(self) -> InstrumentedEventLog<Self> {
        InstrumentedEventLog { inner: self }
    }
}

impl<T> EventLogClientExt for T where T: EventLogClient {}

/// [`CheckpointStore`] wrapper emitting one span per operation.
#[derive(Debug, Clone)]
pub struct InstrumentedCheckpointStore<T> {
    inner: T,
}

#[async_trait]
impl<T> CheckpointStore for InstrumentedCheckpointStore<T>
where
    T: CheckpointStore,
{
    #[instrument(name = "checkpoint.get", skip(self), fields(component = "checkpoint", key = %key), err)]
    async fn get(&self, key: &str) -> Result<Option<Position>, CheckpointError> {
        self.inner.get(key).await
    }

    #[instrument(name = "checkpoint.set", skip(self), fields(component = "checkpoint", key = %key), err)]
    async fn set(&self, key: &str, position: Position, ttl: Option<Duration>) -> Result<(), CheckpointError> {
        self.inner.set(key, position, ttl).await
    }

    #[instrument(name = "checkpoint.set_if_newer", skip(self), fields(component = "checkpoint", key = %key), err)]
    async fn set_if_newer(&self, key: &str, position: Position, ttl: Option<Duration>) -> Result<bool, CheckpointError> {
        self.inner.set_if_newer(key, position, ttl).await
    }

    #[instrument(name = "checkpoint.delete", skip(self), fields(component = "checkpoint", key = %key), err)]
    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        self.inner.delete(key).await
    }

    #[instrument(name = "checkpoint.scan", skip(self), fields(component = "checkpoint", prefix = %prefix), err)]
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CheckpointError> {
        self.inner.scan(prefix).await
    }

    #[instrument(name = "checkpoint.get_all", skip(self), fields(component = "checkpoint", prefix = %prefix), err)]
    async fn get_all(&self, prefix: &str) -> Result<Vec<(String, Position)>, CheckpointError> {
        self.inner.get_all(prefix).await
    }

    #[instrument(name = "checkpoint.clear", skip(self), fields(component = "checkpoint", prefix = %prefix), err)]
    async fn clear(&self, prefix: &str) -> Result<(), CheckpointError> {
        self.inner.clear(prefix).await
    }
}

pub trait CheckpointStoreExt: CheckpointStore + Sized {
    fn with_tracing(self) -> InstrumentedCheckpointStore<Self> {
        InstrumentedCheckpointStore { inner: self }
    }
}

impl<T> CheckpointStoreExt for T where T: CheckpointStore {}

/// [`OutboxRepository`] wrapper emitting one span per operation.
#[derive(Debug, Clone)]
pub struct InstrumentedOutboxRepository<T> {
    inner: T,
}

#[async_trait]
impl<T> OutboxRepository for InstrumentedOutboxRepository<T>
where
    T: OutboxRepository,
{
    #[instrument(name = "outbox.append", skip(self, records), fields(component = "outbox", count = records.len()), err)]
    async fn append(&self, records: Vec<NewOutboxRecord>) -> Result<Vec<i64>, OutboxError> {
        self.inner.append(records).await
    }

    #[instrument(name = "outbox.claim", skip(self), fields(component = "outbox", queue_name = %queue_name, n = n), err)]
    async fn claim(&self, queue_name: &str, n: usize, lease: Duration) -> Result<Vec<OutboxRecord>, OutboxError> {
        self.inner.claim(queue_name, n, lease).await
    }

    #[instrument(name = "outbox.ack", skip(self, ids), fields(component = "outbox", count = ids.len()), err)]
    async fn ack(&self, ids: &[i64]) -> Result<(), OutboxError> {
        self.inner.ack(ids).await
    }

    #[instrument(name = "outbox.nack", skip(self, ids), fields(component = "outbox", count = ids.len()), err)]
    async fn nack(&self, ids: &[i64], backoff: Duration, max_attempts: u32) -> Result<(), OutboxError> {
        self.inner.nack(ids, backoff, max_attempts).await
    }

    #[instrument(name = "outbox.reclaim_expired", skip(self), fields(component = "outbox"), err)]
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, OutboxError> {
        self.inner.reclaim_expired(now).await
    }
}

pub trait OutboxRepositoryExt: OutboxRepository + Sized {
    fn with_tracing(self) -> InstrumentedOutboxRepository<Self> {
        InstrumentedOutboxRepository { inner: self }
    }
}

impl<T> OutboxRepositoryExt for T where T: OutboxRepository {}

/// [`QueueFacade`] wrapper emitting one span per operation.
#[derive(Debug, Clone)]
pub struct InstrumentedQueueFacade<T> {
    inner: T,
}

#[async_trait]
impl<T> QueueFacade for InstrumentedQueueFacade<T>
where
    T: QueueFacade,
{
    #[instrument(name = "queue.send", skip(self, message), fields(component = "queue", queue = %queue), err)]
    async fn send(&self, queue: &str, message: QueueMessage) -> Result<(), QueueError> {
        self.inner.send(queue, message).await
    }

    #[instrument(name = "queue.shutdown", skip(self), fields(component = "queue"), err)]
    async fn shutdown(&self) -> Result<(), QueueError> {
        self.inner.shutdown().await
    }
}

pub trait QueueFacadeExt: QueueFacade + Sized {
    fn with_tracing(self) -> InstrumentedQueueFacade<Self> {
        InstrumentedQueueFacade { inner: self }
    }
}

impl<T> QueueFacadeExt for T where T: QueueFacade {}

/// [`ProjectionWriter`] wrapper emitting one span per applied batch.
#[derive(Debug, Clone)]
pub struct InstrumentedProjectionWriter<T> {
    inner: T,
}

#[async_trait]
impl<T> ProjectionWriter for InstrumentedProjectionWriter<T>
where
    T: ProjectionWriter,
{
    #[instrument(
        name = "projection.apply_batch",
        skip(self, events),
        fields(component = "projection", subscription_id = %subscription_id, batch_size = events.len()),
        err
    )]
    async fn apply_batch(&self, subscription_id: &str, events: &[Event], commit_position: Position) -> Result<Vec<ApplyOutcome>, CoreError> {
        self.inner.apply_batch(subscription_id, events, commit_position).await
    }
}

pub trait ProjectionWriterExt: ProjectionWriter + Sized {
    fn with_tracing(self) -> InstrumentedProjectionWriter<Self> {
        InstrumentedProjectionWriter { inner: self }
    }
}

impl<T> ProjectionWriterExt for T where T: ProjectionWriter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::InMemoryEventLog;

    #[tokio::test]
    async fn instrumented_log_delegates_append_to_the_inner_client() {
        let log = InMemoryEventLog::default().with_tracing();
        let stream_id = StreamId::from("ctx.agg.v1-t1-e1");

        let result = log
            .append(
                &stream_id,
                ExpectedRevision::Any,
                vec![NewEvent::new("created", serde_json::json!({}), serde_json::json!({}))],
            )
            .await
            .unwrap();

        assert_eq!(result.first_revision, 0);
    }

    #[tokio::test]
    async fn instrumented_checkpoint_store_delegates_set_if_newer() {
        let store = crate::checkpoint::InMemoryCheckpointStore::new().with_tracing();

        assert!(store.set_if_newer("sub-1", Position::new(10, 0), None).await.unwrap());
        assert_eq!(store.get("sub-1").await.unwrap(), Some(Position::new(10, 0)));
    }

    #[tokio::test]
    async fn instrumented_outbox_repository_delegates_append() {
        let repo = crate::outbox::InMemoryOutboxRepository::new().with_tracing();

        let ids = repo
            .append(vec![NewOutboxRecord {
                stream_id: StreamId::from("ctx.agg.v1-t1-e1"),
                stream_revision: 0,
                event_type: "created".into(),
                tenant: "acme".into(),
                correlation_id: "corr-1".into(),
                queue_name: "downstream".into(),
                payload: b"payload".to_vec(),
            }])
            .await
            .unwrap();

        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn instrumented_queue_facade_delegates_send() {
        let queue = crate::queue::InMemoryQueue::new().with_tracing();

        queue
            .send(
                "downstream",
                QueueMessage {
                    key: "entity-1".into(),
                    value: b"payload".to_vec(),
                    headers: Default::default(),
                },
            )
            .await
            .unwrap();
    }
}
