//! C1 -- Event Log Client.
//!
//! Abstracts append / read-forward / read-backward / subscribe over a log
//! of versioned streams with commit+prepare positions, grounded on
//! `eventually/src/eventstore.rs`'s `EventStore` trait and
//! `eventually/src/inmemory.rs`'s broadcast-channel subscription model.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::error::{ConflictError, ExpectedRevisionReport};
use crate::model::{Event, Position, StreamId};

/// Optimistic-concurrency expectation for [`EventLogClient::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// Append regardless of the current stream head.
    Any,
    /// Append only if the stream does not exist yet.
    NoStream,
    /// Append only if the stream already exists.
    StreamExists,
    /// Append only if the current head is exactly this revision.
    Exact(u64),
}

/// Result of a successful [`EventLogClient::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub first_revision: u64,
    pub last_revision: u64,
    pub last_position: Position,
}

/// A single event to append, prior to server-assigned revision/position.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub data: Value,
    pub metadata: Value,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, data: Value, metadata: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            metadata,
        }
    }
}

/// Selects which slice of a stream to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Select {
    All,
    From(u64),
}

/// Errors surfaced by an [`EventLogClient`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    #[error("operation cancelled")]
    Cancelled,

    #[error("transient event log error: {0}")]
    Transient(#[source] anyhow::Error),
}

/// Stream of events returned by read/subscribe operations. Each item may
/// fail independently without terminating the stream's caller contract;
/// the stream itself closes on cancellation or exhaustion.
pub type EventStream<'a> = BoxStream<'a, Result<Event, EventLogError>>;

/// C1: an append-only, ordered log of versioned streams.
///
/// Stream-not-found is *not* an error on read -- implementations return an
/// empty sequence instead. Transient network errors are expected to be
/// retried internally with capped exponential backoff; callers only see
/// success or a terminal [`EventLogError`].
#[async_trait]
pub trait EventLogClient: Send + Sync {
    /// Atomically appends `events` to `stream`, honoring `expected`.
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedRevision,
        events: Vec<NewEvent>,
    ) -> Result<AppendResult, EventLogError>;

    /// Reads a stream forward from `from_revision`, in strictly increasing
    /// revision order.
    fn read_forward(&self, stream: &StreamId, from_revision: u64, limit: Option<usize>) -> EventStream<'_>;

    /// Reads a stream backward from its current head, for tail probes.
    fn read_backward(&self, stream: &StreamId, limit: usize) -> EventStream<'_>;

    /// Subscribes to a stream (or category, when `stream` names a prefix
    /// understood by the implementation) from `from_position`, delivering
    /// historical events followed by live ones. The same event may be
    /// redelivered after a reconnect.
    fn subscribe(&self, stream: &StreamId, from_position: Position) -> EventStream<'_>;
}

/// In-memory [`EventLogClient`] reference implementation, used by every
/// other component's unit tests. Grounded on
/// `eventually/src/inmemory.rs`'s `InMemoryEventStore`.
#[derive(Clone)]
pub struct InMemoryEventLog {
    inner: Arc<RwLock<Inner>>,
}

struct Inner {
    /// Global, append-ordered log; index doubles as the commit ordinal.
    global: Vec<(StreamId, Event)>,
    streams: HashMap<StreamId, Vec<usize>>,
    tx: broadcast::Sender<(StreamId, Event)>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryEventLog {
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                global: Vec::new(),
                streams: HashMap::new(),
                tx,
            })),
        }
    }
}

#[async_trait]
impl EventLogClient for InMemoryEventLog {
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedRevision,
        events: Vec<NewEvent>,
    ) -> Result<AppendResult, EventLogError> {
        let mut inner = self.inner.write().await;

        let current_len = inner.streams.get(stream).map(Vec::len).unwrap_or(0) as u64;
        let exists = inner.streams.get(stream).is_some();

        match expected {
            ExpectedRevision::Any => {}
            ExpectedRevision::NoStream if !exists => {}
            ExpectedRevision::StreamExists if exists => {}
            ExpectedRevision::Exact(v) if exists && current_len == v + 1 => {}
            ExpectedRevision::Exact(v) if !exists && v == 0 && current_len == 0 => {}
            other => {
                let expected_report = match other {
                    ExpectedRevision::Any => unreachable!(),
                    ExpectedRevision::NoStream => ExpectedRevisionReport::NoStream,
                    ExpectedRevision::StreamExists => ExpectedRevisionReport::StreamExists,
                    ExpectedRevision::Exact(v) => ExpectedRevisionReport::Exact(v),
                };

                return Err(EventLogError::Conflict(ConflictError {
                    expected: expected_report,
                    actual: current_len,
                }));
            }
        }

        if events.is_empty() {
            return Ok(AppendResult {
                first_revision: current_len,
                last_revision: current_len.saturating_sub(1),
                last_position: Position::new(inner.global.len() as u64, 0),
            });
        }

        let first_revision = current_len;
        let mut indices = Vec::with_capacity(events.len());
        let mut persisted = Vec::with_capacity(events.len());

        for (i, new_event) in events.into_iter().enumerate() {
            let commit = inner.global.len() as u64;
            let event = Event {
                id: Uuid::new_v4(),
                event_type: new_event.event_type,
                data: new_event.data,
                metadata: new_event.metadata,
                stream_revision: first_revision + i as u64,
                global_position: Position::new(commit, 0),
                link_position: None,
                recorded_at: Utc::now(),
            };

            indices.push(inner.global.len());
            persisted.push(event.clone());
            inner.global.push((stream.clone(), event));
        }

        let last_revision = first_revision + persisted.len() as u64 - 1;
        let last_position = persisted.last().unwrap().global_position;

        inner.streams.entry(stream.clone()).or_default().extend(indices);

        for event in persisted {
            // A lagging/absent subscriber is not an error: broadcast just
            // drops the message for that receiver.
            let _ = inner.tx.send((stream.clone(), event));
        }

        Ok(AppendResult {
            first_revision,
            last_revision,
            last_position,
        })
    }

    fn read_forward(&self, stream: &StreamId, from_revision: u64, limit: Option<usize>) -> EventStream<'_> {
        let stream = stream.clone();
        let inner = Arc::clone(&self.inner);

        Box::pin(futures::stream::once(async move {
            let inner = inner.read().await;
            let indices = inner.streams.get(&stream).cloned().unwrap_or_default();

            let events: Vec<Event> = indices
                .into_iter()
                .map(|i| inner.global[i].1.clone())
                .filter(|event| event.stream_revision >= from_revision)
                .take(limit.unwrap_or(usize::MAX))
                .collect();

            futures::stream::iter(events.into_iter().map(Ok))
        })
        .flatten())
    }

    fn read_backward(&self, stream: &StreamId, limit: usize) -> EventStream<'_> {
        let stream = stream.clone();
        let inner = Arc::clone(&self.inner);

        Box::pin(futures::stream::once(async move {
            let inner = inner.read().await;
            let mut indices = inner.streams.get(&stream).cloned().unwrap_or_default();
            indices.reverse();

            let events: Vec<Event> = indices.into_iter().take(limit).map(|i| inner.global[i].1.clone()).collect();

            futures::stream::iter(events.into_iter().map(Ok))
        })
        .flatten())
    }

    fn subscribe(&self, stream: &StreamId, from_position: Position) -> EventStream<'_> {
        if let Some(category) = stream.category_prefix() {
            return self.subscribe_category(category.to_owned(), from_position);
        }

        let stream_filter = stream.clone();
        let inner = Arc::clone(&self.inner);

        Box::pin(futures::stream::once(async move {
            // Snapshot the historical tail and subscribe to live events
            // before releasing the read lock, so nothing appended between
            // the two can be missed. Duplicates across the seam are
            // tolerated per the at-least-once contract.
            let (historical, rx) = {
                let inner = inner.read().await;

                let historical: Vec<Event> = inner
                    .streams
                    .get(&stream_filter)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|i| inner.global[i].1.clone())
                    .filter(|event| event.global_position >= from_position)
                    .collect();

                (historical, inner.tx.subscribe())
            };

            let stream_filter_live = stream_filter.clone();
            let live = BroadcastStream::new(rx).filter_map(move |result| match result {
                Ok((stream_id, event)) if stream_id == stream_filter_live => Some(Ok(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(_)) => None,
            });

            futures::stream::iter(historical.into_iter().map(Ok)).chain(live)
        })
        .flatten())
    }

    /// Subscribes to every stream whose identity falls under `category`
    /// (the prefix before the first `-`), interleaving events from all
    /// matching streams in commit order while preserving per-stream
    /// revision order. Each delivered event carries a category-local
    /// `link_position` ordinal per spec §4.1, separate from its own
    /// `global_position`.
    fn subscribe_category(&self, category: String, from_position: Position) -> EventStream<'_> {
        let inner = Arc::clone(&self.inner);

        Box::pin(futures::stream::once(async move {
            let (historical, rx) = {
                let inner = inner.read().await;

                let historical: Vec<Event> = inner
                    .global
                    .iter()
                    .filter(|(stream_id, _)| stream_id.category() == category)
                    .enumerate()
                    .filter_map(|(ordinal, (_, event))| {
                        let link_position = Position::new(ordinal as u64, 0);
                        if link_position < from_position {
                            return None;
                        }
                        let mut event = event.clone();
                        event.link_position = Some(link_position);
                        Some(event)
                    })
                    .collect();

                (historical, inner.tx.subscribe())
            };

            let next_ordinal = std::sync::Mutex::new(
                historical.last().map(|e| e.link_position.unwrap().commit + 1).unwrap_or(from_position.commit),
            );

            let live = BroadcastStream::new(rx).filter_map(move |result| match result {
                Ok((stream_id, mut event)) if stream_id.category() == category => {
                    let mut ordinal = next_ordinal.lock().unwrap();
                    event.link_position = Some(Position::new(*ordinal, 0));
                    *ordinal += 1;
                    Some(Ok(event))
                }
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(_)) => None,
            });

            futures::stream::iter(historical.into_iter().map(Ok)).chain(live)
        })
        .flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> StreamId {
        StreamId::from("ctx.agg.v1-t1-e1")
    }

    #[tokio::test]
    async fn append_assigns_gap_free_revisions() {
        let log = InMemoryEventLog::default();

        let result = log
            .append(
                &stream(),
                ExpectedRevision::NoStream,
                vec![
                    NewEvent::new("created", serde_json::json!({}), serde_json::json!({})),
                    NewEvent::new("renamed", serde_json::json!({}), serde_json::json!({})),
                ],
            )
            .await
            .unwrap();

        assert_eq!(result.first_revision, 0);
        assert_eq!(result.last_revision, 1);
    }

    #[tokio::test]
    async fn append_rejects_mismatched_expectation() {
        let log = InMemoryEventLog::default();

        log.append(
            &stream(),
            ExpectedRevision::NoStream,
            vec![NewEvent::new("created", serde_json::json!({}), serde_json::json!({}))],
        )
        .await
        .unwrap();

        let err = log
            .append(
                &stream(),
                ExpectedRevision::Exact(5),
                vec![NewEvent::new("renamed", serde_json::json!({}), serde_json::json!({}))],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EventLogError::Conflict(_)));
    }

    #[tokio::test]
    async fn read_forward_on_missing_stream_is_empty_not_error() {
        let log = InMemoryEventLog::default();
        let events: Vec<_> = log.read_forward(&stream(), 0, None).collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn read_forward_returns_events_in_revision_order() {
        let log = InMemoryEventLog::default();

        log.append(
            &stream(),
            ExpectedRevision::Any,
            vec![
                NewEvent::new("a", serde_json::json!(1), serde_json::json!({})),
                NewEvent::new("b", serde_json::json!(2), serde_json::json!({})),
                NewEvent::new("c", serde_json::json!(3), serde_json::json!({})),
            ],
        )
        .await
        .unwrap();

        let events: Vec<Event> = log
            .read_forward(&stream(), 1, None)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stream_revision, 1);
        assert_eq!(events[1].stream_revision, 2);
    }

    #[tokio::test]
    async fn category_subscription_interleaves_streams_preserving_per_stream_order() {
        let log = InMemoryEventLog::default();
        let entity_a = StreamId::from("ctx.agg.v1-t1-a");
        let entity_b = StreamId::from("ctx.agg.v1-t1-b");

        log.append(
            &entity_a,
            ExpectedRevision::Any,
            vec![NewEvent::new("created", serde_json::json!("a0"), serde_json::json!({}))],
        )
        .await
        .unwrap();

        log.append(
            &entity_b,
            ExpectedRevision::Any,
            vec![NewEvent::new("created", serde_json::json!("b0"), serde_json::json!({}))],
        )
        .await
        .unwrap();

        log.append(
            &entity_a,
            ExpectedRevision::Any,
            vec![NewEvent::new("renamed", serde_json::json!("a1"), serde_json::json!({}))],
        )
        .await
        .unwrap();

        let category = StreamId::category_subscription("ctx.agg.v1");
        let events: Vec<Event> = log.subscribe(&category, Position::START).take(3).map(|r| r.unwrap()).collect().await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].data, serde_json::json!("a0"));
        assert_eq!(events[1].data, serde_json::json!("b0"));
        assert_eq!(events[2].data, serde_json::json!("a1"));

        // Link position is a dense ordinal over the category, separate
        // from each event's own global position.
        assert_eq!(events[0].link_position, Some(Position::new(0, 0)));
        assert_eq!(events[1].link_position, Some(Position::new(1, 0)));
        assert_eq!(events[2].link_position, Some(Position::new(2, 0)));

        // Per-stream revision order is preserved within the interleaving.
        assert_eq!(events[0].stream_revision, 0);
        assert_eq!(events[2].stream_revision, 1);
    }

    #[tokio::test]
    async fn category_subscription_ignores_unrelated_categories() {
        let log = InMemoryEventLog::default();
        let in_category = StreamId::from("ctx.agg.v1-t1-a");
        let other_category = StreamId::from("ctx.other.v1-t1-a");

        log.append(
            &in_category,
            ExpectedRevision::Any,
            vec![NewEvent::new("created", serde_json::json!({}), serde_json::json!({}))],
        )
        .await
        .unwrap();

        log.append(
            &other_category,
            ExpectedRevision::Any,
            vec![NewEvent::new("created", serde_json::json!({}), serde_json::json!({}))],
        )
        .await
        .unwrap();

        let category = StreamId::category_subscription("ctx.agg.v1");
        let events: Vec<Event> = log.subscribe(&category, Position::START).take(1).map(|r| r.unwrap()).collect().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].link_position, Some(Position::new(0, 0)));
    }
}
