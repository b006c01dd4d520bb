//! C2 -- Snapshot Store.
//!
//! Persists and retrieves the latest snapshot of an aggregate's state,
//! keyed by stream identity, by appending snapshot events to the paired
//! `snap.<stream>` stream -- the snapshot log is itself append-only, so
//! older snapshots remain around. An optional [`SnapshotCache`] sits in
//! front as an advisory hot path; correctness holds with a cold cache.
//!
//! Grounded on `eventually-redis/src/store.rs`'s cache-in-front-of-log
//! layering.

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;

use crate::eventlog::{EventLogClient, EventLogError, ExpectedRevision, NewEvent};
use crate::model::{Snapshot, StreamId};

/// Advisory cache for the latest snapshot of a stream. A miss or a cache
/// that is entirely unavailable MUST NOT affect correctness.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    async fn get(&self, stream_id: &StreamId) -> Option<Snapshot>;
    async fn put(&self, stream_id: &StreamId, snapshot: &Snapshot);
}

/// Cache implementation that never hits, used when no fast store is
/// configured. Keeps [`SnapshotStore`] correct without a Redis dependency.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

#[async_trait]
impl SnapshotCache for NoCache {
    async fn get(&self, _stream_id: &StreamId) -> Option<Snapshot> {
        None
    }

    async fn put(&self, _stream_id: &StreamId, _snapshot: &Snapshot) {}
}

/// Errors surfaced by the [`SnapshotStore`].
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error("failed to decode snapshot state: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode snapshot state: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Statistics about a stream's snapshot, without loading the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStats {
    pub exists: bool,
    pub version: Option<i64>,
}

/// Result of [`SnapshotStore::load_latest`].
#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub snapshot: Option<Snapshot>,
    pub cache_hit: bool,
}

/// C2: snapshot persistence built on top of any [`EventLogClient`], with an
/// optional [`SnapshotCache`] consulted first.
pub struct SnapshotStore<L, C = NoCache> {
    log: L,
    cache: C,
}

impl<L> SnapshotStore<L, NoCache>
where
    L: EventLogClient,
{
    pub fn new(log: L) -> Self {
        Self { log, cache: NoCache }
    }
}

impl<L, C> SnapshotStore<L, C>
where
    L: EventLogClient,
    C: SnapshotCache,
{
    pub fn with_cache(log: L, cache: C) -> Self {
        Self { log, cache }
    }

    /// Returns the highest-version snapshot durably acknowledged by the
    /// log. Consults the cache first; a cache miss falls back to the most
    /// recent event in the snapshot stream.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "snapshot.load_latest", skip(self), fields(component = "snapshot", stream_id = %stream_id), err)
    )]
    pub async fn load_latest(&self, stream_id: &StreamId) -> Result<LoadedSnapshot, SnapshotError> {
        let snap_stream = stream_id.snapshot_stream();

        if let Some(snapshot) = self.cache.get(&snap_stream).await {
            return Ok(LoadedSnapshot {
                snapshot: Some(snapshot),
                cache_hit: true,
            });
        }

        let mut last: Option<Snapshot> = None;
        let mut events = self.log.read_backward(&snap_stream, 1);

        if let Some(event) = events.try_next().await? {
            let snapshot: Snapshot = serde_json::from_value(event.data).map_err(SnapshotError::Decode)?;
            last = Some(snapshot);
        }

        Ok(LoadedSnapshot {
            snapshot: last,
            cache_hit: false,
        })
    }

    /// Appends a new snapshot event to the paired snapshot stream and
    /// refreshes the hot cache.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "snapshot.save", skip(self, snapshot), fields(component = "snapshot", stream_id = %stream_id), err)
    )]
    pub async fn save(&self, stream_id: &StreamId, snapshot: Snapshot) -> Result<(), SnapshotError> {
        let snap_stream = stream_id.snapshot_stream();
        let data: Value = serde_json::to_value(&snapshot).map_err(SnapshotError::Encode)?;

        self.log
            .append(
                &snap_stream,
                ExpectedRevision::Any,
                vec![NewEvent::new("snapshot-taken", data, serde_json::json!({}))],
            )
            .await?;

        self.cache.put(&snap_stream, &snapshot).await;

        Ok(())
    }

    /// Returns whether a snapshot exists for `stream_id`, and its version
    /// if so, without deserializing the state.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "snapshot.get_stats", skip(self), fields(component = "snapshot", stream_id = %stream_id), err)
    )]
    pub async fn get_stats(&self, stream_id: &StreamId) -> Result<SnapshotStats, SnapshotError> {
        let loaded = self.load_latest(stream_id).await?;

        Ok(match loaded.snapshot {
            Some(snapshot) => SnapshotStats {
                exists: true,
                version: Some(snapshot.version),
            },
            None => SnapshotStats {
                exists: false,
                version: None,
            },
        })
    }

    /// Drains `select` unused; present for API symmetry with `EventLogClient`,
    /// kept private to this module's tests.
    #[cfg(test)]
    async fn snapshot_count(&self, stream_id: &StreamId) -> usize {
        use futures::StreamExt;
        self.log
            .read_forward(&stream_id.snapshot_stream(), 0, None)
            .filter_map(|r| async move { r.ok() })
            .count()
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::eventlog::InMemoryEventLog;

    fn stream() -> StreamId {
        StreamId::from("ctx.agg.v1-t1-e1")
    }

    fn snapshot(version: i64) -> Snapshot {
        Snapshot {
            aggregate: "agg".into(),
            schema: 1,
            tenant: "t1".into(),
            entity_id: "e1".into(),
            state: serde_json::json!({"count": version}),
            version,
            stream_position: version,
            taken_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn load_latest_is_none_when_no_snapshot_taken() {
        let store = SnapshotStore::new(InMemoryEventLog::default());
        let loaded = store.load_latest(&stream()).await.unwrap();
        assert!(loaded.snapshot.is_none());
        assert!(!loaded.cache_hit);
    }

    #[tokio::test]
    async fn save_then_load_latest_returns_highest_version() {
        let store = SnapshotStore::new(InMemoryEventLog::default());

        store.save(&stream(), snapshot(5)).await.unwrap();
        store.save(&stream(), snapshot(10)).await.unwrap();

        let loaded = store.load_latest(&stream()).await.unwrap();
        assert_eq!(loaded.snapshot.unwrap().version, 10);
        assert_eq!(store.snapshot_count(&stream()).await, 2);
    }

    #[tokio::test]
    async fn cold_cache_does_not_affect_correctness() {
        struct AlwaysMiss;

        #[async_trait::async_trait]
        impl SnapshotCache for AlwaysMiss {
            async fn get(&self, _stream_id: &StreamId) -> Option<Snapshot> {
                None
            }
            async fn put(&self, _stream_id: &StreamId, _snapshot: &Snapshot) {}
        }

        let store = SnapshotStore::with_cache(InMemoryEventLog::default(), AlwaysMiss);
        store.save(&stream(), snapshot(3)).await.unwrap();

        let loaded = store.load_latest(&stream()).await.unwrap();
        assert_eq!(loaded.snapshot.unwrap().version, 3);
        assert!(!loaded.cache_hit);
    }
}
