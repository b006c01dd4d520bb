//! C4 -- Aggregate Repository.
//!
//! Rehydrates an aggregate by composing a snapshot with forward replay,
//! and decides when to take a new snapshot. Grounded on
//! `eventually/src/aggregate.rs`'s `Aggregate::apply`/`AggregateExt::fold`
//! pure-reducer contract, generalized from an in-process trait object to
//! an explicit snapshot + event-log composition per spec §4.4.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{self, CoreError};
use crate::eventlog::EventLogClient;
use crate::model::{Position, Snapshot, StreamId};
use crate::snapshot::{SnapshotCache, SnapshotStore};

/// Default ceiling on a single snapshot-store or head-lookup round trip.
/// Both route through the event log, so this matches spec §5's "log op"
/// default of 30s.
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// A pure, deterministic state-folding reducer.
///
/// `initial` and `apply` MUST NOT perform I/O: same event sequence always
/// produces the same state transition. `State` is required to round-trip
/// through JSON so the repository can serialize/deserialize it for
/// snapshotting without the reducer having to know about snapshots.
pub trait Reducer {
    type State: Clone + Serialize + DeserializeOwned;

    fn initial(&self) -> Self::State;
    fn apply(&self, state: Self::State, event: &crate::model::Event) -> Result<Self::State, anyhow::Error>;
}

/// Result of [`AggregateRepository::load`].
#[derive(Debug, Clone)]
pub struct Loaded<S> {
    pub state: S,
    pub version: i64,
}

/// Thresholds controlling [`AggregateRepository::should_take_snapshot`].
#[derive(Debug, Clone, Copy)]
pub struct SnapshotThresholds {
    pub event_count: u64,
    pub time: std::time::Duration,
}

impl Default for SnapshotThresholds {
    fn default() -> Self {
        Self {
            event_count: 200,
            time: std::time::Duration::from_secs(5 * 60),
        }
    }
}

/// Statistics about a stream/aggregate pair, computed without a full
/// replay.
#[derive(Debug, Clone, Copy)]
pub struct AggregateStats {
    pub stream_exists: bool,

    /// Per-stream revision of the head event. Distinct from
    /// `stream_position`: spec §9 forbids conflating the two, since one is
    /// a per-stream ordinal and the other a global commit/prepare pair.
    pub version: Option<u64>,

    /// Global log position of the head event.
    pub stream_position: Option<Position>,

    pub snapshot_exists: bool,
    pub snapshot_version: Option<i64>,
    pub events_since_snapshot: u64,
}

/// Identity of an aggregate instance being loaded, mirroring spec §3's
/// stream-name composition.
#[derive(Debug, Clone)]
pub struct AggregateIdentity<'a> {
    pub context: &'a str,
    pub aggregate: &'a str,
    pub schema: u32,
    pub tenant: &'a str,
    pub entity_id: &'a str,
}

impl<'a> AggregateIdentity<'a> {
    pub fn stream_id(&self) -> StreamId {
        StreamId::for_aggregate(self.context, self.aggregate, self.schema, self.tenant, self.entity_id)
    }
}

/// Options threading cancellation through [`AggregateRepository::load`].
#[derive(Default)]
pub struct LoadOptions {
    pub cancel: CancellationToken,
}

/// C4: composes a [`SnapshotStore`] with forward replay over an
/// [`EventLogClient`] to rehydrate aggregates.
pub struct AggregateRepository<L, C = crate::snapshot::NoCache> {
    log: L,
    snapshots: SnapshotStore<L, C>,
    operation_timeout: Duration,
}

impl<L> AggregateRepository<L, crate::snapshot::NoCache>
where
    L: EventLogClient + Clone,
{
    pub fn new(log: L) -> Self {
        let snapshots = SnapshotStore::new(log.clone());
        Self {
            log,
            snapshots,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl<L, C> AggregateRepository<L, C>
where
    L: EventLogClient + Clone,
    C: SnapshotCache,
{
    pub fn with_snapshot_cache(log: L, cache: C) -> Self {
        let snapshots = SnapshotStore::with_cache(log.clone(), cache);
        Self {
            log,
            snapshots,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Rehydrates the aggregate identified by `identity` using `reducer`,
    /// consulting the latest snapshot first and replaying only the events
    /// recorded after it.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            name = "aggregate.load",
            skip(self, identity, reducer, opts),
            fields(component = "aggregate", context = %identity.context, aggregate = %identity.aggregate, entity_id = %identity.entity_id),
            err
        )
    )]
    pub async fn load<R>(&self, identity: &AggregateIdentity<'_>, reducer: &R, opts: LoadOptions) -> Result<Loaded<R::State>, CoreError>
    where
        R: Reducer,
    {
        let stream_id = identity.stream_id();

        let loaded_snapshot = error::with_timeout(self.operation_timeout, self.snapshots.load_latest(&stream_id)).await?;

        let (mut state, mut version, from_revision) = match &loaded_snapshot.snapshot {
            Some(snapshot) => {
                let state: R::State = serde_json::from_value(snapshot.state.clone()).map_err(|e| CoreError::TransientIo(e.into()))?;
                (state, snapshot.version, (snapshot.version + 1).max(0) as u64)
            }
            None => (reducer.initial(), -1, 0),
        };

        let mut stream = self.log.read_forward(&stream_id, from_revision, None);

        while let Some(next) = stream.next().await {
            if opts.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let event = next.map_err(|source| error::from_event_log_error(source, &stream_id))?;

            state = reducer.apply(state, &event).map_err(|cause| {
                CoreError::rebuild_failed(
                    stream_id.clone(),
                    identity.context,
                    identity.aggregate,
                    identity.entity_id,
                    event.id,
                    cause,
                )
            })?;

            version += 1;
        }

        Ok(Loaded { state, version })
    }

    /// Persists a new snapshot for the aggregate at `version`/`stream_position`.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            name = "aggregate.save_snapshot",
            skip(self, identity, state),
            fields(component = "aggregate", context = %identity.context, aggregate = %identity.aggregate, entity_id = %identity.entity_id, version = version),
            err
        )
    )]
    pub async fn save_snapshot<R>(&self, identity: &AggregateIdentity<'_>, state: &R::State, version: i64, stream_position: i64) -> Result<(), CoreError>
    where
        R: Reducer,
    {
        let stream_id = identity.stream_id();

        let snapshot = Snapshot {
            aggregate: identity.aggregate.to_owned(),
            schema: identity.schema,
            tenant: identity.tenant.to_owned(),
            entity_id: identity.entity_id.to_owned(),
            state: serde_json::to_value(state).map_err(|e| CoreError::TransientIo(e.into()))?,
            version,
            stream_position,
            taken_at: Utc::now(),
        };

        error::with_timeout(self.operation_timeout, self.snapshots.save(&stream_id, snapshot)).await
    }

    /// Decides whether a new snapshot should be taken, per spec §4.4.
    pub fn should_take_snapshot(events_processed: u64, last_snapshot_taken_at: Option<DateTime<Utc>>, thresholds: SnapshotThresholds) -> bool {
        if events_processed >= thresholds.event_count {
            return true;
        }

        match last_snapshot_taken_at {
            Some(taken_at) => {
                let elapsed = Utc::now().signed_duration_since(taken_at);
                elapsed.to_std().map(|d| d >= thresholds.time).unwrap_or(true)
            }
            None => false,
        }
    }

    /// Computes stats without a full replay: a single backward read of
    /// limit 1 finds the head revision, plus a snapshot stat lookup.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            name = "aggregate.get_stats",
            skip(self, identity),
            fields(component = "aggregate", context = %identity.context, aggregate = %identity.aggregate, entity_id = %identity.entity_id),
            err
        )
    )]
    pub async fn get_stats(&self, identity: &AggregateIdentity<'_>) -> Result<AggregateStats, CoreError> {
        let stream_id = identity.stream_id();

        let head = error::with_timeout(self.operation_timeout, async { self.log.read_backward(&stream_id, 1).next().await.transpose() }).await?;

        let snapshot_stats = error::with_timeout(self.operation_timeout, self.snapshots.get_stats(&stream_id)).await?;

        let stream_exists = head.is_some();
        let version = head.as_ref().map(|e| e.stream_revision);
        let stream_position = head.as_ref().map(|e| e.global_position);

        let events_since_snapshot = match (snapshot_stats.version, version) {
            (Some(snapshot_version), Some(head_version)) => (head_version as i64 - snapshot_version).max(0) as u64,
            (None, Some(head_version)) => head_version + 1,
            _ => 0,
        };

        Ok(AggregateStats {
            stream_exists,
            version,
            stream_position,
            snapshot_exists: snapshot_stats.exists,
            snapshot_version: snapshot_stats.version,
            events_since_snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::eventlog::{EventLogClient, ExpectedRevision, NewEvent};
    use crate::snapshot::NoCache;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct CounterState {
        count: i64,
        name: Option<String>,
    }

    struct CounterReducer;

    impl Reducer for CounterReducer {
        type State = CounterState;

        fn initial(&self) -> Self::State {
            CounterState::default()
        }

        fn apply(&self, mut state: Self::State, event: &crate::model::Event) -> Result<Self::State, anyhow::Error> {
            match event.event_type.as_str() {
                "increment" => {
                    let amount = event.data.get("amount").and_then(|v| v.as_i64()).unwrap_or(0);
                    state.count += amount;
                }
                "rename" => {
                    state.name = event.data.get("name").and_then(|v| v.as_str()).map(str::to_owned);
                }
                _ => {}
            }

            Ok(state)
        }
    }

    fn identity() -> AggregateIdentity<'static> {
        AggregateIdentity {
            context: "ctx",
            aggregate: "agg",
            schema: 1,
            tenant: "t1",
            entity_id: "e1",
        }
    }

    #[tokio::test]
    async fn load_empty_stream_returns_initial_state_at_version_minus_one() {
        let repo: AggregateRepository<_, NoCache> = AggregateRepository::new(crate::eventlog::InMemoryEventLog::default());

        let loaded = repo.load(&identity(), &CounterReducer, LoadOptions::default()).await.unwrap();

        assert_eq!(loaded.version, -1);
        assert_eq!(loaded.state, CounterState::default());
    }

    #[tokio::test]
    async fn snapshot_plus_replay_resumes_after_snapshot_version() {
        let log = crate::eventlog::InMemoryEventLog::default();
        let repo: AggregateRepository<_, NoCache> = AggregateRepository::new(log.clone());
        let stream_id = identity().stream_id();

        // Seed 6 prior events (revisions 0..=5) so the stream head lines up
        // with a snapshot taken at version 5.
        let mut seed = Vec::new();
        for _ in 0..6 {
            seed.push(NewEvent::new("increment", serde_json::json!({"amount": 1}), serde_json::json!({})));
        }
        log.append(&stream_id, ExpectedRevision::Any, seed).await.unwrap();

        repo.save_snapshot::<CounterReducer>(&identity(), &CounterState { count: 10, name: None }, 5, 5)
            .await
            .unwrap();

        log.append(
            &stream_id,
            ExpectedRevision::Any,
            vec![
                NewEvent::new("increment", serde_json::json!({"amount": 5}), serde_json::json!({})),
                NewEvent::new("rename", serde_json::json!({"name": "u"}), serde_json::json!({})),
            ],
        )
        .await
        .unwrap();

        let loaded = repo.load(&identity(), &CounterReducer, LoadOptions::default()).await.unwrap();

        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.state.count, 15);
        assert_eq!(loaded.state.name.as_deref(), Some("u"));
    }

    #[tokio::test]
    async fn rebuild_failure_surfaces_failing_event_id() {
        struct ThrowingReducer;

        impl Reducer for ThrowingReducer {
            type State = CounterState;

            fn initial(&self) -> Self::State {
                CounterState::default()
            }

            fn apply(&self, _state: Self::State, _event: &crate::model::Event) -> Result<Self::State, anyhow::Error> {
                Err(anyhow::anyhow!("boom"))
            }
        }

        let log = crate::eventlog::InMemoryEventLog::default();
        let repo: AggregateRepository<_, NoCache> = AggregateRepository::new(log.clone());
        let stream_id = identity().stream_id();

        log.append(
            &stream_id,
            ExpectedRevision::Any,
            vec![NewEvent::new("increment", serde_json::json!({"amount": 1}), serde_json::json!({}))],
        )
        .await
        .unwrap();

        let err = repo.load(&identity(), &ThrowingReducer, LoadOptions::default()).await.unwrap_err();

        match err {
            CoreError::RebuildFailed(failure) => {
                assert_eq!(failure.stream_id, stream_id);
            }
            other => panic!("expected RebuildFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn should_take_snapshot_respects_event_count_and_time_thresholds() {
        let thresholds = SnapshotThresholds {
            event_count: 200,
            time: std::time::Duration::from_secs(300),
        };

        assert!(AggregateRepository::<crate::eventlog::InMemoryEventLog>::should_take_snapshot(200, None, thresholds));
        assert!(!AggregateRepository::<crate::eventlog::InMemoryEventLog>::should_take_snapshot(10, None, thresholds));
        assert!(AggregateRepository::<crate::eventlog::InMemoryEventLog>::should_take_snapshot(
            10,
            Some(Utc::now() - chrono::Duration::seconds(301)),
            thresholds
        ));
    }
}
