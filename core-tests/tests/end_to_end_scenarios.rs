//! End-to-end scenarios against the in-memory reference implementations,
//! tracing the literal inputs/outputs from the testable-properties list.
//! Grounded on `eventually-postgres/tests/event_store.rs`'s
//! connect-then-assert shape, generalized from a live Postgres fixture to
//! the in-memory refs so these run without external services.

use chrono::Utc;
use esrc_core::aggregate::{AggregateIdentity, AggregateRepository, LoadOptions, Reducer};
use esrc_core::eventlog::{ExpectedRevision, InMemoryEventLog, NewEvent};
use esrc_core::model::{Event, Snapshot, StreamId};
use esrc_core::snapshot::SnapshotStore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct CounterState {
    count: i64,
    name: Option<String>,
}

struct CounterReducer;

impl Reducer for CounterReducer {
    type State = CounterState;

    fn initial(&self) -> Self::State {
        CounterState { count: 0, name: None }
    }

    fn apply(&self, mut state: Self::State, event: &Event) -> Result<Self::State, anyhow::Error> {
        match event.event_type.as_str() {
            "increment" => {
                let amount = event.data["amount"].as_i64().unwrap_or(0);
                state.count += amount;
            }
            "rename" => {
                state.name = event.data["name"].as_str().map(str::to_owned);
            }
            other => anyhow::bail!("unknown event type {other}"),
        }
        Ok(state)
    }
}

fn identity<'a>() -> AggregateIdentity<'a> {
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
    let log = InMemoryEventLog::default();
    let repo = AggregateRepository::new(log);

    let loaded = repo.load(&identity(), &CounterReducer, LoadOptions::default()).await.unwrap();

    assert_eq!(loaded.version, -1);
    assert_eq!(loaded.state, CounterState { count: 0, name: None });
}

#[tokio::test]
async fn snapshot_plus_replay_composes_to_the_expected_state_and_version() {
    let log = InMemoryEventLog::default();
    let repo = AggregateRepository::new(log.clone());
    let stream_id = identity().stream_id();

    let snapshots = SnapshotStore::new(log.clone());
    snapshots
        .save(
            &stream_id,
            Snapshot {
                aggregate: "agg".into(),
                schema: 1,
                tenant: "t1".into(),
                entity_id: "e1".into(),
                state: serde_json::json!({"count": 10, "name": null}),
                version: 5,
                stream_position: 5,
                taken_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    log.append(
        &stream_id,
        ExpectedRevision::Exact(5),
        vec![
            NewEvent::new("increment", serde_json::json!({"amount": 5}), serde_json::json!({})),
            NewEvent::new("rename", serde_json::json!({"name": "u"}), serde_json::json!({})),
        ],
    )
    .await
    .unwrap();

    let loaded = repo.load(&identity(), &CounterReducer, LoadOptions::default()).await.unwrap();

    assert_eq!(
        loaded.state,
        CounterState {
            count: 15,
            name: Some("u".to_owned())
        }
    );
    assert_eq!(loaded.version, 7);
}

#[tokio::test]
async fn cas_reject_leaves_the_stored_checkpoint_unchanged() {
    use esrc_core::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use esrc_core::model::Position;

    let store = InMemoryCheckpointStore::new();
    let key = "subscription-x";

    store.set(key, Position::new(6000, 6001), None).await.unwrap();

    let accepted = store.set_if_newer(key, Position::new(4000, 4001), None).await.unwrap();

    assert!(!accepted);
    assert_eq!(store.get(key).await.unwrap(), Some(Position::new(6000, 6001)));
}

#[tokio::test]
async fn rebuild_failure_surfaces_the_stream_and_failing_event_id() {
    let log = InMemoryEventLog::default();
    let repo = AggregateRepository::new(log.clone());
    let stream_id = identity().stream_id();

    let appended = log
        .append(
            &stream_id,
            ExpectedRevision::NoStream,
            vec![NewEvent::new("not-a-known-type", serde_json::json!({}), serde_json::json!({}))],
        )
        .await
        .unwrap();

    assert_eq!(appended.first_revision, 0);

    let err = repo.load(&identity(), &CounterReducer, LoadOptions::default()).await.unwrap_err();

    let esrc_core::error::CoreError::RebuildFailed(failure) = err else {
        panic!("expected a rebuild-failed error, got {err:?}");
    };

    assert_eq!(failure.stream_id, stream_id);
    assert_eq!(failure.context, "ctx");
    assert_eq!(failure.aggregate, "agg");
    assert_eq!(failure.entity_id, "e1");
}

#[tokio::test]
async fn stream_ids_compose_the_spec_naming_scheme() {
    let stream_id = StreamId::for_aggregate("ctx", "agg", 1, "t1", "e1");
    assert_eq!(stream_id.as_str(), "ctx.agg.v1-t1-e1");
    assert_eq!(stream_id.snapshot_stream().as_str(), "snap.ctx.agg.v1-t1-e1");
}
