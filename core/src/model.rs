//! Plain data types shared by every component of the core.
//!
//! These are the structures named in the data model: streams, positions,
//! events, snapshots, checkpoints, processed-event records and outbox
//! records. None of them carry behavior beyond small accessors and
//! constructors -- the behavior lives in the component modules that
//! operate on them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a stream in the event log.
///
/// Built as `<context>.<aggregate>.v<schema>-<tenant>-<entityId>`. Only
/// [`crate::aggregate::AggregateRepository`] constructs these; every other
/// component treats a `StreamId` as an opaque key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Builds the stream identity for an aggregate instance.
    pub fn for_aggregate(context: &str, aggregate: &str, schema: u32, tenant: &str, entity_id: &str) -> Self {
        Self(format!("{context}.{aggregate}.v{schema}-{tenant}-{entity_id}"))
    }

    /// Returns the paired snapshot stream identity, `snap.<stream>`.
    pub fn snapshot_stream(&self) -> Self {
        Self(format!("snap.{}", self.0))
    }

    /// The category portion of the identity -- `<context>.<aggregate>.v<schema>`,
    /// i.e. everything before the first `-`.
    pub fn category(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }

    /// Builds a category-subscription identifier, `$ce-<category>`, per the
    /// `$ce-<prefix>` convention in spec §4.1.
    pub fn category_subscription(category: &str) -> Self {
        Self(format!("$ce-{category}"))
    }

    /// If this identity names a category subscription, returns the
    /// category it subscribes to.
    pub fn category_prefix(&self) -> Option<&str> {
        self.0.strip_prefix("$ce-")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Global, two-part ordinal carried by every event: `commit` orders
/// causally, `prepare` disambiguates ties within the same commit.
///
/// Both fields are unsigned 64-bit integers. Wire (de)serialization of
/// `Position` MUST go through decimal strings to preserve precision
/// regardless of the host numeric type -- see [`Position::serialize`] and
/// [`Position::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    pub commit: u64,
    pub prepare: u64,
}

impl Position {
    pub const START: Position = Position { commit: 0, prepare: 0 };

    pub fn new(commit: u64, prepare: u64) -> Self {
        Self { commit, prepare }
    }

    /// Parses a `(commit, prepare)` pair from their decimal string wire
    /// representation.
    pub fn parse(commit: &str, prepare: &str) -> Result<Self, std::num::ParseIntError> {
        Ok(Self {
            commit: commit.parse()?,
            prepare: prepare.parse()?,
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.commit, self.prepare)
    }
}

impl Serialize for Position {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Wire<'a> {
            commit: &'a str,
            prepare: &'a str,
        }

        Wire {
            commit: &self.commit.to_string(),
            prepare: &self.prepare.to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wire {
            commit: String,
            prepare: String,
        }

        let wire = Wire::deserialize(deserializer)?;
        Position::parse(&wire.commit, &wire.prepare).map_err(serde::de::Error::custom)
    }
}

/// An event as read back from the log: a resolved payload plus the
/// ordinals assigned by the store at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique opaque token assigned per append; stable across redelivery.
    pub id: Uuid,

    /// Stable event type name, used for projection routing.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Opaque payload blob; codec is a concern of the handler/reducer.
    pub data: serde_json::Value,

    /// Opaque metadata blob (tenant, correlation id, causation id, ...).
    pub metadata: serde_json::Value,

    /// Per-stream, gap-free, zero-based revision.
    pub stream_revision: u64,

    /// Global position of the event in the log (or in its category).
    pub global_position: Position,

    /// Category ordinal, set only when this event was resolved through a
    /// `$ce-<prefix>` category subscription -- the position of the *link*,
    /// distinct from `global_position` (the position of the original,
    /// resolved event in its own stream).
    pub link_position: Option<Position>,

    pub recorded_at: DateTime<Utc>,
}

impl Event {
    /// Reads a well-known metadata string field, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn tenant(&self) -> Option<&str> {
        self.metadata_str("tenant")
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata_str("correlationId")
    }
}

/// A persisted snapshot of an aggregate's folded state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate: String,
    pub schema: u32,
    pub tenant: String,
    pub entity_id: String,

    /// Opaque, reducer-defined serialized state.
    pub state: serde_json::Value,

    /// Domain event index after which this snapshot was taken.
    /// `-1` means no events had been applied yet.
    pub version: i64,

    /// Log revision covered by this snapshot; replay resumes at
    /// `stream_position + 1`.
    pub stream_position: i64,

    pub taken_at: DateTime<Utc>,
}

/// A durable position marker for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub commit: u64,
    pub prepare: u64,
}

impl Checkpoint {
    pub fn position(&self) -> Position {
        Position::new(self.commit, self.prepare)
    }

    pub fn from_position(position: Position) -> Self {
        Self {
            commit: position.commit,
            prepare: position.prepare,
        }
    }
}

/// Primary key of the per-subscription at-most-once application record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessedEventKey {
    pub subscription_id: String,
    pub event_id: Uuid,
}

/// Lifecycle of a single outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Inflight,
    Done,
    Dead,
}

/// A durable record of an event pending publication to a downstream queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: i64,
    pub stream_id: StreamId,
    pub stream_revision: u64,

    /// Event `type` of the originating domain event, carried through so
    /// publication can set the `event-type` header without a join back
    /// to the event log.
    pub event_type: String,

    pub tenant: String,
    pub correlation_id: String,

    pub queue_name: String,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: OutboxStatus,
}

/// A message handed to the [`crate::queue::QueueFacade`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Used for downstream partitioning, usually the aggregate id.
    pub key: String,
    pub value: Vec<u8>,
    pub headers: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_roundtrips_through_decimal_strings() {
        let position = Position::new(u64::MAX, 42);
        let value = serde_json::to_value(position).unwrap();

        assert_eq!(value["commit"], serde_json::json!(u64::MAX.to_string()));
        assert_eq!(value["prepare"], serde_json::json!("42"));

        let parsed: Position = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, position);
    }

    #[test]
    fn stream_id_builds_snapshot_stream() {
        let stream = StreamId::for_aggregate("orders", "order", 1, "acme", "order-1");
        assert_eq!(stream.as_str(), "orders.order.v1-acme-order-1");
        assert_eq!(stream.snapshot_stream().as_str(), "snap.orders.order.v1-acme-order-1");
    }
}
