//! Event-sourced aggregate and projection core.
//!
//! This crate holds the traits, plain data model, and in-memory
//! reference implementations for every component in the system: the
//! event log client (C1), snapshot store (C2), checkpoint store (C3),
//! aggregate repository (C4), projection runner/writer (C5/C6), outbox
//! repository/publisher (C7/C8), and queue facade (C9). Backend
//! implementations live in sibling crates (`esrc-postgres`,
//! `esrc-redis`); this crate never dials out to a network.

pub mod aggregate;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod error;
pub mod eventlog;
pub mod model;
pub mod outbox;
pub mod projection;
pub mod queue;

#[cfg(feature = "tracing")]
pub mod telemetry;

pub use aggregate::{AggregateIdentity, AggregateRepository, LoadOptions, Loaded, Reducer, SnapshotThresholds};
pub use checkpoint::{CheckpointError, CheckpointStore, InMemoryCheckpointStore};
pub use codec::{EventCodec, JsonCodec};
pub use config::CoreConfig;
pub use error::{CoreError, RebuildFailure};
pub use eventlog::{EventLogClient, EventLogError, EventStream, ExpectedRevision, InMemoryEventLog, NewEvent};
pub use model::{Event, OutboxRecord, OutboxStatus, Position, QueueMessage, Snapshot, StreamId};
pub use outbox::{InMemoryOutboxRepository, NewOutboxRecord, OutboxError, OutboxPublisher, OutboxRepository};
pub use projection::{ApplyOutcome, BatchConfig, HandlerRegistry, ProjectionRunner, ProjectionWriter, RetryConfig, RunnerState};
pub use queue::{FacadeConfig, InMemoryQueue, QueueError, QueueFacade, QueueRegistration};
