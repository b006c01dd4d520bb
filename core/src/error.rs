//! Error taxonomy shared across the core.
//!
//! The kinds below mirror the seven-kind taxonomy: they are a
//! classification of failure modes, not a single flat error type --
//! each component defines its own error enum and wraps it into
//! [`CoreError`] via `#[from]`, following the layering used throughout
//! `eventually-postgres`'s `Error` type.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use uuid::Uuid;

use crate::eventlog::EventLogError;
use crate::model::StreamId;

/// Conflict reported by [`crate::eventlog::EventLogClient::append`] when the
/// stream head does not match the expected revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("version conflict: expected {expected:?}, actual head is {actual}")]
pub struct ConflictError {
    pub expected: ExpectedRevisionReport,
    pub actual: u64,
}

/// Debug-friendly rendering of the expectation that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedRevisionReport {
    NoStream,
    StreamExists,
    Exact(u64),
}

/// Details carried by a [`CoreError::RebuildFailed`].
#[derive(Debug, Clone)]
pub struct RebuildFailure {
    pub stream_id: StreamId,
    pub context: String,
    pub aggregate: String,
    pub entity_id: String,
    pub failing_event_id: Uuid,
    pub cause: String,
}

impl fmt::Display for RebuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rebuild of {} ({}/{}, entity {}) failed at event {}: {}",
            self.stream_id, self.context, self.aggregate, self.entity_id, self.failing_event_id, self.cause
        )
    }
}

/// The error taxonomy for the whole core, per spec §7.
///
/// Propagation policy: [`CoreError::Cancelled`] and
/// [`CoreError::TransientIo`] are expected to be absorbed internally
/// (retried, or surfaced only after exhaustion); [`CoreError::VersionConflict`]
/// and [`CoreError::RebuildFailed`] are domain errors that propagate to the
/// caller; [`CoreError::ConfigInvalid`] is fatal to startup.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Log append rejected due to an unexpected stream head. Recoverable
    /// by reloading the aggregate and retrying the command one layer up;
    /// must never crash the core.
    #[error("version conflict on stream {stream_id}: {source}")]
    VersionConflict {
        stream_id: StreamId,
        #[source]
        source: ConflictError,
    },

    /// The reducer threw while replaying a stream. Fatal to the current
    /// load; the stream is now suspect.
    #[error("rebuild failed: {0}")]
    RebuildFailed(RebuildFailure),

    /// Caller-signaled abort. Not logged as an error; resources are
    /// released cleanly.
    #[error("operation cancelled")]
    Cancelled,

    /// Transport error, timeout, or other transient backend fault,
    /// surfaced only after the internal retry budget is exhausted.
    #[error("transient I/O error: {0}")]
    TransientIo(#[source] anyhow::Error),

    /// A projection handler raised inside the batch transaction. The
    /// whole batch rolls back and is retried after backoff.
    #[error("projection handler failed for subscription {subscription_id}: {source}")]
    HandlerFailed {
        subscription_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// An outbox record exceeded its retry budget and was marked dead.
    #[error("outbox record {id} exceeded max attempts and was dead-lettered")]
    DeadLetter { id: i64 },

    /// Invalid configuration, surfaced only at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Deadline for a single operation was exceeded after exhausting the
    /// bounded retry window.
    #[error("operation timed out after exhausting retry budget")]
    OperationTimeout,
}

impl CoreError {
    pub fn rebuild_failed(
        stream_id: StreamId,
        context: impl Into<String>,
        aggregate: impl Into<String>,
        entity_id: impl Into<String>,
        failing_event_id: Uuid,
        cause: impl fmt::Display,
    ) -> Self {
        Self::RebuildFailed(RebuildFailure {
            stream_id,
            context: context.into(),
            aggregate: aggregate.into(),
            entity_id: entity_id.into(),
            failing_event_id,
            cause: cause.to_string(),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, CoreError::VersionConflict { .. })
    }
}

/// Maps an [`EventLogError`] surfaced for `stream_id` onto the core
/// taxonomy, preserving conflicts and cancellation instead of collapsing
/// everything into [`CoreError::TransientIo`].
pub fn from_event_log_error(err: EventLogError, stream_id: &StreamId) -> CoreError {
    match err {
        EventLogError::Conflict(source) => CoreError::VersionConflict {
            stream_id: stream_id.clone(),
            source,
        },
        EventLogError::Cancelled => CoreError::Cancelled,
        other => CoreError::TransientIo(other.into()),
    }
}

/// Bounds a single I/O-crossing operation, surfacing
/// [`CoreError::OperationTimeout`] when `duration` elapses before `op`
/// resolves. `op`'s own error is otherwise wrapped as
/// [`CoreError::TransientIo`].
pub async fn with_timeout<T, E>(duration: Duration, op: impl Future<Output = Result<T, E>>) -> Result<T, CoreError>
where
    E: Into<anyhow::Error>,
{
    match tokio::time::timeout(duration, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(CoreError::TransientIo(source.into())),
        Err(_) => Err(CoreError::OperationTimeout),
    }
}
