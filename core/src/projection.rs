//! C5/C6 -- Projection Runner and Projection Writer.
//!
//! The runner drives a subscription through catch-up and live phases,
//! batches events, and hands each batch to a [`ProjectionWriter`] that
//! applies it atomically alongside checkpoint advancement. Grounded on
//! `eventually/src/subscription.rs`'s `Subscription`/`Transient`
//! catch-up-then-live composition, generalized into the explicit state
//! machine spec §4.5 describes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::error::{self, CoreError};
use crate::eventlog::EventLogClient;
use crate::model::{Event, Position, StreamId};

/// Default ceiling on a single checkpoint-store round trip, per spec §5's
/// "checkpoint op" default.
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// The runner's externally-observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    CatchingUp,
    Live,
    Paused,
    Stopped,
}

/// Batching thresholds for the projection runner.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max: usize,
    pub linger: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max: 128,
            linger: Duration::from_millis(50),
        }
    }
}

/// Backoff curve applied on source or handler error.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with jitter, capped at `max`, for the given
    /// zero-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max);
        let jitter_ms = rand::random::<u64>() % (self.jitter.as_millis() as u64 + 1);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Outcome of handing a batch to the [`ProjectionWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped,
}

/// C6: applies a batch of events to SQL read models transactionally, with
/// per-event idempotency and checkpoint advancement in the same
/// transaction.
///
/// Implementations MUST: (1) insert `(subscription_id, event.id)` into the
/// processed-event table with `ON CONFLICT DO NOTHING`; (2) check whether
/// the insert actually happened, skipping the handler body when it did
/// not (spec §9's resolved open question); (3) upsert the checkpoint to
/// `commit_position` in the same transaction; (4) commit atomically, or
/// roll back the whole batch on any handler failure.
#[async_trait]
pub trait ProjectionWriter: Send + Sync {
    async fn apply_batch(&self, subscription_id: &str, events: &[Event], commit_position: Position) -> Result<Vec<ApplyOutcome>, CoreError>;
}

/// A handler registered for one event `type`. Side effects must be SQL
/// upserts/deletes performed by the [`ProjectionWriter`]'s own
/// transaction; handlers themselves MUST NOT call external services.
pub type HandlerFn = Arc<dyn Fn(&Event) -> Result<(), anyhow::Error> + Send + Sync>;

/// Registry mapping event `type` to handler. An unregistered type is
/// logged and silently skipped (forward compatibility), never treated as
/// an error.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, event_type: impl Into<String>, handler: HandlerFn) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    pub fn get(&self, event_type: &str) -> Option<&HandlerFn> {
        self.handlers.get(event_type)
    }
}

/// C5: drives a subscription through catch-up and live phases, batching
/// events for atomic application via a [`ProjectionWriter`].
pub struct ProjectionRunner<L, W> {
    log: L,
    writer: Arc<W>,
    fast_checkpoints: Option<Arc<dyn CheckpointStore>>,
    subscription_id: String,
    stream: StreamId,
    batching: BatchConfig,
    retry: RetryConfig,
    state: watch::Sender<RunnerState>,
    cancel: CancellationToken,
    resume: Arc<Notify>,
    operation_timeout: Duration,
}

/// Why [`ProjectionRunner::run_once`] returned control to the outer loop.
enum RunOnceExit {
    /// The source stream closed (in-memory test log reached its end);
    /// catch-up is complete and there is nothing left to subscribe to.
    SourceClosed,
    /// Paused, either by an explicit [`ProjectionRunner::pause`] call or
    /// automatically after exhausting handler-failure retries.
    Paused,
}

impl<L, W> ProjectionRunner<L, W>
where
    L: EventLogClient + Clone + 'static,
    W: ProjectionWriter + 'static,
{
    pub fn new(log: L, writer: Arc<W>, subscription_id: impl Into<String>, stream: StreamId) -> Self {
        let (state, _) = watch::channel(RunnerState::Idle);

        Self {
            log,
            writer,
            fast_checkpoints: None,
            subscription_id: subscription_id.into(),
            stream,
            batching: BatchConfig::default(),
            retry: RetryConfig::default(),
            state,
            cancel: CancellationToken::new(),
            resume: Arc::new(Notify::new()),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_fast_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.fast_checkpoints = Some(store);
        self
    }

    pub fn with_batch_config(mut self, batching: BatchConfig) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    /// Requests a cooperative stop: cancels the current source read,
    /// drains the inflight batch, and does not advance the checkpoint for
    /// any undelivered events.
    pub fn stop(&self) {
        self.cancel.cancel();
        let _ = self.state.send(RunnerState::Stopped);
        self.resume.notify_waiters();
    }

    /// Requests a pause: the run loop finishes flushing its current
    /// batch, then blocks until [`ProjectionRunner::resume`] is called.
    /// A no-op when the runner is not currently live or catching up, per
    /// spec §4.5's transition table.
    pub fn pause(&self) {
        if matches!(self.state(), RunnerState::Live | RunnerState::CatchingUp) {
            let _ = self.state.send(RunnerState::Paused);
        }
    }

    /// Resumes a paused runner, re-entering catch-up from the last
    /// durably committed checkpoint. A no-op when the runner is not
    /// currently paused.
    pub fn resume(&self) {
        if self.state() == RunnerState::Paused {
            let _ = self.state.send(RunnerState::CatchingUp);
            self.resume.notify_waiters();
        }
    }

    /// Fetches the durable checkpoint, bounded by `operation_timeout`,
    /// defaulting to the start of the log when none is recorded yet.
    async fn checkpoint_position(&self, sql_checkpoints: &dyn CheckpointStore) -> Result<Position, CoreError> {
        Ok(error::with_timeout(self.operation_timeout, sql_checkpoints.get(&self.subscription_id))
            .await?
            .unwrap_or(Position::START))
    }

    /// Blocks until resumed or cancelled while paused.
    async fn wait_while_paused(&self) {
        while self.state() == RunnerState::Paused {
            tokio::select! {
                _ = self.resume.notified() => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// Starts the catch-up + live run loop. The supplied
    /// `sql_checkpoints` is the authoritative source used to resume after
    /// a restart; the optional fast store is updated best-effort after
    /// each commit.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "projection.run", skip(self, sql_checkpoints), fields(component = "projection", subscription_id = %self.subscription_id), err)
    )]
    pub async fn run(&self, sql_checkpoints: &dyn CheckpointStore) -> Result<(), CoreError> {
        let _ = self.state.send(RunnerState::CatchingUp);

        let mut from_position = self.checkpoint_position(sql_checkpoints).await?;

        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                let _ = self.state.send(RunnerState::Stopped);
                return Ok(());
            }

            match self.run_once(sql_checkpoints, from_position).await {
                Ok(RunOnceExit::SourceClosed) => return Ok(()),
                Ok(RunOnceExit::Paused) => {
                    self.wait_while_paused().await;

                    if self.cancel.is_cancelled() {
                        let _ = self.state.send(RunnerState::Stopped);
                        return Ok(());
                    }

                    attempt = 0;
                    from_position = self.checkpoint_position(sql_checkpoints).await?;
                    let _ = self.state.send(RunnerState::CatchingUp);
                }
                Err(CoreError::Cancelled) => {
                    let _ = self.state.send(RunnerState::Stopped);
                    return Ok(());
                }
                Err(CoreError::HandlerFailed { .. }) if attempt >= 10 => {
                    let _ = self.state.send(RunnerState::Paused);
                    self.wait_while_paused().await;

                    if self.cancel.is_cancelled() {
                        let _ = self.state.send(RunnerState::Stopped);
                        return Ok(());
                    }

                    attempt = 0;
                    from_position = self.checkpoint_position(sql_checkpoints).await?;
                    let _ = self.state.send(RunnerState::CatchingUp);
                }
                Err(_err) => {
                    // Source or handler error: back off and reconnect from
                    // the last durably committed checkpoint.
                    from_position = self.checkpoint_position(sql_checkpoints).await?;

                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn run_once(&self, sql_checkpoints: &dyn CheckpointStore, from_position: Position) -> Result<RunOnceExit, CoreError> {
        let mut events = self.log.subscribe(&self.stream, from_position);
        let mut batch: Vec<Event> = Vec::with_capacity(self.batching.max);
        let deadline_reset = || Instant::now() + self.batching.linger;
        let mut deadline = deadline_reset();
        let mut state_rx = self.subscribe_state();

        if self.state() == RunnerState::Paused {
            return Ok(RunOnceExit::Paused);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(CoreError::Cancelled);
                }
                Ok(()) = state_rx.changed() => {
                    if *state_rx.borrow() == RunnerState::Paused {
                        if !batch.is_empty() {
                            self.flush(&mut batch, sql_checkpoints).await?;
                        }
                        return Ok(RunOnceExit::Paused);
                    }
                }
                maybe_event = events.next() => {
                    match maybe_event {
                        Some(Ok(event)) => {
                            batch.push(event);
                            if batch.len() >= self.batching.max {
                                self.flush(&mut batch, sql_checkpoints).await?;
                                deadline = deadline_reset();
                            }
                        }
                        Some(Err(source)) => return Err(CoreError::TransientIo(source.into())),
                        None => {
                            if !batch.is_empty() {
                                self.flush(&mut batch, sql_checkpoints).await?;
                            }
                            let _ = self.state.send(RunnerState::Live);
                            return Ok(RunOnceExit::SourceClosed);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if !batch.is_empty() {
                        self.flush(&mut batch, sql_checkpoints).await?;
                    }
                    deadline = deadline_reset();
                }
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<Event>, sql_checkpoints: &dyn CheckpointStore) -> Result<(), CoreError> {
        let commit_position = batch.last().expect("flush called with non-empty batch").global_position;

        self.writer.apply_batch(&self.subscription_id, batch, commit_position).await?;

        error::with_timeout(self.operation_timeout, sql_checkpoints.set(&self.subscription_id, commit_position, None)).await?;

        if let Some(fast) = &self.fast_checkpoints {
            // Belt-and-braces mirror to the fast store; SQL remains
            // authoritative on restart, this is purely advisory.
            let _ = fast.set_if_newer(&self.subscription_id, commit_position, None).await;
        }

        batch.clear();
        Ok(())
    }
}

/// Simple in-process [`ProjectionWriter`] used by unit tests, applying
/// handlers without a real transactional store. Real deployments use the
/// Postgres-backed writer.
pub struct InMemoryProjectionWriter {
    handlers: HandlerRegistry,
    processed: Mutex<std::collections::HashSet<(String, uuid::Uuid)>>,
}

impl InMemoryProjectionWriter {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            handlers,
            processed: Mutex::new(std::collections::HashSet::new()),
        }
    }
}

#[async_trait]
impl ProjectionWriter for InMemoryProjectionWriter {
    async fn apply_batch(&self, subscription_id: &str, events: &[Event], _commit_position: Position) -> Result<Vec<ApplyOutcome>, CoreError> {
        let mut outcomes = Vec::with_capacity(events.len());
        let mut processed = self.processed.lock().await;

        for event in events {
            let key = (subscription_id.to_owned(), event.id);

            if !processed.insert(key) {
                outcomes.push(ApplyOutcome::Skipped);
                continue;
            }

            if let Some(handler) = self.handlers.get(&event.event_type) {
                handler(event).map_err(|source| CoreError::HandlerFailed {
                    subscription_id: subscription_id.to_owned(),
                    source,
                })?;
            }

            outcomes.push(ApplyOutcome::Applied);
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;
    use crate::eventlog::{EventLogClient, ExpectedRevision, InMemoryEventLog, NewEvent};

    #[tokio::test]
    async fn idempotent_batch_apply_skips_redelivered_events() {
        let counter = Arc::new(AtomicI64::new(0));
        let counter_clone = Arc::clone(&counter);

        let handlers = HandlerRegistry::new().register(
            "incremented",
            Arc::new(move |_event| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let writer = InMemoryProjectionWriter::new(handlers);

        let log = InMemoryEventLog::default();
        let stream_id = StreamId::from("ctx.agg.v1-t1-e1");
        log.append(
            &stream_id,
            ExpectedRevision::Any,
            vec![
                NewEvent::new("incremented", serde_json::json!({}), serde_json::json!({})),
                NewEvent::new("incremented", serde_json::json!({}), serde_json::json!({})),
            ],
        )
        .await
        .unwrap();

        let events: Vec<Event> = futures::StreamExt::collect::<Vec<_>>(log.read_forward(&stream_id, 0, None))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        let first = writer.apply_batch("sub-1", &events, Position::new(1000, 1001)).await.unwrap();
        assert_eq!(first, vec![ApplyOutcome::Applied, ApplyOutcome::Applied]);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let second = writer.apply_batch("sub-1", &events, Position::new(1000, 1001)).await.unwrap();
        assert_eq!(second, vec![ApplyOutcome::Skipped, ApplyOutcome::Skipped]);
        assert_eq!(counter.load(Ordering::SeqCst), 2, "redelivery must not mutate the read model again");
    }

    #[tokio::test]
    async fn unknown_event_type_is_silently_skipped_not_an_error() {
        let writer = InMemoryProjectionWriter::new(HandlerRegistry::new());

        let event = Event {
            id: uuid::Uuid::new_v4(),
            event_type: "unregistered-type".into(),
            data: serde_json::json!({}),
            metadata: serde_json::json!({}),
            stream_revision: 0,
            global_position: Position::new(1, 0),
            link_position: None,
            recorded_at: chrono::Utc::now(),
        };

        let outcomes = writer.apply_batch("sub-1", std::slice::from_ref(&event), Position::new(1, 0)).await.unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::Applied]);
    }
}
