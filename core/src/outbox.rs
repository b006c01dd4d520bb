//! C7/C8 -- Outbox Repository and Outbox Publisher.
//!
//! Durable staging table that decouples writes from downstream
//! publication: C7 owns claim/ack/nack/reclaim lifecycle under a
//! per-stream FIFO invariant, C8 drains claimed batches into a
//! [`crate::queue::QueueFacade`]. Grounded on `eventually-postgres`'s
//! `FOR UPDATE SKIP LOCKED`-style claim pattern and
//! `eventually/src/subscription.rs`'s retry-with-backoff loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{OutboxRecord, OutboxStatus, QueueMessage, StreamId};
use crate::projection::RetryConfig;
use crate::queue::QueueFacade;

/// Errors surfaced by an [`OutboxRepository`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("transient outbox store error: {0}")]
    Transient(#[source] anyhow::Error),
}

/// A new outbox entry prior to assignment of `id`/lifecycle fields.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub stream_id: StreamId,
    pub stream_revision: u64,
    pub event_type: String,
    pub tenant: String,
    pub correlation_id: String,
    pub queue_name: String,
    pub payload: Vec<u8>,
}

/// C7: append-only record of events pending publication, keyed by
/// `(streamId, streamRevision)`.
///
/// Implementations MUST NOT let [`OutboxRepository::claim`] return two
/// records for the same `stream_id` while an earlier-revision record for
/// that stream is still `inflight` or `pending` -- this is what gives the
/// publisher per-stream FIFO for free.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Appends records, typically in the same transaction as the event
    /// append on the write path.
    async fn append(&self, records: Vec<NewOutboxRecord>) -> Result<Vec<i64>, OutboxError>;

    /// Claims up to `n` pending records for `queue_name`, marking them
    /// `inflight` with a lease expiring in `lease` from now. Returned in
    /// `(stream_id, stream_revision)` order.
    async fn claim(&self, queue_name: &str, n: usize, lease: Duration) -> Result<Vec<OutboxRecord>, OutboxError>;

    async fn ack(&self, ids: &[i64]) -> Result<(), OutboxError>;

    /// Increments `attempts`, schedules `next_attempt_at = now + backoff`.
    /// If the new attempt count exceeds `max_attempts`, the record is
    /// marked `dead` instead of rescheduled.
    async fn nack(&self, ids: &[i64], backoff: Duration, max_attempts: u32) -> Result<(), OutboxError>;

    /// Moves `inflight` records whose lease has expired back to `pending`.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, OutboxError>;
}

/// In-memory [`OutboxRepository`] reference implementation, used by unit
/// tests. Real deployments use the Postgres-backed repository.
#[derive(Default)]
pub struct InMemoryOutboxRepository {
    inner: tokio::sync::Mutex<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    records: Vec<OutboxRecord>,
    next_id: i64,
    leases: std::collections::HashMap<i64, DateTime<Utc>>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn append(&self, records: Vec<NewOutboxRecord>) -> Result<Vec<i64>, OutboxError> {
        let mut inner = self.inner.lock().await;
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            let id = inner.next_id;
            inner.next_id += 1;

            inner.records.push(OutboxRecord {
                id,
                stream_id: record.stream_id,
                stream_revision: record.stream_revision,
                event_type: record.event_type,
                tenant: record.tenant,
                correlation_id: record.correlation_id,
                queue_name: record.queue_name,
                payload: record.payload,
                enqueued_at: Utc::now(),
                attempts: 0,
                next_attempt_at: Utc::now(),
                status: OutboxStatus::Pending,
            });

            ids.push(id);
        }

        Ok(ids)
    }

    async fn claim(&self, queue_name: &str, n: usize, lease: Duration) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        // The head of a stream's outstanding queue is its lowest
        // pending-or-inflight revision. A later revision must never be
        // claimed while the head is still outstanding, even if the head
        // itself isn't time-eligible yet (e.g. backed off after a nack).
        let mut head_revision: std::collections::HashMap<StreamId, u64> = std::collections::HashMap::new();
        for record in &inner.records {
            if record.queue_name != queue_name {
                continue;
            }
            if !matches!(record.status, OutboxStatus::Pending | OutboxStatus::Inflight) {
                continue;
            }
            head_revision
                .entry(record.stream_id.clone())
                .and_modify(|rev| *rev = (*rev).min(record.stream_revision))
                .or_insert(record.stream_revision);
        }

        let mut eligible: Vec<usize> = inner
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.queue_name == queue_name
                    && r.status == OutboxStatus::Pending
                    && r.next_attempt_at <= now
                    && head_revision.get(&r.stream_id) == Some(&r.stream_revision)
            })
            .map(|(i, _)| i)
            .collect();

        eligible.sort_by_key(|&i| (inner.records[i].stream_id.clone(), inner.records[i].stream_revision));

        let mut claimed = Vec::new();
        let mut seen_streams: HashSet<StreamId> = HashSet::new();

        for i in eligible {
            if claimed.len() >= n {
                break;
            }

            let stream_id = inner.records[i].stream_id.clone();

            // At most one record per stream per claim call, to preserve
            // strict revision ordering within a single batch.
            if !seen_streams.insert(stream_id) {
                continue;
            }

            inner.records[i].status = OutboxStatus::Inflight;
            inner.leases.insert(inner.records[i].id, now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero()));
            claimed.push(inner.records[i].clone());
        }

        Ok(claimed)
    }

    async fn ack(&self, ids: &[i64]) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock().await;

        for record in inner.records.iter_mut() {
            if ids.contains(&record.id) {
                record.status = OutboxStatus::Done;
            }
        }

        inner.leases.retain(|id, _| !ids.contains(id));
        Ok(())
    }

    async fn nack(&self, ids: &[i64], backoff: Duration, max_attempts: u32) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let backoff = chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());

        for record in inner.records.iter_mut() {
            if !ids.contains(&record.id) {
                continue;
            }

            record.attempts += 1;

            if record.attempts > max_attempts {
                record.status = OutboxStatus::Dead;
            } else {
                record.status = OutboxStatus::Pending;
                record.next_attempt_at = now + backoff;
            }
        }

        inner.leases.retain(|id, _| !ids.contains(id));
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, OutboxError> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<i64> = inner
            .leases
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            inner.leases.remove(id);
            if let Some(record) = inner.records.iter_mut().find(|r| r.id == *id) {
                record.status = OutboxStatus::Pending;
            }
        }

        Ok(expired.len())
    }
}

/// C8: drains one queue's outbox into a [`QueueFacade`], honoring
/// retries, dead-lettering, and per-stream FIFO delivery order.
pub struct OutboxPublisher<R, Q> {
    repo: Arc<R>,
    queue: Arc<Q>,
    queue_name: String,
    batch_max: usize,
    lease: Duration,
    max_attempts: u32,
    retry: RetryConfig,
    reclaim_every: Duration,
    cancel: tokio_util::sync::CancellationToken,
}

impl<R, Q> OutboxPublisher<R, Q>
where
    R: OutboxRepository,
    Q: QueueFacade,
{
    pub fn new(repo: Arc<R>, queue: Arc<Q>, queue_name: impl Into<String>) -> Self {
        Self {
            repo,
            queue,
            queue_name: queue_name.into(),
            batch_max: 128,
            lease: Duration::from_secs(30),
            max_attempts: 8,
            retry: RetryConfig::default(),
            reclaim_every: Duration::from_secs(10),
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }

    pub fn with_batch_max(mut self, batch_max: usize) -> Self {
        self.batch_max = batch_max;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn cancellation_token(&self) -> tokio_util::sync::CancellationToken {
        self.cancel.clone()
    }

    /// Runs the publish loop until cancelled. Periodically reclaims
    /// expired leases so a crashed publisher's claims don't strand
    /// records forever.
    pub async fn run(&self) {
        let mut last_reclaim = tokio::time::Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            if last_reclaim.elapsed() >= self.reclaim_every {
                let _ = self.repo.reclaim_expired(Utc::now()).await;
                last_reclaim = tokio::time::Instant::now();
            }

            match self.run_once().await {
                Ok(claimed) if claimed == 0 => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(_) => {}
                Err(_) => {
                    tokio::time::sleep(self.retry.delay_for_attempt(0)).await;
                }
            }
        }
    }

    /// Claims and drains a single batch; returns the number of records
    /// claimed (0 means the queue was empty this tick).
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "outbox.publisher.run_once", skip(self), fields(component = "outbox_publisher", queue_name = %self.queue_name), err)
    )]
    pub async fn run_once(&self) -> Result<usize, OutboxError> {
        let batch = self.repo.claim(&self.queue_name, self.batch_max, self.lease).await?;

        if batch.is_empty() {
            return Ok(0);
        }

        let mut acked = Vec::new();
        let mut nacked = Vec::new();

        for record in &batch {
            let message = QueueMessage {
                key: record.stream_id.to_string(),
                value: record.payload.clone(),
                headers: build_headers(record),
            };

            match self.queue.send(&self.queue_name, message).await {
                Ok(()) => acked.push(record.id),
                Err(_) => nacked.push(record.id),
            }
        }

        if !acked.is_empty() {
            self.repo.ack(&acked).await?;
        }

        if !nacked.is_empty() {
            let backoff = self.retry.delay_for_attempt(batch.first().map(|r| r.attempts).unwrap_or(0));
            self.repo.nack(&nacked, backoff, self.max_attempts).await?;
        }

        Ok(batch.len())
    }
}

/// Builds the six headers spec §6 requires on every published message.
fn build_headers(record: &OutboxRecord) -> std::collections::HashMap<String, String> {
    let mut headers = std::collections::HashMap::new();
    headers.insert("event-id".to_owned(), record.id.to_string());
    headers.insert("event-type".to_owned(), record.event_type.clone());
    headers.insert("stream-id".to_owned(), record.stream_id.to_string());
    headers.insert("stream-revision".to_owned(), record.stream_revision.to_string());
    headers.insert("tenant".to_owned(), record.tenant.clone());
    headers.insert("correlation-id".to_owned(), record.correlation_id.clone());
    headers
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::queue::InMemoryQueue;

    fn record(stream: &str, revision: u64) -> NewOutboxRecord {
        NewOutboxRecord {
            stream_id: StreamId::from(stream),
            stream_revision: revision,
            event_type: "test-event".into(),
            tenant: "acme".into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            queue_name: "orders".into(),
            payload: format!("r{revision}").into_bytes(),
        }
    }

    #[tokio::test]
    async fn claim_preserves_per_stream_fifo_while_earlier_revision_is_inflight() {
        let repo = InMemoryOutboxRepository::new();
        repo.append(vec![record("s", 3), record("s", 4), record("s", 5)]).await.unwrap();

        let first = repo.claim("orders", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].stream_revision, 3);

        let second = repo.claim("orders", 10, Duration::from_secs(30)).await.unwrap();
        assert!(second.is_empty(), "revision 4 must not be claimable while revision 3 is still inflight");

        repo.ack(&[first[0].id]).await.unwrap();

        let third = repo.claim("orders", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].stream_revision, 4);
    }

    #[tokio::test]
    async fn nack_past_max_attempts_dead_letters_the_record() {
        let repo = InMemoryOutboxRepository::new();
        repo.append(vec![record("s", 0)]).await.unwrap();

        let claimed = repo.claim("orders", 10, Duration::from_secs(30)).await.unwrap();
        let id = claimed[0].id;

        repo.nack(&[id], Duration::from_millis(1), 0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let after = repo.claim("orders", 10, Duration::from_secs(30)).await.unwrap();
        assert!(after.is_empty(), "a dead-lettered record must not be reclaimed as pending");
    }

    #[tokio::test]
    async fn reclaim_expired_returns_lapsed_leases_to_pending() {
        let repo = InMemoryOutboxRepository::new();
        repo.append(vec![record("s", 0)]).await.unwrap();
        repo.claim("orders", 10, Duration::from_millis(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = repo.reclaim_expired(Utc::now()).await.unwrap();
        assert_eq!(reclaimed, 1);

        let claimed_again = repo.claim("orders", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed_again.len(), 1);
    }

    #[tokio::test]
    async fn publisher_drains_outbox_observing_ordering_under_retry() {
        let repo = Arc::new(InMemoryOutboxRepository::new());
        repo.append(vec![record("s", 3), record("s", 4), record("s", 5)]).await.unwrap();

        let failures_remaining = Arc::new(AtomicUsize::new(2));
        let queue = Arc::new(InMemoryQueue::new().failing_for_value(b"r4".to_vec(), Arc::clone(&failures_remaining)));

        let publisher = OutboxPublisher::new(Arc::clone(&repo), Arc::clone(&queue), "orders")
            .with_max_attempts(10)
            .with_retry_config(RetryConfig {
                base: Duration::from_millis(1),
                max: Duration::from_millis(2),
                jitter: Duration::from_millis(0),
            });

        // Drive run_once until the outbox is empty; r=4 fails twice then
        // succeeds, matching the spec's literal retry scenario. The sleep
        // between attempts comfortably exceeds the (deliberately tiny)
        // backoff above so a claim is never skipped for being too early.
        for _ in 0..10 {
            publisher.run_once().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let sent = queue.sent_values();
        assert_eq!(sent, vec![b"r3".to_vec(), b"r4".to_vec(), b"r4".to_vec(), b"r4".to_vec(), b"r5".to_vec()]);
    }
}
