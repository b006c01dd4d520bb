//! C9 -- Queue Facade.
//!
//! Named queues behind dedicated producer/consumer/subscriber
//! connections, environment-namespaced keys, and an ordered graceful
//! shutdown. Grounded on `eventually-redis/src/lib.rs`'s split
//! producer/subscriber connection model, generalized from a single
//! Redis Streams transport to an abstract facade per spec §4.9.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::QueueMessage;

/// Errors surfaced by a [`QueueFacade`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue {0} is not registered")]
    UnknownQueue(String),

    #[error("transient queue transport error: {0}")]
    Transient(#[source] anyhow::Error),
}

/// Declarative registration for a single queue: its name, how many
/// worker tasks consume it, and whether per-message metrics are
/// emitted.
#[derive(Debug, Clone)]
pub struct QueueRegistration {
    pub name: String,
    pub workers: usize,
    pub enable_metrics: bool,
}

/// Declarative registration for the whole facade, per spec §4.9.
#[derive(Debug, Clone, Default)]
pub struct FacadeConfig {
    pub queues: Vec<QueueRegistration>,
    pub env_prefix: String,
}

impl FacadeConfig {
    /// Namespaces a logical queue name as `<env>:<service>:<queue>`.
    pub fn namespaced_key(&self, service: &str, queue: &str) -> String {
        format!("{}:{}:{}", self.env_prefix, service, queue)
    }
}

/// C9: named queues with dedicated transport connections per role.
///
/// Implementations MUST give producers, subscribers, and worker pools
/// their own transport connections -- none shared across roles -- and
/// MUST run [`QueueFacade::shutdown`]'s steps in order even when an
/// earlier step fails.
#[async_trait]
pub trait QueueFacade: Send + Sync {
    async fn send(&self, queue: &str, message: QueueMessage) -> Result<(), QueueError>;

    /// Stops accepting new work, drains workers, then closes producer,
    /// subscriber, and transport connections in that order. Every step
    /// runs regardless of whether an earlier one failed; the first
    /// error encountered (if any) is returned after all steps complete.
    async fn shutdown(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// In-memory [`QueueFacade`] reference implementation, used by C8's unit
/// tests. Can be configured to fail sending a specific payload a fixed
/// number of times, to exercise retry/backoff behavior deterministically.
pub struct InMemoryQueue {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    fail_value: Mutex<Option<(Vec<u8>, Arc<AtomicUsize>)>>,
    config: FacadeConfig,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_value: Mutex::new(None),
            config: FacadeConfig::default(),
        }
    }

    /// Causes the next `remaining.load()` sends of `value` to fail; each
    /// failed attempt decrements the counter. Used to simulate the
    /// "fails twice then succeeds" scenario from spec §8 scenario 6.
    pub fn failing_for_value(self, value: Vec<u8>, remaining: Arc<AtomicUsize>) -> Self {
        *self.fail_value.try_lock().expect("uncontended at construction") = Some((value, remaining));
        self
    }

    pub fn sent_values(&self) -> Vec<Vec<u8>> {
        self.sent.try_lock().expect("uncontended in tests").iter().map(|(_, v)| v.clone()).collect()
    }
}

#[async_trait]
impl QueueFacade for InMemoryQueue {
    async fn send(&self, queue: &str, message: QueueMessage) -> Result<(), QueueError> {
        {
            let guard = self.fail_value.lock().await;
            if let Some((value, remaining)) = guard.as_ref() {
                if *value == message.value {
                    let prev = remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None });
                    if prev.is_ok() {
                        self.sent.lock().await.push((queue.to_owned(), message.value.clone()));
                        return Err(QueueError::Transient(anyhow::anyhow!("simulated transport failure")));
                    }
                }
            }
        }

        self.sent.lock().await.push((queue.to_owned(), message.value));
        Ok(())
    }
}

/// Tracks per-queue worker pool state for a facade implementation,
/// enforcing the registration/shutdown contract declaratively.
pub struct WorkerPoolRegistry {
    pools: HashMap<String, QueueRegistration>,
}

impl WorkerPoolRegistry {
    pub fn from_config(config: &FacadeConfig) -> Self {
        let pools = config.queues.iter().map(|q| (q.name.clone(), q.clone())).collect();
        Self { pools }
    }

    pub fn worker_count(&self, queue: &str) -> usize {
        self.pools.get(queue).map(|q| q.workers).unwrap_or(0)
    }

    pub fn metrics_enabled(&self, queue: &str) -> bool {
        self.pools.get(queue).map(|q| q.enable_metrics).unwrap_or(false)
    }
}
