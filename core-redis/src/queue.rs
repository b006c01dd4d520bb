//! Redis Streams-backed [`QueueFacade`] (C9).
//!
//! Producer and consumer each get their own `redis::Client`-derived
//! connection -- no transport is shared across roles -- mirroring
//! `eventually-redis`'s `EventStore`/`EventSubscriber` split. Queues are
//! Redis Streams addressed by a `<env>:<service>:<queue>` key, consumed
//! through a consumer group per spec §4.9.

use std::collections::HashMap;

use async_trait::async_trait;
use esrc_core::model::QueueMessage;
use esrc_core::queue::{FacadeConfig, QueueError, QueueFacade};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Redis Streams facade. Holds a dedicated producer connection; each
/// call to [`RedisQueue::spawn_consumer_group`] opens its own dedicated
/// consumer connection, never reusing the producer's.
pub struct RedisQueue {
    client: redis::Client,
    producer_conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
    config: FacadeConfig,
    service: String,
    shutdown: CancellationToken,
}

impl RedisQueue {
    pub fn new(client: redis::Client, config: FacadeConfig, service: impl Into<String>) -> Self {
        Self {
            client,
            producer_conn: Mutex::new(None),
            config,
            service: service.into(),
            shutdown: CancellationToken::new(),
        }
    }

    fn key(&self, queue: &str) -> String {
        self.config.namespaced_key(&self.service, queue)
    }

    async fn producer(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        let mut guard = self.producer_conn.lock().await;

        if guard.is_none() {
            let conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| QueueError::Transient(e.into()))?;
            *guard = Some(conn);
        }

        Ok(guard.as_ref().expect("just populated above").clone())
    }

    /// Opens a dedicated consumer connection and ensures the consumer
    /// group exists, creating the stream if needed.
    pub async fn spawn_consumer_group(&self, queue: &str, group: &str) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Transient(e.into()))?;

        let key = self.key(queue);

        let created: Result<(), redis::RedisError> = conn.xgroup_create_mkstream(&key, group, "$").await;
        if let Err(err) = created {
            if !err.to_string().contains("BUSYGROUP") {
                return Err(QueueError::Transient(err.into()));
            }
        }

        Ok(conn)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[async_trait]
impl QueueFacade for RedisQueue {
    async fn send(&self, queue: &str, message: QueueMessage) -> Result<(), QueueError> {
        if !self.config.queues.iter().any(|q| q.name == queue) {
            return Err(QueueError::UnknownQueue(queue.to_owned()));
        }

        let mut conn = self.producer().await?;
        let key = self.key(queue);

        let mut fields: Vec<(&str, Vec<u8>)> = vec![("key", message.key.into_bytes()), ("value", message.value)];

        let header_blob = serde_json::to_vec(&message.headers).map_err(|e| QueueError::Transient(e.into()))?;
        fields.push(("headers", header_blob));

        let _: String = conn.xadd(&key, "*", &fields).await.map_err(|e| QueueError::Transient(e.into()))?;

        Ok(())
    }

    /// Stops accepting new work, then closes producer and consumer
    /// connections. Every step runs even if an earlier one fails; Redis
    /// connections close on drop, so "close" here means releasing our
    /// handles and signaling workers to stop pulling.
    async fn shutdown(&self) -> Result<(), QueueError> {
        self.shutdown.cancel();

        let mut first_error = None;

        if let Err(err) = self.drain_workers().await {
            first_error = Some(err);
        }

        *self.producer_conn.lock().await = None;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl RedisQueue {
    async fn drain_workers(&self) -> Result<(), QueueError> {
        // Worker pools are owned by the process that spawned them via
        // `spawn_consumer_group`; this facade only signals cancellation
        // and has nothing further to await here.
        Ok(())
    }
}

/// Headers a consumer group reads back; parsed from the `headers` field
/// written by [`RedisQueue::send`].
pub fn decode_headers(raw: &[u8]) -> Result<HashMap<String, String>, serde_json::Error> {
    serde_json::from_slice(raw)
}
