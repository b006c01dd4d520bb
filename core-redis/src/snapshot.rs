//! Redis-backed [`SnapshotCache`] (C2's hot path).
//!
//! Mirrors the last snapshot seen for a stream as a JSON string; a miss
//! or an unreachable Redis MUST NOT affect correctness -- callers fall
//! back to the log, per spec §4.2.

use async_trait::async_trait;
use esrc_core::model::{Snapshot, StreamId};
use esrc_core::snapshot::SnapshotCache;
use redis::AsyncCommands;
use tracing::warn;

#[derive(Clone)]
pub struct RedisSnapshotCache {
    client: redis::Client,
    env_prefix: String,
}

impl RedisSnapshotCache {
    pub fn new(client: redis::Client, env_prefix: impl Into<String>) -> Self {
        Self {
            client,
            env_prefix: env_prefix.into(),
        }
    }

    fn key(&self, stream_id: &StreamId) -> String {
        format!("{}snapshot:{}", self.env_prefix, stream_id.as_str())
    }
}

#[async_trait]
impl SnapshotCache for RedisSnapshotCache {
    async fn get(&self, stream_id: &StreamId) -> Option<Snapshot> {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%err, "snapshot cache unreachable, falling back to the log");
                return None;
            }
        };

        let raw: Option<String> = conn.get(self.key(stream_id)).await.ok()?;
        raw.and_then(|json| serde_json::from_str(&json).ok())
    }

    async fn put(&self, stream_id: &StreamId, snapshot: &Snapshot) {
        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            return;
        };

        if let Ok(json) = serde_json::to_string(snapshot) {
            let _: Result<(), _> = conn.set(self.key(stream_id), json).await;
        }
    }
}
