//! Redis-backed [`CheckpointStore`] (C3), the fast belt-and-braces mirror
//! of the SQL-authoritative checkpoint.
//!
//! `set_if_newer` is a Lua `EVAL` script so the compare-and-advance is
//! atomic end-to-end regardless of how many processes race it, per spec
//! §4.3/§6. Grounded on `eventually-redis`'s dedicated-connection
//! `Builder` pattern, generalized from an event-store connection to a
//! checkpoint hash.

use async_trait::async_trait;
use esrc_core::checkpoint::{CheckpointError, CheckpointStore};
use esrc_core::model::Position;
use redis::AsyncCommands;

/// CAS script: overwrites the hash iff the incoming commit is not older
/// than the stored one, or no hash exists yet. Returns 1 if it wrote, 0
/// otherwise -- this single round trip is what makes the compare atomic.
const SET_IF_NEWER_SCRIPT: &str = r#"
local key = KEYS[1]
local commit = tonumber(ARGV[1])
local prepare = ARGV[2]
local updated_at = ARGV[3]

local stored = redis.call('HGET', key, 'commit')
if stored == false or tonumber(stored) <= commit then
    redis.call('HSET', key, 'commit', commit, 'prepare', prepare, 'updated_at', updated_at)
    if ARGV[4] ~= '' then
        redis.call('PEXPIRE', key, ARGV[4])
    end
    return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisCheckpointStore {
    client: redis::Client,
    env_prefix: String,
}

impl RedisCheckpointStore {
    pub fn new(client: redis::Client, env_prefix: impl Into<String>) -> Self {
        Self {
            client,
            env_prefix: env_prefix.into(),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}checkpoint:{}", self.env_prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CheckpointError> {
        self.client.get_multiplexed_async_connection().await.map_err(|e| CheckpointError::Transient(e.into()))
    }

    /// Reads a checkpoint hash given its fully-namespaced key.
    async fn get_raw(&self, namespaced_key: &str) -> Result<Option<Position>, CheckpointError> {
        let mut conn = self.connection().await?;

        let values: Vec<Option<String>> = conn
            .hget(namespaced_key, &["commit", "prepare"])
            .await
            .map_err(|e| CheckpointError::Transient(e.into()))?;

        match (values.first().cloned().flatten(), values.get(1).cloned().flatten()) {
            (Some(commit), Some(prepare)) => Position::parse(&commit, &prepare).map(Some).map_err(|e| CheckpointError::Transient(e.into())),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Position>, CheckpointError> {
        self.get_raw(&self.namespaced(key)).await
    }

    async fn set(&self, key: &str, position: Position, ttl: Option<std::time::Duration>) -> Result<(), CheckpointError> {
        let mut conn = self.connection().await?;
        let key = self.namespaced(key);

        let _: () = conn
            .hset_multiple(&key, &[("commit", position.commit.to_string()), ("prepare", position.prepare.to_string())])
            .await
            .map_err(|e| CheckpointError::Transient(e.into()))?;

        if let Some(ttl) = ttl {
            let _: () = conn.pexpire(&key, ttl.as_millis() as i64).await.map_err(|e| CheckpointError::Transient(e.into()))?;
        }

        Ok(())
    }

    #[tracing::instrument(name = "redis.checkpoint.set_if_newer", skip(self), fields(key = %key, commit = position.commit), err)]
    async fn set_if_newer(&self, key: &str, position: Position, ttl: Option<std::time::Duration>) -> Result<bool, CheckpointError> {
        let mut conn = self.connection().await?;
        let key = self.namespaced(key);

        let ttl_ms = ttl.map(|d| d.as_millis().to_string()).unwrap_or_default();

        let updated: i32 = redis::Script::new(SET_IF_NEWER_SCRIPT)
            .key(&key)
            .arg(position.commit)
            .arg(position.prepare.to_string())
            .arg(chrono::Utc::now().to_rfc3339())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CheckpointError::Transient(e.into()))?;

        Ok(updated == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        let mut conn = self.connection().await?;
        let key = self.namespaced(key);

        let _: () = conn.del(&key).await.map_err(|e| CheckpointError::Transient(e.into()))?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CheckpointError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", self.namespaced(prefix));

        let keys: Vec<String> = conn.keys(&pattern).await.map_err(|e| CheckpointError::Transient(e.into()))?;
        Ok(keys)
    }

    async fn get_all(&self, prefix: &str) -> Result<Vec<(String, Position)>, CheckpointError> {
        let namespaced_keys = self.scan(prefix).await?;
        let checkpoint_prefix = format!("{}checkpoint:", self.env_prefix);
        let mut out = Vec::with_capacity(namespaced_keys.len());

        for namespaced_key in namespaced_keys {
            if let Some(position) = self.get_raw(&namespaced_key).await? {
                let logical_key = namespaced_key.strip_prefix(&checkpoint_prefix).unwrap_or(&namespaced_key).to_owned();
                out.push((logical_key, position));
            }
        }

        Ok(out)
    }

    async fn clear(&self, prefix: &str) -> Result<(), CheckpointError> {
        let keys = self.scan(prefix).await?;
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection().await?;
        let _: () = conn.del(&keys).await.map_err(|e| CheckpointError::Transient(e.into()))?;
        Ok(())
    }
}
