//! C3 -- Checkpoint Store.
//!
//! Crash-safe, monotonic position storage keyed by subscription
//! identifier, with a compare-and-advance primitive that must remain
//! atomic end-to-end under concurrent writers. Grounded on
//! `eventually/src/subscription.rs`'s `Subscription::checkpoint` contract,
//! generalized to a durable, shared store per spec §4.3.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::Position;

/// Errors surfaced by a [`CheckpointStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("transient checkpoint store error: {0}")]
    Transient(#[source] anyhow::Error),
}

/// C3: crash-safe, monotonic position storage shared by competing writers.
///
/// Implementations MUST make [`CheckpointStore::set_if_newer`] atomic
/// end-to-end (a server-side compare, or an equivalent transactional
/// primitive) so the monotonic invariant holds regardless of how many
/// processes call it concurrently.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Position>, CheckpointError>;

    /// Unconditional overwrite.
    async fn set(&self, key: &str, position: Position, ttl: Option<Duration>) -> Result<(), CheckpointError>;

    /// Compare-and-advance: succeeds (`true`) iff `position.commit` is not
    /// less than the stored commit, or the store is empty for `key`.
    async fn set_if_newer(&self, key: &str, position: Position, ttl: Option<Duration>) -> Result<bool, CheckpointError>;

    async fn delete(&self, key: &str) -> Result<(), CheckpointError>;

    async fn exists(&self, key: &str) -> Result<bool, CheckpointError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CheckpointError>;

    async fn get_all(&self, prefix: &str) -> Result<Vec<(String, Position)>, CheckpointError>;

    async fn clear(&self, prefix: &str) -> Result<(), CheckpointError>;
}

/// In-memory [`CheckpointStore`] reference implementation, used by C5/C8
/// unit tests and by the in-process fallback when no fast store is wired.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<RwLock<BTreeMap<String, Position>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Position>, CheckpointError> {
        Ok(self.inner.read().await.get(key).copied())
    }

    async fn set(&self, key: &str, position: Position, _ttl: Option<Duration>) -> Result<(), CheckpointError> {
        self.inner.write().await.insert(key.to_owned(), position);
        Ok(())
    }

    async fn set_if_newer(&self, key: &str, position: Position, _ttl: Option<Duration>) -> Result<bool, CheckpointError> {
        let mut guard = self.inner.write().await;

        match guard.get(key) {
            Some(current) if position.commit < current.commit => Ok(false),
            _ => {
                guard.insert(key.to_owned(), position);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        self.inner.write().await.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CheckpointError> {
        Ok(self.inner.read().await.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn get_all(&self, prefix: &str) -> Result<Vec<(String, Position)>, CheckpointError> {
        Ok(self
            .inner
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }

    async fn clear(&self, prefix: &str) -> Result<(), CheckpointError> {
        self.inner.write().await.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_newer_rejects_older_position() {
        let store = InMemoryCheckpointStore::new();

        store.set("sub", Position::new(6000, 6001), None).await.unwrap();

        let updated = store.set_if_newer("sub", Position::new(4000, 4001), None).await.unwrap();

        assert!(!updated);
        assert_eq!(store.get("sub").await.unwrap(), Some(Position::new(6000, 6001)));
    }

    #[tokio::test]
    async fn set_if_newer_accepts_equal_or_newer_position() {
        let store = InMemoryCheckpointStore::new();

        assert!(store.set_if_newer("sub", Position::new(1000, 1001), None).await.unwrap());
        assert!(store.set_if_newer("sub", Position::new(1000, 1001), None).await.unwrap());
        assert!(store.set_if_newer("sub", Position::new(1000, 1002), None).await.unwrap());

        assert_eq!(store.get("sub").await.unwrap(), Some(Position::new(1000, 1002)));
    }

    #[tokio::test]
    async fn concurrent_set_if_newer_converges_to_maximum() {
        let store = InMemoryCheckpointStore::new();
        let mut handles = Vec::new();

        for commit in 0..50u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set_if_newer("sub", Position::new(commit, 0), None).await.unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("sub").await.unwrap(), Some(Position::new(49, 0)));
    }
}
