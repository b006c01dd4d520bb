//! Live-backend checks against a real Redis instance. Ignored by default
//! since they need `REDIS_URL`; grounded on `eventually-redis/tests/store.rs`'s
//! connect-then-exercise shape.

use esrc_core::checkpoint::CheckpointStore;
use esrc_core::model::Position;
use esrc_redis::RedisCheckpointStore;

fn connect() -> redis::Client {
    let url = std::env::var("REDIS_URL").expect("REDIS_URL must point at a disposable Redis instance");
    redis::Client::open(url).expect("failed to build a redis client")
}

#[tokio::test]
#[ignore = "requires a live Redis reachable via REDIS_URL"]
async fn set_if_newer_is_atomic_against_a_real_redis() {
    let client = connect();
    let store = RedisCheckpointStore::new(client, "live-test:");
    let key = format!("cp-{}", uuid::Uuid::new_v4());

    store.set(&key, Position::new(6000, 6001), None).await.unwrap();

    let accepted = store.set_if_newer(&key, Position::new(4000, 4001), None).await.unwrap();

    assert!(!accepted);
    assert_eq!(store.get(&key).await.unwrap(), Some(Position::new(6000, 6001)));

    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a live Redis reachable via REDIS_URL"]
async fn get_all_reconstructs_logical_keys_from_namespaced_scan_results() {
    let client = connect();
    let store = RedisCheckpointStore::new(client, "live-test:");
    let prefix = format!("proj-{}-", uuid::Uuid::new_v4());

    store.set(&format!("{prefix}a"), Position::new(1, 0), None).await.unwrap();
    store.set(&format!("{prefix}b"), Position::new(2, 0), None).await.unwrap();

    let mut all = store.get_all(&prefix).await.unwrap();
    all.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(all, vec![(format!("{prefix}a"), Position::new(1, 0)), (format!("{prefix}b"), Position::new(2, 0))]);

    store.clear(&prefix).await.unwrap();
}
