//! Live-backend checks against a real Postgres instance. Ignored by
//! default since they need `DATABASE_URL` pointing at a disposable
//! database; grounded on `eventually-postgres/tests/setup/mod.rs`'s
//! connect-and-migrate fixture.

use esrc_core::checkpoint::CheckpointStore;
use esrc_core::model::Position;
use esrc_postgres::PostgresCheckpointStore;
use sqlx::postgres::PgPoolOptions;

async fn connect() -> sqlx::PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a disposable test database");

    let pool = PgPoolOptions::new().max_connections(5).connect(&url).await.expect("failed to connect to postgres");

    esrc_postgres::migrate(&pool).await.expect("failed to run migrations");

    pool
}

#[tokio::test]
#[ignore = "requires a live Postgres reachable via DATABASE_URL"]
async fn set_if_newer_rejects_a_stale_commit_against_a_real_database() {
    let pool = connect().await;
    let store = PostgresCheckpointStore::new(pool);
    let key = format!("live-test-{}", uuid::Uuid::new_v4());

    store.set(&key, Position::new(6000, 6001), None).await.unwrap();

    let accepted = store.set_if_newer(&key, Position::new(4000, 4001), None).await.unwrap();

    assert!(!accepted);
    assert_eq!(store.get(&key).await.unwrap(), Some(Position::new(6000, 6001)));

    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a live Postgres reachable via DATABASE_URL"]
async fn concurrent_set_if_newer_converges_on_the_maximum_position() {
    let pool = connect().await;
    let store = std::sync::Arc::new(PostgresCheckpointStore::new(pool));
    let key = format!("live-test-{}", uuid::Uuid::new_v4());

    let writers = (1..=10u64).map(|i| {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move { store.set_if_newer(&key, Position::new(i * 1000, 0), None).await })
    });

    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    assert_eq!(store.get(&key).await.unwrap(), Some(Position::new(10_000, 0)));

    store.delete(&key).await.unwrap();
}
