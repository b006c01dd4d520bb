//! Postgres backend for `esrc-core`: event log, checkpoint store,
//! projection writer, and outbox repository.
//!
//! Grounded on `eventually-postgres`'s `EventStoreBuilder::migrate_database`
//! embedded-migrations pattern, swapped from `refinery` onto `sqlx`'s
//! built-in migrator (see `DESIGN.md` for the dependency-swap rationale).

pub mod checkpoint;
pub mod error;
pub mod eventlog;
pub mod outbox;
pub mod projection;

pub use checkpoint::PostgresCheckpointStore;
pub use error::Error;
pub use eventlog::PostgresEventLog;
pub use outbox::PostgresOutboxRepository;
pub use projection::{PostgresProjectionWriter, TxHandlerFn, TxHandlerRegistry};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Runs every pending migration against `pool`. Idempotent: migrations
/// already applied are skipped.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}
