//! Error type shared by every Postgres-backed implementation in this
//! crate, wrapping `sqlx::Error` the way `eventually-postgres`'s `Error`
//! wraps `tokio_postgres::Error`.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to encode event payload: {0}")]
    EncodeEvent(#[source] serde_json::Error),

    #[error("failed to decode event payload: {0}")]
    DecodeEvent(#[source] serde_json::Error),

    #[error("postgres query failed: {0}")]
    Sqlx(#[from] sqlx::Error),
}
