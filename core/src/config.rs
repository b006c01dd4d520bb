//! Typed, environment-sourced configuration.
//!
//! Every tunable named in the configuration table is a field here with a
//! spec-mandated default; nothing else (HTTP ports, auth, tracing
//! exporters) belongs in this type -- those are owned by whatever binary
//! wires the core up. Grounded on `eventually-test/src/config.rs`'s
//! `envconfig`-derived struct.

use std::time::Duration;

use envconfig::Envconfig;

use crate::outbox::OutboxPublisher;
use crate::projection::{BatchConfig, RetryConfig};
use crate::queue::QueueFacade;

/// Every environment-sourced tunable recognized by the core, per spec §6.
#[derive(Envconfig, Debug, Clone)]
pub struct CoreConfig {
    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "REDIS_URL")]
    pub redis_url: String,

    #[envconfig(from = "SNAPSHOT_EVENT_COUNT", default = "200")]
    pub snapshot_event_count: u64,

    #[envconfig(from = "SNAPSHOT_TIME_MS", default = "300000")]
    pub snapshot_time_ms: u64,

    #[envconfig(from = "PROJECTION_BATCH_MAX", default = "128")]
    pub projection_batch_max: usize,

    #[envconfig(from = "PROJECTION_BATCH_LINGER_MS", default = "50")]
    pub projection_batch_linger_ms: u64,

    #[envconfig(from = "PROJECTION_RETRY_BASE_MS", default = "100")]
    pub projection_retry_base_ms: u64,

    #[envconfig(from = "PROJECTION_RETRY_MAX_MS", default = "30000")]
    pub projection_retry_max_ms: u64,

    #[envconfig(from = "PROJECTION_RETRY_JITTER_MS", default = "100")]
    pub projection_retry_jitter_ms: u64,

    #[envconfig(from = "OUTBOX_LEASE_MS", default = "30000")]
    pub outbox_lease_ms: u64,

    #[envconfig(from = "OUTBOX_MAX_ATTEMPTS", default = "8")]
    pub outbox_max_attempts: u32,

    #[envconfig(from = "CHECKPOINT_ENV_PREFIX", default = "dev")]
    pub checkpoint_env_prefix: String,

    /// Per-operation deadline for event-log transport calls, per spec §5.
    #[envconfig(from = "LOG_OP_TIMEOUT_MS", default = "30000")]
    pub log_op_timeout_ms: u64,

    /// Per-operation deadline for checkpoint-store transport calls.
    #[envconfig(from = "CHECKPOINT_OP_TIMEOUT_MS", default = "5000")]
    pub checkpoint_op_timeout_ms: u64,

    /// Per-operation deadline for outbox/projection SQL transport calls.
    #[envconfig(from = "SQL_OP_TIMEOUT_MS", default = "30000")]
    pub sql_op_timeout_ms: u64,

    /// Per-operation deadline for queue transport calls.
    #[envconfig(from = "QUEUE_OP_TIMEOUT_MS", default = "10000")]
    pub queue_op_timeout_ms: u64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl CoreConfig {
    pub fn snapshot_thresholds(&self) -> crate::aggregate::SnapshotThresholds {
        crate::aggregate::SnapshotThresholds {
            event_count: self.snapshot_event_count,
            time: Duration::from_millis(self.snapshot_time_ms),
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max: self.projection_batch_max,
            linger: Duration::from_millis(self.projection_batch_linger_ms),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            base: Duration::from_millis(self.projection_retry_base_ms),
            max: Duration::from_millis(self.projection_retry_max_ms),
            jitter: Duration::from_millis(self.projection_retry_jitter_ms),
        }
    }

    pub fn outbox_lease(&self) -> Duration {
        Duration::from_millis(self.outbox_lease_ms)
    }

    pub fn log_op_timeout(&self) -> Duration {
        Duration::from_millis(self.log_op_timeout_ms)
    }

    pub fn checkpoint_op_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_op_timeout_ms)
    }

    pub fn sql_op_timeout(&self) -> Duration {
        Duration::from_millis(self.sql_op_timeout_ms)
    }

    pub fn queue_op_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_op_timeout_ms)
    }

    /// Namespaces a checkpoint key as `<envPrefix>checkpoint:<subscriptionId>`,
    /// matching the wire contract in spec §6.
    pub fn checkpoint_key(&self, subscription_id: &str) -> String {
        format!("{}checkpoint:{}", self.checkpoint_env_prefix, subscription_id)
    }

    pub fn configure_publisher<R, Q>(&self, publisher: OutboxPublisher<R, Q>) -> OutboxPublisher<R, Q>
    where
        R: crate::outbox::OutboxRepository,
        Q: QueueFacade,
    {
        publisher
            .with_batch_max(self.projection_batch_max)
            .with_lease(self.outbox_lease())
            .with_max_attempts(self.outbox_max_attempts)
            .with_retry_config(self.retry_config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table_when_env_is_absent() {
        let config = CoreConfig {
            database_url: "postgres://localhost/test".into(),
            redis_url: "redis://localhost".into(),
            snapshot_event_count: 200,
            snapshot_time_ms: 300_000,
            projection_batch_max: 128,
            projection_batch_linger_ms: 50,
            projection_retry_base_ms: 100,
            projection_retry_max_ms: 30_000,
            projection_retry_jitter_ms: 100,
            outbox_lease_ms: 30_000,
            outbox_max_attempts: 8,
            checkpoint_env_prefix: "dev".into(),
            log_op_timeout_ms: 30_000,
            checkpoint_op_timeout_ms: 5_000,
            sql_op_timeout_ms: 30_000,
            queue_op_timeout_ms: 10_000,
            log_level: "info".into(),
        };

        assert_eq!(config.snapshot_thresholds().event_count, 200);
        assert_eq!(config.batch_config().max, 128);
        assert_eq!(config.checkpoint_key("sub-1"), "devcheckpoint:sub-1");
        assert_eq!(config.log_op_timeout(), Duration::from_secs(30));
        assert_eq!(config.checkpoint_op_timeout(), Duration::from_secs(5));
        assert_eq!(config.sql_op_timeout(), Duration::from_secs(30));
        assert_eq!(config.queue_op_timeout(), Duration::from_secs(10));
    }
}
