//! Redis backend for `esrc-core`: the fast checkpoint mirror, the
//! snapshot cache, and a Redis Streams [`esrc_core::queue::QueueFacade`].
//!
//! Grounded on `eventually-redis`'s dedicated-connection `Builder`
//! pattern (`build_store` / `build_subscriber` / `build_persistent_subscription`),
//! generalized here across checkpoint, snapshot, and queue roles.

pub mod checkpoint;
pub mod queue;
pub mod snapshot;

pub use checkpoint::RedisCheckpointStore;
pub use queue::RedisQueue;
pub use snapshot::RedisSnapshotCache;
