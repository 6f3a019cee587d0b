// apix-storage: the Log Adapter (8% of the core, per spec.md §2).
//
// Wraps the external Log Service (append-only streams with consumer
// groups, Redis-Streams-like) and KeyValue Service (TTL, counters, sorted
// sets, pub/sub) behind two small traits. The core never reimplements a
// pub/sub broker (spec.md §1) -- everything above these two traits is
// owned by `apix-core`.

pub mod error;
pub mod postgres;
pub mod redis_adapter;
pub mod traits;

pub use error::StorageError;
pub use postgres::{create_pool, run_migrations, PostgresStore};
pub use redis_adapter::RedisStorage;
pub use traits::{KvStore, LogAdapter, RelationalStore, StreamEntry};
