//! Durable storage for the dispatch engine: sea-orm entities, the shared
//! connection cache, the D3 idempotency coordinator, the D1 leader lock, and
//! the D1 periodic cleanup job.

pub mod cleanup;
pub mod db;
pub mod entities;
pub mod idempotency;
pub mod leader_lock;

pub use cleanup::{CleanupConfig, CleanupSummary, RetentionTarget};
pub use db::{connect_shared, sync_schema};
pub use idempotency::{fingerprint, IdempotencyCoordinator, IdempotencyError, IdempotencyPolicy, StoredResponse};
pub use leader_lock::{DbAdvisoryLock, LeaderLockError, RedisLeaderLock};
