//! Leader lock for the periodic cleanup job (spec §4.D1): a single-writer
//! SETNX against a well-known Redis key with a TTL, released by a
//! compare-and-delete Lua script so a node never releases a lease another
//! node has since acquired. Falls back to a Postgres advisory lock, hashed
//! from the same key, when Redis is unavailable or the deployment runs in
//! "simple mode" (single node, no KV).
//!
//! New module: gproxy has no cron/leader-election concept. Redis usage
//! here is grounded on the `redis` crate's `ConnectionManager`, the only
//! `tokio`-native client in the retrieval pack with a matching leader-lock
//! idiom (SETNX + Lua release).

use sea_orm::{ConnectionTrait, DatabaseConnection, Statement};

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
else
  return 0
end
"#;

#[derive(Debug, thiserror::Error)]
pub enum LeaderLockError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

pub struct RedisLeaderLock {
    conn: redis::aio::ConnectionManager,
    key: String,
    token: String,
    ttl_secs: u64,
}

impl RedisLeaderLock {
    pub fn new(conn: redis::aio::ConnectionManager, key: impl Into<String>, token: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            conn,
            key: key.into(),
            token: token.into(),
            ttl_secs,
        }
    }

    /// `SET key token NX EX ttl`. Returns `true` if this node now holds the
    /// lease.
    pub async fn try_acquire(&mut self) -> Result<bool, LeaderLockError> {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.token)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut self.conn)
            .await?;
        Ok(acquired.is_some())
    }

    /// Releases the lease only if it still holds our token, so a lease this
    /// node's own TTL already let expire (and another node subsequently
    /// acquired) is never stolen back out from under the new holder.
    pub async fn release(&mut self) -> Result<(), LeaderLockError> {
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(())
    }
}

/// Postgres advisory-lock fallback for single-node ("simple mode")
/// deployments with no Redis configured. The lock key is hashed into the two
/// `int4` halves `pg_try_advisory_lock` expects.
pub struct DbAdvisoryLock<'a> {
    db: &'a DatabaseConnection,
    key1: i32,
    key2: i32,
    held: bool,
}

impl<'a> DbAdvisoryLock<'a> {
    pub fn new(db: &'a DatabaseConnection, lock_name: &str) -> Self {
        let hash = blake3::hash(lock_name.as_bytes());
        let bytes = hash.as_bytes();
        let key1 = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let key2 = i32::from_le_bytes(bytes[4..8].try_into().unwrap());
        Self { db, key1, key2, held: false }
    }

    pub async fn try_acquire(&mut self) -> Result<bool, LeaderLockError> {
        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                "SELECT pg_try_advisory_lock($1, $2) AS acquired",
                [self.key1.into(), self.key2.into()],
            ))
            .await?;
        let acquired = row.map(|r| r.try_get::<bool>("", "acquired").unwrap_or(false)).unwrap_or(false);
        self.held = acquired;
        Ok(acquired)
    }

    pub async fn release(&mut self) -> Result<(), LeaderLockError> {
        if !self.held {
            return Ok(());
        }
        self.db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                "SELECT pg_advisory_unlock($1, $2)",
                [self.key1.into(), self.key2.into()],
            ))
            .await?;
        self.held = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_lock_keys_are_deterministic_per_name() {
        let dummy = blake3::hash(b"cleanup-leader");
        let bytes = dummy.as_bytes();
        let key1 = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let key2 = i32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let dummy2 = blake3::hash(b"cleanup-leader");
        let bytes2 = dummy2.as_bytes();
        assert_eq!(key1, i32::from_le_bytes(bytes2[0..4].try_into().unwrap()));
        assert_eq!(key2, i32::from_le_bytes(bytes2[4..8].try_into().unwrap()));
    }
}
