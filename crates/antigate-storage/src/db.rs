//! Shared `DatabaseConnection` cache, keyed by DSN so repeated bootstrap
//! calls against the same database reuse one pool, plus the schema-sync
//! entry point run once at startup.
//!
//! Grounded on `gproxy-storage::db::connect_shared` and
//! `gproxy-storage::seaorm::SeaOrmStorage::sync`.

use std::sync::{OnceLock, RwLock};

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};

use crate::entities;

struct SharedDb {
    dsn: String,
    connection: DatabaseConnection,
}

static SHARED_DB: OnceLock<RwLock<Option<SharedDb>>> = OnceLock::new();

pub async fn connect_shared(dsn: &str) -> Result<DatabaseConnection, DbErr> {
    let lock = SHARED_DB.get_or_init(|| RwLock::new(None));
    if let Ok(guard) = lock.read()
        && let Some(shared) = guard.as_ref()
        && shared.dsn == dsn
    {
        return Ok(shared.connection.clone());
    }

    let connection = Database::connect(dsn).await?;
    if let Ok(mut guard) = lock.write() {
        *guard = Some(SharedDb {
            dsn: dsn.to_string(),
            connection: connection.clone(),
        });
    }
    Ok(connection)
}

/// Creates every entity's table if absent. Idempotent; safe to call on every
/// process start rather than gating it behind a migration-runner flag.
pub async fn sync_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    for statement in [
        builder.build(schema.create_table_from_entity(entities::Accounts).if_not_exists()),
        builder.build(schema.create_table_from_entity(entities::RateLimitWindows).if_not_exists()),
        builder.build(schema.create_table_from_entity(entities::IdempotencyRecords).if_not_exists()),
        builder.build(schema.create_table_from_entity(entities::JobHeartbeats).if_not_exists()),
        builder.build(schema.create_table_from_entity(entities::UpstreamErrorLog).if_not_exists()),
    ] {
        db.execute(statement).await?;
    }
    Ok(())
}
