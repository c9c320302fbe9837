//! §4.D1 cleanup heartbeat: one row per named job, overwritten every run.
//!
//! Grounded on `gproxy-storage::entities::internal_events`'s shape, reduced
//! to the single-row-per-job upsert the cleanup job needs rather than an
//! append-only event log.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "job_heartbeats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub job_name: String,
    pub last_run_at: OffsetDateTime,
    pub duration_ms: i64,
    pub ok: bool,
    /// Success summary ("deleted N rows across M tables") or a truncated
    /// error message, whichever applies.
    pub detail: String,
}

impl ActiveModelBehavior for ActiveModel {}
