//! Periodic Cleanup Job (spec §4.D1): cron-scheduled, leader-locked,
//! bounded-batch deletion of aged operational rows, heartbeating on every
//! run whether it succeeded or failed.
//!
//! Grounded on the `cron` crate's schedule-iteration idiom (seen across the
//! retrieval pack's job-scheduler manifests) plus `gproxy-storage`'s
//! one-entity-per-table convention for the tables this job retires.

use std::str::FromStr;
use std::time::{Duration as StdDuration, Instant};

use cron::Schedule;
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QuerySelect, Statement};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use antigate_common::RetentionDays;

use crate::entities::job_heartbeats::{ActiveModel as HeartbeatActive, Entity as JobHeartbeats};
use crate::entities::rate_limit_windows::{Column as RateLimitColumn, Entity as RateLimitWindows};

pub const LEADER_LOCK_KEY: &str = "antigate:cleanup:leader";
const JOB_NAME: &str = "periodic_cleanup";

/// One retention-eligible table: a plain SQL table name plus the column to
/// cut on, since not every retained table has a generated `sea-orm` entity
/// in this crate (alert events / metric pre-aggregates live in the Ops
/// layer's own schema, out of scope per spec.md §1, but still named here so
/// the batch-delete loop is table-agnostic).
#[derive(Debug, Clone)]
pub struct RetentionTarget {
    pub table: &'static str,
    pub time_column: &'static str,
    pub retention_days: u32,
}

pub fn retention_targets(days: &RetentionDays) -> Vec<RetentionTarget> {
    vec![
        RetentionTarget { table: "upstream_error_log", time_column: "at", retention_days: days.error_log },
        RetentionTarget { table: "retry_attempt_log", time_column: "at", retention_days: days.retry_attempt },
        RetentionTarget { table: "alert_event", time_column: "at", retention_days: days.alert_event },
        RetentionTarget { table: "usage_minute_metric", time_column: "bucket_start", retention_days: days.minute_metric },
        RetentionTarget { table: "usage_hourly_preagg", time_column: "bucket_start", retention_days: days.hourly_preagg },
        RetentionTarget { table: "usage_daily_preagg", time_column: "bucket_start", retention_days: days.daily_preagg },
    ]
}

#[derive(Debug, Default, Clone)]
pub struct CleanupSummary {
    pub deleted_by_table: Vec<(String, u64)>,
    pub expired_rate_limit_windows: u64,
    pub skipped_tables: Vec<String>,
}

impl CleanupSummary {
    fn total(&self) -> u64 {
        self.deleted_by_table.iter().map(|(_, n)| *n).sum::<u64>() + self.expired_rate_limit_windows
    }
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub retention: RetentionDays,
    pub batch_size: u64,
    pub dry_run: bool,
}

/// Runs one cleanup pass: for every configured retention target, repeatedly
/// deletes up to `batch_size` rows ordered by id where the time column is
/// older than the cutoff, until a batch affects zero rows. A table missing
/// its expected schema is skipped non-fatally, since the retention scan must
/// not abort because one table hasn't been migrated onto this deployment yet.
pub async fn run_once(db: &DatabaseConnection, config: &CleanupConfig) -> CleanupSummary {
    let start = Instant::now();
    let now = OffsetDateTime::now_utc();
    let mut summary = CleanupSummary::default();

    for target in retention_targets(&config.retention) {
        let cutoff = now - StdDuration::from_secs(target.retention_days as u64 * 86_400);
        match delete_batched(db, &target, cutoff, config.batch_size, config.dry_run).await {
            Ok(deleted) => summary.deleted_by_table.push((target.table.to_string(), deleted)),
            Err(err) if is_missing_relation(&err) => {
                warn!(table = target.table, "cleanup target table does not exist, skipping");
                summary.skipped_tables.push(target.table.to_string());
            }
            Err(err) => {
                error!(table = target.table, error = %err, "cleanup batch delete failed");
                summary.skipped_tables.push(target.table.to_string());
            }
        }
    }

    match expire_rate_limit_windows(db, now, config.batch_size, config.dry_run).await {
        Ok(n) => summary.expired_rate_limit_windows = n,
        Err(err) => error!(error = %err, "expired rate-limit window cleanup failed"),
    }

    let duration = start.elapsed();
    let detail = if summary.skipped_tables.is_empty() {
        format!("deleted {} rows across {} tables", summary.total(), summary.deleted_by_table.len())
    } else {
        format!(
            "deleted {} rows; skipped tables: {}",
            summary.total(),
            summary.skipped_tables.join(", ")
        )
    };
    if let Err(err) = heartbeat(db, true, duration, &detail).await {
        error!(error = %err, "failed to write cleanup heartbeat");
    }
    info!(rows_deleted = summary.total(), duration_ms = duration.as_millis() as u64, "cleanup pass complete");
    summary
}

async fn delete_batched(
    db: &DatabaseConnection,
    target: &RetentionTarget,
    cutoff: OffsetDateTime,
    batch_size: u64,
    dry_run: bool,
) -> Result<u64, DbErr> {
    let mut total = 0u64;
    loop {
        let sql = if dry_run {
            format!(
                "SELECT count(*) AS affected FROM (SELECT id FROM {} WHERE {} < $1 ORDER BY id LIMIT {}) t",
                target.table, target.time_column, batch_size
            )
        } else {
            format!(
                "DELETE FROM {} WHERE id IN (SELECT id FROM {} WHERE {} < $1 ORDER BY id LIMIT {})",
                target.table, target.table, target.time_column, batch_size
            )
        };
        let result = db
            .execute(Statement::from_sql_and_values(db.get_database_backend(), &sql, [cutoff.into()]))
            .await?;
        let affected = result.rows_affected();
        total += affected;
        if affected == 0 || dry_run {
            break;
        }
    }
    Ok(total)
}

/// Retires durable rate-limit windows (§3 "Rate-Limit Windows") that have
/// long since reset; these aren't governed by a retention-days knob since
/// they expire on their own schedule, but they still need periodic removal
/// so the table doesn't grow unbounded with stale, already-inactive rows.
async fn expire_rate_limit_windows(
    db: &DatabaseConnection,
    now: OffsetDateTime,
    batch_size: u64,
    dry_run: bool,
) -> Result<u64, DbErr> {
    if dry_run {
        return RateLimitWindows::find()
            .filter(RateLimitColumn::ResetAt.lt(now - StdDuration::from_secs(3600)))
            .count(db)
            .await;
    }
    let stale_cutoff = now - StdDuration::from_secs(3600);
    let mut total = 0u64;
    loop {
        let stale = RateLimitWindows::find()
            .filter(RateLimitColumn::ResetAt.lt(stale_cutoff))
            .limit(batch_size)
            .all(db)
            .await?;
        if stale.is_empty() {
            break;
        }
        let n = stale.len() as u64;
        for row in stale {
            RateLimitWindows::delete_by_id(row.id).exec(db).await?;
        }
        total += n;
    }
    Ok(total)
}

fn is_missing_relation(err: &DbErr) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("does not exist") || message.contains("no such table")
}

async fn heartbeat(db: &DatabaseConnection, ok: bool, duration: StdDuration, detail: &str) -> Result<(), DbErr> {
    let now = OffsetDateTime::now_utc();
    let truncated = if detail.len() > 2000 { &detail[..2000] } else { detail };
    let existing = JobHeartbeats::find_by_id(JOB_NAME.to_string()).one(db).await?;
    let active = HeartbeatActive {
        job_name: sea_orm::ActiveValue::Set(JOB_NAME.to_string()),
        last_run_at: sea_orm::ActiveValue::Set(now),
        duration_ms: sea_orm::ActiveValue::Set(duration.as_millis() as i64),
        ok: sea_orm::ActiveValue::Set(ok),
        detail: sea_orm::ActiveValue::Set(truncated.to_string()),
    };
    if existing.is_some() {
        JobHeartbeats::update(active).exec(db).await?;
    } else {
        JobHeartbeats::insert(active).exec(db).await?;
    }
    Ok(())
}

/// Records a run that never got as far as deleting anything. Losing the
/// leader lock race is not an error (another node owns the run), but a
/// schedule-parse failure or a connection error is.
pub async fn heartbeat_error(db: &DatabaseConnection, duration: StdDuration, message: &str) {
    if let Err(err) = heartbeat(db, false, duration, message).await {
        error!(error = %err, "failed to write cleanup error heartbeat");
    }
}

/// Parses the cron expression and reports the delay until its next firing,
/// so the caller's scheduling loop can sleep until then rather than busy
/// polling.
pub fn next_fire_delay(cron_expr: &str, after: OffsetDateTime) -> Result<StdDuration, String> {
    let schedule = Schedule::from_str(cron_expr).map_err(|err| err.to_string())?;
    let chrono_after = chrono_like_from_offset(after);
    let next = schedule
        .after(&chrono_after)
        .next()
        .ok_or_else(|| "cron schedule has no future occurrence".to_string())?;
    let delay_secs = (next - chrono_after).num_seconds().max(0) as u64;
    Ok(StdDuration::from_secs(delay_secs))
}

/// `cron`'s `Schedule` is built on `chrono::DateTime<Utc>`; the rest of this
/// workspace standardizes on `time::OffsetDateTime` (spec §3's persisted
/// timestamps), so this is the one narrow conversion point between the two.
fn chrono_like_from_offset(at: OffsetDateTime) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(at.unix_timestamp(), at.nanosecond()).unwrap_or_else(chrono::Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_targets_carry_each_configured_window() {
        let days = RetentionDays::default();
        let targets = retention_targets(&days);
        assert_eq!(targets.len(), 6);
        assert!(targets.iter().any(|t| t.table == "upstream_error_log" && t.retention_days == days.error_log));
    }

    #[test]
    fn next_fire_delay_rejects_an_unparseable_expression() {
        assert!(next_fire_delay("not a cron expr", OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn next_fire_delay_resolves_for_the_default_cron() {
        let delay = next_fire_delay("0 0 2 * * *", OffsetDateTime::now_utc()).unwrap();
        assert!(delay <= StdDuration::from_secs(86_400));
    }
}
