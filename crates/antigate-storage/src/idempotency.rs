//! Idempotency & System-Operation Lock coordinator (spec §4.D3).
//!
//! Wraps a business executor under `(scope, key, fingerprint)` so retried
//! admin mutations replay their first outcome instead of running twice. The
//! system-operation lock (§4.D3 "System-operation lock") is this same
//! coordinator invoked at one fixed `(scope, key)` pair, where `fingerprint`
//! doubles as the current operation id.
//!
//! Grounded on `gproxy-storage::seaorm`'s find-then-insert/update style
//! (`entities::Providers`, `entities::Credentials` claim pattern); the
//! claim/reclaim state machine itself is new since gproxy has no
//! idempotency concept of its own.

use std::future::Future;
use std::time::Duration;

use sea_orm::{ActiveModelTrait, ActiveValue, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use time::OffsetDateTime;

use crate::entities::idempotency_records::{ActiveModel, Column, Entity, Model};

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("key conflict: scope={scope} key_hash={key_hash} has a different request fingerprint")]
    KeyConflict { scope: String, key_hash: String },
    #[error("operation is already in progress, retry after {retry_after_ms}ms (operation_id={operation_id})")]
    InProgress { operation_id: String, retry_after_ms: u64 },
    #[error("operation recently failed, retry after {retry_after_ms}ms")]
    RetryBackoff { retry_after_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: i32,
    pub body: Option<String>,
}

/// Outcome of [`IdempotencyCoordinator::claim`]: either this caller now
/// owns the `processing` row and should run its executor, or an existing
/// live `succeeded` row should be replayed verbatim (spec §8 P5).
enum ClaimOutcome {
    Owned,
    Replay(StoredResponse),
}

#[derive(Debug, Clone)]
pub struct IdempotencyPolicy {
    /// How long a `processing` lease lives before it is reclaimable.
    pub processing_timeout: Duration,
    /// How long a successful response is replayed for.
    pub ttl: Duration,
    /// How long a `failed_retryable` row blocks retries before reclaim.
    pub failed_retry_backoff: Duration,
    /// Cap on the serialized response body persisted alongside `succeeded`.
    pub max_response_body_bytes: usize,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(60),
            ttl: Duration::from_secs(24 * 3600),
            failed_retry_backoff: Duration::from_secs(30),
            max_response_body_bytes: 64 * 1024,
        }
    }
}

/// `fingerprint(method, route, actor, payload)` from spec §4.D3's coordinator
/// contract: a stable digest of everything that must match for a retry to be
/// considered "the same request".
pub fn fingerprint(method: &str, route: &str, actor: &str, payload: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\0");
    hasher.update(route.as_bytes());
    hasher.update(b"\0");
    hasher.update(actor.as_bytes());
    hasher.update(b"\0");
    hasher.update(payload);
    hasher.finalize().to_hex().to_string()
}

pub struct IdempotencyCoordinator {
    db: DatabaseConnection,
    policy: IdempotencyPolicy,
}

impl IdempotencyCoordinator {
    pub fn new(db: DatabaseConnection, policy: IdempotencyPolicy) -> Self {
        Self { db, policy }
    }

    /// Runs `op` under `(scope, key_hash, fingerprint)`. A live `succeeded`
    /// row is replayed directly without invoking `op` at all (spec §8 P5:
    /// the executor runs at most once to success); only a fresh or
    /// reclaimed claim actually runs it.
    pub async fn run<F, Fut>(
        &self,
        scope: &str,
        key_hash: &str,
        request_fingerprint: &str,
        op: F,
    ) -> Result<StoredResponse, IdempotencyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse, String>>,
    {
        if let ClaimOutcome::Replay(response) = self.claim(scope, key_hash, request_fingerprint).await? {
            return Ok(response);
        }

        match op().await {
            Ok(response) => {
                self.finalize_success(scope, key_hash, &response).await?;
                Ok(response)
            }
            Err(reason) => {
                self.finalize_failure(scope, key_hash, &reason).await?;
                Err(IdempotencyError::RetryBackoff {
                    retry_after_ms: self.policy.failed_retry_backoff.as_millis() as u64,
                })
            }
        }
    }

    /// Implements the claim algorithm of spec §4.D3 verbatim: insert if
    /// absent; if present, compare fingerprint, replay a live `succeeded`
    /// row, or reclaim an expired/stale lease.
    async fn claim(
        &self,
        scope: &str,
        key_hash: &str,
        request_fingerprint: &str,
    ) -> Result<ClaimOutcome, IdempotencyError> {
        let now = OffsetDateTime::now_utc();
        let existing = Entity::find()
            .filter(Column::Scope.eq(scope))
            .filter(Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?;

        let Some(row) = existing else {
            let active = ActiveModel {
                id: ActiveValue::NotSet,
                scope: ActiveValue::Set(scope.to_string()),
                key_hash: ActiveValue::Set(key_hash.to_string()),
                request_fingerprint: ActiveValue::Set(request_fingerprint.to_string()),
                status: ActiveValue::Set("processing".to_string()),
                response_status: ActiveValue::Set(None),
                response_body: ActiveValue::Set(None),
                error_reason: ActiveValue::Set(None),
                locked_until: ActiveValue::Set(Some(now + self.policy.processing_timeout)),
                expires_at: ActiveValue::Set(now + self.policy.ttl),
                created_at: ActiveValue::Set(now),
                updated_at: ActiveValue::Set(now),
            };
            // A concurrent insert racing us on the same (scope, key_hash)
            // trips the table's unique index; we treat that as "someone
            // else claimed it first" and fall through to read their row.
            if Entity::insert(active).exec(&self.db).await.is_ok() {
                return Ok(ClaimOutcome::Owned);
            }
            let row = Entity::find()
                .filter(Column::Scope.eq(scope))
                .filter(Column::KeyHash.eq(key_hash))
                .one(&self.db)
                .await?
                .ok_or_else(|| IdempotencyError::Db(sea_orm::DbErr::RecordNotFound("idempotency row vanished".into())))?;
            return self.resolve_existing(row, scope, key_hash, request_fingerprint, now).await;
        };

        self.resolve_existing(row, scope, key_hash, request_fingerprint, now).await
    }

    async fn resolve_existing(
        &self,
        row: Model,
        scope: &str,
        key_hash: &str,
        request_fingerprint: &str,
        now: OffsetDateTime,
    ) -> Result<ClaimOutcome, IdempotencyError> {
        if row.request_fingerprint != request_fingerprint {
            return Err(IdempotencyError::KeyConflict {
                scope: scope.to_string(),
                key_hash: key_hash.to_string(),
            });
        }

        let expired = row.expires_at <= now;
        match row.status.as_str() {
            "succeeded" if !expired => Ok(ClaimOutcome::Replay(StoredResponse {
                status: row.response_status.unwrap_or(200),
                body: row.response_body,
            })),
            "processing" => {
                let live = row.locked_until.is_some_and(|until| until > now);
                if live {
                    return Err(IdempotencyError::InProgress {
                        operation_id: row.request_fingerprint,
                        retry_after_ms: row
                            .locked_until
                            .map(|until| (until - now).whole_milliseconds().max(0) as u64)
                            .unwrap_or(0),
                    });
                }
                self.reclaim(row.id, now).await.map(|()| ClaimOutcome::Owned)
            }
            "failed_retryable" => {
                let live = row.locked_until.is_some_and(|until| until > now);
                if live {
                    return Err(IdempotencyError::RetryBackoff {
                        retry_after_ms: row
                            .locked_until
                            .map(|until| (until - now).whole_milliseconds().max(0) as u64)
                            .unwrap_or(0),
                    });
                }
                self.reclaim(row.id, now).await.map(|()| ClaimOutcome::Owned)
            }
            _ => self.reclaim(row.id, now).await.map(|()| ClaimOutcome::Owned),
        }
    }

    async fn reclaim(&self, id: i64, now: OffsetDateTime) -> Result<(), IdempotencyError> {
        let Some(row) = Entity::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: ActiveModel = row.into();
        active.status = ActiveValue::Set("processing".to_string());
        active.locked_until = ActiveValue::Set(Some(now + self.policy.processing_timeout));
        active.updated_at = ActiveValue::Set(now);
        active.update(&self.db).await?;
        Ok(())
    }

    /// Extends the processing lease; called by a background loop at half
    /// the processing-timeout interval while the caller still owns the row.
    pub async fn renew_lease(&self, scope: &str, key_hash: &str) -> Result<(), IdempotencyError> {
        let now = OffsetDateTime::now_utc();
        let Some(row) = Entity::find()
            .filter(Column::Scope.eq(scope))
            .filter(Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };
        let mut active: ActiveModel = row.into();
        active.locked_until = ActiveValue::Set(Some(now + self.policy.processing_timeout));
        active.updated_at = ActiveValue::Set(now);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn finalize_success(
        &self,
        scope: &str,
        key_hash: &str,
        response: &StoredResponse,
    ) -> Result<(), IdempotencyError> {
        let now = OffsetDateTime::now_utc();
        let Some(row) = Entity::find()
            .filter(Column::Scope.eq(scope))
            .filter(Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };
        let body = response.body.as_ref().map(|body| {
            if body.len() > self.policy.max_response_body_bytes {
                body[..self.policy.max_response_body_bytes].to_string()
            } else {
                body.clone()
            }
        });
        let mut active: ActiveModel = row.into();
        active.status = ActiveValue::Set("succeeded".to_string());
        active.response_status = ActiveValue::Set(Some(response.status));
        active.response_body = ActiveValue::Set(body);
        active.error_reason = ActiveValue::Set(None);
        active.locked_until = ActiveValue::Set(None);
        active.expires_at = ActiveValue::Set(now + self.policy.ttl);
        active.updated_at = ActiveValue::Set(now);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn finalize_failure(&self, scope: &str, key_hash: &str, reason: &str) -> Result<(), IdempotencyError> {
        let now = OffsetDateTime::now_utc();
        let Some(row) = Entity::find()
            .filter(Column::Scope.eq(scope))
            .filter(Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };
        let mut active: ActiveModel = row.into();
        active.status = ActiveValue::Set("failed_retryable".to_string());
        active.error_reason = ActiveValue::Set(Some(reason.to_string()));
        active.locked_until = ActiveValue::Set(Some(now + self.policy.failed_retry_backoff));
        active.updated_at = ActiveValue::Set(now);
        active.update(&self.db).await?;
        Ok(())
    }

    /// Returns the stored response for a row already `succeeded`, so the
    /// caller can replay it without invoking `run` at all. Returns `Ok(None)`
    /// when there is nothing to replay (no row, or not yet succeeded).
    pub async fn load_response(
        &self,
        scope: &str,
        key_hash: &str,
        request_fingerprint: &str,
    ) -> Result<Option<StoredResponse>, IdempotencyError> {
        let now = OffsetDateTime::now_utc();
        let Some(row) = Entity::find()
            .filter(Column::Scope.eq(scope))
            .filter(Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        if row.request_fingerprint != request_fingerprint {
            return Err(IdempotencyError::KeyConflict {
                scope: scope.to_string(),
                key_hash: key_hash.to_string(),
            });
        }
        if row.status == "succeeded" && row.expires_at > now {
            return Ok(Some(StoredResponse {
                status: row.response_status.unwrap_or(200),
                body: row.response_body,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_sensitive_to_payload() {
        let a = fingerprint("POST", "/admin/grant", "user-1", b"{\"amount\":1}");
        let b = fingerprint("POST", "/admin/grant", "user-1", b"{\"amount\":1}");
        let c = fingerprint("POST", "/admin/grant", "user-1", b"{\"amount\":2}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
