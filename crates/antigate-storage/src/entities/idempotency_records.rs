//! §3 "Idempotency Record" and §4.D3: one row per `(scope, key_hash)`. The
//! well-known system-operation lock (§4.D3) is just a row in this same
//! table at a fixed `scope`/`key_hash`.
//!
//! Grounded on `gproxy-storage::entities::credential_disallow`'s
//! composite-unique-key shape.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "idempotency_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "scope_key")]
    pub scope: String,
    #[sea_orm(unique_key = "scope_key")]
    pub key_hash: String,
    pub request_fingerprint: String,
    /// One of `processing` / `succeeded` / `failed_retryable`.
    pub status: String,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub error_reason: Option<String>,
    pub locked_until: Option<OffsetDateTime>,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
