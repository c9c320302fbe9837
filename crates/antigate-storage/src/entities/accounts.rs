//! Persisted row backing §3 "Account". Admin CRUD over this table is out of
//! scope (spec.md §1); this entity exists so the engine can load accounts at
//! startup and so token refresh (L3) has somewhere durable to write the
//! refreshed credential bag back to.
//!
//! Grounded on `gproxy-storage::entities::credentials`.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub label: String,
    pub platform: String,
    pub account_type: String,
    /// Opaque credential bag (§3: `access_token`, `refresh_token`,
    /// `session_token`, `expires_at`, `client_id`, `project_id`, `api_key`,
    /// `base_url`). Kept as a JSON blob rather than individual columns since
    /// the keys present vary by `account_type`.
    pub credential_json: Json,
    pub model_mapping_json: Json,
    pub weight: i32,
    pub concurrency_cap: i32,
    pub schedulable: bool,
    pub proxy_id: Option<i64>,
    pub expires_at: Option<OffsetDateTime>,
    pub rate_multiplier: Option<f64>,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
