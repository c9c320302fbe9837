//! Durable mirror of §3 "Rate-Limit Windows": one row per
//! `(account_id, model_key)` (`model_key = NULL` for an account-level
//! window). The in-memory `antigate-provider-core::AccountPool` is the
//! read path the retry loop actually selects against (spec §5: "runtime
//! reads must not hit DB"); this table exists so a restart doesn't forget
//! an in-flight rate limit and so the cleanup job (D1) has rows to retire.
//!
//! Grounded on `gproxy-storage::entities::credential_disallow`.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "rate_limit_windows")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "account_model")]
    pub account_id: i64,
    #[sea_orm(unique_key = "account_model")]
    pub model_key: Option<String>,
    pub reset_at: OffsetDateTime,
    pub reason: String,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
