//! Persisted form of the §3 "Upstream Error Event" journal (D2): the
//! in-memory `antigate_core::journal::RequestJournal` is truncated to the
//! most recent N entries per request and handed here for durable storage
//! once the request completes.
//!
//! Grounded on `gproxy-storage::entities::upstream_traffic`, trimmed to the
//! journal-entry shape this engine actually produces.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "upstream_error_log")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub at: OffsetDateTime,
    pub platform: String,
    pub account_id: Option<i64>,
    pub account_name: Option<String>,
    pub upstream_status: Option<i32>,
    pub upstream_request_id: Option<String>,
    pub kind: String,
    pub message: String,
    pub detail: Option<Json>,
    pub upstream_request_body: Option<String>,
}

impl ActiveModelBehavior for ActiveModel {}
