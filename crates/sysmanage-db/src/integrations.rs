//! Downstream integration settings (Grafana, Graylog). One singleton row
//! per integration naming its URL and the vault token reference used to
//! reach it.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::error::DbError;
use crate::models::IntegrationSettings;

/// The settings row for one integration, if configured.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn get_settings(
    conn: &mut PgConnection,
    integration: &str,
) -> Result<Option<IntegrationSettings>, DbError> {
    let settings = sqlx::query_as::<_, IntegrationSettings>(
        "SELECT * FROM integration_settings WHERE integration = $1",
    )
    .bind(integration)
    .fetch_optional(conn)
    .await?;

    Ok(settings)
}

/// Upsert the settings row for an integration.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn upsert_settings(
    conn: &mut PgConnection,
    integration: &str,
    enabled: bool,
    url: Option<&str>,
    vault_token_path: Option<&str>,
    now: DateTime<Utc>,
) -> Result<IntegrationSettings, DbError> {
    let settings = sqlx::query_as::<_, IntegrationSettings>(
        r"INSERT INTO integration_settings (integration, enabled, url, vault_token_path, updated_at)
          VALUES ($1, $2, $3, $4, $5)
          ON CONFLICT (integration) DO UPDATE
          SET enabled = EXCLUDED.enabled,
              url = EXCLUDED.url,
              vault_token_path = EXCLUDED.vault_token_path,
              updated_at = EXCLUDED.updated_at
          RETURNING *",
    )
    .bind(integration)
    .bind(enabled)
    .bind(url)
    .bind(vault_token_path)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(settings)
}
