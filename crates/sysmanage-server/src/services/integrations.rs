//! Grafana/Graylog integration settings.
//!
//! Downstream sinks are external collaborators; this surface only stores
//! their coordinates and verifies reachability with a bounded health ping.

use std::time::Duration;

use sysmanage_core::audit::{AuditContext, EntityType};
use sysmanage_core::rbac::SecurityRole;
use sysmanage_db::integrations as integrations_repo;
use sysmanage_db::models::IntegrationSettings;

use crate::error::ApiError;
use crate::services::load_actor;
use crate::state::AppContext;

/// Health ping budget for Grafana/Graylog.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

fn role_for(integration: &str) -> Result<SecurityRole, ApiError> {
    match integration {
        "grafana" => Ok(SecurityRole::EnableGrafanaIntegration),
        "graylog" => Ok(SecurityRole::EnableGraylogIntegration),
        other => Err(ApiError::InvalidInput(format!(
            "unknown integration '{other}'"
        ))),
    }
}

/// Enable or update an integration, verifying the sink answers its health
/// endpoint first.
///
/// # Errors
///
/// Returns [`ApiError::DependencyFailed`] when the health ping fails,
/// plus the usual RBAC/validation errors.
pub async fn configure_integration(
    ctx: &AppContext,
    current_user: &str,
    integration: &str,
    enabled: bool,
    url: Option<&str>,
    vault_token_path: Option<&str>,
) -> Result<IntegrationSettings, ApiError> {
    let role = role_for(integration)?;

    if enabled {
        let Some(url) = url else {
            return Err(ApiError::InvalidInput(
                "url is required to enable an integration".to_owned(),
            ));
        };
        health_ping(integration, url).await?;
    }

    let mut tx = ctx.pool.begin().await?;
    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(role)?;

    let settings = integrations_repo::upsert_settings(
        &mut tx,
        integration,
        enabled,
        url,
        vault_token_path,
        chrono::Utc::now(),
    )
    .await?;

    ctx.audit
        .log_update(
            &mut tx,
            EntityType::Setting,
            integration,
            AuditContext {
                entity_id: Some(settings.id.to_string()),
                details: Some(serde_json::json!({"enabled": enabled, "url": url})),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(settings)
}

/// Current settings for an integration.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] when the integration was never
/// configured.
pub async fn get_integration(
    ctx: &AppContext,
    current_user: &str,
    integration: &str,
) -> Result<IntegrationSettings, ApiError> {
    role_for(integration)?;

    let mut tx = ctx.pool.begin().await?;
    load_actor(&mut tx, current_user, None, None).await?;
    let settings = integrations_repo::get_settings(&mut tx, integration)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("integration '{integration}' not configured")))?;
    tx.commit().await?;
    Ok(settings)
}

async fn health_ping(integration: &str, url: &str) -> Result<(), ApiError> {
    let health_url = match integration {
        "grafana" => format!("{}/api/health", url.trim_end_matches('/')),
        _ => format!("{}/api/system/lbstatus", url.trim_end_matches('/')),
    };

    let client = reqwest::Client::builder()
        .timeout(HEALTH_TIMEOUT)
        .build()
        .map_err(|e| ApiError::DependencyFailed(e.to_string()))?;

    let response = client
        .get(&health_url)
        .send()
        .await
        .map_err(|e| ApiError::DependencyFailed(format!("{integration} unreachable: {e}")))?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(ApiError::DependencyFailed(format!(
            "{integration} health check returned {}",
            response.status()
        )))
    }
}
