//! Vault-backed secret operations.
//!
//! Content goes to the external vault first; only on success does the
//! metadata row land in the database. Deletion runs the other way round —
//! the row is kept whenever the vault delete fails, so no vault content is
//! ever orphaned.

use uuid::Uuid;

use sysmanage_core::audit::{AuditContext, EntityType};
use sysmanage_core::rbac::SecurityRole;
use sysmanage_db::models::SecretRecord;
use sysmanage_db::secrets as secrets_repo;

use crate::error::ApiError;
use crate::services::load_actor;
use crate::state::AppContext;

/// Input for a new secret.
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub name: String,
    pub secret_type: String,
    pub secret_subtype: Option<String>,
    pub content: String,
}

fn vault_of(ctx: &AppContext) -> Result<&sysmanage_core::vault::VaultClient, ApiError> {
    ctx.vault
        .as_deref()
        .ok_or_else(|| ApiError::DependencyFailed("vault is not configured".to_owned()))
}

fn vault_token(ctx: &AppContext) -> Result<String, ApiError> {
    ctx.config
        .vault
        .token
        .clone()
        .ok_or_else(|| ApiError::DependencyFailed("vault token is not configured".to_owned()))
}

/// Create a secret: vault write, then the metadata row, then audit.
///
/// # Errors
///
/// Returns [`ApiError::DependencyFailed`] when the vault write fails — no
/// row is created in that case.
pub async fn create_secret(
    ctx: &AppContext,
    current_user: &str,
    input: NewSecret,
) -> Result<SecretRecord, ApiError> {
    if input.name.trim().is_empty() {
        return Err(ApiError::InvalidInput("secret name is required".to_owned()));
    }

    let vault = vault_of(ctx)?;
    let token = vault_token(ctx)?;
    let vault_path = format!("sysmanage/{}/{}", input.secret_type, input.name);

    let mut tx = ctx.pool.begin().await?;
    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::AddSecret)?;

    // Vault first: a failed write must not leave a dangling reference row.
    vault.store_secret(&vault_path, &token, &input.content).await?;

    let secret = secrets_repo::insert_secret(
        &mut tx,
        &input.name,
        &input.secret_type,
        input.secret_subtype.as_deref(),
        &token,
        &vault_path,
    )
    .await?;

    ctx.audit
        .log_create(
            &mut tx,
            EntityType::Secret,
            &secret.name,
            AuditContext {
                entity_id: Some(secret.id.to_string()),
                details: Some(serde_json::json!({"secret_type": secret.secret_type})),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(secret)
}

/// Fetch a secret's content from the vault.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] for an unknown row or missing vault
/// content, [`ApiError::DependencyFailed`] when the vault errs.
pub async fn read_secret_content(
    ctx: &AppContext,
    current_user: &str,
    secret_id: Uuid,
) -> Result<String, ApiError> {
    let vault = vault_of(ctx)?;

    let mut tx = ctx.pool.begin().await?;
    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::EditSecret)?;

    let secret = secrets_repo::get_secret(&mut tx, secret_id).await?;
    tx.commit().await?;

    let content = vault
        .retrieve_secret(&secret.vault_path, &secret.vault_token)
        .await?;
    Ok(content)
}

/// Delete a secret. The vault delete runs first; only when it succeeds is
/// the row removed.
///
/// # Errors
///
/// Returns [`ApiError::DependencyFailed`] when the vault delete fails — the
/// row is kept and the caller is informed.
pub async fn delete_secret(
    ctx: &AppContext,
    current_user: &str,
    secret_id: Uuid,
) -> Result<(), ApiError> {
    let vault = vault_of(ctx)?;

    let mut tx = ctx.pool.begin().await?;
    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::DeleteSecret)?;

    let secret = secrets_repo::get_secret(&mut tx, secret_id).await?;

    // Vault first. If this fails the transaction is dropped and the row
    // survives.
    vault
        .delete_secret(&secret.vault_path, &secret.vault_token)
        .await?;

    secrets_repo::delete_secret(&mut tx, secret_id).await?;

    ctx.audit
        .log_delete(
            &mut tx,
            EntityType::Secret,
            &secret.name,
            AuditContext {
                entity_id: Some(secret.id.to_string()),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(())
}

/// List secret metadata (never content).
///
/// # Errors
///
/// Returns [`ApiError::Unauthenticated`] for an unknown caller.
pub async fn list_secrets(
    ctx: &AppContext,
    current_user: &str,
) -> Result<Vec<SecretRecord>, ApiError> {
    let mut tx = ctx.pool.begin().await?;
    load_actor(&mut tx, current_user, None, None).await?;
    let secrets = secrets_repo::list_secrets(&mut tx).await?;
    tx.commit().await?;
    Ok(secrets)
}
