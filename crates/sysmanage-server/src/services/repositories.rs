//! Default repository and antivirus-default administration.

use serde_json::json;
use uuid::Uuid;

use sysmanage_core::audit::{AuditContext, EntityType};
use sysmanage_core::rbac::SecurityRole;
use sysmanage_db::defaults as defaults_repo;
use sysmanage_db::models::{AntivirusDefault, DefaultRepository};

use crate::error::ApiError;
use crate::services::load_actor;
use crate::state::AppContext;

/// List default repositories under `VIEW_DEFAULT_REPOSITORIES`.
///
/// # Errors
///
/// Returns [`ApiError::PermissionDenied`] without the role.
pub async fn list_default_repositories(
    ctx: &AppContext,
    current_user: &str,
) -> Result<Vec<DefaultRepository>, ApiError> {
    let mut tx = ctx.pool.begin().await?;
    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::ViewDefaultRepositories)?;
    let repos = defaults_repo::list_default_repositories(&mut tx).await?;
    tx.commit().await?;
    Ok(repos)
}

/// Add a default repository under `ADD_DEFAULT_REPOSITORY`.
///
/// # Errors
///
/// Returns [`ApiError::Conflict`] for a duplicate triple.
pub async fn add_default_repository(
    ctx: &AppContext,
    current_user: &str,
    os_name: &str,
    package_manager: &str,
    repository_url: &str,
) -> Result<DefaultRepository, ApiError> {
    if os_name.trim().is_empty() || repository_url.trim().is_empty() {
        return Err(ApiError::InvalidInput(
            "os_name and repository_url are required".to_owned(),
        ));
    }

    let mut tx = ctx.pool.begin().await?;
    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::AddDefaultRepository)?;

    let repo = defaults_repo::create_default_repository(
        &mut tx,
        os_name,
        package_manager,
        repository_url,
        Some(actor.user_id),
    )
    .await?;

    ctx.audit
        .log_create(
            &mut tx,
            EntityType::Repository,
            &repo.repository_url,
            AuditContext {
                entity_id: Some(repo.id.to_string()),
                details: Some(json!({
                    "os_name": repo.os_name,
                    "package_manager": repo.package_manager,
                })),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(repo)
}

/// Remove a default repository under `REMOVE_DEFAULT_REPOSITORY`.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] for an unknown row.
pub async fn remove_default_repository(
    ctx: &AppContext,
    current_user: &str,
    repo_id: Uuid,
) -> Result<(), ApiError> {
    let mut tx = ctx.pool.begin().await?;
    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::RemoveDefaultRepository)?;

    let repos = defaults_repo::list_default_repositories(&mut tx).await?;
    let repo = repos
        .into_iter()
        .find(|r| r.id == repo_id)
        .ok_or_else(|| ApiError::NotFound("default repository not found".to_owned()))?;

    defaults_repo::delete_default_repository(&mut tx, repo_id).await?;

    ctx.audit
        .log_delete(
            &mut tx,
            EntityType::Repository,
            &repo.repository_url,
            AuditContext {
                entity_id: Some(repo.id.to_string()),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Set the antivirus default for an OS under `MANAGE_ANTIVIRUS_DEFAULTS`.
///
/// # Errors
///
/// Returns [`ApiError::PermissionDenied`] without the role.
pub async fn set_antivirus_default(
    ctx: &AppContext,
    current_user: &str,
    os_name: &str,
    antivirus_package: &str,
) -> Result<AntivirusDefault, ApiError> {
    let mut tx = ctx.pool.begin().await?;
    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::ManageAntivirusDefaults)?;

    let row = defaults_repo::upsert_antivirus_default(&mut tx, os_name, antivirus_package).await?;

    ctx.audit
        .log_update(
            &mut tx,
            EntityType::Antivirus,
            os_name,
            AuditContext {
                entity_id: Some(row.id.to_string()),
                details: Some(json!({"antivirus_package": antivirus_package})),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(row)
}
