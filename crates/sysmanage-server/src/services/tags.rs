//! Tag operations under `EDIT_TAGS`.

use uuid::Uuid;

use sysmanage_core::audit::{AuditContext, EntityType};
use sysmanage_core::rbac::SecurityRole;
use sysmanage_db::hosts as hosts_repo;
use sysmanage_db::models::Tag;
use sysmanage_db::tags as tags_repo;

use crate::error::ApiError;
use crate::services::load_actor;
use crate::state::AppContext;

/// Create a tag.
///
/// # Errors
///
/// Returns [`ApiError::Conflict`] for a duplicate name.
pub async fn create_tag(
    ctx: &AppContext,
    current_user: &str,
    name: &str,
    description: Option<&str>,
) -> Result<Tag, ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::InvalidInput("tag name is required".to_owned()));
    }

    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::EditTags)?;

    let tag = tags_repo::create_tag(&mut tx, name, description).await?;

    ctx.audit
        .log_create(
            &mut tx,
            EntityType::Tag,
            &tag.name,
            AuditContext {
                entity_id: Some(tag.id.to_string()),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(tag)
}

/// Rename a tag or change its description.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] / [`ApiError::Conflict`] as appropriate.
pub async fn update_tag(
    ctx: &AppContext,
    current_user: &str,
    tag_id: Uuid,
    name: &str,
    description: Option<&str>,
) -> Result<Tag, ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::EditTags)?;

    let tag = tags_repo::update_tag(&mut tx, tag_id, name, description).await?;

    ctx.audit
        .log_update(
            &mut tx,
            EntityType::Tag,
            &tag.name,
            AuditContext {
                entity_id: Some(tag.id.to_string()),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(tag)
}

/// Delete a tag; host associations cascade.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] for an unknown tag.
pub async fn delete_tag(
    ctx: &AppContext,
    current_user: &str,
    tag_id: Uuid,
) -> Result<(), ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::EditTags)?;

    let tag = tags_repo::get_tag(&mut tx, tag_id).await?;
    tags_repo::delete_tag(&mut tx, tag_id).await?;

    ctx.audit
        .log_delete(
            &mut tx,
            EntityType::Tag,
            &tag.name,
            AuditContext {
                entity_id: Some(tag.id.to_string()),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Attach a tag to a host.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] when either side is missing.
pub async fn attach_tag(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    tag_id: Uuid,
) -> Result<(), ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::EditTags)?;

    let host = hosts_repo::get_host(&mut tx, host_id).await?;
    let tag = tags_repo::get_tag(&mut tx, tag_id).await?;
    tags_repo::attach_tag(&mut tx, host_id, tag_id).await?;

    ctx.audit
        .log_update(
            &mut tx,
            EntityType::Host,
            &host.fqdn,
            AuditContext {
                entity_id: Some(host.id.to_string()),
                details: Some(serde_json::json!({"tag_attached": tag.name})),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Detach a tag from a host.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] when either side is missing.
pub async fn detach_tag(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    tag_id: Uuid,
) -> Result<(), ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::EditTags)?;

    let host = hosts_repo::get_host(&mut tx, host_id).await?;
    let tag = tags_repo::get_tag(&mut tx, tag_id).await?;
    tags_repo::detach_tag(&mut tx, host_id, tag_id).await?;

    ctx.audit
        .log_update(
            &mut tx,
            EntityType::Host,
            &host.fqdn,
            AuditContext {
                entity_id: Some(host.id.to_string()),
                details: Some(serde_json::json!({"tag_detached": tag.name})),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(())
}
