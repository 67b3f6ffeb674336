//! Operations that queue commands toward an approved, active agent: update
//! checks, diagnostics collection, firewall control, host accounts, and
//! child host lifecycle.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use sysmanage_core::audit::AuditContext;
use sysmanage_core::queue::EnqueueParams;
use sysmanage_core::rbac::SecurityRole;
use sysmanage_db::children as children_repo;
use sysmanage_db::children::NewHostChild;
use sysmanage_db::diagnostics as diag_repo;
use sysmanage_db::hosts as hosts_repo;
use sysmanage_db::models::{
    ApprovalStatus, AuditResult, ChildStatus, Host, QueuePriority,
};

use crate::commands::create_command_message;
use crate::error::ApiError;
use crate::services::{Actor, load_actor};
use crate::state::AppContext;

/// Assert the target host can receive commands: approved and active.
fn require_approved(host: &Host) -> Result<(), ApiError> {
    if host.approval_status != ApprovalStatus::Approved {
        return Err(ApiError::Conflict(format!(
            "host '{}' is not approved",
            host.fqdn
        )));
    }
    if !host.active {
        return Err(ApiError::Conflict(format!(
            "host '{}' is not active",
            host.fqdn
        )));
    }
    Ok(())
}

async fn enqueue_command(
    ctx: &AppContext,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    actor: &Actor,
    host: &Host,
    command_type: &str,
    parameters: serde_json::Value,
    priority: QueuePriority,
) -> Result<String, ApiError> {
    let cmd = create_command_message(command_type, parameters.clone());
    ctx.queue
        .enqueue_in(
            &mut *tx,
            EnqueueParams::outbound(host.id, "command", cmd.payload)
                .with_priority(priority)
                .with_correlation(&cmd.message_id),
        )
        .await?;

    ctx.audit
        .log_agent_message(
            &mut *tx,
            &host.fqdn,
            command_type,
            &format!("Queued '{command_type}' command for host '{}'", host.fqdn),
            AuditResult::Pending,
            AuditContext {
                entity_id: Some(host.id.to_string()),
                details: Some(json!({"parameters": parameters})),
                ..actor.audit_context()
            },
        )
        .await?;

    Ok(cmd.message_id)
}

/// Generic single-command operation: authenticate, assert the role, queue
/// the command, audit, commit, wake the drainer.
async fn queue_single_command(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    role: SecurityRole,
    command_type: &str,
    parameters: serde_json::Value,
    priority: QueuePriority,
) -> Result<String, ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(role)?;

    let host = hosts_repo::get_host(&mut tx, host_id).await?;
    require_approved(&host)?;

    let message_id = enqueue_command(
        ctx,
        &mut tx,
        &actor,
        &host,
        command_type,
        parameters,
        priority,
    )
    .await?;

    tx.commit().await?;
    ctx.notifier.notify(host_id).await;
    Ok(message_id)
}

/// Ask the agent to refresh its OS version facts.
///
/// # Errors
///
/// Propagates RBAC, not-found, and wrong-state errors.
pub async fn request_os_version_update(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
) -> Result<String, ApiError> {
    queue_single_command(
        ctx,
        current_user,
        host_id,
        SecurityRole::ApplySoftwareUpdate,
        "update_os_version",
        json!({}),
        QueuePriority::Normal,
    )
    .await
}

/// Ask the agent to check for available package updates.
///
/// # Errors
///
/// Propagates RBAC, not-found, and wrong-state errors.
pub async fn request_updates_check(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
) -> Result<String, ApiError> {
    queue_single_command(
        ctx,
        current_user,
        host_id,
        SecurityRole::ApplySoftwareUpdate,
        "check_updates",
        json!({}),
        QueuePriority::Normal,
    )
    .await
}

/// Ask the agent to apply the named updates.
///
/// # Errors
///
/// Propagates RBAC, not-found, and wrong-state errors.
pub async fn apply_updates(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    package_names: Vec<String>,
) -> Result<String, ApiError> {
    if package_names.is_empty() {
        return Err(ApiError::InvalidInput("no packages named".to_owned()));
    }
    queue_single_command(
        ctx,
        current_user,
        host_id,
        SecurityRole::ApplySoftwareUpdate,
        "apply_updates",
        json!({"package_names": package_names}),
        QueuePriority::High,
    )
    .await
}

/// Request a diagnostics collection: creates the report row, marks the host,
/// and queues `collect_diagnostics` carrying the collection id the agent
/// must echo back.
///
/// # Errors
///
/// Propagates RBAC, not-found, and wrong-state errors.
pub async fn request_diagnostics(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
) -> Result<Uuid, ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::RequestDiagnostics)?;

    let host = hosts_repo::get_host(&mut tx, host_id).await?;
    require_approved(&host)?;

    let collection_id = Uuid::new_v4();
    diag_repo::insert_report(&mut tx, host_id, collection_id).await?;
    hosts_repo::set_diagnostics_request_status(&mut tx, host_id, Some("pending"), Utc::now())
        .await?;

    enqueue_command(
        ctx,
        &mut tx,
        &actor,
        &host,
        "collect_diagnostics",
        json!({"collection_id": collection_id}),
        QueuePriority::Normal,
    )
    .await?;

    tx.commit().await?;
    ctx.notifier.notify(host_id).await;
    Ok(collection_id)
}

/// Firewall control: `enable_firewall` / `disable_firewall` /
/// `restart_firewall` at HIGH priority under `ENABLE_FIREWALL`.
///
/// # Errors
///
/// Returns [`ApiError::InvalidInput`] for an unknown operation.
pub async fn firewall_control(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    operation: &str,
) -> Result<String, ApiError> {
    let command_type = match operation {
        "enable" => "enable_firewall",
        "disable" => "disable_firewall",
        "restart" => "restart_firewall",
        other => {
            return Err(ApiError::InvalidInput(format!(
                "unknown firewall operation '{other}'"
            )));
        }
    };
    queue_single_command(
        ctx,
        current_user,
        host_id,
        SecurityRole::EnableFirewall,
        command_type,
        json!({}),
        QueuePriority::High,
    )
    .await
}

/// Push a full firewall ruleset to the host under `DEPLOY_FIREWALL`.
///
/// # Errors
///
/// Propagates RBAC, not-found, and wrong-state errors.
pub async fn deploy_firewall(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    ruleset: serde_json::Value,
) -> Result<String, ApiError> {
    queue_single_command(
        ctx,
        current_user,
        host_id,
        SecurityRole::DeployFirewall,
        "deploy_firewall",
        json!({"ruleset": ruleset}),
        QueuePriority::High,
    )
    .await
}

/// Remove third-party repositories from a host under
/// `REMOVE_DEFAULT_REPOSITORY`.
///
/// # Errors
///
/// Propagates RBAC, not-found, and wrong-state errors.
pub async fn remove_third_party_repositories(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    repository_urls: Vec<String>,
) -> Result<String, ApiError> {
    if repository_urls.is_empty() {
        return Err(ApiError::InvalidInput("no repositories named".to_owned()));
    }
    queue_single_command(
        ctx,
        current_user,
        host_id,
        SecurityRole::RemoveDefaultRepository,
        "delete_third_party_repositories",
        json!({"repositories": repository_urls}),
        QueuePriority::Normal,
    )
    .await
}

/// Create an account on the managed host under `ADD_HOST_ACCOUNT`.
///
/// # Errors
///
/// Propagates RBAC, not-found, and wrong-state errors.
pub async fn create_host_user(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    username: &str,
    groups: Vec<String>,
) -> Result<String, ApiError> {
    if username.trim().is_empty() {
        return Err(ApiError::InvalidInput("username is required".to_owned()));
    }
    queue_single_command(
        ctx,
        current_user,
        host_id,
        SecurityRole::AddHostAccount,
        "create_host_user",
        json!({"username": username, "groups": groups}),
        QueuePriority::Normal,
    )
    .await
}

/// Delete an account on the managed host under `DELETE_HOST_ACCOUNT`.
///
/// # Errors
///
/// Propagates RBAC, not-found, and wrong-state errors.
pub async fn delete_host_user(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    username: &str,
) -> Result<String, ApiError> {
    queue_single_command(
        ctx,
        current_user,
        host_id,
        SecurityRole::DeleteHostAccount,
        "delete_host_user",
        json!({"username": username}),
        QueuePriority::Normal,
    )
    .await
}

/// Create a group on the managed host under `ADD_HOST_ACCOUNT`.
///
/// # Errors
///
/// Propagates RBAC, not-found, and wrong-state errors.
pub async fn create_host_group(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    group_name: &str,
) -> Result<String, ApiError> {
    queue_single_command(
        ctx,
        current_user,
        host_id,
        SecurityRole::AddHostAccount,
        "create_host_group",
        json!({"group_name": group_name}),
        QueuePriority::Normal,
    )
    .await
}

/// Delete a group on the managed host under `DELETE_HOST_ACCOUNT`.
///
/// # Errors
///
/// Propagates RBAC, not-found, and wrong-state errors.
pub async fn delete_host_group(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    group_name: &str,
) -> Result<String, ApiError> {
    queue_single_command(
        ctx,
        current_user,
        host_id,
        SecurityRole::DeleteHostAccount,
        "delete_host_group",
        json!({"group_name": group_name}),
        QueuePriority::Normal,
    )
    .await
}

/// Create a nested child instance: insert the `creating` placeholder row,
/// then queue the creation command. The placeholder survives list updates
/// until the agent reports the instance.
///
/// # Errors
///
/// Returns [`ApiError::Conflict`] when a child with the same name and type
/// already exists.
pub async fn create_child_host(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    child_name: String,
    child_type: String,
    parameters: serde_json::Value,
) -> Result<String, ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::ManageChildHosts)?;

    let host = hosts_repo::get_host(&mut tx, host_id).await?;
    require_approved(&host)?;

    if children_repo::find_child(&mut tx, host_id, &child_name, &child_type)
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict(format!(
            "child '{child_name}' ({child_type}) already exists"
        )));
    }

    children_repo::insert_child(
        &mut tx,
        &NewHostChild {
            parent_host_id: host_id,
            child_name: child_name.clone(),
            child_type: child_type.clone(),
            status: ChildStatus::Creating,
            hostname: None,
            distribution: None,
            distribution_version: None,
            wsl_guid: None,
        },
        Utc::now(),
    )
    .await?;

    let mut params = parameters;
    if let Some(obj) = params.as_object_mut() {
        obj.insert("child_name".to_owned(), json!(child_name));
        obj.insert("child_type".to_owned(), json!(child_type));
    }

    let message_id = enqueue_command(
        ctx,
        &mut tx,
        &actor,
        &host,
        "create_child_host",
        params,
        QueuePriority::Normal,
    )
    .await?;

    tx.commit().await?;
    ctx.notifier.notify(host_id).await;
    Ok(message_id)
}

/// Child host control: start / stop / restart / delete. Delete transitions
/// the row to `uninstalling` and pins the instance GUID so the agent can
/// refuse a stale delete.
///
/// # Errors
///
/// Returns [`ApiError::InvalidInput`] for an unknown operation,
/// [`ApiError::NotFound`] for an unknown child.
pub async fn control_child_host(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
    child_name: &str,
    child_type: &str,
    operation: &str,
) -> Result<String, ApiError> {
    let command_type = match operation {
        "start" => "start_child_host",
        "stop" => "stop_child_host",
        "restart" => "restart_child_host",
        "delete" => "delete_child_host",
        other => {
            return Err(ApiError::InvalidInput(format!(
                "unknown child host operation '{other}'"
            )));
        }
    };

    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::ManageChildHosts)?;

    let host = hosts_repo::get_host(&mut tx, host_id).await?;
    require_approved(&host)?;

    let child = children_repo::find_child(&mut tx, host_id, child_name, child_type)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!("child '{child_name}' ({child_type}) not found"))
        })?;

    let mut parameters = json!({
        "child_name": child_name,
        "child_type": child_type,
    });
    if operation == "delete" {
        children_repo::set_status(&mut tx, child.id, ChildStatus::Uninstalling, None, Utc::now())
            .await?;
        if let Some(obj) = parameters.as_object_mut() {
            obj.insert("expected_guid".to_owned(), json!(child.wsl_guid));
        }
    }

    let message_id = enqueue_command(
        ctx,
        &mut tx,
        &actor,
        &host,
        command_type,
        parameters,
        QueuePriority::Normal,
    )
    .await?;

    tx.commit().await?;
    ctx.notifier.notify(host_id).await;
    Ok(message_id)
}
