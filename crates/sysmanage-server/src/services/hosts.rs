//! Host lifecycle operations: registration, approval, rejection, deletion.
//!
//! Approval is the pivotal transition — it issues the client certificate,
//! fans out the OS defaults (third-party repositories, enabled package
//! managers), and queues the `host_approved` notification that carries the
//! new credentials to the agent.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use sysmanage_core::audit::{AuditContext, EntityType};
use sysmanage_core::queue::EnqueueParams;
use sysmanage_core::rbac::SecurityRole;
use sysmanage_db::defaults as defaults_repo;
use sysmanage_db::hosts as hosts_repo;
use sysmanage_db::hosts::NewHost;
use sysmanage_db::models::{ApprovalStatus, Host};

use crate::commands::{create_command_message, create_host_approved_message};
use crate::error::ApiError;
use crate::services::load_actor;
use crate::state::AppContext;

/// Registration input from a newly installed agent.
#[derive(Debug, Clone)]
pub struct RegistrationInput {
    pub fqdn: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub platform: Option<String>,
    pub platform_release: Option<String>,
    pub is_agent_privileged: bool,
}

/// Register a host in `pending` state and mint its opaque host token.
///
/// # Errors
///
/// Returns [`ApiError::Conflict`] when the FQDN is already registered.
pub async fn register_host(ctx: &AppContext, input: RegistrationInput) -> Result<Host, ApiError> {
    if input.fqdn.is_empty() {
        return Err(ApiError::InvalidInput("fqdn is required".to_owned()));
    }

    let mut tx = ctx.pool.begin().await?;

    let host = hosts_repo::create_host(
        &mut tx,
        &NewHost {
            fqdn: input.fqdn,
            ipv4: input.ipv4,
            ipv6: input.ipv6,
            platform: input.platform,
            platform_release: input.platform_release,
            host_token: Uuid::new_v4().to_string(),
            is_agent_privileged: input.is_agent_privileged,
            parent_host_id: None,
        },
    )
    .await?;

    ctx.audit
        .log_create(
            &mut tx,
            EntityType::Host,
            &host.fqdn,
            AuditContext {
                entity_id: Some(host.id.to_string()),
                ..AuditContext::default()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(host)
}

/// Approve a pending host: issue its client certificate, apply OS defaults,
/// and notify the agent. Idempotent — approving an approved host is a
/// no-op.
///
/// # Errors
///
/// Returns [`ApiError::PermissionDenied`] without
/// `APPROVE_HOST_REGISTRATION`, [`ApiError::NotFound`] for an unknown host,
/// [`ApiError::Conflict`] for a rejected host.
pub async fn approve_host(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
) -> Result<Host, ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::ApproveHostRegistration)?;

    let host = hosts_repo::get_host_for_update(&mut tx, host_id).await?;
    match host.approval_status {
        ApprovalStatus::Approved => {
            // Re-approval is a no-op.
            tx.commit().await?;
            return Ok(host);
        }
        ApprovalStatus::Rejected => {
            return Err(ApiError::Conflict("host is not in pending status".to_owned()));
        }
        ApprovalStatus::Pending => {}
    }

    let issued = ctx.ca.issue_client_certificate(&host.fqdn, host.id)?;
    let now = Utc::now();
    let host = hosts_repo::store_approval(
        &mut tx,
        host_id,
        &issued.certificate_pem,
        &issued.serial,
        now,
    )
    .await?;

    // Fan out OS defaults. A missing platform release simply matches no
    // defaults; it does not fail the approval.
    if let Some(ref platform_release) = host.platform_release {
        let repos =
            defaults_repo::list_default_repositories_for_os(&mut tx, platform_release).await?;
        for repo in repos {
            let cmd = create_command_message(
                "add_third_party_repository",
                json!({
                    "repository": repo.repository_url,
                    "package_manager": repo.package_manager,
                    "os_name": repo.os_name,
                }),
            );
            ctx.queue
                .enqueue_in(
                    &mut tx,
                    EnqueueParams::outbound(host.id, "command", cmd.payload)
                        .with_correlation(&cmd.message_id),
                )
                .await?;
        }
    }

    if let Some(ref platform_release) = host.platform_release {
        let av_defaults =
            defaults_repo::list_antivirus_defaults_for_os(&mut tx, platform_release).await?;
        for av in av_defaults {
            let cmd = create_command_message(
                "deploy_antivirus",
                json!({
                    "antivirus_package": av.antivirus_package,
                    "os_name": av.os_name,
                }),
            );
            ctx.queue
                .enqueue_in(
                    &mut tx,
                    EnqueueParams::outbound(host.id, "command", cmd.payload)
                        .with_correlation(&cmd.message_id),
                )
                .await?;
        }
    }

    if host.is_agent_privileged {
        let distribution = host
            .os_details
            .as_ref()
            .and_then(|d| d.get("distribution"))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);
        if let Some(distribution) = distribution {
            let managers =
                defaults_repo::list_enabled_package_managers_for_os(&mut tx, &distribution).await?;
            for manager in managers {
                let cmd = create_command_message(
                    "enable_package_manager",
                    json!({
                        "package_manager": manager.package_manager,
                        "os_name": manager.os_name,
                    }),
                );
                ctx.queue
                    .enqueue_in(
                        &mut tx,
                        EnqueueParams::outbound(host.id, "command", cmd.payload)
                            .with_correlation(&cmd.message_id),
                    )
                    .await?;
            }
        }
    }

    ctx.audit
        .log_update(
            &mut tx,
            EntityType::Host,
            &host.fqdn,
            AuditContext {
                entity_id: Some(host.id.to_string()),
                details: Some(json!({
                    "approval_status": "approved",
                    "certificate_serial": issued.serial,
                })),
                ..actor.audit_context()
            },
        )
        .await?;

    // Notify the agent so it can transition to its authenticated state.
    let approval = create_host_approved_message(
        host.id,
        host.host_token.as_deref(),
        &issued.certificate_pem,
        &issued.private_key_pem,
        &issued.ca_certificate_pem,
    );
    ctx.queue
        .enqueue_in(
            &mut tx,
            EnqueueParams::outbound(host.id, "host_approved", approval.payload)
                .with_correlation(&approval.message_id),
        )
        .await?;

    tx.commit().await?;
    ctx.notifier.notify(host.id).await;

    Ok(host)
}

/// Reject a pending host. Terminal: a rejected host never receives a
/// certificate and its sessions are refused.
///
/// # Errors
///
/// Returns [`ApiError::Conflict`] when the host is not pending.
pub async fn reject_host(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
) -> Result<Host, ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::ApproveHostRegistration)?;

    let host = hosts_repo::get_host_for_update(&mut tx, host_id).await?;
    if host.approval_status != ApprovalStatus::Pending {
        return Err(ApiError::Conflict("host is not in pending status".to_owned()));
    }

    let host = hosts_repo::store_rejection(&mut tx, host_id, Utc::now()).await?;

    ctx.audit
        .log_update(
            &mut tx,
            EntityType::Host,
            &host.fqdn,
            AuditContext {
                entity_id: Some(host.id.to_string()),
                details: Some(json!({"approval_status": "rejected"})),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(host)
}

/// Delete a host and everything it owns (queue entries, children,
/// diagnostics, firewall snapshots cascade).
///
/// # Errors
///
/// Returns [`ApiError::PermissionDenied`] without `DELETE_HOST`.
pub async fn delete_host(
    ctx: &AppContext,
    current_user: &str,
    host_id: Uuid,
) -> Result<(), ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::DeleteHost)?;

    let host = hosts_repo::get_host(&mut tx, host_id).await?;
    hosts_repo::delete_host(&mut tx, host_id).await?;

    ctx.audit
        .log_delete(
            &mut tx,
            EntityType::Host,
            &host.fqdn,
            AuditContext {
                entity_id: Some(host.id.to_string()),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    ctx.notifier.forget(host_id).await;
    Ok(())
}

/// List all hosts.
///
/// # Errors
///
/// Returns [`ApiError::Unauthenticated`] for an unknown caller.
pub async fn list_hosts(ctx: &AppContext, current_user: &str) -> Result<Vec<Host>, ApiError> {
    let mut tx = ctx.pool.begin().await?;
    load_actor(&mut tx, current_user, None, None).await?;
    let hosts = hosts_repo::list_hosts(&mut tx).await?;
    tx.commit().await?;
    Ok(hosts)
}
