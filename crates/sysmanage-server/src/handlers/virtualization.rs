//! Virtualization capability handlers.
//!
//! Agents report which nested-virtualization backends they can drive (WSL,
//! KVM, LXD, bhyve/vmm). Enable/initialize results queue a fresh capability
//! check so the recorded support matrix converges on reality.

use chrono::Utc;
use serde_json::json;
use sqlx::PgConnection;

use sysmanage_core::audit::AuditContext;
use sysmanage_core::queue::EnqueueParams;
use sysmanage_db::hosts as hosts_repo;
use sysmanage_db::models::AuditResult;

use super::{AgentSession, Envelope, HandlerFuture};
use crate::commands::create_command_message;

/// Merge a `virtualization_support_update` into the host's OS details.
pub fn handle_support_update<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let data = message.data().clone();
        let now = Utc::now();

        let host = hosts_repo::get_host(conn, session.host_id).await?;
        let mut os_details = host
            .os_details
            .filter(serde_json::Value::is_object)
            .unwrap_or_else(|| json!({}));
        if let Some(obj) = os_details.as_object_mut() {
            obj.insert("virtualization_support".to_owned(), data.clone());
        }

        hosts_repo::update_inventory(
            conn,
            session.host_id,
            None,
            None,
            None,
            None,
            Some(&os_details),
            now,
        )
        .await?;

        session
            .ctx
            .audit
            .log_agent_message(
                conn,
                &session.fqdn,
                &message.message_type,
                "Virtualization support updated",
                AuditResult::Success,
                AuditContext {
                    entity_id: Some(session.host_id.to_string()),
                    ip_address: Some(session.client_ip.clone()),
                    details: Some(data),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": "virtualization_support_ack",
            "timestamp": now.to_rfc3339(),
        })))
    })
}

/// Handle a WSL/LXD/vmm enable or initialize result. Success queues a
/// follow-up `check_virtualization_support`; a failure demanding a reboot
/// flags the host.
pub fn handle_enable_result<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let success = message.success();
        let now = Utc::now();
        let reboot_required = message
            .result()
            .get("reboot_required")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        if success {
            let cmd = create_command_message("check_virtualization_support", json!({}));
            session
                .ctx
                .queue
                .enqueue_in(
                    conn,
                    EnqueueParams::outbound(session.host_id, "command", cmd.payload)
                        .with_correlation(&cmd.message_id),
                )
                .await?;
        } else if reboot_required {
            hosts_repo::set_reboot_required(
                conn,
                session.host_id,
                true,
                Some(&format!("{} requires reboot", message.message_type)),
                now,
            )
            .await?;
        }

        session
            .ctx
            .audit
            .log_agent_message(
                conn,
                &session.fqdn,
                &message.message_type,
                if success {
                    "Virtualization backend enabled"
                } else {
                    "Virtualization backend enable failed"
                },
                if success {
                    AuditResult::Success
                } else {
                    AuditResult::Failure
                },
                AuditContext {
                    entity_id: Some(session.host_id.to_string()),
                    ip_address: Some(session.client_ip.clone()),
                    error_message: message.error_text().map(ToOwned::to_owned),
                    details: Some(json!({"reboot_required": reboot_required})),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": format!("{}_ack", message.message_type),
            "timestamp": now.to_rfc3339(),
        })))
    })
}
