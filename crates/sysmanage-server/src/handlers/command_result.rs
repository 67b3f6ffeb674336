//! Generic command result correlator.
//!
//! Looks up the originating queue entry by the echoed `correlation_id`,
//! settles it, and applies any host-level side effects the payload carries
//! (reboot flags). Results for operations with richer semantics arrive as
//! their own message types and are handled there.

use chrono::Utc;
use serde_json::json;
use sqlx::PgConnection;

use sysmanage_core::audit::AuditContext;
use sysmanage_db::hosts as hosts_repo;
use sysmanage_db::models::AuditResult;
use sysmanage_db::queue as queue_repo;

use super::{AgentSession, Envelope, HandlerFuture};

/// Settle a `command_result` against its originating queue entry.
pub fn handle<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let now = Utc::now();
        let success = message.success();

        let correlation_id = message
            .raw
            .get("correlation_id")
            .or_else(|| message.data().get("correlation_id"))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);

        let mut settled_entry = None;
        if let Some(ref correlation_id) = correlation_id {
            if let Some(entry) = queue_repo::get_entry_by_correlation(conn, correlation_id).await? {
                queue_repo::mark_delivered(conn, entry.id).await?;
                settled_entry = Some(entry.id);
            }
        }

        if message
            .result()
            .get("reboot_required")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            hosts_repo::set_reboot_required(
                conn,
                session.host_id,
                true,
                message.result_str("reboot_required_reason"),
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
                "command_result",
                if success {
                    "Command completed on host"
                } else {
                    "Command failed on host"
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
                    details: Some(json!({
                        "correlation_id": correlation_id,
                        "queue_entry_settled": settled_entry,
                    })),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": "command_result_ack",
            "timestamp": now.to_rfc3339(),
        })))
    })
}
