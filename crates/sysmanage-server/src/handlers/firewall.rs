//! Firewall status handler.

use chrono::Utc;
use serde_json::json;
use sqlx::PgConnection;

use sysmanage_core::audit::AuditContext;
use sysmanage_db::diagnostics as diag_repo;
use sysmanage_db::models::AuditResult;

use super::{AgentSession, Envelope, HandlerFuture};

/// Upsert the host's firewall snapshot from a `firewall_status` report.
pub fn handle_status<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let data = message.data();
        let now = Utc::now();

        let enabled = data
            .get("enabled")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let firewall_name = data
            .get("firewall_name")
            .and_then(serde_json::Value::as_str);

        diag_repo::upsert_firewall_status(
            conn,
            session.host_id,
            enabled,
            firewall_name,
            data,
            now,
        )
        .await?;

        session
            .ctx
            .audit
            .log_agent_message(
                conn,
                &session.fqdn,
                "firewall_status",
                "Firewall status updated",
                AuditResult::Success,
                AuditContext {
                    entity_id: Some(session.host_id.to_string()),
                    ip_address: Some(session.client_ip.clone()),
                    details: Some(json!({
                        "enabled": enabled,
                        "firewall_name": firewall_name,
                    })),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": "firewall_status_ack",
            "timestamp": now.to_rfc3339(),
        })))
    })
}
