//! Heartbeat handler.

use chrono::Utc;
use serde_json::json;
use sqlx::PgConnection;

use sysmanage_core::audit::AuditContext;
use sysmanage_db::hosts as hosts_repo;
use sysmanage_db::models::AuditResult;

use super::{AgentSession, Envelope, HandlerFuture};

/// Refresh the host's liveness and acknowledge.
pub fn handle<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    _message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let now = Utc::now();
        hosts_repo::touch_heartbeat(conn, session.host_id, now).await?;

        session
            .ctx
            .audit
            .log_agent_message(
                conn,
                &session.fqdn,
                "heartbeat",
                "Heartbeat received",
                AuditResult::Success,
                AuditContext {
                    entity_id: Some(session.host_id.to_string()),
                    ip_address: Some(session.client_ip.clone()),
                    category: Some("agent_session".to_owned()),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": "heartbeat_ack",
            "timestamp": now.to_rfc3339(),
        })))
    })
}
