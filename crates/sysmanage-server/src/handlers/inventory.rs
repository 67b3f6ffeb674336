//! System inventory handler.
//!
//! Agents report OS details, network addresses, and hardware facts after
//! connecting and whenever something changes. The upsert is idempotent by
//! host id, so replayed reports converge to the same row.

use chrono::Utc;
use serde_json::json;
use sqlx::PgConnection;

use sysmanage_core::audit::AuditContext;
use sysmanage_db::hosts as hosts_repo;
use sysmanage_db::models::AuditResult;

use super::{AgentSession, Envelope, HandlerFuture};

/// Upsert inventory facts from a `system_info` report.
pub fn handle<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let data = message.data();
        let now = Utc::now();

        let platform = data.get("platform").and_then(serde_json::Value::as_str);
        let platform_release = data
            .get("platform_release")
            .and_then(serde_json::Value::as_str);
        let ipv4 = data.get("ipv4").and_then(serde_json::Value::as_str);
        let ipv6 = data.get("ipv6").and_then(serde_json::Value::as_str);
        let os_details = data.get("os_details").filter(|v| v.is_object()).cloned();

        hosts_repo::update_inventory(
            conn,
            session.host_id,
            platform,
            platform_release,
            ipv4,
            ipv6,
            os_details.as_ref(),
            now,
        )
        .await?;

        session
            .ctx
            .audit
            .log_agent_message(
                conn,
                &session.fqdn,
                "system_info",
                "System inventory updated",
                AuditResult::Success,
                AuditContext {
                    entity_id: Some(session.host_id.to_string()),
                    ip_address: Some(session.client_ip.clone()),
                    details: Some(json!({
                        "platform": platform,
                        "platform_release": platform_release,
                    })),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": "system_info_ack",
            "timestamp": now.to_rfc3339(),
        })))
    })
}
