//! Script execution result handler.
//!
//! Script results use a reduced envelope — only `message_type` and
//! `execution_id` are required (§ message integrity). The result is audited
//! with its execution id; the initiating operation polls the audit trail.

use serde_json::json;
use sqlx::PgConnection;

use sysmanage_core::audit::AuditContext;
use sysmanage_db::models::AuditResult;

use super::{AgentSession, Envelope, HandlerFuture};
use crate::error::ApiError;

/// Record a `script_execution_result`.
pub fn handle<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let execution_id = message
            .raw
            .get("execution_id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ApiError::InvalidInput("missing execution_id".to_owned()))?
            .to_owned();

        let success = message.success();
        let exit_code = message
            .result()
            .get("exit_code")
            .and_then(serde_json::Value::as_i64);

        let (result, description) = if success {
            (AuditResult::Success, "Script execution completed")
        } else {
            (AuditResult::Failure, "Script execution failed")
        };

        session
            .ctx
            .audit
            .log_agent_message(
                conn,
                &session.fqdn,
                "script_execution_result",
                description,
                result,
                AuditContext {
                    entity_id: Some(session.host_id.to_string()),
                    ip_address: Some(session.client_ip.clone()),
                    error_message: message.error_text().map(ToOwned::to_owned),
                    details: Some(json!({
                        "execution_id": &execution_id,
                        "exit_code": exit_code,
                    })),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": "script_execution_ack",
            "execution_id": execution_id,
        })))
    })
}
