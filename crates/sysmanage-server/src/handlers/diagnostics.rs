//! Diagnostic collection result handler.
//!
//! Results correlate on `collection_id`: the per-kind payloads land on the
//! report row and the host's `diagnostics_request_status` tracks the final
//! state.

use chrono::Utc;
use serde_json::json;
use sqlx::PgConnection;
use uuid::Uuid;

use sysmanage_core::audit::AuditContext;
use sysmanage_db::diagnostics as diag_repo;
use sysmanage_db::diagnostics::ReportPayload;
use sysmanage_db::hosts as hosts_repo;
use sysmanage_db::models::{AuditResult, DiagnosticStatus};

use super::{AgentSession, Envelope, HandlerFuture};
use crate::error::ApiError;

/// Store a `diagnostic_result` against its report row.
pub fn handle_result<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let result = message.result();
        let now = Utc::now();

        let collection_id = result
            .get("collection_id")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| ApiError::InvalidInput("missing or invalid collection_id".to_owned()))?;

        let report = diag_repo::find_by_collection_id(conn, collection_id)
            .await?
            .ok_or_else(|| {
                ApiError::NotFound(format!("diagnostic report {collection_id} not found"))
            })?;

        let success = message.success();
        let status = if success {
            DiagnosticStatus::Completed
        } else {
            DiagnosticStatus::Failed
        };

        let payload = ReportPayload {
            system_logs: result.get("system_logs").cloned(),
            configuration: result.get("configuration").cloned(),
            network_info: result.get("network_info").cloned(),
            process_info: result.get("process_info").cloned(),
            collection_size_bytes: result
                .get("collection_size_bytes")
                .and_then(serde_json::Value::as_i64),
            files_collected: result
                .get("files_collected")
                .and_then(serde_json::Value::as_i64)
                .and_then(|n| i32::try_from(n).ok()),
        };

        diag_repo::complete_report(
            conn,
            report.id,
            status,
            &payload,
            message.error_text(),
            now,
        )
        .await?;

        let request_status = if success { "completed" } else { "failed" };
        hosts_repo::set_diagnostics_request_status(
            conn,
            session.host_id,
            Some(request_status),
            now,
        )
        .await?;

        session
            .ctx
            .audit
            .log_agent_message(
                conn,
                &session.fqdn,
                "diagnostic_result",
                if success {
                    "Diagnostics collection completed"
                } else {
                    "Diagnostics collection failed"
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
                        "collection_id": collection_id,
                        "files_collected": payload.files_collected,
                        "collection_size_bytes": payload.collection_size_bytes,
                    })),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": "diagnostic_result_ack",
            "collection_id": collection_id,
            "status": request_status,
        })))
    })
}
