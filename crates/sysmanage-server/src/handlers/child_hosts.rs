//! Child host handlers — reconciliation, creation, control, and delete
//! results for nested/virtual instances (WSL distros, KVM/LXD/bhyve VMs).
//!
//! The list-update reconciliation is computed as a pure plan over the
//! existing rows and the agent's report, then applied in the handler's
//! transaction. Grace rules: rows still `creating` are preserved (the
//! instance does not exist yet, so the agent cannot report it), and
//! `uninstalling` rows younger than ten minutes are preserved so the delete
//! handler can finish; older uninstalling rows are treated as a failed
//! delete and removed together with their linked host.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::PgConnection;
use uuid::Uuid;

use sysmanage_core::audit::AuditContext;
use sysmanage_db::children as children_repo;
use sysmanage_db::children::NewHostChild;
use sysmanage_db::hosts as hosts_repo;
use sysmanage_db::models::{AuditResult, ChildStatus, HostChild};

use super::{AgentSession, Envelope, HandlerFuture};

/// How long an `uninstalling` row is protected from the unseen sweep.
const UNINSTALL_GRACE_MINUTES: i64 = 10;

// ── Reconciliation planning ──────────────────────────────────────────

/// One child as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedChild {
    pub child_name: String,
    pub child_type: String,
    pub status: ChildStatus,
    pub hostname: Option<String>,
    pub distribution: Option<String>,
    pub distribution_version: Option<String>,
    pub wsl_guid: Option<String>,
}

impl ReportedChild {
    /// Parse one entry of the agent's `child_hosts` array. Entries missing
    /// a name or type are skipped by the caller.
    #[must_use]
    pub fn parse(value: &serde_json::Value) -> Option<Self> {
        let child_name = value.get("child_name")?.as_str()?.to_owned();
        let child_type = value.get("child_type")?.as_str()?.to_owned();
        let status = value
            .get("status")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(ChildStatus::Unknown);

        let distribution_info = value.get("distribution");
        let distribution = distribution_info
            .and_then(|d| d.get("distribution_name"))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);
        let distribution_version = distribution_info
            .and_then(|d| d.get("distribution_version"))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);

        Some(Self {
            child_name,
            child_type,
            status,
            hostname: value
                .get("hostname")
                .and_then(serde_json::Value::as_str)
                .map(ToOwned::to_owned),
            distribution,
            distribution_version,
            wsl_guid: value
                .get("wsl_guid")
                .and_then(serde_json::Value::as_str)
                .map(ToOwned::to_owned),
        })
    }
}

/// Which host row to cascade when removing a stale uninstalling child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCascade {
    ById(Uuid),
    ByHostname(String),
}

/// One step of the reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileStep {
    /// The agent reported a child we have no row for.
    Insert(ReportedChild),
    /// The agent reported a child we track; refresh observed state.
    Update {
        child_id: Uuid,
        linked_host: Option<Uuid>,
        report: ReportedChild,
    },
    /// Unseen, but protected by a grace rule.
    Preserve { child_id: Uuid },
    /// Unseen and unprotected: remove, cascading any linked host.
    Delete {
        child_id: Uuid,
        cascade: Option<HostCascade>,
    },
}

/// Compute the reconciliation plan for one parent host.
#[must_use]
pub fn plan_reconciliation(
    existing: &[HostChild],
    reported: &[ReportedChild],
    now: DateTime<Utc>,
) -> Vec<ReconcileStep> {
    let mut steps = Vec::new();
    let stale_threshold = now - Duration::minutes(UNINSTALL_GRACE_MINUTES);

    let mut seen = std::collections::HashSet::new();
    for report in reported {
        seen.insert((report.child_name.clone(), report.child_type.clone()));
        let known = existing
            .iter()
            .find(|c| c.child_name == report.child_name && c.child_type == report.child_type);
        match known {
            Some(child) => steps.push(ReconcileStep::Update {
                child_id: child.id,
                linked_host: child.child_host_id,
                report: report.clone(),
            }),
            None => steps.push(ReconcileStep::Insert(report.clone())),
        }
    }

    for child in existing {
        if seen.contains(&(child.child_name.clone(), child.child_type.clone())) {
            continue;
        }
        match child.status {
            // Not yet visible to the agent; keep waiting.
            ChildStatus::Creating => steps.push(ReconcileStep::Preserve { child_id: child.id }),
            ChildStatus::Uninstalling if child.updated_at > stale_threshold => {
                steps.push(ReconcileStep::Preserve { child_id: child.id });
            }
            ChildStatus::Uninstalling => {
                // The delete command failed or timed out; the instance is
                // gone, so the row and any linked host go with it.
                let cascade = child.child_host_id.map(HostCascade::ById).or_else(|| {
                    child.hostname.clone().map(HostCascade::ByHostname)
                });
                steps.push(ReconcileStep::Delete {
                    child_id: child.id,
                    cascade,
                });
            }
            _ => steps.push(ReconcileStep::Delete {
                child_id: child.id,
                cascade: None,
            }),
        }
    }

    steps
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Reconcile the `HostChild` rows for a parent from a
/// `child_hosts_list_update` report.
pub fn handle_list_update<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !message.success() {
            let error = message.error_text().unwrap_or("Unknown error").to_owned();
            session
                .ctx
                .audit
                .log_agent_message(
                    conn,
                    &session.fqdn,
                    "child_hosts_list_update",
                    "Child hosts list failed",
                    AuditResult::Failure,
                    AuditContext {
                        entity_id: Some(session.host_id.to_string()),
                        ip_address: Some(session.client_ip.clone()),
                        error_message: Some(error.clone()),
                        ..AuditContext::default()
                    },
                )
                .await?;
            return Ok(Some(json!({
                "message_type": "error",
                "error_type": "operation_failed",
                "message": error,
                "data": {},
            })));
        }

        let reported: Vec<ReportedChild> = message
            .result()
            .get("child_hosts")
            .and_then(serde_json::Value::as_array)
            .map(|children| children.iter().filter_map(ReportedChild::parse).collect())
            .unwrap_or_default();

        let now = Utc::now();
        let existing = children_repo::list_children(conn, session.host_id).await?;
        let plan = plan_reconciliation(&existing, &reported, now);

        let mut new_count = 0u32;
        let mut updated_count = 0u32;
        let mut linked_count = 0u32;
        let mut missing_count = 0u32;

        for step in plan {
            match step {
                ReconcileStep::Insert(report) => {
                    let child = children_repo::insert_child(
                        conn,
                        &NewHostChild {
                            parent_host_id: session.host_id,
                            child_name: report.child_name.clone(),
                            child_type: report.child_type.clone(),
                            status: report.status,
                            hostname: report.hostname.clone(),
                            distribution: report.distribution.clone(),
                            distribution_version: report.distribution_version.clone(),
                            wsl_guid: report.wsl_guid.clone(),
                        },
                        now,
                    )
                    .await?;
                    new_count += 1;
                    if try_late_link(conn, session, child.id, None, &report, now).await? {
                        linked_count += 1;
                    }
                }
                ReconcileStep::Update {
                    child_id,
                    linked_host,
                    report,
                } => {
                    children_repo::update_observed(
                        conn,
                        child_id,
                        report.status,
                        report.hostname.as_deref(),
                        report.distribution.as_deref(),
                        report.distribution_version.as_deref(),
                        report.wsl_guid.as_deref(),
                        now,
                    )
                    .await?;
                    updated_count += 1;
                    if try_late_link(conn, session, child_id, linked_host, &report, now).await? {
                        linked_count += 1;
                    }
                }
                ReconcileStep::Preserve { .. } => {}
                ReconcileStep::Delete { child_id, cascade } => {
                    cascade_host(conn, cascade).await?;
                    children_repo::delete_child(conn, child_id).await?;
                    missing_count += 1;
                }
            }
        }

        session
            .ctx
            .audit
            .log_agent_message(
                conn,
                &session.fqdn,
                "child_hosts_list_update",
                "Child hosts list updated",
                AuditResult::Success,
                AuditContext {
                    entity_id: Some(session.host_id.to_string()),
                    ip_address: Some(session.client_ip.clone()),
                    details: Some(json!({
                        "total_reported": reported.len(),
                        "new_count": new_count,
                        "updated_count": updated_count,
                        "linked_count": linked_count,
                        "missing_count": missing_count,
                    })),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": "child_hosts_list_ack",
            "timestamp": now.to_rfc3339(),
            "status": "updated",
            "new_count": new_count,
            "updated_count": updated_count,
            "linked_count": linked_count,
        })))
    })
}

/// Link a running, unlinked child to an already-approved host with a
/// matching hostname. Covers the race where the host was approved before
/// the parent first reported the child.
async fn try_late_link(
    conn: &mut PgConnection,
    session: &AgentSession,
    child_id: Uuid,
    linked_host: Option<Uuid>,
    report: &ReportedChild,
    now: DateTime<Utc>,
) -> Result<bool, crate::error::ApiError> {
    if linked_host.is_some() || report.status != ChildStatus::Running {
        return Ok(false);
    }
    let Some(ref hostname) = report.hostname else {
        return Ok(false);
    };

    let Some(host) = hosts_repo::resolve_host_by_hostname(conn, hostname, true).await? else {
        return Ok(false);
    };

    children_repo::link_to_host(conn, child_id, host.id, now).await?;
    hosts_repo::set_parent_host(conn, host.id, Some(session.host_id), now).await?;
    Ok(true)
}

async fn cascade_host(
    conn: &mut PgConnection,
    cascade: Option<HostCascade>,
) -> Result<(), crate::error::ApiError> {
    match cascade {
        Some(HostCascade::ById(host_id)) => {
            match hosts_repo::delete_host(conn, host_id).await {
                Ok(()) | Err(sysmanage_db::DbError::NotFound { .. }) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        Some(HostCascade::ByHostname(hostname)) => {
            if let Some(host) = hosts_repo::resolve_host_by_hostname(conn, &hostname, false).await?
            {
                hosts_repo::delete_host(conn, host.id).await?;
            }
            Ok(())
        }
        None => Ok(()),
    }
}

/// Mark the placeholder row for a `child_host_created` result.
pub fn handle_created<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let now = Utc::now();
        let success = message.success();
        let child_name = message.result_str("child_name").unwrap_or_default().to_owned();
        let child_type = message.result_str("child_type").unwrap_or("wsl").to_owned();

        let child =
            children_repo::find_child(conn, session.host_id, &child_name, &child_type).await?;

        if let Some(child) = child {
            if success {
                children_repo::set_status(conn, child.id, ChildStatus::Running, None, now).await?;
            } else {
                children_repo::set_status(
                    conn,
                    child.id,
                    ChildStatus::Error,
                    message.error_text(),
                    now,
                )
                .await?;
            }
        }

        let reboot_required = message
            .result()
            .get("reboot_required")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !success && reboot_required {
            hosts_repo::set_reboot_required(
                conn,
                session.host_id,
                true,
                Some("child host creation requires reboot"),
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
                "child_host_created",
                if success {
                    "Child host created"
                } else {
                    "Child host creation failed"
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
                        "child_name": child_name,
                        "child_type": child_type,
                        "reboot_required": reboot_required,
                    })),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": "child_host_created_ack",
            "timestamp": now.to_rfc3339(),
        })))
    })
}

/// Handle a `child_host_delete_result`, including the stale-delete case.
///
/// A GUID mismatch from the agent means the instance the server wanted gone
/// no longer exists and the name has been reused; the local row is removed
/// silently so the delete is never re-attempted against the new instance.
pub fn handle_delete_result<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let now = Utc::now();
        let success = message.success();
        let child_name = message.result_str("child_name").unwrap_or_default().to_owned();
        let child_type = message.result_str("child_type").unwrap_or("wsl").to_owned();

        if !success {
            let expected_guid = message.result_str("expected_guid").map(ToOwned::to_owned);
            let current_guid = message.result_str("current_guid").map(ToOwned::to_owned);

            if let (Some(expected), Some(current)) = (expected_guid, current_guid) {
                // Stale delete: the agent refused because the name now maps
                // to a different instance. Reconcile silently.
                if let Some(child) = children_repo::find_child_by_guid(
                    conn,
                    session.host_id,
                    &child_name,
                    &child_type,
                    &expected,
                )
                .await?
                {
                    children_repo::delete_child(conn, child.id).await?;
                }

                session
                    .ctx
                    .audit
                    .log_agent_message(
                        conn,
                        &session.fqdn,
                        "child_host_delete_result",
                        "Stale child host delete reconciled",
                        AuditResult::Success,
                        AuditContext {
                            entity_id: Some(session.host_id.to_string()),
                            ip_address: Some(session.client_ip.clone()),
                            details: Some(json!({
                                "child_name": &child_name,
                                "expected_guid": &expected,
                                "current_guid": &current,
                            })),
                            ..AuditContext::default()
                        },
                    )
                    .await?;

                return Ok(Some(json!({
                    "message_type": "child_host_delete_stale",
                    "child_name": child_name,
                    "expected_guid": expected,
                    "current_guid": current,
                })));
            }

            // A genuine failure: mark the row and keep it.
            let error = message.error_text().unwrap_or("Unknown error").to_owned();
            if let Some(child) =
                children_repo::find_child(conn, session.host_id, &child_name, &child_type).await?
            {
                children_repo::set_status(conn, child.id, ChildStatus::Error, Some(&error), now)
                    .await?;
            }

            session
                .ctx
                .audit
                .log_agent_message(
                    conn,
                    &session.fqdn,
                    "child_host_delete_result",
                    "Child host delete failed",
                    AuditResult::Failure,
                    AuditContext {
                        entity_id: Some(session.host_id.to_string()),
                        ip_address: Some(session.client_ip.clone()),
                        error_message: Some(error.clone()),
                        details: Some(json!({"child_name": child_name})),
                        ..AuditContext::default()
                    },
                )
                .await?;

            return Ok(Some(json!({
                "message_type": "error",
                "error_type": "operation_failed",
                "message": error,
                "data": {},
            })));
        }

        // Successful delete: remove the row and any registered host record.
        if let Some(child) =
            children_repo::find_child(conn, session.host_id, &child_name, &child_type).await?
        {
            let cascade = child
                .child_host_id
                .map(HostCascade::ById)
                .or_else(|| child.hostname.clone().map(HostCascade::ByHostname));
            children_repo::delete_child(conn, child.id).await?;
            cascade_host(conn, cascade).await?;
        }

        session
            .ctx
            .audit
            .log_agent_message(
                conn,
                &session.fqdn,
                "child_host_delete_result",
                "Child host deleted",
                AuditResult::Success,
                AuditContext {
                    entity_id: Some(session.host_id.to_string()),
                    ip_address: Some(session.client_ip.clone()),
                    details: Some(json!({
                        "child_name": child_name,
                        "child_type": child_type,
                    })),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": "child_host_delete_ack",
            "timestamp": now.to_rfc3339(),
        })))
    })
}

/// `child_host_start_result` — running on success.
pub fn handle_start_result<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    handle_control_result(conn, session, message, "start", ChildStatus::Running)
}

/// `child_host_stop_result` — stopped on success.
pub fn handle_stop_result<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    handle_control_result(conn, session, message, "stop", ChildStatus::Stopped)
}

/// `child_host_restart_result` — running on success.
pub fn handle_restart_result<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
) -> HandlerFuture<'a> {
    handle_control_result(conn, session, message, "restart", ChildStatus::Running)
}

fn handle_control_result<'a>(
    conn: &'a mut PgConnection,
    session: &'a AgentSession,
    message: Envelope,
    operation: &'static str,
    success_status: ChildStatus,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let now = Utc::now();
        let success = message.success();
        let child_name = message.result_str("child_name").unwrap_or_default().to_owned();
        let child_type = message.result_str("child_type").unwrap_or("wsl").to_owned();

        let child =
            children_repo::find_child(conn, session.host_id, &child_name, &child_type).await?;

        if let Some(child) = child {
            if success {
                children_repo::set_status(conn, child.id, success_status, None, now).await?;
            } else {
                // Record the error but keep the prior status.
                children_repo::set_status(
                    conn,
                    child.id,
                    child.status,
                    message.error_text(),
                    now,
                )
                .await?;
            }
        }

        session
            .ctx
            .audit
            .log_agent_message(
                conn,
                &session.fqdn,
                &format!("child_host_{operation}_result"),
                if success {
                    "Child host control operation completed"
                } else {
                    "Child host control operation failed"
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
                        "operation": operation,
                        "child_name": child_name,
                        "child_type": child_type,
                    })),
                    ..AuditContext::default()
                },
            )
            .await?;

        Ok(Some(json!({
            "message_type": format!("child_host_{operation}_ack"),
            "timestamp": now.to_rfc3339(),
        })))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn child(
        name: &str,
        status: ChildStatus,
        updated_at: DateTime<Utc>,
        child_host_id: Option<Uuid>,
        hostname: Option<&str>,
    ) -> HostChild {
        HostChild {
            id: Uuid::new_v4(),
            parent_host_id: Uuid::new_v4(),
            child_name: name.to_owned(),
            child_type: "wsl".to_owned(),
            status,
            child_host_id,
            hostname: hostname.map(ToOwned::to_owned),
            distribution: None,
            distribution_version: None,
            wsl_guid: None,
            error_message: None,
            installed_at: None,
            created_at: updated_at,
            updated_at,
        }
    }

    fn report(name: &str, status: ChildStatus) -> ReportedChild {
        ReportedChild {
            child_name: name.to_owned(),
            child_type: "wsl".to_owned(),
            status,
            hostname: None,
            distribution: None,
            distribution_version: None,
            wsl_guid: None,
        }
    }

    #[test]
    fn new_children_are_inserted_and_known_updated() {
        let now = Utc::now();
        let existing = vec![child("dev", ChildStatus::Running, now, None, None)];
        let reported = vec![report("dev", ChildStatus::Stopped), report("new", ChildStatus::Running)];

        let plan = plan_reconciliation(&existing, &reported, now);
        assert!(matches!(
            plan[0],
            ReconcileStep::Update { ref report, .. } if report.status == ChildStatus::Stopped
        ));
        assert!(matches!(plan[1], ReconcileStep::Insert(ref r) if r.child_name == "new"));
    }

    #[test]
    fn unseen_creating_rows_are_preserved() {
        let now = Utc::now();
        let existing = vec![child("building", ChildStatus::Creating, now, None, None)];
        let plan = plan_reconciliation(&existing, &[], now);
        assert!(matches!(plan[0], ReconcileStep::Preserve { .. }));
    }

    #[test]
    fn fresh_uninstalling_rows_are_preserved() {
        let now = Utc::now();
        let existing = vec![child(
            "going",
            ChildStatus::Uninstalling,
            now - Duration::minutes(5),
            None,
            None,
        )];
        let plan = plan_reconciliation(&existing, &[], now);
        assert!(matches!(plan[0], ReconcileStep::Preserve { .. }));
    }

    #[test]
    fn stale_uninstalling_rows_cascade_their_linked_host() {
        let now = Utc::now();
        let linked = Uuid::new_v4();
        let existing = vec![child(
            "gone",
            ChildStatus::Uninstalling,
            now - Duration::minutes(11),
            Some(linked),
            None,
        )];
        let plan = plan_reconciliation(&existing, &[], now);
        assert_eq!(
            plan[0],
            ReconcileStep::Delete {
                child_id: existing[0].id,
                cascade: Some(HostCascade::ById(linked)),
            }
        );
    }

    #[test]
    fn stale_uninstalling_without_link_cascades_by_hostname() {
        let now = Utc::now();
        let existing = vec![child(
            "gone",
            ChildStatus::Uninstalling,
            now - Duration::minutes(30),
            None,
            Some("gone.example.com"),
        )];
        let plan = plan_reconciliation(&existing, &[], now);
        assert_eq!(
            plan[0],
            ReconcileStep::Delete {
                child_id: existing[0].id,
                cascade: Some(HostCascade::ByHostname("gone.example.com".to_owned())),
            }
        );
    }

    #[test]
    fn plain_unseen_rows_are_deleted_without_cascade() {
        let now = Utc::now();
        let existing = vec![child("vanished", ChildStatus::Running, now, Some(Uuid::new_v4()), None)];
        let plan = plan_reconciliation(&existing, &[], now);
        assert!(matches!(
            plan[0],
            ReconcileStep::Delete { cascade: None, .. }
        ));
    }

    #[test]
    fn reported_child_parses_nested_distribution() {
        let parsed = ReportedChild::parse(&json!({
            "child_name": "ubuntu-dev",
            "child_type": "wsl",
            "status": "running",
            "hostname": "ubuntu-dev.local",
            "wsl_guid": "{guid-1}",
            "distribution": {
                "distribution_name": "Ubuntu",
                "distribution_version": "22.04",
            },
        }))
        .unwrap();
        assert_eq!(parsed.status, ChildStatus::Running);
        assert_eq!(parsed.distribution.as_deref(), Some("Ubuntu"));
        assert_eq!(parsed.distribution_version.as_deref(), Some("22.04"));

        // Name and type are mandatory.
        assert!(ReportedChild::parse(&json!({"child_type": "wsl"})).is_none());
    }

    #[test]
    fn unknown_status_strings_default_to_unknown() {
        let parsed = ReportedChild::parse(&json!({
            "child_name": "x",
            "child_type": "kvm",
            "status": "hibernating",
        }))
        .unwrap();
        assert_eq!(parsed.status, ChildStatus::Unknown);
    }
}
