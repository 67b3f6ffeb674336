//! Diagnostic reports and firewall snapshots.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{DiagnosticReport, DiagnosticStatus, FirewallStatus};

/// Create a pending diagnostic report for a collection request.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn insert_report(
    conn: &mut PgConnection,
    host_id: Uuid,
    collection_id: Uuid,
) -> Result<DiagnosticReport, DbError> {
    let report = sqlx::query_as::<_, DiagnosticReport>(
        r"INSERT INTO diagnostic_reports (host_id, collection_id, status)
          VALUES ($1, $2, 'pending')
          RETURNING *",
    )
    .bind(host_id)
    .bind(collection_id)
    .fetch_one(conn)
    .await?;

    Ok(report)
}

/// Find a report by its collection id.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn find_by_collection_id(
    conn: &mut PgConnection,
    collection_id: Uuid,
) -> Result<Option<DiagnosticReport>, DbError> {
    let report = sqlx::query_as::<_, DiagnosticReport>(
        "SELECT * FROM diagnostic_reports WHERE collection_id = $1",
    )
    .bind(collection_id)
    .fetch_optional(conn)
    .await?;

    Ok(report)
}

/// Completion payload for a finished collection.
#[derive(Debug, Clone, Default)]
pub struct ReportPayload {
    pub system_logs: Option<serde_json::Value>,
    pub configuration: Option<serde_json::Value>,
    pub network_info: Option<serde_json::Value>,
    pub process_info: Option<serde_json::Value>,
    pub collection_size_bytes: Option<i64>,
    pub files_collected: Option<i32>,
}

/// Store the agent's result and transition the report to its final state.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the report does not exist.
pub async fn complete_report(
    conn: &mut PgConnection,
    report_id: Uuid,
    status: DiagnosticStatus,
    payload: &ReportPayload,
    error_message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r"UPDATE diagnostic_reports
          SET status = $2, system_logs = $3, configuration = $4,
              network_info = $5, process_info = $6,
              collection_size_bytes = $7, files_collected = $8,
              error_message = $9, completed_at = $10,
              started_at = COALESCE(started_at, $10)
          WHERE id = $1",
    )
    .bind(report_id)
    .bind(status)
    .bind(&payload.system_logs)
    .bind(&payload.configuration)
    .bind(&payload.network_info)
    .bind(&payload.process_info)
    .bind(payload.collection_size_bytes)
    .bind(payload.files_collected)
    .bind(error_message)
    .bind(now)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound {
            entity: "diagnostic report",
        });
    }
    Ok(())
}

/// Upsert the per-host firewall snapshot.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn upsert_firewall_status(
    conn: &mut PgConnection,
    host_id: Uuid,
    enabled: bool,
    firewall_name: Option<&str>,
    ports: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        r"INSERT INTO firewall_status
            (host_id, enabled, firewall_name, tcp_open_ports, udp_open_ports,
             ipv4_ports_tcp, ipv4_ports_udp, ipv6_ports_tcp, ipv6_ports_udp,
             last_updated)
          VALUES ($1, $2, $3, $4->'tcp_open_ports', $4->'udp_open_ports',
                  $4->'ipv4_ports_tcp', $4->'ipv4_ports_udp',
                  $4->'ipv6_ports_tcp', $4->'ipv6_ports_udp', $5)
          ON CONFLICT (host_id) DO UPDATE
          SET enabled = EXCLUDED.enabled,
              firewall_name = EXCLUDED.firewall_name,
              tcp_open_ports = EXCLUDED.tcp_open_ports,
              udp_open_ports = EXCLUDED.udp_open_ports,
              ipv4_ports_tcp = EXCLUDED.ipv4_ports_tcp,
              ipv4_ports_udp = EXCLUDED.ipv4_ports_udp,
              ipv6_ports_tcp = EXCLUDED.ipv6_ports_tcp,
              ipv6_ports_udp = EXCLUDED.ipv6_ports_udp,
              last_updated = EXCLUDED.last_updated",
    )
    .bind(host_id)
    .bind(enabled)
    .bind(firewall_name)
    .bind(ports)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

/// Current firewall snapshot for a host.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn get_firewall_status(
    conn: &mut PgConnection,
    host_id: Uuid,
) -> Result<Option<FirewallStatus>, DbError> {
    let status = sqlx::query_as::<_, FirewallStatus>(
        "SELECT * FROM firewall_status WHERE host_id = $1",
    )
    .bind(host_id)
    .fetch_optional(conn)
    .await?;

    Ok(status)
}
