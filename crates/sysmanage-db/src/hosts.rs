//! Host repository — registration, approval, liveness, and lookup.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{ApprovalStatus, Host, HostStatus};

/// Fields captured at registration time.
#[derive(Debug, Clone)]
pub struct NewHost {
    pub fqdn: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub platform: Option<String>,
    pub platform_release: Option<String>,
    pub host_token: String,
    pub is_agent_privileged: bool,
    pub parent_host_id: Option<Uuid>,
}

/// Insert a newly registered host in `pending` state.
///
/// # Errors
///
/// Returns `DbError::Conflict` if the FQDN is already registered.
pub async fn create_host(conn: &mut PgConnection, new: &NewHost) -> Result<Host, DbError> {
    let host = sqlx::query_as::<_, Host>(
        r"INSERT INTO hosts
            (fqdn, ipv4, ipv6, platform, platform_release, host_token,
             is_agent_privileged, parent_host_id)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
          RETURNING *",
    )
    .bind(&new.fqdn)
    .bind(&new.ipv4)
    .bind(&new.ipv6)
    .bind(&new.platform)
    .bind(&new.platform_release)
    .bind(&new.host_token)
    .bind(new.is_agent_privileged)
    .bind(new.parent_host_id)
    .fetch_one(conn)
    .await?;

    Ok(host)
}

/// Get a host by ID.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the host does not exist.
pub async fn get_host(conn: &mut PgConnection, host_id: Uuid) -> Result<Host, DbError> {
    sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE id = $1")
        .bind(host_id)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound { entity: "host" })
}

/// Get a host by ID with a row lock, for approval and other wrong-state-
/// sensitive transitions.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the host does not exist.
pub async fn get_host_for_update(conn: &mut PgConnection, host_id: Uuid) -> Result<Host, DbError> {
    sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE id = $1 FOR UPDATE")
        .bind(host_id)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound { entity: "host" })
}

/// Look up the host bound to a client certificate serial.
///
/// # Errors
///
/// Returns `DbError::NotFound` if no host holds this serial.
pub async fn get_host_by_certificate_serial(
    conn: &mut PgConnection,
    serial: &str,
) -> Result<Host, DbError> {
    sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE certificate_serial = $1")
        .bind(serial)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound { entity: "host" })
}

/// List all hosts, most recently seen first.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn list_hosts(conn: &mut PgConnection) -> Result<Vec<Host>, DbError> {
    let hosts =
        sqlx::query_as::<_, Host>("SELECT * FROM hosts ORDER BY last_access DESC NULLS LAST")
            .fetch_all(conn)
            .await?;

    Ok(hosts)
}

/// Persist the approval decision and issued certificate on a host row.
/// Approval counts as a liveness touch: the host comes up active so its
/// first authenticated session passes the handshake preconditions.
///
/// # Errors
///
/// Returns `DbError::Stale` if the host vanished between lock and update.
pub async fn store_approval(
    conn: &mut PgConnection,
    host_id: Uuid,
    certificate_pem: &str,
    certificate_serial: &str,
    now: DateTime<Utc>,
) -> Result<Host, DbError> {
    sqlx::query_as::<_, Host>(
        r"UPDATE hosts
          SET approval_status = 'approved',
              client_certificate = $2,
              certificate_serial = $3,
              certificate_issued_at = $4,
              status = 'up',
              active = true,
              last_access = $4,
              updated_at = $4
          WHERE id = $1
          RETURNING *",
    )
    .bind(host_id)
    .bind(certificate_pem)
    .bind(certificate_serial)
    .bind(now)
    .fetch_optional(conn)
    .await?
    .ok_or(DbError::Stale { entity: "host" })
}

/// Mark a pending host rejected. Rejection is terminal and never issues a
/// certificate.
///
/// # Errors
///
/// Returns `DbError::Stale` if the host vanished between lock and update.
pub async fn store_rejection(
    conn: &mut PgConnection,
    host_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Host, DbError> {
    sqlx::query_as::<_, Host>(
        r"UPDATE hosts
          SET approval_status = 'rejected', active = false, last_access = $2, updated_at = $2
          WHERE id = $1
          RETURNING *",
    )
    .bind(host_id)
    .bind(now)
    .fetch_optional(conn)
    .await?
    .ok_or(DbError::Stale { entity: "host" })
}

/// Record agent liveness: refresh `last_access` and mark the host up.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the host does not exist.
pub async fn touch_heartbeat(
    conn: &mut PgConnection,
    host_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r"UPDATE hosts
          SET last_access = $2, status = 'up', active = true, updated_at = $2
          WHERE id = $1",
    )
    .bind(host_id)
    .bind(now)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: "host" });
    }
    Ok(())
}

/// Mark every host whose `last_access` predates `threshold` and whose status
/// is still `up` as down and inactive. Returns the number of hosts marked.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn mark_stale_hosts_down(
    conn: &mut PgConnection,
    threshold: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        r"UPDATE hosts
          SET status = 'down', active = false, updated_at = $2
          WHERE status = 'up' AND last_access < $1",
    )
    .bind(threshold)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Upsert inventory facts reported by the agent. Idempotent by host id.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the host does not exist.
pub async fn update_inventory(
    conn: &mut PgConnection,
    host_id: Uuid,
    platform: Option<&str>,
    platform_release: Option<&str>,
    ipv4: Option<&str>,
    ipv6: Option<&str>,
    os_details: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r"UPDATE hosts
          SET platform = COALESCE($2, platform),
              platform_release = COALESCE($3, platform_release),
              ipv4 = COALESCE($4, ipv4),
              ipv6 = COALESCE($5, ipv6),
              os_details = COALESCE($6, os_details),
              last_access = $7,
              updated_at = $7
          WHERE id = $1",
    )
    .bind(host_id)
    .bind(platform)
    .bind(platform_release)
    .bind(ipv4)
    .bind(ipv6)
    .bind(os_details)
    .bind(now)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: "host" });
    }
    Ok(())
}

/// Flag that the host needs a reboot (or clear the flag).
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn set_reboot_required(
    conn: &mut PgConnection,
    host_id: Uuid,
    required: bool,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        r"UPDATE hosts
          SET reboot_required = $2, reboot_required_reason = $3, updated_at = $4
          WHERE id = $1",
    )
    .bind(host_id)
    .bind(required)
    .bind(reason)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

/// Track the progress of an outstanding diagnostics request on the host row.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn set_diagnostics_request_status(
    conn: &mut PgConnection,
    host_id: Uuid,
    status: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE hosts SET diagnostics_request_status = $2, updated_at = $3 WHERE id = $1",
    )
    .bind(host_id)
    .bind(status)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

/// Delete a host. Queue entries, children, diagnostics, and firewall
/// snapshots cascade via foreign keys.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the host does not exist.
pub async fn delete_host(conn: &mut PgConnection, host_id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM hosts WHERE id = $1")
        .bind(host_id)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: "host" });
    }
    Ok(())
}

/// Record which host owns this one as a nested child, for filtering.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn set_parent_host(
    conn: &mut PgConnection,
    host_id: Uuid,
    parent_host_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE hosts SET parent_host_id = $2, updated_at = $3 WHERE id = $1")
        .bind(host_id)
        .bind(parent_host_id)
        .bind(now)
        .execute(conn)
        .await?;

    Ok(())
}

/// Resolve a host row from an agent-reported hostname.
///
/// Rule ladder, first match wins:
/// 1. exact case-insensitive `fqdn = hostname`
/// 2. `fqdn LIKE short '.%'` — the reported name is a short name and the
///    host row holds the FQDN
/// 3. reverse prefix — the host row holds a short name and the reported
///    name is the FQDN
///
/// Optionally restricted to approved hosts.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn resolve_host_by_hostname(
    conn: &mut PgConnection,
    hostname: &str,
    approved_only: bool,
) -> Result<Option<Host>, DbError> {
    let short = hostname.split('.').next().unwrap_or(hostname);

    let host = sqlx::query_as::<_, Host>(
        r"SELECT * FROM hosts
          WHERE ($3 = false OR approval_status = 'approved')
            AND (lower(fqdn) = lower($1)
                 OR lower(fqdn) LIKE lower($2) || '.%'
                 OR lower($1) LIKE lower(fqdn) || '.%')
          ORDER BY
            CASE
              WHEN lower(fqdn) = lower($1) THEN 0
              WHEN lower(fqdn) LIKE lower($2) || '.%' THEN 1
              ELSE 2
            END
          LIMIT 1",
    )
    .bind(hostname)
    .bind(short)
    .bind(approved_only)
    .fetch_optional(conn)
    .await?;

    Ok(host)
}

/// Count hosts by liveness, for the connection stats surface.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn count_hosts_by_status(
    conn: &mut PgConnection,
    status: HostStatus,
) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM hosts WHERE status = $1")
        .bind(status)
        .fetch_one(conn)
        .await?;

    Ok(count)
}

/// Whether the host may receive commands at all.
#[must_use]
pub fn can_receive_commands(host: &Host) -> bool {
    host.approval_status == ApprovalStatus::Approved
}
