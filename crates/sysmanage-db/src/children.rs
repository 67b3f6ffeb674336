//! Child host repository — nested/virtual instances under a parent host.
//!
//! The natural key is `(parent_host_id, child_name, child_type)`.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{ChildStatus, HostChild};

/// Fields for a newly observed or requested child.
#[derive(Debug, Clone)]
pub struct NewHostChild {
    pub parent_host_id: Uuid,
    pub child_name: String,
    pub child_type: String,
    pub status: ChildStatus,
    pub hostname: Option<String>,
    pub distribution: Option<String>,
    pub distribution_version: Option<String>,
    pub wsl_guid: Option<String>,
}

/// Insert a child row.
///
/// # Errors
///
/// Returns `DbError::Conflict` if the `(parent, name, type)` key exists.
pub async fn insert_child(
    conn: &mut PgConnection,
    new: &NewHostChild,
    now: DateTime<Utc>,
) -> Result<HostChild, DbError> {
    let child = sqlx::query_as::<_, HostChild>(
        r"INSERT INTO host_children
            (parent_host_id, child_name, child_type, status, hostname,
             distribution, distribution_version, wsl_guid, created_at, updated_at)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
          RETURNING *",
    )
    .bind(new.parent_host_id)
    .bind(&new.child_name)
    .bind(&new.child_type)
    .bind(new.status)
    .bind(&new.hostname)
    .bind(&new.distribution)
    .bind(&new.distribution_version)
    .bind(&new.wsl_guid)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(child)
}

/// All children of a parent host.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn list_children(
    conn: &mut PgConnection,
    parent_host_id: Uuid,
) -> Result<Vec<HostChild>, DbError> {
    let children = sqlx::query_as::<_, HostChild>(
        "SELECT * FROM host_children WHERE parent_host_id = $1 ORDER BY child_name",
    )
    .bind(parent_host_id)
    .fetch_all(conn)
    .await?;

    Ok(children)
}

/// Find a child by its natural key.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn find_child(
    conn: &mut PgConnection,
    parent_host_id: Uuid,
    child_name: &str,
    child_type: &str,
) -> Result<Option<HostChild>, DbError> {
    let child = sqlx::query_as::<_, HostChild>(
        r"SELECT * FROM host_children
          WHERE parent_host_id = $1 AND child_name = $2 AND child_type = $3",
    )
    .bind(parent_host_id)
    .bind(child_name)
    .bind(child_type)
    .fetch_optional(conn)
    .await?;

    Ok(child)
}

/// Find a child by key and instance GUID. Used by the stale-delete path
/// where only the row for the original instance must be removed.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn find_child_by_guid(
    conn: &mut PgConnection,
    parent_host_id: Uuid,
    child_name: &str,
    child_type: &str,
    wsl_guid: &str,
) -> Result<Option<HostChild>, DbError> {
    let child = sqlx::query_as::<_, HostChild>(
        r"SELECT * FROM host_children
          WHERE parent_host_id = $1 AND child_name = $2 AND child_type = $3
            AND wsl_guid = $4",
    )
    .bind(parent_host_id)
    .bind(child_name)
    .bind(child_type)
    .bind(wsl_guid)
    .fetch_optional(conn)
    .await?;

    Ok(child)
}

/// Observed-state update from an agent report: status (unless the row is
/// uninstalling), distribution, hostname, and GUID.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn update_observed(
    conn: &mut PgConnection,
    child_id: Uuid,
    status: ChildStatus,
    hostname: Option<&str>,
    distribution: Option<&str>,
    distribution_version: Option<&str>,
    wsl_guid: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    // Uninstalling rows keep their status and timestamp so the stale sweep
    // can age them out.
    sqlx::query(
        r"UPDATE host_children
          SET status = CASE WHEN status = 'uninstalling' THEN status ELSE $2 END,
              updated_at = CASE WHEN status = 'uninstalling' THEN updated_at ELSE $7 END,
              hostname = COALESCE($3, hostname),
              distribution = COALESCE($4, distribution),
              distribution_version = COALESCE($5, distribution_version),
              wsl_guid = COALESCE($6, wsl_guid)
          WHERE id = $1",
    )
    .bind(child_id)
    .bind(status)
    .bind(hostname)
    .bind(distribution)
    .bind(distribution_version)
    .bind(wsl_guid)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

/// Transition a child's lifecycle status, optionally recording an error.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the child does not exist.
pub async fn set_status(
    conn: &mut PgConnection,
    child_id: Uuid,
    status: ChildStatus,
    error_message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r"UPDATE host_children
          SET status = $2, error_message = $3, updated_at = $4
          WHERE id = $1",
    )
    .bind(child_id)
    .bind(status)
    .bind(error_message)
    .bind(now)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: "child host" });
    }
    Ok(())
}

/// Link a child row to the standalone Host it registered as.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn link_to_host(
    conn: &mut PgConnection,
    child_id: Uuid,
    child_host_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        r"UPDATE host_children
          SET child_host_id = $2, installed_at = $3, updated_at = $3
          WHERE id = $1",
    )
    .bind(child_id)
    .bind(child_host_id)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

/// Delete a child row.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn delete_child(conn: &mut PgConnection, child_id: Uuid) -> Result<(), DbError> {
    sqlx::query("DELETE FROM host_children WHERE id = $1")
        .bind(child_id)
        .execute(conn)
        .await?;

    Ok(())
}
