//! Per-OS defaults applied on host approval: third-party repositories,
//! antivirus packages, and enabled package managers.

use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{AntivirusDefault, DefaultRepository, EnabledPackageManager};

/// Add a default repository for an OS.
///
/// # Errors
///
/// Returns `DbError::Conflict` on a duplicate `(os, manager, url)` triple.
pub async fn create_default_repository(
    conn: &mut PgConnection,
    os_name: &str,
    package_manager: &str,
    repository_url: &str,
    created_by: Option<Uuid>,
) -> Result<DefaultRepository, DbError> {
    let repo = sqlx::query_as::<_, DefaultRepository>(
        r"INSERT INTO default_repositories (os_name, package_manager, repository_url, created_by)
          VALUES ($1, $2, $3, $4)
          RETURNING *",
    )
    .bind(os_name)
    .bind(package_manager)
    .bind(repository_url)
    .bind(created_by)
    .fetch_one(conn)
    .await?;

    Ok(repo)
}

/// All default repositories.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn list_default_repositories(
    conn: &mut PgConnection,
) -> Result<Vec<DefaultRepository>, DbError> {
    let repos = sqlx::query_as::<_, DefaultRepository>(
        "SELECT * FROM default_repositories ORDER BY os_name, repository_url",
    )
    .fetch_all(conn)
    .await?;

    Ok(repos)
}

/// Default repositories applicable to an OS. `os_name` matches when the
/// host's platform release starts with it ("Ubuntu" matches "Ubuntu 22.04").
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn list_default_repositories_for_os(
    conn: &mut PgConnection,
    platform_release: &str,
) -> Result<Vec<DefaultRepository>, DbError> {
    let repos = sqlx::query_as::<_, DefaultRepository>(
        r"SELECT * FROM default_repositories
          WHERE lower($1) LIKE lower(os_name) || '%'
          ORDER BY repository_url",
    )
    .bind(platform_release)
    .fetch_all(conn)
    .await?;

    Ok(repos)
}

/// Remove a default repository.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the row does not exist.
pub async fn delete_default_repository(
    conn: &mut PgConnection,
    repo_id: Uuid,
) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM default_repositories WHERE id = $1")
        .bind(repo_id)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound {
            entity: "default repository",
        });
    }
    Ok(())
}

/// Antivirus defaults applicable to an OS.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn list_antivirus_defaults_for_os(
    conn: &mut PgConnection,
    platform_release: &str,
) -> Result<Vec<AntivirusDefault>, DbError> {
    let defaults = sqlx::query_as::<_, AntivirusDefault>(
        r"SELECT * FROM antivirus_defaults
          WHERE lower($1) LIKE lower(os_name) || '%'",
    )
    .bind(platform_release)
    .fetch_all(conn)
    .await?;

    Ok(defaults)
}

/// Set (upsert) the antivirus default for an OS.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn upsert_antivirus_default(
    conn: &mut PgConnection,
    os_name: &str,
    antivirus_package: &str,
) -> Result<AntivirusDefault, DbError> {
    let row = sqlx::query_as::<_, AntivirusDefault>(
        r"INSERT INTO antivirus_defaults (os_name, antivirus_package)
          VALUES ($1, $2)
          ON CONFLICT (os_name) DO UPDATE SET antivirus_package = EXCLUDED.antivirus_package
          RETURNING *",
    )
    .bind(os_name)
    .bind(antivirus_package)
    .fetch_one(conn)
    .await?;

    Ok(row)
}

/// Package managers enabled by default for a distribution.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn list_enabled_package_managers_for_os(
    conn: &mut PgConnection,
    distribution: &str,
) -> Result<Vec<EnabledPackageManager>, DbError> {
    let managers = sqlx::query_as::<_, EnabledPackageManager>(
        "SELECT * FROM enabled_package_managers WHERE lower(os_name) = lower($1)",
    )
    .bind(distribution)
    .fetch_all(conn)
    .await?;

    Ok(managers)
}
