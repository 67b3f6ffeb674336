//! CVE repository — refresh settings, vulnerability records, package
//! mappings, and per-run ingestion logs.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{CveSettings, IngestionLog, PackageMapping, VulnerabilityRecord};

/// The singleton refresh settings row, if configured.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn get_settings(conn: &mut PgConnection) -> Result<Option<CveSettings>, DbError> {
    let settings =
        sqlx::query_as::<_, CveSettings>("SELECT * FROM cve_settings LIMIT 1")
            .fetch_optional(conn)
            .await?;

    Ok(settings)
}

/// Record a completed refresh cycle and schedule the next one.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn mark_refreshed(
    conn: &mut PgConnection,
    settings_id: Uuid,
    now: DateTime<Utc>,
    next_refresh_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        r"UPDATE cve_settings
          SET last_refresh_at = $2, next_refresh_at = $3, updated_at = $2
          WHERE id = $1",
    )
    .bind(settings_id)
    .bind(now)
    .bind(next_refresh_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Upsert one vulnerability by `(cve_id, source)`.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn upsert_vulnerability(
    conn: &mut PgConnection,
    record: &VulnerabilityRecord,
) -> Result<(), DbError> {
    sqlx::query(
        r"INSERT INTO vulnerabilities
            (cve_id, source, severity, cvss_score, description, published_at,
             modified_at, ingested_at)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
          ON CONFLICT (cve_id, source) DO UPDATE
          SET severity = EXCLUDED.severity,
              cvss_score = EXCLUDED.cvss_score,
              description = EXCLUDED.description,
              modified_at = EXCLUDED.modified_at,
              ingested_at = EXCLUDED.ingested_at",
    )
    .bind(&record.cve_id)
    .bind(&record.source)
    .bind(&record.severity)
    .bind(record.cvss_score)
    .bind(&record.description)
    .bind(record.published_at)
    .bind(record.modified_at)
    .bind(record.ingested_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Upsert a package mapping by `(cve_id, package_name)`.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn upsert_package_mapping(
    conn: &mut PgConnection,
    mapping: &PackageMapping,
) -> Result<(), DbError> {
    sqlx::query(
        r"INSERT INTO package_mappings
            (cve_id, package_name, affected_versions, fixed_version)
          VALUES ($1, $2, $3, $4)
          ON CONFLICT (cve_id, package_name) DO UPDATE
          SET affected_versions = EXCLUDED.affected_versions,
              fixed_version = EXCLUDED.fixed_version",
    )
    .bind(&mapping.cve_id)
    .bind(&mapping.package_name)
    .bind(&mapping.affected_versions)
    .bind(&mapping.fixed_version)
    .execute(conn)
    .await?;

    Ok(())
}

/// Append an ingestion log row for one source's refresh run.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn insert_ingestion_log(
    conn: &mut PgConnection,
    log: &IngestionLog,
) -> Result<(), DbError> {
    sqlx::query(
        r"INSERT INTO ingestion_logs
            (id, source, status, vulnerabilities_processed, packages_processed,
             error_message, started_at, completed_at)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(log.id)
    .bind(&log.source)
    .bind(&log.status)
    .bind(log.vulnerabilities_processed)
    .bind(log.packages_processed)
    .bind(&log.error_message)
    .bind(log.started_at)
    .bind(log.completed_at)
    .execute(conn)
    .await?;

    Ok(())
}
