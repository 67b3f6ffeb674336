//! Audit log rows. Insert-only — the table is never updated or trimmed by
//! the application.

use sqlx::PgConnection;

use crate::error::DbError;
use crate::models::AuditRecord;

/// Append a fully populated audit record. The caller (the audit service)
/// owns id, timestamp, and integrity hash; this function only persists.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn insert_record(
    conn: &mut PgConnection,
    record: &AuditRecord,
) -> Result<(), DbError> {
    sqlx::query(
        r"INSERT INTO audit_log
            (id, timestamp, user_id, username, action_type, entity_type,
             entity_id, entity_name, description, details, ip_address,
             user_agent, result, error_message, category, integrity_hash)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
    )
    .bind(record.id)
    .bind(record.timestamp)
    .bind(record.user_id)
    .bind(&record.username)
    .bind(&record.action_type)
    .bind(&record.entity_type)
    .bind(&record.entity_id)
    .bind(&record.entity_name)
    .bind(&record.description)
    .bind(&record.details)
    .bind(&record.ip_address)
    .bind(&record.user_agent)
    .bind(record.result)
    .bind(&record.error_message)
    .bind(&record.category)
    .bind(&record.integrity_hash)
    .execute(conn)
    .await?;

    Ok(())
}
