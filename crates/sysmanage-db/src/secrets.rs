//! Secret metadata repository. Secret content lives in the external vault;
//! these rows only reference it by path and scoped token.

use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::SecretRecord;

/// Insert a new secret reference.
///
/// # Errors
///
/// Returns `DbError::Conflict` if the name is already taken.
pub async fn insert_secret(
    conn: &mut PgConnection,
    name: &str,
    secret_type: &str,
    secret_subtype: Option<&str>,
    vault_token: &str,
    vault_path: &str,
) -> Result<SecretRecord, DbError> {
    let secret = sqlx::query_as::<_, SecretRecord>(
        r"INSERT INTO secrets (name, secret_type, secret_subtype, vault_token, vault_path)
          VALUES ($1, $2, $3, $4, $5)
          RETURNING *",
    )
    .bind(name)
    .bind(secret_type)
    .bind(secret_subtype)
    .bind(vault_token)
    .bind(vault_path)
    .fetch_one(conn)
    .await?;

    Ok(secret)
}

/// Get a secret reference by ID.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the secret does not exist.
pub async fn get_secret(conn: &mut PgConnection, secret_id: Uuid) -> Result<SecretRecord, DbError> {
    sqlx::query_as::<_, SecretRecord>("SELECT * FROM secrets WHERE id = $1")
        .bind(secret_id)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound { entity: "secret" })
}

/// List all secret references (metadata only).
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn list_secrets(conn: &mut PgConnection) -> Result<Vec<SecretRecord>, DbError> {
    let secrets =
        sqlx::query_as::<_, SecretRecord>("SELECT * FROM secrets ORDER BY name")
            .fetch_all(conn)
            .await?;

    Ok(secrets)
}

/// Delete a secret reference. Callers must have already deleted the vault
/// content — the row is kept if the vault delete fails.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the secret does not exist.
pub async fn delete_secret(conn: &mut PgConnection, secret_id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM secrets WHERE id = $1")
        .bind(secret_id)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: "secret" });
    }
    Ok(())
}
