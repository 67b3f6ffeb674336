//! Password reset tokens. Single-use, 24 h expiry; consumption is an atomic
//! conditional update so a token can never be spent twice.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::PasswordResetToken;

/// Insert a fresh reset token for a user.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn insert_token(
    conn: &mut PgConnection,
    user_id: Uuid,
    token: Uuid,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<PasswordResetToken, DbError> {
    let row = sqlx::query_as::<_, PasswordResetToken>(
        r"INSERT INTO password_reset_tokens (user_id, token, created_at, expires_at)
          VALUES ($1, $2, $3, $4)
          RETURNING *",
    )
    .bind(user_id)
    .bind(token)
    .bind(now)
    .bind(expires_at)
    .fetch_one(conn)
    .await?;

    Ok(row)
}

/// Look up a token regardless of state, for validation messaging.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn find_token(
    conn: &mut PgConnection,
    token: Uuid,
) -> Result<Option<PasswordResetToken>, DbError> {
    let row = sqlx::query_as::<_, PasswordResetToken>(
        "SELECT * FROM password_reset_tokens WHERE token = $1",
    )
    .bind(token)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

/// Atomically consume a token: only an unused, unexpired token matches.
/// Returns the consumed row, or None if the token was invalid, expired, or
/// already spent.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn consume_token(
    conn: &mut PgConnection,
    token: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<PasswordResetToken>, DbError> {
    let row = sqlx::query_as::<_, PasswordResetToken>(
        r"UPDATE password_reset_tokens
          SET used_at = $2
          WHERE token = $1 AND used_at IS NULL AND expires_at > $2
          RETURNING *",
    )
    .bind(token)
    .bind(now)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

/// Delete tokens expired before `cutoff`. Returns the number deleted.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn purge_expired(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM password_reset_tokens WHERE expires_at < $1")
        .bind(cutoff)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}
