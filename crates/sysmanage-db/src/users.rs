//! User repository — accounts, role grants, and the lockout counters.
//!
//! Failed-login increments take a row lock so two concurrent failures cannot
//! both read the same counter value.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::User;

/// Insert a new account.
///
/// # Errors
///
/// Returns `DbError::Conflict` if the userid is already taken.
pub async fn create_user(
    conn: &mut PgConnection,
    userid: &str,
    hashed_password: &str,
    is_admin: bool,
) -> Result<User, DbError> {
    let user = sqlx::query_as::<_, User>(
        r"INSERT INTO users (userid, hashed_password, is_admin)
          VALUES ($1, $2, $3)
          RETURNING *",
    )
    .bind(userid)
    .bind(hashed_password)
    .bind(is_admin)
    .fetch_one(conn)
    .await?;

    Ok(user)
}

/// Get a user by ID.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the user does not exist.
pub async fn get_user(conn: &mut PgConnection, user_id: Uuid) -> Result<User, DbError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound { entity: "user" })
}

/// Get a user by login identity (email).
///
/// # Errors
///
/// Returns `DbError::NotFound` if the user does not exist.
pub async fn get_user_by_userid(conn: &mut PgConnection, userid: &str) -> Result<User, DbError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE userid = $1")
        .bind(userid)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound { entity: "user" })
}

/// Get a user by ID with a row lock, for failed-login counter updates.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the user does not exist.
pub async fn get_user_for_update(conn: &mut PgConnection, user_id: Uuid) -> Result<User, DbError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound { entity: "user" })
}

/// Increment the failed-login counter, locking the account when the new
/// count reaches `max_failed`. Returns the updated row.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the user does not exist.
pub async fn record_failed_login(
    conn: &mut PgConnection,
    user_id: Uuid,
    max_failed: i32,
    now: DateTime<Utc>,
) -> Result<User, DbError> {
    let user = get_user_for_update(&mut *conn, user_id).await?;
    let attempts = user.failed_login_attempts + 1;
    let lock_now = attempts >= max_failed && !user.is_locked;

    let user = sqlx::query_as::<_, User>(
        r"UPDATE users
          SET failed_login_attempts = $2,
              is_locked = is_locked OR $3,
              locked_at = CASE WHEN $3 THEN $4 ELSE locked_at END,
              updated_at = $4
          WHERE id = $1
          RETURNING *",
    )
    .bind(user_id)
    .bind(attempts)
    .bind(lock_now)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(user)
}

/// Clear the failed-login counter and any lock after a successful login.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn reset_failed_logins(
    conn: &mut PgConnection,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        r"UPDATE users
          SET failed_login_attempts = 0, is_locked = false, locked_at = NULL, updated_at = $2
          WHERE id = $1",
    )
    .bind(user_id)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

/// Manually lock an account.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn lock_user(
    conn: &mut PgConnection,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        r"UPDATE users
          SET is_locked = true, failed_login_attempts = 0, locked_at = $2, updated_at = $2
          WHERE id = $1",
    )
    .bind(user_id)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

/// Manually unlock an account.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn unlock_user(
    conn: &mut PgConnection,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        r"UPDATE users
          SET is_locked = false, failed_login_attempts = 0, locked_at = NULL, updated_at = $2
          WHERE id = $1",
    )
    .bind(user_id)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

/// Replace the stored password hash.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the user does not exist.
pub async fn update_password(
    conn: &mut PgConnection,
    user_id: Uuid,
    hashed_password: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r"UPDATE users
          SET hashed_password = $2, password_reset_required = false, updated_at = $3
          WHERE id = $1",
    )
    .bind(user_id)
    .bind(hashed_password)
    .bind(now)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: "user" });
    }
    Ok(())
}

/// Mark every account for a forced password reset. Used after a salt
/// rotation, when no stored hash can verify any more.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn require_password_reset_all(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result =
        sqlx::query("UPDATE users SET password_reset_required = true, updated_at = $1")
            .bind(now)
            .execute(conn)
            .await?;

    Ok(result.rows_affected())
}

/// Load the role names granted to a user.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn load_role_names(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<Vec<String>, DbError> {
    let roles: Vec<String> =
        sqlx::query_scalar("SELECT role FROM user_roles WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(conn)
            .await?;

    Ok(roles)
}

/// Grant a role to a user. Idempotent.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn grant_role(
    conn: &mut PgConnection,
    user_id: Uuid,
    role: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO user_roles (user_id, role) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(user_id)
    .bind(role)
    .execute(conn)
    .await?;

    Ok(())
}

/// Revoke a role from a user.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn revoke_role(
    conn: &mut PgConnection,
    user_id: Uuid,
    role: &str,
) -> Result<(), DbError> {
    sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role = $2")
        .bind(user_id)
        .bind(role)
        .execute(conn)
        .await?;

    Ok(())
}
