//! Message queue rows — the durable per-host command/event store.
//!
//! Dequeue uses `FOR UPDATE SKIP LOCKED` so concurrent drainers never pick
//! the same entry, and every transition out of `pending`/`in_flight` is a
//! conditional update: a terminal entry (`delivered`, `failed`, `expired`)
//! can never be revived, and an expired entry can never be delivered even
//! when the expiry sweep races a dequeue.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{QueueDirection, QueueEntry, QueuePriority, QueueStatus};

/// Fields for a new queue entry.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub message_type: String,
    pub payload: serde_json::Value,
    pub direction: QueueDirection,
    pub host_id: Option<Uuid>,
    pub priority: QueuePriority,
    pub max_attempts: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
}

/// Insert a new entry in `pending` state with `next_attempt_at = now`.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn insert_entry(
    conn: &mut PgConnection,
    new: &NewQueueEntry,
    now: DateTime<Utc>,
) -> Result<QueueEntry, DbError> {
    let entry = sqlx::query_as::<_, QueueEntry>(
        r"INSERT INTO message_queue
            (message_type, payload, direction, host_id, priority, status,
             attempts, max_attempts, next_attempt_at, expires_at, created_at,
             correlation_id)
          VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $8, $7, $9)
          RETURNING *",
    )
    .bind(&new.message_type)
    .bind(&new.payload)
    .bind(new.direction)
    .bind(new.host_id)
    .bind(new.priority)
    .bind(new.max_attempts)
    .bind(now)
    .bind(new.expires_at)
    .bind(&new.correlation_id)
    .fetch_one(conn)
    .await?;

    Ok(entry)
}

/// Atomically pick up to `max` due pending outbound entries for a host,
/// mark them `in_flight`, and return them in delivery order
/// (priority DESC, created_at ASC).
///
/// Entries whose `expires_at` has passed are skipped; the expiry sweep may
/// run concurrently without producing a double outcome.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn lock_pending_outbound(
    conn: &mut PgConnection,
    host_id: Uuid,
    max: i64,
    now: DateTime<Utc>,
) -> Result<Vec<QueueEntry>, DbError> {
    let entries = sqlx::query_as::<_, QueueEntry>(
        r"WITH picked AS (
            SELECT id FROM message_queue
            WHERE direction = 'outbound'
              AND host_id = $1
              AND status = 'pending'
              AND next_attempt_at <= $2
              AND (expires_at IS NULL OR expires_at > $2)
            ORDER BY priority DESC, created_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
          ), flipped AS (
            UPDATE message_queue m
            SET status = 'in_flight'
            FROM picked
            WHERE m.id = picked.id
            RETURNING m.*
          )
          SELECT * FROM flipped ORDER BY priority DESC, created_at ASC",
    )
    .bind(host_id)
    .bind(now)
    .bind(max)
    .fetch_all(conn)
    .await?;

    Ok(entries)
}

/// Same pickup as [`lock_pending_outbound`] but for inbound entries,
/// ignoring `host_id`.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn lock_pending_inbound(
    conn: &mut PgConnection,
    max: i64,
    now: DateTime<Utc>,
) -> Result<Vec<QueueEntry>, DbError> {
    let entries = sqlx::query_as::<_, QueueEntry>(
        r"WITH picked AS (
            SELECT id FROM message_queue
            WHERE direction = 'inbound'
              AND status = 'pending'
              AND next_attempt_at <= $1
              AND (expires_at IS NULL OR expires_at > $1)
            ORDER BY priority DESC, created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
          ), flipped AS (
            UPDATE message_queue m
            SET status = 'in_flight'
            FROM picked
            WHERE m.id = picked.id
            RETURNING m.*
          )
          SELECT * FROM flipped ORDER BY priority DESC, created_at ASC",
    )
    .bind(now)
    .bind(max)
    .fetch_all(conn)
    .await?;

    Ok(entries)
}

/// Get an entry by ID with a row lock, for ack transitions.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the entry does not exist.
pub async fn get_entry_for_update(
    conn: &mut PgConnection,
    entry_id: Uuid,
) -> Result<QueueEntry, DbError> {
    sqlx::query_as::<_, QueueEntry>("SELECT * FROM message_queue WHERE id = $1 FOR UPDATE")
        .bind(entry_id)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound {
            entity: "queue entry",
        })
}

/// Look up the originating command for a result message.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn get_entry_by_correlation(
    conn: &mut PgConnection,
    correlation_id: &str,
) -> Result<Option<QueueEntry>, DbError> {
    let entry = sqlx::query_as::<_, QueueEntry>(
        r"SELECT * FROM message_queue
          WHERE correlation_id = $1 AND direction = 'outbound'
          ORDER BY created_at DESC
          LIMIT 1",
    )
    .bind(correlation_id)
    .fetch_optional(conn)
    .await?;

    Ok(entry)
}

/// Transition `in_flight -> delivered`. Idempotent: acking an entry that is
/// already delivered is a no-op; a `failed`/`expired` entry stays terminal.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn mark_delivered(conn: &mut PgConnection, entry_id: Uuid) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE message_queue SET status = 'delivered' WHERE id = $1 AND status = 'in_flight'",
    )
    .bind(entry_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Reschedule a retryable entry: bump `attempts`, push `next_attempt_at`,
/// return it to `pending`.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn reschedule_entry(
    conn: &mut PgConnection,
    entry_id: Uuid,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r"UPDATE message_queue
          SET status = 'pending', attempts = attempts + 1,
              next_attempt_at = $2, error_message = $3
          WHERE id = $1 AND status = 'in_flight'",
    )
    .bind(entry_id)
    .bind(next_attempt_at)
    .bind(error)
    .execute(conn)
    .await?;

    Ok(())
}

/// Terminally fail an entry, recording the error.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn mark_failed(
    conn: &mut PgConnection,
    entry_id: Uuid,
    error: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r"UPDATE message_queue
          SET status = 'failed', attempts = attempts + 1, error_message = $2
          WHERE id = $1 AND status IN ('pending', 'in_flight')",
    )
    .bind(entry_id)
    .bind(error)
    .execute(conn)
    .await?;

    Ok(())
}

/// Expire every non-terminal entry whose `expires_at` has passed. Returns
/// the number of entries expired.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn expire_stale(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<u64, DbError> {
    let result = sqlx::query(
        r"UPDATE message_queue
          SET status = 'expired'
          WHERE status IN ('pending', 'in_flight') AND expires_at < $1",
    )
    .bind(now)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Delete terminal entries older than `cutoff`. Returns the number deleted.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn cleanup_terminal(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        r"DELETE FROM message_queue
          WHERE status IN ('delivered', 'failed', 'expired') AND created_at < $1",
    )
    .bind(cutoff)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Revert every `in_flight` outbound entry for a host to `pending`. Run by
/// the recovery sweep when a connection ends, so an undelivered command is
/// resumed on reconnect.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn revert_in_flight(
    conn: &mut PgConnection,
    host_id: Uuid,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        r"UPDATE message_queue
          SET status = 'pending'
          WHERE host_id = $1 AND direction = 'outbound' AND status = 'in_flight'",
    )
    .bind(host_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Count entries per status for a host (or globally when `host_id` is None).
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn count_by_status(
    conn: &mut PgConnection,
    host_id: Option<Uuid>,
    status: QueueStatus,
) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar(
        r"SELECT count(*) FROM message_queue
          WHERE status = $1 AND ($2::uuid IS NULL OR host_id = $2)",
    )
    .bind(status)
    .bind(host_id)
    .fetch_one(conn)
    .await?;

    Ok(count)
}
