//! Tag repository — shared labels and the host↔tag association.

use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::Tag;

/// Create a tag.
///
/// # Errors
///
/// Returns `DbError::Conflict` if the name is already taken.
pub async fn create_tag(
    conn: &mut PgConnection,
    name: &str,
    description: Option<&str>,
) -> Result<Tag, DbError> {
    let tag = sqlx::query_as::<_, Tag>(
        "INSERT INTO tags (name, description) VALUES ($1, $2) RETURNING *",
    )
    .bind(name)
    .bind(description)
    .fetch_one(conn)
    .await?;

    Ok(tag)
}

/// Get a tag by ID.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the tag does not exist.
pub async fn get_tag(conn: &mut PgConnection, tag_id: Uuid) -> Result<Tag, DbError> {
    sqlx::query_as::<_, Tag>("SELECT * FROM tags WHERE id = $1")
        .bind(tag_id)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound { entity: "tag" })
}

/// List all tags, alphabetically.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn list_tags(conn: &mut PgConnection) -> Result<Vec<Tag>, DbError> {
    let tags = sqlx::query_as::<_, Tag>("SELECT * FROM tags ORDER BY name")
        .fetch_all(conn)
        .await?;

    Ok(tags)
}

/// Rename a tag or update its description.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the tag does not exist, `DbError::Conflict`
/// if the new name collides.
pub async fn update_tag(
    conn: &mut PgConnection,
    tag_id: Uuid,
    name: &str,
    description: Option<&str>,
) -> Result<Tag, DbError> {
    sqlx::query_as::<_, Tag>(
        "UPDATE tags SET name = $2, description = $3 WHERE id = $1 RETURNING *",
    )
    .bind(tag_id)
    .bind(name)
    .bind(description)
    .fetch_optional(conn)
    .await?
    .ok_or(DbError::NotFound { entity: "tag" })
}

/// Delete a tag. Host associations cascade.
///
/// # Errors
///
/// Returns `DbError::NotFound` if the tag does not exist.
pub async fn delete_tag(conn: &mut PgConnection, tag_id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM tags WHERE id = $1")
        .bind(tag_id)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: "tag" });
    }
    Ok(())
}

/// Attach a tag to a host. Idempotent.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn attach_tag(
    conn: &mut PgConnection,
    host_id: Uuid,
    tag_id: Uuid,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO host_tags (host_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(host_id)
    .bind(tag_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Detach a tag from a host.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn detach_tag(
    conn: &mut PgConnection,
    host_id: Uuid,
    tag_id: Uuid,
) -> Result<(), DbError> {
    sqlx::query("DELETE FROM host_tags WHERE host_id = $1 AND tag_id = $2")
        .bind(host_id)
        .bind(tag_id)
        .execute(conn)
        .await?;

    Ok(())
}

/// Tags attached to a host.
///
/// # Errors
///
/// Returns `DbError::Sqlx` on database failure.
pub async fn list_tags_for_host(
    conn: &mut PgConnection,
    host_id: Uuid,
) -> Result<Vec<Tag>, DbError> {
    let tags = sqlx::query_as::<_, Tag>(
        r"SELECT t.* FROM tags t
          JOIN host_tags ht ON ht.tag_id = t.id
          WHERE ht.host_id = $1
          ORDER BY t.name",
    )
    .bind(host_id)
    .fetch_all(conn)
    .await?;

    Ok(tags)
}
