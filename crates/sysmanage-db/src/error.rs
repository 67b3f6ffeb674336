//! Error type for the persistence layer.
//!
//! Distinguishes "row absent" and "uniqueness conflict" from generic driver
//! failures so the service layer can map them to `not_found` / `conflict`
//! without string-matching.

/// Errors from repository operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The requested row does not exist.
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    /// A uniqueness or foreign-key constraint was violated.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// The row was concurrently modified and the conditional update matched
    /// nothing.
    #[error("stale update on {entity}")]
    Stale { entity: &'static str },

    /// The underlying driver returned an error.
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() || db_err.is_foreign_key_violation() {
                return Self::Conflict {
                    reason: db_err.message().to_owned(),
                };
            }
        }
        Self::Sqlx(err)
    }
}
