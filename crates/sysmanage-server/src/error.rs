//! Service error taxonomy.
//!
//! One stable set of error kinds regardless of transport. Domain errors from
//! the core and persistence crates translate here once; the HTTP/WS edges
//! turn an [`ApiError`] into a status code or an `error` frame. Permission
//! denials are deliberately distinct from not-found so probing cannot map
//! hidden entities.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use sysmanage_core::error::{
    AuditError, CertError, LoginError, QueueError, RbacError, VaultError,
};
use sysmanage_db::DbError;

/// Application-level error returned from public service operations.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Request fails validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing or expired credentials.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// RBAC check failed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Target entity does not exist or is not visible.
    #[error("not found: {0}")]
    NotFound(String),

    /// Wrong-state transition or duplicate.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Throttled.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A downstream dependency (vault, SMTP, CVE source) failed.
    #[error("dependency failed: {0}")]
    DependencyFailed(String),

    /// The agent reported a failure.
    #[error("agent error: {0}")]
    AgentError(String),

    /// Unhandled; logged with context, opaque to the caller.
    #[error("internal error")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    /// Machine-readable kind tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::RateLimited(_) => "rate_limited",
            Self::DependencyFailed(_) => "dependency_failed",
            Self::AgentError(_) => "agent_error",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            Self::PermissionDenied(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::RateLimited(msg) => (StatusCode::TOO_MANY_REQUESTS, msg.clone()),
            Self::DependencyFailed(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            Self::AgentError(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: self.kind(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity } => Self::NotFound(format!("{entity} not found")),
            DbError::Conflict { reason } => Self::Conflict(reason),
            DbError::Stale { .. } | DbError::Sqlx(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<RbacError> for ApiError {
    fn from(err: RbacError) -> Self {
        match err {
            RbacError::Denied { .. } => Self::PermissionDenied(err.to_string()),
            RbacError::UserNotFound => Self::Unauthenticated("user not found".to_owned()),
            RbacError::Db(inner) => inner.into(),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound { .. } => Self::NotFound(err.to_string()),
            QueueError::Terminal { .. } => Self::Conflict(err.to_string()),
            QueueError::Serialization { .. } => Self::InvalidInput(err.to_string()),
            QueueError::Db(inner) => inner.into(),
        }
    }
}

impl From<LoginError> for ApiError {
    fn from(err: LoginError) -> Self {
        match err {
            LoginError::InvalidCredentials => Self::Unauthenticated(err.to_string()),
            LoginError::AccountLocked => Self::PermissionDenied(err.to_string()),
            LoginError::RateLimited { reason } => Self::RateLimited(reason),
            LoginError::WeakPassword { .. } | LoginError::InvalidResetToken { .. } => {
                Self::InvalidInput(err.to_string())
            }
            LoginError::Hashing { .. } => Self::Internal(err.to_string()),
            LoginError::Db(inner) => inner.into(),
        }
    }
}

impl From<CertError> for ApiError {
    fn from(err: CertError) -> Self {
        match err {
            CertError::InvalidRequest { .. } => Self::InvalidInput(err.to_string()),
            CertError::Generation { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound { .. } => Self::NotFound(err.to_string()),
            VaultError::Request { .. } | VaultError::Malformed { .. } => {
                Self::DependencyFailed(err.to_string())
            }
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        DbError::from(err).into()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ApiError::InvalidInput(String::new()).kind(), "invalid_input");
        assert_eq!(ApiError::RateLimited(String::new()).kind(), "rate_limited");
        assert_eq!(
            ApiError::DependencyFailed(String::new()).kind(),
            "dependency_failed"
        );
    }

    #[test]
    fn permission_denied_is_distinct_from_not_found() {
        let denied: ApiError = RbacError::Denied { role: "EDIT_TAGS" }.into();
        let missing: ApiError = DbError::NotFound { entity: "tag" }.into();
        assert_eq!(denied.kind(), "permission_denied");
        assert_eq!(missing.kind(), "not_found");
    }

    #[test]
    fn duplicate_maps_to_conflict() {
        let err: ApiError = DbError::Conflict {
            reason: "duplicate key".to_owned(),
        }
        .into();
        assert_eq!(err.kind(), "conflict");
    }
}
