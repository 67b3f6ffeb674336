//! Error types for `sysmanage-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Security errors never include token or key material — only
//! identifiers or operation descriptions.

use sysmanage_db::DbError;

/// Errors from the audit log service.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The entry could not be persisted.
    #[error("audit write failed: {0}")]
    Db(#[from] DbError),

    /// Details serialization failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors from the RBAC engine.
#[derive(Debug, thiserror::Error)]
pub enum RbacError {
    /// The acting user is missing a required role.
    #[error("permission denied: {role} role required")]
    Denied { role: &'static str },

    /// The acting user does not exist or is deactivated.
    #[error("user not found")]
    UserNotFound,

    /// Role load failed.
    #[error("rbac storage error: {0}")]
    Db(#[from] DbError),
}

/// Errors from the message queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The referenced entry does not exist.
    #[error("queue entry not found: {id}")]
    NotFound { id: uuid::Uuid },

    /// A transition was requested on an entry already in a terminal state.
    #[error("queue entry {id} is terminal ({status})")]
    Terminal { id: uuid::Uuid, status: String },

    /// Payload serialization failed.
    #[error("queue payload serialization failed: {reason}")]
    Serialization { reason: String },

    /// The underlying store returned an error.
    #[error("queue storage error: {0}")]
    Db(#[from] DbError),
}

/// Errors from login and session security.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    /// Credentials did not verify.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The account is locked.
    #[error("account is locked")]
    AccountLocked,

    /// The attempt was rejected by a rate limit or IP block.
    #[error("rate limited: {reason}")]
    RateLimited { reason: String },

    /// Password does not meet the policy.
    #[error("weak password: {reason}")]
    WeakPassword { reason: String },

    /// A reset token was invalid, expired, or already used.
    #[error("invalid reset token: {reason}")]
    InvalidResetToken { reason: String },

    /// Password hashing failed.
    #[error("password hashing failed: {reason}")]
    Hashing { reason: String },

    /// The underlying store returned an error.
    #[error("login storage error: {0}")]
    Db(#[from] DbError),
}

/// Errors from certificate issuance.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    /// Certificate or key generation failed.
    #[error("certificate generation failed: {reason}")]
    Generation { reason: String },

    /// The request was invalid (empty FQDN, ...).
    #[error("invalid certificate request: {reason}")]
    InvalidRequest { reason: String },
}

/// Errors from the external vault client.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The vault rejected the request or was unreachable.
    #[error("vault request failed: {reason}")]
    Request { reason: String },

    /// The vault response did not have the expected KV v2 shape.
    #[error("unexpected vault response at '{path}'")]
    Malformed { path: String },

    /// The secret was not found at the given path.
    #[error("secret not found at '{path}'")]
    NotFound { path: String },
}
