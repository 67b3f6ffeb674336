//! Audit log service.
//!
//! Every mutation and agent message gets exactly one audit entry, written
//! through the caller's open transaction so the mutation and its record
//! commit or roll back together. Entries are tamper-evident: the integrity
//! hash is SHA-256 over a canonical pipe-joined rendering of the core
//! fields, computed before insert and never recomputed.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use uuid::Uuid;

use sysmanage_db::audit as audit_repo;
use sysmanage_db::models::{AuditRecord, AuditResult};

use crate::error::AuditError;

/// Kind of action being audited. Closed enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Create,
    Update,
    Delete,
    Execute,
    AgentMessage,
    Login,
    Logout,
    LoginFailed,
    PasswordReset,
    PermissionChange,
}

impl ActionType {
    /// Canonical wire/storage spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Execute => "EXECUTE",
            Self::AgentMessage => "AGENT_MESSAGE",
            Self::Login => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::LoginFailed => "LOGIN_FAILED",
            Self::PasswordReset => "PASSWORD_RESET",
            Self::PermissionChange => "PERMISSION_CHANGE",
        }
    }
}

/// Kind of entity being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Host,
    Agent,
    User,
    Package,
    Script,
    Secret,
    Tag,
    Role,
    Repository,
    Certificate,
    Firewall,
    Antivirus,
    Update,
    Setting,
    Authentication,
}

impl EntityType {
    /// Canonical wire/storage spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Agent => "agent",
            Self::User => "user",
            Self::Package => "package",
            Self::Script => "script",
            Self::Secret => "secret",
            Self::Tag => "tag",
            Self::Role => "role",
            Self::Repository => "repository",
            Self::Certificate => "certificate",
            Self::Firewall => "firewall",
            Self::Antivirus => "antivirus",
            Self::Update => "update",
            Self::Setting => "setting",
            Self::Authentication => "authentication",
        }
    }
}

/// Optional context attached to an audit entry.
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub error_message: Option<String>,
    pub category: Option<String>,
}

/// Writes audit entries. Stateless; the transaction is the unit of coupling.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditWriter;

impl AuditWriter {
    /// Append one audit entry inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Db`] if the insert fails; the caller's
    /// transaction should then be rolled back so the mutation is not
    /// committed unaudited.
    pub async fn log(
        self,
        conn: &mut PgConnection,
        action_type: ActionType,
        entity_type: EntityType,
        description: &str,
        result: AuditResult,
        ctx: AuditContext,
    ) -> Result<AuditRecord, AuditError> {
        let id = Uuid::new_v4();
        let timestamp = Utc::now();

        let integrity_hash = integrity_hash(
            id,
            timestamp,
            ctx.user_id,
            action_type,
            entity_type,
            ctx.entity_id.as_deref(),
            description,
            result,
        );

        let record = AuditRecord {
            id,
            timestamp,
            user_id: ctx.user_id,
            username: ctx.username,
            action_type: action_type.as_str().to_owned(),
            entity_type: entity_type.as_str().to_owned(),
            entity_id: ctx.entity_id,
            entity_name: ctx.entity_name,
            description: description.to_owned(),
            details: ctx.details,
            ip_address: ctx.ip_address,
            user_agent: ctx.user_agent,
            result,
            error_message: ctx.error_message,
            category: ctx.category,
            integrity_hash,
        };

        audit_repo::insert_record(conn, &record).await?;

        Ok(record)
    }

    /// Log a CREATE with a standard description.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Db`] if the insert fails.
    pub async fn log_create(
        self,
        conn: &mut PgConnection,
        entity_type: EntityType,
        entity_name: &str,
        ctx: AuditContext,
    ) -> Result<AuditRecord, AuditError> {
        let description = format!("Created {} '{entity_name}'", entity_type.as_str());
        let ctx = AuditContext {
            entity_name: Some(entity_name.to_owned()),
            ..ctx
        };
        self.log(
            conn,
            ActionType::Create,
            entity_type,
            &description,
            AuditResult::Success,
            ctx,
        )
        .await
    }

    /// Log an UPDATE with a standard description.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Db`] if the insert fails.
    pub async fn log_update(
        self,
        conn: &mut PgConnection,
        entity_type: EntityType,
        entity_name: &str,
        ctx: AuditContext,
    ) -> Result<AuditRecord, AuditError> {
        let description = format!("Updated {} '{entity_name}'", entity_type.as_str());
        let ctx = AuditContext {
            entity_name: Some(entity_name.to_owned()),
            ..ctx
        };
        self.log(
            conn,
            ActionType::Update,
            entity_type,
            &description,
            AuditResult::Success,
            ctx,
        )
        .await
    }

    /// Log a DELETE with a standard description.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Db`] if the insert fails.
    pub async fn log_delete(
        self,
        conn: &mut PgConnection,
        entity_type: EntityType,
        entity_name: &str,
        ctx: AuditContext,
    ) -> Result<AuditRecord, AuditError> {
        let description = format!("Deleted {} '{entity_name}'", entity_type.as_str());
        let ctx = AuditContext {
            entity_name: Some(entity_name.to_owned()),
            ..ctx
        };
        self.log(
            conn,
            ActionType::Delete,
            entity_type,
            &description,
            AuditResult::Success,
            ctx,
        )
        .await
    }

    /// Log an agent message that caused (or failed to cause) a change on a
    /// remote host. The message type is folded into `details`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Db`] if the insert fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_agent_message(
        self,
        conn: &mut PgConnection,
        host_name: &str,
        message_type: &str,
        description: &str,
        result: AuditResult,
        ctx: AuditContext,
    ) -> Result<AuditRecord, AuditError> {
        let mut details = ctx.details.unwrap_or_else(|| serde_json::json!({}));
        if let Some(obj) = details.as_object_mut() {
            obj.insert(
                "message_type".to_owned(),
                serde_json::Value::String(message_type.to_owned()),
            );
        }
        let ctx = AuditContext {
            entity_name: Some(host_name.to_owned()),
            details: Some(details),
            ..ctx
        };
        self.log(
            conn,
            ActionType::AgentMessage,
            EntityType::Host,
            description,
            result,
            ctx,
        )
        .await
    }
}

/// Compute the tamper-evidence hash over the canonical pipe-joined fields.
///
/// Canonical rendering: UUIDs hyphenated lowercase, timestamp as a naive
/// UTC `YYYY-MM-DD HH:MM:SS.ffffff` string, absent optionals as `None`.
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn integrity_hash(
    id: Uuid,
    timestamp: DateTime<Utc>,
    user_id: Option<Uuid>,
    action_type: ActionType,
    entity_type: EntityType,
    entity_id: Option<&str>,
    description: &str,
    result: AuditResult,
) -> String {
    let parts = [
        id.to_string(),
        canonical_timestamp(timestamp),
        user_id.map_or_else(|| "None".to_owned(), |u| u.to_string()),
        action_type.as_str().to_owned(),
        entity_type.as_str().to_owned(),
        entity_id.map_or_else(|| "None".to_owned(), ToOwned::to_owned),
        description.to_owned(),
        result.to_string(),
    ];

    let digest = Sha256::digest(parts.join("|").as_bytes());
    hex::encode(digest)
}

/// The timestamp rendering hashed into every entry: naive UTC, space
/// separated, microsecond precision.
fn canonical_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .naive_utc()
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

/// Verify a stored record's integrity hash against its own fields.
#[must_use]
pub fn verify_record(record: &AuditRecord, action: ActionType, entity: EntityType) -> bool {
    let expected = integrity_hash(
        record.id,
        record.timestamp,
        record.user_id,
        action,
        entity,
        record.entity_id.as_deref(),
        &record.description,
        record.result,
    );
    expected == record.integrity_hash
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let id = Uuid::new_v4();
        let ts = Utc::now();
        let a = integrity_hash(
            id,
            ts,
            None,
            ActionType::Update,
            EntityType::Host,
            Some("abc"),
            "Updated host 'web01'",
            AuditResult::Success,
        );
        let b = integrity_hash(
            id,
            ts,
            None,
            ActionType::Update,
            EntityType::Host,
            Some("abc"),
            "Updated host 'web01'",
            AuditResult::Success,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hash_covers_every_core_field() {
        let id = Uuid::new_v4();
        let ts = Utc::now();
        let base = integrity_hash(
            id,
            ts,
            None,
            ActionType::Create,
            EntityType::Tag,
            None,
            "Created tag 'prod'",
            AuditResult::Success,
        );

        let other_result = integrity_hash(
            id,
            ts,
            None,
            ActionType::Create,
            EntityType::Tag,
            None,
            "Created tag 'prod'",
            AuditResult::Failure,
        );
        assert_ne!(base, other_result);

        let other_user = integrity_hash(
            id,
            ts,
            Some(Uuid::new_v4()),
            ActionType::Create,
            EntityType::Tag,
            None,
            "Created tag 'prod'",
            AuditResult::Success,
        );
        assert_ne!(base, other_user);

        let other_desc = integrity_hash(
            id,
            ts,
            None,
            ActionType::Create,
            EntityType::Tag,
            None,
            "Created tag 'dev'",
            AuditResult::Success,
        );
        assert_ne!(base, other_desc);
    }

    #[test]
    fn timestamps_canonicalize_naive_and_space_separated() {
        use chrono::TimeZone as _;
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(canonical_timestamp(ts), "2024-01-15 10:30:00.123456");
    }

    #[test]
    fn absent_optionals_render_as_none() {
        let id = Uuid::new_v4();
        let ts = Utc::now();
        let with_entity = integrity_hash(
            id,
            ts,
            None,
            ActionType::Delete,
            EntityType::Secret,
            Some("None"),
            "Deleted secret 'k'",
            AuditResult::Success,
        );
        let without_entity = integrity_hash(
            id,
            ts,
            None,
            ActionType::Delete,
            EntityType::Secret,
            None,
            "Deleted secret 'k'",
            AuditResult::Success,
        );
        // "None" the string and None the absence canonicalize identically,
        // matching the historical format.
        assert_eq!(with_entity, without_entity);
    }
}
