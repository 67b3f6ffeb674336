//! RBAC engine.
//!
//! Roles are a closed enumeration; a user's grants are loaded once per
//! logical request into a bitset cache. `is_admin` implies every role.
//! A failed check is `permission_denied`, deliberately distinct from
//! `not_found` so probing cannot distinguish hidden entities from
//! forbidden ones.

use sqlx::PgConnection;
use uuid::Uuid;

use sysmanage_db::users as users_repo;

use crate::error::RbacError;

/// Operational capabilities. The discriminant indexes the role bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecurityRole {
    ApproveHostRegistration = 0,
    DeleteHost = 1,
    EditTags = 2,
    AddHostAccount = 3,
    DeleteHostAccount = 4,
    AddSecret = 5,
    EditSecret = 6,
    DeleteSecret = 7,
    EnableFirewall = 8,
    DeployFirewall = 9,
    ViewDefaultRepositories = 10,
    AddDefaultRepository = 11,
    RemoveDefaultRepository = 12,
    ManageAntivirusDefaults = 13,
    EnableGrafanaIntegration = 14,
    EnableGraylogIntegration = 15,
    ApplySoftwareUpdate = 16,
    ManageChildHosts = 17,
    RequestDiagnostics = 18,
    ManageUsers = 19,
    ManageCveSettings = 20,
}

impl SecurityRole {
    /// Canonical storage spelling of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApproveHostRegistration => "APPROVE_HOST_REGISTRATION",
            Self::DeleteHost => "DELETE_HOST",
            Self::EditTags => "EDIT_TAGS",
            Self::AddHostAccount => "ADD_HOST_ACCOUNT",
            Self::DeleteHostAccount => "DELETE_HOST_ACCOUNT",
            Self::AddSecret => "ADD_SECRET",
            Self::EditSecret => "EDIT_SECRET",
            Self::DeleteSecret => "DELETE_SECRET",
            Self::EnableFirewall => "ENABLE_FIREWALL",
            Self::DeployFirewall => "DEPLOY_FIREWALL",
            Self::ViewDefaultRepositories => "VIEW_DEFAULT_REPOSITORIES",
            Self::AddDefaultRepository => "ADD_DEFAULT_REPOSITORY",
            Self::RemoveDefaultRepository => "REMOVE_DEFAULT_REPOSITORY",
            Self::ManageAntivirusDefaults => "MANAGE_ANTIVIRUS_DEFAULTS",
            Self::EnableGrafanaIntegration => "ENABLE_GRAFANA_INTEGRATION",
            Self::EnableGraylogIntegration => "ENABLE_GRAYLOG_INTEGRATION",
            Self::ApplySoftwareUpdate => "APPLY_SOFTWARE_UPDATE",
            Self::ManageChildHosts => "MANAGE_CHILD_HOSTS",
            Self::RequestDiagnostics => "REQUEST_DIAGNOSTICS",
            Self::ManageUsers => "MANAGE_USERS",
            Self::ManageCveSettings => "MANAGE_CVE_SETTINGS",
        }
    }

    /// Parse a stored role name. Unknown names are ignored by the cache
    /// loader rather than failing the whole request.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        ALL_ROLES.iter().copied().find(|r| r.as_str() == name)
    }
}

/// Every role, in discriminant order.
pub const ALL_ROLES: [SecurityRole; 21] = [
    SecurityRole::ApproveHostRegistration,
    SecurityRole::DeleteHost,
    SecurityRole::EditTags,
    SecurityRole::AddHostAccount,
    SecurityRole::DeleteHostAccount,
    SecurityRole::AddSecret,
    SecurityRole::EditSecret,
    SecurityRole::DeleteSecret,
    SecurityRole::EnableFirewall,
    SecurityRole::DeployFirewall,
    SecurityRole::ViewDefaultRepositories,
    SecurityRole::AddDefaultRepository,
    SecurityRole::RemoveDefaultRepository,
    SecurityRole::ManageAntivirusDefaults,
    SecurityRole::EnableGrafanaIntegration,
    SecurityRole::EnableGraylogIntegration,
    SecurityRole::ApplySoftwareUpdate,
    SecurityRole::ManageChildHosts,
    SecurityRole::RequestDiagnostics,
    SecurityRole::ManageUsers,
    SecurityRole::ManageCveSettings,
];

/// Per-request role cache: one bit per role, plus the admin short-circuit.
/// Never shared between requests.
#[derive(Debug, Clone, Copy)]
pub struct RoleCache {
    bits: u64,
    is_admin: bool,
}

impl RoleCache {
    /// Build a cache from granted role names. Unknown names are skipped.
    #[must_use]
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>, is_admin: bool) -> Self {
        let mut bits = 0u64;
        for name in names {
            if let Some(role) = SecurityRole::parse(name) {
                bits |= 1 << (role as u8);
            }
        }
        Self { bits, is_admin }
    }

    /// Load the acting user's grants from storage.
    ///
    /// # Errors
    ///
    /// Returns [`RbacError::Db`] if the role query fails.
    pub async fn load(
        conn: &mut PgConnection,
        user_id: Uuid,
        is_admin: bool,
    ) -> Result<Self, RbacError> {
        let names = users_repo::load_role_names(conn, user_id).await?;
        Ok(Self::from_names(names.iter().map(String::as_str), is_admin))
    }

    /// Whether the cached user holds the role (admins hold all).
    #[must_use]
    pub const fn has_role(&self, role: SecurityRole) -> bool {
        self.is_admin || self.bits & (1 << (role as u8)) != 0
    }

    /// Assert the role, failing with a denial that names it.
    ///
    /// # Errors
    ///
    /// Returns [`RbacError::Denied`] if the role is missing.
    pub const fn require(&self, role: SecurityRole) -> Result<(), RbacError> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(RbacError::Denied {
                role: role.as_str(),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn admin_implies_all_roles() {
        let cache = RoleCache::from_names([], true);
        for role in ALL_ROLES {
            assert!(cache.has_role(role), "admin missing {}", role.as_str());
        }
    }

    #[test]
    fn granted_roles_only() {
        let cache = RoleCache::from_names(["EDIT_TAGS", "ADD_SECRET"], false);
        assert!(cache.has_role(SecurityRole::EditTags));
        assert!(cache.has_role(SecurityRole::AddSecret));
        assert!(!cache.has_role(SecurityRole::ApproveHostRegistration));
        assert!(!cache.has_role(SecurityRole::DeleteSecret));
    }

    #[test]
    fn unknown_names_are_skipped() {
        let cache = RoleCache::from_names(["NOT_A_ROLE", "EDIT_TAGS"], false);
        assert!(cache.has_role(SecurityRole::EditTags));
    }

    #[test]
    fn require_names_the_missing_role() {
        let cache = RoleCache::from_names([], false);
        let err = cache
            .require(SecurityRole::ApproveHostRegistration)
            .unwrap_err();
        assert!(err.to_string().contains("APPROVE_HOST_REGISTRATION"));
    }

    #[test]
    fn parse_round_trips_every_role() {
        for role in ALL_ROLES {
            assert_eq!(SecurityRole::parse(role.as_str()), Some(role));
        }
    }
}
