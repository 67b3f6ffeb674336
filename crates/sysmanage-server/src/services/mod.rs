//! Public service operations (the surface the external HTTP façade calls).
//!
//! Every mutation follows the same shape: authenticate the caller, load the
//! per-request role cache, assert the required role, then inside a single
//! transaction read → validate → mutate → audit → enqueue follow-ups →
//! commit. Errors map to the stable taxonomy in [`crate::error::ApiError`].

pub mod agent_ops;
pub mod auth;
pub mod hosts;
pub mod integrations;
pub mod repositories;
pub mod secrets;
pub mod tags;

use sqlx::PgConnection;
use uuid::Uuid;

use sysmanage_core::rbac::RoleCache;
use sysmanage_db::models::User;
use sysmanage_db::users as users_repo;

use crate::error::ApiError;

/// The authenticated caller of a service operation.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: Uuid,
    pub username: String,
    pub roles: RoleCache,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Load the acting user and their role cache. The cache lives only for this
/// logical request.
///
/// # Errors
///
/// Returns [`ApiError::Unauthenticated`] when the user is missing or
/// deactivated.
pub async fn load_actor(
    conn: &mut PgConnection,
    current_user: &str,
    ip_address: Option<String>,
    user_agent: Option<String>,
) -> Result<(User, Actor), ApiError> {
    let user = users_repo::get_user_by_userid(conn, current_user)
        .await
        .map_err(|_| ApiError::Unauthenticated("user not found".to_owned()))?;

    if !user.active {
        return Err(ApiError::Unauthenticated("user is deactivated".to_owned()));
    }

    let roles = RoleCache::load(conn, user.id, user.is_admin).await?;
    let actor = Actor {
        user_id: user.id,
        username: user.userid.clone(),
        roles,
        ip_address,
        user_agent,
    };
    Ok((user, actor))
}

impl Actor {
    /// Audit context pre-filled with the caller's identity.
    #[must_use]
    pub fn audit_context(&self) -> sysmanage_core::audit::AuditContext {
        sysmanage_core::audit::AuditContext {
            user_id: Some(self.user_id),
            username: Some(self.username.clone()),
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
            ..sysmanage_core::audit::AuditContext::default()
        }
    }
}
