//! Operator authentication: login, account lockout administration, and the
//! forgot/reset password flow.

use chrono::Utc;
use uuid::Uuid;

use sysmanage_core::audit::{ActionType, AuditContext, EntityType};
use sysmanage_core::login;
use sysmanage_core::rbac::SecurityRole;
use sysmanage_db::models::AuditResult;
use sysmanage_db::users as users_repo;

use crate::email::OutboundMail;
use crate::error::ApiError;
use crate::services::load_actor;
use crate::state::AppContext;

/// Authenticate an operator and mint a session token.
///
/// Order of checks: in-memory rate limits and IP blocks, then the durable
/// account lock, then the password. A wrong password feeds both the
/// in-memory windows and the durable counter, which locks the account at
/// `max_failed_logins`.
///
/// # Errors
///
/// Returns [`ApiError::RateLimited`] for throttled attempts,
/// [`ApiError::PermissionDenied`] for locked accounts, and
/// [`ApiError::Unauthenticated`] for bad credentials.
pub async fn login(
    ctx: &AppContext,
    userid: &str,
    password: &str,
    client_ip: &str,
    user_agent: Option<&str>,
) -> Result<String, ApiError> {
    ctx.login_tracker
        .validate_login_attempt(userid, client_ip)
        .await
        .map_err(ApiError::from)?;

    let mut tx = ctx.pool.begin().await?;

    let user = match users_repo::get_user_by_userid(&mut tx, userid).await {
        Ok(user) => user,
        Err(_) => {
            drop(tx);
            // Track the miss but answer uniformly.
            ctx.login_tracker.record_failed_login(userid, client_ip).await;
            return Err(ApiError::Unauthenticated("invalid credentials".to_owned()));
        }
    };

    let lockout_minutes = ctx.config.security.account_lockout_duration;
    if login::is_account_locked(&user, lockout_minutes, Utc::now()) {
        ctx.audit
            .log(
                &mut tx,
                ActionType::LoginFailed,
                EntityType::Authentication,
                &format!("Login rejected for locked account '{userid}'"),
                AuditResult::Failure,
                AuditContext {
                    user_id: Some(user.id),
                    username: Some(user.userid.clone()),
                    ip_address: Some(client_ip.to_owned()),
                    user_agent: user_agent.map(ToOwned::to_owned),
                    ..AuditContext::default()
                },
            )
            .await?;
        tx.commit().await?;
        return Err(ApiError::PermissionDenied("account is locked".to_owned()));
    }

    if !ctx.passwords.verify_password(password, &user.hashed_password) {
        ctx.login_tracker.record_failed_login(userid, client_ip).await;
        let locked_now = login::record_failed_login_for_user(
            &mut tx,
            user.id,
            ctx.config.security.max_failed_logins,
        )
        .await?;

        ctx.audit
            .log(
                &mut tx,
                ActionType::LoginFailed,
                EntityType::Authentication,
                &format!("Failed login for '{userid}'"),
                AuditResult::Failure,
                AuditContext {
                    user_id: Some(user.id),
                    username: Some(user.userid.clone()),
                    ip_address: Some(client_ip.to_owned()),
                    user_agent: user_agent.map(ToOwned::to_owned),
                    details: Some(serde_json::json!({"account_locked": locked_now})),
                    ..AuditContext::default()
                },
            )
            .await?;
        tx.commit().await?;
        return Err(ApiError::Unauthenticated("invalid credentials".to_owned()));
    }

    login::reset_failed_login_attempts(&mut tx, user.id).await?;
    ctx.login_tracker
        .record_successful_login(userid, client_ip)
        .await;

    ctx.audit
        .log(
            &mut tx,
            ActionType::Login,
            EntityType::Authentication,
            &format!("User '{userid}' logged in"),
            AuditResult::Success,
            AuditContext {
                user_id: Some(user.id),
                username: Some(user.userid.clone()),
                ip_address: Some(client_ip.to_owned()),
                user_agent: user_agent.map(ToOwned::to_owned),
                ..AuditContext::default()
            },
        )
        .await?;

    tx.commit().await?;

    let token = ctx
        .session_tokens
        .create(&user.id.to_string(), client_ip, Utc::now());
    Ok(token)
}

/// Manually lock a user account under `MANAGE_USERS`.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] for an unknown user.
pub async fn lock_user(
    ctx: &AppContext,
    current_user: &str,
    user_id: Uuid,
) -> Result<(), ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::ManageUsers)?;

    let target = users_repo::get_user(&mut tx, user_id).await?;
    users_repo::lock_user(&mut tx, user_id, Utc::now()).await?;

    ctx.audit
        .log(
            &mut tx,
            ActionType::PermissionChange,
            EntityType::User,
            &format!("Locked account '{}'", target.userid),
            AuditResult::Success,
            AuditContext {
                entity_id: Some(target.id.to_string()),
                entity_name: Some(target.userid.clone()),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Manually unlock a user account under `MANAGE_USERS`.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] for an unknown user.
pub async fn unlock_user(
    ctx: &AppContext,
    current_user: &str,
    user_id: Uuid,
) -> Result<(), ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let (_, actor) = load_actor(&mut tx, current_user, None, None).await?;
    actor.roles.require(SecurityRole::ManageUsers)?;

    let target = users_repo::get_user(&mut tx, user_id).await?;
    users_repo::unlock_user(&mut tx, user_id, Utc::now()).await?;

    ctx.audit
        .log(
            &mut tx,
            ActionType::PermissionChange,
            EntityType::User,
            &format!("Unlocked account '{}'", target.userid),
            AuditResult::Success,
            AuditContext {
                entity_id: Some(target.id.to_string()),
                entity_name: Some(target.userid.clone()),
                ..actor.audit_context()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Start the forgot-password flow: mint a 24 h single-use token and mail it.
/// Always answers uniformly so account existence does not leak.
///
/// # Errors
///
/// Returns [`ApiError::Internal`] only on storage failure — an unknown
/// address is not an error.
pub async fn forgot_password(ctx: &AppContext, userid: &str) -> Result<(), ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let Ok(user) = users_repo::get_user_by_userid(&mut tx, userid).await else {
        // Uniform response; nothing to do.
        return Ok(());
    };

    let token = login::generate_reset_token(&mut tx, user.id).await?;

    ctx.audit
        .log(
            &mut tx,
            ActionType::PasswordReset,
            EntityType::User,
            &format!("Password reset requested for '{userid}'"),
            AuditResult::Pending,
            AuditContext {
                user_id: Some(user.id),
                username: Some(user.userid.clone()),
                entity_id: Some(user.id.to_string()),
                ..AuditContext::default()
            },
        )
        .await?;

    tx.commit().await?;

    let mail = OutboundMail {
        to: user.userid.clone(),
        subject: "SysManage password reset".to_owned(),
        body_text: format!(
            "A password reset was requested for this account. Reset token: {}. \
             The token expires in 24 hours and can be used once.",
            token.token
        ),
        body_html: None,
    };
    if let Err(reason) = ctx.mailer.send(mail).await {
        return Err(ApiError::DependencyFailed(reason));
    }

    Ok(())
}

/// Complete a password reset: consume the token atomically and store the
/// new hash.
///
/// # Errors
///
/// Returns [`ApiError::InvalidInput`] for invalid/expired/spent tokens,
/// weak passwords, and tokens orphaned from a deleted user.
pub async fn reset_password(
    ctx: &AppContext,
    token: Uuid,
    new_password: &str,
) -> Result<(), ApiError> {
    ctx.passwords.check_strength(new_password)?;
    let hashed = ctx.passwords.hash_password(new_password)?;

    let mut tx = ctx.pool.begin().await?;

    let user_id = login::consume_reset_token(&mut tx, token).await?;
    users_repo::update_password(&mut tx, user_id, &hashed, Utc::now()).await?;

    let user = users_repo::get_user(&mut tx, user_id).await?;
    ctx.audit
        .log(
            &mut tx,
            ActionType::PasswordReset,
            EntityType::User,
            &format!("Password reset completed for '{}'", user.userid),
            AuditResult::Success,
            AuditContext {
                user_id: Some(user.id),
                username: Some(user.userid.clone()),
                entity_id: Some(user.id.to_string()),
                ..AuditContext::default()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Validate a session token and resolve the user it names.
///
/// # Errors
///
/// Returns [`ApiError::Unauthenticated`] for invalid or expired tokens.
pub async fn authenticate_session(
    ctx: &AppContext,
    token: &str,
    client_ip: &str,
) -> Result<Uuid, ApiError> {
    let user_id = ctx
        .session_tokens
        .validate(token, client_ip, Utc::now())
        .ok_or_else(|| ApiError::Unauthenticated("invalid session token".to_owned()))?;

    let user_id = Uuid::parse_str(&user_id)
        .map_err(|_| ApiError::Unauthenticated("invalid session token".to_owned()))?;

    let mut tx = ctx.pool.begin().await?;
    users_repo::get_user(&mut tx, user_id)
        .await
        .map_err(|_| ApiError::Unauthenticated("user not found".to_owned()))?;
    tx.commit().await?;

    Ok(user_id)
}
