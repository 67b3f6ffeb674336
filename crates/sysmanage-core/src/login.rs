//! Login and session security.
//!
//! Argon2id password hashing peppered with the configured process-wide
//! secret salt, HMAC session tokens, per-IP/per-user failed-login windows
//! with temporary IP blocks, durable account lockout, and the single-use
//! password reset flow.

use std::collections::HashMap;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHasher as _, PasswordVerifier as _, Version};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgConnection;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use sysmanage_db::models::{PasswordResetToken, User};
use sysmanage_db::{reset_tokens as reset_repo, users as users_repo};

use crate::error::LoginError;

type HmacSha256 = Hmac<Sha256>;

/// Session tokens older than this fail validation.
const SESSION_MAX_AGE_SECS: i64 = 43_200; // 12 hours

/// Per-IP failed-login window: 5 failures in 5 minutes rejects the attempt.
const IP_WINDOW_MINUTES: i64 = 5;
const IP_WINDOW_MAX: usize = 5;

/// Per-user failed-login window: 3 failures in 15 minutes rejects.
const USER_WINDOW_MINUTES: i64 = 15;
const USER_WINDOW_MAX: usize = 3;

/// 10 failures in the retained hour blocks the IP for one hour.
const IP_BLOCK_THRESHOLD: usize = 10;
const IP_BLOCK_HOURS: i64 = 1;

/// Reset tokens live for 24 hours.
const RESET_TOKEN_HOURS: i64 = 24;

// ── Password hashing ─────────────────────────────────────────────────

/// Argon2id password hasher peppered with the configured secret salt.
///
/// When the salt rotates, previously stored hashes stop verifying; callers
/// mark all users for a forced reset instead of re-hashing in place.
#[derive(Clone)]
pub struct PasswordPolicy {
    pepper: Vec<u8>,
}

impl PasswordPolicy {
    /// Create a policy peppered with the configured secret.
    #[must_use]
    pub fn new(password_salt: &str) -> Self {
        Self {
            pepper: password_salt.as_bytes().to_vec(),
        }
    }

    fn hasher(&self) -> Result<Argon2<'_>, LoginError> {
        Argon2::new_with_secret(
            &self.pepper,
            Algorithm::Argon2id,
            Version::V0x13,
            Params::default(),
        )
        .map_err(|e| LoginError::Hashing {
            reason: e.to_string(),
        })
    }

    /// Hash a password for storage.
    ///
    /// # Errors
    ///
    /// Returns [`LoginError::Hashing`] if the hasher fails.
    pub fn hash_password(&self, password: &str) -> Result<String, LoginError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .hasher()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| LoginError::Hashing {
                reason: e.to_string(),
            })?;
        Ok(hash.to_string())
    }

    /// Verify a password against a stored hash.
    #[must_use]
    pub fn verify_password(&self, password: &str, stored_hash: &str) -> bool {
        let Ok(hasher) = self.hasher() else {
            return false;
        };
        let Ok(parsed) = PasswordHash::new(stored_hash) else {
            return false;
        };
        hasher.verify_password(password.as_bytes(), &parsed).is_ok()
    }

    /// Check a candidate password against the strength policy.
    ///
    /// # Errors
    ///
    /// Returns [`LoginError::WeakPassword`] naming the first failed rule.
    pub fn check_strength(&self, password: &str) -> Result<(), LoginError> {
        check_password_strength(password)
    }
}

impl std::fmt::Debug for PasswordPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordPolicy").finish_non_exhaustive()
    }
}

/// Password strength rules: length, character diversity, and a small
/// deny-list of notoriously common passwords.
///
/// # Errors
///
/// Returns [`LoginError::WeakPassword`] naming the first failed rule.
pub fn check_password_strength(password: &str) -> Result<(), LoginError> {
    let fail = |reason: &str| {
        Err(LoginError::WeakPassword {
            reason: reason.to_owned(),
        })
    };

    if password.len() < 8 {
        return fail("must be at least 8 characters long");
    }
    if password.len() > 128 {
        return fail("must be less than 128 characters");
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return fail("must contain at least one lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return fail("must contain at least one uppercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return fail("must contain at least one number");
    }
    if !password.chars().any(|c| "!@#$%^&*()_+-=[]{}|;:,.<>?".contains(c)) {
        return fail("must contain at least one special character");
    }

    const COMMON: [&str; 10] = [
        "password", "123456", "password123", "admin", "qwerty", "letmein", "welcome", "monkey",
        "1234567890", "abc123",
    ];
    if COMMON.contains(&password.to_lowercase().as_str()) {
        return fail("password is too common");
    }

    let distinct = password
        .chars()
        .collect::<std::collections::HashSet<_>>()
        .len();
    if distinct < 4 {
        return fail("must contain more diverse characters");
    }

    Ok(())
}

// ── Session tokens ───────────────────────────────────────────────────

/// Creates and validates `user_id:ip:ts:sig` session tokens.
pub struct SessionTokens {
    secret: Vec<u8>,
}

impl SessionTokens {
    /// Create a token service signing with the given secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Issue a session token for a user.
    #[must_use]
    pub fn create(&self, user_id: &str, client_ip: &str, now: DateTime<Utc>) -> String {
        let payload = format!("{user_id}:{client_ip}:{}", now.timestamp());
        let signature = self.sign(&payload);
        format!("{payload}:{signature}")
    }

    /// Validate a session token and extract the user id. An IP differing
    /// from the issuing one is logged but tolerated.
    #[must_use]
    pub fn validate(&self, token: &str, client_ip: &str, now: DateTime<Utc>) -> Option<String> {
        let parts: Vec<&str> = token.split(':').collect();
        let [user_id, token_ip, timestamp, signature] = parts.as_slice() else {
            warn!("malformed session token");
            return None;
        };

        if *token_ip != client_ip {
            info!(token_ip, client_ip, "session token IP mismatch");
        }

        let issued: i64 = timestamp.parse().ok()?;
        if now.timestamp() - issued > SESSION_MAX_AGE_SECS {
            info!(age_secs = now.timestamp() - issued, "expired session token");
            return None;
        }

        let payload = format!("{user_id}:{token_ip}:{timestamp}");
        let expected = self.sign(&payload);
        if expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() == 0 {
            warn!(user_id, "invalid session token signature");
            return None;
        }

        Some((*user_id).to_owned())
    }

    fn sign(&self, payload: &str) -> String {
        // Any key length is valid for HMAC-SHA256.
        #[allow(clippy::unwrap_used)]
        let mut mac = HmacSha256::new_from_slice(&self.secret).unwrap();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens").finish_non_exhaustive()
    }
}

// ── Rate limiting ────────────────────────────────────────────────────

/// In-memory failed-login tracking: sliding windows per IP and per user,
/// plus temporary IP blocks.
#[derive(Debug, Default)]
pub struct LoginTracker {
    failed_attempts: RwLock<HashMap<String, Vec<DateTime<Utc>>>>,
    blocked_ips: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl LoginTracker {
    /// Whether a login attempt should proceed at all.
    ///
    /// # Errors
    ///
    /// Returns [`LoginError::RateLimited`] with the reason when blocked.
    pub async fn validate_login_attempt(
        &self,
        username: &str,
        client_ip: &str,
    ) -> Result<(), LoginError> {
        if self.is_ip_blocked(client_ip).await {
            warn!(client_ip, "login attempt from blocked IP");
            return Err(LoginError::RateLimited {
                reason: "IP temporarily blocked due to too many failed attempts".to_owned(),
            });
        }

        if self
            .over_window(client_ip, IP_WINDOW_MINUTES, IP_WINDOW_MAX)
            .await
        {
            warn!(client_ip, "rate limited login attempt");
            return Err(LoginError::RateLimited {
                reason: "Too many login attempts, please try again later".to_owned(),
            });
        }

        let user_key = format!("user:{username}");
        if self
            .over_window(&user_key, USER_WINDOW_MINUTES, USER_WINDOW_MAX)
            .await
        {
            warn!(username, "rate limited login attempts for user");
            return Err(LoginError::RateLimited {
                reason: "Too many failed attempts for this user".to_owned(),
            });
        }

        Ok(())
    }

    /// Record a failed attempt against both the IP and the user, blocking
    /// the IP for an hour after ten failures.
    pub async fn record_failed_login(&self, username: &str, client_ip: &str) {
        let now = Utc::now();
        let cutoff = now - Duration::hours(1);

        let mut attempts = self.failed_attempts.write().await;
        for key in [client_ip.to_owned(), format!("user:{username}")] {
            let times = attempts.entry(key).or_default();
            times.retain(|t| *t > cutoff);
            times.push(now);
        }

        let ip_failures = attempts.get(client_ip).map_or(0, Vec::len);
        drop(attempts);

        if ip_failures >= IP_BLOCK_THRESHOLD {
            self.blocked_ips
                .write()
                .await
                .insert(client_ip.to_owned(), now + Duration::hours(IP_BLOCK_HOURS));
            warn!(client_ip, "IP blocked for 1 hour after repeated failures");
        }

        warn!(username, client_ip, "failed login attempt");
    }

    /// Clear failure history for the IP after a successful login.
    pub async fn record_successful_login(&self, username: &str, client_ip: &str) {
        self.failed_attempts.write().await.remove(client_ip);
        info!(username, client_ip, "successful login");
    }

    /// Whether the IP is currently blocked. Expired blocks are removed.
    pub async fn is_ip_blocked(&self, client_ip: &str) -> bool {
        let mut blocked = self.blocked_ips.write().await;
        match blocked.get(client_ip) {
            Some(until) if Utc::now() > *until => {
                blocked.remove(client_ip);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    async fn over_window(&self, key: &str, window_minutes: i64, max: usize) -> bool {
        let cutoff = Utc::now() - Duration::minutes(window_minutes);
        self.failed_attempts
            .read()
            .await
            .get(key)
            .is_some_and(|times| times.iter().filter(|t| **t > cutoff).count() >= max)
    }
}

// ── Account lockout ──────────────────────────────────────────────────

/// Whether the account is locked right now, honoring automatic expiry of
/// the lockout window.
#[must_use]
pub fn is_account_locked(user: &User, lockout_minutes: i64, now: DateTime<Utc>) -> bool {
    if !user.is_locked {
        return false;
    }
    match user.locked_at {
        Some(locked_at) => now < locked_at + Duration::minutes(lockout_minutes),
        // Locked with no timestamp: stays locked until manual unlock.
        None => true,
    }
}

/// Record a failed login against the durable counter, locking the account
/// once `max_failed_logins` is reached. Returns true if this call locked it.
///
/// # Errors
///
/// Returns [`LoginError::Db`] on storage failure.
pub async fn record_failed_login_for_user(
    conn: &mut PgConnection,
    user_id: Uuid,
    max_failed_logins: i32,
) -> Result<bool, LoginError> {
    let user = users_repo::record_failed_login(conn, user_id, max_failed_logins, Utc::now()).await?;
    if user.is_locked && user.failed_login_attempts >= max_failed_logins {
        warn!(
            userid = %user.userid,
            attempts = user.failed_login_attempts,
            "user account locked after repeated failures"
        );
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Reset the durable counter and any lock after a successful login.
///
/// # Errors
///
/// Returns [`LoginError::Db`] on storage failure.
pub async fn reset_failed_login_attempts(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<(), LoginError> {
    users_repo::reset_failed_logins(conn, user_id, Utc::now()).await?;
    Ok(())
}

// ── Password reset ───────────────────────────────────────────────────

/// Create a single-use reset token with a 24 h expiry.
///
/// # Errors
///
/// Returns [`LoginError::Db`] on storage failure.
pub async fn generate_reset_token(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<PasswordResetToken, LoginError> {
    let now = Utc::now();
    let token = reset_repo::insert_token(
        conn,
        user_id,
        Uuid::new_v4(),
        now,
        now + Duration::hours(RESET_TOKEN_HOURS),
    )
    .await?;
    Ok(token)
}

/// Atomically consume a reset token and return the owning user id.
///
/// # Errors
///
/// Returns [`LoginError::InvalidResetToken`] for unknown, expired, or spent
/// tokens, and for tokens orphaned from a deleted user.
pub async fn consume_reset_token(
    conn: &mut PgConnection,
    token: Uuid,
) -> Result<Uuid, LoginError> {
    let now = Utc::now();
    let Some(consumed) = reset_repo::consume_token(conn, token, now).await? else {
        // Distinguish for the caller's message without leaking validity.
        let reason = match reset_repo::find_token(conn, token).await? {
            Some(row) if row.used_at.is_some() => "token already used",
            Some(row) if row.expires_at <= now => "token expired",
            Some(_) => "token not valid",
            None => "token not found",
        };
        return Err(LoginError::InvalidResetToken {
            reason: reason.to_owned(),
        });
    };

    // A token orphaned from a deleted user fails validation.
    match users_repo::get_user(conn, consumed.user_id).await {
        Ok(user) => Ok(user.id),
        Err(sysmanage_db::DbError::NotFound { .. }) => Err(LoginError::InvalidResetToken {
            reason: "User not found".to_owned(),
        }),
        Err(e) => Err(LoginError::Db(e)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_verifies_and_rejects() {
        let policy = PasswordPolicy::new("pepper-secret");
        let hash = policy.hash_password("Str0ng!Passw0rd").unwrap();
        assert!(policy.verify_password("Str0ng!Passw0rd", &hash));
        assert!(!policy.verify_password("wrong", &hash));
    }

    #[test]
    fn rotated_pepper_invalidates_old_hashes() {
        let old = PasswordPolicy::new("pepper-v1");
        let new = PasswordPolicy::new("pepper-v2");
        let hash = old.hash_password("Str0ng!Passw0rd").unwrap();
        assert!(!new.verify_password("Str0ng!Passw0rd", &hash));
    }

    #[test]
    fn strength_policy_names_first_failure() {
        let cases = [
            ("short1!", "8 characters"),
            ("nouppercase1!", "uppercase"),
            ("NOLOWERCASE1!", "lowercase"),
            ("NoDigitsHere!", "number"),
            ("NoSpecials123", "special"),
        ];
        for (password, expected) in cases {
            let err = check_password_strength(password).unwrap_err().to_string();
            assert!(err.contains(expected), "{password}: {err}");
        }
        check_password_strength("Valid#Pass123").unwrap();
    }

    #[test]
    fn session_token_round_trips_and_expires() {
        let tokens = SessionTokens::new("jwt-secret");
        let now = Utc::now();
        let user_id = Uuid::new_v4().to_string();

        let token = tokens.create(&user_id, "10.0.0.1", now);
        assert_eq!(tokens.validate(&token, "10.0.0.1", now), Some(user_id.clone()));

        // IP mismatch tolerated.
        assert_eq!(tokens.validate(&token, "10.9.9.9", now), Some(user_id));

        // Expired after 12 hours.
        assert_eq!(
            tokens.validate(&token, "10.0.0.1", now + Duration::seconds(SESSION_MAX_AGE_SECS + 1)),
            None
        );
    }

    #[test]
    fn session_token_rejects_forged_signature() {
        let tokens = SessionTokens::new("jwt-secret");
        let other = SessionTokens::new("different-secret");
        let now = Utc::now();
        let token = other.create("user", "10.0.0.1", now);
        assert_eq!(tokens.validate(&token, "10.0.0.1", now), None);
    }

    #[tokio::test]
    async fn ip_window_rejects_after_five_failures() {
        let tracker = LoginTracker::default();
        for _ in 0..5 {
            tracker.record_failed_login("alice", "10.0.0.1").await;
        }
        let err = tracker
            .validate_login_attempt("alice", "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::RateLimited { .. }));
        // A different IP is still admitted for a different user.
        tracker.validate_login_attempt("bob", "10.0.0.2").await.unwrap();
    }

    #[tokio::test]
    async fn user_window_rejects_after_three_failures() {
        let tracker = LoginTracker::default();
        for i in 0..3 {
            tracker
                .record_failed_login("carol", &format!("10.0.1.{i}"))
                .await;
        }
        let err = tracker
            .validate_login_attempt("carol", "10.0.2.1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("this user"));
    }

    #[tokio::test]
    async fn ten_failures_block_the_ip() {
        let tracker = LoginTracker::default();
        for i in 0..10 {
            tracker
                .record_failed_login(&format!("user{i}"), "10.0.0.9")
                .await;
        }
        assert!(tracker.is_ip_blocked("10.0.0.9").await);
        let err = tracker
            .validate_login_attempt("anyone", "10.0.0.9")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }

    #[tokio::test]
    async fn success_clears_ip_history() {
        let tracker = LoginTracker::default();
        for _ in 0..4 {
            tracker.record_failed_login("dave", "10.0.3.1").await;
        }
        tracker.record_successful_login("dave", "10.0.3.1").await;
        tracker.validate_login_attempt("erin", "10.0.3.1").await.unwrap();
    }

    #[test]
    fn lockout_expires_after_the_configured_window() {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            userid: "frank@example.com".to_owned(),
            hashed_password: String::new(),
            is_admin: false,
            active: true,
            failed_login_attempts: 3,
            is_locked: true,
            locked_at: Some(now - Duration::minutes(10)),
            password_reset_required: false,
            created_at: now,
            updated_at: now,
        };
        assert!(is_account_locked(&user, 15, now));
        assert!(!is_account_locked(&user, 5, now));
    }
}
