//! WebSocket session security.
//!
//! Connection tokens, per-message integrity checks, per-IP rate limiting,
//! and sensitive-payload wrapping for agent communications. Tokens are the
//! base64 of `{payload, signature}` where the signature is HMAC-SHA256 over
//! the payload's canonical (sorted-key) JSON. Signature comparison is
//! constant-time.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Connection token lifetime.
const TOKEN_TTL_SECS: i64 = 3600;

/// Message timestamps may drift this far from the server clock. Generous to
/// cover inventory bursts right after host approval.
const MESSAGE_SKEW_SECS: i64 = 1800;

/// Connections idle longer than this are swept.
const STALE_CONNECTION_SECS: i64 = 7200;

/// Sliding window and cap for per-IP connection attempts.
const ATTEMPT_WINDOW_SECS: i64 = 900;
const ATTEMPT_CAP: usize = 20;

/// Wrapped sensitive payloads older than this are rejected.
const ENVELOPE_MAX_AGE_SECS: i64 = 3600;

/// Signed portion of a connection token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenPayload {
    connection_id: String,
    hostname: String,
    client_ip: String,
    timestamp: i64,
    expires: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenEnvelope {
    payload: TokenPayload,
    signature: String,
}

/// Why a connection token failed validation. First failure wins, in the
/// order: malformed, bad signature, expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Malformed,
    InvalidSignature,
    Expired,
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "Malformed token"),
            Self::InvalidSignature => write!(f, "Invalid token signature"),
            Self::Expired => write!(f, "Token expired"),
        }
    }
}

/// Why a message failed the integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    MissingField(&'static str),
    TimestampSkew,
    BadTimestampFormat,
    BadMessageId,
}

impl std::fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing required field '{field}'"),
            Self::TimestampSkew => write!(f, "message timestamp outside tolerance"),
            Self::BadTimestampFormat => write!(f, "invalid timestamp format"),
            Self::BadMessageId => write!(f, "invalid message id format"),
        }
    }
}

#[derive(Debug, Clone)]
struct ConnectionInfo {
    #[allow(dead_code)]
    hostname: String,
    #[allow(dead_code)]
    client_ip: String,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    authenticated: bool,
}

/// Snapshot of connection-tracking state.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub authenticated_connections: usize,
    pub connection_attempts_tracked: usize,
}

/// Manages security state for agent WebSocket connections.
///
/// Shared across the session hub and the background sweeper; all interior
/// maps are lock-guarded.
pub struct ConnectionSecurity {
    secret: Vec<u8>,
    active_connections: RwLock<HashMap<String, ConnectionInfo>>,
    connection_attempts: RwLock<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl ConnectionSecurity {
    /// Create a manager signing with the given secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            active_connections: RwLock::new(HashMap::new()),
            connection_attempts: RwLock::new(HashMap::new()),
        }
    }

    /// Issue a connection token for an agent, valid for one hour.
    pub async fn generate_connection_token(&self, hostname: &str, client_ip: &str) -> String {
        self.generate_connection_token_at(hostname, client_ip, Utc::now())
            .await
    }

    /// Token issuance with an explicit clock, for deterministic validation.
    pub async fn generate_connection_token_at(
        &self,
        hostname: &str,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> String {
        let connection_id = Uuid::new_v4().simple().to_string();
        let timestamp = now.timestamp();

        let payload = TokenPayload {
            connection_id: connection_id.clone(),
            hostname: hostname.to_owned(),
            client_ip: client_ip.to_owned(),
            timestamp,
            expires: timestamp + TOKEN_TTL_SECS,
        };

        let signature = self.sign(&canonical_json(&payload));
        let envelope = TokenEnvelope { payload, signature };

        self.active_connections.write().await.insert(
            connection_id,
            ConnectionInfo {
                hostname: hostname.to_owned(),
                client_ip: client_ip.to_owned(),
                created_at: now,
                last_activity: now,
                authenticated: false,
            },
        );

        // Envelope serialization of plain strings and integers cannot fail.
        let bytes = serde_json::to_vec(&envelope).unwrap_or_default();
        BASE64.encode(bytes)
    }

    /// Validate a connection token, returning the connection id it carries.
    ///
    /// An IP differing from the one the token was issued to is logged but
    /// tolerated (NAT/proxy).
    ///
    /// # Errors
    ///
    /// Returns the first matching [`TokenRejection`].
    pub async fn validate_connection_token(
        &self,
        token: &str,
        client_ip: &str,
    ) -> Result<String, TokenRejection> {
        self.validate_connection_token_at(token, client_ip, Utc::now())
            .await
    }

    /// Token validation with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns the first matching [`TokenRejection`].
    pub async fn validate_connection_token_at(
        &self,
        token: &str,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<String, TokenRejection> {
        let bytes = BASE64
            .decode(token.as_bytes())
            .map_err(|_| TokenRejection::Malformed)?;
        let envelope: TokenEnvelope =
            serde_json::from_slice(&bytes).map_err(|_| TokenRejection::Malformed)?;

        let expected = self.sign(&canonical_json(&envelope.payload));
        if expected
            .as_bytes()
            .ct_eq(envelope.signature.as_bytes())
            .unwrap_u8()
            == 0
        {
            warn!(client_ip, "invalid connection token signature");
            return Err(TokenRejection::InvalidSignature);
        }

        if now.timestamp() > envelope.payload.expires {
            info!(client_ip, "expired connection token");
            return Err(TokenRejection::Expired);
        }

        if envelope.payload.client_ip != client_ip {
            // Common with NAT/proxy setups; monitored, not fatal.
            info!(
                token_ip = %envelope.payload.client_ip,
                client_ip,
                "connection token IP mismatch"
            );
        }

        let connection_id = envelope.payload.connection_id;
        if let Some(info) = self.active_connections.write().await.get_mut(&connection_id) {
            info.last_activity = now;
            info.authenticated = true;
        }

        Ok(connection_id)
    }

    /// Validate the integrity of an inbound message.
    ///
    /// Standard messages need `message_type`, `message_id` (≥ 20 chars,
    /// alphanumeric plus dashes), and a `timestamp` within ±30 min of the
    /// server clock. `script_execution_result` messages only need
    /// `message_type` and `execution_id`.
    ///
    /// # Errors
    ///
    /// Returns the first matching [`IntegrityViolation`].
    pub async fn validate_message_integrity(
        &self,
        message: &serde_json::Value,
        connection_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), IntegrityViolation> {
        let message_type = message
            .get("message_type")
            .and_then(serde_json::Value::as_str)
            .ok_or(IntegrityViolation::MissingField("message_type"))?;

        if message_type == "script_execution_result" {
            if message.get("execution_id").is_none() {
                return Err(IntegrityViolation::MissingField("execution_id"));
            }
        } else {
            let message_id = message
                .get("message_id")
                .and_then(serde_json::Value::as_str)
                .ok_or(IntegrityViolation::MissingField("message_id"))?;

            let timestamp = message
                .get("timestamp")
                .and_then(serde_json::Value::as_str)
                .ok_or(IntegrityViolation::MissingField("timestamp"))?;

            let parsed = DateTime::parse_from_rfc3339(timestamp)
                .map_err(|_| IntegrityViolation::BadTimestampFormat)?;
            let skew = (now - parsed.with_timezone(&Utc)).num_seconds().abs();
            if skew > MESSAGE_SKEW_SECS {
                warn!(connection_id, skew, "message timestamp outside tolerance");
                return Err(IntegrityViolation::TimestampSkew);
            }

            if message_id.len() < 20
                || !message_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                warn!(connection_id, "invalid message id format");
                return Err(IntegrityViolation::BadMessageId);
            }
        }

        if let Some(info) = self.active_connections.write().await.get_mut(connection_id) {
            info.last_activity = now;
        }

        Ok(())
    }

    /// Whether connection attempts from this IP are over the sliding-window
    /// cap (20 attempts per 15 min).
    pub async fn is_connection_rate_limited(&self, client_ip: &str) -> bool {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(ATTEMPT_WINDOW_SECS);

        let mut attempts = self.connection_attempts.write().await;
        if let Some(times) = attempts.get_mut(client_ip) {
            times.retain(|t| *t > cutoff);
            if times.len() >= ATTEMPT_CAP {
                warn!(client_ip, "connection attempts rate limited");
                return true;
            }
        }
        false
    }

    /// Record a connection attempt for rate limiting.
    pub async fn record_connection_attempt(&self, client_ip: &str) {
        self.connection_attempts
            .write()
            .await
            .entry(client_ip.to_owned())
            .or_default()
            .push(Utc::now());
    }

    /// Sweep connection records idle for more than two hours and prune
    /// attempt history older than one hour. Run by the background sweeper.
    pub async fn cleanup_stale_connections(&self) {
        let now = Utc::now();
        let idle_cutoff = now - Duration::seconds(STALE_CONNECTION_SECS);

        let mut connections = self.active_connections.write().await;
        connections.retain(|conn_id, info| {
            let keep = info.last_activity > idle_cutoff && info.created_at > idle_cutoff;
            if !keep {
                info!(connection_id = %conn_id, "stale connection record swept");
            }
            keep
        });
        drop(connections);

        let attempt_cutoff = now - Duration::seconds(3600);
        let mut attempts = self.connection_attempts.write().await;
        attempts.retain(|_, times| {
            times.retain(|t| *t > attempt_cutoff);
            !times.is_empty()
        });
    }

    /// Statistics about tracked connections.
    pub async fn connection_stats(&self) -> ConnectionStats {
        let now = Utc::now();
        let active_cutoff = now - Duration::seconds(300);

        let connections = self.active_connections.read().await;
        let mut active = 0;
        let mut authenticated = 0;
        for info in connections.values() {
            if info.last_activity > active_cutoff {
                active += 1;
                if info.authenticated {
                    authenticated += 1;
                }
            }
        }

        ConnectionStats {
            total_connections: connections.len(),
            active_connections: active,
            authenticated_connections: authenticated,
            connection_attempts_tracked: self.connection_attempts.read().await.len(),
        }
    }

    /// Wrap a sensitive payload (config updates and the like): the data's
    /// canonical JSON plus an HMAC and an issue timestamp, base64-encoded.
    pub fn encrypt_sensitive_data(&self, data: &serde_json::Value) -> String {
        self.encrypt_sensitive_data_at(data, Utc::now())
    }

    /// Payload wrapping with an explicit clock.
    pub fn encrypt_sensitive_data_at(
        &self,
        data: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> String {
        let data_json = sorted_json_string(data);
        let signature = self.sign(&data_json);

        let envelope = serde_json::json!({
            "data": data_json,
            "signature": signature,
            "timestamp": now.timestamp(),
        });

        BASE64.encode(serde_json::to_vec(&envelope).unwrap_or_default())
    }

    /// Unwrap a sensitive payload, rejecting tampered or stale envelopes.
    ///
    /// # Errors
    ///
    /// Returns a description of the first failed check.
    pub fn decrypt_sensitive_data(
        &self,
        encrypted: &str,
    ) -> Result<serde_json::Value, String> {
        self.decrypt_sensitive_data_at(encrypted, Utc::now())
    }

    /// Payload unwrapping with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns a description of the first failed check.
    pub fn decrypt_sensitive_data_at(
        &self,
        encrypted: &str,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value, String> {
        let bytes = BASE64
            .decode(encrypted.as_bytes())
            .map_err(|e| format!("decryption failed: {e}"))?;
        let envelope: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| format!("decryption failed: {e}"))?;

        let data_json = envelope
            .get("data")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| "decryption failed: missing data".to_owned())?;
        let signature = envelope
            .get("signature")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| "decryption failed: missing signature".to_owned())?;
        let timestamp = envelope
            .get("timestamp")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);

        if now.timestamp() - timestamp > ENVELOPE_MAX_AGE_SECS {
            return Err("Encrypted data expired".to_owned());
        }

        let expected = self.sign(data_json);
        if expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() == 0 {
            return Err("Invalid signature".to_owned());
        }

        serde_json::from_str(data_json).map_err(|e| format!("decryption failed: {e}"))
    }

    /// Hex HMAC-SHA256 of the input under the configured secret.
    fn sign(&self, input: &str) -> String {
        // HMAC-SHA256 accepts any key length per RFC 2104, so new_from_slice
        // never fails here.
        #[allow(clippy::unwrap_used)]
        let mut mac = HmacSha256::new_from_slice(&self.secret).unwrap();
        mac.update(input.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for ConnectionSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSecurity").finish_non_exhaustive()
    }
}

/// Canonical JSON for signing: object keys sorted, no insignificant
/// whitespace. `serde_json`'s map is ordered by key, so a round-trip
/// through `Value` canonicalizes.
fn canonical_json<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .and_then(|v| serde_json::to_string(&v))
        .unwrap_or_default()
}

fn sorted_json_string(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn manager() -> ConnectionSecurity {
        ConnectionSecurity::new("test-jwt-secret")
    }

    #[tokio::test]
    async fn token_round_trip_validates() {
        let sec = manager();
        let token = sec.generate_connection_token("agent01.example.com", "10.0.0.5").await;
        let conn_id = sec
            .validate_connection_token(&token, "10.0.0.5")
            .await
            .unwrap();
        assert!(!conn_id.is_empty());
    }

    #[tokio::test]
    async fn token_expires_after_one_hour() {
        let sec = manager();
        let t0 = Utc::now();
        let token = sec
            .generate_connection_token_at("agent01", "10.0.0.5", t0)
            .await;
        let err = sec
            .validate_connection_token_at(&token, "10.0.0.5", t0 + Duration::seconds(3601))
            .await
            .unwrap_err();
        assert_eq!(err, TokenRejection::Expired);
        assert_eq!(err.to_string(), "Token expired");
    }

    #[tokio::test]
    async fn token_ip_mismatch_is_tolerated() {
        let sec = manager();
        let token = sec.generate_connection_token("agent01", "10.0.0.5").await;
        assert!(sec.validate_connection_token(&token, "192.168.1.9").await.is_ok());
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let sec = manager();
        let token = sec.generate_connection_token("agent01", "10.0.0.5").await;

        let mut bytes = BASE64.decode(token.as_bytes()).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        envelope["payload"]["hostname"] = serde_json::json!("evil");
        bytes = serde_json::to_vec(&envelope).unwrap();
        let forged = BASE64.encode(bytes);

        let err = sec
            .validate_connection_token(&forged, "10.0.0.5")
            .await
            .unwrap_err();
        assert_eq!(err, TokenRejection::InvalidSignature);
    }

    #[tokio::test]
    async fn garbage_token_is_malformed() {
        let sec = manager();
        let err = sec
            .validate_connection_token("not-base64!!!", "10.0.0.5")
            .await
            .unwrap_err();
        assert_eq!(err, TokenRejection::Malformed);

        let err = sec
            .validate_connection_token(&BASE64.encode(b"{\"nope\":1}"), "10.0.0.5")
            .await
            .unwrap_err();
        assert_eq!(err, TokenRejection::Malformed);
    }

    #[tokio::test]
    async fn message_integrity_accepts_well_formed() {
        let sec = manager();
        let msg = serde_json::json!({
            "message_type": "heartbeat",
            "message_id": "abcdef1234567890abcdef12",
            "timestamp": Utc::now().to_rfc3339(),
        });
        sec.validate_message_integrity(&msg, "conn", Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn message_integrity_rejects_short_ids_and_skew() {
        let sec = manager();
        let now = Utc::now();

        let short_id = serde_json::json!({
            "message_type": "heartbeat",
            "message_id": "short",
            "timestamp": now.to_rfc3339(),
        });
        assert_eq!(
            sec.validate_message_integrity(&short_id, "conn", now)
                .await
                .unwrap_err(),
            IntegrityViolation::BadMessageId
        );

        let stale = serde_json::json!({
            "message_type": "heartbeat",
            "message_id": "abcdef1234567890abcdef12",
            "timestamp": (now - Duration::seconds(1801)).to_rfc3339(),
        });
        assert_eq!(
            sec.validate_message_integrity(&stale, "conn", now)
                .await
                .unwrap_err(),
            IntegrityViolation::TimestampSkew
        );
    }

    #[tokio::test]
    async fn script_results_need_only_execution_id() {
        let sec = manager();
        let msg = serde_json::json!({
            "message_type": "script_execution_result",
            "execution_id": "exec-1",
        });
        sec.validate_message_integrity(&msg, "conn", Utc::now())
            .await
            .unwrap();

        let missing = serde_json::json!({"message_type": "script_execution_result"});
        assert_eq!(
            sec.validate_message_integrity(&missing, "conn", Utc::now())
                .await
                .unwrap_err(),
            IntegrityViolation::MissingField("execution_id")
        );
    }

    #[tokio::test]
    async fn rate_limit_trips_at_twenty_attempts() {
        let sec = manager();
        for _ in 0..19 {
            sec.record_connection_attempt("10.1.1.1").await;
        }
        assert!(!sec.is_connection_rate_limited("10.1.1.1").await);
        sec.record_connection_attempt("10.1.1.1").await;
        assert!(sec.is_connection_rate_limited("10.1.1.1").await);
        assert!(!sec.is_connection_rate_limited("10.1.1.2").await);
    }

    #[test]
    fn sensitive_payload_round_trips() {
        let sec = manager();
        let data = serde_json::json!({"server": {"port": 8000}, "key": "value"});
        let wrapped = sec.encrypt_sensitive_data(&data);
        let unwrapped = sec.decrypt_sensitive_data(&wrapped).unwrap();
        assert_eq!(unwrapped, data);
    }

    #[test]
    fn sensitive_payload_expires_and_detects_tampering() {
        let sec = manager();
        let data = serde_json::json!({"k": 1});

        let t0 = Utc::now();
        let wrapped = sec.encrypt_sensitive_data_at(&data, t0);
        let err = sec
            .decrypt_sensitive_data_at(&wrapped, t0 + Duration::seconds(3601))
            .unwrap_err();
        assert_eq!(err, "Encrypted data expired");

        let mut envelope: serde_json::Value =
            serde_json::from_slice(&BASE64.decode(wrapped.as_bytes()).unwrap()).unwrap();
        envelope["data"] = serde_json::json!("{\"k\":2}");
        let forged = BASE64.encode(serde_json::to_vec(&envelope).unwrap());
        assert_eq!(sec.decrypt_sensitive_data(&forged).unwrap_err(), "Invalid signature");
    }

    #[tokio::test]
    async fn stats_count_authenticated_connections() {
        let sec = manager();
        let token = sec.generate_connection_token("a", "1.1.1.1").await;
        sec.validate_connection_token(&token, "1.1.1.1").await.unwrap();
        sec.generate_connection_token("b", "2.2.2.2").await;

        let stats = sec.connection_stats().await;
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.authenticated_connections, 1);
    }
}
