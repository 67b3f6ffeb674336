//! Server configuration.
//!
//! One YAML document with sections for the API listener, web UI, database,
//! security, monitoring, logging, the message queue, email, the vault, and
//! the discovery beacon. Every section and field carries a serde default, so
//! a missing section is created empty and then defaulted — a minimal config
//! of just `database.url` and `security` secrets is valid.

use std::path::Path;

use serde::Deserialize;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub api: ApiConfig,
    pub webui: WebUiConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
    pub message_queue: MessageQueueConfig,
    pub email: EmailConfig,
    pub vault: VaultConfig,
    pub discovery: DiscoveryConfig,
}

/// API listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// TLS certificate path; presence implies HTTPS/WSS endpoints.
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 8000,
            cert_file: None,
            key_file: None,
        }
    }
}

/// Web UI coordinates, reported by the discovery beacon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebUiConfig {
    pub port: u16,
}

impl Default for WebUiConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Database connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/sysmanage".to_owned(),
            max_connections: 16,
        }
    }
}

/// Secrets and lockout policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// HMAC secret for connection and session tokens.
    pub jwt_secret: String,
    /// Process-wide pepper for password hashing. Rotating it forces a
    /// password reset for every account.
    pub password_salt: String,
    pub max_failed_logins: i32,
    /// Minutes a locked account stays locked before automatic unlock.
    pub account_lockout_duration: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            password_salt: String::new(),
            max_failed_logins: 5,
            account_lockout_duration: 30,
        }
    }
}

/// Liveness thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub heartbeat_timeout: i64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: 5,
        }
    }
}

/// Log filtering.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

/// Queue retention and sweep cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    pub expiration_timeout_minutes: i64,
    pub cleanup_interval_minutes: u64,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            expiration_timeout_minutes: 60,
            cleanup_interval_minutes: 30,
        }
    }
}

/// Outbound mail settings. Delivery mechanics live behind the
/// [`crate::email::Mailer`] trait.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    /// `tls`, `starttls`, or `none`.
    pub encryption: String,
    pub from_address: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: "localhost".to_owned(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            encryption: "starttls".to_owned(),
            from_address: "sysmanage@localhost".to_owned(),
        }
    }
}

/// External vault coordinates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub enabled: bool,
    pub url: String,
    pub mount: String,
    /// Server token used when creating scoped secret tokens.
    pub token: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://127.0.0.1:8200".to_owned(),
            mount: "secret".to_owned(),
            token: None,
        }
    }
}

/// Discovery beacon binding. Loopback by default; binding wider is an
/// explicit deployment decision.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub bind_address: String,
    pub port: u16,
    /// Best-effort startup announcement broadcast.
    pub announce: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_owned(),
            port: 31337,
            announce: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse.
    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Whether the API is served over TLS.
    #[must_use]
    pub fn use_ssl(&self) -> bool {
        self.api.cert_file.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_fully_defaulted() {
        let config = ServerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.api.port, 8000);
        assert_eq!(config.webui.port, 8080);
        assert_eq!(config.security.max_failed_logins, 5);
        assert_eq!(config.security.account_lockout_duration, 30);
        assert_eq!(config.monitoring.heartbeat_timeout, 5);
        assert_eq!(config.message_queue.expiration_timeout_minutes, 60);
        assert_eq!(config.discovery.bind_address, "127.0.0.1");
        assert_eq!(config.discovery.port, 31337);
        assert!(!config.use_ssl());
    }

    #[test]
    fn missing_sections_default_individually() {
        let config = ServerConfig::from_yaml(
            r"
api:
  port: 9443
  cert_file: /etc/sysmanage/server.crt
security:
  jwt_secret: abc
  max_failed_logins: 3
",
        )
        .unwrap();
        assert_eq!(config.api.port, 9443);
        assert!(config.use_ssl());
        assert_eq!(config.api.host, "localhost");
        assert_eq!(config.security.max_failed_logins, 3);
        // Untouched sections keep full defaults.
        assert_eq!(config.message_queue.cleanup_interval_minutes, 30);
        assert_eq!(config.email.smtp_port, 587);
    }

    #[test]
    fn discovery_bind_is_loopback_unless_configured() {
        let config = ServerConfig::from_yaml("discovery:\n  port: 41000\n").unwrap();
        assert_eq!(config.discovery.bind_address, "127.0.0.1");
        assert_eq!(config.discovery.port, 41000);
    }
}
