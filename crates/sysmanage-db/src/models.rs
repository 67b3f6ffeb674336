//! Persistent data models.
//!
//! Domain types for hosts, users, the durable message queue, the audit log,
//! tags, vault-backed secrets, CVE data, and diagnostics. All IDs are UUIDs;
//! timestamps are UTC. Status enums are stored as text columns except
//! [`QueuePriority`], which is a `smallint` so SQL `ORDER BY priority DESC`
//! reflects real precedence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Hosts ────────────────────────────────────────────────────────────

/// Registration lifecycle of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Observed liveness of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A machine under management.
///
/// A host may only receive commands when `approval_status` is `approved`;
/// `active = true` requires `status = up`. A rejected host never holds a
/// client certificate.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Host {
    pub id: Uuid,
    pub fqdn: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub platform: Option<String>,
    pub platform_release: Option<String>,
    /// Free-form OS facts reported by the agent (distribution, kernel, ...).
    pub os_details: Option<serde_json::Value>,
    pub approval_status: ApprovalStatus,
    pub active: bool,
    pub status: HostStatus,
    pub last_access: Option<DateTime<Utc>>,
    /// PEM client certificate issued on approval.
    pub client_certificate: Option<String>,
    pub certificate_serial: Option<String>,
    pub certificate_issued_at: Option<DateTime<Utc>>,
    /// Opaque credential handed to the agent alongside the certificate.
    pub host_token: Option<String>,
    pub is_agent_privileged: bool,
    pub reboot_required: bool,
    pub reboot_required_reason: Option<String>,
    pub diagnostics_request_status: Option<String>,
    /// Set when this host is a registered child of another host.
    pub parent_host_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Child hosts ──────────────────────────────────────────────────────

/// Lifecycle of a nested/virtual child instance (WSL distro, KVM/LXD/bhyve VM).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChildStatus {
    Creating,
    Running,
    Stopped,
    Uninstalling,
    Error,
    Unknown,
}

impl std::str::FromStr for ChildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "uninstalling" => Ok(Self::Uninstalling),
            "error" => Ok(Self::Error),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown child status: {other}")),
        }
    }
}

impl std::fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Uninstalling => write!(f, "uninstalling"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A nested virtualized instance owned by a parent host.
///
/// Keyed by `(parent_host_id, child_name, child_type)`. The `wsl_guid` field
/// identifies the concrete instance so that delete commands against a reused
/// name can be recognized as stale.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HostChild {
    pub id: Uuid,
    pub parent_host_id: Uuid,
    pub child_name: String,
    /// Virtualization flavor: `wsl`, `kvm`, `lxd`, `bhyve`, ...
    pub child_type: String,
    pub status: ChildStatus,
    /// Set when the child registers as its own agent.
    pub child_host_id: Option<Uuid>,
    pub hostname: Option<String>,
    pub distribution: Option<String>,
    pub distribution_version: Option<String>,
    pub wsl_guid: Option<String>,
    pub error_message: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Users ────────────────────────────────────────────────────────────

/// An operator account.
///
/// Never hard-deleted while referenced by audit entries; deactivation is the
/// terminal state.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    /// Login identity (email), unique.
    pub userid: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub is_admin: bool,
    pub active: bool,
    pub failed_login_attempts: i32,
    pub is_locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
    /// Set when a salt rotation forces a password reset.
    pub password_reset_required: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A role grant for a user. Role names are validated against the closed
/// `SecurityRole` enumeration at the service layer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserRole {
    pub user_id: Uuid,
    pub role: String,
}

/// Single-use password reset token, 24 h expiry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PasswordResetToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

// ── Message queue ────────────────────────────────────────────────────

/// Which way a queue entry travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueDirection {
    Inbound,
    Outbound,
}

/// Delivery state of a queue entry. `Delivered`, `Failed`, and `Expired` are
/// terminal — a terminal entry is never revived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
    Expired,
}

impl QueueStatus {
    /// Whether this state permits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Expired)
    }
}

/// Strict delivery precedence within one host's queue. Stored as `smallint`
/// so dequeue can sort `priority DESC, created_at ASC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueuePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

/// A durable message: either a command heading to an agent or a batched
/// inbound event awaiting processing.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: Uuid,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub direction: QueueDirection,
    pub host_id: Option<Uuid>,
    pub priority: QueuePriority,
    pub status: QueueStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Message id of the originating command, echoed back in results.
    pub correlation_id: Option<String>,
    pub error_message: Option<String>,
}

// ── Audit log ────────────────────────────────────────────────────────

/// Outcome recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditResult {
    Success,
    Failure,
    Pending,
}

impl std::fmt::Display for AuditResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Pending => write!(f, "PENDING"),
        }
    }
}

/// Append-only, tamper-evident record of a mutation or agent message.
///
/// `integrity_hash` is SHA-256 over the canonical pipe-joined core fields;
/// entries are never updated or deleted.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub action_type: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub description: String,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub result: AuditResult,
    pub error_message: Option<String>,
    pub category: Option<String>,
    pub integrity_hash: String,
}

// ── Tags ─────────────────────────────────────────────────────────────

/// A shared label attachable to any number of hosts.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Secrets ──────────────────────────────────────────────────────────

/// Metadata for a vault-stored secret. The content lives in the external
/// vault; this row only references it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SecretRecord {
    pub id: Uuid,
    pub name: String,
    pub secret_type: String,
    pub secret_subtype: Option<String>,
    #[serde(skip_serializing)]
    pub vault_token: String,
    pub vault_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Per-OS defaults ──────────────────────────────────────────────────

/// An OS-specific third-party repository applied automatically on approval.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DefaultRepository {
    pub id: Uuid,
    pub os_name: String,
    pub package_manager: String,
    pub repository_url: String,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Default antivirus package for an OS, applied analogously.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AntivirusDefault {
    pub id: Uuid,
    pub os_name: String,
    pub antivirus_package: String,
    pub created_at: DateTime<Utc>,
}

/// A package manager enabled by default on privileged agents of an OS.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EnabledPackageManager {
    pub id: Uuid,
    pub os_name: String,
    pub package_manager: String,
    pub created_at: DateTime<Utc>,
}

// ── CVE data ─────────────────────────────────────────────────────────

/// Singleton configuration for the vulnerability refresh scheduler.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CveSettings {
    pub id: Uuid,
    pub enabled: bool,
    /// Source identifiers, e.g. `["nvd"]`.
    pub enabled_sources: serde_json::Value,
    pub refresh_interval_hours: i32,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One known vulnerability, as ingested from a source.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct VulnerabilityRecord {
    pub id: Uuid,
    pub cve_id: String,
    pub source: String,
    pub severity: Option<String>,
    pub cvss_score: Option<f64>,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
}

/// Maps a vulnerability to an affected package name/version range.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PackageMapping {
    pub id: Uuid,
    pub cve_id: String,
    pub package_name: String,
    pub affected_versions: Option<String>,
    pub fixed_version: Option<String>,
}

/// One row per source per refresh run.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IngestionLog {
    pub id: Uuid,
    pub source: String,
    pub status: String,
    pub vulnerabilities_processed: i64,
    pub packages_processed: i64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Integrations ─────────────────────────────────────────────────────

/// Singleton row per downstream integration (`grafana`, `graylog`) describing
/// its URL and the vault token reference used to reach it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IntegrationSettings {
    pub id: Uuid,
    pub integration: String,
    pub enabled: bool,
    pub url: Option<String>,
    pub vault_token_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ── Diagnostics & firewall ───────────────────────────────────────────

/// Collection lifecycle of a diagnostic report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticStatus {
    Pending,
    Collecting,
    Completed,
    Failed,
}

/// A requested diagnostics collection and its per-kind payloads.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DiagnosticReport {
    pub id: Uuid,
    pub host_id: Uuid,
    /// Correlates the agent's result message with this request.
    pub collection_id: Uuid,
    pub status: DiagnosticStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub system_logs: Option<serde_json::Value>,
    pub configuration: Option<serde_json::Value>,
    pub network_info: Option<serde_json::Value>,
    pub process_info: Option<serde_json::Value>,
    pub collection_size_bytes: Option<i64>,
    pub files_collected: Option<i32>,
    pub error_message: Option<String>,
}

/// Last observed firewall snapshot for a host.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FirewallStatus {
    pub id: Uuid,
    pub host_id: Uuid,
    pub enabled: bool,
    pub firewall_name: Option<String>,
    pub tcp_open_ports: Option<serde_json::Value>,
    pub udp_open_ports: Option<serde_json::Value>,
    pub ipv4_ports_tcp: Option<serde_json::Value>,
    pub ipv4_ports_udp: Option<serde_json::Value>,
    pub ipv6_ports_tcp: Option<serde_json::Value>,
    pub ipv6_ports_udp: Option<serde_json::Value>,
    pub last_updated: DateTime<Utc>,
}
