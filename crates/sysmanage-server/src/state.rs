//! Shared application context.
//!
//! A single [`AppContext`] is constructed at startup and injected into the
//! session hub, every handler, every service operation, and every background
//! loop. There is no global mutable state — components that used to be
//! module singletons in older designs all live here.

use std::sync::Arc;

use sqlx::PgPool;

use sysmanage_core::audit::AuditWriter;
use sysmanage_core::certs::CertificateAuthority;
use sysmanage_core::comsec::ConnectionSecurity;
use sysmanage_core::login::{LoginTracker, PasswordPolicy, SessionTokens};
use sysmanage_core::queue::{MessageQueue, QueueNotifier};
use sysmanage_core::vault::VaultClient;

use crate::config::ServerConfig;
use crate::email::Mailer;
use crate::handlers::HandlerRegistry;
use crate::ws::registry::ConnectionRegistry;

/// Everything a request, session, or loop needs, shared via `Arc`.
pub struct AppContext {
    /// Database pool.
    pub pool: PgPool,
    /// Loaded configuration.
    pub config: ServerConfig,
    /// Audit log writer.
    pub audit: AuditWriter,
    /// Durable message queue.
    pub queue: Arc<MessageQueue>,
    /// Per-host drainer wakeups.
    pub notifier: Arc<QueueNotifier>,
    /// Connection tokens, message integrity, rate limiting.
    pub comsec: Arc<ConnectionSecurity>,
    /// Failed-login windows and IP blocks.
    pub login_tracker: Arc<LoginTracker>,
    /// Password hashing and strength policy.
    pub passwords: PasswordPolicy,
    /// Session token issuance/validation.
    pub session_tokens: SessionTokens,
    /// Client certificate issuance.
    pub ca: Arc<CertificateAuthority>,
    /// External vault, when enabled.
    pub vault: Option<Arc<VaultClient>>,
    /// Outbound mail.
    pub mailer: Arc<dyn Mailer>,
    /// Live agent sessions, one per host.
    pub sessions: Arc<ConnectionRegistry>,
    /// Static message dispatch table.
    pub handlers: HandlerRegistry,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext").finish_non_exhaustive()
    }
}
