//! Outbound mail interface.
//!
//! Delivery mechanics are a deployment concern; the control plane only
//! depends on this trait. The default implementation logs the message and
//! is used whenever email is disabled in configuration.

use async_trait::async_trait;
use tracing::info;

/// A plain+HTML message.
#[derive(Debug, Clone)]
pub struct OutboundMail {
    pub to: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
}

/// Sends mail. Implementations must be safe to share across tasks.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one message.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when delivery fails; callers surface
    /// it as `dependency_failed`.
    async fn send(&self, mail: OutboundMail) -> Result<(), String>;
}

/// Logs instead of sending. Used when email is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: OutboundMail) -> Result<(), String> {
        info!(to = %mail.to, subject = %mail.subject, "email delivery disabled; message logged");
        Ok(())
    }
}
