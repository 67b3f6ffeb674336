//! Command message construction and retry classification.
//!
//! Every command to an agent travels in the standard envelope
//! `{message_type: "command", message_id, timestamp, data: {command_type,
//! parameters}}`. The envelope `message_id` is what the agent echoes back as
//! `correlation_id` in its `command_result`.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

/// A built command envelope plus the id results will correlate on.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    pub message_id: String,
    pub payload: serde_json::Value,
}

/// Build a `command` envelope for an agent.
#[must_use]
pub fn create_command_message(
    command_type: &str,
    parameters: serde_json::Value,
) -> CommandMessage {
    let message_id = Uuid::new_v4().to_string();
    let payload = json!({
        "message_type": "command",
        "message_id": &message_id,
        "timestamp": Utc::now().to_rfc3339(),
        "data": {
            "command_type": command_type,
            "parameters": parameters,
        },
    });
    CommandMessage {
        message_id,
        payload,
    }
}

/// Build the `host_approved` notification carrying the issued certificate
/// and host token, so the agent can transition to its authenticated state.
#[must_use]
pub fn create_host_approved_message(
    host_id: Uuid,
    host_token: Option<&str>,
    certificate_pem: &str,
    private_key_pem: &str,
    ca_certificate_pem: &str,
) -> CommandMessage {
    let message_id = Uuid::new_v4().to_string();
    let payload = json!({
        "message_type": "host_approved",
        "message_id": &message_id,
        "timestamp": Utc::now().to_rfc3339(),
        "data": {
            "host_id": host_id,
            "approval_status": "approved",
            "host_token": host_token,
            "certificate": certificate_pem,
            "private_key": private_key_pem,
            "ca_certificate": ca_certificate_pem,
        },
    });
    CommandMessage {
        message_id,
        payload,
    }
}

/// Whether a transport-level delivery failure of this command should be
/// retried. Network errors are retryable by default; commands with
/// non-idempotent side effects are not re-sent once an attempt may have
/// reached the agent.
#[must_use]
pub fn retry_class(command_type: &str) -> bool {
    !matches!(command_type, "apply_updates" | "deploy_firewall")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn command_envelope_carries_correlating_id() {
        let cmd = create_command_message("check_updates", json!({}));
        assert_eq!(cmd.payload["message_type"], "command");
        assert_eq!(cmd.payload["message_id"], cmd.message_id.as_str());
        assert_eq!(cmd.payload["data"]["command_type"], "check_updates");
        // Envelope ids satisfy the ≥20-char integrity rule.
        assert!(cmd.message_id.len() >= 20);
    }

    #[test]
    fn host_approved_carries_credentials() {
        let msg = create_host_approved_message(
            Uuid::new_v4(),
            Some("tok"),
            "CERT",
            "KEY",
            "CA",
        );
        assert_eq!(msg.payload["message_type"], "host_approved");
        assert_eq!(msg.payload["data"]["certificate"], "CERT");
        assert_eq!(msg.payload["data"]["host_token"], "tok");
    }

    #[test]
    fn side_effecting_commands_are_not_retryable() {
        assert!(!retry_class("apply_updates"));
        assert!(!retry_class("deploy_firewall"));
        assert!(retry_class("check_updates"));
        assert!(retry_class("add_third_party_repository"));
    }
}
