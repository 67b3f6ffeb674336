//! Inbound agent message handlers.
//!
//! Dispatch is a static table from `message_type` to handler function,
//! built once at startup; new types are added by registration, not by
//! string-matching in the reader loop. A handler runs inside the reader's
//! transaction, is the only place agent-driven state changes occur, and
//! emits exactly one AGENT_MESSAGE audit entry on success. On error the
//! transaction rolls back, no audit entry survives, and the session stays
//! open.

pub mod child_hosts;
pub mod command_result;
pub mod diagnostics;
pub mod firewall;
pub mod heartbeat;
pub mod inventory;
pub mod script;
pub mod virtualization;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppContext;

/// Context of one authenticated agent session, cloned into handlers.
#[derive(Clone)]
pub struct AgentSession {
    pub ctx: Arc<AppContext>,
    pub host_id: Uuid,
    pub fqdn: String,
    pub connection_id: String,
    pub client_ip: String,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("host_id", &self.host_id)
            .field("fqdn", &self.fqdn)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// One parsed agent message. Core fields are required by the integrity
/// layer; everything else is tolerated and reachable through [`Self::raw`].
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_type: String,
    pub message_id: Option<String>,
    pub raw: serde_json::Value,
}

impl Envelope {
    /// Parse a raw frame. Returns None when `message_type` is absent.
    #[must_use]
    pub fn parse(raw: serde_json::Value) -> Option<Self> {
        let message_type = raw.get("message_type")?.as_str()?.to_owned();
        let message_id = raw
            .get("message_id")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);
        Some(Self {
            message_type,
            message_id,
            raw,
        })
    }

    /// The message body: `data` when present, otherwise the whole frame.
    #[must_use]
    pub fn data(&self) -> &serde_json::Value {
        match self.raw.get("data") {
            Some(data) if data.is_object() => data,
            _ => &self.raw,
        }
    }

    /// The operation result: `result` nested in the body when present,
    /// otherwise the body itself. Result messages from older agents put
    /// fields at either level.
    #[must_use]
    pub fn result(&self) -> &serde_json::Value {
        match self.data().get("result") {
            Some(result) if result.is_object() => result,
            _ => self.data(),
        }
    }

    /// Success flag, looked up at frame level first, then in the result.
    #[must_use]
    pub fn success(&self) -> bool {
        self.raw
            .get("success")
            .or_else(|| self.result().get("success"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Error text, frame level first, then the result.
    #[must_use]
    pub fn error_text(&self) -> Option<&str> {
        self.raw
            .get("error")
            .or_else(|| self.result().get("error"))
            .and_then(serde_json::Value::as_str)
    }

    /// A string field from the result body.
    #[must_use]
    pub fn result_str(&self, key: &str) -> Option<&str> {
        self.result().get(key).and_then(serde_json::Value::as_str)
    }
}

/// What the handler hands back to the reader for the agent.
pub type HandlerResult = Result<Option<serde_json::Value>, ApiError>;

/// A handler future borrowing the reader's transaction.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;

/// A registered handler: `(txn, session, message) -> response?`.
pub type HandlerFn =
    for<'a> fn(&'a mut PgConnection, &'a AgentSession, Envelope) -> HandlerFuture<'a>;

/// The static dispatch table.
pub struct HandlerRegistry {
    table: HashMap<&'static str, HandlerFn>,
}

impl HandlerRegistry {
    /// Empty registry, for tests that register selectively.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// The standard table covering every supported agent message type.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("heartbeat", heartbeat::handle);
        registry.register("system_info", inventory::handle);
        registry.register("child_hosts_list_update", child_hosts::handle_list_update);
        registry.register("child_host_created", child_hosts::handle_created);
        registry.register("child_host_delete_result", child_hosts::handle_delete_result);
        registry.register("child_host_start_result", child_hosts::handle_start_result);
        registry.register("child_host_stop_result", child_hosts::handle_stop_result);
        registry.register(
            "child_host_restart_result",
            child_hosts::handle_restart_result,
        );
        registry.register("diagnostic_result", diagnostics::handle_result);
        registry.register("firewall_status", firewall::handle_status);
        registry.register(
            "virtualization_support_update",
            virtualization::handle_support_update,
        );
        registry.register("wsl_enable_result", virtualization::handle_enable_result);
        registry.register("lxd_initialize_result", virtualization::handle_enable_result);
        registry.register("vmm_initialize_result", virtualization::handle_enable_result);
        registry.register("command_result", command_result::handle);
        registry.register("script_execution_result", script::handle);
        registry
    }

    /// Register (or replace) a handler for a message type.
    pub fn register(&mut self, message_type: &'static str, handler: HandlerFn) {
        self.table.insert(message_type, handler);
    }

    /// Look up the handler for a message type.
    #[must_use]
    pub fn get(&self, message_type: &str) -> Option<HandlerFn> {
        self.table.get(message_type).copied()
    }

    /// Registered message types, for diagnostics.
    #[must_use]
    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.table.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.message_types())
            .finish()
    }
}

/// The error frame sent for a message no handler accepts.
#[must_use]
pub fn unknown_type_response(message_type: &str) -> serde_json::Value {
    serde_json::json!({
        "message_type": "error",
        "error_type": "unknown_type",
        "message": format!("no handler for message type '{message_type}'"),
        "data": {},
    })
}

/// The error frame sent when a handler fails and its transaction rolled
/// back. The session stays open.
#[must_use]
pub fn handler_error_response(error: &ApiError) -> serde_json::Value {
    serde_json::json!({
        "message_type": "error",
        "error_type": "handler_error",
        "error_kind": error.kind(),
        "message": error.to_string(),
        "data": {},
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn envelope_requires_message_type() {
        assert!(Envelope::parse(serde_json::json!({"message_id": "x"})).is_none());
        let env = Envelope::parse(serde_json::json!({
            "message_type": "heartbeat",
            "message_id": "abc",
            "unknown_field": 42,
        }))
        .unwrap();
        assert_eq!(env.message_type, "heartbeat");
        assert_eq!(env.message_id.as_deref(), Some("abc"));
    }

    #[test]
    fn envelope_body_falls_back_to_frame() {
        let nested = Envelope::parse(serde_json::json!({
            "message_type": "command_result",
            "data": {"result": {"success": true, "child_name": "dev"}},
        }))
        .unwrap();
        assert!(nested.success());
        assert_eq!(nested.result_str("child_name"), Some("dev"));

        let flat = Envelope::parse(serde_json::json!({
            "message_type": "command_result",
            "success": true,
            "child_name": "dev",
        }))
        .unwrap();
        assert!(flat.success());
        assert_eq!(flat.result_str("child_name"), Some("dev"));
    }

    #[test]
    fn standard_registry_covers_core_types() {
        let registry = HandlerRegistry::standard();
        for message_type in [
            "heartbeat",
            "system_info",
            "child_hosts_list_update",
            "child_host_delete_result",
            "diagnostic_result",
            "firewall_status",
            "command_result",
            "script_execution_result",
        ] {
            assert!(registry.get(message_type).is_some(), "{message_type}");
        }
        assert!(registry.get("never_registered").is_none());
    }

    #[test]
    fn unknown_type_frame_shape() {
        let frame = unknown_type_response("bogus");
        assert_eq!(frame["message_type"], "error");
        assert_eq!(frame["error_type"], "unknown_type");
    }
}
