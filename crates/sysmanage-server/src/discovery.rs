//! Discovery beacon.
//!
//! A UDP service, bound to loopback by default, that answers agent
//! discovery datagrams with the server's coordinates and — on request — a
//! default agent configuration. Datagrams naming any other service, or with
//! a missing/invalid hostname, are dropped silently. A best-effort startup
//! broadcast announcement can help agents on the local subnet find the
//! server without prior configuration.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::state::AppContext;

/// Port announcements broadcast to (distinct from the request port).
const ANNOUNCE_PORT: u16 = 31338;

/// Validate a discovery request: correct service, plausible hostname.
#[must_use]
pub fn validate_discovery_request(request: &Value) -> bool {
    if request.get("service").and_then(Value::as_str) != Some("sysmanage-agent") {
        return false;
    }
    match request.get("hostname").and_then(Value::as_str) {
        Some(hostname) => !hostname.is_empty() && hostname.len() <= 255,
        None => false,
    }
}

/// Build the response for a valid discovery request.
#[must_use]
pub fn build_discovery_response(config: &ServerConfig, request: &Value) -> Value {
    let mut response = json!({
        "service": "sysmanage-server",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "server_info": {
            "hostname": config.api.host,
            "api_port": config.api.port,
            "webui_port": config.webui.port,
            "use_ssl": config.use_ssl(),
            "websocket_endpoint": "/api/agent/connect",
            "registration_endpoint": "/api/host/register",
        },
        "network_info": {
            "discovery_port": config.discovery.port,
            "supported_protocols": ["websocket", "https", "http"],
        },
    });

    if request
        .get("request_config")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        let hostname = request
            .get("hostname")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        response["default_config"] = default_agent_config(config, hostname);
    }

    response
}

/// Default configuration handed to a new agent.
#[must_use]
pub fn default_agent_config(config: &ServerConfig, hostname: &str) -> Value {
    json!({
        "server": {
            "hostname": config.api.host,
            "port": config.api.port,
            "use_https": config.use_ssl(),
            "api_path": "/api",
        },
        "client": {
            "hostname_override": null,
            "registration_retry_interval": 30,
            "max_registration_retries": 10,
        },
        "logging": {
            "level": "INFO",
            "file": format!("/var/log/sysmanage-agent-{hostname}.log"),
        },
        "websocket": {
            "auto_reconnect": true,
            "reconnect_interval": 5,
            "ping_interval": 30,
        },
        "i18n": {"language": "en"},
    })
}

/// Run the beacon until shutdown.
pub async fn run_beacon(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    let bind = format!(
        "{}:{}",
        ctx.config.discovery.bind_address, ctx.config.discovery.port
    );
    let socket = match UdpSocket::bind(&bind).await {
        Ok(socket) => socket,
        Err(e) => {
            error!(bind, error = %e, "failed to bind discovery beacon");
            return;
        }
    };
    info!(bind, "discovery beacon listening");

    if ctx.config.discovery.announce {
        broadcast_announcement(&ctx.config).await;
    }

    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, addr) = match received {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(error = %e, "discovery receive error");
                        continue;
                    }
                };

                let Ok(request) = serde_json::from_slice::<Value>(&buf[..len]) else {
                    debug!(peer = %addr, "invalid JSON in discovery request");
                    continue;
                };
                if !validate_discovery_request(&request) {
                    debug!(peer = %addr, "discovery request dropped");
                    continue;
                }

                let response = build_discovery_response(&ctx.config, &request);
                let payload = response.to_string();
                if let Err(e) = socket.send_to(payload.as_bytes(), addr).await {
                    warn!(peer = %addr, error = %e, "discovery response send failed");
                } else {
                    info!(
                        peer = %addr,
                        agent = request.get("hostname").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                        "discovery response sent"
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("discovery beacon stopped");
}

/// Best-effort broadcast announcement on startup. Failure is logged and
/// otherwise ignored.
pub async fn broadcast_announcement(config: &ServerConfig) {
    let announcement = json!({
        "service": "sysmanage-server",
        "announcement_type": "server_broadcast",
        "timestamp": Utc::now().to_rfc3339(),
        "server_info": {
            "hostname": config.api.host,
            "api_port": config.api.port,
            "discovery_port": config.discovery.port,
            "websocket_endpoint": "/api/agent/connect",
        },
    });

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "announcement socket bind failed");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!(error = %e, "announcement broadcast flag failed");
        return;
    }

    let payload = announcement.to_string();
    for subnet in ["192.168.1.255", "192.168.0.255", "10.0.0.255", "172.16.255.255"] {
        let target = format!("{subnet}:{ANNOUNCE_PORT}");
        match socket.send_to(payload.as_bytes(), &target).await {
            Ok(_) => info!(target, "server announcement broadcast"),
            Err(e) => debug!(target, error = %e, "announcement broadcast failed"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wrong_service_is_dropped() {
        assert!(!validate_discovery_request(&json!({
            "service": "something-else",
            "hostname": "agent01",
        })));
    }

    #[test]
    fn missing_or_oversized_hostname_is_dropped() {
        assert!(!validate_discovery_request(&json!({
            "service": "sysmanage-agent",
        })));
        assert!(!validate_discovery_request(&json!({
            "service": "sysmanage-agent",
            "hostname": "",
        })));
        assert!(!validate_discovery_request(&json!({
            "service": "sysmanage-agent",
            "hostname": "x".repeat(256),
        })));
    }

    #[test]
    fn valid_request_gets_server_info() {
        let config = ServerConfig::default();
        let request = json!({"service": "sysmanage-agent", "hostname": "agent01"});
        assert!(validate_discovery_request(&request));

        let response = build_discovery_response(&config, &request);
        assert_eq!(response["service"], "sysmanage-server");
        assert_eq!(response["server_info"]["websocket_endpoint"], "/api/agent/connect");
        assert_eq!(response["server_info"]["api_port"], 8000);
        assert!(response.get("default_config").is_none());
    }

    #[test]
    fn request_config_adds_default_agent_config() {
        let config = ServerConfig::default();
        let request = json!({
            "service": "sysmanage-agent",
            "hostname": "agent01",
            "request_config": true,
        });
        let response = build_discovery_response(&config, &request);
        let default_config = response.get("default_config").unwrap();
        assert_eq!(default_config["server"]["port"], 8000);
        assert_eq!(
            default_config["logging"]["file"],
            "/var/log/sysmanage-agent-agent01.log"
        );
    }
}
