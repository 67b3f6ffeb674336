//! Agent WebSocket endpoint.
//!
//! Upgrade flow: rate-limit check, connection-token validation (§ token
//! format), host lookup — by client certificate serial when the TLS edge
//! forwards one, falling back to the token's hostname for agents that have
//! not been issued a certificate yet — then the `approved && active`
//! preconditions, a LOGIN audit entry, and hand-off to the session loop.
//!
//! A host that is still `pending` may hold a token-only session: that is the
//! channel its `host_approved` notification (certificate included) arrives
//! on. A rejected host is refused outright.

pub mod registry;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use sysmanage_core::audit::{ActionType, AuditContext, EntityType};
use sysmanage_db::hosts as hosts_repo;
use sysmanage_db::models::{ApprovalStatus, AuditResult, Host};

use crate::error::ApiError;
use crate::state::AppContext;

/// Header carrying the connection token.
const TOKEN_HEADER: &str = "x-connection-token";

/// Header the TLS edge uses to forward the client certificate serial.
const SERIAL_HEADER: &str = "x-certificate-serial";

/// Query-string fallback for the connection token.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
}

/// `GET /api/agent/connect` — authenticate and upgrade to a session.
pub async fn agent_connect(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> Response {
    let client_ip = addr.ip().to_string();

    if ctx.comsec.is_connection_rate_limited(&client_ip).await {
        return ApiError::RateLimited("too many connection attempts".to_owned()).into_response();
    }
    ctx.comsec.record_connection_attempt(&client_ip).await;

    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
        .or(query.token);
    let Some(token) = token else {
        return ApiError::Unauthenticated("missing connection token".to_owned()).into_response();
    };

    let connection_id = match ctx.comsec.validate_connection_token(&token, &client_ip).await {
        Ok(connection_id) => connection_id,
        Err(rejection) => {
            warn!(client_ip, %rejection, "agent connection refused");
            return ApiError::Unauthenticated(rejection.to_string()).into_response();
        }
    };

    let serial = headers
        .get(SERIAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    let host = match authenticate_host(&ctx, serial.as_deref(), &token).await {
        Ok(host) => host,
        Err(err) => return err.into_response(),
    };

    info!(
        host_id = %host.id,
        fqdn = %host.fqdn,
        client_ip,
        connection_id,
        "agent session authenticated"
    );

    ws.on_upgrade(move |socket| session::run(socket, ctx, host, connection_id, client_ip))
}

/// Resolve and vet the host this connection speaks for.
async fn authenticate_host(
    ctx: &Arc<AppContext>,
    serial: Option<&str>,
    token: &str,
) -> Result<Host, ApiError> {
    let mut tx = ctx.pool.begin().await?;

    let host = if let Some(serial) = serial {
        let host = hosts_repo::get_host_by_certificate_serial(&mut tx, serial)
            .await
            .map_err(|_| ApiError::Unauthenticated("unknown certificate serial".to_owned()))?;
        if host.approval_status != ApprovalStatus::Approved {
            return Err(ApiError::Unauthenticated(
                "host is not approved".to_owned(),
            ));
        }
        host
    } else {
        // Token-only path: resolve by the hostname the token was issued to.
        let hostname = token_hostname(token)
            .ok_or_else(|| ApiError::Unauthenticated("malformed connection token".to_owned()))?;
        hosts_repo::resolve_host_by_hostname(&mut tx, &hostname, false)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("host '{hostname}' is not registered")))?
    };

    if host.approval_status == ApprovalStatus::Rejected {
        return Err(ApiError::PermissionDenied(
            "host registration was rejected".to_owned(),
        ));
    }

    // An approved host must already be active when it authenticates. A
    // pending host may still hold a token-only session so its approval
    // notification can reach it.
    if host.approval_status == ApprovalStatus::Approved && !host.active {
        return Err(ApiError::PermissionDenied("host is not active".to_owned()));
    }

    let now = Utc::now();
    hosts_repo::touch_heartbeat(&mut tx, host.id, now).await?;

    ctx.audit
        .log(
            &mut tx,
            ActionType::Login,
            EntityType::Agent,
            &format!("Agent session opened for host '{}'", host.fqdn),
            AuditResult::Success,
            AuditContext {
                entity_id: Some(host.id.to_string()),
                entity_name: Some(host.fqdn.clone()),
                category: Some("agent_session".to_owned()),
                ..AuditContext::default()
            },
        )
        .await?;

    tx.commit().await?;
    Ok(host)
}

/// Pull the hostname out of a (already signature-checked) connection token.
fn token_hostname(token: &str) -> Option<String> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(token.as_bytes())
        .ok()?;
    let envelope: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    envelope
        .get("payload")?
        .get("hostname")?
        .as_str()
        .map(ToOwned::to_owned)
}
