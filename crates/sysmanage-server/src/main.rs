//! SysManage server entry point.
//!
//! Loads the YAML configuration, connects the database pool, builds the
//! shared context, spawns the background control loops and the discovery
//! beacon, then serves the agent WebSocket endpoint with graceful shutdown.
//! Loops finish their current iteration before the process exits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use sysmanage_core::audit::AuditWriter;
use sysmanage_core::certs::CertificateAuthority;
use sysmanage_core::comsec::ConnectionSecurity;
use sysmanage_core::login::{LoginTracker, PasswordPolicy, SessionTokens};
use sysmanage_core::queue::MessageQueue;
use sysmanage_core::vault::VaultClient;

use sysmanage_server::config::ServerConfig;
use sysmanage_server::email::LogMailer;
use sysmanage_server::handlers::HandlerRegistry;
use sysmanage_server::state::AppContext;
use sysmanage_server::ws;
use sysmanage_server::ws::registry::ConnectionRegistry;
use sysmanage_server::{discovery, loops};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("SYSMANAGE_CONFIG")
        .map_or_else(|_| PathBuf::from("/etc/sysmanage.yaml"), PathBuf::from);
    let config = if config_path.exists() {
        ServerConfig::load(&config_path)?
    } else {
        ServerConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .json()
        .init();

    info!(config = %config_path.display(), "SysManage server starting");

    let ctx = build_context(config).await?;

    // Shutdown signal shared by every loop and the server.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    workers.push(tokio::spawn(loops::heartbeat_monitor(
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    )));
    workers.push(tokio::spawn(loops::queue_cleanup(
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    )));
    workers.push(tokio::spawn(loops::session_sweeper(
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    )));
    workers.push(tokio::spawn(loops::cve_refresh_scheduler(
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    )));
    workers.push(tokio::spawn(discovery::run_beacon(
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    )));

    let app = build_router(Arc::clone(&ctx));
    let bind_addr: SocketAddr = format!("0.0.0.0:{}", ctx.config.api.port)
        .parse()
        .context("invalid API bind address")?;

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(addr = %bind_addr, "SysManage server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("server error")?;

    info!("waiting for background workers to stop");
    for worker in workers {
        let _ = tokio::time::timeout(Duration::from_secs(10), worker).await;
    }

    info!("SysManage server stopped");
    Ok(())
}

/// Build the shared context from configuration.
async fn build_context(config: ServerConfig) -> anyhow::Result<Arc<AppContext>> {
    let pool = sysmanage_db::connect(&config.database.url, config.database.max_connections)
        .await
        .context("database connection failed")?;

    let queue = Arc::new(MessageQueue::new(pool.clone()));
    let notifier = queue.notifier();

    let ca = CertificateAuthority::generate("sysmanage-server-ca")
        .context("certificate authority generation failed")?;

    let vault = if config.vault.enabled {
        Some(Arc::new(
            VaultClient::new(&config.vault.url, &config.vault.mount)
                .context("vault client construction failed")?,
        ))
    } else {
        None
    };

    if config.security.jwt_secret.is_empty() {
        warn!("security.jwt_secret is empty; connection and session tokens are forgeable");
    }

    let ctx = AppContext {
        comsec: Arc::new(ConnectionSecurity::new(&config.security.jwt_secret)),
        login_tracker: Arc::new(LoginTracker::default()),
        passwords: PasswordPolicy::new(&config.security.password_salt),
        session_tokens: SessionTokens::new(&config.security.jwt_secret),
        ca: Arc::new(ca),
        vault,
        mailer: Arc::new(LogMailer),
        sessions: Arc::new(ConnectionRegistry::default()),
        handlers: HandlerRegistry::standard(),
        audit: AuditWriter,
        queue,
        notifier,
        pool,
        config,
    };

    Ok(Arc::new(ctx))
}

/// The agent-facing router. The operator HTTP façade is a separate
/// deployment that calls the service layer.
fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/agent/connect", get(ws::agent_connect))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Resolve on SIGINT/SIGTERM, then flip the shutdown signal for the loops.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
