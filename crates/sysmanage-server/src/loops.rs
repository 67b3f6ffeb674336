//! Background control loops.
//!
//! Each loop runs on its own task with a configurable period, wraps every
//! iteration in error logging (a failed sweep never kills the loop), and
//! honors the global shutdown signal, finishing its current iteration
//! before exiting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use sysmanage_db::hosts as hosts_repo;

use crate::cve;
use crate::state::AppContext;

/// Heartbeat monitor: every 60 s, mark hosts silent beyond the configured
/// timeout as down and inactive.
pub async fn heartbeat_monitor(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    info!("heartbeat monitor started");
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = check_heartbeats(&ctx).await {
                    error!(error = %e, "heartbeat check failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("heartbeat monitor stopped");
}

async fn check_heartbeats(ctx: &AppContext) -> Result<(), crate::error::ApiError> {
    let now = Utc::now();
    let threshold = now - chrono::Duration::minutes(ctx.config.monitoring.heartbeat_timeout);

    let mut conn = ctx.pool.acquire().await?;
    let marked = hosts_repo::mark_stale_hosts_down(&mut conn, threshold, now).await?;
    if marked > 0 {
        info!(marked, "hosts marked down after heartbeat timeout");
    }
    Ok(())
}

/// Queue cleanup: every `cleanup_interval_minutes`, expire overdue entries
/// then delete terminal entries past the retention window.
pub async fn queue_cleanup(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    info!("queue cleanup loop started");
    let interval_minutes = ctx.config.message_queue.cleanup_interval_minutes.max(1);
    let mut tick = tokio::time::interval(Duration::from_secs(interval_minutes * 60));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                match ctx.queue.expire_stale(Utc::now()).await {
                    Ok(expired) if expired > 0 => info!(expired, "queue entries expired"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "queue expiry sweep failed"),
                }

                let retention =
                    chrono::Duration::minutes(ctx.config.message_queue.expiration_timeout_minutes);
                match ctx.queue.cleanup(retention).await {
                    Ok(deleted) if deleted > 0 => info!(deleted, "terminal queue entries removed"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "queue cleanup failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("queue cleanup loop stopped");
}

/// Session sweeper: every 5 min, drop stale connection-security records and
/// prune attempt history.
pub async fn session_sweeper(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    info!("session sweeper started");
    let mut tick = tokio::time::interval(Duration::from_secs(300));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                ctx.comsec.cleanup_stale_connections().await;
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("session sweeper stopped");
}

/// CVE refresh scheduler: while enabled, fire a refresh whenever
/// `next_refresh_at` is due. One source's failure never aborts the others.
pub async fn cve_refresh_scheduler(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    info!("CVE refresh scheduler started");
    let mut tick = tokio::time::interval(Duration::from_secs(300));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = cve::run_scheduled_refresh(&ctx).await {
                    error!(error = %e, "CVE refresh iteration failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("CVE refresh scheduler stopped");
}
