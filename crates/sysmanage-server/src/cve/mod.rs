//! Vulnerability data refresh.
//!
//! Sources are pluggable behind [`CveSource`]; the scheduler walks every
//! enabled source, isolating failures so one bad upstream never starves the
//! rest, and writes an [`sysmanage_db::models::IngestionLog`] row per source
//! per run. The summary reports per-source status alongside the totals so
//! partial failure is visible to operators.

pub mod nvd;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use sysmanage_db::cve as cve_repo;
use sysmanage_db::models::IngestionLog;

use crate::error::ApiError;
use crate::state::AppContext;

/// Counters returned by one source refresh.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RefreshCounts {
    pub vulnerabilities_processed: i64,
    pub packages_processed: i64,
}

/// A pluggable vulnerability source.
#[async_trait]
pub trait CveSource: Send + Sync {
    /// Stable source identifier (`nvd`, ...).
    fn name(&self) -> &'static str;

    /// Fetch and upsert this source's data.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason; the scheduler records it and moves
    /// on to the next source.
    async fn refresh(&self, pool: &PgPool, api_key: Option<&str>) -> Result<RefreshCounts, String>;
}

/// Outcome of one source within a refresh run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub status: &'static str,
    pub vulnerabilities_processed: i64,
    pub packages_processed: i64,
    pub error: Option<String>,
}

/// Aggregate outcome of a refresh run.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub total_vulnerabilities: i64,
    pub total_packages: i64,
    pub errors: Vec<String>,
    pub sources: HashMap<String, SourceOutcome>,
}

/// Resolve a source by its stable name.
#[must_use]
pub fn source_by_name(name: &str) -> Option<Box<dyn CveSource>> {
    match name {
        "nvd" => Some(Box::new(nvd::NvdSource::new())),
        _ => None,
    }
}

/// Refresh every named source, isolating failures, logging one ingestion
/// row per source.
///
/// # Errors
///
/// Returns [`ApiError::Internal`] only when the ingestion log itself cannot
/// be written; source failures are reported inside the summary.
pub async fn refresh_sources(
    ctx: &AppContext,
    source_names: &[String],
    api_key: Option<&str>,
) -> Result<RefreshSummary, ApiError> {
    let mut summary = RefreshSummary {
        total_vulnerabilities: 0,
        total_packages: 0,
        errors: Vec::new(),
        sources: HashMap::new(),
    };

    for name in source_names {
        let started_at = Utc::now();
        let Some(source) = source_by_name(name) else {
            let reason = format!("unknown CVE source '{name}'");
            summary.errors.push(reason.clone());
            summary.sources.insert(
                name.clone(),
                SourceOutcome {
                    status: "error",
                    vulnerabilities_processed: 0,
                    packages_processed: 0,
                    error: Some(reason),
                },
            );
            continue;
        };

        let (outcome, log_status, log_error, counts) =
            match source.refresh(&ctx.pool, api_key).await {
                Ok(counts) => {
                    info!(
                        source = name.as_str(),
                        vulnerabilities = counts.vulnerabilities_processed,
                        packages = counts.packages_processed,
                        "CVE source refreshed"
                    );
                    summary.total_vulnerabilities += counts.vulnerabilities_processed;
                    summary.total_packages += counts.packages_processed;
                    (
                        SourceOutcome {
                            status: "success",
                            vulnerabilities_processed: counts.vulnerabilities_processed,
                            packages_processed: counts.packages_processed,
                            error: None,
                        },
                        "success",
                        None,
                        counts,
                    )
                }
                Err(reason) => {
                    error!(source = name.as_str(), error = %reason, "CVE source refresh failed");
                    let message = format!("Source {name} failed: {reason}");
                    summary.errors.push(message.clone());
                    (
                        SourceOutcome {
                            status: "error",
                            vulnerabilities_processed: 0,
                            packages_processed: 0,
                            error: Some(message.clone()),
                        },
                        "error",
                        Some(message),
                        RefreshCounts::default(),
                    )
                }
            };

        let mut conn = ctx.pool.acquire().await?;
        cve_repo::insert_ingestion_log(
            &mut conn,
            &IngestionLog {
                id: Uuid::new_v4(),
                source: name.clone(),
                status: log_status.to_owned(),
                vulnerabilities_processed: counts.vulnerabilities_processed,
                packages_processed: counts.packages_processed,
                error_message: log_error,
                started_at,
                completed_at: Some(Utc::now()),
            },
        )
        .await?;

        summary.sources.insert(name.clone(), outcome);
    }

    Ok(summary)
}

/// One scheduler iteration: when settings exist, are enabled, and
/// `next_refresh_at` is due, run the refresh and advance the schedule.
///
/// # Errors
///
/// Returns [`ApiError`] on storage failure only.
pub async fn run_scheduled_refresh(ctx: &AppContext) -> Result<(), ApiError> {
    let mut conn = ctx.pool.acquire().await?;
    let Some(settings) = cve_repo::get_settings(&mut conn).await? else {
        return Ok(());
    };
    drop(conn);

    if !settings.enabled {
        return Ok(());
    }

    let now = Utc::now();
    if settings.next_refresh_at.is_some_and(|next| next > now) {
        return Ok(());
    }

    let source_names: Vec<String> = settings
        .enabled_sources
        .as_array()
        .map(|names| {
            names
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default();

    if source_names.is_empty() {
        return Ok(());
    }

    // API keys come from the vault-backed secret store when configured.
    let summary = refresh_sources(ctx, &source_names, None).await?;
    info!(
        total_vulnerabilities = summary.total_vulnerabilities,
        failures = summary.errors.len(),
        "CVE refresh cycle completed"
    );

    let next = now + chrono::Duration::hours(i64::from(settings.refresh_interval_hours.max(1)));
    let mut conn = ctx.pool.acquire().await?;
    cve_repo::mark_refreshed(&mut conn, settings.id, now, next).await?;

    Ok(())
}
