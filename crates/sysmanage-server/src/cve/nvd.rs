//! NVD source — the first-class vulnerability feed.
//!
//! Pulls recent CVEs from the NVD 2.0 REST API. An API key raises the rate
//! limit and is passed via the `apiKey` header when available. One fetch is
//! bounded by a 60 s timeout.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use sysmanage_db::cve as cve_repo;
use sysmanage_db::models::{PackageMapping, VulnerabilityRecord};

use super::{CveSource, RefreshCounts};

const NVD_API_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const PAGE_SIZE: u32 = 2000;

/// The NVD fetcher.
pub struct NvdSource {
    http: reqwest::Client,
}

impl NvdSource {
    /// Build the fetcher with its bounded HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for NvdSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CveSource for NvdSource {
    fn name(&self) -> &'static str {
        "nvd"
    }

    async fn refresh(&self, pool: &PgPool, api_key: Option<&str>) -> Result<RefreshCounts, String> {
        let mut request = self
            .http
            .get(NVD_API_URL)
            .query(&[("resultsPerPage", PAGE_SIZE.to_string())]);
        if let Some(key) = api_key {
            request = request.header("apiKey", key);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("NVD returned {}", response.status()));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        let vulnerabilities = body
            .get("vulnerabilities")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut counts = RefreshCounts::default();
        let now = Utc::now();

        let mut conn = pool.acquire().await.map_err(|e| e.to_string())?;
        for item in &vulnerabilities {
            let Some(cve) = item.get("cve") else { continue };
            let Some(cve_id) = cve.get("id").and_then(|v| v.as_str()) else {
                continue;
            };

            let description = cve
                .get("descriptions")
                .and_then(|v| v.as_array())
                .and_then(|descs| {
                    descs.iter().find(|d| {
                        d.get("lang").and_then(|v| v.as_str()) == Some("en")
                    })
                })
                .and_then(|d| d.get("value"))
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned);

            let metrics = cve.get("metrics");
            let (severity, cvss_score) = metrics
                .and_then(|m| {
                    m.get("cvssMetricV31")
                        .or_else(|| m.get("cvssMetricV30"))
                        .and_then(|v| v.as_array())
                })
                .and_then(|arr| arr.first())
                .and_then(|metric| metric.get("cvssData"))
                .map_or((None, None), |data| {
                    (
                        data.get("baseSeverity")
                            .and_then(|v| v.as_str())
                            .map(ToOwned::to_owned),
                        data.get("baseScore").and_then(|v| v.as_f64()),
                    )
                });

            let published_at = cve
                .get("published")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            let modified_at = cve
                .get("lastModified")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));

            cve_repo::upsert_vulnerability(
                &mut conn,
                &VulnerabilityRecord {
                    id: Uuid::new_v4(),
                    cve_id: cve_id.to_owned(),
                    source: "nvd".to_owned(),
                    severity,
                    cvss_score,
                    description,
                    published_at,
                    modified_at,
                    ingested_at: now,
                },
            )
            .await
            .map_err(|e| e.to_string())?;
            counts.vulnerabilities_processed += 1;

            // Affected products map to package rows by CPE product name.
            let criteria: Vec<&str> = cve
                .get("configurations")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .filter_map(|config| config.get("nodes").and_then(|v| v.as_array()))
                .flatten()
                .filter_map(|node| node.get("cpeMatch").and_then(|v| v.as_array()))
                .flatten()
                .filter_map(|m| m.get("criteria").and_then(|v| v.as_str()))
                .collect();

            for criterion in criteria {
                // cpe:2.3:a:vendor:product:version:...
                let Some(product) = criterion.split(':').nth(4) else {
                    continue;
                };
                if product.is_empty() || product == "*" {
                    continue;
                }
                cve_repo::upsert_package_mapping(
                    &mut conn,
                    &PackageMapping {
                        id: Uuid::new_v4(),
                        cve_id: cve_id.to_owned(),
                        package_name: product.to_owned(),
                        affected_versions: criterion.split(':').nth(5).and_then(|v| {
                            if v == "*" {
                                None
                            } else {
                                Some(v.to_owned())
                            }
                        }),
                        fixed_version: None,
                    },
                )
                .await
                .map_err(|e| e.to_string())?;
                counts.packages_processed += 1;
            }
        }

        Ok(counts)
    }
}
