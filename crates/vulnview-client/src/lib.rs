//! HTTP client for the upstream CVE feed (NVD CVE API 2.0).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "vulnview-client";

pub const DEFAULT_FEED_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

/// One page of the upstream feed.
///
/// Both fields default so an empty body decodes to an empty page rather
/// than a parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    #[serde(default)]
    pub vulnerabilities: Vec<VulnerabilityEnvelope>,
    #[serde(default)]
    pub total_results: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityEnvelope {
    pub cve: RawCveItem,
}

/// A raw feed item. Listing fields are required; detail-only collections
/// default to empty so paged responses that omit them still decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCveItem {
    pub id: String,
    pub source_identifier: String,
    pub published: String,
    pub last_modified: String,
    #[serde(default)]
    pub vuln_status: String,
    #[serde(default)]
    pub descriptions: Vec<LangString>,
    #[serde(default)]
    pub metrics: CveMetrics,
    #[serde(default)]
    pub configurations: Vec<Configuration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LangString {
    pub lang: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CveMetrics {
    #[serde(default)]
    pub cvss_metric_v2: Vec<CvssMetricV2>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvssMetricV2 {
    #[serde(default)]
    pub base_severity: Option<String>,
    #[serde(default)]
    pub exploitability_score: Option<f64>,
    #[serde(default)]
    pub impact_score: Option<f64>,
    #[serde(default)]
    pub cvss_data: CvssData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvssData {
    #[serde(default)]
    pub base_score: Option<f64>,
    #[serde(default)]
    pub vector_string: Option<String>,
    #[serde(default)]
    pub access_vector: Option<String>,
    #[serde(default)]
    pub access_complexity: Option<String>,
    #[serde(default)]
    pub authentication: Option<String>,
    #[serde(default)]
    pub confidentiality_impact: Option<String>,
    #[serde(default)]
    pub integrity_impact: Option<String>,
    #[serde(default)]
    pub availability_impact: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default)]
    pub nodes: Vec<ConfigNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigNode {
    #[serde(default)]
    pub cpe_match: Vec<CpeMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpeMatch {
    pub criteria: String,
    pub match_criteria_id: String,
    pub vulnerable: bool,
}

/// Feed failures are terminal for the current reconciliation run; there is
/// no retry at this layer. The next scheduled run starts over from offset 0.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("feed returned http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed feed response: {0}")]
    Malformed(String),
}

/// Seam between the reconciler/read path and the upstream feed.
///
/// The production implementation is [`NvdClient`]; tests substitute an
/// in-memory feed.
#[async_trait]
pub trait VulnerabilityFeed: Send + Sync {
    /// Fetch one page of the feed starting at `offset`.
    async fn fetch_page(&self, offset: i64, page_size: i64) -> Result<FeedPage, FeedError>;

    /// Fetch a single record by id, filtered server-side. `Ok(None)` when
    /// the upstream has no vulnerability entry for the id.
    async fn fetch_by_id(&self, cve_id: &str) -> Result<Option<RawCveItem>, FeedError>;
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FEED_URL.to_string(),
            user_agent: "vulnview/0.1".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// HTTP client for the NVD CVE API 2.0.
///
/// The upstream requires an identifying client string, so the `User-Agent`
/// header is always set.
#[derive(Debug, Clone)]
pub struct NvdClient {
    client: reqwest::Client,
    base_url: Url,
}

impl NvdClient {
    pub fn new(config: FeedConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("invalid feed url {}", config.base_url))?;
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, base_url })
    }

    async fn get_feed(&self, url: Url) -> Result<FeedPage, FeedError> {
        debug!(url = %url, "fetching feed");
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|err| FeedError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl VulnerabilityFeed for NvdClient {
    async fn fetch_page(&self, offset: i64, page_size: i64) -> Result<FeedPage, FeedError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("startIndex", &offset.to_string())
            .append_pair("resultsPerPage", &page_size.to_string());
        self.get_feed(url).await
    }

    async fn fetch_by_id(&self, cve_id: &str) -> Result<Option<RawCveItem>, FeedError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair("cveId", cve_id);
        let page = match self.get_feed(url).await {
            Ok(page) => page,
            // The id-filter variant reports an unknown id as a 404.
            Err(FeedError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                return Ok(None)
            }
            Err(err) => return Err(err),
        };
        Ok(page.vulnerabilities.into_iter().next().map(|env| env.cve))
    }
}
