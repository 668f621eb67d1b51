//! Axum JSON read API over the record store and the live feed.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::error;
use vulnview_client::{CvssData, RawCveItem, VulnerabilityFeed};
use vulnview_core::{CveFilter, CveRecord};
use vulnview_store::CveRepository;

pub const CRATE_NAME: &str = "vulnview-web";

#[derive(Clone)]
pub struct AppState {
    pub repo: CveRepository,
    pub feed: Arc<dyn VulnerabilityFeed>,
}

impl AppState {
    pub fn new(repo: CveRepository, feed: Arc<dyn VulnerabilityFeed>) -> Self {
        Self { repo, feed }
    }
}

/// Listing query parameters. Unrecognized parameters are ignored, not
/// rejected.
#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    cve_id: Option<String>,
    year: Option<i32>,
    days: Option<i64>,
    results_per_page: Option<i64>,
    page: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ListedCve {
    cve_id: String,
    source_identifier: String,
    published_date: String,
    last_modified_date: String,
    status: String,
}

impl From<CveRecord> for ListedCve {
    fn from(record: CveRecord) -> Self {
        Self {
            cve_id: record.cve_id,
            source_identifier: record.source_identifier,
            published_date: record.published_date.to_rfc3339(),
            last_modified_date: record.last_modified_date.to_rfc3339(),
            status: record.status,
        }
    }
}

#[derive(Debug, Serialize)]
struct ListResponse {
    cves: Vec<ListedCve>,
    total_records: i64,
    total_pages: i64,
    start_record: i64,
    end_record: i64,
    current_page: i64,
    results_per_page: i64,
}

/// Single-record detail view, assembled live from the feed. Every optional
/// upstream sub-field has an explicit default.
#[derive(Debug, Serialize)]
struct DetailView {
    id: String,
    description: String,
    severity: String,
    score: Option<f64>,
    vector_string: String,
    impact: CvssData,
    exploitability_score: Option<f64>,
    impact_score: Option<f64>,
    cpe: Vec<CpeView>,
}

#[derive(Debug, Serialize)]
struct CpeView {
    criteria: String,
    match_criteria_id: String,
    vulnerable: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/cves/list", get(list_cves_handler))
        .route("/cves/{cve_id}", get(cve_details_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn list_cves_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let results_per_page = query.results_per_page.unwrap_or(10).max(1);
    let page = query.page.unwrap_or(1).max(1);
    let filter = CveFilter {
        cve_id: query.cve_id.filter(|s| !s.is_empty()),
        year: query.year,
        days: query.days,
    };

    match state
        .repo
        .list_filtered(&filter, results_per_page, page - 1)
        .await
    {
        Ok((records, total_records)) => {
            let start_record = (page - 1) * results_per_page + 1;
            let end_record = (start_record + results_per_page - 1).min(total_records);
            let response = ListResponse {
                cves: records.into_iter().map(ListedCve::from).collect(),
                total_records,
                total_pages: (total_records as u64).div_ceil(results_per_page as u64) as i64,
                start_record,
                end_record,
                current_page: page,
                results_per_page,
            };
            Json(response).into_response()
        }
        Err(err) => server_error(err.to_string()),
    }
}

async fn cve_details_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(cve_id): AxumPath<String>,
) -> Response {
    match state.feed.fetch_by_id(&cve_id).await {
        Ok(Some(item)) => Json(detail_view(item)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "CVE not found"})),
        )
            .into_response(),
        Err(err) => {
            error!(%cve_id, error = %err, "detail fetch failed upstream");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": "upstream feed unavailable"})),
            )
                .into_response()
        }
    }
}

fn detail_view(item: RawCveItem) -> DetailView {
    let description = item
        .descriptions
        .iter()
        .find(|d| d.lang == "en")
        .map(|d| d.value.clone())
        .unwrap_or_else(|| "No description available".to_string());

    // Only the first CVSS v2 metric is surfaced, matching the read contract.
    let metric = item.metrics.cvss_metric_v2.into_iter().next();
    let (severity, exploitability_score, impact_score, cvss_data) = match metric {
        Some(m) => (
            m.base_severity.unwrap_or_else(|| "Unknown".to_string()),
            m.exploitability_score,
            m.impact_score,
            m.cvss_data,
        ),
        None => ("Unknown".to_string(), None, None, CvssData::default()),
    };

    let cpe = item
        .configurations
        .into_iter()
        .flat_map(|conf| conf.nodes)
        .flat_map(|node| node.cpe_match)
        .map(|m| CpeView {
            criteria: m.criteria,
            match_criteria_id: m.match_criteria_id,
            vulnerable: m.vulnerable,
        })
        .collect();

    DetailView {
        id: item.id,
        description,
        severity,
        score: cvss_data.base_score,
        vector_string: cvss_data
            .vector_string
            .clone()
            .unwrap_or_else(|| "N/A".to_string()),
        impact: cvss_data,
        exploitability_score,
        impact_score,
        cpe,
    }
}

fn server_error(message: String) -> Response {
    error!(error = %message, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use vulnview_client::{FeedError, FeedPage};
    use vulnview_core::NewCve;
    use vulnview_store::Database;

    struct FakeFeed {
        items: Vec<RawCveItem>,
        fail: bool,
    }

    #[async_trait]
    impl VulnerabilityFeed for FakeFeed {
        async fn fetch_page(&self, _offset: i64, _page_size: i64) -> Result<FeedPage, FeedError> {
            Ok(FeedPage::default())
        }

        async fn fetch_by_id(&self, cve_id: &str) -> Result<Option<RawCveItem>, FeedError> {
            if self.fail {
                return Err(FeedError::Malformed("injected".to_string()));
            }
            Ok(self.items.iter().find(|i| i.id == cve_id).cloned())
        }
    }

    async fn seeded_state(feed: FakeFeed) -> AppState {
        let db = Database::connect_in_memory().await.expect("connect");
        let repo = CveRepository::from(&db);
        for (cve_id, year, month, day) in [
            ("CVE-1999-0113", 2021, 1, 1),
            ("CVE-2022-67890", 2022, 5, 15),
            ("CVE-2023-98765", 2023, 9, 10),
        ] {
            repo.insert(&NewCve {
                cve_id: cve_id.to_string(),
                source_identifier: "cve@mitre.org".to_string(),
                published_date: Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap(),
                last_modified_date: Utc
                    .with_ymd_and_hms(year, month, day + 1, 12, 0, 0)
                    .unwrap(),
                status: "Analyzed".to_string(),
            })
            .await
            .expect("seed");
        }
        AppState::new(repo, Arc::new(feed))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn empty_feed() -> FakeFeed {
        FakeFeed {
            items: vec![],
            fail: false,
        }
    }

    #[tokio::test]
    async fn list_returns_all_with_pagination_metadata() {
        let app = app(seeded_state(empty_feed()).await);
        let (status, body) = get_json(app, "/cves/list").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_records"], 3);
        assert_eq!(body["total_pages"], 1);
        assert_eq!(body["current_page"], 1);
        assert_eq!(body["start_record"], 1);
        assert_eq!(body["end_record"], 3);
        assert_eq!(body["cves"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn year_filter_returns_exactly_one_record() {
        let app = app(seeded_state(empty_feed()).await);
        let (status, body) = get_json(app, "/cves/list?year=2022").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_records"], 1);
        assert_eq!(body["cves"][0]["cve_id"], "CVE-2022-67890");
    }

    #[tokio::test]
    async fn unknown_query_params_are_ignored() {
        let app = app(seeded_state(empty_feed()).await);
        let (status, body) = get_json(app, "/cves/list?invalid_param=test&also=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_records"], 3);
    }

    #[tokio::test]
    async fn pagination_metadata_for_page_two_of_twenty_five() {
        let db = Database::connect_in_memory().await.expect("connect");
        let repo = CveRepository::from(&db);
        for i in 0..25 {
            repo.insert(&NewCve {
                cve_id: format!("CVE-2024-{i:05}"),
                source_identifier: "s".to_string(),
                published_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                last_modified_date: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                status: "Received".to_string(),
            })
            .await
            .expect("seed");
        }
        let app = app(AppState::new(repo, Arc::new(empty_feed())));

        let (status, body) = get_json(app.clone(), "/cves/list?page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_records"], 25);
        assert_eq!(body["total_pages"], 3);
        assert_eq!(body["start_record"], 11);
        assert_eq!(body["end_record"], 20);
        assert_eq!(body["cves"].as_array().unwrap().len(), 10);

        let (_, last) = get_json(app, "/cves/list?page=3").await;
        assert_eq!(last["cves"].as_array().unwrap().len(), 5);
        assert_eq!(last["end_record"], 25);
    }

    #[tokio::test]
    async fn unknown_id_detail_is_not_found() {
        let app = app(seeded_state(empty_feed()).await);
        let (status, body) = get_json(app, "/cves/CVE-9999-00000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "CVE not found");
    }

    #[tokio::test]
    async fn upstream_failure_is_bad_gateway_not_not_found() {
        let app = app(
            seeded_state(FakeFeed {
                items: vec![],
                fail: true,
            })
            .await,
        );
        let (status, body) = get_json(app, "/cves/CVE-1999-0113").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "upstream feed unavailable");
    }

    #[tokio::test]
    async fn detail_extracts_fields_with_defaults() {
        let item: RawCveItem = serde_json::from_value(serde_json::json!({
            "id": "CVE-1999-0113",
            "sourceIdentifier": "cve@mitre.org",
            "published": "2021-01-01T12:00:00.000",
            "lastModified": "2021-01-02T12:00:00.000",
            "vulnStatus": "Analyzed",
            "descriptions": [{"lang": "fr", "value": "description seulement"}],
            "configurations": [
                {"nodes": [{"cpeMatch": [
                    {"vulnerable": true,
                     "criteria": "cpe:2.3:o:bsd:bsd:*",
                     "matchCriteriaId": "3ACDA4BC"}
                ]}]},
                {"nodes": [{"cpeMatch": [
                    {"vulnerable": false,
                     "criteria": "cpe:2.3:o:sun:sunos:*",
                     "matchCriteriaId": "9C2CF332"}
                ]}]}
            ]
        }))
        .expect("item");
        let app = app(
            seeded_state(FakeFeed {
                items: vec![item],
                fail: false,
            })
            .await,
        );

        let (status, body) = get_json(app, "/cves/CVE-1999-0113").await;
        assert_eq!(status, StatusCode::OK);
        // No "en" description and no CVSS v2 metric: defaults apply.
        assert_eq!(body["description"], "No description available");
        assert_eq!(body["severity"], "Unknown");
        assert_eq!(body["score"], serde_json::Value::Null);
        assert_eq!(body["vector_string"], "N/A");
        // CPE matches flatten across all configuration nodes.
        let cpe = body["cpe"].as_array().unwrap();
        assert_eq!(cpe.len(), 2);
        assert_eq!(cpe[0]["match_criteria_id"], "3ACDA4BC");
        assert_eq!(cpe[1]["vulnerable"], false);
    }
}
