use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use mandi_adapters::{DataGovConfig, DataGovSource, SourceError, UpstreamSource};
use mandi_core::DateWindow;
use mandi_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use reqwest::Url;
use serde_json::json;

#[derive(Clone)]
struct Upstream {
    total: usize,
    /// Whether envelopes carry the `total` field.
    reports_total: bool,
    /// Number of leading requests answered with this status instead of data.
    failures: usize,
    failure_status: StatusCode,
    hits: Arc<AtomicUsize>,
}

async fn resource(
    State(upstream): State<Upstream>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let hit = upstream.hits.fetch_add(1, Ordering::SeqCst);
    if hit < upstream.failures {
        return (upstream.failure_status, "unavailable").into_response();
    }
    if query.get("api-key").map(String::as_str) != Some("test-key") {
        return (StatusCode::BAD_REQUEST, "missing key").into_response();
    }

    let offset: usize = query.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit: usize = query.get("limit").and_then(|v| v.parse().ok()).unwrap_or(10);
    let end = (offset + limit).min(upstream.total);
    let records: Vec<_> = (offset..end)
        .map(|i| {
            json!({
                "State": "Punjab",
                "District": "Ludhiana",
                "Market": format!("Market {i}"),
                "Commodity": "Wheat",
                "Variety": "Dara",
                "Grade": "FAQ",
                "Arrival_Date": query.get("range[Arrival_Date][gte]").cloned().unwrap_or_default(),
                "Min_x0020_Price": 2275,
                "Max_x0020_Price": 2300,
                "Modal_x0020_Price": 2290,
            })
        })
        .collect();
    let mut body = json!({
        "status": "ok",
        "count": records.len(),
        "records": records,
    });
    if upstream.reports_total {
        body["total"] = json!(upstream.total);
    }
    Json(body).into_response()
}

async fn serve(upstream: Upstream) -> Url {
    let app = Router::new()
        .route("/resource/wheat", get(resource))
        .with_state(upstream);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/resource/wheat")).unwrap()
}

fn source(api_url: Url, page_size: usize, max_pages: usize) -> DataGovSource {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("mandi-archive-tests".into()),
        backoff: BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
    })
    .unwrap();
    DataGovSource::new(
        http,
        DataGovConfig {
            api_url,
            api_key: "test-key".into(),
            page_size,
            max_pages,
        },
    )
}

fn june_window() -> DateWindow {
    DateWindow::single_day(NaiveDate::from_ymd_opt(2024, 6, 2).unwrap())
}

fn upstream(total: usize, failures: usize, failure_status: StatusCode) -> Upstream {
    Upstream {
        total,
        reports_total: true,
        failures,
        failure_status,
        hits: Arc::new(AtomicUsize::new(0)),
    }
}

#[tokio::test]
async fn paginates_until_total_is_reached() {
    let upstream = upstream(7, 0, StatusCode::OK);
    let hits = upstream.hits.clone();
    let url = serve(upstream).await;

    let snapshot = source(url, 3, 10).fetch(Some(june_window())).await.expect("snapshot");
    assert_eq!(snapshot.len(), 7);
    assert_eq!(snapshot.pages, 3);
    assert_eq!(snapshot.upstream_total, Some(7));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(snapshot.records[6].fields["Market"], "Market 6");
    assert_eq!(snapshot.records[0].fields["Arrival_Date"], "2024-06-02");
}

#[tokio::test]
async fn exact_multiple_of_page_size_stops_on_total() {
    let upstream = upstream(4, 0, StatusCode::OK);
    let hits = upstream.hits.clone();
    let url = serve(upstream).await;

    let snapshot = source(url, 2, 10).fetch(Some(june_window())).await.unwrap();
    assert_eq!(snapshot.len(), 4);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let upstream = upstream(2, 2, StatusCode::SERVICE_UNAVAILABLE);
    let hits = upstream.hits.clone();
    let url = serve(upstream).await;

    let snapshot = source(url, 10, 10).fetch(Some(june_window())).await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let upstream = upstream(2, usize::MAX, StatusCode::BAD_GATEWAY);
    let hits = upstream.hits.clone();
    let url = serve(upstream).await;

    let err = source(url, 10, 10)
        .fetch(Some(june_window()))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "{err}");
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn unauthorized_fails_without_retry() {
    let upstream = upstream(2, usize::MAX, StatusCode::UNAUTHORIZED);
    let hits = upstream.hits.clone();
    let url = serve(upstream).await;

    let err = source(url, 10, 10)
        .fetch(Some(june_window()))
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    assert!(!err.to_string().contains("test-key"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn page_guard_stops_runaway_pagination() {
    let upstream = upstream(100, 0, StatusCode::OK);
    let url = serve(upstream).await;

    let err = source(url, 5, 3)
        .fetch(Some(june_window()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SourceError::TooManyPages {
            max_pages: 3,
            fetched_rows: 15
        }
    ));
}

#[tokio::test]
async fn budget_sized_listing_without_total_ends_on_empty_page() {
    let upstream = Upstream {
        reports_total: false,
        ..upstream(6, 0, StatusCode::OK)
    };
    let hits = upstream.hits.clone();
    let url = serve(upstream).await;

    let snapshot = source(url, 2, 3)
        .fetch(Some(june_window()))
        .await
        .expect("three full pages then an empty one");
    assert_eq!(snapshot.len(), 6);
    assert_eq!(snapshot.pages, 3);
    assert_eq!(snapshot.upstream_total, None);
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn page_guard_without_total_still_stops_runaway_pagination() {
    let upstream = Upstream {
        reports_total: false,
        ..upstream(7, 0, StatusCode::OK)
    };
    let url = serve(upstream).await;

    let err = source(url, 2, 3)
        .fetch(Some(june_window()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SourceError::TooManyPages {
            max_pages: 3,
            fetched_rows: 6
        }
    ));
}
