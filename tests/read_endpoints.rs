mod common;

use std::sync::Arc;

use apitrace::util::new_trace_id;
use apitrace::{app, AppConfig, MemoryStore, TraceRecord, TraceStore};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration, TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{noon, test_state};

fn trace(identity: &str, status: u16, ms: u64, at: DateTime<Utc>) -> TraceRecord {
    TraceRecord {
        trace_id: new_trace_id(),
        api_identity: identity.to_string(),
        method: "GET".into(),
        endpoint: identity.split_once(':').map_or("/x", |(_, name)| name).to_string(),
        status,
        response_time_ms: ms,
        timestamp: at,
        console_logs: Vec::new(),
        api_key_verified: false,
    }
}

async fn seeded(page_size: usize) -> (Router, Arc<MemoryStore>) {
    let (state, store, _clock) = test_state(AppConfig {
        page_size,
        ..AppConfig::default()
    });
    let day = noon();
    for (i, status) in [200u16, 200, 404, 500, 200].into_iter().enumerate() {
        store
            .insert_trace(trace(
                "acme:/orders",
                status,
                10 * (i as u64 + 1),
                day - Duration::hours(i as i64),
            ))
            .await
            .unwrap();
    }
    store
        .insert_trace(trace("acme:/users", 200, 5, day - Duration::days(1)))
        .await
        .unwrap();
    store
        .insert_trace(trace("beta:/old", 503, 5, Utc.with_ymd_and_hms(2025, 5, 20, 8, 0, 0).unwrap()))
        .await
        .unwrap();
    (app(state), store)
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let res = router.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = res.status();
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    call(router, Method::GET, uri, None).await
}

#[tokio::test]
async fn logs_are_paged_newest_first() {
    let (router, _) = seeded(3).await;

    let (status, body) = get(&router, "/api/logs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pagination"], json!({"currentPage": 1, "totalPages": 3}));
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(data[0]["responseTimeMs"], 10);
    assert_eq!(data[0]["apiIdentity"], "acme:/orders");
    assert!(data[0]["traceId"].is_string());

    let (_, body) = get(&router, "/api/logs?page=3").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["apiIdentity"], "beta:/old");

    for odd in ["0", "-2", "abc"] {
        let (_, body) = get(&router, &format!("/api/logs?page={odd}")).await;
        assert_eq!(body["pagination"]["currentPage"], 1, "page={odd}");
    }
}

#[tokio::test]
async fn log_date_filters_cover_whole_days() {
    let (router, _) = seeded(20).await;

    let (_, body) = get(&router, "/api/logs?from=2025-06-02").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 5);

    let (_, body) = get(&router, "/api/logs?from=2025-06-01&to=2025-06-01").await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["apiIdentity"], "acme:/users");

    let (status, body) = get(&router, "/api/logs?from=soon").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid from date");
}

#[tokio::test]
async fn grouped_logs_need_a_month() {
    let (router, _) = seeded(20).await;

    let (status, body) = get(&router, "/api/logs/grouped?month=2025-06").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["activeApis"], json!(["acme:/orders", "acme:/users"]));
    assert_eq!(body["data"][0]["statuses"].as_array().unwrap().len(), 5);
    assert_eq!(body["pagination"], json!({"currentPage": 1, "totalPages": 1}));

    let (_, body) = get(&router, "/api/logs/grouped?month=2025-05").await;
    assert_eq!(body["activeApis"], json!(["beta:/old"]));

    for bad in ["/api/logs/grouped", "/api/logs/grouped?month=June"] {
        let (status, body) = get(&router, bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "month=YYYY-MM required");
    }
}

#[tokio::test]
async fn stats_cover_the_last_week() {
    let (router, _) = seeded(20).await;

    let (status, body) = get(&router, "/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    // the May trace is outside the seven-day window
    assert_eq!(body["totalRequests"], 6);
    assert_eq!(body["errorRate"], 33.3);
    assert_eq!(body["uptimePct"], 66.7);
    // 404 and 500 tie; the one seen first wins
    assert_eq!(body["mostCommonError"], 500);
    assert_eq!(body["uptimeHistory"].as_array().unwrap().len(), 7);
    assert_eq!(body["uptimeHistory"][6]["date"], "Jun 2");
}

#[tokio::test]
async fn stats_on_empty_history() {
    let (state, _, _) = test_state(AppConfig::default());
    let router = app(state);
    let (_, body) = get(&router, "/api/stats").await;
    assert_eq!(body["totalRequests"], 0);
    assert_eq!(body["mostCommonError"], "None");
    assert_eq!(body["lastDowntime"], "No downtime yet");
}

#[tokio::test]
async fn config_create_update_and_sync() {
    let (router, store) = seeded(20).await;

    let (status, body) = call(
        &router,
        Method::POST,
        "/api/config",
        Some(json!({"apiName": " ACME:/Orders "})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["apiIdentity"], "acme:/orders");
    assert_eq!(body["enabled"], true);
    let earliest = noon() - Duration::hours(4);
    assert_eq!(
        body["startDate"].as_str().unwrap().parse::<DateTime<Utc>>().unwrap(),
        earliest
    );

    let (status, body) = call(
        &router,
        Method::POST,
        "/api/config",
        Some(json!({"apiIdentity": "acme:/orders"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "API config already exists");

    let (status, body) = call(&router, Method::POST, "/api/config", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "API name is required");

    let (status, _) = call(
        &router,
        Method::POST,
        "/api/config",
        Some(json!({"apiIdentity": "ghost:/gone"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call(
        &router,
        Method::PUT,
        "/api/config/acme%3A%2Forders",
        Some(json!({
            "limitEnabled": true,
            "limitCount": "25",
            "limitRate": 5,
            "startTime": " 09:00 ",
            "apiIdentity": "hijack",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["apiIdentity"], "acme:/orders");
    assert_eq!(body["limitCount"], 25);
    assert_eq!(body["startTime"], "09:00");

    let (status, body) = call(
        &router,
        Method::PUT,
        "/api/config/nobody%3A%2Fhere",
        Some(json!({"enabled": false})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "API config not found");

    // listing drops the config whose identity has no traces
    let (status, body) = get(&router, "/api/config").await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["apiIdentity"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["acme:/orders"]);
    assert!(store.find_config("ghost:/gone").await.unwrap().is_none());
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let (state, _, _) = test_state(AppConfig {
        max_request_bytes: Some(64),
        ..AppConfig::default()
    });
    let router = app(state);
    let padding = "x".repeat(256);
    let (status, _) = call(
        &router,
        Method::POST,
        "/api/config",
        Some(json!({"apiIdentity": padding})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}
