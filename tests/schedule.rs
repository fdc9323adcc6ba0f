mod common;

use apitrace::{AppConfig, TraceStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::Client;
use serde_json::json;

use common::{spawn_app, TestApp};

const IDENTITY_PATH: &str = "/api/config/default%3A%2Freports";

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, h, m, s).unwrap()
}

async fn hit_at(app: &TestApp, client: &Client, when: DateTime<Utc>) {
    app.clock.set(when);
    client
        .get(app.url("/simulate/200"))
        .header("x-api-name", "reports")
        .send()
        .await
        .unwrap();
    app.settle().await;
}

async fn recorded(app: &TestApp) -> u64 {
    app.store
        .count_traces("default:/reports", at(0, 0, 0) - Duration::days(1))
        .await
        .unwrap()
}

async fn schedule(app: &TestApp, client: &Client, start: &str, end: &str) {
    let res = client
        .put(app.url(IDENTITY_PATH))
        .json(&json!({ "scheduling": true, "startTime": start, "endTime": end }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
}

#[tokio::test(flavor = "current_thread")]
async fn window_bounds_are_inclusive() {
    let app = spawn_app(AppConfig::default()).await;
    let client = Client::new();
    hit_at(&app, &client, at(12, 0, 0)).await;
    schedule(&app, &client, "09:00", "17:00").await;

    hit_at(&app, &client, at(8, 59, 0)).await;
    assert_eq!(recorded(&app).await, 1);
    hit_at(&app, &client, at(9, 0, 0)).await;
    assert_eq!(recorded(&app).await, 2);
    hit_at(&app, &client, at(17, 0, 0)).await;
    assert_eq!(recorded(&app).await, 3);
    hit_at(&app, &client, at(17, 0, 1)).await;
    assert_eq!(recorded(&app).await, 3);
}

#[tokio::test(flavor = "current_thread")]
async fn missing_bound_or_switch_off_leaves_gate_inert() {
    let app = spawn_app(AppConfig::default()).await;
    let client = Client::new();
    hit_at(&app, &client, at(12, 0, 0)).await;
    schedule(&app, &client, "09:00", "").await;
    hit_at(&app, &client, at(3, 0, 0)).await;
    assert_eq!(recorded(&app).await, 2);

    client
        .put(app.url(IDENTITY_PATH))
        .json(&json!({ "scheduling": false, "endTime": "10:00" }))
        .send()
        .await
        .unwrap();
    hit_at(&app, &client, at(23, 0, 0)).await;
    assert_eq!(recorded(&app).await, 3);
}

#[tokio::test(flavor = "current_thread")]
async fn window_across_midnight_never_matches() {
    let app = spawn_app(AppConfig::default()).await;
    let client = Client::new();
    hit_at(&app, &client, at(12, 0, 0)).await;
    schedule(&app, &client, "22:00", "06:00").await;

    hit_at(&app, &client, at(23, 0, 0)).await;
    hit_at(&app, &client, at(2, 0, 0)).await;
    assert_eq!(recorded(&app).await, 1);
}
