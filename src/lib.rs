//! Core library for apitrace.  This module wires together the tracing
//! middleware, the store and the dashboard endpoints.
//!
//! Every request passing through [`app`] is timed and has its diagnostic
//! output captured; once the response is produced, a background pipeline
//! decides (per-API policy) whether to persist a [`TraceRecord`].

pub mod api;
pub mod capture;
mod config;
pub mod console;
pub mod gates;
pub mod model;
pub mod store;
pub mod tracer;
pub mod util;

pub use config::AppConfig;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{middleware, Json, Router};
use once_cell::sync::Lazy;
use regex::Regex;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub use crate::capture::{CaptureLayer, ConsoleCapture};
pub use crate::model::{ApiConfig, ConsoleLevel, ConsoleLine, TraceRecord};
pub use crate::store::{MemoryStore, SqliteStore, StoreError, TraceStore};
pub use crate::tracer::{trace_requests, CompletedRequest, Outcome, Tracer};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub tracer: Tracer,
    pub store: Arc<dyn TraceStore>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn TraceStore>) -> Self {
        let tracer = Tracer::new(store.clone(), config.api_key.clone());
        Self::with_tracer(config, tracer)
    }

    /// Build state around a preconfigured tracer (custom clock or gates).
    pub fn with_tracer(config: AppConfig, tracer: Tracer) -> Self {
        Self {
            store: tracer.store().clone(),
            tracer,
            config: Arc::new(config),
        }
    }
}

/// Endpoints of the monitor's own read API, purged from history at startup.
static INTERNAL_TRACE_ENDPOINTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^/api/(logs|stats|config)").expect("cleanup pattern is valid")
});

/// Remove traces recorded for the monitor's own endpoints.
pub async fn cleanup_internal_traces(store: &dyn TraceStore) -> Result<u64, StoreError> {
    let removed = store.delete_traces_matching(&INTERNAL_TRACE_ENDPOINTS).await?;
    if removed > 0 {
        tracing::info!(removed, "cleaned internal trace entries");
    }
    Ok(removed)
}

/// Build state from environment variables (see [`AppConfig::from_env`])
/// backed by a fresh in-memory store.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    if config.api_key.is_none() {
        tracing::warn!("TRACER_API_KEY not set; console capture will never be attached");
    }
    let store: Arc<dyn TraceStore> = match &config.db_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "using sqlite trace store");
            Arc::new(SqliteStore::open(path)?)
        }
        None => {
            tracing::warn!("TRACER_DB_PATH not set; traces are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    if config.cleanup_on_start {
        if let Err(err) = cleanup_internal_traces(store.as_ref()).await {
            tracing::error!(error = %err, "startup cleanup failed");
        }
    }
    let state = AppState::new(config, store);
    tracing::info!(gates = ?state.tracer.gates().names(), "tracer ready");
    Ok(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-api-name"),
            HeaderName::from_static("x-client-id"),
        ])
}

/// Build the Axum router.  The tracing middleware wraps every route and
/// the fallback; CORS sits outside it so preflights are not traced.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;

    let router = Router::new()
        .route("/", get(root_handler))
        .route("/simulate/:code", get(simulate_handler))
        .route("/api/health", get(health_handler))
        .route("/api/logs", get(api::logs::list_logs))
        .route("/api/logs/grouped", get(api::logs::grouped_logs))
        .route("/api/stats", get(api::stats::get_stats))
        .route(
            "/api/config",
            get(api::configs::list_configs).post(api::configs::create_config),
        )
        .route("/api/config/:api_identity", put(api::configs::update_config))
        .layer(middleware::from_fn_with_state(
            state.tracer.clone(),
            trace_requests,
        ));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router
        .layer(cors_layer(&state.config.allowed_origins))
        .with_state(state)
}

async fn root_handler() -> &'static str {
    "API backend running"
}

/// Health endpoint for readiness / liveness checks.
async fn health_handler(State(state): State<AppState>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "pendingTraces": state.tracer.pending(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Demo endpoint answering with the requested status.  Unparseable codes
/// fall back to 200.
async fn simulate_handler(
    Path(code): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> axum::response::Response {
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::OK);
    let target = headers
        .get(util::API_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uri.to_string());
    console::log(&format!(
        "[simulate] returning {} for {}",
        status.as_u16(),
        target
    ));
    if status.is_server_error() {
        console::error("[simulate] Simulated server error");
    }
    (
        status,
        format!("Simulated response with status {}", status.as_u16()),
    )
        .into_response()
}
