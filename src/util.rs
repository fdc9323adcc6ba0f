//! Utility helpers for the tracer.
//!
//! Identity resolution, the internal-traffic filter, trace identifiers and
//! the clock abstraction live here.  Everything in this module is pure apart
//! from reading the wall clock.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::RegexSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Header carrying the optional client identifier.
pub const CLIENT_ID_HEADER: &str = "x-client-id";
/// Header overriding the API name (defaults to the request path).
pub const API_NAME_HEADER: &str = "x-api-name";
/// Shared-secret headers, checked in order.
pub const API_KEY_HEADERS: [&str; 2] = ["x-api-key", "apikey"];
/// Client id used when the caller does not send one.
pub const DEFAULT_CLIENT_ID: &str = "default";

/// Source of wall-clock time for the pipeline.  Injected so gates can be
/// evaluated at fixed instants.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|p| *p.into_inner())
    }
}

/// Fresh opaque identifier for one trace.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Milliseconds elapsed since `start`, saturating.
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Derive `"<clientId>:<normalizedName>"` for a request.  The client id is
/// trimmed and lower-cased (`default` when absent); the name comes from
/// `x-api-name` or the raw endpoint, and always starts with `/`.
pub fn resolve_identity(headers: &HeaderMap, endpoint: &str) -> String {
    let client_id = header_str(headers, CLIENT_ID_HEADER)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());
    // a whitespace-only name is still a name; it normalises to "/"
    let raw_name = header_str(headers, API_NAME_HEADER)
        .filter(|s| !s.is_empty())
        .unwrap_or(endpoint);
    format!("{}:{}", client_id, normalize_api_name(raw_name))
}

/// Trim, lower-case and ensure a leading path separator.
pub fn normalize_api_name(raw: &str) -> String {
    let name = raw.trim().to_lowercase();
    if name.starts_with('/') {
        name
    } else {
        format!("/{}", name)
    }
}

/// Returns the presented shared secret, if any.
pub fn presented_api_key(headers: &HeaderMap) -> Option<&str> {
    API_KEY_HEADERS
        .iter()
        .find_map(|name| header_str(headers, name).filter(|v| !v.is_empty()))
}

/// True only when a secret is configured and the request carries it.
pub fn api_key_verified(headers: &HeaderMap, expected: Option<&str>) -> bool {
    match (expected, presented_api_key(headers)) {
        (Some(expected), Some(given)) => !expected.is_empty() && expected == given,
        _ => false,
    }
}

/// Routes that belong to the monitor itself and are never traced.
static INTERNAL_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)^/api/(logs|config|stats|health)",
        r"(?i)^/favicon\.ico$",
        r"^/$",
    ])
    .expect("internal route patterns are valid")
});

/// Whether `endpoint` (path plus optional query) targets the monitor's own
/// surface.
pub fn is_internal_path(endpoint: &str) -> bool {
    INTERNAL_PATTERNS.is_match(endpoint)
}
