//! Read and config-management endpoints backing the dashboard.  All of
//! these live under `/api/*` and are therefore never traced themselves.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::store::StoreError;

pub mod configs;
pub mod logs;
pub mod stats;

#[derive(Debug, Serialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip)]
    pub http_status: u16,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            http_status: status.as_u16(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<StoreError> for ErrorResponse {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "store failure while serving api request");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Server Error")
    }
}

pub fn respond_with_error(err: ErrorResponse) -> axum::response::Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        respond_with_error(self)
    }
}

/// Pagination block shared by the list endpoints.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: usize,
    pub total_pages: usize,
}

/// Parse a `YYYY-MM-DD` date or an RFC 3339 instant.
pub(crate) fn parse_day(raw: &str) -> Option<DayOrInstant> {
    let raw = raw.trim();
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(DayOrInstant::Day(day));
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| DayOrInstant::Instant(dt.with_timezone(&Utc)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DayOrInstant {
    Day(NaiveDate),
    Instant(DateTime<Utc>),
}

impl DayOrInstant {
    /// Midnight UTC of the day, or the instant itself.
    pub(crate) fn start(self) -> DateTime<Utc> {
        match self {
            DayOrInstant::Day(d) => d.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc(),
            DayOrInstant::Instant(t) => t,
        }
    }

    /// Last millisecond of the day (UTC), or the instant itself.
    pub(crate) fn end(self) -> DateTime<Utc> {
        match self {
            DayOrInstant::Day(d) => d
                .and_hms_milli_opt(23, 59, 59, 999)
                .unwrap_or_default()
                .and_utc(),
            DayOrInstant::Instant(t) => t,
        }
    }
}
