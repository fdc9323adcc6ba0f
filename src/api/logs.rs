use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;

use super::{parse_day, ErrorResponse, Pagination};
use crate::model::{IdentityActivity, TraceRecord};
use crate::store::{Page, TraceFilter};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub page: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct LogPage {
    pub data: Vec<TraceRecord>,
    pub pagination: Pagination,
}

/// `GET /api/logs`: traces newest first, one page at a time.
pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>, ErrorResponse> {
    let page = query
        .page
        .as_deref()
        .and_then(|p| p.trim().parse::<usize>().ok())
        .filter(|p| *p >= 1)
        .unwrap_or(1);
    let per_page = state.config.page_size.max(1);

    let mut filter = TraceFilter::default();
    if let Some(raw) = query.from.as_deref().filter(|s| !s.trim().is_empty()) {
        let day = parse_day(raw).ok_or_else(|| ErrorResponse::bad_request("invalid from date"))?;
        filter.from = Some(day.start());
    }
    if let Some(raw) = query.to.as_deref().filter(|s| !s.trim().is_empty()) {
        let day = parse_day(raw).ok_or_else(|| ErrorResponse::bad_request("invalid to date"))?;
        filter.to = Some(day.end());
    }

    let (data, total) = state
        .store
        .find_traces(
            &filter,
            Page {
                offset: (page - 1).saturating_mul(per_page),
                limit: per_page,
            },
        )
        .await?;
    Ok(Json(LogPage {
        data,
        pagination: Pagination {
            current_page: page,
            total_pages: (total as usize).div_ceil(per_page),
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct GroupedQuery {
    pub month: Option<String>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedLogs {
    pub data: Vec<IdentityActivity>,
    pub active_apis: Vec<String>,
    pub pagination: Pagination,
}

/// First and last instant (second precision) of a `YYYY-MM` month in UTC.
pub fn month_range(raw: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (year, month) = raw.trim().split_once('-')?;
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last = next - Duration::days(1);
    Some((
        first.and_hms_opt(0, 0, 0)?.and_utc(),
        last.and_hms_opt(23, 59, 59)?.and_utc(),
    ))
}

/// `GET /api/logs/grouped?month=YYYY-MM`: per-API statuses for the month.
pub async fn grouped_logs(
    State(state): State<AppState>,
    Query(query): Query<GroupedQuery>,
) -> Result<Json<GroupedLogs>, ErrorResponse> {
    let raw = query
        .month
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ErrorResponse::bad_request("month=YYYY-MM required"))?;
    let (from, to) =
        month_range(raw).ok_or_else(|| ErrorResponse::bad_request("month=YYYY-MM required"))?;

    let data = state.store.aggregate_by_identity_in_range(from, to).await?;
    let active_apis = data.iter().map(|g| g.api_identity.clone()).collect();
    Ok(Json(GroupedLogs {
        data,
        active_apis,
        pagination: Pagination {
            current_page: 1,
            total_pages: 1,
        },
    }))
}
