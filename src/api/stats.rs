use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::ErrorResponse;
use crate::model::TraceRecord;
use crate::AppState;

/// Days covered by the dashboard summary.
pub const STATS_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayUptime {
    pub date: String,
    pub uptime: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusOrNone {
    Status(u16),
    Label(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InstantOrNone {
    Instant(DateTime<Utc>),
    Label(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total_requests: usize,
    pub avg_response: f64,
    pub uptime_pct: f64,
    pub error_rate: f64,
    pub most_common_error: StatusOrNone,
    pub last_downtime: InstantOrNone,
    pub uptime_history: Vec<DayUptime>,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Summarise `traces` (already restricted to the window) as of `now`.
pub fn summarize(traces: &[TraceRecord], now: DateTime<Utc>) -> StatsSummary {
    if traces.is_empty() {
        return StatsSummary {
            total_requests: 0,
            avg_response: 0.0,
            uptime_pct: 100.0,
            error_rate: 0.0,
            most_common_error: StatusOrNone::Label("None"),
            last_downtime: InstantOrNone::Label("No downtime yet"),
            uptime_history: Vec::new(),
        };
    }

    let total = traces.len();
    let total_f = total as f64;
    let avg = traces.iter().map(|t| t.response_time_ms as f64).sum::<f64>() / total_f;
    let successes = traces.iter().filter(|t| is_success(t.status)).count();
    let errors: Vec<&TraceRecord> = traces.iter().filter(|t| t.status >= 400).collect();

    // most frequent error status; ties go to the one seen first
    let mut counts: Vec<(u16, usize)> = Vec::new();
    for e in &errors {
        match counts.iter_mut().find(|(s, _)| *s == e.status) {
            Some((_, n)) => *n += 1,
            None => counts.push((e.status, 1)),
        }
    }
    let most_common_error = counts
        .iter()
        .fold(None::<(u16, usize)>, |best, &(s, n)| match best {
            Some((_, bn)) if bn >= n => best,
            _ => Some((s, n)),
        })
        .map(|(s, _)| StatusOrNone::Status(s))
        .unwrap_or(StatusOrNone::Label("None"));

    let last_downtime = errors
        .iter()
        .map(|e| e.timestamp)
        .max()
        .map(InstantOrNone::Instant)
        .unwrap_or(InstantOrNone::Label("No downtime yet"));

    let uptime_history = (0..STATS_WINDOW_DAYS)
        .rev()
        .map(|days_back| {
            let day = (now - Duration::days(days_back)).date_naive();
            let (seen, ok) = traces
                .iter()
                .filter(|t| t.timestamp.date_naive() == day)
                .fold((0usize, 0usize), |(seen, ok), t| {
                    (seen + 1, ok + usize::from(is_success(t.status)))
                });
            let uptime = if seen > 0 {
                ok as f64 / seen as f64 * 100.0
            } else {
                100.0
            };
            DayUptime {
                date: day.format("%b %-d").to_string(),
                uptime: round1(uptime),
            }
        })
        .collect();

    StatsSummary {
        total_requests: total,
        avg_response: round1(avg),
        uptime_pct: round1(successes as f64 / total_f * 100.0),
        error_rate: round1(errors.len() as f64 / total_f * 100.0),
        most_common_error,
        last_downtime,
        uptime_history,
    }
}

/// `GET /api/stats`: summary over the last seven days.
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsSummary>, ErrorResponse> {
    let now = state.tracer.clock().now();
    let traces = state
        .store
        .traces_since(now - Duration::days(STATS_WINDOW_DAYS))
        .await?;
    Ok(Json(summarize(&traces, now)))
}
