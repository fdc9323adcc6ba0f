use chrono::{DateTime, NaiveTime, Timelike, Utc};

use super::{Gate, GateContext, GateDecision};
use crate::model::ApiConfig;
use crate::store::StoreError;

/// Active-window restriction.  Only enforced when scheduling is on and both
/// bounds are set; the window is `[start, end]` in UTC, inclusive, compared
/// at second precision.
pub struct ScheduleGate;

/// Parse an `HH:MM` bound.
pub fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

/// `None` when the gate does not apply, otherwise whether `now` is inside
/// the window.
pub fn within_window(cfg: &ApiConfig, now: DateTime<Utc>) -> Option<bool> {
    if !cfg.scheduling || cfg.start_time.trim().is_empty() || cfg.end_time.trim().is_empty() {
        return None;
    }
    let (start, end) = match (parse_hhmm(&cfg.start_time), parse_hhmm(&cfg.end_time)) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            tracing::debug!(api = %cfg.api_identity, start = %cfg.start_time, end = %cfg.end_time, "unparseable schedule bounds, gate inert");
            return None;
        }
    };
    if start > end {
        // windows crossing midnight never match
        tracing::debug!(api = %cfg.api_identity, start = %cfg.start_time, end = %cfg.end_time, "schedule window crosses midnight");
    }
    let time_of_day = now.time().with_nanosecond(0).unwrap_or_else(|| now.time());
    Some(time_of_day >= start && time_of_day <= end)
}

#[async_trait::async_trait]
impl Gate for ScheduleGate {
    fn name(&self) -> &'static str {
        "schedule"
    }

    async fn check(&self, ctx: &GateContext<'_>) -> Result<GateDecision, StoreError> {
        match within_window(ctx.config, ctx.now) {
            Some(false) => Ok(GateDecision::Suppress(format!(
                "outside active window {}-{}",
                ctx.config.start_time, ctx.config.end_time
            ))),
            _ => Ok(GateDecision::Pass),
        }
    }
}
