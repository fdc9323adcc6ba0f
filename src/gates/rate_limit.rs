use chrono::Duration;

use super::{Gate, GateContext, GateDecision};
use crate::store::StoreError;

/// Sliding-window limit: at most `limit_count` traces per identity within
/// the trailing `limit_rate` minutes.  The count is re-queried from the
/// store on every request, so it holds across restarts and instances.
pub struct RateLimitGate;

#[async_trait::async_trait]
impl Gate for RateLimitGate {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn check(&self, ctx: &GateContext<'_>) -> Result<GateDecision, StoreError> {
        let cfg = ctx.config;
        if !(cfg.limit_enabled && cfg.limit_count > 0 && cfg.limit_rate > 0) {
            return Ok(GateDecision::Pass);
        }
        let since = ctx.now - Duration::minutes(i64::from(cfg.limit_rate));
        let recent = ctx.store.count_traces(ctx.identity, since).await?;
        if recent >= u64::from(cfg.limit_count) {
            tracing::warn!(
                api = %ctx.identity,
                recent,
                limit = cfg.limit_count,
                window_min = cfg.limit_rate,
                "rate limit hit"
            );
            return Ok(GateDecision::Suppress(format!(
                "{} traces in the last {} min (limit {})",
                recent, cfg.limit_rate, cfg.limit_count
            )));
        }
        Ok(GateDecision::Pass)
    }
}
