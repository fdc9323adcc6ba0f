use super::{Gate, GateContext, GateDecision};
use crate::store::StoreError;

/// Master kill-switch: a disabled API is never recorded.
pub struct EnabledGate;

#[async_trait::async_trait]
impl Gate for EnabledGate {
    fn name(&self) -> &'static str {
        "enabled"
    }

    async fn check(&self, ctx: &GateContext<'_>) -> Result<GateDecision, StoreError> {
        if ctx.config.enabled {
            Ok(GateDecision::Pass)
        } else {
            Ok(GateDecision::Suppress("api disabled".into()))
        }
    }
}
