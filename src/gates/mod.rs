//! Admission gates deciding whether a finished request is recorded.
//!
//! Each gate encapsulates one policy check.  The `GateChain` runs them in
//! order and stops at the first gate that suppresses the trace.  The
//! standard chain goes from cheapest to most expensive: boolean flag, then
//! time-of-day arithmetic, then a history query.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::model::ApiConfig;
use crate::store::{StoreError, TraceStore};

pub mod enabled;
pub mod rate_limit;
pub mod schedule;

use self::enabled::EnabledGate;
use self::rate_limit::RateLimitGate;
use self::schedule::ScheduleGate;

/// Everything a gate may look at for one request.
pub struct GateContext<'a> {
    pub identity: &'a str,
    pub config: &'a ApiConfig,
    pub now: DateTime<Utc>,
    pub store: &'a dyn TraceStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    Suppress(String),
}

/// Outcome of running the whole chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Suppressed { gate: &'static str, reason: String },
}

/// Trait implemented by all gates.  A store error aborts the chain; it is
/// not a suppression.
#[async_trait::async_trait]
pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self, ctx: &GateContext<'_>) -> Result<GateDecision, StoreError>;
}

#[derive(Clone)]
pub struct GateChain {
    gates: Vec<Arc<dyn Gate>>,
}

impl Default for GateChain {
    fn default() -> Self {
        Self::standard()
    }
}

impl GateChain {
    pub fn new(gates: Vec<Arc<dyn Gate>>) -> Self {
        Self { gates }
    }

    /// enabled → schedule → rate limit.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(EnabledGate),
            Arc::new(ScheduleGate),
            Arc::new(RateLimitGate),
        ])
    }

    pub async fn evaluate(&self, ctx: &GateContext<'_>) -> Result<Verdict, StoreError> {
        for gate in &self.gates {
            let name = gate.name();
            tracing::trace!(gate = %name, api = %ctx.identity, "evaluating gate");
            if let GateDecision::Suppress(reason) = gate.check(ctx).await? {
                tracing::debug!(gate = %name, api = %ctx.identity, reason = %reason, "trace suppressed");
                return Ok(Verdict::Suppressed { gate: name, reason });
            }
        }
        Ok(Verdict::Admit)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        decision: GateDecision,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Gate for Counting {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn check(&self, _ctx: &GateContext<'_>) -> Result<GateDecision, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decision.clone())
        }
    }

    #[test]
    fn standard_order_is_fixed() {
        assert_eq!(
            GateChain::standard().names(),
            vec!["enabled", "schedule", "rate_limit"]
        );
    }

    #[tokio::test]
    async fn stops_at_first_suppression() {
        let calls = Arc::new(AtomicUsize::new(0));
        let later = Arc::new(AtomicUsize::new(0));
        let chain = GateChain::new(vec![
            Arc::new(Counting {
                name: "first",
                decision: GateDecision::Pass,
                calls: calls.clone(),
            }),
            Arc::new(Counting {
                name: "second",
                decision: GateDecision::Suppress("nope".into()),
                calls: calls.clone(),
            }),
            Arc::new(Counting {
                name: "third",
                decision: GateDecision::Pass,
                calls: later.clone(),
            }),
        ]);
        let store = MemoryStore::new();
        let cfg = ApiConfig::with_defaults("a", Utc::now());
        let ctx = GateContext {
            identity: "a",
            config: &cfg,
            now: Utc::now(),
            store: &store,
        };
        let verdict = chain.evaluate(&ctx).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Suppressed {
                gate: "second",
                reason: "nope".into()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }
}
