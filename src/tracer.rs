//! The tracing middleware and its post-response pipeline.
//!
//! [`trace_requests`] wraps every request in a [`ConsoleCapture`] scope.
//! When the downstream handler has produced its response the capture is
//! closed and the rest of the work (internal filter, identity, config
//! resolve, gates, record) is spawned onto its own task so the client never
//! waits for telemetry.  If the request future is dropped before it
//! completes, the in-flight guard still spawns the pipeline with an unknown
//! status.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tokio::sync::Notify;

use crate::capture::ConsoleCapture;
use crate::gates::{GateChain, GateContext, Verdict};
use crate::model::{ApiConfig, ConsoleLine, TraceRecord};
use crate::store::{StoreError, TraceStore};
use crate::util::{
    api_key_verified, elapsed_ms, is_internal_path, new_trace_id, resolve_identity, Clock,
    SystemClock,
};

/// Response header echoing the trace id for client-side correlation.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Status recorded when the request finished without one.
pub const DEFAULT_STATUS: u16 = 200;

/// A request that has finished (or been abandoned) and awaits recording.
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    pub trace_id: String,
    pub method: String,
    pub endpoint: String,
    pub headers: HeaderMap,
    pub status: Option<u16>,
    pub response_time_ms: u64,
    pub console_logs: Vec<ConsoleLine>,
}

/// What the pipeline did with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Internal,
    Suppressed { gate: &'static str, reason: String },
    Recorded { trace_id: String },
    Failed,
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

struct PendingGuard(Arc<Pending>);

impl PendingGuard {
    fn enter(pending: &Arc<Pending>) -> Self {
        pending.count.fetch_add(1, Ordering::SeqCst);
        Self(pending.clone())
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Shared tracer handle.  Cloning is cheap.
#[derive(Clone)]
pub struct Tracer {
    store: Arc<dyn TraceStore>,
    clock: Arc<dyn Clock>,
    gates: GateChain,
    api_key: Option<Arc<str>>,
    pending: Arc<Pending>,
}

impl Tracer {
    pub fn new(store: Arc<dyn TraceStore>, api_key: Option<String>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            gates: GateChain::standard(),
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from),
            pending: Arc::new(Pending::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn gates(&self) -> &GateChain {
        &self.gates
    }

    /// Run the pipeline for one finished request.  Never fails: store
    /// errors are logged and reported as [`Outcome::Failed`].
    pub async fn process(&self, done: CompletedRequest) -> Outcome {
        if is_internal_path(&done.endpoint) {
            return Outcome::Internal;
        }
        match self.admit_and_record(done).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "tracer pipeline failed; trace dropped");
                Outcome::Failed
            }
        }
    }

    async fn admit_and_record(&self, done: CompletedRequest) -> Result<Outcome, StoreError> {
        let verified = api_key_verified(&done.headers, self.api_key.as_deref());
        let identity = resolve_identity(&done.headers, &done.endpoint);
        let now = self.clock.now();
        let config = self.store.upsert_config_if_absent(&identity, now).await?;

        let ctx = GateContext {
            identity: &identity,
            config: &config,
            now,
            store: self.store.as_ref(),
        };
        if let Verdict::Suppressed { gate, reason } = self.gates.evaluate(&ctx).await? {
            return Ok(Outcome::Suppressed { gate, reason });
        }

        let record = self.build_record(done, identity, verified, &config);
        let trace_id = record.trace_id.clone();
        let (api, status) = (record.api_identity.clone(), record.status);
        self.store.insert_trace(record).await?;
        tracing::debug!(api = %api, status, trace_id = %trace_id, "trace saved");
        Ok(Outcome::Recorded { trace_id })
    }

    /// Assemble the record.  Captured lines are attached only for a
    /// verified caller on an API whose tracer is enabled.
    pub fn build_record(
        &self,
        done: CompletedRequest,
        api_identity: String,
        api_key_verified: bool,
        config: &ApiConfig,
    ) -> TraceRecord {
        let console_logs = if api_key_verified && config.tracer_enabled {
            done.console_logs
        } else {
            Vec::new()
        };
        TraceRecord {
            trace_id: done.trace_id,
            api_identity,
            method: done.method,
            endpoint: done.endpoint,
            status: done.status.unwrap_or(DEFAULT_STATUS),
            response_time_ms: done.response_time_ms,
            timestamp: self.clock.now(),
            console_logs,
            api_key_verified,
        }
    }

    /// Run [`Tracer::process`] on a background task.
    pub fn spawn(&self, done: CompletedRequest) {
        let guard = PendingGuard::enter(&self.pending);
        let tracer = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tracer.process(done).await;
        });
    }

    /// Number of spawned pipelines still running.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Wait until every spawned pipeline has finished.
    pub async fn drain(&self) {
        loop {
            let idle = self.pending.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Request facts captured before the handler consumes the request.
struct InFlight {
    tracer: Tracer,
    started: Instant,
    capture: ConsoleCapture,
    parts: Option<CompletedRequest>,
}

impl InFlight {
    fn begin(tracer: Tracer, request: &Request) -> Self {
        let uri = request.uri();
        let endpoint = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string());
        Self {
            tracer,
            started: Instant::now(),
            capture: ConsoleCapture::new(),
            parts: Some(CompletedRequest {
                trace_id: new_trace_id(),
                method: request.method().to_string(),
                endpoint,
                headers: request.headers().clone(),
                status: None,
                response_time_ms: 0,
                console_logs: Vec::new(),
            }),
        }
    }

    fn finish(&mut self, status: Option<u16>) {
        if let Some(mut done) = self.parts.take() {
            done.status = status;
            done.response_time_ms = elapsed_ms(self.started);
            done.console_logs = self.capture.take();
            self.tracer.spawn(done);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.parts.is_some() && tokio::runtime::Handle::try_current().is_ok() {
            tracing::debug!("request dropped before completion; recording without status");
            self.finish(None);
        }
    }
}

/// Axum middleware recording every non-internal request.
pub async fn trace_requests(State(tracer): State<Tracer>, request: Request, next: Next) -> Response {
    let mut inflight = InFlight::begin(tracer, &request);
    let trace_id = inflight
        .parts
        .as_ref()
        .map(|p| p.trace_id.clone())
        .unwrap_or_default();
    let internal = inflight
        .parts
        .as_ref()
        .map_or(false, |p| is_internal_path(&p.endpoint));

    let capture = inflight.capture.clone();
    let mut response = capture.scope(next.run(request)).await;
    inflight.finish(Some(response.status().as_u16()));

    if !internal {
        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert(TRACE_ID_HEADER, value);
        }
    }
    response
}
