//! Per-request diagnostic capture.
//!
//! The process-wide `tracing` subscriber plays the role of the console.  A
//! request opts into capture by running its handler inside
//! [`ConsoleCapture::scope`], which binds a buffer to the current task.  The
//! [`CaptureLayer`] installed on the subscriber copies every event emitted
//! while that binding is live into the buffer; the regular fmt layer still
//! prints the event.  Nothing global is patched, so overlapping requests on
//! a multi-threaded runtime never see each other's lines, and the binding
//! disappears as soon as the scope future completes or is dropped.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::model::{ConsoleLevel, ConsoleLine};

/// Upper bound on buffered lines per request.
pub const MAX_CAPTURED_LINES: usize = 1000;

/// Field carrying an explicit console level (set by [`crate::console`]).
pub(crate) const LEVEL_FIELD: &str = "console_level";
/// Field marking an event that must be printed but not captured.
pub(crate) const SKIP_FIELD: &str = "console_skip";

tokio::task_local! {
    static ACTIVE: ConsoleCapture;
}

/// Buffer of diagnostic lines for one request.  Cheap to clone; clones
/// share the same buffer.
#[derive(Clone, Default)]
pub struct ConsoleCapture {
    lines: Arc<Mutex<Vec<ConsoleLine>>>,
}

impl ConsoleCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` with this buffer bound as the active capture.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        ACTIVE.scope(self.clone(), fut).await
    }

    pub fn push(&self, level: ConsoleLevel, message: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() < MAX_CAPTURED_LINES {
                lines.push(ConsoleLine {
                    level,
                    message,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Snapshot of the buffered lines in emission order.
    pub fn lines(&self) -> Vec<ConsoleLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Drain the buffer.
    pub fn take(&self) -> Vec<ConsoleLine> {
        self.lines
            .lock()
            .map(|mut l| std::mem::take(&mut *l))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ConsoleCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleCapture")
            .field("lines", &self.len())
            .finish()
    }
}

pub fn is_capturing() -> bool {
    ACTIVE.try_with(|_| ()).is_ok()
}

fn level_for(level: &Level) -> ConsoleLevel {
    match *level {
        Level::ERROR => ConsoleLevel::Error,
        Level::WARN => ConsoleLevel::Warn,
        Level::INFO => ConsoleLevel::Info,
        _ => ConsoleLevel::Log,
    }
}

/// Subscriber layer routing events into the active request's buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureLayer;

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let _ = ACTIVE.try_with(|capture| {
            let mut visitor = LineVisitor::default();
            event.record(&mut visitor);
            if visitor.skip {
                return;
            }
            let level = visitor
                .level
                .unwrap_or_else(|| level_for(event.metadata().level()));
            capture.push(level, visitor.into_line());
        });
    }
}

/// Flattens an event into a single line: the message first, then the
/// remaining fields as `name=value`.
#[derive(Default)]
struct LineVisitor {
    message: Option<String>,
    fields: Vec<String>,
    level: Option<ConsoleLevel>,
    skip: bool,
}

impl LineVisitor {
    fn into_line(self) -> String {
        let mut parts = Vec::with_capacity(self.fields.len() + 1);
        if let Some(m) = self.message {
            parts.push(m);
        }
        parts.extend(self.fields);
        parts.join(" ")
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            LEVEL_FIELD => self.level = ConsoleLevel::parse(value),
            "message" => self.message = Some(value.to_string()),
            name => self.fields.push(format!("{}={}", name, value)),
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == SKIP_FIELD {
            self.skip = value;
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{:?}", value)),
            name => self.fields.push(format!("{}={:?}", name, value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    #[tokio::test]
    async fn captures_levels_in_order_and_stops_after_scope() {
        let _guard = tracing_subscriber::registry().with(CaptureLayer).set_default();
        let capture = ConsoleCapture::new();
        capture
            .scope(async {
                tracing::debug!("first");
                tracing::info!(order_id = 7, "second");
                tracing::warn!("third");
                tracing::error!("fourth");
            })
            .await;
        tracing::info!("after the scope");

        let lines = capture.lines();
        let levels: Vec<_> = lines.iter().map(|l| l.level).collect();
        assert_eq!(
            levels,
            vec![
                ConsoleLevel::Log,
                ConsoleLevel::Info,
                ConsoleLevel::Warn,
                ConsoleLevel::Error
            ]
        );
        assert_eq!(lines[0].message, "first");
        assert_eq!(lines[1].message, "second order_id=7");
        assert!(lines.iter().all(|l| l.message != "after the scope"));
        assert!(lines.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn overlapping_scopes_keep_their_own_lines() {
        let _guard = tracing_subscriber::registry().with(CaptureLayer).set_default();
        let a = ConsoleCapture::new();
        let b = ConsoleCapture::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let first = a.scope(async {
            tracing::info!("a1");
            let _ = rx.await;
            tracing::info!("a2");
        });
        let second = b.scope(async {
            tracing::info!("b1");
            let _ = tx.send(());
        });
        tokio::join!(first, second);

        let a_msgs: Vec<_> = a.lines().into_iter().map(|l| l.message).collect();
        let b_msgs: Vec<_> = b.lines().into_iter().map(|l| l.message).collect();
        assert_eq!(a_msgs, vec!["a1", "a2"]);
        assert_eq!(b_msgs, vec!["b1"]);
    }

    #[tokio::test]
    async fn skipped_events_are_not_buffered() {
        let _guard = tracing_subscriber::registry().with(CaptureLayer).set_default();
        let capture = ConsoleCapture::new();
        capture
            .scope(async {
                tracing::debug!(console_skip = true, "not for the buffer");
                assert!(is_capturing());
            })
            .await;
        assert!(capture.is_empty());
        assert!(!is_capturing());
    }

    #[test]
    fn buffer_is_bounded() {
        let capture = ConsoleCapture::new();
        for i in 0..(MAX_CAPTURED_LINES + 10) {
            capture.push(ConsoleLevel::Log, i.to_string());
        }
        assert_eq!(capture.len(), MAX_CAPTURED_LINES);
        assert_eq!(capture.take().len(), MAX_CAPTURED_LINES);
        assert!(capture.is_empty());
    }
}
