use std::collections::HashMap;
use std::sync::Arc;

use apitrace::util::ManualClock;
use apitrace::{app, AppConfig, AppState, CaptureLayer, MemoryStore, Tracer};
use chrono::{DateTime, TimeZone, Utc};
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Tracks environment variable mutations and restores originals on drop.
#[allow(dead_code)]
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    #[allow(dead_code)]
    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    #[allow(dead_code)]
    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

#[allow(dead_code)]
pub const TEST_KEY: &str = "test-secret";

/// A running server plus handles on the pieces tests want to poke at.
#[allow(dead_code)]
pub struct TestApp {
    pub base: String,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
}

#[allow(dead_code)]
impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Wait for every spawned trace pipeline to land.
    pub async fn settle(&self) {
        self.state.tracer.drain().await;
    }
}

/// Fixed instant the manual clock starts at: a Monday, 12:00 UTC.
#[allow(dead_code)]
pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
}

/// Install a thread-local subscriber with capture enabled.  Only effective
/// on a current-thread runtime, where handlers run on the test's thread.
#[allow(dead_code)]
pub fn capture_subscriber() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::registry()
        .with(CaptureLayer)
        .set_default()
}

#[allow(dead_code)]
pub fn test_state(config: AppConfig) -> (AppState, Arc<MemoryStore>, ManualClock) {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(noon());
    let tracer =
        Tracer::new(store.clone(), config.api_key.clone()).with_clock(Arc::new(clock.clone()));
    (AppState::with_tracer(config, tracer), store, clock)
}

#[allow(dead_code)]
pub fn keyed_config() -> AppConfig {
    AppConfig {
        api_key: Some(TEST_KEY.to_string()),
        ..AppConfig::default()
    }
}

/// Bind to an ephemeral port and serve the app in the background.
#[allow(dead_code)]
pub async fn spawn_app(config: AppConfig) -> TestApp {
    let (state, store, clock) = test_state(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    TestApp {
        base: format!("http://{}", addr),
        state,
        store,
        clock,
    }
}
