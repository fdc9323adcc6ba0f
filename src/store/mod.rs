//! Persistence seam for traces and per-API configuration.
//!
//! The tracer only talks to [`TraceStore`].  Two implementations ship:
//!
//! - [`SqliteStore`] persists to a SQLite file, so history (and with it the
//!   rate-limit window and startup cleanup) survives restarts.
//! - [`MemoryStore`] keeps everything in process: configs live in a sharded
//!   map whose entry API gives an atomic find-or-insert, traces in an
//!   append-only vector, and a per-identity sorted timestamp index answers
//!   the rate-limit window count without scanning history.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use thiserror::Error;

use crate::model::{ApiConfig, ConfigUpdate, IdentityActivity, TraceRecord};

pub mod sqlite;

pub use self::sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("api config already exists: {0}")]
    Conflict(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store query failed: {0}")]
    Query(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

/// Filter for trace listings.  Bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub api_identity: Option<String>,
}

impl TraceFilter {
    fn matches(&self, record: &TraceRecord) -> bool {
        self.from.map_or(true, |from| record.timestamp >= from)
            && self.to.map_or(true, |to| record.timestamp <= to)
            && self
                .api_identity
                .as_deref()
                .map_or(true, |id| record.api_identity == id)
    }
}

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

#[async_trait::async_trait]
pub trait TraceStore: Send + Sync {
    /// Return the config for `identity`, inserting the default record with
    /// `start_date = now` if none exists.  At most one record is ever
    /// created per identity, whatever the number of concurrent callers.
    async fn upsert_config_if_absent(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<ApiConfig, StoreError>;

    /// Number of traces for `identity` with `timestamp >= since`.
    async fn count_traces(&self, identity: &str, since: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn insert_trace(&self, record: TraceRecord) -> Result<(), StoreError>;

    async fn find_distinct_identities(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Delete every config whose identity is not in `keep`; returns the
    /// number removed.
    async fn delete_configs_not_in(&self, keep: &BTreeSet<String>) -> Result<u64, StoreError>;

    /// Matching traces newest first, paginated, plus the total match count.
    async fn find_traces(
        &self,
        filter: &TraceFilter,
        page: Page,
    ) -> Result<(Vec<TraceRecord>, u64), StoreError>;

    /// Statuses and latest timestamp per identity for traces in
    /// `[from, to]`, most recently active identity first.
    async fn aggregate_by_identity_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IdentityActivity>, StoreError>;

    /// Traces with `timestamp >= since`, oldest first.
    async fn traces_since(&self, since: DateTime<Utc>) -> Result<Vec<TraceRecord>, StoreError>;

    async fn first_trace_at(&self, identity: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn delete_traces_matching(&self, endpoint: &Regex) -> Result<u64, StoreError>;

    async fn find_config(&self, identity: &str) -> Result<Option<ApiConfig>, StoreError>;

    /// Configs sorted by identity.
    async fn list_configs(&self) -> Result<Vec<ApiConfig>, StoreError>;

    /// Insert a new config; `Conflict` if the identity already has one.
    async fn create_config(&self, config: ApiConfig) -> Result<ApiConfig, StoreError>;

    /// Apply `update` to an existing config; `None` if there is none.
    async fn update_config(
        &self,
        identity: &str,
        update: &ConfigUpdate,
    ) -> Result<Option<ApiConfig>, StoreError>;
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    configs: DashMap<String, ApiConfig>,
    traces: RwLock<Vec<TraceRecord>>,
    // sorted timestamps per identity
    history: DashMap<String, Vec<DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_count(&self) -> usize {
        self.configs.len()
    }

    pub fn trace_count(&self) -> usize {
        self.traces.read().map(|t| t.len()).unwrap_or(0)
    }

    fn rebuild_history(&self, traces: &[TraceRecord]) {
        self.history.clear();
        for record in traces {
            index_insert(
                &mut self.history.entry(record.api_identity.clone()).or_default(),
                record.timestamp,
            );
        }
    }
}

fn index_insert(timestamps: &mut Vec<DateTime<Utc>>, at: DateTime<Utc>) {
    let pos = timestamps.partition_point(|t| *t <= at);
    timestamps.insert(pos, at);
}

#[async_trait::async_trait]
impl TraceStore for MemoryStore {
    async fn upsert_config_if_absent(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<ApiConfig, StoreError> {
        // the entry guard holds the shard write lock across lookup and insert
        let cfg = match self.configs.entry(identity.to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let created = ApiConfig::with_defaults(identity, now);
                slot.insert(created.clone());
                tracing::info!(api = %identity, "registered new api config");
                created
            }
        };
        Ok(cfg)
    }

    async fn count_traces(&self, identity: &str, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let count = self
            .history
            .get(identity)
            .map(|ts| ts.len() - ts.partition_point(|t| *t < since))
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn insert_trace(&self, record: TraceRecord) -> Result<(), StoreError> {
        let mut traces = self.traces.write().map_err(|_| StoreError::Poisoned)?;
        index_insert(
            &mut self.history.entry(record.api_identity.clone()).or_default(),
            record.timestamp,
        );
        traces.push(record);
        Ok(())
    }

    async fn find_distinct_identities(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .history
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect())
    }

    async fn delete_configs_not_in(&self, keep: &BTreeSet<String>) -> Result<u64, StoreError> {
        let before = self.configs.len();
        self.configs.retain(|identity, _| keep.contains(identity));
        Ok(before.saturating_sub(self.configs.len()) as u64)
    }

    async fn find_traces(
        &self,
        filter: &TraceFilter,
        page: Page,
    ) -> Result<(Vec<TraceRecord>, u64), StoreError> {
        let traces = self.traces.read().map_err(|_| StoreError::Poisoned)?;
        let mut matched: Vec<&TraceRecord> = traces.iter().filter(|r| filter.matches(r)).collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total = matched.len() as u64;
        let data = matched
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok((data, total))
    }

    async fn aggregate_by_identity_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IdentityActivity>, StoreError> {
        let traces = self.traces.read().map_err(|_| StoreError::Poisoned)?;
        let mut grouped: BTreeMap<&str, IdentityActivity> = BTreeMap::new();
        for record in traces
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
        {
            let entry = grouped
                .entry(record.api_identity.as_str())
                .or_insert_with(|| IdentityActivity {
                    api_identity: record.api_identity.clone(),
                    statuses: Vec::new(),
                    last_timestamp: record.timestamp,
                });
            entry.statuses.push(record.status);
            if record.timestamp > entry.last_timestamp {
                entry.last_timestamp = record.timestamp;
            }
        }
        let mut out: Vec<IdentityActivity> = grouped.into_values().collect();
        out.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
        Ok(out)
    }

    async fn traces_since(&self, since: DateTime<Utc>) -> Result<Vec<TraceRecord>, StoreError> {
        let traces = self.traces.read().map_err(|_| StoreError::Poisoned)?;
        let mut out: Vec<TraceRecord> = traces
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    async fn first_trace_at(&self, identity: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .history
            .get(identity)
            .and_then(|ts| ts.first().copied()))
    }

    async fn delete_traces_matching(&self, endpoint: &Regex) -> Result<u64, StoreError> {
        let mut traces = self.traces.write().map_err(|_| StoreError::Poisoned)?;
        let before = traces.len();
        traces.retain(|r| !endpoint.is_match(&r.endpoint));
        let removed = before - traces.len();
        if removed > 0 {
            self.rebuild_history(&traces);
        }
        Ok(removed as u64)
    }

    async fn find_config(&self, identity: &str) -> Result<Option<ApiConfig>, StoreError> {
        Ok(self.configs.get(identity).map(|c| c.clone()))
    }

    async fn list_configs(&self) -> Result<Vec<ApiConfig>, StoreError> {
        let mut configs: Vec<ApiConfig> = self.configs.iter().map(|c| c.value().clone()).collect();
        configs.sort_by(|a, b| a.api_identity.cmp(&b.api_identity));
        Ok(configs)
    }

    async fn create_config(&self, config: ApiConfig) -> Result<ApiConfig, StoreError> {
        match self.configs.entry(config.api_identity.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(config.api_identity)),
            Entry::Vacant(slot) => {
                slot.insert(config.clone());
                Ok(config)
            }
        }
    }

    async fn update_config(
        &self,
        identity: &str,
        update: &ConfigUpdate,
    ) -> Result<Option<ApiConfig>, StoreError> {
        Ok(self.configs.get_mut(identity).map(|mut cfg| {
            cfg.apply(update);
            cfg.clone()
        }))
    }
}
