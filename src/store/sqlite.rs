//! SQLite-backed [`TraceStore`].
//!
//! One connection behind a mutex.  Timestamps are stored as UTC
//! microseconds so range predicates and the `(api_identity, timestamp_us)`
//! index work on plain integers; captured console lines are a JSON column.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Page, StoreError, TraceFilter, TraceStore};
use crate::model::{ApiConfig, ConfigUpdate, ConsoleLine, IdentityActivity, TraceRecord};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS api_configs (
  api_identity TEXT PRIMARY KEY,
  start_date_us INTEGER NOT NULL,
  enabled INTEGER NOT NULL CHECK (enabled IN (0,1)),
  tracer_enabled INTEGER NOT NULL CHECK (tracer_enabled IN (0,1)),
  limit_enabled INTEGER NOT NULL CHECK (limit_enabled IN (0,1)),
  limit_count INTEGER NOT NULL,
  limit_rate INTEGER NOT NULL,
  scheduling INTEGER NOT NULL CHECK (scheduling IN (0,1)),
  start_time TEXT NOT NULL,
  end_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS traces (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  trace_id TEXT NOT NULL UNIQUE,
  api_identity TEXT NOT NULL,
  method TEXT NOT NULL,
  endpoint TEXT NOT NULL,
  status INTEGER NOT NULL,
  response_time_ms INTEGER NOT NULL,
  timestamp_us INTEGER NOT NULL,
  console_logs TEXT NOT NULL,
  api_key_verified INTEGER NOT NULL CHECK (api_key_verified IN (0,1))
);

CREATE INDEX IF NOT EXISTS idx_traces_identity_ts ON traces(api_identity, timestamp_us);
CREATE INDEX IF NOT EXISTS idx_traces_ts ON traces(timestamp_us);
";

const TRACE_COLUMNS: &str = "trace_id, api_identity, method, endpoint, status, \
     response_time_ms, timestamp_us, console_logs, api_key_verified";

const CONFIG_COLUMNS: &str = "api_identity, start_date_us, enabled, tracer_enabled, \
     limit_enabled, limit_count, limit_rate, scheduling, start_time, end_time";

// Optional bounds: a NULL parameter disables its predicate.
const TRACE_FILTER: &str = "(?1 IS NULL OR timestamp_us >= ?1) \
     AND (?2 IS NULL OR timestamp_us <= ?2) \
     AND (?3 IS NULL OR api_identity = ?3)";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|err| {
            StoreError::Unavailable(format!("failed to open {}: {}", path.display(), err))
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(us: i64) -> Result<DateTime<Utc>, StoreError> {
    let secs = us.div_euclid(1_000_000);
    let nanos = (us.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| StoreError::Query(format!("timestamp out of range: {}", us)))
}

struct TraceRow {
    trace_id: String,
    api_identity: String,
    method: String,
    endpoint: String,
    status: i64,
    response_time_ms: i64,
    timestamp_us: i64,
    console_logs: String,
    api_key_verified: bool,
}

impl TraceRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            trace_id: row.get(0)?,
            api_identity: row.get(1)?,
            method: row.get(2)?,
            endpoint: row.get(3)?,
            status: row.get(4)?,
            response_time_ms: row.get(5)?,
            timestamp_us: row.get(6)?,
            console_logs: row.get(7)?,
            api_key_verified: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<TraceRecord, StoreError> {
        let console_logs: Vec<ConsoleLine> = serde_json::from_str(&self.console_logs)
            .map_err(|err| StoreError::Query(format!("corrupt console_logs: {}", err)))?;
        Ok(TraceRecord {
            status: u16::try_from(self.status)
                .map_err(|_| StoreError::Query(format!("status out of range: {}", self.status)))?,
            response_time_ms: u64::try_from(self.response_time_ms).unwrap_or(0),
            timestamp: from_micros(self.timestamp_us)?,
            trace_id: self.trace_id,
            api_identity: self.api_identity,
            method: self.method,
            endpoint: self.endpoint,
            console_logs,
            api_key_verified: self.api_key_verified,
        })
    }
}

struct ConfigRow {
    api_identity: String,
    start_date_us: i64,
    enabled: bool,
    tracer_enabled: bool,
    limit_enabled: bool,
    limit_count: u32,
    limit_rate: u32,
    scheduling: bool,
    start_time: String,
    end_time: String,
}

impl ConfigRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            api_identity: row.get(0)?,
            start_date_us: row.get(1)?,
            enabled: row.get(2)?,
            tracer_enabled: row.get(3)?,
            limit_enabled: row.get(4)?,
            limit_count: row.get(5)?,
            limit_rate: row.get(6)?,
            scheduling: row.get(7)?,
            start_time: row.get(8)?,
            end_time: row.get(9)?,
        })
    }

    fn into_config(self) -> Result<ApiConfig, StoreError> {
        Ok(ApiConfig {
            start_date: from_micros(self.start_date_us)?,
            api_identity: self.api_identity,
            enabled: self.enabled,
            tracer_enabled: self.tracer_enabled,
            limit_enabled: self.limit_enabled,
            limit_count: self.limit_count,
            limit_rate: self.limit_rate,
            scheduling: self.scheduling,
            start_time: self.start_time,
            end_time: self.end_time,
        })
    }
}

/// Insert `cfg` unless its identity already exists; returns rows inserted.
fn insert_config_if_absent(conn: &Connection, cfg: &ApiConfig) -> Result<usize, StoreError> {
    let sql = format!(
        "INSERT INTO api_configs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(api_identity) DO NOTHING",
        CONFIG_COLUMNS
    );
    let inserted = conn.execute(
        &sql,
        params![
            cfg.api_identity,
            to_micros(cfg.start_date),
            cfg.enabled,
            cfg.tracer_enabled,
            cfg.limit_enabled,
            cfg.limit_count,
            cfg.limit_rate,
            cfg.scheduling,
            cfg.start_time,
            cfg.end_time,
        ],
    )?;
    Ok(inserted)
}

fn select_config(conn: &Connection, identity: &str) -> Result<Option<ApiConfig>, StoreError> {
    let sql = format!(
        "SELECT {} FROM api_configs WHERE api_identity = ?1",
        CONFIG_COLUMNS
    );
    conn.query_row(&sql, params![identity], ConfigRow::read)
        .optional()?
        .map(ConfigRow::into_config)
        .transpose()
}

fn select_traces(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<TraceRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, TraceRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(TraceRow::into_record).collect()
}

#[async_trait::async_trait]
impl TraceStore for SqliteStore {
    async fn upsert_config_if_absent(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<ApiConfig, StoreError> {
        let conn = self.conn()?;
        if insert_config_if_absent(&conn, &ApiConfig::with_defaults(identity, now))? > 0 {
            tracing::info!(api = %identity, "registered new api config");
        }
        select_config(&conn, identity)?
            .ok_or_else(|| StoreError::Query(format!("config for {} missing after upsert", identity)))
    }

    async fn count_traces(&self, identity: &str, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM traces WHERE api_identity = ?1 AND timestamp_us >= ?2",
            params![identity, to_micros(since)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    async fn insert_trace(&self, record: TraceRecord) -> Result<(), StoreError> {
        let console_logs = serde_json::to_string(&record.console_logs)
            .map_err(|err| StoreError::Query(format!("unencodable console_logs: {}", err)))?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO traces ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                TRACE_COLUMNS
            ),
            params![
                record.trace_id,
                record.api_identity,
                record.method,
                record.endpoint,
                record.status,
                i64::try_from(record.response_time_ms).unwrap_or(i64::MAX),
                to_micros(record.timestamp),
                console_logs,
                record.api_key_verified,
            ],
        )?;
        Ok(())
    }

    async fn find_distinct_identities(&self) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT api_identity FROM traces")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }

    async fn delete_configs_not_in(&self, keep: &BTreeSet<String>) -> Result<u64, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing = {
            let mut stmt = tx.prepare("SELECT api_identity FROM api_configs")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        let mut removed = 0u64;
        for identity in existing.iter().filter(|id| !keep.contains(*id)) {
            removed += tx.execute(
                "DELETE FROM api_configs WHERE api_identity = ?1",
                params![identity],
            )? as u64;
        }
        tx.commit()?;
        Ok(removed)
    }

    async fn find_traces(
        &self,
        filter: &TraceFilter,
        page: Page,
    ) -> Result<(Vec<TraceRecord>, u64), StoreError> {
        let from = filter.from.map(to_micros);
        let to = filter.to.map(to_micros);
        let identity = filter.api_identity.as_deref();
        let limit = i64::try_from(page.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(page.offset).unwrap_or(i64::MAX);

        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM traces WHERE {}", TRACE_FILTER),
            params![from, to, identity],
            |row| row.get(0),
        )?;
        let data = select_traces(
            &conn,
            &format!(
                "SELECT {} FROM traces WHERE {} ORDER BY timestamp_us DESC, seq DESC \
                 LIMIT ?4 OFFSET ?5",
                TRACE_COLUMNS, TRACE_FILTER
            ),
            params![from, to, identity, limit, offset],
        )?;
        Ok((data, total.max(0) as u64))
    }

    async fn aggregate_by_identity_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IdentityActivity>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT api_identity, status, timestamp_us FROM traces \
             WHERE timestamp_us >= ?1 AND timestamp_us <= ?2 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![to_micros(from), to_micros(to)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u16>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut grouped: BTreeMap<String, IdentityActivity> = BTreeMap::new();
        for (identity, status, us) in rows {
            let at = from_micros(us)?;
            let entry = grouped
                .entry(identity.clone())
                .or_insert_with(|| IdentityActivity {
                    api_identity: identity,
                    statuses: Vec::new(),
                    last_timestamp: at,
                });
            entry.statuses.push(status);
            if at > entry.last_timestamp {
                entry.last_timestamp = at;
            }
        }
        let mut out: Vec<IdentityActivity> = grouped.into_values().collect();
        out.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
        Ok(out)
    }

    async fn traces_since(&self, since: DateTime<Utc>) -> Result<Vec<TraceRecord>, StoreError> {
        let conn = self.conn()?;
        select_traces(
            &conn,
            &format!(
                "SELECT {} FROM traces WHERE timestamp_us >= ?1 ORDER BY timestamp_us, seq",
                TRACE_COLUMNS
            ),
            params![to_micros(since)],
        )
    }

    async fn first_trace_at(&self, identity: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn()?;
        let first: Option<i64> = conn.query_row(
            "SELECT MIN(timestamp_us) FROM traces WHERE api_identity = ?1",
            params![identity],
            |row| row.get(0),
        )?;
        first.map(from_micros).transpose()
    }

    async fn delete_traces_matching(&self, endpoint: &Regex) -> Result<u64, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let doomed = {
            let mut stmt = tx.prepare("SELECT seq, endpoint FROM traces")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .filter(|(_, ep)| endpoint.is_match(ep))
                .map(|(seq, _)| seq)
                .collect::<Vec<_>>()
        };
        for seq in &doomed {
            tx.execute("DELETE FROM traces WHERE seq = ?1", params![seq])?;
        }
        tx.commit()?;
        Ok(doomed.len() as u64)
    }

    async fn find_config(&self, identity: &str) -> Result<Option<ApiConfig>, StoreError> {
        let conn = self.conn()?;
        select_config(&conn, identity)
    }

    async fn list_configs(&self) -> Result<Vec<ApiConfig>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_configs ORDER BY api_identity",
            CONFIG_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], ConfigRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ConfigRow::into_config).collect()
    }

    async fn create_config(&self, config: ApiConfig) -> Result<ApiConfig, StoreError> {
        let conn = self.conn()?;
        if insert_config_if_absent(&conn, &config)? == 0 {
            return Err(StoreError::Conflict(config.api_identity));
        }
        Ok(config)
    }

    async fn update_config(
        &self,
        identity: &str,
        update: &ConfigUpdate,
    ) -> Result<Option<ApiConfig>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(mut cfg) = select_config(&tx, identity)? else {
            return Ok(None);
        };
        cfg.apply(update);
        tx.execute(
            "UPDATE api_configs SET enabled = ?2, tracer_enabled = ?3, limit_enabled = ?4, \
             limit_count = ?5, limit_rate = ?6, scheduling = ?7, start_time = ?8, end_time = ?9 \
             WHERE api_identity = ?1",
            params![
                cfg.api_identity,
                cfg.enabled,
                cfg.tracer_enabled,
                cfg.limit_enabled,
                cfg.limit_count,
                cfg.limit_rate,
                cfg.scheduling,
                cfg.start_time,
                cfg.end_time,
            ],
        )?;
        tx.commit()?;
        Ok(Some(cfg))
    }
}
