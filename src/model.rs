//! Records produced by the tracer and the per-API policy it evaluates.
//! Both serialise in camelCase, which is the shape the dashboard and the
//! read endpoints consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Severity of a captured diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "log" => Some(ConsoleLevel::Log),
            "info" => Some(ConsoleLevel::Info),
            "warn" => Some(ConsoleLevel::Warn),
            "error" => Some(ConsoleLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub level: ConsoleLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One persisted request outcome.  Written once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub trace_id: String,
    pub api_identity: String,
    pub method: String,
    pub endpoint: String,
    pub status: u16,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub console_logs: Vec<ConsoleLine>,
    pub api_key_verified: bool,
}

/// Mutable policy for one API identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub api_identity: String,
    pub start_date: DateTime<Utc>,
    pub enabled: bool,
    pub tracer_enabled: bool,
    pub limit_enabled: bool,
    pub limit_count: u32,
    /// Window length in minutes.
    pub limit_rate: u32,
    pub scheduling: bool,
    pub start_time: String,
    pub end_time: String,
}

impl ApiConfig {
    /// The record inserted the first time an identity is seen.
    pub fn with_defaults(api_identity: impl Into<String>, start_date: DateTime<Utc>) -> Self {
        Self {
            api_identity: api_identity.into(),
            start_date,
            enabled: true,
            tracer_enabled: true,
            limit_enabled: false,
            limit_count: 0,
            limit_rate: 0,
            scheduling: false,
            start_time: String::new(),
            end_time: String::new(),
        }
    }

    /// Apply an edit from the config-management endpoint.  `api_identity`
    /// and `start_date` are never touched.
    pub fn apply(&mut self, update: &ConfigUpdate) {
        if let Some(v) = update.enabled {
            self.enabled = v;
        }
        if let Some(v) = update.tracer_enabled {
            self.tracer_enabled = v;
        }
        if let Some(v) = update.limit_enabled {
            self.limit_enabled = v;
        }
        if let Some(v) = update.limit_count {
            self.limit_count = v;
        }
        if let Some(v) = update.limit_rate {
            self.limit_rate = v;
        }
        if let Some(v) = update.scheduling {
            self.scheduling = v;
        }
        if let Some(ref v) = update.start_time {
            self.start_time = v.trim().to_string();
        }
        if let Some(ref v) = update.end_time {
            self.end_time = v.trim().to_string();
        }
    }
}

/// Partial policy edit.  Unknown fields are ignored; identity and start
/// date cannot be changed through it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub tracer_enabled: Option<bool>,
    pub limit_enabled: Option<bool>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub limit_count: Option<u32>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub limit_rate: Option<u32>,
    pub scheduling: Option<bool>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// Accepts integers, numeric strings and anything else.  Values that are not
/// a non-negative integer collapse to 0 so the rate gate stays inert.
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.map(|value| match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0),
        serde_json::Value::String(s) => s.trim().parse::<u32>().unwrap_or(0),
        _ => 0,
    }))
}

/// Per-identity activity within a time range, used by the grouped log view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityActivity {
    pub api_identity: String,
    pub statuses: Vec<u16>,
    pub last_timestamp: DateTime<Utc>,
}
