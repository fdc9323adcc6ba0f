use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

/// Origin allowed by CORS when `TRACER_ALLOWED_ORIGINS` is unset.
const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:5173";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Shared secret unlocking console capture on recorded traces.
    pub api_key: Option<String>,
    pub port: u16,
    /// Traces per page on the log listing.
    pub page_size: usize,
    /// Purge stored traces of the monitor's own routes at startup.
    pub cleanup_on_start: bool,
    pub allowed_origins: Vec<String>,
    pub max_request_bytes: Option<usize>,
    /// SQLite file for traces and configs; in-memory when unset.
    pub db_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            port: 5000,
            page_size: 20,
            cleanup_on_start: true,
            allowed_origins: vec![DEFAULT_ALLOWED_ORIGIN.to_string()],
            max_request_bytes: None,
            db_path: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let api_key = env::var("TRACER_API_KEY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let port = match parse_optional_u64("PORT")? {
            Some(p) => u16::try_from(p).map_err(|_| anyhow!("PORT must fit in 16 bits"))?,
            None => defaults.port,
        };

        let page_size = match parse_optional_u64("TRACER_PAGE_SIZE")? {
            Some(0) => return Err(anyhow!("TRACER_PAGE_SIZE must be greater than zero")),
            Some(n) => n as usize,
            None => defaults.page_size,
        };

        let cleanup_on_start =
            parse_bool_env("TRACER_CLEANUP_ON_START")?.unwrap_or(defaults.cleanup_on_start);

        let allowed_origins = env::var("TRACER_ALLOWED_ORIGINS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.allowed_origins);

        let max_request_bytes =
            parse_optional_u64("TRACER_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        let db_path = env::var("TRACER_DB_PATH")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            api_key,
            port,
            page_size,
            cleanup_on_start,
            allowed_origins,
            max_request_bytes,
            db_path,
        })
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
