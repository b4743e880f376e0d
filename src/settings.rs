//! Runtime settings from the environment (`.env` honoured by [`Settings::load`]).

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    /// Schema for `_sys_tables` / `_sys_fields`. Must be a valid PostgreSQL identifier.
    pub meta_schema: String,
    /// Schema holding one physical table per materialized collection.
    pub data_schema: String,
    pub script_timeout: Duration,
    /// Heap limit of one script run, in bytes.
    pub script_memory_limit: usize,
    /// Bound on recursive populate/query resolution.
    pub resolve_timeout: Duration,
    pub email_from: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: "postgres://localhost/dyntable".into(),
            meta_schema: "dyntable".into(),
            data_schema: "collections".into(),
            script_timeout: Duration::from_millis(5_000),
            script_memory_limit: 32 * 1024 * 1024,
            resolve_timeout: Duration::from_millis(10_000),
            email_from: "no-reply@localhost".into(),
        }
    }
}

impl Settings {
    /// Read `.env` (if present), then the process environment.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Self {
        let d = Settings::default();
        Settings {
            database_url: env_or("DATABASE_URL", d.database_url),
            meta_schema: env_or("DYNTABLE_SCHEMA", d.meta_schema),
            data_schema: env_or("DYNTABLE_DATA_SCHEMA", d.data_schema),
            script_timeout: env_millis("SCRIPT_TIMEOUT_MS").unwrap_or(d.script_timeout),
            script_memory_limit: env_parse("SCRIPT_MEMORY_LIMIT").unwrap_or(d.script_memory_limit),
            resolve_timeout: env_millis("RESOLVE_TIMEOUT_MS").unwrap_or(d.resolve_timeout),
            email_from: env_or("EMAIL_FROM", d.email_from),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("{}: could not parse '{}', using default", key, raw);
            None
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
