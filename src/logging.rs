//! Structured JSON-lines logging to stdout, one line per event. Trimmed from
//! a larger multi-domain/multi-file logger down to what a stateless, single
//! process-per-tick system needs: no run directory, no profiling scopes, no
//! replay/audit file — every record that matters is the one line emitted.

use chrono::Utc;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Market,
    Strategy,
    Exec,
    System,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Strategy => "strategy",
            Domain::Exec => "exec",
            Domain::System => "system",
        }
    }

    /// `LOG_DOMAINS` is a comma-separated allow-list; unset or `"all"` means
    /// every domain is enabled.
    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

fn ts_now() -> String {
    Utc::now().to_rfc3339()
}

/// Emits one JSON line to stdout if `level`/`domain` pass the configured
/// filters. `fields` becomes the record's `data` object; `ts`, `lvl`,
/// `component`, and `event` are always present.
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("lvl".to_string(), json!(level.as_str()));
    entry.insert("component".to_string(), json!(domain.as_str()));
    entry.insert("event".to_string(), json!(event));
    entry.insert("data".to_string(), Value::Object(fields));
    println!("{}", Value::Object(entry));
}

/// The per-instrument structured outcome record from spec section 6, logged
/// unconditionally at `Info` regardless of `LOG_DOMAINS` filtering.
pub fn log_outcome(fields: Map<String, Value>) {
    let mut entry = fields;
    entry.insert("timestamp".to_string(), json!(ts_now()));
    println!("{}", Value::Object(entry));
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub fn v_str(s: impl Into<String>) -> Value {
    Value::String(s.into())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}
