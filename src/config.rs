//! Configuration: environment parsing for the engine and per-instrument
//! settings (spec section 6). One field per env var, `std::env::var(...).ok()`
//! chains with defaults, following the teacher's `Config::from_env` shape.

use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::model::{InstrumentConfig, Side};

/// Global, process-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_key: String,
    pub api_secret: String,
    pub instruments: Vec<InstrumentConfig>,
    pub ema_interval_minutes: u64,
    pub testnet: bool,
    pub bot_startup_alert: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub phemex_base: String,
    pub tick_deadline_secs: u64,
    pub http_timeout_secs: u64,
    pub rate_limit_per_sec: usize,
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        let api_key = std::env::var("API_KEY").map_err(|_| EngineError::Configuration("API_KEY is required".to_string()))?;
        let api_secret =
            std::env::var("API_SECRET").map_err(|_| EngineError::Configuration("API_SECRET is required".to_string()))?;
        let symbol_env = std::env::var("SYMBOL").map_err(|_| EngineError::Configuration("SYMBOL is required".to_string()))?;
        let ema_interval_minutes = env_u64("EMA_INTERVAL", 1);
        let instruments = parse_symbol_env(&symbol_env, ema_interval_minutes)?;
        let testnet = env_bool("TESTNET", false);

        Ok(Self {
            api_key,
            api_secret,
            instruments,
            ema_interval_minutes,
            testnet,
            bot_startup_alert: env_bool("BOT_STARTUP", false),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
            phemex_base: std::env::var("PHEMEX_BASE").unwrap_or_else(|_| {
                if testnet {
                    "https://testnet-api.phemex.com".to_string()
                } else {
                    "https://api.phemex.com".to_string()
                }
            }),
            tick_deadline_secs: env_u64("TICK_DEADLINE_SECS", 50),
            http_timeout_secs: env_u64("HTTP_TIMEOUT_SECS", 10),
            rate_limit_per_sec: env_usize("RATE_LIMIT_PER_SEC", 10),
        })
    }
}

/// Parses `SYMBOL`: comma-separated `SYMBOL:SIDE:AUTO` triples, splitting on
/// `:` at most twice, trimming whitespace. `AUTO` is true iff the lowercased
/// token is one of `true`, `1`, `yes` (spec section 6).
fn parse_symbol_env(raw: &str, ema_interval_minutes: u64) -> Result<Vec<InstrumentConfig>, EngineError> {
    raw.split(',')
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| parse_symbol_triple(chunk, ema_interval_minutes))
        .collect()
}

fn parse_symbol_triple(chunk: &str, ema_interval_minutes: u64) -> Result<InstrumentConfig, EngineError> {
    let mut parts = chunk.splitn(3, ':');
    let symbol = parts.next().unwrap_or_default().trim();
    let side_token = parts.next().unwrap_or_default().trim();
    let auto_token = parts.next().unwrap_or_default().trim();

    if symbol.is_empty() {
        return Err(EngineError::Configuration(format!("invalid SYMBOL triple: '{chunk}'")));
    }
    let side = match side_token.to_lowercase().as_str() {
        "long" => Side::Long,
        "short" => Side::Short,
        other => return Err(EngineError::Configuration(format!("invalid side '{other}' in SYMBOL triple: '{chunk}'"))),
    };
    let automatic_mode = matches!(auto_token.to_lowercase().as_str(), "true" | "1" | "yes");

    Ok(InstrumentConfig {
        symbol: symbol.to_string(),
        side,
        automatic_mode,
        leverage: 10,
        ema_interval_minutes,
        profit_pnl_target: Decimal::new(10, 2),
        profit_balance_threshold: Decimal::new(3, 3),
        position_ceiling_pct: Decimal::new(20, 2),
        initial_entry_pct: Decimal::new(6, 3),
        add_trigger_drop_pct: Decimal::new(5, 2),
        max_margin_pct: Some(Decimal::new(50, 2)),
    })
}
