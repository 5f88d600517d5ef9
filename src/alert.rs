//! Alert Sink: a one-way outbound notifier with a small, enumerated set of
//! event shapes (spec section 4.5). Delivery is best-effort — a failed
//! notification is logged but never fails the tick.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{DeclineKind, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionAction {
    Opened,
    Added,
    Reduced,
    Closed,
}

impl PositionAction {
    fn as_str(self) -> &'static str {
        match self {
            PositionAction::Opened => "Opened",
            PositionAction::Added => "Added",
            PositionAction::Reduced => "Reduced",
            PositionAction::Closed => "Closed",
        }
    }
}

#[derive(Debug, Clone)]
pub enum AlertEvent {
    PositionUpdate {
        action: PositionAction,
        symbol: String,
        side: Side,
        qty: Decimal,
        price: Decimal,
        post_size_contracts: Decimal,
        post_value_usd: Decimal,
        post_pct_of_equity: Decimal,
        equity: Decimal,
    },
    VolatilityHigh {
        symbol: String,
        atr_ratio: f64,
        bb_width_pct: f64,
        hist_vol_pct: f64,
    },
    DeclineVelocity {
        symbol: String,
        kind: DeclineKind,
        score: f64,
        roc_short: f64,
        roc_medium: f64,
    },
    MarginWarning {
        symbol: String,
        margin_level: f64,
        equity: Decimal,
        position_value_usd: Decimal,
    },
    ExecutionError {
        symbol: String,
        stage: &'static str,
        error_kind: String,
        message: String,
    },
    Started {
        instruments: Vec<String>,
        testnet: bool,
    },
}

impl AlertEvent {
    fn kind(&self) -> &'static str {
        match self {
            AlertEvent::PositionUpdate { .. } => "PositionUpdate",
            AlertEvent::VolatilityHigh { .. } => "VolatilityHigh",
            AlertEvent::DeclineVelocity { .. } => "DeclineVelocity",
            AlertEvent::MarginWarning { .. } => "MarginWarning",
            AlertEvent::ExecutionError { .. } => "ExecutionError",
            AlertEvent::Started { .. } => "Started",
        }
    }

    /// Renders a short human-readable message, the contract the out-of-band
    /// transport (e.g. a Telegram bot) actually cares about.
    fn render(&self) -> String {
        match self {
            AlertEvent::PositionUpdate { action, symbol, side, qty, price, post_size_contracts, post_pct_of_equity, .. } => {
                format!(
                    "{} {:?} {symbol}: qty={qty} @ {price} (post size={post_size_contracts}, {post_pct_of_equity}% of equity)",
                    action.as_str(),
                    side
                )
            }
            AlertEvent::VolatilityHigh { symbol, atr_ratio, bb_width_pct, hist_vol_pct } => {
                format!("{symbol} volatility high: atrRatio={atr_ratio:.2} bbWidth={bb_width_pct:.2}% histVol={hist_vol_pct:.2}%")
            }
            AlertEvent::DeclineVelocity { symbol, kind, score, roc_short, roc_medium } => {
                format!("{symbol} decline {kind:?} (score={score:.1}): rocShort={roc_short:.4} rocMedium={roc_medium:.4}")
            }
            AlertEvent::MarginWarning { symbol, margin_level, equity, position_value_usd } => {
                format!("{symbol} margin warning: level={margin_level:.2} equity={equity} positionValue={position_value_usd}")
            }
            AlertEvent::ExecutionError { symbol, stage, error_kind, message } => {
                format!("{symbol} execution error at {stage}: {error_kind}: {message}")
            }
            AlertEvent::Started { instruments, testnet } => {
                format!("started ({}): {}", if *testnet { "testnet" } else { "mainnet" }, instruments.join(", "))
            }
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, event: &AlertEvent);
}

/// Logs the alert but delivers nothing. Used when no transport is configured.
pub struct NullSink;

#[async_trait]
impl AlertSink for NullSink {
    async fn send(&self, event: &AlertEvent) {
        log_alert(event);
    }
}

/// Posts to the Telegram Bot API. Best-effort: network failures are logged,
/// never propagated.
pub struct TelegramSink {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self { client: reqwest::Client::new(), bot_token, chat_id }
    }

    fn api_url(&self) -> String {
        format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token)
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    async fn send(&self, event: &AlertEvent) {
        log_alert(event);
        let body = serde_json::json!({ "chat_id": self.chat_id, "text": event.render() });
        if let Err(e) = self.client.post(self.api_url()).json(&body).send().await {
            log(
                Level::Warn,
                Domain::System,
                "alert.delivery_failed",
                obj(&[("kind", v_str(event.kind())), ("error", v_str(e.to_string()))]),
            );
        }
    }
}

fn log_alert(event: &AlertEvent) {
    log(
        Level::Info,
        Domain::System,
        "alert",
        obj(&[("kind", v_str(event.kind())), ("message", v_str(event.render()))]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sink_never_panics() {
        let sink = NullSink;
        sink.send(&AlertEvent::Started { instruments: vec!["BTCUSDT".to_string()], testnet: true }).await;
    }

    #[test]
    fn position_update_renders_side_and_qty() {
        let event = AlertEvent::PositionUpdate {
            action: PositionAction::Opened,
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty: Decimal::new(12, 4),
            price: Decimal::new(499_995, 1),
            post_size_contracts: Decimal::new(12, 4),
            post_value_usd: Decimal::new(60, 0),
            post_pct_of_equity: Decimal::new(6, 3),
            equity: Decimal::new(1000, 0),
        };
        let message = event.render();
        assert!(message.contains("Opened"));
        assert!(message.contains("BTCUSDT"));
    }
}
