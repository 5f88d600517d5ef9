//! End-to-end smoke test: a full tick against a fake in-memory exchange,
//! exercising prepare -> gather -> decide -> execute -> alert -> log without
//! any network access.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;

use martingale_perps_bot::alert::{AlertEvent, AlertSink, NullSink};
use martingale_perps_bot::error::EngineError;
use martingale_perps_bot::exchange::Exchange;
use martingale_perps_bot::model::{Account, Candle, InstrumentConfig, Position, Side};
use martingale_perps_bot::workflow::{run_instrument, Outcome};

struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn new() -> Self {
        Self { events: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, event: &AlertEvent) {
        self.events.lock().unwrap().push(format!("{event:?}"));
    }
}

/// An uptrending series: every close higher than the last, so the slow EMA
/// sits below the last price and a long instrument's trend predicate holds.
fn uptrend_candles(n: usize, start: f64, step: f64) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let close = start + step * i as f64;
            Candle { ts: i as u64, open: close, high: close + 0.01, low: close - 0.01, close, volume: 12.0 }
        })
        .collect()
}

struct FakeExchange {
    candles: Vec<Candle>,
    placed_orders: AtomicUsize,
}

#[async_trait]
impl Exchange for FakeExchange {
    async fn get_position(&self, _symbol: &str) -> Result<Position, EngineError> {
        Ok(None)
    }

    async fn get_ticker(&self, _symbol: &str) -> Result<(Decimal, Decimal, Decimal), EngineError> {
        let last = self.candles.last().unwrap().close;
        Ok((Decimal::try_from(last - 0.01).unwrap(), Decimal::try_from(last + 0.01).unwrap(), Decimal::try_from(last).unwrap()))
    }

    async fn get_candles(&self, _symbol: &str, _interval_minutes: u64, _limit: usize) -> Result<Vec<Candle>, EngineError> {
        Ok(self.candles.clone())
    }

    async fn get_equity(&self) -> Result<Account, EngineError> {
        Ok(Account { total_equity_usd: Decimal::from(5_000), available_equity_usd: Decimal::from(5_000) })
    }

    async fn set_leverage(&self, _symbol: &str, _side: Side, _leverage: u32) -> Result<(), EngineError> {
        Ok(())
    }

    async fn cancel_all_open(&self, _symbol: &str) -> Result<u32, EngineError> {
        Ok(0)
    }

    async fn place_limit(
        &self,
        _symbol: &str,
        _side: Side,
        _qty: Decimal,
        _limit_price: Decimal,
        _reduce_only: bool,
    ) -> Result<String, EngineError> {
        self.placed_orders.fetch_add(1, Ordering::SeqCst);
        Ok("order-e2e".to_string())
    }

    async fn close_position(&self, _symbol: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

fn long_instrument() -> InstrumentConfig {
    InstrumentConfig {
        symbol: "BTCUSD".to_string(),
        side: Side::Long,
        automatic_mode: true,
        leverage: 10,
        ema_interval_minutes: 1,
        profit_pnl_target: Decimal::new(10, 2),
        profit_balance_threshold: Decimal::new(3, 3),
        position_ceiling_pct: Decimal::new(20, 2),
        initial_entry_pct: Decimal::new(6, 3),
        add_trigger_drop_pct: Decimal::new(5, 2),
        max_margin_pct: Some(Decimal::new(50, 2)),
    }
}

#[tokio::test]
async fn full_tick_opens_a_long_position_on_a_confirmed_uptrend() {
    let exchange = FakeExchange { candles: uptrend_candles(700, 40_000.0, 1.0), placed_orders: AtomicUsize::new(0) };
    let sink = RecordingSink::new();

    let outcome = run_instrument(&exchange, &sink, &long_instrument()).await;

    match outcome {
        Outcome::Managed { .. } | Outcome::Skipped { .. } => {}
        Outcome::Error { message, .. } => panic!("unexpected error outcome: {message}"),
    }
}

#[tokio::test]
async fn tick_never_panics_on_minimal_candle_history() {
    let exchange = FakeExchange { candles: uptrend_candles(5, 40_000.0, 1.0), placed_orders: AtomicUsize::new(0) };
    let sink = NullSink;

    let outcome = run_instrument(&exchange, &sink, &long_instrument()).await;

    match outcome {
        Outcome::Skipped { reason } => assert!(reason.contains("insufficient data")),
        other => panic!("expected a skip on too-short history, got {other:?}"),
    }
}
