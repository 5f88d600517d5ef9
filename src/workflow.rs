//! Per-instrument, per-tick orchestration (spec section 4.4): prepare,
//! gather, gate, decide, execute, alert, log. Grounded on the teacher's
//! `main.rs` tick body (prepare -> fetch -> decide -> execute -> log),
//! generalized to this system's explicit failure-isolation contract: one
//! instrument's failure must never abort the tick.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};

use crate::alert::{AlertEvent, AlertSink, PositionAction};
use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::indicators::{self, VolatilityThresholds};
use crate::logging::log_outcome;
use crate::model::{Account, ActionPlan, InstrumentConfig, MarketSnapshot, Side};
use crate::strategy;

/// Longest indicator lookback (the 200-period slow EMA) times 3, per spec's
/// "enough bars for the longest indicator window x 3" gather rule.
const CANDLE_LIMIT: usize = 200 * 3;
const EMA_FAST_PERIOD: usize = 50;
const EMA_SLOW_PERIOD: usize = 200;
const ATR_PERIOD: usize = 14;
const BB_PERIOD: usize = 20;
const BB_K: f64 = 2.0;
const HV_PERIOD: usize = 20;
const MARGIN_WARNING_LEVEL: f64 = 1.5;

/// The outcome of one instrument's tick, returned to the caller for logging,
/// alerting, and (in tests) for asserting isolation from other instruments.
#[derive(Debug, Clone)]
pub enum Outcome {
    Managed { action: ActionPlan },
    Skipped { reason: String },
    Error { stage: &'static str, kind: String, message: String },
}

fn bars_per_day(interval_minutes: u64) -> f64 {
    let minutes_per_day = 24.0 * 60.0;
    minutes_per_day / interval_minutes.max(1) as f64
}

fn trend_predicate(side: Side, last_price: f64, reference_ema: f64) -> bool {
    match side {
        Side::Long => last_price > reference_ema,
        Side::Short => last_price < reference_ema,
    }
}

/// Runs one instrument's full tick. Never panics and never propagates an
/// `EngineError` to the caller: every failure is converted to
/// `Outcome::Error` at this boundary so a sibling instrument's tick is
/// unaffected (spec section 4.4, "Failure semantics").
pub async fn run_instrument(
    exchange: &dyn Exchange,
    alert_sink: &dyn AlertSink,
    config: &InstrumentConfig,
) -> Outcome {
    match run_instrument_inner(exchange, alert_sink, config).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let stage = "prepare_or_gather";
            let kind = format!("{e:?}");
            alert_sink
                .send(&AlertEvent::ExecutionError {
                    symbol: config.symbol.clone(),
                    stage,
                    error_kind: kind.clone(),
                    message: e.to_string(),
                })
                .await;
            Outcome::Error { stage, kind, message: e.to_string() }
        }
    }
}

async fn run_instrument_inner(
    exchange: &dyn Exchange,
    alert_sink: &dyn AlertSink,
    config: &InstrumentConfig,
) -> Result<Outcome, EngineError> {
    // 1. Prepare: cancel stale orders, then set leverage. Ordering matters
    // (spec section 5): cancellation strictly precedes any new order.
    exchange.cancel_all_open(&config.symbol).await?;
    exchange.set_leverage(&config.symbol, config.side, config.leverage).await?;

    // 2. Gather.
    let position = exchange.get_position(&config.symbol).await?;
    let (best_bid, best_ask, last_price) = exchange.get_ticker(&config.symbol).await?;
    let candles = exchange.get_candles(&config.symbol, config.ema_interval_minutes, CANDLE_LIMIT).await?;
    let account = exchange.get_equity().await?;

    let ema_fast = match indicators::ema(&candles, EMA_FAST_PERIOD) {
        Ok(v) => Some(v),
        Err(EngineError::InsufficientData { .. }) => None,
        Err(e) => return Err(e),
    };
    let ema_slow = match indicators::ema(&candles, EMA_SLOW_PERIOD) {
        Ok(v) => Some(v),
        Err(EngineError::InsufficientData { .. }) => None,
        Err(e) => return Err(e),
    };
    let volatility = match indicators::volatility_report(
        &candles,
        ATR_PERIOD,
        BB_PERIOD,
        BB_K,
        HV_PERIOD,
        bars_per_day(config.ema_interval_minutes),
        VolatilityThresholds::default(),
    ) {
        Ok(v) => v,
        Err(EngineError::InsufficientData { needed, have }) => {
            let outcome = Outcome::Skipped { reason: format!("insufficient data for volatility: need {needed}, have {have}") };
            log_and_return(config, &position, &account, last_price, None, &outcome);
            return Ok(outcome);
        }
        Err(e) => return Err(e),
    };
    let decline = match indicators::decline_velocity(&candles) {
        Ok(v) => v,
        Err(EngineError::InsufficientData { needed, have }) => {
            let outcome = Outcome::Skipped { reason: format!("insufficient data for decline velocity: need {needed}, have {have}") };
            log_and_return(config, &position, &account, last_price, None, &outcome);
            return Ok(outcome);
        }
        Err(e) => return Err(e),
    };

    let market = MarketSnapshot { best_bid, best_ask, last_price, ema_fast, ema_slow, volatility, decline };

    if volatility.is_high {
        alert_sink
            .send(&AlertEvent::VolatilityHigh {
                symbol: config.symbol.clone(),
                atr_ratio: volatility.atr_ratio,
                bb_width_pct: volatility.bb_width_pct,
                hist_vol_pct: volatility.historical_vol_pct,
            })
            .await;
    }
    if decline.is_dangerous {
        alert_sink
            .send(&AlertEvent::DeclineVelocity {
                symbol: config.symbol.clone(),
                kind: decline.kind,
                score: decline.velocity_score,
                roc_short: decline.roc_short,
                roc_medium: decline.roc_medium,
            })
            .await;
    }

    // 3. Relevance gate: short-circuit the common "nothing to do" ticks
    // before invoking the full engine.
    if let Some(reason) = relevance_gate(config, &position, &market) {
        let outcome = Outcome::Skipped { reason: reason.clone() };
        log_and_return(config, &position, &account, last_price, None, &outcome);
        return Ok(outcome);
    }

    // 4. Decide.
    let plan = strategy::decide(config, &position, &market, &account);

    // 5 & 6. Execute, then alert.
    let outcome = execute_and_alert(exchange, alert_sink, config, &plan, &market, &account).await?;

    // 7. Log.
    log_and_return(config, &position, &account, last_price, Some(&market), &outcome);
    Ok(outcome)
}

fn relevance_gate(config: &InstrumentConfig, position: &crate::model::Position, market: &MarketSnapshot) -> Option<String> {
    let last_price = market.last_price.to_f64().unwrap_or(0.0);

    match position {
        None => {
            let trend_ok = market.ema_slow.map(|ema| trend_predicate(config.side, last_price, ema)).unwrap_or(false);
            if !trend_ok && !config.automatic_mode {
                return Some("waiting for trend".to_string());
            }
            None
        }
        Some(pos) if !pos.is_stale() => {
            let healthy_margin = pos.maintenance_margin_usd.is_zero() || as_f64_level(pos) >= 2.0;
            let trend_aligned = market.ema_fast.map(|ema| trend_predicate(pos.side, last_price, ema)).unwrap_or(false);
            let profit_trigger = pos.unrealized_pnl > Decimal::ZERO;
            if healthy_margin && trend_aligned && !profit_trigger {
                return Some("holding; nothing to do".to_string());
            }
            None
        }
        Some(_) => None,
    }
}

fn as_f64_level(pos: &crate::model::OpenPosition) -> f64 {
    pos.margin_level().to_f64().unwrap_or(f64::MAX)
}

async fn execute_and_alert(
    exchange: &dyn Exchange,
    alert_sink: &dyn AlertSink,
    config: &InstrumentConfig,
    plan: &ActionPlan,
    market: &MarketSnapshot,
    account: &Account,
) -> Result<Outcome, EngineError> {
    match plan {
        ActionPlan::NoOp { .. } => Ok(Outcome::Managed { action: plan.clone() }),
        ActionPlan::OpenPosition { side, quantity, limit_price } => {
            exchange.place_limit(&config.symbol, *side, *quantity, *limit_price, false).await?;
            emit_position_update(exchange, alert_sink, config, PositionAction::Opened, *side, *quantity, *limit_price, account).await?;
            Ok(Outcome::Managed { action: plan.clone() })
        }
        ActionPlan::AddToPosition { side, quantity, limit_price, .. } => {
            exchange.place_limit(&config.symbol, *side, *quantity, *limit_price, false).await?;
            let post = emit_position_update(exchange, alert_sink, config, PositionAction::Added, *side, *quantity, *limit_price, account)
                .await?;
            if let Some(pos) = post {
                let level = pos.margin_level().to_f64().unwrap_or(f64::MAX);
                if level < MARGIN_WARNING_LEVEL {
                    alert_sink
                        .send(&AlertEvent::MarginWarning {
                            symbol: config.symbol.clone(),
                            margin_level: level,
                            equity: account.total_equity_usd,
                            position_value_usd: pos.position_value(),
                        })
                        .await;
                }
            }
            Ok(Outcome::Managed { action: plan.clone() })
        }
        ActionPlan::ReducePosition { fraction_of_size, .. } => {
            let side = config.side.opposite();
            let limit_price = match side {
                Side::Long => market.best_bid,
                Side::Short => market.best_ask,
            };
            exchange.place_limit(&config.symbol, side, *fraction_of_size, limit_price, true).await?;
            emit_position_update(exchange, alert_sink, config, PositionAction::Reduced, side, *fraction_of_size, limit_price, account).await?;
            Ok(Outcome::Managed { action: plan.clone() })
        }
        ActionPlan::ClosePosition { .. } => {
            exchange.close_position(&config.symbol).await?;
            emit_position_update(exchange, alert_sink, config, PositionAction::Closed, config.side, Decimal::ZERO, Decimal::ZERO, account).await?;
            Ok(Outcome::Managed { action: plan.clone() })
        }
    }
}

/// Fetches the post-action position, sends the `PositionUpdate` alert, and
/// returns the fetched position so callers can inspect it further (e.g. for
/// a margin warning after an add).
async fn emit_position_update(
    exchange: &dyn Exchange,
    alert_sink: &dyn AlertSink,
    config: &InstrumentConfig,
    action: PositionAction,
    side: Side,
    qty: Decimal,
    price: Decimal,
    account: &Account,
) -> Result<crate::model::Position, EngineError> {
    let post = exchange.get_position(&config.symbol).await?;
    let (post_size, post_value) = match &post {
        Some(p) => (p.size_contracts, p.position_value()),
        None => (Decimal::ZERO, Decimal::ZERO),
    };
    let post_pct_of_equity = account.margin_usage_fraction(post_value) * Decimal::from(100);
    alert_sink
        .send(&AlertEvent::PositionUpdate {
            action,
            symbol: config.symbol.clone(),
            side,
            qty,
            price,
            post_size_contracts: post_size,
            post_value_usd: post_value,
            post_pct_of_equity,
            equity: account.total_equity_usd,
        })
        .await;
    Ok(post)
}

fn log_and_return(
    config: &InstrumentConfig,
    position: &crate::model::Position,
    account: &Account,
    last_price: Decimal,
    market: Option<&MarketSnapshot>,
    outcome: &Outcome,
) {
    let (outcome_str, action_str, reason) = match outcome {
        Outcome::Managed { action } => ("managed", action.action_name(), action_reason(action)),
        Outcome::Skipped { reason } => ("skipped", "none", reason.clone()),
        Outcome::Error { message, .. } => ("error", "none", message.clone()),
    };

    let (position_size, position_value, unrealized_pnl, margin_level) = match position {
        Some(p) => (p.size_contracts, p.position_value(), p.unrealized_pnl, p.margin_level().to_f64().unwrap_or(f64::MAX)),
        None => (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, f64::MAX),
    };

    let mut fields: Map<String, Value> = Map::new();
    fields.insert("symbol".to_string(), json!(config.symbol));
    fields.insert("outcome".to_string(), json!(outcome_str));
    fields.insert("action".to_string(), json!(action_str));
    fields.insert("reason".to_string(), json!(reason));
    fields.insert("price".to_string(), json!(last_price.to_f64().unwrap_or(0.0)));
    fields.insert("positionSizeContracts".to_string(), json!(position_size.to_f64().unwrap_or(0.0)));
    fields.insert("positionValueUsd".to_string(), json!(position_value.to_f64().unwrap_or(0.0)));
    fields.insert("equity".to_string(), json!(account.total_equity_usd.to_f64().unwrap_or(0.0)));
    fields.insert("unrealizedPnl".to_string(), json!(unrealized_pnl.to_f64().unwrap_or(0.0)));
    fields.insert("marginLevel".to_string(), json!(margin_level));
    fields.insert("volatilityHigh".to_string(), json!(market.map(|m| m.volatility.is_high).unwrap_or(false)));
    fields.insert("declineKind".to_string(), json!(market.map(|m| format!("{:?}", m.decline.kind))));
    log_outcome(fields);
}

fn action_reason(action: &ActionPlan) -> String {
    match action {
        ActionPlan::NoOp { reason } => reason.clone(),
        ActionPlan::OpenPosition { .. } => "opened".to_string(),
        ActionPlan::AddToPosition { rationale, .. } => rationale.to_string(),
        ActionPlan::ReducePosition { rationale, .. } => rationale.to_string(),
        ActionPlan::ClosePosition { rationale } => rationale.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeExchange {
        fails_on: Option<String>,
        candles: Vec<crate::model::Candle>,
        account: Account,
        cancel_called: AtomicBool,
        placed: Mutex<Vec<(Side, Decimal, Decimal)>>,
    }

    impl FakeExchange {
        fn cancel_was_called(&self) -> bool {
            self.cancel_called.load(Ordering::SeqCst)
        }
    }

    fn flat_candles(n: usize, price: f64) -> Vec<crate::model::Candle> {
        (0..n)
            .map(|i| crate::model::Candle { ts: i as u64, open: price, high: price, low: price, close: price, volume: 10.0 })
            .collect()
    }

    impl FakeExchange {
        fn new(fails_on: Option<&str>) -> Self {
            Self {
                fails_on: fails_on.map(str::to_string),
                candles: flat_candles(CANDLE_LIMIT, 100.0),
                account: Account { total_equity_usd: Decimal::from(1000), available_equity_usd: Decimal::from(1000) },
                cancel_called: AtomicBool::new(false),
                placed: Mutex::new(Vec::new()),
            }
        }

        fn should_fail(&self, symbol: &str) -> bool {
            self.fails_on.as_deref() == Some(symbol)
        }
    }

    #[async_trait]
    impl Exchange for FakeExchange {
        async fn get_position(&self, symbol: &str) -> Result<crate::model::Position, EngineError> {
            if self.should_fail(symbol) {
                return Err(EngineError::TransientIo { operation: "getPosition", symbol: symbol.to_string(), message: "boom".to_string() });
            }
            Ok(None)
        }

        async fn get_ticker(&self, _symbol: &str) -> Result<(Decimal, Decimal, Decimal), EngineError> {
            Ok((Decimal::from(99), Decimal::from(101), Decimal::from(100)))
        }

        async fn get_candles(&self, _symbol: &str, _interval_minutes: u64, _limit: usize) -> Result<Vec<crate::model::Candle>, EngineError> {
            Ok(self.candles.clone())
        }

        async fn get_equity(&self) -> Result<Account, EngineError> {
            Ok(self.account)
        }

        async fn set_leverage(&self, _symbol: &str, _side: Side, _leverage: u32) -> Result<(), EngineError> {
            Ok(())
        }

        async fn cancel_all_open(&self, _symbol: &str) -> Result<u32, EngineError> {
            self.cancel_called.store(true, Ordering::SeqCst);
            Ok(0)
        }

        async fn place_limit(&self, _symbol: &str, side: Side, qty: Decimal, limit_price: Decimal, _reduce_only: bool) -> Result<String, EngineError> {
            self.placed.lock().unwrap().push((side, qty, limit_price));
            Ok("order-1".to_string())
        }

        async fn close_position(&self, _symbol: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn test_config(symbol: &str) -> InstrumentConfig {
        InstrumentConfig {
            symbol: symbol.to_string(),
            side: Side::Long,
            automatic_mode: true,
            leverage: 10,
            ema_interval_minutes: 1,
            profit_pnl_target: Decimal::new(10, 2),
            profit_balance_threshold: Decimal::new(3, 3),
            position_ceiling_pct: Decimal::new(20, 2),
            initial_entry_pct: Decimal::new(6, 3),
            add_trigger_drop_pct: Decimal::new(5, 2),
            max_margin_pct: None,
        }
    }

    #[tokio::test]
    async fn flat_constant_price_series_does_not_open_against_its_own_slow_ema() {
        let exchange = FakeExchange::new(None);
        let config = test_config("BTCUSDT");
        let outcome = run_instrument(&exchange, &crate::alert::NullSink, &config).await;
        match outcome {
            Outcome::Managed { action: ActionPlan::NoOp { .. } } | Outcome::Skipped { .. } => {}
            other => panic!("expected a NoOp/skip on a flat series, got {other:?}"),
        }
        assert!(exchange.cancel_was_called());
        assert!(exchange.placed.lock().unwrap().is_empty());
    }

    /// Property 10: a TransientIoError for instrument A does not change the
    /// outcome computed for instrument B in the same tick.
    #[tokio::test]
    async fn instrument_failure_is_isolated() {
        let failing = FakeExchange::new(Some("AAAUSDT"));
        let healthy = FakeExchange::new(None);

        let outcome_a = run_instrument(&failing, &crate::alert::NullSink, &test_config("AAAUSDT")).await;
        let outcome_b = run_instrument(&healthy, &crate::alert::NullSink, &test_config("BBBUSDT")).await;

        assert!(matches!(outcome_a, Outcome::Error { .. }));
        assert!(!matches!(outcome_b, Outcome::Error { .. }));
    }

    #[tokio::test]
    async fn prepare_failure_aborts_before_gather() {
        struct AlwaysFailsPrepare;
        #[async_trait]
        impl Exchange for AlwaysFailsPrepare {
            async fn get_position(&self, _s: &str) -> Result<crate::model::Position, EngineError> {
                panic!("gather must not run after prepare failure");
            }
            async fn get_ticker(&self, _s: &str) -> Result<(Decimal, Decimal, Decimal), EngineError> {
                panic!("gather must not run after prepare failure");
            }
            async fn get_candles(&self, _s: &str, _i: u64, _l: usize) -> Result<Vec<crate::model::Candle>, EngineError> {
                panic!("gather must not run after prepare failure");
            }
            async fn get_equity(&self) -> Result<Account, EngineError> {
                panic!("gather must not run after prepare failure");
            }
            async fn set_leverage(&self, _s: &str, _side: Side, _l: u32) -> Result<(), EngineError> {
                Ok(())
            }
            async fn cancel_all_open(&self, symbol: &str) -> Result<u32, EngineError> {
                Err(EngineError::TransientIo { operation: "cancelAllOpen", symbol: symbol.to_string(), message: "down".to_string() })
            }
            async fn place_limit(&self, _s: &str, _side: Side, _q: Decimal, _p: Decimal, _r: bool) -> Result<String, EngineError> {
                unreachable!()
            }
            async fn close_position(&self, _s: &str) -> Result<(), EngineError> {
                unreachable!()
            }
        }

        let outcome = run_instrument(&AlwaysFailsPrepare, &crate::alert::NullSink, &test_config("BTCUSDT")).await;
        assert!(matches!(outcome, Outcome::Error { .. }));
    }
}
