//! The strategy engine: a pure decision function over (config, position,
//! market, account). See spec section 4.3 for the fixed branch-priority
//! order this implements.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::model::{Account, ActionPlan, DeclineKind, InstrumentConfig, MarketSnapshot, OpenPosition, Position, Side};

const MARGIN_CRITICAL_LEVEL: f64 = 2.0;
const CLOSE_FRACTION_THRESHOLD: f64 = 0.10;
const REDUCE_FRACTION_THRESHOLD: f64 = 0.075;
const CEILING_SAFE_RELAXATION: f64 = 1.5;

fn dec(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
}

fn as_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Entry point: the single pure decision function spec.md names `decide`.
pub fn decide(
    config: &InstrumentConfig,
    position: &Position,
    market: &MarketSnapshot,
    account: &Account,
) -> ActionPlan {
    if account.total_equity_usd <= Decimal::ZERO {
        return ActionPlan::no_op("account has no equity");
    }

    // Stale-data guard: a non-zero size with zero notional is treated as absent.
    let position = position.as_ref().filter(|p| !p.is_stale());

    if let Some(pos) = position {
        if as_f64(pos.margin_level()) < MARGIN_CRITICAL_LEVEL {
            return margin_critical_add(config, pos, market, account);
        }

        if pos.unrealized_pnl > Decimal::ZERO {
            return profitable_position(config, pos, account);
        }

        if let Some(action) = add_to_losing_position(config, pos, market, account) {
            return action;
        }

        return ActionPlan::no_op("holding; no applicable add/reduce/close rule");
    }

    if config.automatic_mode {
        return open_from_flat(config, market, account);
    }

    ActionPlan::no_op("no applicable rule")
}

/// Branch 1: liquidation-protection override. Ignores volatility/decline.
fn margin_critical_add(
    config: &InstrumentConfig,
    pos: &OpenPosition,
    market: &MarketSnapshot,
    account: &Account,
) -> ActionPlan {
    let Some(qty) = add_quantity(pos, market, account, config, true) else {
        return ActionPlan::no_op("margin cap reached");
    };
    ActionPlan::AddToPosition {
        side: pos.side,
        quantity: qty,
        limit_price: add_limit_price(pos.side, market),
        rationale: "liquidation protection",
    }
}

/// Branch 2: profit reduce/close ladder.
fn profitable_position(config: &InstrumentConfig, pos: &OpenPosition, account: &Account) -> ActionPlan {
    let position_fraction = as_f64(account.margin_usage_fraction(pos.position_margin_usd));
    let pnl_fraction_of_margin = if pos.position_margin_usd.is_zero() {
        0.0
    } else {
        as_f64(pos.unrealized_pnl / pos.position_margin_usd)
    };
    let passes_close_threshold =
        pnl_fraction_of_margin >= as_f64(config.profit_pnl_target) && pnl_fraction_of_margin_meets_balance(pos, account, config);

    if position_fraction > CLOSE_FRACTION_THRESHOLD && passes_close_threshold {
        return ActionPlan::ReducePosition {
            fraction_of_size: dec(0.5),
            rationale: "large profitable position; half-close",
        };
    }
    if position_fraction > REDUCE_FRACTION_THRESHOLD {
        return ActionPlan::ReducePosition {
            fraction_of_size: dec(0.33),
            rationale: "profitable position above reduce threshold",
        };
    }
    if pnl_fraction_of_margin >= as_f64(config.profit_pnl_target) {
        if pnl_fraction_of_margin_meets_balance(pos, account, config) {
            return ActionPlan::ClosePosition {
                rationale: "profit target and balance threshold met",
            };
        }
        return ActionPlan::no_op("profit below balance threshold");
    }

    ActionPlan::no_op("profitable, below reduce/close thresholds")
}

fn pnl_fraction_of_margin_meets_balance(pos: &OpenPosition, account: &Account, config: &InstrumentConfig) -> bool {
    pos.unrealized_pnl >= config.profit_balance_threshold * account.total_equity_usd
}

/// Branch 3: martingale add to a losing/undersized position. Returns `None`
/// when neither gating predicate holds (caller falls through to a generic
/// NoOp), distinct from the `NoOp("margin cap reached")` case which IS the
/// branch's outcome.
fn add_to_losing_position(
    config: &InstrumentConfig,
    pos: &OpenPosition,
    market: &MarketSnapshot,
    account: &Account,
) -> Option<ActionPlan> {
    let Some(ema_fast) = market.ema_fast else {
        return Some(ActionPlan::no_op("ema_fast unavailable"));
    };
    let last_price = as_f64(market.last_price);

    let trend_against = match pos.side {
        Side::Long => last_price < ema_fast,
        Side::Short => last_price > ema_fast,
    };
    if !trend_against {
        return None;
    }

    let entry = as_f64(pos.entry_price);
    let drop_fraction = match pos.side {
        Side::Long => (entry - last_price) / entry,
        Side::Short => (last_price - entry) / entry,
    };
    if entry <= 0.0 || drop_fraction < as_f64(config.add_trigger_drop_pct) {
        return None;
    }

    let safety_ok = !market.volatility.is_high && !market.decline.is_dangerous;
    if !safety_ok {
        return Some(ActionPlan::no_op("volatility high or decline dangerous; add blocked"));
    }

    match add_quantity(pos, market, account, config, false) {
        Some(qty) => Some(ActionPlan::AddToPosition {
            side: pos.side,
            quantity: qty,
            limit_price: add_limit_price(pos.side, market),
            rationale: "martingale average-down",
        }),
        None => Some(ActionPlan::no_op("margin cap reached")),
    }
}

/// The martingale add-sizing rule plus ceiling/taper logic shared by
/// branches 1 and 3. `ignore_ceiling` is true for the margin-critical
/// override, which sizes by the same formula but is never tapered away:
/// liquidation protection must not be blocked by a margin cap.
fn add_quantity(
    pos: &OpenPosition,
    market: &MarketSnapshot,
    account: &Account,
    config: &InstrumentConfig,
    ignore_ceiling: bool,
) -> Option<Decimal> {
    let position_value = pos.position_value();
    if position_value.is_zero() {
        return None;
    }
    let loss_fraction = (pos.unrealized_pnl.abs() / position_value).max(config.add_trigger_drop_pct);
    let base_qty = (position_value * Decimal::from(pos.leverage) * loss_fraction) / market.last_price;

    if ignore_ceiling {
        return Some(base_qty);
    }

    let added_notional = base_qty * market.last_price;
    let added_margin = if pos.leverage == 0 {
        Decimal::ZERO
    } else {
        added_notional / Decimal::from(pos.leverage)
    };
    let projected_margin = pos.position_margin_usd + added_margin;
    let projected_fraction = account.margin_usage_fraction(projected_margin);

    let mut ceiling = config.position_ceiling_pct;
    if market.decline.kind == DeclineKind::Slow {
        ceiling *= dec(CEILING_SAFE_RELAXATION);
    }

    if projected_fraction <= ceiling {
        return Some(base_qty);
    }

    match config.max_margin_pct {
        Some(max_margin_pct) => {
            let current_usage = account.margin_usage_fraction(pos.position_margin_usd);
            let headroom = (max_margin_pct - current_usage) / max_margin_pct;
            let factor = headroom.max(Decimal::ZERO);
            let factor = factor * factor;
            if factor.is_zero() {
                None
            } else {
                Some(base_qty * factor)
            }
        }
        None => None,
    }
}

fn add_limit_price(side: Side, market: &MarketSnapshot) -> Decimal {
    match side {
        Side::Long => market.best_bid,
        Side::Short => market.best_ask,
    }
}

/// Branch 4: open from flat.
fn open_from_flat(config: &InstrumentConfig, market: &MarketSnapshot, account: &Account) -> ActionPlan {
    let Some(ema_slow) = market.ema_slow else {
        return ActionPlan::no_op("ema_slow unavailable");
    };
    let last_price = as_f64(market.last_price);

    let trend_ok = match config.side {
        Side::Long => last_price > ema_slow,
        Side::Short => last_price < ema_slow,
    };
    if !trend_ok {
        let reason = match config.side {
            Side::Long => "price below slow EMA; waiting for long trend",
            Side::Short => "price above slow EMA; waiting for short trend",
        };
        return ActionPlan::no_op(reason);
    }

    if market.volatility.is_high {
        return ActionPlan::no_op("volatility too high to open");
    }
    if market.decline.is_dangerous {
        return ActionPlan::no_op("decline velocity too dangerous to open");
    }

    let quantity = (config.initial_entry_pct * account.total_equity_usd * Decimal::from(config.leverage))
        / market.last_price;
    ActionPlan::OpenPosition {
        side: config.side,
        quantity,
        limit_price: add_limit_price(config.side, market),
    }
}
