//! Core data model: instrument config, position, market snapshot, and the
//! engine's action plan. Mirrors the entities in spec section 3.

use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

/// Immutable per-tick configuration for one traded instrument.
#[derive(Debug, Clone)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub side: Side,
    pub automatic_mode: bool,
    pub leverage: u32,
    pub ema_interval_minutes: u64,
    pub profit_pnl_target: Decimal,
    pub profit_balance_threshold: Decimal,
    pub position_ceiling_pct: Decimal,
    pub initial_entry_pct: Decimal,
    pub add_trigger_drop_pct: Decimal,
    pub max_margin_pct: Option<Decimal>,
}

/// A candle, oldest-to-newest ordering is the caller's responsibility.
#[derive(Debug, Clone, Copy)]
pub struct Candle {
    pub ts: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub side: Side,
    pub size_contracts: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
    pub position_margin_usd: Decimal,
    pub liquidation_price: Option<Decimal>,
    /// Maintenance margin, as reported by (or derived from) the exchange.
    /// Used by the strategy engine's margin-critical override.
    pub maintenance_margin_usd: Decimal,
}

pub type Position = Option<OpenPosition>;

impl OpenPosition {
    /// Notional value of the position at its entry price.
    pub fn position_value(&self) -> Decimal {
        self.size_contracts * self.entry_price
    }

    /// Margin headroom proxy: higher is safer. See spec section 4.3 branch 1.
    pub fn margin_level(&self) -> Decimal {
        if self.maintenance_margin_usd.is_zero() {
            return Decimal::MAX;
        }
        (self.position_margin_usd + self.unrealized_pnl) / self.maintenance_margin_usd
    }

    /// Stale-data guard: a non-zero size with zero notional value is treated
    /// as absent by the engine (spec section 4.3, "tie-breaks and edge cases").
    pub fn is_stale(&self) -> bool {
        self.position_value().is_zero()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VolatilityReport {
    pub atr: f64,
    pub atr_ratio: f64,
    pub bb_width_pct: f64,
    pub historical_vol_pct: f64,
    pub is_high: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineKind {
    Slow,
    Moderate,
    Fast,
    Crash,
}

#[derive(Debug, Clone, Copy)]
pub struct DeclineReport {
    pub roc_short: f64,
    pub roc_medium: f64,
    pub roc_long: f64,
    pub smoothness: f64,
    pub volume_ratio: f64,
    pub velocity_score: f64,
    pub kind: DeclineKind,
    pub is_dangerous: bool,
    pub is_safe: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MarketSnapshot {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub last_price: Decimal,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub volatility: VolatilityReport,
    pub decline: DeclineReport,
}

#[derive(Debug, Clone, Copy)]
pub struct Account {
    pub total_equity_usd: Decimal,
    pub available_equity_usd: Decimal,
}

impl Account {
    pub fn margin_usage_fraction(&self, position_margin_usd: Decimal) -> Decimal {
        if self.total_equity_usd.is_zero() {
            return Decimal::ZERO;
        }
        position_margin_usd / self.total_equity_usd
    }
}

/// The engine's output: exactly one of these per tick per instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPlan {
    NoOp {
        reason: String,
    },
    OpenPosition {
        side: Side,
        quantity: Decimal,
        limit_price: Decimal,
    },
    AddToPosition {
        side: Side,
        quantity: Decimal,
        limit_price: Decimal,
        rationale: &'static str,
    },
    ReducePosition {
        fraction_of_size: Decimal,
        rationale: &'static str,
    },
    ClosePosition {
        rationale: &'static str,
    },
}

impl ActionPlan {
    pub fn no_op(reason: impl Into<String>) -> Self {
        ActionPlan::NoOp { reason: reason.into() }
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            ActionPlan::NoOp { .. } => "none",
            ActionPlan::OpenPosition { .. } => "open",
            ActionPlan::AddToPosition { .. } => "add",
            ActionPlan::ReducePosition { .. } => "reduce",
            ActionPlan::ClosePosition { .. } => "close",
        }
    }
}
