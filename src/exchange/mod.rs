//! The Exchange Adapter: a signed HTTP client abstraction over one exchange.
//! See spec section 4.1. `PhemexAdapter` in `phemex.rs` is the concrete
//! implementation; `Exchange` is the trait the Strategy/Workflow layers
//! depend on, so tests can substitute a fake.

pub mod phemex;
pub mod ratelimit;
pub mod retry;
pub mod signing;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::indicators;
use crate::model::{Account, Candle, Position, Side};

pub use phemex::PhemexAdapter;

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_position(&self, symbol: &str) -> Result<Position, EngineError>;

    /// Returns `(best_bid, best_ask, last_price)`.
    async fn get_ticker(&self, symbol: &str) -> Result<(Decimal, Decimal, Decimal), EngineError>;

    /// Candles ordered oldest-to-newest.
    async fn get_candles(&self, symbol: &str, interval_minutes: u64, limit: usize) -> Result<Vec<Candle>, EngineError>;

    async fn get_equity(&self) -> Result<Account, EngineError>;

    async fn set_leverage(&self, symbol: &str, side: Side, leverage: u32) -> Result<(), EngineError>;

    /// Returns the number of orders cancelled.
    async fn cancel_all_open(&self, symbol: &str) -> Result<u32, EngineError>;

    /// Returns the exchange order id.
    async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        limit_price: Decimal,
        reduce_only: bool,
    ) -> Result<String, EngineError>;

    async fn close_position(&self, symbol: &str) -> Result<(), EngineError>;

    /// Convenience: fetches `period * 3` recent candles and computes an EMA
    /// (spec section 4.1's `getEma`).
    async fn get_ema(&self, symbol: &str, period: usize, interval_minutes: u64) -> Result<f64, EngineError> {
        let candles = self.get_candles(symbol, interval_minutes, period * 3).await?;
        indicators::ema(&candles, period)
    }
}
