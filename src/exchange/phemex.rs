//! Concrete `Exchange` implementation for a Phemex-shaped REST API (spec
//! section 6): `x-phemex-access-token` / `-request-expiry` / `-request-signature`
//! headers, `"ep"`-scaled integer prices. Scaled values never cross this
//! module's boundary — every public method returns plain `Decimal`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::ratelimit::RateLimiter;
use super::retry::{retry_async, RetryConfig};
use super::signing::{canonical_query, sign_request};
use super::Exchange;
use crate::error::EngineError;
use crate::model::{Account, Candle, OpenPosition, Position, Side};

/// Phemex's price scale: wire prices are integers scaled by 10^4 ("ep").
const PRICE_SCALE: i64 = 10_000;
const EXPIRY_WINDOW_SECS: u64 = 60;

pub struct PhemexAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    rate_limiter: RateLimiter,
    retry_config: RetryConfig,
}

impl PhemexAdapter {
    pub fn new(
        base_url: String,
        api_key: String,
        api_secret: String,
        rate_limit_per_sec: usize,
        http_timeout_secs: u64,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(http_timeout_secs))
            .build()
            .map_err(|e| EngineError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key,
            api_secret,
            rate_limiter: RateLimiter::per_second(rate_limit_per_sec),
            retry_config: RetryConfig::default(),
        })
    }

    fn expiry(&self) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        (now + EXPIRY_WINDOW_SECS).to_string()
    }

    fn classify_status(status: reqwest::StatusCode, operation: &'static str, symbol: &str, body: &str) -> EngineError {
        let code = status.as_u16();
        if code == 401 || code == 403 {
            EngineError::Auth { operation, symbol: symbol.to_string(), message: body.to_string() }
        } else if code == 408 || code == 429 || (500..600).contains(&code) {
            EngineError::TransientIo { operation, symbol: symbol.to_string(), message: format!("HTTP {code}: {body}") }
        } else {
            EngineError::Validation {
                operation,
                symbol: symbol.to_string(),
                kind: crate::error::ValidationKind::InvalidSymbol,
                message: format!("HTTP {code}: {body}"),
            }
        }
    }

    fn network_error(e: &reqwest::Error, operation: &'static str, symbol: &str) -> EngineError {
        EngineError::TransientIo { operation, symbol: symbol.to_string(), message: e.to_string() }
    }

    /// Performs one signed GET, retried by the adapter's retry policy.
    async fn signed_get(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
        operation: &'static str,
        symbol: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let query = canonical_query(params);
        retry_async(&self.retry_config, operation, || async {
            self.rate_limiter.acquire().await;
            let expiry = self.expiry();
            let signature = sign_request(&self.api_key, &expiry, &query, "", &self.api_secret)?;
            let url = if query.is_empty() { format!("{}{}", self.base_url, path) } else { format!("{}{}?{}", self.base_url, path, query) };
            let response = self
                .client
                .get(&url)
                .header("x-phemex-access-token", &self.api_key)
                .header("x-phemex-request-expiry", &expiry)
                .header("x-phemex-request-signature", &signature)
                .send()
                .await
                .map_err(|e| Self::network_error(&e, operation, symbol))?;
            let status = response.status();
            let text = response.text().await.map_err(|e| Self::network_error(&e, operation, symbol))?;
            if !status.is_success() {
                return Err(Self::classify_status(status, operation, symbol, &text));
            }
            serde_json::from_str(&text).map_err(|e| EngineError::TransientIo {
                operation,
                symbol: symbol.to_string(),
                message: format!("malformed response body: {e}"),
            })
        })
        .await
    }

    /// Performs one signed POST with a JSON body, retried by the adapter's
    /// retry policy.
    async fn signed_post(
        &self,
        path: &str,
        body: &serde_json::Value,
        operation: &'static str,
        symbol: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let body_str = serde_json::to_string(body).unwrap_or_default();
        retry_async(&self.retry_config, operation, || async {
            self.rate_limiter.acquire().await;
            let expiry = self.expiry();
            let signature = sign_request(&self.api_key, &expiry, "", &body_str, &self.api_secret)?;
            let url = format!("{}{}", self.base_url, path);
            let response = self
                .client
                .post(&url)
                .header("x-phemex-access-token", &self.api_key)
                .header("x-phemex-request-expiry", &expiry)
                .header("x-phemex-request-signature", &signature)
                .header("content-type", "application/json")
                .body(body_str.clone())
                .send()
                .await
                .map_err(|e| Self::network_error(&e, operation, symbol))?;
            let status = response.status();
            let text = response.text().await.map_err(|e| Self::network_error(&e, operation, symbol))?;
            if !status.is_success() {
                return Err(Self::classify_status(status, operation, symbol, &text));
            }
            serde_json::from_str(&text).map_err(|e| EngineError::TransientIo {
                operation,
                symbol: symbol.to_string(),
                message: format!("malformed response body: {e}"),
            })
        })
        .await
    }
}

fn ep_to_decimal(ep: i64) -> Decimal {
    Decimal::from(ep) / Decimal::from(PRICE_SCALE)
}

fn decimal_to_ep(value: Decimal) -> i64 {
    (value * Decimal::from(PRICE_SCALE)).to_i64().unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    side: String,
    size: f64,
    #[serde(rename = "avgEntryPriceEp")]
    avg_entry_price_ep: i64,
    leverage: u32,
    #[serde(rename = "unrealisedPnl")]
    unrealised_pnl: f64,
    #[serde(rename = "positionMarginUsd")]
    position_margin_usd: f64,
    #[serde(rename = "maintMarginUsd")]
    maint_margin_usd: f64,
    #[serde(rename = "liquidationPriceEp")]
    liquidation_price_ep: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireTicker {
    #[serde(rename = "bidEp")]
    bid_ep: i64,
    #[serde(rename = "askEp")]
    ask_ep: i64,
    #[serde(rename = "lastEp")]
    last_ep: i64,
}

#[derive(Debug, Deserialize)]
struct WireCandle {
    timestamp: u64,
    #[serde(rename = "openEp")]
    open_ep: i64,
    #[serde(rename = "highEp")]
    high_ep: i64,
    #[serde(rename = "lowEp")]
    low_ep: i64,
    #[serde(rename = "closeEp")]
    close_ep: i64,
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    #[serde(rename = "totalEquityUsd")]
    total_equity_usd: f64,
    #[serde(rename = "availableEquityUsd")]
    available_equity_usd: f64,
}

fn side_to_wire(side: Side) -> &'static str {
    match side {
        Side::Long => "Buy",
        Side::Short => "Sell",
    }
}

fn wire_to_side(s: &str) -> Side {
    if s.eq_ignore_ascii_case("sell") || s.eq_ignore_ascii_case("short") {
        Side::Short
    } else {
        Side::Long
    }
}

#[async_trait]
impl Exchange for PhemexAdapter {
    async fn get_position(&self, symbol: &str) -> Result<Position, EngineError> {
        let params = vec![("symbol", symbol.to_string())];
        let value = self.signed_get("/accounts/positions", params, "getPosition", symbol).await?;
        let Some(data) = value.get("data") else {
            return Ok(None);
        };
        if data.is_null() {
            return Ok(None);
        }
        let wire: WirePosition = serde_json::from_value(data.clone()).map_err(|e| EngineError::TransientIo {
            operation: "getPosition",
            symbol: symbol.to_string(),
            message: format!("malformed position payload: {e}"),
        })?;
        if wire.size == 0.0 {
            return Ok(None);
        }
        Ok(Some(OpenPosition {
            side: wire_to_side(&wire.side),
            size_contracts: Decimal::from_f64(wire.size).unwrap_or(Decimal::ZERO),
            entry_price: ep_to_decimal(wire.avg_entry_price_ep),
            leverage: wire.leverage,
            unrealized_pnl: Decimal::from_f64(wire.unrealised_pnl).unwrap_or(Decimal::ZERO),
            position_margin_usd: Decimal::from_f64(wire.position_margin_usd).unwrap_or(Decimal::ZERO),
            liquidation_price: wire.liquidation_price_ep.map(ep_to_decimal),
            maintenance_margin_usd: Decimal::from_f64(wire.maint_margin_usd).unwrap_or(Decimal::ZERO),
        }))
    }

    async fn get_ticker(&self, symbol: &str) -> Result<(Decimal, Decimal, Decimal), EngineError> {
        let params = vec![("symbol", symbol.to_string())];
        let value = self.signed_get("/md/ticker/24hr", params, "getTicker", symbol).await?;
        let wire: WireTicker = serde_json::from_value(value.get("data").cloned().unwrap_or_default()).map_err(|e| {
            EngineError::TransientIo { operation: "getTicker", symbol: symbol.to_string(), message: format!("malformed ticker payload: {e}") }
        })?;
        Ok((ep_to_decimal(wire.bid_ep), ep_to_decimal(wire.ask_ep), ep_to_decimal(wire.last_ep)))
    }

    async fn get_candles(&self, symbol: &str, interval_minutes: u64, limit: usize) -> Result<Vec<Candle>, EngineError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("resolution", (interval_minutes * 60).to_string()),
            ("limit", limit.to_string()),
        ];
        let value = self.signed_get("/md/kline", params, "getCandles", symbol).await?;
        let rows: Vec<WireCandle> = serde_json::from_value(value.get("data").cloned().unwrap_or_default()).map_err(|e| {
            EngineError::TransientIo { operation: "getCandles", symbol: symbol.to_string(), message: format!("malformed candle payload: {e}") }
        })?;
        Ok(rows
            .into_iter()
            .map(|c| Candle {
                ts: c.timestamp,
                open: ep_to_decimal(c.open_ep).to_f64().unwrap_or(0.0),
                high: ep_to_decimal(c.high_ep).to_f64().unwrap_or(0.0),
                low: ep_to_decimal(c.low_ep).to_f64().unwrap_or(0.0),
                close: ep_to_decimal(c.close_ep).to_f64().unwrap_or(0.0),
                volume: c.volume,
            })
            .collect())
    }

    async fn get_equity(&self) -> Result<Account, EngineError> {
        let value = self.signed_get("/accounts/accountPositions", vec![], "getEquity", "*").await?;
        let wire: WireAccount = serde_json::from_value(value.get("data").cloned().unwrap_or_default()).map_err(|e| {
            EngineError::TransientIo { operation: "getEquity", symbol: "*".to_string(), message: format!("malformed account payload: {e}") }
        })?;
        Ok(Account {
            total_equity_usd: Decimal::from_f64(wire.total_equity_usd).unwrap_or(Decimal::ZERO),
            available_equity_usd: Decimal::from_f64(wire.available_equity_usd).unwrap_or(Decimal::ZERO),
        })
    }

    async fn set_leverage(&self, symbol: &str, side: Side, leverage: u32) -> Result<(), EngineError> {
        if leverage == 0 {
            return Err(EngineError::Validation {
                operation: "setLeverage",
                symbol: symbol.to_string(),
                kind: crate::error::ValidationKind::InvalidLeverage,
                message: "leverage must be positive".to_string(),
            });
        }
        let body = serde_json::json!({
            "symbol": symbol,
            "side": side_to_wire(side),
            "leverage": leverage,
        });
        self.signed_post("/positions/leverage", &body, "setLeverage", symbol).await?;
        Ok(())
    }

    async fn cancel_all_open(&self, symbol: &str) -> Result<u32, EngineError> {
        let body = serde_json::json!({ "symbol": symbol });
        let value = self.signed_post("/orders/cancelAll", &body, "cancelAllOpen", symbol).await?;
        Ok(value.get("data").and_then(|d| d.get("cancelledCount")).and_then(|c| c.as_u64()).unwrap_or(0) as u32)
    }

    async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        limit_price: Decimal,
        reduce_only: bool,
    ) -> Result<String, EngineError> {
        if qty <= Decimal::ZERO {
            return Err(EngineError::Validation {
                operation: "placeLimit",
                symbol: symbol.to_string(),
                kind: crate::error::ValidationKind::InvalidQty,
                message: "quantity must be positive".to_string(),
            });
        }
        if limit_price <= Decimal::ZERO {
            return Err(EngineError::Validation {
                operation: "placeLimit",
                symbol: symbol.to_string(),
                kind: crate::error::ValidationKind::InvalidPrice,
                message: "limit price must be positive".to_string(),
            });
        }
        let body = serde_json::json!({
            "symbol": symbol,
            "side": side_to_wire(side),
            "ordType": "Limit",
            "qty": qty.to_f64().unwrap_or(0.0),
            "priceEp": decimal_to_ep(limit_price),
            "reduceOnly": reduce_only,
        });
        let value = self.signed_post("/orders", &body, "placeLimit", symbol).await?;
        value
            .get("data")
            .and_then(|d| d.get("orderID"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| EngineError::TransientIo {
                operation: "placeLimit",
                symbol: symbol.to_string(),
                message: "response missing orderID".to_string(),
            })
    }

    async fn close_position(&self, symbol: &str) -> Result<(), EngineError> {
        let body = serde_json::json!({ "symbol": symbol, "ordType": "Market", "closeOnTrigger": true });
        self.signed_post("/positions/close", &body, "closePosition", symbol).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ep_round_trips_through_scale_factor() {
        let price = Decimal::new(503_250, 2); // 5032.50
        let ep = decimal_to_ep(price);
        assert_eq!(ep, 50_325_000);
        assert_eq!(ep_to_decimal(ep), price);
    }

    #[test]
    fn wire_side_round_trips() {
        assert_eq!(wire_to_side(side_to_wire(Side::Long)), Side::Long);
        assert_eq!(wire_to_side(side_to_wire(Side::Short)), Side::Short);
    }
}
