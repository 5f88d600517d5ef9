//! Technical indicators and the decline-velocity classifier.
//!
//! Pure, side-effect-free functions over a candle slice ordered
//! oldest-to-newest, per spec section 4.2. Each function fails with
//! [`EngineError::InsufficientData`] rather than panicking when the input is
//! too short; the Workflow treats that as a skip condition.

use crate::error::EngineError;
use crate::model::{Candle, DeclineKind, DeclineReport, VolatilityReport};

/// Thresholds for [`volatility_report`]'s `is_high` flag. Defaults are part
/// of the contract (spec section 4.2) but are kept configurable.
#[derive(Debug, Clone, Copy)]
pub struct VolatilityThresholds {
    pub atr_ratio: f64,
    pub bb_width_pct: f64,
    pub historical_vol_pct: f64,
}

impl Default for VolatilityThresholds {
    fn default() -> Self {
        Self {
            atr_ratio: 1.5,
            bb_width_pct: 8.0,
            historical_vol_pct: 5.0,
        }
    }
}

fn require_bars(candles: &[Candle], needed: usize) -> Result<(), EngineError> {
    if candles.len() < needed {
        return Err(EngineError::InsufficientData {
            needed,
            have: candles.len(),
        });
    }
    Ok(())
}

fn sma(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_stddev(values: &[f64], mean: f64) -> f64 {
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Standard exponential moving average over the closes of `candles`.
/// `ema[0] = close[0]`, `ema[t] = alpha*close[t] + (1-alpha)*ema[t-1]`,
/// `alpha = 2 / (period + 1)`. Returns `ema[last]`.
pub fn ema(candles: &[Candle], period: usize) -> Result<f64, EngineError> {
    require_bars(candles, period)?;
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut value = candles[0].close;
    for c in &candles[1..] {
        value = alpha * c.close + (1.0 - alpha) * value;
    }
    Ok(value)
}

/// Average True Range over the last `period` bars (default period 14).
pub fn atr(candles: &[Candle], period: usize) -> Result<f64, EngineError> {
    require_bars(candles, period + 1)?;
    let window = &candles[candles.len() - period - 1..];
    let mut trs = Vec::with_capacity(period);
    for i in 1..window.len() {
        let (h, l, prev_c) = (window[i].high, window[i].low, window[i - 1].close);
        let tr = (h - l).max((h - prev_c).abs()).max((l - prev_c).abs());
        trs.push(tr);
    }
    Ok(sma(&trs))
}

/// ATR expressed as a ratio to its own rolling mean (needs `period * 2 + 1`
/// bars: one window to compute the current ATR, another to compute the mean
/// of trailing ATRs it is compared against).
pub fn atr_ratio(candles: &[Candle], period: usize) -> Result<f64, EngineError> {
    require_bars(candles, period * 2 + 1)?;
    let current = atr(candles, period)?;
    let mut trailing = Vec::with_capacity(period);
    for end in (candles.len() - period)..candles.len() {
        let window = &candles[..=end];
        trailing.push(atr(window, period)?);
    }
    let mean = sma(&trailing);
    if mean == 0.0 {
        return Ok(0.0);
    }
    Ok(current / mean)
}

/// Bollinger band width as a percentage of the middle band:
/// `(upper - lower) / middle * 100`.
pub fn bollinger_width_pct(candles: &[Candle], period: usize, k: f64) -> Result<f64, EngineError> {
    require_bars(candles, period)?;
    let closes: Vec<f64> = candles[candles.len() - period..]
        .iter()
        .map(|c| c.close)
        .collect();
    let middle = sma(&closes);
    let sigma = population_stddev(&closes, middle);
    if middle == 0.0 {
        return Ok(0.0);
    }
    let (upper, lower) = (middle + k * sigma, middle - k * sigma);
    Ok((upper - lower) / middle * 100.0)
}

/// Historical volatility: stddev of log returns, annualized-to-daily by
/// `bars_per_day`, expressed as a percentage.
pub fn historical_volatility_pct(
    candles: &[Candle],
    period: usize,
    bars_per_day: f64,
) -> Result<f64, EngineError> {
    require_bars(candles, period + 1)?;
    let window = &candles[candles.len() - period - 1..];
    let mut log_returns = Vec::with_capacity(period);
    for i in 1..window.len() {
        let (prev, cur) = (window[i - 1].close, window[i].close);
        if prev > 0.0 && cur > 0.0 {
            log_returns.push((cur / prev).ln());
        }
    }
    if log_returns.is_empty() {
        return Ok(0.0);
    }
    let mean = sma(&log_returns);
    let sigma = population_stddev(&log_returns, mean);
    Ok(sigma * bars_per_day.sqrt() * 100.0)
}

/// Bundles the above into the full [`VolatilityReport`].
pub fn volatility_report(
    candles: &[Candle],
    atr_period: usize,
    bb_period: usize,
    bb_k: f64,
    hv_period: usize,
    bars_per_day: f64,
    thresholds: VolatilityThresholds,
) -> Result<VolatilityReport, EngineError> {
    let atr_value = atr(candles, atr_period)?;
    let ratio = atr_ratio(candles, atr_period)?;
    let bb_width = bollinger_width_pct(candles, bb_period, bb_k)?;
    let hv = historical_volatility_pct(candles, hv_period, bars_per_day)?;
    let is_high = ratio > thresholds.atr_ratio
        || bb_width > thresholds.bb_width_pct
        || hv > thresholds.historical_vol_pct;
    Ok(VolatilityReport {
        atr: atr_value,
        atr_ratio: ratio,
        bb_width_pct: bb_width,
        historical_vol_pct: hv,
        is_high,
    })
}

fn roc(candles: &[Candle], n: usize) -> Option<f64> {
    if candles.len() < n + 1 {
        return None;
    }
    let last = candles[candles.len() - 1].close;
    let ago = candles[candles.len() - 1 - n].close;
    if ago == 0.0 {
        return None;
    }
    Some((last - ago) / ago)
}

fn mean_volume(candles: &[Candle], n: usize) -> f64 {
    let window = &candles[candles.len() - n..];
    window.iter().map(|c| c.volume).sum::<f64>() / n as f64
}

/// Multi-window rate-of-change decline-velocity classifier (spec section 4.2).
/// Requires at least 31 bars (30-bar ROC plus the anchor bar).
pub fn decline_velocity(candles: &[Candle]) -> Result<DeclineReport, EngineError> {
    require_bars(candles, 31)?;

    let roc_short = roc(candles, 5).unwrap_or(0.0);
    let roc_medium = roc(candles, 15).unwrap_or(0.0);
    let roc_long = roc(candles, 30).unwrap_or(0.0);

    let smoothness = if roc_short < 0.0 && roc_medium < 0.0 && roc_medium != 0.0 {
        roc_short / roc_medium
    } else {
        1.0
    };

    let volume_ratio = {
        let recent = mean_volume(candles, 5);
        let baseline = mean_volume(candles, 30);
        if baseline == 0.0 {
            1.0
        } else {
            recent / baseline
        }
    };

    let severity = if roc_short < 0.0 {
        (roc_short.abs() * 2000.0).min(100.0)
    } else {
        0.0
    };
    let acceleration = if smoothness > 1.0 {
        50.0 * smoothness.clamp(1.0, 4.0)
    } else {
        0.0
    };
    let volume = if volume_ratio > 1.0 {
        ((volume_ratio - 1.0) * 30.0).min(30.0)
    } else {
        0.0
    };
    let velocity_score = (severity + acceleration + volume).min(100.0);

    let kind = if velocity_score < 20.0 {
        DeclineKind::Slow
    } else if velocity_score < 40.0 {
        DeclineKind::Moderate
    } else if velocity_score < 70.0 {
        DeclineKind::Fast
    } else {
        DeclineKind::Crash
    };
    let is_dangerous = matches!(kind, DeclineKind::Fast | DeclineKind::Crash);
    let is_safe = matches!(kind, DeclineKind::Slow);

    Ok(DeclineReport {
        roc_short,
        roc_medium,
        roc_long,
        smoothness,
        volume_ratio,
        velocity_score,
        kind,
        is_dangerous,
        is_safe,
    })
}
