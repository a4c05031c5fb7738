//! Stateless volatility index calculators.
//!
//! All functions return `None` when the input is too short or contains
//! non-positive prices; they never panic on market data.

use serde::{Deserialize, Serialize};

use crate::error::{RiskError, RiskResult};

/// Volatility index flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexType {
    /// Average true range, in price units.
    Atr,
    /// Standard deviation of simple returns, in percent.
    StdDev,
    /// Annualised log-return volatility, in percent.
    RealizedVol,
    /// Supplied by an options feed; never computed here.
    ImpliedVol,
}

/// One OHLC bar (open is not needed).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Parameters for [`compute_index`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexParams {
    pub atr_period: usize,
    pub periods_per_year: f64,
}

impl Default for IndexParams {
    /// 14-bar ATR; daily bars on a 365-day crypto calendar.
    fn default() -> Self {
        Self {
            atr_period: 14,
            periods_per_year: 365.0,
        }
    }
}

/// True range of `candle` given the previous close.
pub fn true_range(candle: &Candle, prev_close: Option<f64>) -> f64 {
    let hl = candle.high - candle.low;
    match prev_close {
        Some(pc) => hl.max((candle.high - pc).abs()).max((candle.low - pc).abs()),
        None => hl,
    }
}

/// Wilder's average true range over `period` bars.
///
/// Seeds with the mean of the first `period` true ranges, then smooths
/// `atr = (atr * (period - 1) + tr) / period` over the rest.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let ranges: Vec<f64> = candles
        .iter()
        .enumerate()
        .map(|(i, c)| true_range(c, i.checked_sub(1).map(|p| candles[p].close)))
        .collect();

    let p = period as f64;
    let seed = ranges[..period].iter().sum::<f64>() / p;
    let value = ranges[period..]
        .iter()
        .fold(seed, |acc, tr| (acc * (p - 1.0) + tr) / p);
    value.is_finite().then_some(value)
}

/// Sample standard deviation of simple returns, in percent.
pub fn std_dev(closes: &[f64]) -> Option<f64> {
    let returns = returns(closes, |prev, cur| (cur - prev) / prev)?;
    sample_std(&returns).map(|s| s * 100.0)
}

/// Annualised sample standard deviation of log returns, in percent.
pub fn realized_vol(closes: &[f64], periods_per_year: f64) -> Option<f64> {
    if !(periods_per_year > 0.0) {
        return None;
    }
    let returns = returns(closes, |prev, cur| (cur / prev).ln())?;
    sample_std(&returns).map(|s| s * periods_per_year.sqrt() * 100.0)
}

/// Compute an index of `index_type` from price history.
pub fn compute_index(index_type: IndexType, candles: &[Candle], params: IndexParams) -> RiskResult<f64> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let value = match index_type {
        IndexType::Atr => atr(candles, params.atr_period),
        IndexType::StdDev => std_dev(&closes),
        IndexType::RealizedVol => realized_vol(&closes, params.periods_per_year),
        IndexType::ImpliedVol => {
            return Err(RiskError::validation(
                "implied volatility must be supplied by an external feed",
            ))
        }
    };
    value.ok_or_else(|| {
        RiskError::validation(format!(
            "not enough usable price history for {:?} ({} bars)",
            index_type,
            candles.len()
        ))
    })
}

fn returns(closes: &[f64], f: impl Fn(f64, f64) -> f64) -> Option<Vec<f64>> {
    if closes.iter().any(|c| !(*c > 0.0) || !c.is_finite()) {
        return None;
    }
    Some(closes.windows(2).map(|w| f(w[0], w[1])).collect())
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(var.sqrt())
}
