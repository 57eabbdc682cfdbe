//! Technical indicators powered by the `ta` crate
//!
//! RSI comes from `ta`, wrapped into the series-with-warmup shape the
//! scanner consumes (`None` until the period has been seen). VWAP,
//! relative volume, and the velocity/acceleration measures have no `ta`
//! equivalent and are computed directly.

use ta::indicators::RelativeStrengthIndex;
use ta::Next;

use crate::types::Bar;

/// Relative Strength Index over exponentially weighted gains and losses
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match RelativeStrengthIndex::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let rsi_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(rsi_val));
        } else {
            result.push(None);
        }
    }

    result
}

/// Volume Weighted Average Price, cumulative over the session
///
/// VWAP = cum(typical price x volume) / cum(volume), typical = (H+L+C)/3.
/// Not in the `ta` crate; session-cumulative by construction.
pub fn vwap(bars: &[Bar]) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(bars.len());
    let mut cum_tp_vol = 0.0;
    let mut cum_vol = 0.0;

    for bar in bars {
        cum_tp_vol += bar.typical_price() * bar.volume;
        cum_vol += bar.volume;

        if cum_vol > 0.0 {
            result.push(Some(cum_tp_vol / cum_vol));
        } else {
            result.push(None);
        }
    }

    result
}

/// Current session VWAP (last value of the cumulative series)
pub fn session_vwap(bars: &[Bar]) -> Option<f64> {
    vwap(bars).last().copied().flatten()
}

/// Current bar volume relative to the mean of the preceding bars
///
/// Lookback shrinks to the available history; a flat-zero history yields 1.0.
pub fn relative_volume(current_volume: f64, bars: &[Bar], lookback: usize) -> f64 {
    if bars.len() < 2 {
        return 1.0;
    }

    // Exclude the current (last) bar from the average
    let history = &bars[..bars.len() - 1];
    let lookback = lookback.min(history.len());
    let window = &history[history.len() - lookback..];
    let avg: f64 = window.iter().map(|b| b.volume).sum::<f64>() / lookback as f64;

    if avg == 0.0 {
        return 1.0;
    }

    current_volume / avg
}

/// Highest high of the session bars
pub fn session_high(bars: &[Bar]) -> Option<f64> {
    bars.iter().map(|b| b.high).fold(None, |acc, h| match acc {
        Some(m) if m >= h => Some(m),
        _ => Some(h),
    })
}

/// Breakout percentage versus a reference level
pub fn breakout_pct(current_price: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return 0.0;
    }
    (current_price - reference) / reference
}

/// Average per-period percentage price change over the last `periods` closes
pub fn velocity(closes: &[f64], periods: usize) -> f64 {
    if closes.len() < periods + 1 {
        return 0.0;
    }

    let start = closes[closes.len() - (periods + 1)];
    let end = closes[closes.len() - 1];

    if start <= 0.0 {
        return 0.0;
    }

    ((end - start) / start) / periods as f64
}

/// Ratio of the latest velocity window to the one before it
///
/// > 1 means the move is speeding up; < 1 means it is fading. `None` when
/// the history is too short or the prior window was flat.
pub fn velocity_ratio(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period * 2 + 1 {
        return None;
    }

    let current = velocity(closes, period);
    let prior = velocity(&closes[..closes.len() - period], period);

    if prior == 0.0 {
        return None;
    }

    Some(current / prior)
}

const MIN_VELOCITY: f64 = 0.0001;

/// Short-horizon acceleration: 2-minute velocity over 5-minute velocity
///
/// Velocities are measured from the previous completed bar of each series to
/// the live price. `None` when either series is too short or the 5-minute
/// velocity is too small to divide by.
pub fn acceleration(current_price: f64, bars_2min: &[Bar], bars_5min: &[Bar]) -> Option<f64> {
    if bars_2min.len() < 2 || bars_5min.len() < 2 {
        return None;
    }

    let price_2min_ago = bars_2min[bars_2min.len() - 2].close;
    let price_5min_ago = bars_5min[bars_5min.len() - 2].close;

    if price_2min_ago <= 0.0 || price_5min_ago <= 0.0 {
        return None;
    }

    let v1 = (current_price / price_2min_ago - 1.0) / 2.0;
    let v2 = (current_price / price_5min_ago - 1.0) / 5.0;

    if v2.abs() < MIN_VELOCITY {
        return None;
    }

    Some(v1 / v2)
}
