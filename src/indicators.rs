use crate::models::Candle;

pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values[values.len() - period..].iter().sum();
    Some(sum / period as f64)
}

pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    out.push(values[0]);
    for i in 1..values.len() {
        let prev = out[i - 1];
        out.push(values[i] * multiplier + prev * (1.0 - multiplier));
    }
    out
}

/// Wilder-smoothed RSI over closes, evaluated at the last candle.
pub fn rsi(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|candle| candle.close).collect();
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for i in period + 1..closes.len() {
        let change = closes[i] - closes[i - 1];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Average true range over the trailing `period` candles.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let start = candles.len() - period;
    let mut sum = 0.0;
    for i in start..candles.len() {
        let current = &candles[i];
        let prev_close = candles[i - 1].close;
        let tr = (current.high - current.low)
            .max((current.high - prev_close).abs())
            .max((current.low - prev_close).abs());
        sum += tr;
    }
    Some(sum / period as f64)
}

/// MACD line and signal line at the last candle.
pub fn macd(
    candles: &[Candle],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<(f64, f64)> {
    if candles.len() < slow_period + signal_period {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|candle| candle.close).collect();
    let fast = ema(&closes, fast_period);
    let slow = ema(&closes, slow_period);
    let macd_line: Vec<f64> = fast
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal = ema(&macd_line, signal_period);
    Some((*macd_line.last()?, *signal.last()?))
}

/// Bollinger bands (middle, upper, lower) at the last candle.
/// `width_factor` scales the band distance around the standard 2σ.
pub fn bollinger(candles: &[Candle], period: usize, width_factor: f64) -> Option<(f64, f64, f64)> {
    if period < 2 || candles.len() < period {
        return None;
    }
    let closes: Vec<f64> = candles[candles.len() - period..]
        .iter()
        .map(|candle| candle.close)
        .collect();
    let mean = closes.iter().sum::<f64>() / period as f64;
    let variance = closes
        .iter()
        .map(|close| (close - mean).powi(2))
        .sum::<f64>()
        / period as f64;
    let deviation = variance.sqrt() * 2.0 * width_factor;
    Some((mean, mean + deviation, mean - deviation))
}

/// Stochastic %K at the last candle.
pub fn stochastic_k(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let window = &candles[candles.len() - period..];
    let highest = window.iter().map(|candle| candle.high).fold(f64::MIN, f64::max);
    let lowest = window.iter().map(|candle| candle.low).fold(f64::MAX, f64::min);
    let close = window.last()?.close;
    if highest - lowest <= f64::EPSILON {
        return Some(50.0);
    }
    Some((close - lowest) / (highest - lowest) * 100.0)
}

/// ADX trend-strength at the last candle, simple moving-average
/// smoothing over the directional movement window.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let mut tr_values = Vec::with_capacity(candles.len() - 1);
    let mut dm_plus_values = Vec::with_capacity(candles.len() - 1);
    let mut dm_minus_values = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        let current = &candles[i];
        let previous = &candles[i - 1];
        let tr = (current.high - current.low)
            .max((current.high - previous.close).abs())
            .max((current.low - previous.close).abs());
        tr_values.push(tr);

        let up_move = current.high - previous.high;
        let down_move = previous.low - current.low;
        dm_plus_values.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        dm_minus_values.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    let mut dx_values = Vec::new();
    for i in (period - 1)..tr_values.len() {
        let window_start = i + 1 - period;
        let atr: f64 = tr_values[window_start..=i].iter().sum::<f64>() / period as f64;
        if atr <= 0.0 {
            dx_values.push(0.0);
            continue;
        }
        let di_plus =
            dm_plus_values[window_start..=i].iter().sum::<f64>() / (atr * period as f64) * 100.0;
        let di_minus =
            dm_minus_values[window_start..=i].iter().sum::<f64>() / (atr * period as f64) * 100.0;
        let di_sum = di_plus + di_minus;
        dx_values.push(if di_sum > 0.0 {
            (di_plus - di_minus).abs() / di_sum * 100.0
        } else {
            0.0
        });
    }

    if dx_values.len() < period {
        return None;
    }
    Some(dx_values[dx_values.len() - period..].iter().sum::<f64>() / period as f64)
}
