use crate::factors::{InstrumentFactors, TOTAL_CONDITION_WEIGHT};
use crate::indicators;
use crate::models::{AnalysisResult, Candle, EntryCondition};
use crate::regime;
use chrono::{DateTime, Utc};

const RSI_PERIOD: usize = 14;
const STOCH_PERIOD: usize = 14;
const BOLLINGER_PERIOD: usize = 20;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const ATR_PERIOD: usize = 14;

/// Minimum history for the slow trend average plus ADX warmup.
pub const MIN_CANDLES: usize = 60;

/// Score one instrument from its candle history and the current
/// adaptive factors. Pure: no I/O, no shared state, safe to run on any
/// worker.
pub fn analyze(
    instrument: &str,
    candles: &[Candle],
    factors: &InstrumentFactors,
    now: DateTime<Utc>,
) -> AnalysisResult {
    if candles.len() < MIN_CANDLES {
        return AnalysisResult::failed(
            instrument,
            format!(
                "insufficient candle history ({} < {})",
                candles.len(),
                MIN_CANDLES
            ),
            now,
        );
    }

    let price = candles.last().map(|candle| candle.close).unwrap_or(0.0);
    if !price.is_finite() || price <= 0.0 {
        return AnalysisResult::failed(instrument, "last close is unusable", now);
    }

    let Some(reading) = regime::classify(candles) else {
        return AnalysisResult::failed(instrument, "trend classification unavailable", now);
    };
    let atr = indicators::atr(candles, ATR_PERIOD).unwrap_or(0.0);

    let mut fired = Vec::new();

    if let Some(rsi) = indicators::rsi(candles, RSI_PERIOD) {
        if rsi < factors.oversold.value() {
            fired.push(EntryCondition::Rsi);
        }
    }

    if let Some(stoch) = indicators::stochastic_k(candles, STOCH_PERIOD) {
        if stoch < factors.oversold.value() {
            fired.push(EntryCondition::Stochastic);
        }
    }

    if let Some((_, _, lower)) =
        indicators::bollinger(candles, BOLLINGER_PERIOD, factors.band_width_factor.value())
    {
        if price <= lower {
            fired.push(EntryCondition::Bollinger);
        }
    }

    if let Some((macd_line, signal_line)) = indicators::macd(candles, MACD_FAST, MACD_SLOW, MACD_SIGNAL)
    {
        if macd_line > signal_line {
            fired.push(EntryCondition::Macd);
        }
    }

    let weighted_sum: f64 = fired
        .iter()
        .map(|condition| factors.weight(*condition))
        .sum();
    let score = weighted_sum.round().clamp(0.0, 4.0) as u8;
    let strength = (weighted_sum / TOTAL_CONDITION_WEIGHT).clamp(0.0, 1.0);

    AnalysisResult {
        instrument: instrument.to_string(),
        score,
        regime: reading.regime,
        trend_gap_pct: reading.gap_pct,
        strength,
        price,
        atr,
        fired_conditions: fired,
        timestamp: now,
        error: None,
    }
}
