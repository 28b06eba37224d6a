use crate::indicators;
use crate::models::{Candle, Regime};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::info;

const FAST_TREND_PERIOD: usize = 20;
const SLOW_TREND_PERIOD: usize = 50;
const ADX_PERIOD: usize = 14;
const STRONG_GAP_PCT: f64 = 5.0;
const NEUTRAL_BAND_PCT: f64 = 0.5;
const RANGING_ADX_THRESHOLD: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct RegimeState {
    pub current: Regime,
    pub previous: Option<Regime>,
    pub changed_at: DateTime<Utc>,
}

/// Classification inputs derived purely from candles; safe to compute
/// inside analysis workers.
#[derive(Debug, Clone, Copy)]
pub struct TrendReading {
    pub regime: Regime,
    pub gap_pct: f64,
    pub trend_strength: f64,
}

#[derive(Debug, Clone)]
pub struct RegimeChange {
    pub instrument: String,
    pub old: Regime,
    pub new: Regime,
    pub gap_pct: f64,
}

/// Classify the long-horizon trend from fast/slow averages plus an ADX
/// trend-strength override. Pure function of the candle history.
pub fn classify(candles: &[Candle]) -> Option<TrendReading> {
    let closes: Vec<f64> = candles.iter().map(|candle| candle.close).collect();
    let fast = indicators::sma(&closes, FAST_TREND_PERIOD)?;
    let slow = indicators::sma(&closes, SLOW_TREND_PERIOD)?;
    if slow <= 0.0 {
        return None;
    }
    let gap_pct = (fast - slow) / slow * 100.0;
    let trend_strength = indicators::adx(candles, ADX_PERIOD).unwrap_or(0.0);

    // Weak trend strength overrides the gap classification entirely.
    let regime = if trend_strength < RANGING_ADX_THRESHOLD {
        Regime::Ranging
    } else if gap_pct > STRONG_GAP_PCT {
        Regime::StrongBullish
    } else if gap_pct > NEUTRAL_BAND_PCT {
        Regime::Bullish
    } else if gap_pct >= -NEUTRAL_BAND_PCT {
        Regime::Neutral
    } else if gap_pct < -STRONG_GAP_PCT {
        Regime::StrongBearish
    } else {
        Regime::Bearish
    };

    Some(TrendReading {
        regime,
        gap_pct,
        trend_strength,
    })
}

/// Tracks the committed per-instrument regime and its transitions.
/// Workers call `classify` (pure); the coordinator thread commits the
/// readings after the analysis barrier.
#[derive(Default)]
pub struct RegimeDetector {
    states: DashMap<String, RegimeState>,
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, instrument: &str) -> Option<Regime> {
        self.states.get(instrument).map(|state| state.current)
    }

    pub fn state(&self, instrument: &str) -> Option<RegimeState> {
        self.states.get(instrument).map(|state| state.clone())
    }

    /// Commit a fresh label. Returns the transition when it changed
    /// from the previous cycle; the caller notifies, this never blocks
    /// on it.
    pub fn commit(
        &self,
        instrument: &str,
        regime: Regime,
        gap_pct: f64,
        now: DateTime<Utc>,
    ) -> Option<RegimeChange> {
        let mut change = None;
        let mut entry = self
            .states
            .entry(instrument.to_string())
            .or_insert_with(|| RegimeState {
                current: regime,
                previous: None,
                changed_at: now,
            });

        if entry.current != regime {
            info!(
                "Regime change for {}: {} -> {} (gap {:.2}%)",
                instrument,
                entry.current.as_str(),
                regime.as_str(),
                gap_pct
            );
            change = Some(RegimeChange {
                instrument: instrument.to_string(),
                old: entry.current,
                new: regime,
                gap_pct,
            });
            entry.previous = Some(entry.current);
            entry.current = regime;
            entry.changed_at = now;
        }
        change
    }
}
