use crate::config::{Bounds, FactorSettings};
use crate::models::{EntryCondition, Regime};
use crate::performance::PerformanceTracker;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use log::{debug, info};
use std::collections::HashMap;

/// Total weight shared across entry conditions; reweighting moves mass
/// between conditions but never changes the sum.
pub const TOTAL_CONDITION_WEIGHT: f64 = 4.0;

const WEEKLY_REWEIGHT_BLEND: f64 = 0.5;
const MIN_SCORE_STEP: f64 = 0.5;
const OSCILLATOR_SHIFT_STEP: f64 = 2.5;
const LOW_AGGREGATE_WIN_RATE: f64 = 0.4;
const HIGH_AGGREGATE_WIN_RATE: f64 = 0.6;

/// An adaptive parameter that can never leave its configured bounds.
#[derive(Debug, Clone, Copy)]
pub struct BoundedValue {
    value: f64,
    bounds: Bounds,
}

impl BoundedValue {
    pub fn new(initial: f64, bounds: Bounds) -> Self {
        Self {
            value: bounds.clamp(initial),
            bounds,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn set(&mut self, value: f64) {
        self.value = self.bounds.clamp(value);
    }

    pub fn adjust(&mut self, delta: f64) {
        self.set(self.value + delta);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityTier {
    Low,
    Normal,
    High,
    Extreme,
}

impl VolatilityTier {
    pub fn from_atr_pct(atr_pct: f64, settings: &crate::config::VolatilityTierSettings) -> Self {
        if atr_pct >= settings.extreme_atr_pct {
            VolatilityTier::Extreme
        } else if atr_pct >= settings.high_atr_pct {
            VolatilityTier::High
        } else if atr_pct >= settings.normal_atr_pct {
            VolatilityTier::Normal
        } else {
            VolatilityTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolatilityTier::Low => "low",
            VolatilityTier::Normal => "normal",
            VolatilityTier::High => "high",
            VolatilityTier::Extreme => "extreme",
        }
    }

    fn stop_multiplier(&self) -> f64 {
        match self {
            VolatilityTier::Low => 1.5,
            VolatilityTier::Normal => 2.0,
            VolatilityTier::High => 2.75,
            VolatilityTier::Extreme => 3.5,
        }
    }

    fn size_multiplier(&self) -> f64 {
        match self {
            VolatilityTier::Low => 1.25,
            VolatilityTier::Normal => 1.0,
            VolatilityTier::High => 0.6,
            VolatilityTier::Extreme => 0.35,
        }
    }

    fn band_width_factor(&self) -> f64 {
        match self {
            VolatilityTier::Low => 0.9,
            VolatilityTier::Normal => 1.0,
            VolatilityTier::High => 1.15,
            VolatilityTier::Extreme => 1.3,
        }
    }
}

/// Per-instrument adaptive record. Mutated only by the manager, read by
/// the analyzer and scheduler through cloned snapshots.
#[derive(Debug, Clone)]
pub struct InstrumentFactors {
    pub stop_atr_multiplier: BoundedValue,
    pub size_multiplier: BoundedValue,
    pub oversold: BoundedValue,
    pub overbought: BoundedValue,
    pub min_entry_score: BoundedValue,
    pub band_width_factor: BoundedValue,
    pub condition_weights: HashMap<EntryCondition, f64>,
    pub regime_difficulty: HashMap<Regime, f64>,
    last_volatility_fire_atr_pct: Option<f64>,
    last_daily_update: Option<NaiveDate>,
    last_weekly_update: Option<(i32, u32)>,
}

impl InstrumentFactors {
    pub fn new(settings: &FactorSettings) -> Self {
        let per_condition = TOTAL_CONDITION_WEIGHT / EntryCondition::ALL.len() as f64;
        let condition_weights = EntryCondition::ALL
            .iter()
            .map(|condition| (*condition, per_condition))
            .collect();
        Self {
            stop_atr_multiplier: BoundedValue::new(2.0, settings.stop_atr_multiplier),
            size_multiplier: BoundedValue::new(1.0, settings.size_multiplier),
            oversold: BoundedValue::new(30.0, settings.oversold),
            overbought: BoundedValue::new(70.0, settings.overbought),
            min_entry_score: BoundedValue::new(2.0, settings.min_entry_score),
            band_width_factor: BoundedValue::new(1.0, settings.band_width_factor),
            condition_weights,
            regime_difficulty: base_difficulty_table(),
            last_volatility_fire_atr_pct: None,
            last_daily_update: None,
            last_weekly_update: None,
        }
    }

    pub fn weight(&self, condition: EntryCondition) -> f64 {
        self.condition_weights.get(&condition).copied().unwrap_or(0.0)
    }

    pub fn difficulty(&self, regime: Regime) -> f64 {
        self.regime_difficulty.get(&regime).copied().unwrap_or(1.0)
    }

    /// Effective minimum entry score after the regime modifier.
    pub fn effective_min_score(&self, regime: Regime) -> f64 {
        self.min_entry_score.value() * self.difficulty(regime)
    }
}

fn base_difficulty_table() -> HashMap<Regime, f64> {
    HashMap::from([
        (Regime::StrongBullish, 0.9),
        (Regime::Bullish, 1.0),
        (Regime::Neutral, 1.1),
        (Regime::Ranging, 1.25),
        (Regime::Bearish, 1.4),
        (Regime::StrongBearish, 1.6),
    ])
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CadenceOutcome {
    pub tier: Option<VolatilityTier>,
    pub volatility_fired: bool,
    pub daily_fired: bool,
    pub weekly_fired: bool,
}

/// Owns the adaptive parameter state for every instrument. All writes
/// clamp first; per-instrument last-write-wins, no cross-instrument
/// contention.
pub struct DynamicFactorManager {
    settings: FactorSettings,
    factors: DashMap<String, InstrumentFactors>,
}

impl DynamicFactorManager {
    pub fn new(settings: FactorSettings) -> Self {
        Self {
            settings,
            factors: DashMap::new(),
        }
    }

    pub fn snapshot(&self, instrument: &str) -> InstrumentFactors {
        self.factors
            .entry(instrument.to_string())
            .or_insert_with(|| InstrumentFactors::new(&self.settings))
            .clone()
    }

    /// Run every cadence that is due for this instrument. Called once
    /// per cycle from the coordinator thread, after the analysis
    /// barrier. Each cadence is idempotent within its window.
    pub fn apply_cycle_updates(
        &self,
        instrument: &str,
        atr_pct: f64,
        now: DateTime<Utc>,
        performance: &PerformanceTracker,
    ) -> CadenceOutcome {
        let mut entry = self
            .factors
            .entry(instrument.to_string())
            .or_insert_with(|| InstrumentFactors::new(&self.settings));
        let factors = entry.value_mut();

        let mut outcome = CadenceOutcome::default();
        if atr_pct.is_finite() && atr_pct > 0.0 {
            outcome.tier = Some(self.update_continuous(factors, atr_pct));
            outcome.volatility_fired = self.update_on_volatility_shift(factors, atr_pct);
        }
        outcome.daily_fired = self.update_daily(factors, now, outcome.tier);
        outcome.weekly_fired = self.update_weekly(instrument, factors, now, performance);
        outcome
    }

    fn update_continuous(&self, factors: &mut InstrumentFactors, atr_pct: f64) -> VolatilityTier {
        let tier = VolatilityTier::from_atr_pct(atr_pct, &self.settings.volatility_tiers);
        factors.stop_atr_multiplier.set(tier.stop_multiplier());
        factors.size_multiplier.set(tier.size_multiplier());
        tier
    }

    fn update_on_volatility_shift(&self, factors: &mut InstrumentFactors, atr_pct: f64) -> bool {
        let Some(last) = factors.last_volatility_fire_atr_pct else {
            factors.last_volatility_fire_atr_pct = Some(atr_pct);
            return false;
        };
        if last <= 0.0 {
            factors.last_volatility_fire_atr_pct = Some(atr_pct);
            return false;
        }
        let relative_move = (atr_pct - last).abs() / last;
        if relative_move < self.settings.volatility_shift_pct {
            return false;
        }

        // Rising volatility widens the oscillator thresholds so the
        // analyzer demands deeper extremes; falling volatility tightens
        // them back.
        if atr_pct > last {
            factors.oversold.adjust(-OSCILLATOR_SHIFT_STEP);
            factors.overbought.adjust(OSCILLATOR_SHIFT_STEP);
        } else {
            factors.oversold.adjust(OSCILLATOR_SHIFT_STEP);
            factors.overbought.adjust(-OSCILLATOR_SHIFT_STEP);
        }
        factors.last_volatility_fire_atr_pct = Some(atr_pct);
        debug!(
            "Volatility shift cadence fired (ATR% {:.2} -> {:.2}), thresholds now {:.1}/{:.1}",
            last,
            atr_pct,
            factors.oversold.value(),
            factors.overbought.value()
        );
        true
    }

    fn update_daily(
        &self,
        factors: &mut InstrumentFactors,
        now: DateTime<Utc>,
        tier: Option<VolatilityTier>,
    ) -> bool {
        let today = now.date_naive();
        if factors.last_daily_update == Some(today) {
            return false;
        }
        factors.last_daily_update = Some(today);

        let tier = tier.unwrap_or(VolatilityTier::Normal);
        factors.band_width_factor.set(tier.band_width_factor());

        let mut table = base_difficulty_table();
        if matches!(tier, VolatilityTier::Extreme) {
            for value in table.values_mut() {
                *value = (*value + 0.1).min(2.0);
            }
        }
        factors.regime_difficulty = table;
        true
    }

    fn update_weekly(
        &self,
        instrument: &str,
        factors: &mut InstrumentFactors,
        now: DateTime<Utc>,
        performance: &PerformanceTracker,
    ) -> bool {
        let week = now.iso_week();
        let marker = (week.year(), week.week());
        if factors.last_weekly_update == Some(marker) {
            return false;
        }
        factors.last_weekly_update = Some(marker);

        let win_rates = performance.condition_win_rates(now);
        if !win_rates.is_empty() {
            reweight_conditions(&mut factors.condition_weights, &win_rates);
            info!(
                "Weekly reweight for {}: {:?}",
                instrument, factors.condition_weights
            );
        }

        match performance.aggregate_win_rate(now) {
            Some(rate) if rate < LOW_AGGREGATE_WIN_RATE => {
                factors.min_entry_score.adjust(MIN_SCORE_STEP);
            }
            Some(rate) if rate > HIGH_AGGREGATE_WIN_RATE => {
                factors.min_entry_score.adjust(-MIN_SCORE_STEP);
            }
            _ => {}
        }
        true
    }
}

/// Move weight toward conditions with higher win rates. Only conditions
/// with observed trades participate; their combined weight is preserved
/// exactly, so the overall total never drifts.
fn reweight_conditions(
    weights: &mut HashMap<EntryCondition, f64>,
    win_rates: &HashMap<EntryCondition, f64>,
) {
    let measured: Vec<EntryCondition> = EntryCondition::ALL
        .iter()
        .copied()
        .filter(|condition| win_rates.contains_key(condition))
        .collect();
    if measured.len() < 2 {
        return;
    }

    let pool: f64 = measured
        .iter()
        .map(|condition| weights.get(condition).copied().unwrap_or(0.0))
        .sum();
    let rate_sum: f64 = measured
        .iter()
        .map(|condition| win_rates[condition])
        .sum();
    if pool <= 0.0 || rate_sum <= 0.0 {
        return;
    }

    for condition in measured {
        let current = weights.get(&condition).copied().unwrap_or(0.0);
        let target = pool * win_rates[&condition] / rate_sum;
        let blended = current + WEEKLY_REWEIGHT_BLEND * (target - current);
        weights.insert(condition, blended);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::sample_config;
    use crate::performance::ClosedTrade;
    use chrono::{Duration, TimeZone};

    fn manager() -> DynamicFactorManager {
        DynamicFactorManager::new(sample_config().factors)
    }

    fn empty_tracker() -> PerformanceTracker {
        PerformanceTracker::new(7)
    }

    // A Wednesday noon, safely away from day and ISO-week boundaries.
    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap()
    }

    #[test]
    fn continuous_cadence_follows_volatility_tier() {
        let manager = manager();
        let now = fixed_now();
        let tracker = empty_tracker();

        let outcome = manager.apply_cycle_updates("BTC", 0.5, now, &tracker);
        assert_eq!(outcome.tier, Some(VolatilityTier::Low));
        let factors = manager.snapshot("BTC");
        assert!((factors.stop_atr_multiplier.value() - 1.5).abs() < 1e-9);

        let outcome = manager.apply_cycle_updates("BTC", 7.0, now, &tracker);
        assert_eq!(outcome.tier, Some(VolatilityTier::Extreme));
        let factors = manager.snapshot("BTC");
        assert!((factors.stop_atr_multiplier.value() - 3.5).abs() < 1e-9);
        // Size multiplier clamped to its configured floor.
        assert!((factors.size_multiplier.value() - 0.35).abs() < 1e-9);
    }

    #[test]
    fn volatility_shift_fires_only_past_threshold() {
        let manager = manager();
        let now = fixed_now();
        let tracker = empty_tracker();

        // First observation only sets the baseline.
        let outcome = manager.apply_cycle_updates("BTC", 2.0, now, &tracker);
        assert!(!outcome.volatility_fired);

        // 10% move: below the 15% trigger.
        let outcome = manager.apply_cycle_updates("BTC", 2.2, now, &tracker);
        assert!(!outcome.volatility_fired);

        // 25% move from the baseline: fires and widens thresholds.
        let before = manager.snapshot("BTC");
        let outcome = manager.apply_cycle_updates("BTC", 2.5, now, &tracker);
        assert!(outcome.volatility_fired);
        let after = manager.snapshot("BTC");
        assert!(after.oversold.value() <= before.oversold.value());
        assert!(after.overbought.value() >= before.overbought.value());
    }

    #[test]
    fn daily_cadence_runs_once_per_day() {
        let manager = manager();
        let now = fixed_now();
        let tracker = empty_tracker();

        let first = manager.apply_cycle_updates("BTC", 2.0, now, &tracker);
        assert!(first.daily_fired);
        let second = manager.apply_cycle_updates("BTC", 2.0, now, &tracker);
        assert!(!second.daily_fired);
        let tomorrow = manager.apply_cycle_updates("BTC", 2.0, now + Duration::days(1), &tracker);
        assert!(tomorrow.daily_fired);
    }

    #[test]
    fn weekly_reweight_shifts_toward_winning_conditions() {
        let manager = manager();
        let now = fixed_now();
        let mut tracker = PerformanceTracker::new(7);
        // Build win rates bb=0.7, rsi=0.3, stoch=0.5.
        for i in 0..10 {
            tracker.record_close(ClosedTrade {
                instrument: "BTC".to_string(),
                conditions: vec![EntryCondition::Bollinger],
                pnl: if i < 7 { 1.0 } else { -1.0 },
                closed_at: now,
            });
            tracker.record_close(ClosedTrade {
                instrument: "BTC".to_string(),
                conditions: vec![EntryCondition::Rsi],
                pnl: if i < 3 { 1.0 } else { -1.0 },
                closed_at: now,
            });
            tracker.record_close(ClosedTrade {
                instrument: "BTC".to_string(),
                conditions: vec![EntryCondition::Stochastic],
                pnl: if i < 5 { 1.0 } else { -1.0 },
                closed_at: now,
            });
        }

        let before = manager.snapshot("BTC");
        let total_before: f64 = before.condition_weights.values().sum();
        let outcome = manager.apply_cycle_updates("BTC", 2.0, now, &tracker);
        assert!(outcome.weekly_fired);

        let after = manager.snapshot("BTC");
        let total_after: f64 = after.condition_weights.values().sum();
        assert!(
            (total_before - total_after).abs() < 1e-9,
            "total weight must stay fixed ({} -> {})",
            total_before,
            total_after
        );
        assert!(after.weight(EntryCondition::Bollinger) > before.weight(EntryCondition::Bollinger));
        assert!(after.weight(EntryCondition::Rsi) < before.weight(EntryCondition::Rsi));
    }

    #[test]
    fn weekly_cadence_is_idempotent_within_a_week() {
        let manager = manager();
        let now = fixed_now();
        let tracker = empty_tracker();

        let first = manager.apply_cycle_updates("BTC", 2.0, now, &tracker);
        assert!(first.weekly_fired);
        let second = manager.apply_cycle_updates("BTC", 2.0, now + Duration::hours(1), &tracker);
        assert!(!second.weekly_fired);
    }

    #[test]
    fn low_aggregate_win_rate_raises_min_score() {
        let manager = manager();
        let now = fixed_now();
        let mut tracker = PerformanceTracker::new(7);
        for _ in 0..10 {
            tracker.record_close(ClosedTrade {
                instrument: "BTC".to_string(),
                conditions: vec![EntryCondition::Macd],
                pnl: -1.0,
                closed_at: now,
            });
        }

        let before = manager.snapshot("BTC").min_entry_score.value();
        manager.apply_cycle_updates("BTC", 2.0, now, &tracker);
        let after = manager.snapshot("BTC").min_entry_score.value();
        assert!(after > before);
    }

    #[test]
    fn bounded_value_never_escapes_bounds() {
        let mut value = BoundedValue::new(10.0, Bounds { min: 1.0, max: 4.0 });
        assert!((value.value() - 4.0).abs() < 1e-9);
        value.set(-5.0);
        assert!((value.value() - 1.0).abs() < 1e-9);
        value.adjust(100.0);
        assert!((value.value() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn difficulty_modifier_scales_effective_min_score() {
        let factors = InstrumentFactors::new(&sample_config().factors);
        let easy = factors.effective_min_score(Regime::StrongBullish);
        let hard = factors.effective_min_score(Regime::StrongBearish);
        assert!(easy < hard);
    }
}
