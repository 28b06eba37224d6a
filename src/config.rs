use crate::error::EngineError;
use crate::models::Regime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Inclusive clamp bounds for one adaptive parameter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    fn validate(&self, name: &str) -> Result<(), EngineError> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(EngineError::ConfigValidation(format!(
                "{} bounds must be finite (got min={}, max={})",
                name, self.min, self.max
            )));
        }
        if self.min > self.max {
            return Err(EngineError::ConfigValidation(format!(
                "{} bounds are inverted (min {} > max {})",
                name, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// A monitored instrument and its static admission tie-break rank.
/// When two candidates carry the same entry score, the higher rank
/// value wins the slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentSpec {
    pub id: String,
    pub rank: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSettings {
    pub max_positions: usize,
    pub max_entries_per_instrument: usize,
    /// Quote-currency notional for one base-sized entry.
    pub trade_quote_size: f64,
    /// Pyramid entries are scaled down to this fraction of a base entry.
    #[serde(default = "default_pyramid_size_fraction")]
    pub pyramid_size_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSettings {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_analysis_timeout_secs")]
    pub analysis_timeout_secs: u64,
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// Extra headroom past the per-task timeout before stragglers are
    /// abandoned for the cycle.
    #[serde(default = "default_cycle_deadline_grace_secs")]
    pub cycle_deadline_grace_secs: u64,
    #[serde(default = "default_candle_timeframe")]
    pub candle_timeframe: String,
    #[serde(default = "default_candle_history")]
    pub candle_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSettings {
    /// First profit target as a gain fraction over average entry.
    pub first_target_pct: f64,
    /// Second profit target; closing the remainder.
    pub second_target_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PyramidSettings {
    pub enabled: bool,
    pub min_score: u8,
    pub min_strength: f64,
    /// Required gain over the last entry before adding.
    pub min_price_increase_pct: f64,
    pub allowed_regimes: Vec<Regime>,
}

/// Volatility tier cut-offs, expressed as ATR percent of price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolatilityTierSettings {
    pub normal_atr_pct: f64,
    pub high_atr_pct: f64,
    pub extreme_atr_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorSettings {
    pub stop_atr_multiplier: Bounds,
    pub size_multiplier: Bounds,
    pub oversold: Bounds,
    pub overbought: Bounds,
    pub min_entry_score: Bounds,
    pub band_width_factor: Bounds,
    pub volatility_tiers: VolatilityTierSettings,
    /// Relative ATR move that triggers the oscillator-threshold cadence.
    #[serde(default = "default_volatility_shift_pct")]
    pub volatility_shift_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSettings {
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSettings {
    pub snapshot_path: String,
}

/// Process-wide configuration, loaded once at startup and immutable
/// afterwards. The adaptive factor values move at runtime but only
/// inside the bounds validated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub instruments: Vec<InstrumentSpec>,
    pub portfolio: PortfolioSettings,
    pub analysis: AnalysisSettings,
    pub risk: RiskSettings,
    pub pyramid: PyramidSettings,
    pub factors: FactorSettings,
    pub exchange: ExchangeSettings,
    pub notifier: NotifierSettings,
    pub ledger: LedgerSettings,
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|err| {
            EngineError::ConfigValidation(format!(
                "cannot read config file {}: {}",
                path.as_ref().display(),
                err
            ))
        })?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|err| EngineError::ConfigValidation(format!("malformed config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast startup validation; no cycle may run before this passes.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.instruments.is_empty() {
            return Err(EngineError::ConfigValidation(
                "at least one instrument must be configured".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for spec in &self.instruments {
            if spec.id.trim().is_empty() {
                return Err(EngineError::ConfigValidation(
                    "instrument id must not be empty".to_string(),
                ));
            }
            if !seen.insert(spec.id.clone()) {
                return Err(EngineError::ConfigValidation(format!(
                    "duplicate instrument id {}",
                    spec.id
                )));
            }
        }

        if self.portfolio.max_positions == 0 {
            return Err(EngineError::ConfigValidation(
                "maxPositions must be >= 1".to_string(),
            ));
        }
        if self.portfolio.max_entries_per_instrument == 0 {
            return Err(EngineError::ConfigValidation(
                "maxEntriesPerInstrument must be >= 1".to_string(),
            ));
        }
        if self.portfolio.trade_quote_size <= 0.0 {
            return Err(EngineError::ConfigValidation(
                "tradeQuoteSize must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.portfolio.pyramid_size_fraction) {
            return Err(EngineError::ConfigValidation(
                "pyramidSizeFraction must be in [0, 1]".to_string(),
            ));
        }

        if self.analysis.max_workers == 0 {
            return Err(EngineError::ConfigValidation(
                "maxWorkers must be >= 1".to_string(),
            ));
        }
        if self.analysis.analysis_timeout_secs == 0 || self.analysis.cycle_interval_secs == 0 {
            return Err(EngineError::ConfigValidation(
                "analysis timeout and cycle interval must be positive".to_string(),
            ));
        }
        if self.analysis.candle_history < 60 {
            return Err(EngineError::ConfigValidation(
                "candleHistory must be >= 60 for long-horizon trend averages".to_string(),
            ));
        }

        if self.risk.first_target_pct <= 0.0 || self.risk.second_target_pct <= 0.0 {
            return Err(EngineError::ConfigValidation(
                "profit targets must be positive".to_string(),
            ));
        }
        if self.risk.second_target_pct <= self.risk.first_target_pct {
            return Err(EngineError::ConfigValidation(format!(
                "secondTargetPct ({}) must exceed firstTargetPct ({})",
                self.risk.second_target_pct, self.risk.first_target_pct
            )));
        }

        if self.pyramid.min_score > 4 {
            return Err(EngineError::ConfigValidation(
                "pyramid minScore must be within the 0..=4 score range".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pyramid.min_strength) {
            return Err(EngineError::ConfigValidation(
                "pyramid minStrength must be in [0, 1]".to_string(),
            ));
        }
        if self.pyramid.min_price_increase_pct < 0.0 {
            return Err(EngineError::ConfigValidation(
                "pyramid minPriceIncreasePct must not be negative".to_string(),
            ));
        }

        self.factors.stop_atr_multiplier.validate("stopAtrMultiplier")?;
        self.factors.size_multiplier.validate("sizeMultiplier")?;
        self.factors.oversold.validate("oversold")?;
        self.factors.overbought.validate("overbought")?;
        self.factors.min_entry_score.validate("minEntryScore")?;
        self.factors.band_width_factor.validate("bandWidthFactor")?;
        if self.factors.oversold.max >= self.factors.overbought.min {
            return Err(EngineError::ConfigValidation(
                "oversold bounds must sit strictly below overbought bounds".to_string(),
            ));
        }

        let tiers = &self.factors.volatility_tiers;
        if !(tiers.normal_atr_pct < tiers.high_atr_pct && tiers.high_atr_pct < tiers.extreme_atr_pct)
        {
            return Err(EngineError::ConfigValidation(
                "volatility tier thresholds must be strictly increasing".to_string(),
            ));
        }
        if self.factors.volatility_shift_pct <= 0.0 {
            return Err(EngineError::ConfigValidation(
                "volatilityShiftPct must be positive".to_string(),
            ));
        }

        if self.exchange.base_url.trim().is_empty() {
            return Err(EngineError::ConfigValidation(
                "exchange baseUrl must be set".to_string(),
            ));
        }
        if self.ledger.snapshot_path.trim().is_empty() {
            return Err(EngineError::ConfigValidation(
                "ledger snapshotPath must be set".to_string(),
            ));
        }

        Ok(())
    }

    pub fn rank_of(&self, instrument: &str) -> u32 {
        self.instruments
            .iter()
            .find(|spec| spec.id == instrument)
            .map(|spec| spec.rank)
            .unwrap_or(0)
    }
}

fn default_pyramid_size_fraction() -> f64 {
    0.5
}

fn default_max_workers() -> usize {
    3usize.min(num_cpus::get().max(1))
}

fn default_analysis_timeout_secs() -> u64 {
    30
}

fn default_cycle_interval_secs() -> u64 {
    300
}

fn default_cycle_deadline_grace_secs() -> u64 {
    15
}

fn default_candle_timeframe() -> String {
    "15m".to_string()
}

fn default_candle_history() -> usize {
    200
}

fn default_volatility_shift_pct() -> f64 {
    0.15
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}
