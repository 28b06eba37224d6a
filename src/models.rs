use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Residual position size below this is treated as zero and purged.
pub const DUST_EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    StrongBullish,
    Bullish,
    Neutral,
    Bearish,
    StrongBearish,
    Ranging,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::StrongBullish => "strong_bullish",
            Regime::Bullish => "bullish",
            Regime::Neutral => "neutral",
            Regime::Bearish => "bearish",
            Regime::StrongBearish => "strong_bearish",
            Regime::Ranging => "ranging",
        }
    }
}

/// Entry conditions the analyzer scores. Weekly reweighting attributes
/// closed-trade outcomes back to these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryCondition {
    Rsi,
    Stochastic,
    Bollinger,
    Macd,
}

impl EntryCondition {
    pub const ALL: [EntryCondition; 4] = [
        EntryCondition::Rsi,
        EntryCondition::Stochastic,
        EntryCondition::Bollinger,
        EntryCondition::Macd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryCondition::Rsi => "rsi",
            EntryCondition::Stochastic => "stoch",
            EntryCondition::Bollinger => "bb",
            EntryCondition::Macd => "macd",
        }
    }
}

/// Per-instrument, per-cycle analysis output. Immutable once produced.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub instrument: String,
    /// Bounded entry score, 0..=4.
    pub score: u8,
    pub regime: Regime,
    /// Percentage gap between fast and slow trend averages.
    pub trend_gap_pct: f64,
    /// Signal strength in 0..=1.
    pub strength: f64,
    pub price: f64,
    pub atr: f64,
    pub fired_conditions: Vec<EntryCondition>,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl AnalysisResult {
    pub fn failed(instrument: &str, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.to_string(),
            score: 0,
            regime: Regime::Neutral,
            trend_gap_pct: 0.0,
            strength: 0.0,
            price: 0.0,
            atr: 0.0,
            fired_conditions: Vec::new(),
            timestamp: now,
            error: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEntry {
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
}

/// One open position. Derived fields are recomputed on every mutation;
/// `size` always equals the sum of entry sizes and `avg_entry_price`
/// the size-weighted mean of entry prices.
#[derive(Debug, Clone)]
pub struct Position {
    pub instrument: String,
    pub entries: Vec<PositionEntry>,
    pub size: f64,
    pub avg_entry_price: f64,
    pub stop_loss: f64,
    pub highest_price: f64,
    pub first_target_hit: bool,
    pub second_target_hit: bool,
    /// Conditions that fired on the opening entry; drives win-rate
    /// attribution. Not part of the persisted snapshot, so positions
    /// restored after a restart carry no attribution.
    pub entry_conditions: Vec<EntryCondition>,
}

impl Position {
    pub fn open(
        instrument: &str,
        price: f64,
        size: f64,
        stop_loss: f64,
        entry_conditions: Vec<EntryCondition>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            entries: vec![PositionEntry {
                price,
                size,
                timestamp,
            }],
            size,
            avg_entry_price: price,
            stop_loss,
            highest_price: price,
            first_target_hit: false,
            second_target_hit: false,
            entry_conditions,
        }
    }

    pub fn add_entry(&mut self, price: f64, size: f64, timestamp: DateTime<Utc>) {
        self.entries.push(PositionEntry {
            price,
            size,
            timestamp,
        });
        self.recompute_derived();
        if price > self.highest_price {
            self.highest_price = price;
        }
    }

    /// Reduce size by `sold`. Entries are consumed oldest-first so the
    /// remaining weighted average stays consistent with the entry list.
    pub fn reduce(&mut self, sold: f64) {
        let mut remaining = sold;
        while remaining > DUST_EPSILON {
            let Some(front) = self.entries.first_mut() else {
                break;
            };
            if front.size > remaining + DUST_EPSILON {
                front.size -= remaining;
                remaining = 0.0;
            } else {
                remaining -= front.size;
                self.entries.remove(0);
            }
        }
        self.recompute_derived();
    }

    pub fn recompute_derived(&mut self) {
        self.size = self.entries.iter().map(|entry| entry.size).sum();
        if self.size > DUST_EPSILON {
            self.avg_entry_price = self
                .entries
                .iter()
                .map(|entry| entry.price * entry.size)
                .sum::<f64>()
                / self.size;
        } else {
            self.avg_entry_price = 0.0;
        }
    }

    pub fn last_entry_price(&self) -> f64 {
        self.entries.last().map(|entry| entry.price).unwrap_or(0.0)
    }

    pub fn is_dust(&self) -> bool {
        self.size < DUST_EPSILON
    }
}

/// Persisted form of a position. Field names are the stable on-disk
/// contract and must not change between releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub size: f64,
    pub avg_entry_price: f64,
    pub entry_count: usize,
    pub entry_prices: Vec<f64>,
    pub entry_sizes: Vec<f64>,
    pub stop_loss: f64,
    pub highest_price: f64,
    pub first_target_hit: bool,
    pub second_target_hit: bool,
}

impl PositionSnapshot {
    pub fn from_position(position: &Position) -> Self {
        Self {
            size: position.size,
            avg_entry_price: position.avg_entry_price,
            entry_count: position.entries.len(),
            entry_prices: position.entries.iter().map(|entry| entry.price).collect(),
            entry_sizes: position.entries.iter().map(|entry| entry.size).collect(),
            stop_loss: position.stop_loss,
            highest_price: position.highest_price,
            first_target_hit: position.first_target_hit,
            second_target_hit: position.second_target_hit,
        }
    }

    pub fn into_position(self, instrument: &str, restored_at: DateTime<Utc>) -> Position {
        let entries = self
            .entry_prices
            .iter()
            .zip(self.entry_sizes.iter())
            .map(|(price, size)| PositionEntry {
                price: *price,
                size: *size,
                timestamp: restored_at,
            })
            .collect();
        let mut position = Position {
            instrument: instrument.to_string(),
            entries,
            size: self.size,
            avg_entry_price: self.avg_entry_price,
            stop_loss: self.stop_loss,
            highest_price: self.highest_price,
            first_target_hit: self.first_target_hit,
            second_target_hit: self.second_target_hit,
            entry_conditions: Vec::new(),
        };
        position.recompute_derived();
        position
    }
}

/// Read-only copy of the ledger state handed to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct PortfolioState {
    pub positions: HashMap<String, Position>,
}

impl PortfolioState {
    pub fn open_count(&self) -> usize {
        self.positions.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    /// Close the whole position.
    FullClose,
    /// Close half the position and arm the breakeven stop.
    FirstTargetClose,
    /// Add an entry to an existing position.
    Pyramid,
    /// Open a new position.
    Open,
}

impl IntentKind {
    pub fn side(&self) -> OrderSide {
        match self {
            IntentKind::FullClose | IntentKind::FirstTargetClose => OrderSide::Sell,
            IntentKind::Pyramid | IntentKind::Open => OrderSide::Buy,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, IntentKind::FullClose | IntentKind::FirstTargetClose)
    }
}

/// One trade action the scheduler admitted for this cycle. Intents die
/// with their cycle; a dropped candidate must re-qualify next time.
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub id: Uuid,
    pub instrument: String,
    pub kind: IntentKind,
    pub reason: &'static str,
    pub score: u8,
    pub strength: f64,
    pub reference_price: f64,
    pub atr: f64,
    pub fired_conditions: Vec<EntryCondition>,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub filled_price: f64,
    pub filled_size: f64,
    pub realized_pnl: Option<f64>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            filled_price: 0.0,
            filled_size: 0.0,
            realized_pnl: None,
            error: Some(error.into()),
        }
    }
}
