use crate::models::EntryCondition;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub instrument: String,
    pub conditions: Vec<EntryCondition>,
    pub pnl: f64,
    pub closed_at: DateTime<Utc>,
}

/// Trailing record of closed trades, attributed to the entry conditions
/// that fired when the position was opened. Feeds the weekly factor
/// cadence.
pub struct PerformanceTracker {
    window: Duration,
    records: Vec<ClosedTrade>,
}

impl PerformanceTracker {
    pub fn new(window_days: i64) -> Self {
        Self {
            window: Duration::days(window_days),
            records: Vec::new(),
        }
    }

    pub fn record_close(&mut self, trade: ClosedTrade) {
        let cutoff = trade.closed_at - self.window;
        self.records.retain(|record| record.closed_at >= cutoff);
        self.records.push(trade);
    }

    fn in_window(&self, now: DateTime<Utc>) -> impl Iterator<Item = &ClosedTrade> {
        let cutoff = now - self.window;
        self.records
            .iter()
            .filter(move |record| record.closed_at >= cutoff)
    }

    /// Empirical win rate per entry condition over the trailing window.
    /// Conditions with no closed trades are absent from the map.
    pub fn condition_win_rates(&self, now: DateTime<Utc>) -> HashMap<EntryCondition, f64> {
        let mut wins: HashMap<EntryCondition, usize> = HashMap::new();
        let mut totals: HashMap<EntryCondition, usize> = HashMap::new();
        for record in self.in_window(now) {
            for condition in &record.conditions {
                *totals.entry(*condition).or_insert(0) += 1;
                if record.pnl > 0.0 {
                    *wins.entry(*condition).or_insert(0) += 1;
                }
            }
        }
        totals
            .into_iter()
            .map(|(condition, total)| {
                let won = wins.get(&condition).copied().unwrap_or(0);
                (condition, won as f64 / total as f64)
            })
            .collect()
    }

    pub fn aggregate_win_rate(&self, now: DateTime<Utc>) -> Option<f64> {
        let mut total = 0usize;
        let mut wins = 0usize;
        for record in self.in_window(now) {
            total += 1;
            if record.pnl > 0.0 {
                wins += 1;
            }
        }
        if total == 0 {
            None
        } else {
            Some(wins as f64 / total as f64)
        }
    }

    pub fn closed_count(&self, now: DateTime<Utc>) -> usize {
        self.in_window(now).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(pnl: f64, conditions: Vec<EntryCondition>, closed_at: DateTime<Utc>) -> ClosedTrade {
        ClosedTrade {
            instrument: "BTC".to_string(),
            conditions,
            pnl,
            closed_at,
        }
    }

    #[test]
    fn win_rates_attribute_per_condition() {
        let now = Utc::now();
        let mut tracker = PerformanceTracker::new(7);
        tracker.record_close(trade(5.0, vec![EntryCondition::Bollinger], now));
        tracker.record_close(trade(-2.0, vec![EntryCondition::Rsi], now));
        tracker.record_close(trade(
            3.0,
            vec![EntryCondition::Bollinger, EntryCondition::Rsi],
            now,
        ));

        let rates = tracker.condition_win_rates(now);
        assert!((rates[&EntryCondition::Bollinger] - 1.0).abs() < 1e-9);
        assert!((rates[&EntryCondition::Rsi] - 0.5).abs() < 1e-9);
        assert!(!rates.contains_key(&EntryCondition::Macd));
    }

    #[test]
    fn old_records_age_out_of_the_window() {
        let now = Utc::now();
        let mut tracker = PerformanceTracker::new(7);
        tracker.record_close(trade(
            5.0,
            vec![EntryCondition::Macd],
            now - Duration::days(10),
        ));
        tracker.record_close(trade(-1.0, vec![EntryCondition::Macd], now));

        assert_eq!(tracker.closed_count(now), 1);
        let aggregate = tracker.aggregate_win_rate(now).unwrap();
        assert!((aggregate - 0.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_is_none_without_trades() {
        let tracker = PerformanceTracker::new(7);
        assert!(tracker.aggregate_win_rate(Utc::now()).is_none());
    }
}
