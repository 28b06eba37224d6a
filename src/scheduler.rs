use crate::config::EngineConfig;
use crate::factors::DynamicFactorManager;
use crate::models::{
    AnalysisResult, IntentKind, PortfolioState, Position, TradeIntent,
};
use log::debug;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// The admission-control core. Consumes one cycle's analysis results
/// plus a read-only portfolio snapshot and emits the ordered intent
/// list: exits first (never capacity-limited), then pyramids, then new
/// entries ranked by score with the static rank as tie-break.
pub struct PortfolioScheduler<'a> {
    config: &'a EngineConfig,
}

impl<'a> PortfolioScheduler<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn plan_cycle(
        &self,
        portfolio: &PortfolioState,
        results: &HashMap<String, AnalysisResult>,
        factors: &DynamicFactorManager,
    ) -> Vec<TradeIntent> {
        let mut intents = Vec::new();
        let mut exiting = HashSet::new();

        // Deterministic iteration keeps the intent order stable across
        // runs with identical inputs.
        let mut open_positions: Vec<&Position> = portfolio.positions.values().collect();
        open_positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));

        // Step 1: exits. Stop-loss breach wins over profit targets.
        for position in &open_positions {
            let Some(result) = results.get(&position.instrument).filter(|r| r.is_ok()) else {
                continue;
            };
            let price = result.price;

            if price <= position.stop_loss {
                exiting.insert(position.instrument.clone());
                intents.push(self.exit_intent(position, result, IntentKind::FullClose, "stop_loss"));
                continue;
            }

            let first_target =
                position.avg_entry_price * (1.0 + self.config.risk.first_target_pct);
            let second_target =
                position.avg_entry_price * (1.0 + self.config.risk.second_target_pct);

            if price >= second_target && !position.second_target_hit {
                exiting.insert(position.instrument.clone());
                intents.push(self.exit_intent(
                    position,
                    result,
                    IntentKind::FullClose,
                    "second_target",
                ));
            } else if price >= first_target && !position.first_target_hit {
                exiting.insert(position.instrument.clone());
                intents.push(self.exit_intent(
                    position,
                    result,
                    IntentKind::FirstTargetClose,
                    "first_target",
                ));
            }
        }

        // Step 2: pyramids. Require an existing position below the entry
        // cap; these never consume a new-position slot.
        let mut pyramids = Vec::new();
        if self.config.pyramid.enabled {
            for position in &open_positions {
                if exiting.contains(&position.instrument) {
                    continue;
                }
                if position.entries.len() >= self.config.portfolio.max_entries_per_instrument {
                    continue;
                }
                let Some(result) = results.get(&position.instrument).filter(|r| r.is_ok()) else {
                    continue;
                };
                if result.score < self.config.pyramid.min_score {
                    continue;
                }
                if result.strength < self.config.pyramid.min_strength {
                    continue;
                }
                let required = position.last_entry_price()
                    * (1.0 + self.config.pyramid.min_price_increase_pct);
                if result.price < required {
                    continue;
                }
                if !self.config.pyramid.allowed_regimes.contains(&result.regime) {
                    continue;
                }
                pyramids.push(TradeIntent {
                    id: Uuid::new_v4(),
                    instrument: position.instrument.clone(),
                    kind: IntentKind::Pyramid,
                    reason: "pyramid",
                    score: result.score,
                    strength: result.strength,
                    reference_price: result.price,
                    atr: result.atr,
                    fired_conditions: result.fired_conditions.clone(),
                });
            }
            self.sort_by_priority(&mut pyramids);
        }
        intents.extend(pyramids);

        // Step 3: new entries, admitted against the pre-cycle open
        // count. Exits executed this cycle only free capacity for the
        // next one.
        let free_slots = self
            .config
            .portfolio
            .max_positions
            .saturating_sub(portfolio.open_count());
        let mut candidates = Vec::new();
        for result in results.values().filter(|result| result.is_ok()) {
            if portfolio.positions.contains_key(&result.instrument) {
                continue;
            }
            let snapshot = factors.snapshot(&result.instrument);
            let effective_min = snapshot.effective_min_score(result.regime);
            if (result.score as f64) < effective_min {
                continue;
            }
            candidates.push(TradeIntent {
                id: Uuid::new_v4(),
                instrument: result.instrument.clone(),
                kind: IntentKind::Open,
                reason: "entry_signal",
                score: result.score,
                strength: result.strength,
                reference_price: result.price,
                atr: result.atr,
                fired_conditions: result.fired_conditions.clone(),
            });
        }
        self.sort_by_priority(&mut candidates);
        if candidates.len() > free_slots {
            debug!(
                "Admission control dropped {} entry candidates ({} free slots)",
                candidates.len() - free_slots,
                free_slots
            );
        }
        intents.extend(candidates.into_iter().take(free_slots));

        intents
    }

    fn exit_intent(
        &self,
        position: &Position,
        result: &AnalysisResult,
        kind: IntentKind,
        reason: &'static str,
    ) -> TradeIntent {
        TradeIntent {
            id: Uuid::new_v4(),
            instrument: position.instrument.clone(),
            kind,
            reason,
            score: result.score,
            strength: result.strength,
            reference_price: result.price,
            atr: result.atr,
            fired_conditions: Vec::new(),
        }
    }

    /// Descending by score; equal scores fall back to the configured
    /// instrument rank, higher rank winning the slot.
    fn sort_by_priority(&self, intents: &mut [TradeIntent]) {
        intents.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| {
                    self.config
                        .rank_of(&b.instrument)
                        .cmp(&self.config.rank_of(&a.instrument))
                })
                .then_with(|| a.instrument.cmp(&b.instrument))
        });
    }
}
