use crate::config::EngineConfig;
use crate::coordinator::AnalysisCoordinator;
use crate::error::EngineError;
use crate::factors::DynamicFactorManager;
use crate::ledger::LedgerHandle;
use crate::market::MarketClient;
use crate::models::{IntentKind, PortfolioState, TradeIntent};
use crate::notifier::{EventKind, Notifier};
use crate::performance::{ClosedTrade, PerformanceTracker};
use crate::regime::RegimeDetector;
use crate::scheduler::PortfolioScheduler;
use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PERFORMANCE_WINDOW_DAYS: i64 = 7;
const WATCHDOG_INTERVAL_MULTIPLIER: i64 = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    pub analyzed: usize,
    pub failed: usize,
    pub regime_changes: usize,
    pub intents_planned: usize,
    pub executed: usize,
    pub order_failures: usize,
}

/// Drives one decision cycle after another: analysis barrier, regime
/// and factor updates, scheduling, execution, notification. Everything
/// past the barrier runs single-threaded here.
pub struct Controller<C: MarketClient + 'static> {
    config: EngineConfig,
    client: Arc<C>,
    coordinator: AnalysisCoordinator<C>,
    regimes: RegimeDetector,
    factors: Arc<DynamicFactorManager>,
    ledger: LedgerHandle,
    notifier: Notifier,
    performance: PerformanceTracker,
    heartbeat: Arc<AtomicI64>,
}

impl<C: MarketClient + 'static> Controller<C> {
    pub fn new(config: EngineConfig, client: Arc<C>, ledger: LedgerHandle, notifier: Notifier) -> Self {
        let factors = Arc::new(DynamicFactorManager::new(config.factors.clone()));
        let coordinator =
            AnalysisCoordinator::new(client.clone(), factors.clone(), config.analysis.clone());
        Self {
            config,
            client,
            coordinator,
            regimes: RegimeDetector::new(),
            factors,
            ledger,
            notifier,
            performance: PerformanceTracker::new(PERFORMANCE_WINDOW_DAYS),
            heartbeat: Arc::new(AtomicI64::new(Utc::now().timestamp())),
        }
    }

    /// Run cycles forever at the configured interval. Per-instrument
    /// failures degrade a cycle, they never stop the loop; the watchdog
    /// ends the process if no cycle completes for far too long so the
    /// supervisor can restart it.
    pub async fn run(&mut self) -> Result<()> {
        self.spawn_watchdog();
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.analysis.cycle_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.run_cycle(false).await {
                Ok(report) => {
                    self.heartbeat.store(Utc::now().timestamp(), Ordering::SeqCst);
                    info!(
                        "Cycle complete: {} analyzed ({} failed), {} intents, {} executed, {} order failures",
                        report.analyzed,
                        report.failed,
                        report.intents_planned,
                        report.executed,
                        report.order_failures
                    );
                }
                Err(err) => {
                    error!("Cycle aborted: {:#}", err);
                    self.notifier.dispatch(
                        EventKind::CycleSummary,
                        serde_json::json!({ "aborted": true, "error": err.to_string() }),
                    );
                }
            }
        }
    }

    fn spawn_watchdog(&self) {
        let heartbeat = self.heartbeat.clone();
        let interval_secs = self.config.analysis.cycle_interval_secs as i64;
        let bound = interval_secs * WATCHDOG_INTERVAL_MULTIPLIER;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs as u64));
            loop {
                ticker.tick().await;
                let age = Utc::now().timestamp() - heartbeat.load(Ordering::SeqCst);
                if age > bound {
                    // A hang this long is not recoverable in-process;
                    // exit and let the supervisor restart us.
                    error!(
                        "No cycle completed for {}s (bound {}s); exiting for supervisor restart",
                        age, bound
                    );
                    std::process::exit(2);
                }
            }
        });
    }

    /// One full decision cycle. `dry_run` plans and logs intents but
    /// places no orders and mutates no state.
    pub async fn run_cycle(&mut self, dry_run: bool) -> Result<CycleReport> {
        let now = Utc::now();
        let mut report = CycleReport::default();

        let results = self.coordinator.analyze_all(&self.config.instruments).await;
        report.analyzed = results.len();
        report.failed = results.values().filter(|result| !result.is_ok()).count();

        // Post-barrier, single-threaded: commit regimes and run the
        // factor cadences from the data the workers returned.
        for result in results.values().filter(|result| result.is_ok()) {
            if let Some(change) =
                self.regimes
                    .commit(&result.instrument, result.regime, result.trend_gap_pct, now)
            {
                report.regime_changes += 1;
                self.notifier.dispatch(
                    EventKind::RegimeChange,
                    serde_json::json!({
                        "instrument": change.instrument,
                        "old": change.old.as_str(),
                        "new": change.new.as_str(),
                        "gapPct": change.gap_pct,
                    }),
                );
            }
            let atr_pct = if result.price > 0.0 {
                result.atr / result.price * 100.0
            } else {
                0.0
            };
            self.factors
                .apply_cycle_updates(&result.instrument, atr_pct, now, &self.performance);
        }

        for result in results.values().filter(|result| !result.is_ok()) {
            self.notifier.dispatch(
                EventKind::InstrumentSkipped,
                serde_json::json!({
                    "instrument": result.instrument,
                    "reason": result.error.clone().unwrap_or_default(),
                }),
            );
        }

        // Refresh trailing stops before exit evaluation so this cycle's
        // stop checks see current chandelier levels.
        if !dry_run {
            let portfolio = self.ledger.portfolio().await?;
            for (instrument, _position) in &portfolio.positions {
                let Some(result) = results.get(instrument).filter(|result| result.is_ok()) else {
                    continue;
                };
                let multiplier = self
                    .factors
                    .snapshot(instrument)
                    .stop_atr_multiplier
                    .value();
                if let Err(err) = self
                    .ledger
                    .update_trailing(instrument, result.price, result.atr, multiplier)
                    .await
                {
                    self.report_persistence_fault(&err);
                }
            }
        }

        let portfolio = self.ledger.portfolio().await?;
        let scheduler = PortfolioScheduler::new(&self.config);
        let intents = scheduler.plan_cycle(&portfolio, &results, &self.factors);
        report.intents_planned = intents.len();

        let mut persistence_faulted = false;
        for intent in &intents {
            if dry_run {
                info!(
                    "[dry-run] {} {} ({}, score {})",
                    intent.kind.side().as_str(),
                    intent.instrument,
                    intent.reason,
                    intent.score
                );
                continue;
            }
            // After a persistence fault, risk-increasing intents are
            // skipped for the rest of the cycle; exits still run.
            if persistence_faulted && !intent.kind.is_exit() {
                warn!(
                    "Skipping {} intent for {} while ledger persistence is faulted",
                    intent.reason, intent.instrument
                );
                continue;
            }
            match self.execute_intent(intent, &portfolio).await {
                Ok(true) => report.executed += 1,
                Ok(false) => {}
                Err(err) => {
                    if err.is_cycle_fatal() {
                        persistence_faulted = true;
                        self.report_persistence_fault(&err);
                    } else {
                        report.order_failures += 1;
                        warn!("Intent {} for {} failed: {}", intent.reason, intent.instrument, err);
                        self.notifier.dispatch(
                            EventKind::OrderFailed,
                            serde_json::json!({
                                "instrument": intent.instrument,
                                "reason": intent.reason,
                                "error": err.to_string(),
                            }),
                        );
                    }
                }
            }
        }

        self.notifier.dispatch(
            EventKind::CycleSummary,
            serde_json::json!({
                "analyzed": report.analyzed,
                "failed": report.failed,
                "intents": report.intents_planned,
                "executed": report.executed,
                "orderFailures": report.order_failures,
            }),
        );
        Ok(report)
    }

    /// Place the order, then apply the fill to the ledger. A failed
    /// order never mutates ledger state; the intent dies with the
    /// cycle.
    async fn execute_intent(
        &mut self,
        intent: &TradeIntent,
        portfolio: &PortfolioState,
    ) -> Result<bool, EngineError> {
        let side = intent.kind.side();
        let size = match intent.kind {
            IntentKind::Open => self.entry_size(intent),
            IntentKind::Pyramid => {
                self.entry_size(intent) * self.config.portfolio.pyramid_size_fraction
            }
            IntentKind::FirstTargetClose => portfolio
                .positions
                .get(&intent.instrument)
                .map(|position| position.size * 0.5)
                .unwrap_or(0.0),
            IntentKind::FullClose => portfolio
                .positions
                .get(&intent.instrument)
                .map(|position| position.size)
                .unwrap_or(0.0),
        };
        if size <= 0.0 || !size.is_finite() {
            return Ok(false);
        }

        let receipt = self
            .client
            .place_market_order(&intent.instrument, side, size)
            .await?;
        if !receipt.is_success() {
            return Err(EngineError::OrderExecution {
                instrument: intent.instrument.clone(),
                reason: "order rejected by exchange".to_string(),
            });
        }
        let filled_price = receipt.filled_price.unwrap_or(intent.reference_price);

        match intent.kind {
            IntentKind::Open | IntentKind::Pyramid => {
                let stop = self.initial_stop(intent, filled_price);
                let execution = self
                    .ledger
                    .apply_buy(
                        &intent.instrument,
                        filled_price,
                        size,
                        stop,
                        intent.fired_conditions.clone(),
                    )
                    .await?;
                if !execution.success {
                    warn!(
                        "Ledger refused {} fill for {}: {:?}",
                        intent.reason, intent.instrument, execution.error
                    );
                    return Ok(false);
                }
                self.notifier.dispatch(
                    EventKind::TradeExecuted,
                    serde_json::json!({
                        "instrument": intent.instrument,
                        "side": side.as_str(),
                        "reason": intent.reason,
                        "price": execution.filled_price,
                        "size": execution.filled_size,
                    }),
                );
            }
            IntentKind::FirstTargetClose | IntentKind::FullClose => {
                let arm_breakeven = intent.kind == IntentKind::FirstTargetClose;
                let outcome = self
                    .ledger
                    .apply_sell(&intent.instrument, filled_price, size, arm_breakeven)
                    .await?;
                if !outcome.execution.success {
                    warn!(
                        "Ledger refused {} fill for {}: {:?}",
                        intent.reason, intent.instrument, outcome.execution.error
                    );
                    return Ok(false);
                }
                if outcome.closed {
                    self.performance.record_close(ClosedTrade {
                        instrument: intent.instrument.clone(),
                        conditions: outcome.entry_conditions.clone(),
                        pnl: outcome.execution.realized_pnl.unwrap_or(0.0),
                        closed_at: Utc::now(),
                    });
                }
                self.notifier.dispatch(
                    EventKind::TradeExecuted,
                    serde_json::json!({
                        "instrument": intent.instrument,
                        "side": side.as_str(),
                        "reason": intent.reason,
                        "price": outcome.execution.filled_price,
                        "size": outcome.execution.filled_size,
                        "realizedPnl": outcome.execution.realized_pnl,
                        "closed": outcome.closed,
                    }),
                );
            }
        }
        Ok(true)
    }

    fn entry_size(&self, intent: &TradeIntent) -> f64 {
        if intent.reference_price <= 0.0 {
            return 0.0;
        }
        let multiplier = self
            .factors
            .snapshot(&intent.instrument)
            .size_multiplier
            .value();
        self.config.portfolio.trade_quote_size * multiplier / intent.reference_price
    }

    fn initial_stop(&self, intent: &TradeIntent, filled_price: f64) -> f64 {
        let multiplier = self
            .factors
            .snapshot(&intent.instrument)
            .stop_atr_multiplier
            .value();
        if intent.atr > 0.0 {
            (filled_price - intent.atr * multiplier).max(0.0)
        } else {
            filled_price * 0.95
        }
    }

    fn report_persistence_fault(&self, err: &EngineError) {
        error!("Ledger persistence fault: {}", err);
        self.notifier.dispatch(
            EventKind::PersistenceFault,
            serde_json::json!({ "error": err.to_string() }),
        );
    }
}
