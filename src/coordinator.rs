use crate::analyzer;
use crate::config::{AnalysisSettings, InstrumentSpec};
use crate::factors::DynamicFactorManager;
use crate::market::MarketClient;
use crate::models::AnalysisResult;
use chrono::Utc;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Fans one analysis task per instrument out to a bounded worker pool
/// and collects the results behind a cycle-level deadline. Tasks only
/// read market data and factor snapshots; nothing shared is written.
pub struct AnalysisCoordinator<C> {
    client: Arc<C>,
    factors: Arc<DynamicFactorManager>,
    settings: AnalysisSettings,
}

impl<C: MarketClient + 'static> AnalysisCoordinator<C> {
    pub fn new(client: Arc<C>, factors: Arc<DynamicFactorManager>, settings: AnalysisSettings) -> Self {
        Self {
            client,
            factors,
            settings,
        }
    }

    /// Analyze every monitored instrument. A timed-out or failed task
    /// contributes an errored result; a straggler past the cycle
    /// deadline is abandoned and excluded from the map entirely.
    pub async fn analyze_all(
        &self,
        instruments: &[InstrumentSpec],
    ) -> HashMap<String, AnalysisResult> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_workers.max(1)));
        let task_timeout = Duration::from_secs(self.settings.analysis_timeout_secs);

        // The deadline covers queue waits for all batches plus a small
        // grace; past it the cycle proceeds with whatever finished.
        let batches = instruments
            .len()
            .div_ceil(self.settings.max_workers.max(1)) as u32;
        let deadline = Instant::now()
            + task_timeout * batches.max(1)
            + Duration::from_secs(self.settings.cycle_deadline_grace_secs);

        let mut handles = Vec::with_capacity(instruments.len());
        for spec in instruments {
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let factors = self.factors.snapshot(&spec.id);
            let instrument = spec.id.clone();
            let timeframe = self.settings.candle_timeframe.clone();
            let history = self.settings.candle_history;

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return AnalysisResult::failed(
                            &instrument,
                            "worker pool shut down",
                            Utc::now(),
                        )
                    }
                };
                let started = Utc::now();
                let fetch = client.get_candles(&instrument, &timeframe, history);
                match tokio::time::timeout(task_timeout, fetch).await {
                    Err(_) => {
                        let err = crate::error::EngineError::AnalysisTimeout {
                            instrument: instrument.clone(),
                        };
                        warn!("{}", err);
                        AnalysisResult::failed(&instrument, err.to_string(), Utc::now())
                    }
                    Ok(Err(err)) => {
                        AnalysisResult::failed(&instrument, err.to_string(), Utc::now())
                    }
                    Ok(Ok(candles)) => analyzer::analyze(&instrument, &candles, &factors, started),
                }
            });
            handles.push((spec.id.clone(), handle));
        }

        let mut results = HashMap::new();
        for (instrument, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(result)) => {
                    results.insert(instrument, result);
                }
                Ok(Err(join_err)) => {
                    warn!("Analysis task for {} aborted: {}", instrument, join_err);
                    results.insert(
                        instrument.clone(),
                        AnalysisResult::failed(
                            &instrument,
                            format!("analysis task aborted: {}", join_err),
                            Utc::now(),
                        ),
                    );
                }
                Err(_) => {
                    // Abandoned, not cancelled: the task only reads, so
                    // letting it run out is harmless.
                    warn!(
                        "Analysis for {} missed the cycle deadline; excluded this cycle",
                        instrument
                    );
                }
            }
        }
        debug!(
            "Analysis barrier complete: {}/{} instruments produced results",
            results.len(),
            instruments.len()
        );
        results
    }
}
