use crate::error::EngineError;
use crate::models::{
    EntryCondition, ExecutionResult, PortfolioState, Position, PositionSnapshot, DUST_EPSILON,
};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

const REQUEST_QUEUE_DEPTH: usize = 64;

/// Outcome of a SELL applied to the ledger.
#[derive(Debug, Clone)]
pub struct SellOutcome {
    pub execution: ExecutionResult,
    pub closed: bool,
    pub entry_conditions: Vec<EntryCondition>,
}

enum LedgerRequest {
    ApplyBuy {
        instrument: String,
        price: f64,
        size: f64,
        stop_loss: f64,
        conditions: Vec<EntryCondition>,
        timestamp: DateTime<Utc>,
        reply: oneshot::Sender<Result<ExecutionResult, EngineError>>,
    },
    ApplySell {
        instrument: String,
        price: f64,
        size: f64,
        arm_breakeven: bool,
        reply: oneshot::Sender<Result<SellOutcome, EngineError>>,
    },
    UpdateTrailing {
        instrument: String,
        price: f64,
        atr: f64,
        multiplier: f64,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<PortfolioState>,
    },
}

/// Handle to the single-owner ledger actor. All position mutation flows
/// through this channel; the actor persists the full snapshot before
/// answering, so callers never observe unpersisted state.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<LedgerRequest>,
}

impl LedgerHandle {
    pub async fn apply_buy(
        &self,
        instrument: &str,
        price: f64,
        size: f64,
        stop_loss: f64,
        conditions: Vec<EntryCondition>,
    ) -> Result<ExecutionResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerRequest::ApplyBuy {
            instrument: instrument.to_string(),
            price,
            size,
            stop_loss,
            conditions,
            timestamp: Utc::now(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::LedgerUnavailable("ledger actor dropped reply".to_string()))?
    }

    pub async fn apply_sell(
        &self,
        instrument: &str,
        price: f64,
        size: f64,
        arm_breakeven: bool,
    ) -> Result<SellOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerRequest::ApplySell {
            instrument: instrument.to_string(),
            price,
            size,
            arm_breakeven,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::LedgerUnavailable("ledger actor dropped reply".to_string()))?
    }

    pub async fn update_trailing(
        &self,
        instrument: &str,
        price: f64,
        atr: f64,
        multiplier: f64,
    ) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerRequest::UpdateTrailing {
            instrument: instrument.to_string(),
            price,
            atr,
            multiplier,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::LedgerUnavailable("ledger actor dropped reply".to_string()))?
    }

    /// Read-only clone of the position map for the scheduler.
    pub async fn portfolio(&self) -> Result<PortfolioState, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerRequest::Snapshot { reply }).await?;
        rx.await
            .map_err(|_| EngineError::LedgerUnavailable("ledger actor dropped reply".to_string()))
    }

    async fn send(&self, request: LedgerRequest) -> Result<(), EngineError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::LedgerUnavailable("ledger actor stopped".to_string()))
    }
}

struct LedgerActor {
    positions: HashMap<String, Position>,
    path: PathBuf,
    max_entries_per_instrument: usize,
    /// Latched after a failed snapshot write; blocks new BUYs until a
    /// later write succeeds. SELLs stay allowed since reducing risk is
    /// safer than stranding it.
    halted: bool,
}

/// Load the last snapshot synchronously, then start the actor. No
/// intent is accepted before the restore completes.
pub fn spawn(
    path: impl AsRef<Path>,
    max_entries_per_instrument: usize,
) -> Result<LedgerHandle, EngineError> {
    let path = path.as_ref().to_path_buf();
    let positions = load_snapshot(&path)?;
    if !positions.is_empty() {
        info!(
            "Restored {} position(s) from {}",
            positions.len(),
            path.display()
        );
    }

    let (tx, mut rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let mut actor = LedgerActor {
        positions,
        path,
        max_entries_per_instrument,
        halted: false,
    };
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            actor.handle(request);
        }
    });
    Ok(LedgerHandle { tx })
}

fn load_snapshot(path: &Path) -> Result<HashMap<String, Position>, EngineError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| EngineError::Persistence(format!("cannot read snapshot: {}", err)))?;
    let snapshots: HashMap<String, PositionSnapshot> = serde_json::from_str(&raw)
        .map_err(|err| EngineError::Persistence(format!("corrupt snapshot: {}", err)))?;
    let restored_at = Utc::now();
    Ok(snapshots
        .into_iter()
        .map(|(instrument, snapshot)| {
            let position = snapshot.into_position(&instrument, restored_at);
            (instrument, position)
        })
        .collect())
}

impl LedgerActor {
    fn handle(&mut self, request: LedgerRequest) {
        match request {
            LedgerRequest::ApplyBuy {
                instrument,
                price,
                size,
                stop_loss,
                conditions,
                timestamp,
                reply,
            } => {
                let result = self.apply_buy(&instrument, price, size, stop_loss, conditions, timestamp);
                let _ = reply.send(result);
            }
            LedgerRequest::ApplySell {
                instrument,
                price,
                size,
                arm_breakeven,
                reply,
            } => {
                let result = self.apply_sell(&instrument, price, size, arm_breakeven);
                let _ = reply.send(result);
            }
            LedgerRequest::UpdateTrailing {
                instrument,
                price,
                atr,
                multiplier,
                reply,
            } => {
                let result = self.update_trailing(&instrument, price, atr, multiplier);
                let _ = reply.send(result);
            }
            LedgerRequest::Snapshot { reply } => {
                let _ = reply.send(PortfolioState {
                    positions: self.positions.clone(),
                });
            }
        }
    }

    fn apply_buy(
        &mut self,
        instrument: &str,
        price: f64,
        size: f64,
        stop_loss: f64,
        conditions: Vec<EntryCondition>,
        timestamp: DateTime<Utc>,
    ) -> Result<ExecutionResult, EngineError> {
        if self.halted {
            return Err(EngineError::Persistence(
                "ledger halted after failed snapshot write; refusing new entries".to_string(),
            ));
        }
        if !(price.is_finite() && price > 0.0 && size.is_finite() && size > 0.0) {
            return Ok(ExecutionResult::rejected(format!(
                "unusable fill (price {}, size {})",
                price, size
            )));
        }

        match self.positions.get_mut(instrument) {
            Some(position) => {
                if position.entries.len() >= self.max_entries_per_instrument {
                    return Ok(ExecutionResult::rejected(format!(
                        "entry cap {} reached for {}",
                        self.max_entries_per_instrument, instrument
                    )));
                }
                position.add_entry(price, size, timestamp);
            }
            None => {
                self.positions.insert(
                    instrument.to_string(),
                    Position::open(instrument, price, size, stop_loss, conditions, timestamp),
                );
            }
        }

        self.persist()?;
        Ok(ExecutionResult {
            success: true,
            filled_price: price,
            filled_size: size,
            realized_pnl: None,
            error: None,
        })
    }

    fn apply_sell(
        &mut self,
        instrument: &str,
        price: f64,
        size: f64,
        arm_breakeven: bool,
    ) -> Result<SellOutcome, EngineError> {
        let Some(position) = self.positions.get_mut(instrument) else {
            return Ok(SellOutcome {
                execution: ExecutionResult::rejected(format!("no open position for {}", instrument)),
                closed: false,
                entry_conditions: Vec::new(),
            });
        };

        let sold = size.min(position.size);
        let realized_pnl = (price - position.avg_entry_price) * sold;
        let entry_conditions = position.entry_conditions.clone();
        position.reduce(sold);

        if arm_breakeven {
            position.first_target_hit = true;
            // Breakeven or beyond: the stop can only move up from here.
            position.stop_loss = position.stop_loss.max(position.avg_entry_price);
        }

        let closed = position.is_dust();
        if closed {
            self.positions.remove(instrument);
        }

        self.persist()?;
        Ok(SellOutcome {
            execution: ExecutionResult {
                success: true,
                filled_price: price,
                filled_size: sold,
                realized_pnl: Some(realized_pnl),
                error: None,
            },
            closed,
            entry_conditions,
        })
    }

    fn update_trailing(
        &mut self,
        instrument: &str,
        price: f64,
        atr: f64,
        multiplier: f64,
    ) -> Result<(), EngineError> {
        let Some(position) = self.positions.get_mut(instrument) else {
            return Ok(());
        };
        if price > position.highest_price {
            position.highest_price = price;
        }
        if atr > 0.0 && multiplier > 0.0 {
            let candidate = position.highest_price - atr * multiplier;
            if position.first_target_hit {
                // Monotonic after the first target: ratchet only.
                position.stop_loss = position.stop_loss.max(candidate);
            } else {
                position.stop_loss = candidate.max(0.0);
            }
        }
        self.persist()
    }

    /// Serialize the whole map and atomically replace the snapshot
    /// file. Runs inside the actor, so no request is answered before
    /// the state it produced is durable.
    fn persist(&mut self) -> Result<(), EngineError> {
        let snapshots: HashMap<&String, PositionSnapshot> = self
            .positions
            .iter()
            .map(|(instrument, position)| (instrument, PositionSnapshot::from_position(position)))
            .collect();
        let payload = serde_json::to_string_pretty(&snapshots)
            .map_err(|err| EngineError::Persistence(format!("serialize failed: {}", err)))?;

        let tmp_path = PathBuf::from(format!("{}.tmp", self.path.display()));
        let write_result = fs::write(&tmp_path, payload)
            .and_then(|_| fs::rename(&tmp_path, &self.path));

        match write_result {
            Ok(()) => {
                if self.halted {
                    warn!("Snapshot write recovered; lifting ledger halt");
                    self.halted = false;
                }
                Ok(())
            }
            Err(err) => {
                self.halted = true;
                error!(
                    "Snapshot write to {} failed: {}. Halting new entries.",
                    self.path.display(),
                    err
                );
                Err(EngineError::Persistence(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_snapshot_path() -> PathBuf {
        std::env::temp_dir().join(format!("helmsman-ledger-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn buy_persists_and_restores_across_restart() {
        let path = temp_snapshot_path();
        {
            let ledger = spawn(&path, 3).unwrap();
            ledger
                .apply_buy("BTC", 100.0, 1.0, 90.0, vec![EntryCondition::Rsi])
                .await
                .unwrap();
            ledger.apply_buy("BTC", 110.0, 1.0, 90.0, vec![]).await.unwrap();
        }

        let ledger = spawn(&path, 3).unwrap();
        let portfolio = ledger.portfolio().await.unwrap();
        let position = &portfolio.positions["BTC"];
        assert_eq!(position.entries.len(), 2);
        assert!((position.avg_entry_price - 105.0).abs() < 1e-9);
        assert!((position.size - 2.0).abs() < 1e-9);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn entry_cap_refuses_further_pyramids() {
        let path = temp_snapshot_path();
        let ledger = spawn(&path, 2).unwrap();
        ledger.apply_buy("BTC", 100.0, 1.0, 90.0, vec![]).await.unwrap();
        ledger.apply_buy("BTC", 105.0, 1.0, 90.0, vec![]).await.unwrap();
        let refused = ledger.apply_buy("BTC", 110.0, 1.0, 90.0, vec![]).await.unwrap();
        assert!(!refused.success);
        assert!(refused.error.unwrap_or_default().contains("entry cap"));

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn full_sell_removes_dust_and_reports_pnl() {
        let path = temp_snapshot_path();
        let ledger = spawn(&path, 3).unwrap();
        ledger.apply_buy("BTC", 100.0, 2.0, 90.0, vec![]).await.unwrap();

        let outcome = ledger.apply_sell("BTC", 120.0, 2.0, false).await.unwrap();
        assert!(outcome.closed);
        assert!((outcome.execution.realized_pnl.unwrap() - 40.0).abs() < 1e-9);

        let portfolio = ledger.portfolio().await.unwrap();
        assert!(portfolio.positions.is_empty());

        // The persisted snapshot must not contain residual entries.
        let raw = fs::read_to_string(&path).unwrap();
        let parsed: HashMap<String, PositionSnapshot> = serde_json::from_str(&raw).unwrap();
        assert!(parsed.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn near_zero_residual_is_purged() {
        let path = temp_snapshot_path();
        let ledger = spawn(&path, 3).unwrap();
        ledger.apply_buy("BTC", 100.0, 1.0, 90.0, vec![]).await.unwrap();
        let outcome = ledger
            .apply_sell("BTC", 100.0, 1.0 - 1e-9, false)
            .await
            .unwrap();
        assert!(outcome.closed);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn breakeven_arm_makes_stop_monotonic() {
        let path = temp_snapshot_path();
        let ledger = spawn(&path, 3).unwrap();
        ledger.apply_buy("BTC", 100.0, 2.0, 92.0, vec![]).await.unwrap();

        // First target: half out, stop to breakeven.
        let outcome = ledger.apply_sell("BTC", 103.0, 1.0, true).await.unwrap();
        assert!(!outcome.closed);
        let portfolio = ledger.portfolio().await.unwrap();
        let stop_after_arm = portfolio.positions["BTC"].stop_loss;
        assert!(stop_after_arm >= 100.0);

        // Trailing updates can only raise the stop from here, even when
        // the chandelier candidate would sit lower.
        ledger.update_trailing("BTC", 104.0, 10.0, 3.0).await.unwrap();
        let portfolio = ledger.portfolio().await.unwrap();
        assert!(portfolio.positions["BTC"].stop_loss >= stop_after_arm);

        ledger.update_trailing("BTC", 115.0, 2.0, 2.0).await.unwrap();
        let portfolio = ledger.portfolio().await.unwrap();
        let final_stop = portfolio.positions["BTC"].stop_loss;
        assert!(final_stop >= stop_after_arm);
        assert!((portfolio.positions["BTC"].highest_price - 115.0).abs() < 1e-9);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn failed_snapshot_write_halts_new_entries() {
        let path = PathBuf::from("/nonexistent-helmsman-dir/positions.json");
        let ledger = spawn(&path, 3).unwrap();

        let err = ledger
            .apply_buy("BTC", 100.0, 1.0, 90.0, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));

        // The halt latch now refuses entries outright.
        let err = ledger
            .apply_buy("ETH", 100.0, 1.0, 90.0, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
    }

    #[tokio::test]
    async fn sell_against_unknown_instrument_is_rejected_cleanly() {
        let path = temp_snapshot_path();
        let ledger = spawn(&path, 3).unwrap();
        let outcome = ledger.apply_sell("BTC", 100.0, 1.0, false).await.unwrap();
        assert!(!outcome.execution.success);
        assert!(!outcome.closed);

        let _ = fs::remove_file(&path);
    }
}
