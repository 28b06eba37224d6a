use thiserror::Error;

/// Engine-level failure classes. Per-instrument failures are isolated
/// and degrade the cycle; only persistence faults halt order placement.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("analysis for {instrument} timed out")]
    AnalysisTimeout { instrument: String },

    #[error("market data request failed: {0}")]
    MarketData(String),

    #[error("order execution failed for {instrument}: {reason}")]
    OrderExecution { instrument: String, reason: String },

    #[error("ledger snapshot persistence failed: {0}")]
    Persistence(String),

    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("notification delivery failed: {0}")]
    Notification(String),

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),
}

impl EngineError {
    /// Only persistence faults are cycle-fatal; everything else is
    /// reported and skipped.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, EngineError::Persistence(_))
    }
}
