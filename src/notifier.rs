use crate::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RegimeChange,
    TradeExecuted,
    OrderFailed,
    InstrumentSkipped,
    PersistenceFault,
    CycleSummary,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RegimeChange => "regime_change",
            EventKind::TradeExecuted => "trade_executed",
            EventKind::OrderFailed => "order_failed",
            EventKind::InstrumentSkipped => "instrument_skipped",
            EventKind::PersistenceFault => "persistence_fault",
            EventKind::CycleSummary => "cycle_summary",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), EngineError>;
}

pub struct HttpNotificationGateway {
    http: Client,
    base_url: String,
}

impl HttpNotificationGateway {
    pub fn new(base_url: &str) -> Result<Self, EngineError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| EngineError::Notification(format!("cannot build http client: {}", err)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl NotificationGateway for HttpNotificationGateway {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), EngineError> {
        let url = format!("{}/notify", self.base_url);
        let body = serde_json::json!({
            "eventKind": event.kind.as_str(),
            "payload": event.payload,
            "timestamp": event.timestamp.to_rfc3339(),
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| EngineError::Notification(err.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::Notification(format!(
                "gateway returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Fire-and-forget dispatcher. Every event gets its own bounded-retry
/// task; a slow or failing gateway can never stall a trading decision.
#[derive(Clone)]
pub struct Notifier {
    gateway: Option<Arc<dyn NotificationGateway>>,
}

impl Notifier {
    pub fn new(gateway: Arc<dyn NotificationGateway>) -> Self {
        Self {
            gateway: Some(gateway),
        }
    }

    pub fn disabled() -> Self {
        Self { gateway: None }
    }

    pub fn dispatch(&self, kind: EventKind, payload: Value) {
        let Some(gateway) = self.gateway.clone() else {
            return;
        };
        let event = NotificationEvent {
            kind,
            payload,
            timestamp: Utc::now(),
        };
        tokio::spawn(async move {
            let mut delay = BASE_DELAY;
            for attempt in 1..=MAX_ATTEMPTS {
                match gateway.notify(&event).await {
                    Ok(()) => return,
                    Err(err) if attempt == MAX_ATTEMPTS => {
                        warn!(
                            "Dropping {} notification after {} attempts: {}",
                            event.kind.as_str(),
                            MAX_ATTEMPTS,
                            err
                        );
                    }
                    Err(err) => {
                        warn!(
                            "Notification attempt {}/{} for {} failed: {}",
                            attempt,
                            MAX_ATTEMPTS,
                            event.kind.as_str(),
                            err
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyGateway {
        attempts: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl NotificationGateway for FlakyGateway {
        async fn notify(&self, _event: &NotificationEvent) -> Result<(), EngineError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= self.succeed_on {
                Ok(())
            } else {
                Err(EngineError::Notification("scripted failure".to_string()))
            }
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn retries_until_the_gateway_accepts() {
        let gateway = Arc::new(FlakyGateway {
            attempts: AtomicU32::new(0),
            succeed_on: 3,
        });
        let notifier = Notifier::new(gateway.clone());
        notifier.dispatch(EventKind::CycleSummary, serde_json::json!({"ok": true}));

        // Paused time: sleeps auto-advance, so the retries drain fast.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if gateway.attempts.load(Ordering::SeqCst) >= 3 {
                break;
            }
        }
        assert_eq!(gateway.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let gateway = Arc::new(FlakyGateway {
            attempts: AtomicU32::new(0),
            succeed_on: u32::MAX,
        });
        let notifier = Notifier::new(gateway.clone());
        notifier.dispatch(EventKind::OrderFailed, serde_json::json!({}));

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(gateway.attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn disabled_notifier_is_a_no_op() {
        let notifier = Notifier::disabled();
        notifier.dispatch(EventKind::RegimeChange, serde_json::json!({}));
    }
}
