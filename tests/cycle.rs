use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use helmsman::config::{
    AnalysisSettings, Bounds, EngineConfig, ExchangeSettings, FactorSettings, InstrumentSpec,
    LedgerSettings, NotifierSettings, PortfolioSettings, PyramidSettings, RiskSettings,
    VolatilityTierSettings,
};
use helmsman::controller::Controller;
use helmsman::error::EngineError;
use helmsman::ledger;
use helmsman::market::{MarketClient, OrderReceipt, OrderStatus};
use helmsman::models::{Candle, OrderSide, Regime};
use helmsman::notifier::{NotificationEvent, NotificationGateway, Notifier};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn temp_snapshot_path() -> PathBuf {
    std::env::temp_dir().join(format!("helmsman-cycle-{}.json", uuid::Uuid::new_v4()))
}

/// Long rally into a one-candle crash: the oversold conditions fire
/// while the long-horizon trend still reads strongly bullish.
fn dip_in_uptrend_closes() -> Vec<f64> {
    let mut closes: Vec<f64> = (0..85).map(|i| 100.0 + i as f64).collect();
    closes.extend(std::iter::repeat(185.0).take(14));
    closes.push(140.0);
    closes
}

fn quiet_closes() -> Vec<f64> {
    (0..100)
        .map(|i| 100.0 + if i % 2 == 0 { 0.1 } else { -0.1 })
        .collect()
}

struct ScriptedExchange {
    histories: HashMap<String, Vec<f64>>,
    orders: Mutex<Vec<(String, OrderSide, f64)>>,
}

impl ScriptedExchange {
    fn new(histories: HashMap<String, Vec<f64>>) -> Self {
        Self {
            histories,
            orders: Mutex::new(Vec::new()),
        }
    }

    fn placed_orders(&self) -> Vec<(String, OrderSide, f64)> {
        self.orders.lock().unwrap().clone()
    }
}

#[async_trait]
impl MarketClient for ScriptedExchange {
    async fn get_candles(
        &self,
        instrument: &str,
        _timeframe: &str,
        _count: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let closes = self
            .histories
            .get(instrument)
            .ok_or_else(|| EngineError::MarketData(format!("no history for {}", instrument)))?;
        let base = Utc::now() - ChronoDuration::minutes(closes.len() as i64 * 15);
        Ok(closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                instrument: instrument.to_string(),
                timestamp: base + ChronoDuration::minutes(i as i64 * 15),
                open: *close,
                high: close * 1.005,
                low: close * 0.995,
                close: *close,
                volume: 1000.0,
            })
            .collect())
    }

    async fn get_ticker(&self, instrument: &str) -> Result<f64, EngineError> {
        self.histories
            .get(instrument)
            .and_then(|closes| closes.last().copied())
            .ok_or_else(|| EngineError::MarketData(format!("no history for {}", instrument)))
    }

    async fn place_market_order(
        &self,
        instrument: &str,
        side: OrderSide,
        size: f64,
    ) -> Result<OrderReceipt, EngineError> {
        let price = self.get_ticker(instrument).await?;
        self.orders
            .lock()
            .unwrap()
            .push((instrument.to_string(), side, size));
        Ok(OrderReceipt {
            order_id: uuid::Uuid::new_v4().to_string(),
            status: OrderStatus::Filled,
            filled_price: Some(price),
        })
    }
}

struct CapturingGateway {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

#[async_trait]
impl NotificationGateway for CapturingGateway {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), EngineError> {
        self.events
            .lock()
            .unwrap()
            .push((event.kind.as_str().to_string(), event.payload.clone()));
        Ok(())
    }
}

fn test_config(snapshot_path: &PathBuf, instruments: Vec<InstrumentSpec>) -> EngineConfig {
    EngineConfig {
        instruments,
        portfolio: PortfolioSettings {
            max_positions: 2,
            max_entries_per_instrument: 3,
            trade_quote_size: 1000.0,
            pyramid_size_fraction: 0.5,
        },
        analysis: AnalysisSettings {
            max_workers: 3,
            analysis_timeout_secs: 5,
            cycle_interval_secs: 60,
            cycle_deadline_grace_secs: 2,
            candle_timeframe: "15m".to_string(),
            candle_history: 120,
        },
        risk: RiskSettings {
            first_target_pct: 0.03,
            second_target_pct: 0.08,
        },
        pyramid: PyramidSettings {
            enabled: true,
            min_score: 3,
            min_strength: 0.6,
            min_price_increase_pct: 0.01,
            allowed_regimes: vec![Regime::Bullish, Regime::StrongBullish],
        },
        factors: FactorSettings {
            stop_atr_multiplier: Bounds { min: 1.0, max: 4.0 },
            size_multiplier: Bounds { min: 0.25, max: 1.5 },
            oversold: Bounds {
                min: 20.0,
                max: 40.0,
            },
            overbought: Bounds {
                min: 60.0,
                max: 80.0,
            },
            min_entry_score: Bounds { min: 1.0, max: 4.0 },
            band_width_factor: Bounds { min: 0.8, max: 1.4 },
            volatility_tiers: VolatilityTierSettings {
                normal_atr_pct: 1.0,
                high_atr_pct: 3.0,
                extreme_atr_pct: 6.0,
            },
            volatility_shift_pct: 0.15,
        },
        exchange: ExchangeSettings {
            base_url: "http://localhost:9999".to_string(),
            request_timeout_secs: 2,
            max_retries: 1,
        },
        notifier: NotifierSettings {
            base_url: None,
            enabled: false,
        },
        ledger: LedgerSettings {
            snapshot_path: snapshot_path.display().to_string(),
        },
    }
}

fn standard_instruments() -> Vec<InstrumentSpec> {
    vec![
        InstrumentSpec {
            id: "BTC".to_string(),
            rank: 3,
        },
        InstrumentSpec {
            id: "ETH".to_string(),
            rank: 2,
        },
        InstrumentSpec {
            id: "SOL".to_string(),
            rank: 1,
        },
    ]
}

#[tokio::test]
async fn cycle_admits_entries_up_to_the_position_cap() {
    ensure_test_env();
    let path = temp_snapshot_path();
    let config = test_config(&path, standard_instruments());

    let mut histories = HashMap::new();
    for spec in &config.instruments {
        histories.insert(spec.id.clone(), dip_in_uptrend_closes());
    }
    let exchange = Arc::new(ScriptedExchange::new(histories));
    let ledger = ledger::spawn(&path, config.portfolio.max_entries_per_instrument).unwrap();
    let mut controller =
        Controller::new(config.clone(), exchange.clone(), ledger.clone(), Notifier::disabled());

    let report = controller.run_cycle(false).await.unwrap();
    assert_eq!(report.analyzed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.executed, 2, "admission stops at the free-slot cap");

    // Equal scores: the tie-break rank decides who gets the slots.
    let orders = exchange.placed_orders();
    assert_eq!(orders.len(), 2);
    assert!(orders
        .iter()
        .all(|(_, side, _)| *side == OrderSide::Buy));
    let filled: Vec<&str> = orders.iter().map(|(id, _, _)| id.as_str()).collect();
    assert_eq!(filled, vec!["BTC", "ETH"]);

    let portfolio = ledger.portfolio().await.unwrap();
    assert_eq!(portfolio.open_count(), 2);
    assert!(portfolio.open_count() <= config.portfolio.max_positions);
    assert!(portfolio.positions.contains_key("BTC"));
    assert!(portfolio.positions.contains_key("ETH"));
    assert!(!portfolio.positions.contains_key("SOL"));

    // The snapshot on disk reflects the executed state.
    let raw = std::fs::read_to_string(&path).unwrap();
    let persisted: HashMap<String, serde_json::Value> = serde_json::from_str(&raw).unwrap();
    assert_eq!(persisted.len(), 2);
    assert!(persisted["BTC"]["avgEntryPrice"].as_f64().unwrap() > 0.0);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn stop_breach_exits_before_new_entries_are_considered() {
    ensure_test_env();
    let path = temp_snapshot_path();
    let mut instruments = standard_instruments();
    instruments.push(InstrumentSpec {
        id: "DOGE".to_string(),
        rank: 4,
    });
    let config = test_config(&path, instruments);

    let mut histories = HashMap::new();
    for spec in &config.instruments {
        histories.insert(spec.id.clone(), dip_in_uptrend_closes());
    }
    let exchange = Arc::new(ScriptedExchange::new(histories));

    // Pre-seed a DOGE position whose stop sits far above the scripted
    // price (last close 140).
    let ledger = ledger::spawn(&path, config.portfolio.max_entries_per_instrument).unwrap();
    ledger
        .apply_buy("DOGE", 200.0, 1.0, 150.0, vec![])
        .await
        .unwrap();

    let mut controller =
        Controller::new(config.clone(), exchange.clone(), ledger.clone(), Notifier::disabled());
    let report = controller.run_cycle(false).await.unwrap();
    assert!(report.executed >= 2);

    let orders = exchange.placed_orders();
    // The stop-loss exit must run before any entry, even though every
    // fresh candidate scores higher than the dying position.
    assert_eq!(orders[0].0, "DOGE");
    assert_eq!(orders[0].1, OrderSide::Sell);
    assert!(orders[1..]
        .iter()
        .all(|(_, side, _)| *side == OrderSide::Buy));

    let portfolio = ledger.portfolio().await.unwrap();
    assert!(!portfolio.positions.contains_key("DOGE"));
    // Slot accounting used the pre-cycle open count: DOGE's slot is
    // only free from the next cycle on.
    assert_eq!(portfolio.open_count(), 1);
    assert!(portfolio.positions.contains_key("BTC"));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn dry_run_plans_without_placing_orders() {
    ensure_test_env();
    let path = temp_snapshot_path();
    let config = test_config(&path, standard_instruments());

    let mut histories = HashMap::new();
    for spec in &config.instruments {
        histories.insert(spec.id.clone(), dip_in_uptrend_closes());
    }
    let exchange = Arc::new(ScriptedExchange::new(histories));
    let ledger = ledger::spawn(&path, config.portfolio.max_entries_per_instrument).unwrap();
    let mut controller =
        Controller::new(config, exchange.clone(), ledger.clone(), Notifier::disabled());

    let report = controller.run_cycle(true).await.unwrap();
    assert!(report.intents_planned > 0);
    assert_eq!(report.executed, 0);
    assert!(exchange.placed_orders().is_empty());
    assert_eq!(ledger.portfolio().await.unwrap().open_count(), 0);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn failed_instruments_degrade_and_are_reported() {
    ensure_test_env();
    let path = temp_snapshot_path();
    let config = test_config(&path, standard_instruments());

    // SOL has no scripted history, so its market-data fetch fails and
    // the instrument degrades to a skip.
    let mut histories = HashMap::new();
    histories.insert("BTC".to_string(), dip_in_uptrend_closes());
    histories.insert("ETH".to_string(), quiet_closes());
    let exchange = Arc::new(ScriptedExchange::new(histories));

    let gateway = Arc::new(CapturingGateway {
        events: Mutex::new(Vec::new()),
    });
    let ledger = ledger::spawn(&path, config.portfolio.max_entries_per_instrument).unwrap();
    let mut controller = Controller::new(
        config,
        exchange.clone(),
        ledger.clone(),
        Notifier::new(gateway.clone()),
    );

    let report = controller.run_cycle(false).await.unwrap();
    assert_eq!(report.analyzed, 3);
    assert_eq!(report.failed, 1);

    // Fire-and-forget notifications drain shortly after the cycle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let events = gateway.events.lock().unwrap().clone();
    let kinds: Vec<&str> = events.iter().map(|(kind, _)| kind.as_str()).collect();
    assert!(kinds.contains(&"instrument_skipped"));
    assert!(kinds.contains(&"cycle_summary"));
    let skipped = events
        .iter()
        .find(|(kind, _)| kind == "instrument_skipped")
        .unwrap();
    assert_eq!(skipped.1["instrument"], "SOL");

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn restart_restores_positions_before_the_next_cycle() {
    ensure_test_env();
    let path = temp_snapshot_path();
    let config = test_config(&path, standard_instruments());

    let mut histories = HashMap::new();
    for spec in &config.instruments {
        histories.insert(spec.id.clone(), dip_in_uptrend_closes());
    }
    let exchange = Arc::new(ScriptedExchange::new(histories));

    {
        let ledger = ledger::spawn(&path, config.portfolio.max_entries_per_instrument).unwrap();
        let mut controller = Controller::new(
            config.clone(),
            exchange.clone(),
            ledger,
            Notifier::disabled(),
        );
        controller.run_cycle(false).await.unwrap();
    }

    // Fresh process: the ledger restores synchronously and a second
    // cycle sees a full book, so no further entries are admitted.
    let ledger = ledger::spawn(&path, config.portfolio.max_entries_per_instrument).unwrap();
    let restored = ledger.portfolio().await.unwrap();
    assert_eq!(restored.open_count(), 2);
    let btc = &restored.positions["BTC"];
    assert!((btc.avg_entry_price - 140.0).abs() < 1e-6);

    let orders_before = exchange.placed_orders().len();
    let mut controller = Controller::new(
        config.clone(),
        exchange.clone(),
        ledger.clone(),
        Notifier::disabled(),
    );
    controller.run_cycle(false).await.unwrap();
    let portfolio = ledger.portfolio().await.unwrap();
    assert!(portfolio.open_count() <= config.portfolio.max_positions);
    // Held instruments cannot be opened again; only exits or pyramids
    // could have produced additional orders.
    let new_orders = &exchange.placed_orders()[orders_before..];
    assert!(new_orders
        .iter()
        .all(|(id, _, _)| id == "BTC" || id == "ETH"));

    let _ = std::fs::remove_file(&path);
}
