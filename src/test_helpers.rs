use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::config::Config;
use crate::exchange::{OrderExchange, PaperExchange};
use crate::models::{Direction, Signal};
use crate::trading::{
    BreakevenManager, MemorySignalStore, OrderPlacementEngine, ReconciliationWatcher, SignalStore,
    TradingContext,
};

/// Fixed clock used by unit tests.
pub fn test_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn live_ctx() -> TradingContext {
    TradingContext::new(test_now(), true)
}

/// Live trading on, bare pair symbols, short exchange timeout.
pub fn default_test_config() -> Config {
    Config {
        live_trading_enabled: true,
        symbol_suffix: String::new(),
        exchange_timeout_secs: 1,
        ..Config::default()
    }
}

/// Active BTC/USDT signal created `age_secs` before `test_now()`.
pub fn make_signal(id: u64, direction: Direction, level: f64, age_secs: i64) -> Signal {
    Signal::new(
        id,
        "BTC/USDT",
        direction,
        level,
        test_now() - Duration::seconds(age_secs),
    )
}

pub struct Harness {
    pub store: Arc<MemorySignalStore>,
    pub exchange: Arc<PaperExchange>,
    pub engine: Arc<OrderPlacementEngine>,
    pub watcher: ReconciliationWatcher,
    pub breakeven: BreakevenManager,
}

impl Harness {
    pub async fn insert(&self, signal: Signal) -> Signal {
        self.store.insert(signal.clone()).await.unwrap();
        signal
    }
}

pub fn harness() -> Harness {
    harness_with(default_test_config())
}

pub fn harness_with(cfg: Config) -> Harness {
    let store = Arc::new(MemorySignalStore::new());
    let exchange = Arc::new(PaperExchange::new(true));
    let dyn_store: Arc<dyn SignalStore> = store.clone();
    let dyn_exchange: Arc<dyn OrderExchange> = exchange.clone();
    let engine = Arc::new(OrderPlacementEngine::new(
        &cfg,
        dyn_store.clone(),
        dyn_exchange.clone(),
    ));
    let watcher =
        ReconciliationWatcher::new(&cfg, dyn_store.clone(), dyn_exchange.clone(), engine.clone());
    let breakeven = BreakevenManager::new(&cfg, dyn_store, dyn_exchange);
    Harness {
        store,
        exchange,
        engine,
        watcher,
        breakeven,
    }
}
