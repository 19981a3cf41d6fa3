use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use level_signal_trader::config::Config;
use level_signal_trader::exchange::{OrderExchange, PaperExchange};
use level_signal_trader::models::{Direction, Signal};
use level_signal_trader::trading::{
    MemorySignalStore, OrderPlacementEngine, ReconciliationWatcher, SignalStore, TradingContext,
};

pub const PAIR: &str = "BTC/USDT";

pub fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-03T09:30:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn ctx() -> TradingContext {
    TradingContext::new(now(), true)
}

pub fn ctx_at(minutes_later: i64) -> TradingContext {
    TradingContext::new(now() + Duration::minutes(minutes_later), true)
}

pub fn config() -> Config {
    Config {
        live_trading_enabled: true,
        symbol_suffix: String::new(),
        exchange_timeout_secs: 1,
        ..Config::default()
    }
}

pub fn signal(id: u64, direction: Direction, level: f64, age_secs: i64) -> Signal {
    Signal::new(id, PAIR, direction, level, now() - Duration::seconds(age_secs))
}

pub struct Rig {
    pub store: Arc<MemorySignalStore>,
    pub exchange: Arc<PaperExchange>,
    pub engine: Arc<OrderPlacementEngine>,
    pub watcher: ReconciliationWatcher,
}

impl Rig {
    pub fn new(cfg: Config) -> Self {
        let store = Arc::new(MemorySignalStore::new());
        let exchange = Arc::new(PaperExchange::new(true));
        let dyn_store: Arc<dyn SignalStore> = store.clone();
        let dyn_exchange: Arc<dyn OrderExchange> = exchange.clone();
        let engine = Arc::new(OrderPlacementEngine::new(
            &cfg,
            dyn_store.clone(),
            dyn_exchange.clone(),
        ));
        let watcher = ReconciliationWatcher::new(&cfg, dyn_store, dyn_exchange, engine.clone());
        Self {
            store,
            exchange,
            engine,
            watcher,
        }
    }

    pub async fn add(&self, signal: Signal) -> Signal {
        self.store.insert(signal.clone()).await.unwrap();
        signal
    }

    pub async fn reload(&self, id: u64) -> Signal {
        self.store.get(id).await.unwrap().unwrap()
    }
}
