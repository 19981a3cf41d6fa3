use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use level_signal_trader::config::SharedConfig;
use level_signal_trader::core::OrderParams;
use level_signal_trader::exchange::paper::ClosedPosition;
use level_signal_trader::exchange::{OrderExchange, PaperExchange, PriceSource};
use level_signal_trader::models::{Direction, Signal, SignalStatus};
use level_signal_trader::trading::{
    Bucket, OrderPlacementEngine, Outcome, ReconciliationWatcher, SignalStore, TradingContext,
};

/// One JSON line on stdin from the upstream signal detector.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Intake {
    Signal {
        id: u64,
        pair: String,
        direction: Direction,
        level_price: f64,
        #[serde(default)]
        entry_price: Option<f64>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Close {
        id: u64,
        status: SignalStatus,
        #[serde(default)]
        exit_price: Option<f64>,
    },
}

pub struct SignalTrader {
    config: SharedConfig,
    store: Arc<dyn SignalStore>,
    exchange: Arc<PaperExchange>,
    prices: Box<dyn PriceSource>,
    engine: Arc<OrderPlacementEngine>,
    watcher: ReconciliationWatcher,
    params: OrderParams,
}

impl SignalTrader {
    pub async fn new(
        config: SharedConfig,
        store: Arc<dyn SignalStore>,
        exchange: Arc<PaperExchange>,
        prices: Box<dyn PriceSource>,
    ) -> Self {
        let cfg = config.read().await;

        info!("{}", "=".repeat(60));
        info!("Level signal trader starting up");
        info!(
            "Mode: {}",
            if cfg.live_trading_enabled {
                "LIVE TRADING"
            } else {
                "LIVE TRADING DISABLED"
            }
        );
        info!("Auto trading: {}", cfg.auto_trading_enabled);
        info!("Store: {}", cfg.store_path);
        info!(
            "Order size: {} USDT, TP {}%, SL {}%, entry corridor {}%",
            cfg.order_size_usdt, cfg.take_profit_pct, cfg.stop_loss_pct, cfg.entry_max_deviation_pct
        );
        info!(
            "Sweep every {}s, max signal age {}s",
            cfg.sweep_interval_secs, cfg.max_signal_age_secs
        );
        info!("{}", "=".repeat(60));

        let dyn_exchange: Arc<dyn OrderExchange> = exchange.clone();
        let engine = Arc::new(OrderPlacementEngine::new(
            &cfg,
            store.clone(),
            dyn_exchange.clone(),
        ));
        let watcher = ReconciliationWatcher::new(&cfg, store.clone(), dyn_exchange, engine.clone());
        let params = OrderParams::new(&cfg);

        drop(cfg);

        Self {
            config,
            store,
            exchange,
            prices,
            engine,
            watcher,
            params,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Reading signals from stdin. Press Ctrl+C to stop.");

        let (tx, mut rx) = mpsc::channel::<Intake>(64);
        tokio::spawn(read_intake(tx));

        let (sweep_secs, refresh_secs) = {
            let cfg = self.config.read().await;
            (cfg.sweep_interval_secs.max(1), cfg.price_refresh_secs.max(1))
        };
        let mut sweep_timer = tokio::time::interval(Duration::from_secs(sweep_secs));
        let mut refresh_timer = tokio::time::interval(Duration::from_secs(refresh_secs));

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    self.shutdown().await;
                    return Ok(());
                }
                Some(msg) = rx.recv() => self.handle_intake(msg).await,
                _ = refresh_timer.tick() => self.refresh_prices().await,
                _ = sweep_timer.tick() => self.run_sweep().await,
            }
        }
    }

    async fn handle_intake(&self, msg: Intake) {
        match msg {
            Intake::Signal {
                id,
                pair,
                direction,
                level_price,
                entry_price,
                timestamp,
            } => {
                let mut signal =
                    Signal::new(id, pair, direction, level_price, timestamp.unwrap_or_else(Utc::now));
                signal.entry_price = entry_price;
                if let Err(e) = self.store.insert(signal.clone()).await {
                    warn!("Signal #{} not stored: {}", id, e);
                    return;
                }
                info!(
                    "New signal #{}: {} {} @ {:.4}",
                    id, signal.direction, signal.pair, signal.level_price
                );
                self.attempt_new(&signal).await;
            }
            Intake::Close {
                id,
                status,
                exit_price,
            } => {
                match self
                    .store
                    .set_market_status(id, status, exit_price, Some(Utc::now()))
                    .await
                {
                    Ok(()) => info!("Signal #{} closed upstream: {}", id, status),
                    Err(e) => warn!("Close for signal #{} failed: {}", id, e),
                }
            }
        }
    }

    async fn attempt_new(&self, signal: &Signal) {
        let cfg = self.config.read().await.clone();
        if !cfg.auto_trading_enabled {
            debug!("Auto trading off, signal #{} left for later", signal.id);
            return;
        }

        let price = self.fetch_price(&signal.pair).await.unwrap_or(f64::NAN);
        let ctx = TradingContext::from_config(&cfg);
        match self.engine.attempt(signal, price, &ctx).await {
            Ok(Outcome::Submitted { order_id, status }) => {
                info!("Signal #{} submitted: {} ({})", signal.id, order_id, status)
            }
            Ok(outcome) => debug!("Signal #{}: {:?}", signal.id, outcome),
            Err(e) => error!("Signal #{} attempt failed: {:#}", signal.id, e),
        }
    }

    /// Latest price from the feed, mirrored into the paper exchange.
    async fn fetch_price(&self, pair: &str) -> Option<f64> {
        match self.prices.current_price(pair).await {
            Ok(price) => {
                let closed = self
                    .exchange
                    .set_price(&self.params.map_symbol(pair), price)
                    .await;
                self.sync_closed(closed).await;
                Some(price)
            }
            Err(e) => {
                debug!("Price refresh {}: {}", pair, e);
                None
            }
        }
    }

    async fn refresh_prices(&self) {
        let pairs = match self.store.active_pairs().await {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!("Could not list active pairs: {}", e);
                return;
            }
        };
        for pair in pairs {
            self.fetch_price(&pair).await;
        }
    }

    /// Mark signals whose paper position hit TP or SL as closed.
    async fn sync_closed(&self, closed: Vec<ClosedPosition>) {
        if closed.is_empty() {
            return;
        }
        let positions = match self.store.query(Bucket::Positions).await {
            Ok(signals) => signals,
            Err(e) => {
                warn!("Position query failed: {}", e);
                return;
            }
        };
        for pos in closed {
            for signal in positions.iter().filter(|s| {
                s.direction == pos.direction && self.params.map_symbol(&s.pair) == pos.pair
            }) {
                match self
                    .store
                    .set_market_status(signal.id, pos.outcome, Some(pos.exit_price), Some(Utc::now()))
                    .await
                {
                    Ok(()) => info!(
                        "Signal #{} {} at {:.4} (entry {:.4})",
                        signal.id, pos.outcome, pos.exit_price, pos.entry_price
                    ),
                    Err(e) => warn!("Signal #{} close sync failed: {}", signal.id, e),
                }
            }
        }
    }

    async fn run_sweep(&self) {
        let cfg = self.config.read().await.clone();
        if !cfg.auto_trading_enabled {
            debug!("Auto trading off, sweep skipped");
            return;
        }
        let ctx = TradingContext::from_config(&cfg);
        if let Err(e) = self.watcher.sweep(&ctx).await {
            error!("Sweep aborted: {:#}", e);
        }
    }

    async fn shutdown(&self) {
        info!("{}", "=".repeat(60));
        info!("Shutting down...");
        match self.store.active_pairs().await {
            Ok(pairs) => info!("Active pairs at shutdown: {}", pairs.join(", ")),
            Err(e) => warn!("Could not list active pairs: {}", e),
        }
        info!("{}", "=".repeat(60));
    }
}

async fn read_intake(tx: mpsc::Sender<Intake>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Intake>(line) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Bad intake line ({}): {}", e, line),
                }
            }
            Ok(None) => {
                info!("Signal intake closed");
                return;
            }
            Err(e) => {
                error!("Signal intake error: {}", e);
                return;
            }
        }
    }
}
