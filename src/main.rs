mod bot;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use level_signal_trader::config::Config;
use level_signal_trader::exchange::{CoinbaseTicker, PaperExchange};
use level_signal_trader::trading::{JsonFileStore, SignalStore};

use crate::bot::SignalTrader;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .init();

    let store: Arc<dyn SignalStore> = Arc::new(
        JsonFileStore::open(&cfg.store_path)
            .with_context(|| format!("Failed to open signal store {}", cfg.store_path))?,
    );
    let exchange = Arc::new(PaperExchange::new(cfg.exchange_enabled));
    let prices = Box::new(CoinbaseTicker::new(&cfg));
    let shared_config = cfg.shared();

    let mut trader = SignalTrader::new(shared_config, store, exchange, prices).await;
    trader.run().await?;

    Ok(())
}
