use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing_subscriber::{fmt, EnvFilter};

use level_signal_trader::config::Config;
use level_signal_trader::trading::{JsonFileStore, SignalStore};

/// Print demo-status counts for the signal store, or one signal's journal
/// when an id is given: `signal_report [id]`.
#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .init();

    let store = JsonFileStore::open(&cfg.store_path)
        .with_context(|| format!("Failed to open {}", cfg.store_path))?;

    let args: Vec<String> = std::env::args().collect();
    if let Some(id) = args.get(1).and_then(|s| s.parse::<u64>().ok()) {
        let signal = store
            .get(id)
            .await?
            .with_context(|| format!("signal {} not found", id))?;
        println!(
            "Signal #{} {} {} level={} status={} demo_status={}",
            signal.id,
            signal.direction,
            signal.pair,
            signal.level_price,
            signal.status,
            signal
                .demo_status
                .map_or("-".to_string(), |s| s.to_string())
        );
        if let Some(order_id) = &signal.order_id {
            println!("  order: {} qty={:?}", order_id, signal.quantity);
        }
        if let Some(err) = &signal.error {
            println!("  last message: {}", err);
        }
        println!();
        for event in store.events(id).await? {
            println!(
                "{}  {:<28} {}",
                event.at.to_rfc3339(),
                event.event_type,
                event.message
            );
        }
        return Ok(());
    }

    let signals = store.signals().await;
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for s in &signals {
        let key = s
            .demo_status
            .map_or("UNSET".to_string(), |d| d.to_string());
        *counts.entry(key).or_default() += 1;
    }

    println!("{}", "=".repeat(60));
    println!("Signals in {}: {}", cfg.store_path, signals.len());
    println!("{}", "=".repeat(60));
    for (status, n) in &counts {
        println!("  {:<30} {:>6}", status, n);
    }

    Ok(())
}
