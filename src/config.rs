use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::invalidation::InvalidationThresholds;

pub type SharedConfig = Arc<RwLock<Config>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Trading gates
    pub live_trading_enabled: bool,
    pub auto_trading_enabled: bool,
    pub exchange_enabled: bool,

    // Coinbase market data
    pub coinbase_api_key: String,
    pub coinbase_api_secret: String,

    // Signal lifecycle (seconds)
    pub max_signal_age_secs: i64,
    pub sweep_interval_secs: u64,
    pub price_refresh_secs: u64,
    pub exchange_timeout_secs: u64,

    // Price thresholds, in percent
    pub max_deviation_pct: f64,
    pub level_break_pct: f64,
    pub entry_max_deviation_pct: f64,
    pub market_entry_threshold_pct: f64,
    pub order_cancel_deviation_pct: f64,

    // Order parameters
    pub order_size_usdt: f64,
    pub quantity_precision: u32,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub symbol_suffix: String,

    // Breakeven
    pub breakeven_minutes: i64,
    pub breakeven_min_move_pct: f64,
    pub breakeven_hedge_notional: f64,

    // Risk
    pub daily_loss_limit_pct: f64,
    pub max_consecutive_losses: usize,
    pub commission_pct: f64,
    pub risk_timezone: String,

    // Storage & logging
    pub store_path: String,
    pub log_dir: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            live_trading_enabled: false,
            auto_trading_enabled: true,
            exchange_enabled: true,
            coinbase_api_key: String::new(),
            coinbase_api_secret: String::new(),
            max_signal_age_secs: 1800,
            sweep_interval_secs: 60,
            price_refresh_secs: 5,
            exchange_timeout_secs: 10,
            max_deviation_pct: 2.0,
            level_break_pct: 0.2,
            entry_max_deviation_pct: 0.4,
            market_entry_threshold_pct: 0.0,
            order_cancel_deviation_pct: 2.0,
            order_size_usdt: 50.0,
            quantity_precision: 3,
            take_profit_pct: 1.5,
            stop_loss_pct: 0.5,
            symbol_suffix: ":USDT".to_string(),
            breakeven_minutes: 40,
            breakeven_min_move_pct: 0.4,
            breakeven_hedge_notional: 20.0,
            daily_loss_limit_pct: -5.0,
            max_consecutive_losses: 5,
            commission_pct: 0.035,
            risk_timezone: "Europe/Moscow".to_string(),
            store_path: "logs/signals.json".to_string(),
            log_dir: "logs".to_string(),
            log_level: "INFO".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let env = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        let flag = |key: &str, default: bool| -> bool {
            match env(key, "").to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            }
        };

        let d = Config::default();
        let log_dir = env("LOG_DIR", &d.log_dir);

        Config {
            live_trading_enabled: flag("LIVE_TRADING", d.live_trading_enabled),
            auto_trading_enabled: flag("AUTO_TRADING", d.auto_trading_enabled),
            exchange_enabled: flag("EXCHANGE_ENABLED", d.exchange_enabled),
            coinbase_api_key: env("COINBASE_API_KEY", ""),
            coinbase_api_secret: env("COINBASE_API_SECRET", "").replace("\\n", "\n"),
            max_signal_age_secs: env("MAX_SIGNAL_AGE_SECS", "1800")
                .parse()
                .unwrap_or(d.max_signal_age_secs),
            sweep_interval_secs: env("SWEEP_INTERVAL_SECS", "60")
                .parse()
                .unwrap_or(d.sweep_interval_secs),
            price_refresh_secs: env("PRICE_REFRESH_SECS", "5")
                .parse()
                .unwrap_or(d.price_refresh_secs),
            exchange_timeout_secs: env("EXCHANGE_TIMEOUT_SECS", "10")
                .parse()
                .unwrap_or(d.exchange_timeout_secs),
            max_deviation_pct: env("MAX_DEVIATION_PCT", "2.0").parse().unwrap_or(d.max_deviation_pct),
            level_break_pct: env("LEVEL_BREAK_PCT", "0.2").parse().unwrap_or(d.level_break_pct),
            entry_max_deviation_pct: env("ENTRY_MAX_DEVIATION_PCT", "0.4")
                .parse()
                .unwrap_or(d.entry_max_deviation_pct),
            market_entry_threshold_pct: env("MARKET_ENTRY_THRESHOLD_PCT", "0")
                .parse()
                .unwrap_or(d.market_entry_threshold_pct),
            order_cancel_deviation_pct: env("ORDER_CANCEL_DEVIATION_PCT", "2.0")
                .parse()
                .unwrap_or(d.order_cancel_deviation_pct),
            order_size_usdt: env("ORDER_SIZE_USDT", "50").parse().unwrap_or(d.order_size_usdt),
            quantity_precision: env("QUANTITY_PRECISION", "3")
                .parse()
                .unwrap_or(d.quantity_precision),
            take_profit_pct: env("TAKE_PROFIT_PCT", "1.5").parse().unwrap_or(d.take_profit_pct),
            stop_loss_pct: env("STOP_LOSS_PCT", "0.5").parse().unwrap_or(d.stop_loss_pct),
            symbol_suffix: env("SYMBOL_SUFFIX", &d.symbol_suffix),
            breakeven_minutes: env("BREAKEVEN_MINUTES", "40").parse().unwrap_or(d.breakeven_minutes),
            breakeven_min_move_pct: env("BREAKEVEN_MIN_MOVE_PCT", "0.4")
                .parse()
                .unwrap_or(d.breakeven_min_move_pct),
            breakeven_hedge_notional: env("BREAKEVEN_HEDGE_NOTIONAL", "20")
                .parse()
                .unwrap_or(d.breakeven_hedge_notional),
            daily_loss_limit_pct: env("DAILY_LOSS_LIMIT_PCT", "-5")
                .parse()
                .unwrap_or(d.daily_loss_limit_pct),
            max_consecutive_losses: env("MAX_CONSECUTIVE_LOSSES", "5")
                .parse()
                .unwrap_or(d.max_consecutive_losses),
            commission_pct: env("COMMISSION_PCT", "0.035").parse().unwrap_or(d.commission_pct),
            risk_timezone: env("RISK_TIMEZONE", &d.risk_timezone),
            store_path: env("STORE_PATH", &format!("{}/signals.json", log_dir)),
            log_level: env("LOG_LEVEL", &d.log_level),
            log_dir,
        }
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    pub fn invalidation_thresholds(&self) -> InvalidationThresholds {
        InvalidationThresholds {
            max_deviation: self.max_deviation_pct / 100.0,
            level_break: self.level_break_pct / 100.0,
        }
    }

    pub fn max_signal_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_signal_age_secs)
    }

    pub fn exchange_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.exchange_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_trading_rules() {
        let cfg = Config::default();
        assert!(!cfg.live_trading_enabled);
        assert_eq!(cfg.max_signal_age().num_seconds(), 1800);
        let t = cfg.invalidation_thresholds();
        assert!((t.max_deviation - 0.02).abs() < 1e-12);
        assert!((t.level_break - 0.002).abs() < 1e-12);
        assert_eq!(cfg.breakeven_minutes, 40);
        assert_eq!(cfg.risk_timezone, "Europe/Moscow");
    }
}
