use chrono::{DateTime, Utc};

use crate::config::Config;

/// Per-invocation inputs that would otherwise be global: the clock and the
/// live-trading switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingContext {
    pub now: DateTime<Utc>,
    pub live_trading_enabled: bool,
}

impl TradingContext {
    pub fn new(now: DateTime<Utc>, live_trading_enabled: bool) -> Self {
        Self {
            now,
            live_trading_enabled,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(Utc::now(), cfg.live_trading_enabled)
    }
}
