use crate::config::Config;
use crate::models::Direction;

const HEDGE_NOTIONAL_MIN: f64 = 15.0;
const HEDGE_NOTIONAL_MAX: f64 = 25.0;
const BREAKEVEN_OFFSET: f64 = 0.001;

/// Sizing and protective-level rules shared by entry orders and breakeven hedges.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderParams {
    pub order_size_usdt: f64,
    pub quantity_precision: u32,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub symbol_suffix: String,
    pub hedge_notional: f64,
}

impl OrderParams {
    pub fn new(cfg: &Config) -> Self {
        Self {
            order_size_usdt: cfg.order_size_usdt,
            quantity_precision: cfg.quantity_precision,
            take_profit_pct: cfg.take_profit_pct,
            stop_loss_pct: cfg.stop_loss_pct,
            symbol_suffix: cfg.symbol_suffix.clone(),
            hedge_notional: cfg
                .breakeven_hedge_notional
                .clamp(HEDGE_NOTIONAL_MIN, HEDGE_NOTIONAL_MAX),
        }
    }

    /// Entry quantity for the configured order size, truncated (never rounded up).
    pub fn quantity(&self, price: f64) -> f64 {
        self.quantity_for_notional(self.order_size_usdt, price)
    }

    pub fn quantity_for_notional(&self, notional: f64, price: f64) -> f64 {
        let notional = notional.max(0.0);
        if !(price.is_finite() && price > 0.0) || notional <= 0.0 {
            return 0.0;
        }
        let factor = 10f64.powi(self.quantity_precision as i32);
        ((notional / price) * factor).floor().max(0.0) / factor
    }

    /// (take_profit, stop_loss) around `entry`, rounded to 6 decimals.
    pub fn tp_sl(&self, direction: Direction, entry: f64) -> (f64, f64) {
        let tp = self.take_profit_pct / 100.0;
        let sl = self.stop_loss_pct / 100.0;
        let (tp_price, sl_price) = match direction {
            Direction::Long => (entry * (1.0 + tp), entry * (1.0 - sl)),
            Direction::Short => (entry * (1.0 - tp), entry * (1.0 + sl)),
        };
        (round6(tp_price), round6(sl_price))
    }

    /// Stop that puts the combined position at breakeven after the hedge.
    pub fn breakeven_stop(&self, direction: Direction, entry: f64) -> f64 {
        let stop = match direction {
            Direction::Long => entry * (1.0 - BREAKEVEN_OFFSET),
            Direction::Short => entry * (1.0 + BREAKEVEN_OFFSET),
        };
        round6(stop)
    }

    /// Exchange symbol for a pair, e.g. `BTC/USDT` -> `BTC/USDT:USDT`.
    pub fn map_symbol(&self, pair: &str) -> String {
        let suffix = self.symbol_suffix.as_str();
        if !suffix.is_empty() && pair.ends_with("/USDT") && !pair.ends_with(suffix) {
            format!("{}{}", pair, suffix)
        } else {
            pair.to_string()
        }
    }
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}
