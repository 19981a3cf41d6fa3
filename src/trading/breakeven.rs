use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::OrderParams;
use crate::exchange::{with_timeout, OrderExchange, OrderRequest};
use crate::models::{DemoStatus, OrderType, Signal, SignalUpdate};
use crate::trading::context::TradingContext;
use crate::trading::store::{record_event, CasOutcome, SignalStore};

/// Moves the effective stop of a profitable, long-held position to entry by
/// adding a small same-direction hedge with a tight stop.
pub struct BreakevenManager {
    store: Arc<dyn SignalStore>,
    exchange: Arc<dyn OrderExchange>,
    params: OrderParams,
    min_hold: Duration,
    min_move_pct: f64,
    exchange_timeout: std::time::Duration,
}

impl BreakevenManager {
    pub fn new(cfg: &Config, store: Arc<dyn SignalStore>, exchange: Arc<dyn OrderExchange>) -> Self {
        Self {
            store,
            exchange,
            params: OrderParams::new(cfg),
            min_hold: Duration::minutes(cfg.breakeven_minutes),
            min_move_pct: cfg.breakeven_min_move_pct,
            exchange_timeout: cfg.exchange_timeout(),
        }
    }

    pub fn should_trigger(&self, signal: &Signal, current_price: f64, now: DateTime<Utc>) -> bool {
        if signal.demo_status != Some(DemoStatus::OpenPosition) {
            return false;
        }
        let Some(filled_at) = signal.filled_at else {
            return false;
        };
        if now - filled_at < self.min_hold {
            return false;
        }
        let entry = signal.reference_entry_price();
        signal.direction.favorable_move_pct(entry, current_price) >= self.min_move_pct
    }

    /// Returns true when the hedge was placed and the signal moved to SL_TO_BREAKEVEN.
    pub async fn apply(&self, signal: &Signal, current_price: f64, ctx: &TradingContext) -> Result<bool> {
        if !self.should_trigger(signal, current_price, ctx.now) {
            return Ok(false);
        }

        let symbol = self.params.map_symbol(&signal.pair);
        let position = with_timeout(self.exchange_timeout, self.exchange.get_position(&symbol))
            .await
            .with_context(|| format!("position lookup for {}", symbol))?;
        if position.is_none() {
            debug!("Signal #{}: no open position on {}, skipping breakeven", signal.id, symbol);
            return Ok(false);
        }

        let entry = signal.reference_entry_price();
        let quantity = self
            .params
            .quantity_for_notional(self.params.hedge_notional, current_price);
        if quantity <= 0.0 {
            warn!(
                "Signal #{}: breakeven hedge of {} rounds to zero at {:.4}",
                signal.id, self.params.hedge_notional, current_price
            );
            return Ok(false);
        }

        let stop = self.params.breakeven_stop(signal.direction, entry);
        let take_profit = signal
            .tp_price
            .unwrap_or_else(|| self.params.tp_sl(signal.direction, entry).0);
        let request = OrderRequest {
            client_order_id: format!("breakeven-{}", signal.id),
            pair: symbol.clone(),
            side: signal.direction.side(),
            order_type: OrderType::Market,
            quantity,
            price: None,
            take_profit: Some(take_profit),
            stop_loss: Some(stop),
        };

        let ack = match with_timeout(self.exchange_timeout, self.exchange.place_order(&request)).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Signal #{}: breakeven hedge failed: {}", signal.id, e);
                record_event(
                    self.store.as_ref(),
                    signal.id,
                    ctx.now,
                    "BREAKEVEN_FAILED",
                    signal.demo_status,
                    e.to_string(),
                    json!({ "client_order_id": request.client_order_id }),
                )
                .await?;
                return Ok(false);
            }
        };

        let update = SignalUpdate {
            hedge_order_id: Some(ack.order_id.clone()),
            sl_price: Some(stop),
            ..Default::default()
        };
        match self
            .store
            .compare_and_set(
                signal.id,
                Some(DemoStatus::OpenPosition),
                DemoStatus::SlToBreakeven,
                update,
                ctx.now,
            )
            .await?
        {
            CasOutcome::Applied(_) => {}
            CasOutcome::Conflict { current } => {
                debug!(
                    "Signal #{} moved to {:?} while breakeven was placed",
                    signal.id, current
                );
                return Ok(false);
            }
        }

        let move_pct = signal.direction.favorable_move_pct(entry, current_price);
        info!(
            "Signal #{}: stop to breakeven {:.4} (entry {:.4}, move {:.2}%, hedge {})",
            signal.id, stop, entry, move_pct, ack.order_id
        );
        record_event(
            self.store.as_ref(),
            signal.id,
            ctx.now,
            DemoStatus::SlToBreakeven.as_str(),
            Some(DemoStatus::SlToBreakeven),
            format!("Stop moved to breakeven {:.4}", stop),
            json!({
                "old_sl_price": signal.sl_price,
                "new_sl_price": stop,
                "hedge_order_id": ack.order_id,
                "hedge_quantity": quantity,
                "move_pct": move_pct,
            }),
        )
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangePosition;
    use crate::models::Direction;
    use crate::test_helpers::*;

    fn filled_long(id: u64, minutes_ago: i64) -> Signal {
        let mut s = make_signal(id, Direction::Long, 100.0, 3600);
        s.demo_status = Some(DemoStatus::OpenPosition);
        s.order_id = Some(format!("paper-entry-{}", id));
        s.entry_price = Some(100.0);
        s.tp_price = Some(101.5);
        s.sl_price = Some(99.5);
        s.filled_at = Some(test_now() - Duration::minutes(minutes_ago));
        s
    }

    async fn with_position(h: &Harness) {
        h.exchange
            .seed_position(ExchangePosition {
                pair: "BTC/USDT".into(),
                direction: Direction::Long,
                size: 0.5,
                entry_price: 100.0,
                take_profit: Some(101.5),
                stop_loss: Some(99.5),
            })
            .await;
    }

    #[test]
    fn trigger_needs_time_and_move() {
        let h = harness();
        let s = filled_long(1, 45);
        assert!(h.breakeven.should_trigger(&s, 100.5, test_now()));
        // not enough profit
        assert!(!h.breakeven.should_trigger(&s, 100.3, test_now()));
        // not held long enough
        let young = filled_long(2, 30);
        assert!(!h.breakeven.should_trigger(&young, 100.5, test_now()));
    }

    #[tokio::test]
    async fn hedge_placed_once() {
        let h = harness();
        with_position(&h).await;
        h.exchange.set_price("BTC/USDT", 100.5).await;
        let signal = h.insert(filled_long(3, 45)).await;

        assert!(h.breakeven.apply(&signal, 100.5, &live_ctx()).await.unwrap());
        let stored = h.store.get(3).await.unwrap().unwrap();
        assert_eq!(stored.demo_status, Some(DemoStatus::SlToBreakeven));
        assert_eq!(stored.sl_price, Some(99.9));
        assert!(stored.hedge_order_id.is_some());

        // stale copy of the signal: the CAS fails and no second hedge exists
        assert!(!h.breakeven.apply(&signal, 100.5, &live_ctx()).await.unwrap());
        assert_eq!(h.exchange.order_count().await, 1);
        // updated copy is no longer a candidate
        assert!(!h.breakeven.apply(&stored, 100.5, &live_ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn missing_position_skips() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", 100.5).await;
        let signal = h.insert(filled_long(4, 45)).await;
        assert!(!h.breakeven.apply(&signal, 100.5, &live_ctx()).await.unwrap());
        assert_eq!(h.exchange.place_calls().await, 0);
        assert_eq!(
            h.store.get(4).await.unwrap().unwrap().demo_status,
            Some(DemoStatus::OpenPosition)
        );
    }
}
