use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{Invalidation, InvalidationThresholds, OrderParams};
use crate::exchange::{with_timeout, OrderExchange};
use crate::models::{DemoStatus, Signal, SignalUpdate};
use crate::trading::breakeven::BreakevenManager;
use crate::trading::context::TradingContext;
use crate::trading::engine::{OrderPlacementEngine, Outcome};
use crate::trading::store::{record_event, Bucket, CasOutcome, SignalStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pending_attempted: usize,
    pub level_recovered: usize,
    pub waiting_checked: usize,
    pub waiting_expired: usize,
    pub waiting_submitted: usize,
    pub orders_filled: usize,
    pub orders_cancelled: usize,
    pub orphans_closed: usize,
    pub breakeven_applied: usize,
    pub errors: usize,
}

/// Prices fetched during one sweep, one lookup per pair.
#[derive(Default)]
struct PriceCache {
    prices: HashMap<String, Option<f64>>,
}

/// Periodic sweep that retries, recovers, cancels and cleans up signals.
pub struct ReconciliationWatcher {
    store: Arc<dyn SignalStore>,
    exchange: Arc<dyn OrderExchange>,
    engine: Arc<OrderPlacementEngine>,
    breakeven: BreakevenManager,
    params: OrderParams,
    thresholds: InvalidationThresholds,
    max_signal_age: Duration,
    sweep_interval: Duration,
    order_cancel_deviation_pct: f64,
    exchange_timeout: std::time::Duration,
}

impl ReconciliationWatcher {
    pub fn new(
        cfg: &Config,
        store: Arc<dyn SignalStore>,
        exchange: Arc<dyn OrderExchange>,
        engine: Arc<OrderPlacementEngine>,
    ) -> Self {
        Self {
            breakeven: BreakevenManager::new(cfg, store.clone(), exchange.clone()),
            store,
            exchange,
            engine,
            params: OrderParams::new(cfg),
            thresholds: cfg.invalidation_thresholds(),
            max_signal_age: cfg.max_signal_age(),
            sweep_interval: Duration::seconds(cfg.sweep_interval_secs as i64),
            order_cancel_deviation_pct: cfg.order_cancel_deviation_pct,
            exchange_timeout: cfg.exchange_timeout(),
        }
    }

    pub async fn sweep(&self, ctx: &TradingContext) -> Result<SweepReport> {
        let cutoff = ctx.now - self.max_signal_age;
        let mut prices = PriceCache::default();
        let mut report = SweepReport::default();
        let trading_open = ctx.live_trading_enabled && self.exchange.is_enabled();

        if trading_open {
            let pending = self
                .store
                .query(Bucket::Pending { cutoff })
                .await
                .context("pending query")?;
            for signal in &pending {
                let Some(price) = self.price_for(&mut prices, &signal.pair).await else {
                    continue;
                };
                match self.engine.attempt(signal, price, ctx).await {
                    Ok(_) => report.pending_attempted += 1,
                    Err(e) => self.failed(&mut report, signal, "pending attempt", e),
                }
            }
        }

        let broken = self
            .store
            .query(Bucket::LevelBroken { cutoff })
            .await
            .context("level-broken query")?;
        for signal in &broken {
            let Some(price) = self.price_for(&mut prices, &signal.pair).await else {
                continue;
            };
            match self.recover_level(signal, price, cutoff, ctx).await {
                Ok(true) => report.level_recovered += 1,
                Ok(false) => {}
                Err(e) => self.failed(&mut report, signal, "level recheck", e),
            }
        }

        if trading_open {
            // one sweep of grace so signals that aged out since the last sweep get expired
            let waiting = self
                .store
                .query(Bucket::WaitingForPrice {
                    cutoff: cutoff - self.sweep_interval,
                })
                .await
                .context("waiting query")?;
            for signal in &waiting {
                report.waiting_checked += 1;
                match self.retry_waiting(signal, cutoff, &mut prices, ctx).await {
                    Ok(Some(DemoStatus::SignalTooOld)) => report.waiting_expired += 1,
                    Ok(Some(status)) if status.is_live_order() || status == DemoStatus::OpenPosition => {
                        report.waiting_submitted += 1
                    }
                    Ok(_) => {}
                    Err(e) => self.failed(&mut report, signal, "waiting retry", e),
                }
            }
        } else {
            debug!("Live trading or exchange off, skipping pending and waiting buckets");
        }

        let open = self
            .store
            .query(Bucket::OpenOrders)
            .await
            .context("open-orders query")?;
        for signal in &open {
            match self.check_open_order(signal, &mut prices, ctx).await {
                Ok(Some(DemoStatus::OpenPosition)) => report.orders_filled += 1,
                Ok(Some(DemoStatus::OrderCancelledPriceMoved)) => report.orders_cancelled += 1,
                Ok(_) => {}
                Err(e) => self.failed(&mut report, signal, "open order check", e),
            }
        }

        let orphans = self
            .store
            .query(Bucket::OrphanedClosed)
            .await
            .context("orphan query")?;
        for signal in &orphans {
            match self.close_orphan(signal, ctx).await {
                Ok(true) => report.orphans_closed += 1,
                Ok(false) => {}
                Err(e) => self.failed(&mut report, signal, "orphan close", e),
            }
        }

        let candidates = self
            .store
            .query(Bucket::BreakevenCandidates)
            .await
            .context("breakeven query")?;
        for signal in &candidates {
            let Some(price) = self.price_for(&mut prices, &signal.pair).await else {
                continue;
            };
            match self.breakeven.apply(signal, price, ctx).await {
                Ok(true) => report.breakeven_applied += 1,
                Ok(false) => {}
                Err(e) => self.failed(&mut report, signal, "breakeven", e),
            }
        }

        info!(
            "Sweep: pending={} recovered={} waiting={} (expired={}, submitted={}) filled={} cancelled={} orphans={} breakeven={} errors={}",
            report.pending_attempted,
            report.level_recovered,
            report.waiting_checked,
            report.waiting_expired,
            report.waiting_submitted,
            report.orders_filled,
            report.orders_cancelled,
            report.orphans_closed,
            report.breakeven_applied,
            report.errors
        );
        Ok(report)
    }

    fn failed(&self, report: &mut SweepReport, signal: &Signal, stage: &str, e: anyhow::Error) {
        warn!("Signal #{} {} failed: {:#}", signal.id, stage, e);
        report.errors += 1;
    }

    async fn price_for(&self, cache: &mut PriceCache, pair: &str) -> Option<f64> {
        if let Some(price) = cache.prices.get(pair) {
            return *price;
        }
        let symbol = self.params.map_symbol(pair);
        let price = match with_timeout(self.exchange_timeout, self.exchange.get_current_price(&symbol)).await {
            Ok(p) if p.is_finite() && p > 0.0 => Some(p),
            Ok(p) => {
                warn!("Ignoring bad price {} for {}", p, symbol);
                None
            }
            Err(e) => {
                warn!("Price fetch failed for {}: {}", symbol, e);
                None
            }
        };
        cache.prices.insert(pair.to_string(), price);
        price
    }

    /// LEVEL_BROKEN -> WAITING_FOR_PRICE once the price is back on the right
    /// side of the level. Signals older than `cutoff` never recover.
    pub async fn recover_level(
        &self,
        signal: &Signal,
        current_price: f64,
        cutoff: DateTime<Utc>,
        ctx: &TradingContext,
    ) -> Result<bool> {
        if signal.demo_status != Some(DemoStatus::LevelBroken) || signal.timestamp < cutoff {
            return Ok(false);
        }
        let verdict = self
            .thresholds
            .classify(signal.direction, signal.level_price, current_price);
        if verdict != Invalidation::Ok {
            return Ok(false);
        }

        let message = format!(
            "Level {:.4} restored at {:.4}, waiting for entry",
            signal.level_price, current_price
        );
        match self
            .store
            .compare_and_set(
                signal.id,
                Some(DemoStatus::LevelBroken),
                DemoStatus::WaitingForPrice,
                SignalUpdate::with_error(message.clone()),
                ctx.now,
            )
            .await?
        {
            CasOutcome::Applied(_) => {
                info!("Signal #{} -> WAITING_FOR_PRICE: {}", signal.id, message);
                record_event(
                    self.store.as_ref(),
                    signal.id,
                    ctx.now,
                    "LEVEL_RESTORED",
                    Some(DemoStatus::WaitingForPrice),
                    message,
                    json!({ "level_price": signal.level_price, "current_price": current_price }),
                )
                .await?;
                Ok(true)
            }
            CasOutcome::Conflict { .. } => Ok(false),
        }
    }

    async fn retry_waiting(
        &self,
        signal: &Signal,
        cutoff: DateTime<Utc>,
        prices: &mut PriceCache,
        ctx: &TradingContext,
    ) -> Result<Option<DemoStatus>> {
        if signal.timestamp < cutoff {
            let outcome = self
                .engine
                .record(
                    signal,
                    DemoStatus::SignalTooOld,
                    format!(
                        "Signal expired while waiting for price ({}s old)",
                        signal.age(ctx.now).num_seconds()
                    ),
                    json!({ "age_secs": signal.age(ctx.now).num_seconds() }),
                    ctx,
                )
                .await?;
            return Ok(outcome.written_status());
        }

        let Some(price) = self.price_for(prices, &signal.pair).await else {
            return Ok(None);
        };
        let outcome = self.engine.evaluate_market(signal, price, ctx).await?;
        if let Outcome::RiskLimited { reason } = &outcome {
            debug!("Signal #{} still waiting: {}", signal.id, reason);
        }
        Ok(outcome.written_status())
    }

    async fn check_open_order(
        &self,
        signal: &Signal,
        prices: &mut PriceCache,
        ctx: &TradingContext,
    ) -> Result<Option<DemoStatus>> {
        let Some(order_id) = signal.order_id.as_deref() else {
            return Ok(None);
        };
        let Some(current) = signal.demo_status else {
            return Ok(None);
        };
        let symbol = self.params.map_symbol(&signal.pair);

        let fill = match with_timeout(self.exchange_timeout, self.exchange.order_fill(&symbol, order_id)).await {
            Ok(fill) => fill,
            Err(e) => {
                warn!("Signal #{}: fill check for order {} failed: {}", signal.id, order_id, e);
                None
            }
        };
        if let Some(fill) = fill {
            let update = SignalUpdate {
                entry_price: Some(fill.price),
                filled_at: Some(fill.filled_at),
                clear_error: true,
                ..Default::default()
            };
            return match self
                .store
                .compare_and_set(signal.id, Some(current), DemoStatus::OpenPosition, update, ctx.now)
                .await?
            {
                CasOutcome::Applied(_) => {
                    info!(
                        "Signal #{}: order {} filled at {:.4}",
                        signal.id, order_id, fill.price
                    );
                    record_event(
                        self.store.as_ref(),
                        signal.id,
                        ctx.now,
                        "POSITION_FILLED",
                        Some(DemoStatus::OpenPosition),
                        format!("Order {} filled at {:.4}", order_id, fill.price),
                        json!({ "order_id": order_id, "fill_price": fill.price, "filled_at": fill.filled_at }),
                    )
                    .await?;
                    Ok(Some(DemoStatus::OpenPosition))
                }
                CasOutcome::Conflict { .. } => Ok(None),
            };
        }

        let Some(price) = self.price_for(prices, &signal.pair).await else {
            return Ok(None);
        };
        let deviation = signal.level_deviation_pct(price);
        let max_seen = signal.max_deviation_pct.unwrap_or(0.0).max(deviation);

        if max_seen > self.order_cancel_deviation_pct {
            if let Err(e) = with_timeout(self.exchange_timeout, self.exchange.cancel_order(&symbol, order_id)).await {
                warn!("Signal #{}: cancel of {} failed: {}", signal.id, order_id, e);
            }
            let message = format!(
                "Price moved {:.2}% from level {:.4} (limit {:.2}%), order {} cancelled",
                max_seen, signal.level_price, self.order_cancel_deviation_pct, order_id
            );
            let update = SignalUpdate {
                max_deviation_pct: Some(max_seen),
                error: Some(message.clone()),
                ..Default::default()
            };
            return match self
                .store
                .compare_and_set(
                    signal.id,
                    Some(current),
                    DemoStatus::OrderCancelledPriceMoved,
                    update,
                    ctx.now,
                )
                .await?
            {
                CasOutcome::Applied(_) => {
                    info!("Signal #{} -> ORDER_CANCELLED_PRICE_MOVED: {}", signal.id, message);
                    record_event(
                        self.store.as_ref(),
                        signal.id,
                        ctx.now,
                        "ORDER_CANCELLED",
                        Some(DemoStatus::OrderCancelledPriceMoved),
                        message,
                        json!({
                            "order_id": order_id,
                            "current_price": price,
                            "deviation_pct": deviation,
                            "max_deviation_pct": max_seen,
                        }),
                    )
                    .await?;
                    Ok(Some(DemoStatus::OrderCancelledPriceMoved))
                }
                CasOutcome::Conflict { .. } => Ok(None),
            };
        }

        if signal.max_deviation_pct.map_or(true, |prev| max_seen > prev) {
            let update = SignalUpdate {
                max_deviation_pct: Some(max_seen),
                ..Default::default()
            };
            self.store
                .compare_and_set(signal.id, Some(current), current, update, ctx.now)
                .await?;
        }
        Ok(None)
    }

    async fn close_orphan(&self, signal: &Signal, ctx: &TradingContext) -> Result<bool> {
        let message = format!("Signal {} before any order was placed", signal.status);
        match self
            .store
            .compare_and_set(
                signal.id,
                signal.demo_status,
                DemoStatus::SignalClosedNoOrder,
                SignalUpdate::with_error(message.clone()),
                ctx.now,
            )
            .await?
        {
            CasOutcome::Applied(_) => {
                info!("Signal #{} -> SIGNAL_CLOSED_NO_ORDER", signal.id);
                record_event(
                    self.store.as_ref(),
                    signal.id,
                    ctx.now,
                    DemoStatus::SignalClosedNoOrder.as_str(),
                    Some(DemoStatus::SignalClosedNoOrder),
                    message,
                    json!({ "previous": signal.demo_status, "status": signal.status }),
                )
                .await?;
                Ok(true)
            }
            CasOutcome::Conflict { .. } => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, SignalStatus};
    use crate::test_helpers::*;

    #[tokio::test]
    async fn level_broken_recovers_only_while_young() {
        let h = harness();
        let mut young = make_signal(1, Direction::Long, 100.0, 600);
        young.demo_status = Some(DemoStatus::LevelBroken);
        let young = h.insert(young).await;
        let mut old = make_signal(2, Direction::Long, 100.0, 2400);
        old.demo_status = Some(DemoStatus::LevelBroken);
        let old = h.insert(old).await;
        let ctx = live_ctx();
        let cutoff = ctx.now - Duration::seconds(1800);

        // still broken
        assert!(!h.watcher.recover_level(&young, 99.5, cutoff, &ctx).await.unwrap());
        assert!(h.watcher.recover_level(&young, 100.05, cutoff, &ctx).await.unwrap());
        assert!(!h.watcher.recover_level(&old, 100.05, cutoff, &ctx).await.unwrap());

        assert_eq!(
            h.store.get(1).await.unwrap().unwrap().demo_status,
            Some(DemoStatus::WaitingForPrice)
        );
        assert_eq!(
            h.store.get(2).await.unwrap().unwrap().demo_status,
            Some(DemoStatus::LevelBroken)
        );
    }

    #[tokio::test]
    async fn sweep_retries_pending_signals() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", 100.1).await;
        h.insert(make_signal(3, Direction::Long, 100.0, 120)).await;
        // too old for the pending bucket
        h.insert(make_signal(4, Direction::Long, 100.0, 4000)).await;

        let report = h.watcher.sweep(&live_ctx()).await.unwrap();
        assert_eq!(report.pending_attempted, 1);
        assert_eq!(
            h.store.get(3).await.unwrap().unwrap().demo_status,
            Some(DemoStatus::New)
        );
        assert_eq!(h.store.get(4).await.unwrap().unwrap().demo_status, None);
    }

    #[tokio::test]
    async fn waiting_bucket_untouched_when_live_off() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", 100.1).await;
        let mut s = make_signal(5, Direction::Long, 100.0, 120);
        s.demo_status = Some(DemoStatus::WaitingForPrice);
        h.insert(s).await;

        let off = TradingContext::new(test_now(), false);
        let report = h.watcher.sweep(&off).await.unwrap();
        assert_eq!(report.waiting_checked, 0);
        assert_eq!(
            h.store.get(5).await.unwrap().unwrap().demo_status,
            Some(DemoStatus::WaitingForPrice)
        );
    }

    #[tokio::test]
    async fn open_order_tracks_max_deviation_then_cancels() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", 99.9).await;
        let signal = h.insert(make_signal(6, Direction::Short, 100.0, 120)).await;
        h.engine.attempt(&signal, 99.9, &live_ctx()).await.unwrap();
        assert_eq!(
            h.store.get(6).await.unwrap().unwrap().demo_status,
            Some(DemoStatus::New)
        );

        // short limit sell at 100 rests while price is below it
        h.exchange.set_price("BTC/USDT", 98.8).await;
        let report = h.watcher.sweep(&live_ctx()).await.unwrap();
        assert_eq!(report.orders_cancelled, 0);
        let s = h.store.get(6).await.unwrap().unwrap();
        assert!((s.max_deviation_pct.unwrap() - 1.2).abs() < 1e-6);

        h.exchange.set_price("BTC/USDT", 97.5).await;
        let report = h.watcher.sweep(&live_ctx()).await.unwrap();
        assert_eq!(report.orders_cancelled, 1);
        let s = h.store.get(6).await.unwrap().unwrap();
        assert_eq!(s.demo_status, Some(DemoStatus::OrderCancelledPriceMoved));
        assert_eq!(h.exchange.cancel_calls().await, 1);
    }

    #[tokio::test]
    async fn unknown_order_is_still_cancelled_on_deviation() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", 103.0).await;
        let mut s = make_signal(10, Direction::Long, 100.0, 120);
        s.demo_status = Some(DemoStatus::New);
        s.order_id = Some("order-from-before-restart".into());
        h.insert(s).await;

        let report = h.watcher.sweep(&live_ctx()).await.unwrap();
        assert_eq!(report.orders_cancelled, 1);
        assert_eq!(report.errors, 0);
        let s = h.store.get(10).await.unwrap().unwrap();
        assert_eq!(s.demo_status, Some(DemoStatus::OrderCancelledPriceMoved));
        assert!((s.max_deviation_pct.unwrap() - 3.0).abs() < 1e-6);
        // the cancel call was made even though the exchange rejects it
        assert_eq!(h.exchange.cancel_calls().await, 1);
    }

    #[tokio::test]
    async fn unknown_order_in_range_keeps_tracking() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", 100.5).await;
        let mut s = make_signal(11, Direction::Long, 100.0, 120);
        s.demo_status = Some(DemoStatus::Placed);
        s.order_id = Some("order-from-before-restart".into());
        h.insert(s).await;

        let report = h.watcher.sweep(&live_ctx()).await.unwrap();
        assert_eq!(report, SweepReport::default());
        let s = h.store.get(11).await.unwrap().unwrap();
        assert_eq!(s.demo_status, Some(DemoStatus::Placed));
        assert!((s.max_deviation_pct.unwrap() - 0.5).abs() < 1e-6);
        assert_eq!(h.exchange.cancel_calls().await, 0);
    }

    #[tokio::test]
    async fn filled_order_becomes_position() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", 100.1).await;
        let signal = h.insert(make_signal(7, Direction::Long, 100.0, 120)).await;
        h.engine.attempt(&signal, 100.1, &live_ctx()).await.unwrap();

        h.exchange.set_price("BTC/USDT", 99.9).await;
        let report = h.watcher.sweep(&live_ctx()).await.unwrap();
        assert_eq!(report.orders_filled, 1);
        let s = h.store.get(7).await.unwrap().unwrap();
        assert_eq!(s.demo_status, Some(DemoStatus::OpenPosition));
        assert_eq!(s.entry_price, Some(100.0));
        assert!(s.filled_at.is_some());
    }

    #[tokio::test]
    async fn closed_signal_without_order_is_finalized() {
        let h = harness();
        let mut s = make_signal(8, Direction::Long, 100.0, 9000);
        s.status = SignalStatus::Closed;
        s.demo_status = Some(DemoStatus::WaitingForPrice);
        h.insert(s).await;

        let report = h.watcher.sweep(&live_ctx()).await.unwrap();
        assert_eq!(report.orphans_closed, 1);
        assert_eq!(
            h.store.get(8).await.unwrap().unwrap().demo_status,
            Some(DemoStatus::SignalClosedNoOrder)
        );
    }

    #[tokio::test]
    async fn missing_price_is_skipped_not_fatal() {
        let h = harness();
        let mut s = make_signal(9, Direction::Long, 100.0, 120);
        s.pair = "ETH/USDT".into();
        s.demo_status = Some(DemoStatus::LevelBroken);
        h.insert(s).await;
        let report = h.watcher.sweep(&live_ctx()).await.unwrap();
        assert_eq!(report.level_recovered, 0);
        assert_eq!(report.errors, 0);
    }
}
