use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{Invalidation, InvalidationThresholds, OrderParams, RiskCheck, RiskGuard};
use crate::exchange::{with_timeout, AckStatus, OrderExchange, OrderRequest};
use crate::models::{DemoStatus, OrderType, Signal, SignalUpdate};
use crate::trading::context::TradingContext;
use crate::trading::store::{record_event, CasOutcome, SignalStore};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Signal is no longer active. Nothing written.
    Ignored,
    /// Status is final, or another caller changed it first. Nothing written.
    AlreadyProcessed { status: Option<DemoStatus> },
    /// A gate stopped the attempt and its status was stored.
    Recorded(DemoStatus),
    Submitted { order_id: String, status: DemoStatus },
    Failed { reason: String },
    /// Risk limits block new orders. Nothing written.
    RiskLimited { reason: String },
}

impl Outcome {
    pub fn written_status(&self) -> Option<DemoStatus> {
        match self {
            Outcome::Recorded(status) => Some(*status),
            Outcome::Submitted { status, .. } => Some(*status),
            Outcome::Failed { .. } => Some(DemoStatus::Failed),
            _ => None,
        }
    }
}

/// Client order id of a signal's entry order. Stable across retries, so a
/// resubmission after a lost ack lands on the order already booked.
pub fn entry_client_id(signal_id: u64) -> String {
    format!("entry-{}", signal_id)
}

/// Decides whether a signal gets an entry order and places at most one.
pub struct OrderPlacementEngine {
    store: Arc<dyn SignalStore>,
    exchange: Arc<dyn OrderExchange>,
    params: OrderParams,
    thresholds: InvalidationThresholds,
    risk: RiskGuard,
    max_signal_age: Duration,
    entry_max_deviation_pct: f64,
    market_entry_threshold_pct: f64,
    exchange_timeout: std::time::Duration,
}

impl OrderPlacementEngine {
    pub fn new(cfg: &Config, store: Arc<dyn SignalStore>, exchange: Arc<dyn OrderExchange>) -> Self {
        Self {
            store,
            exchange,
            params: OrderParams::new(cfg),
            thresholds: cfg.invalidation_thresholds(),
            risk: RiskGuard::new(cfg),
            max_signal_age: cfg.max_signal_age(),
            entry_max_deviation_pct: cfg.entry_max_deviation_pct,
            market_entry_threshold_pct: cfg.market_entry_threshold_pct,
            exchange_timeout: cfg.exchange_timeout(),
        }
    }

    pub fn params(&self) -> &OrderParams {
        &self.params
    }

    pub fn thresholds(&self) -> InvalidationThresholds {
        self.thresholds
    }

    pub fn max_signal_age(&self) -> Duration {
        self.max_signal_age
    }

    /// Full gate sequence for one signal at `current_price`.
    pub async fn attempt(&self, signal: &Signal, current_price: f64, ctx: &TradingContext) -> Result<Outcome> {
        if !signal.is_active() {
            debug!("Signal #{} is {}, skipping", signal.id, signal.status);
            return Ok(Outcome::Ignored);
        }

        if let Some(status) = signal.demo_status.filter(|s| s.is_final()) {
            debug!("Signal #{} already {}, skipping", signal.id, status);
            return Ok(Outcome::AlreadyProcessed { status: Some(status) });
        }

        if !ctx.live_trading_enabled {
            return self
                .record(signal, DemoStatus::LiveDisabled, "Live trading is disabled".to_string(), json!({}), ctx)
                .await;
        }

        if !self.exchange.is_enabled() {
            return self
                .record(
                    signal,
                    DemoStatus::NotConfigured,
                    "Exchange client is not configured".to_string(),
                    json!({}),
                    ctx,
                )
                .await;
        }

        let age = signal.age(ctx.now);
        if age > self.max_signal_age {
            return self
                .record(
                    signal,
                    DemoStatus::SignalTooOld,
                    format!(
                        "Signal is {}s old (max {}s)",
                        age.num_seconds(),
                        self.max_signal_age.num_seconds()
                    ),
                    json!({ "age_secs": age.num_seconds() }),
                    ctx,
                )
                .await;
        }

        self.evaluate_market(signal, current_price, ctx).await
    }

    /// Price-dependent gates through submission. The sweep calls this
    /// directly for signals already waiting on price.
    pub async fn evaluate_market(
        &self,
        signal: &Signal,
        current_price: f64,
        ctx: &TradingContext,
    ) -> Result<Outcome> {
        let market_ok = current_price.is_finite() && current_price > 0.0;
        let level_ok = signal.level_price.is_finite() && signal.level_price > 0.0;

        if market_ok && level_ok {
            let verdict = self
                .thresholds
                .classify(signal.direction, signal.level_price, current_price);
            if let Some(status) = verdict.demo_status() {
                let deviation = signal.level_deviation_pct(current_price);
                let message = match verdict {
                    Invalidation::LevelBroken => format!(
                        "{} level {:.4} broken, price {:.4}",
                        signal.direction, signal.level_price, current_price
                    ),
                    _ => format!(
                        "Price {:.4} is {:.2}% away from level {:.4}",
                        current_price, deviation, signal.level_price
                    ),
                };
                let details = json!({
                    "level_price": signal.level_price,
                    "current_price": current_price,
                    "deviation_pct": deviation,
                });
                return self.record(signal, status, message, details, ctx).await;
            }
        }

        let symbol = self.params.map_symbol(&signal.pair);
        if let Some(reason) = self.existing_exposure(signal, &symbol).await {
            return self
                .record(
                    signal,
                    DemoStatus::PositionAlreadyOpen,
                    reason,
                    json!({ "symbol": symbol }),
                    ctx,
                )
                .await;
        }

        let entry = signal.reference_entry_price();
        if !(entry.is_finite() && entry > 0.0) {
            return self
                .record(
                    signal,
                    DemoStatus::InvalidEntry,
                    format!("Invalid entry price {}", entry),
                    json!({ "entry_price": entry }),
                    ctx,
                )
                .await;
        }

        if !market_ok {
            return self
                .record(
                    signal,
                    DemoStatus::InvalidMarketPrice,
                    format!("Invalid market price {} for {}", current_price, symbol),
                    json!({ "current_price": current_price.to_string() }),
                    ctx,
                )
                .await;
        }

        let deviation_pct = (current_price / entry - 1.0).abs() * 100.0;
        if deviation_pct > self.entry_max_deviation_pct {
            return self
                .record(
                    signal,
                    DemoStatus::WaitingForPrice,
                    format!(
                        "Price {:.4} is {:.3}% from entry {:.4}, waiting for <= {:.2}%",
                        current_price, deviation_pct, entry, self.entry_max_deviation_pct
                    ),
                    json!({
                        "entry_price": entry,
                        "current_price": current_price,
                        "deviation_pct": deviation_pct,
                    }),
                    ctx,
                )
                .await;
        }

        let (order_type, order_price) = if self.market_entry_threshold_pct > 0.0
            && deviation_pct <= self.market_entry_threshold_pct
        {
            (OrderType::Market, current_price)
        } else {
            (OrderType::Limit, entry)
        };

        let quantity = self.params.quantity(order_price);
        if quantity <= 0.0 {
            return self
                .record(
                    signal,
                    DemoStatus::InvalidQuantity,
                    format!(
                        "Quantity rounds to zero for {} USDT at {:.4}",
                        self.params.order_size_usdt, order_price
                    ),
                    json!({ "order_price": order_price }),
                    ctx,
                )
                .await;
        }

        let closed = self
            .store
            .closed_trades(None)
            .await
            .context("Failed to load closed trades")?;
        if let RiskCheck::Breached(reason) = self.risk.check(&closed, ctx.now) {
            warn!("Signal #{} held back by risk limits: {}", signal.id, reason);
            return Ok(Outcome::RiskLimited { reason });
        }

        self.submit(signal, &symbol, order_type, order_price, quantity, ctx)
            .await
    }

    async fn existing_exposure(&self, signal: &Signal, symbol: &str) -> Option<String> {
        match with_timeout(self.exchange_timeout, self.exchange.get_position(symbol)).await {
            Ok(Some(pos)) => {
                return Some(format!(
                    "Position already open on {}: {} {}",
                    symbol, pos.direction, pos.size
                ))
            }
            Ok(None) => {}
            Err(e) => warn!("Position check failed for {}: {}", symbol, e),
        }

        let side = signal.direction.side();
        let own = entry_client_id(signal.id);
        match with_timeout(self.exchange_timeout, self.exchange.open_entry_orders(symbol, side)).await {
            Ok(orders) => {
                let foreign: Vec<&str> = orders
                    .iter()
                    .filter(|o| o.client_order_id != own)
                    .map(|o| o.order_id.as_str())
                    .collect();
                if foreign.is_empty() {
                    None
                } else {
                    Some(format!(
                        "{} open {} order(s) on {}: {}",
                        foreign.len(),
                        side,
                        symbol,
                        foreign.join(", ")
                    ))
                }
            }
            Err(e) => {
                warn!("Open order check failed for {}: {}", symbol, e);
                None
            }
        }
    }

    async fn submit(
        &self,
        signal: &Signal,
        symbol: &str,
        order_type: OrderType,
        order_price: f64,
        quantity: f64,
        ctx: &TradingContext,
    ) -> Result<Outcome> {
        let (tp, sl) = self.params.tp_sl(signal.direction, order_price);

        let claim = SignalUpdate {
            quantity: Some(quantity),
            submitted_at: Some(ctx.now),
            clear_error: true,
            ..Default::default()
        };
        match self
            .store
            .compare_and_set(signal.id, signal.demo_status, DemoStatus::Submitting, claim, ctx.now)
            .await?
        {
            CasOutcome::Applied(_) => {}
            CasOutcome::Conflict { current } => {
                info!(
                    "Signal #{} claimed by another worker ({:?}), not submitting",
                    signal.id, current
                );
                return Ok(Outcome::AlreadyProcessed { status: current });
            }
        }

        let request = OrderRequest {
            client_order_id: entry_client_id(signal.id),
            pair: symbol.to_string(),
            side: signal.direction.side(),
            order_type,
            quantity,
            price: (order_type == OrderType::Limit).then_some(order_price),
            take_profit: Some(tp),
            stop_loss: Some(sl),
        };
        info!(
            "Signal #{}: {} {} {} qty={} @ {:.4} TP={:.4} SL={:.4}",
            signal.id, order_type, request.side, symbol, quantity, order_price, tp, sl
        );

        match with_timeout(self.exchange_timeout, self.exchange.place_order(&request)).await {
            Ok(ack) => {
                let status = DemoStatus::from(ack.status);
                let filled = ack.status == AckStatus::Filled;
                let update = SignalUpdate {
                    order_id: Some(ack.order_id.clone()),
                    entry_price: Some(if filled {
                        ack.avg_price.unwrap_or(order_price)
                    } else {
                        order_price
                    }),
                    tp_price: Some(tp),
                    sl_price: Some(sl),
                    filled_at: filled.then(|| ack.filled_at.unwrap_or(ctx.now)),
                    ..Default::default()
                };
                match self
                    .store
                    .compare_and_set(signal.id, Some(DemoStatus::Submitting), status, update, ctx.now)
                    .await?
                {
                    CasOutcome::Applied(_) => {}
                    CasOutcome::Conflict { current } => bail!(
                        "signal #{} left SUBMITTING while order {} was in flight (now {:?})",
                        signal.id,
                        ack.order_id,
                        current
                    ),
                }
                self.journal(
                    signal,
                    ctx,
                    "ORDER_SUBMITTED",
                    Some(status),
                    format!("Order {} accepted as {}", ack.order_id, status),
                    json!({
                        "order_id": ack.order_id,
                        "client_order_id": request.client_order_id,
                        "order_type": order_type,
                        "side": request.side,
                        "quantity": quantity,
                        "price": order_price,
                        "take_profit": tp,
                        "stop_loss": sl,
                    }),
                )
                .await?;
                info!("Signal #{} -> {} (order {})", signal.id, status, ack.order_id);
                Ok(Outcome::Submitted {
                    order_id: ack.order_id,
                    status,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Signal #{}: order submission failed: {}", signal.id, reason);
                match self
                    .store
                    .compare_and_set(
                        signal.id,
                        Some(DemoStatus::Submitting),
                        DemoStatus::Failed,
                        SignalUpdate::with_error(reason.clone()),
                        ctx.now,
                    )
                    .await?
                {
                    CasOutcome::Applied(_) => {}
                    CasOutcome::Conflict { current } => bail!(
                        "signal #{} left SUBMITTING while its order failed ({}), now {:?}",
                        signal.id,
                        reason,
                        current
                    ),
                }
                self.journal(
                    signal,
                    ctx,
                    "ERROR",
                    Some(DemoStatus::Failed),
                    reason.clone(),
                    json!({ "client_order_id": request.client_order_id }),
                )
                .await?;
                Ok(Outcome::Failed { reason })
            }
        }
    }

    /// CAS the signal from its observed status to `next` and journal it.
    pub async fn record(
        &self,
        signal: &Signal,
        next: DemoStatus,
        message: String,
        details: Value,
        ctx: &TradingContext,
    ) -> Result<Outcome> {
        let update = SignalUpdate::with_error(message.clone());
        match self
            .store
            .compare_and_set(signal.id, signal.demo_status, next, update, ctx.now)
            .await?
        {
            CasOutcome::Applied(_) => {
                if signal.demo_status == Some(next) {
                    debug!("Signal #{} still {}: {}", signal.id, next, message);
                } else {
                    info!("Signal #{} -> {}: {}", signal.id, next, message);
                }
                self.journal(signal, ctx, next.as_str(), Some(next), message, details)
                    .await?;
                Ok(Outcome::Recorded(next))
            }
            CasOutcome::Conflict { current } => {
                debug!(
                    "Signal #{} changed to {:?} before {} could be written",
                    signal.id, current, next
                );
                Ok(Outcome::AlreadyProcessed { status: current })
            }
        }
    }

    async fn journal(
        &self,
        signal: &Signal,
        ctx: &TradingContext,
        event_type: &str,
        status: Option<DemoStatus>,
        message: String,
        details: Value,
    ) -> Result<()> {
        record_event(self.store.as_ref(), signal.id, ctx.now, event_type, status, message, details)
            .await
            .context("Failed to append signal event")
    }
}
