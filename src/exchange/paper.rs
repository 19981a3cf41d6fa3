use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::exchange::{
    AckStatus, ExchangeError, ExchangePosition, OpenOrder, OrderAck, OrderExchange, OrderFill,
    OrderRequest,
};
use crate::models::{Direction, OrderSide, OrderType, SignalStatus};

#[derive(Debug, Clone, PartialEq)]
enum OrderState {
    Resting,
    Filled(OrderFill),
    Cancelled,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    state: OrderState,
}

/// A position closed by its take-profit or stop-loss.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub pair: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub outcome: SignalStatus,
}

#[derive(Default)]
struct Book {
    prices: HashMap<String, f64>,
    orders: HashMap<String, PaperOrder>,
    by_client_id: HashMap<String, String>,
    positions: HashMap<String, ExchangePosition>,
    next_id: u64,
    fail_next: Option<ExchangeError>,
    place_delay: Option<Duration>,
    ack_delay: Option<Duration>,
    place_calls: usize,
    cancel_calls: usize,
}

/// In-memory exchange: limit orders rest until the price crosses them,
/// market orders fill at the last price, positions close on TP/SL.
pub struct PaperExchange {
    enabled: AtomicBool,
    book: Mutex<Book>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new(true)
    }
}

fn direction_of(side: OrderSide) -> Direction {
    match side {
        OrderSide::Buy => Direction::Long,
        OrderSide::Sell => Direction::Short,
    }
}

impl PaperExchange {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            book: Mutex::new(Book::default()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Next `place_order` fails with `err`.
    pub async fn fail_next_order(&self, err: ExchangeError) {
        self.book.lock().await.fail_next = Some(err);
    }

    /// Delay every `place_order` by `delay` (to exercise call timeouts).
    pub async fn set_place_delay(&self, delay: Option<Duration>) {
        self.book.lock().await.place_delay = delay;
    }

    /// Book every order, then hold the ack back by `delay` (a lost response).
    pub async fn set_ack_delay(&self, delay: Option<Duration>) {
        self.book.lock().await.ack_delay = delay;
    }

    pub async fn place_calls(&self) -> usize {
        self.book.lock().await.place_calls
    }

    pub async fn cancel_calls(&self) -> usize {
        self.book.lock().await.cancel_calls
    }

    pub async fn order_count(&self) -> usize {
        self.book.lock().await.orders.len()
    }

    /// Open a position directly, as if filled earlier.
    pub async fn seed_position(&self, position: ExchangePosition) {
        let mut book = self.book.lock().await;
        book.positions.insert(position.pair.clone(), position);
    }

    /// Update the last price, fill crossed limit orders and close positions
    /// whose TP or SL was reached.
    pub async fn set_price(&self, pair: &str, price: f64) -> Vec<ClosedPosition> {
        let mut book = self.book.lock().await;
        book.prices.insert(pair.to_string(), price);

        let crossed: Vec<String> = book
            .orders
            .iter()
            .filter(|(_, o)| o.request.pair == pair && o.state == OrderState::Resting)
            .filter(|(_, o)| match (o.request.side, o.request.price) {
                (OrderSide::Buy, Some(limit)) => price <= limit,
                (OrderSide::Sell, Some(limit)) => price >= limit,
                _ => false,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in crossed {
            let fill_price = book.orders.get(&id).and_then(|o| o.request.price).unwrap_or(price);
            Self::fill(&mut book, &id, fill_price);
        }

        let mut closed = Vec::new();
        if let Some(pos) = book.positions.get(pair).cloned() {
            let hit = match pos.direction {
                Direction::Long => {
                    if pos.take_profit.is_some_and(|tp| price >= tp) {
                        Some(SignalStatus::TakeProfit)
                    } else if pos.stop_loss.is_some_and(|sl| price <= sl) {
                        Some(SignalStatus::StopLoss)
                    } else {
                        None
                    }
                }
                Direction::Short => {
                    if pos.take_profit.is_some_and(|tp| price <= tp) {
                        Some(SignalStatus::TakeProfit)
                    } else if pos.stop_loss.is_some_and(|sl| price >= sl) {
                        Some(SignalStatus::StopLoss)
                    } else {
                        None
                    }
                }
            };
            if let Some(outcome) = hit {
                book.positions.remove(pair);
                info!(
                    "Paper position {} {} closed at {:.4} ({})",
                    pos.direction, pair, price, outcome
                );
                closed.push(ClosedPosition {
                    pair: pair.to_string(),
                    direction: pos.direction,
                    entry_price: pos.entry_price,
                    exit_price: price,
                    outcome,
                });
            }
        }
        closed
    }

    fn fill(book: &mut Book, order_id: &str, price: f64) -> Option<OrderFill> {
        let order = book.orders.get_mut(order_id)?;
        let fill = OrderFill {
            order_id: order_id.to_string(),
            price,
            filled_at: Utc::now(),
        };
        order.state = OrderState::Filled(fill.clone());
        let request = order.request.clone();
        let direction = direction_of(request.side);

        match book.positions.get_mut(&request.pair) {
            Some(pos) if pos.direction == direction => {
                let size = pos.size + request.quantity;
                pos.entry_price = (pos.entry_price * pos.size + price * request.quantity) / size;
                pos.size = size;
                pos.take_profit = request.take_profit.or(pos.take_profit);
                pos.stop_loss = request.stop_loss.or(pos.stop_loss);
            }
            Some(pos) => {
                pos.size -= request.quantity;
                if pos.size <= 1e-12 {
                    book.positions.remove(&request.pair);
                }
            }
            None => {
                book.positions.insert(
                    request.pair.clone(),
                    ExchangePosition {
                        pair: request.pair.clone(),
                        direction,
                        size: request.quantity,
                        entry_price: price,
                        take_profit: request.take_profit,
                        stop_loss: request.stop_loss,
                    },
                );
            }
        }
        debug!("Paper fill {} {} @ {:.4}", order_id, request.pair, price);
        Some(fill)
    }
}

#[async_trait]
impl OrderExchange for PaperExchange {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let delay = {
            let mut book = self.book.lock().await;
            book.place_calls += 1;
            book.place_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut book = self.book.lock().await;
        if let Some(err) = book.fail_next.take() {
            return Err(err);
        }

        if let Some(existing) = book.by_client_id.get(&request.client_order_id).cloned() {
            let order = book
                .orders
                .get(&existing)
                .ok_or_else(|| ExchangeError::UnknownOrder(existing.clone()))?;
            return match &order.state {
                OrderState::Filled(fill) => Ok(OrderAck {
                    order_id: existing,
                    status: AckStatus::Filled,
                    avg_price: Some(fill.price),
                    filled_at: Some(fill.filled_at),
                }),
                OrderState::Resting => Ok(OrderAck {
                    order_id: existing,
                    status: AckStatus::New,
                    avg_price: None,
                    filled_at: None,
                }),
                OrderState::Cancelled => Err(ExchangeError::Rejected(format!(
                    "client order id {} belongs to cancelled order {}",
                    request.client_order_id, existing
                ))),
            };
        }

        if !(request.quantity.is_finite() && request.quantity > 0.0) {
            return Err(ExchangeError::Rejected(format!(
                "invalid quantity {}",
                request.quantity
            )));
        }

        let last = book.prices.get(&request.pair).copied();
        let immediate = match request.order_type {
            OrderType::Market => {
                Some(last.ok_or_else(|| ExchangeError::NoPrice(request.pair.clone()))?)
            }
            OrderType::Limit => {
                let limit = request
                    .price
                    .filter(|p| p.is_finite() && *p > 0.0)
                    .ok_or_else(|| ExchangeError::Rejected("limit order without price".into()))?;
                // marketable limit orders execute at the last price
                last.filter(|p| match request.side {
                    OrderSide::Buy => *p <= limit,
                    OrderSide::Sell => *p >= limit,
                })
            }
        };

        book.next_id += 1;
        let order_id = format!("paper-{}", book.next_id);
        book.orders.insert(
            order_id.clone(),
            PaperOrder {
                request: request.clone(),
                state: OrderState::Resting,
            },
        );
        book.by_client_id
            .insert(request.client_order_id.clone(), order_id.clone());

        let ack = match immediate.and_then(|price| Self::fill(&mut book, &order_id, price)) {
            Some(fill) => OrderAck {
                order_id,
                status: AckStatus::Filled,
                avg_price: Some(fill.price),
                filled_at: Some(fill.filled_at),
            },
            None => OrderAck {
                order_id,
                status: AckStatus::New,
                avg_price: None,
                filled_at: None,
            },
        };
        info!(
            "Paper order {} {} {} {} qty={} -> {:?}",
            ack.order_id, request.order_type, request.side, request.pair, request.quantity, ack.status
        );
        let ack_delay = book.ack_delay;
        drop(book);
        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ack)
    }

    async fn cancel_order(&self, _pair: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut book = self.book.lock().await;
        book.cancel_calls += 1;
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::UnknownOrder(order_id.to_string()))?;
        if order.state == OrderState::Resting {
            order.state = OrderState::Cancelled;
        }
        Ok(())
    }

    async fn get_position(&self, pair: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        Ok(self.book.lock().await.positions.get(pair).cloned())
    }

    async fn open_entry_orders(&self, pair: &str, side: OrderSide) -> Result<Vec<OpenOrder>, ExchangeError> {
        let book = self.book.lock().await;
        let mut open: Vec<OpenOrder> = book
            .orders
            .iter()
            .filter(|(_, o)| {
                o.state == OrderState::Resting && o.request.pair == pair && o.request.side == side
            })
            .map(|(id, o)| OpenOrder {
                order_id: id.clone(),
                client_order_id: o.request.client_order_id.clone(),
            })
            .collect();
        open.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        Ok(open)
    }

    async fn order_fill(&self, _pair: &str, order_id: &str) -> Result<Option<OrderFill>, ExchangeError> {
        let book = self.book.lock().await;
        let order = book
            .orders
            .get(order_id)
            .ok_or_else(|| ExchangeError::UnknownOrder(order_id.to_string()))?;
        Ok(match &order.state {
            OrderState::Filled(fill) => Some(fill.clone()),
            _ => None,
        })
    }

    async fn get_current_price(&self, pair: &str) -> Result<f64, ExchangeError> {
        self.book
            .lock()
            .await
            .prices
            .get(pair)
            .copied()
            .ok_or_else(|| ExchangeError::NoPrice(pair.to_string()))
    }
}
