pub mod coinbase;
pub mod paper;

pub use coinbase::CoinbaseTicker;
pub use paper::PaperExchange;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::models::{DemoStatus, Direction, OrderSide, OrderType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("exchange call timed out after {0:?}")]
    Timeout(Duration),
    #[error("no market price for {0}")]
    NoPrice(String),
    #[error("unknown order {0}")]
    UnknownOrder(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Deterministic id; resubmitting the same id returns the original order.
    pub client_order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price. Ignored for market orders.
    pub price: Option<f64>,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
}

/// Acknowledged state of a freshly placed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    New,
    Open,
    Placed,
    Filled,
}

impl From<AckStatus> for DemoStatus {
    fn from(ack: AckStatus) -> Self {
        match ack {
            AckStatus::New => DemoStatus::New,
            AckStatus::Open => DemoStatus::Open,
            AckStatus::Placed => DemoStatus::Placed,
            AckStatus::Filled => DemoStatus::OpenPosition,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: AckStatus,
    pub avg_price: Option<f64>,
    pub filled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub pair: String,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
}

/// A resting entry order as listed by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub client_order_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub price: f64,
    pub filled_at: DateTime<Utc>,
}

/// Order-capable exchange. Shared between the engine and the watcher, so
/// every method takes `&self`.
#[async_trait]
pub trait OrderExchange: Send + Sync {
    fn is_enabled(&self) -> bool;
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;
    async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<(), ExchangeError>;
    async fn get_position(&self, pair: &str) -> Result<Option<ExchangePosition>, ExchangeError>;
    /// Resting entry orders on `pair` for `side`.
    async fn open_entry_orders(&self, pair: &str, side: OrderSide) -> Result<Vec<OpenOrder>, ExchangeError>;
    /// Fill details once the order has executed, `None` while it is still resting.
    async fn order_fill(&self, pair: &str, order_id: &str) -> Result<Option<OrderFill>, ExchangeError>;
    async fn get_current_price(&self, pair: &str) -> Result<f64, ExchangeError>;
}

/// Read-only market data feed.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn current_price(&self, pair: &str) -> anyhow::Result<f64>;
}

/// Bound an exchange call; expiry becomes `ExchangeError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ExchangeError>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout(limit)),
    }
}
