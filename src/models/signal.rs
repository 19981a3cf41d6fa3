use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DemoStatus, Direction, SignalStatus};

pub const MAX_ERROR_LEN: usize = 500;

/// A level-based trade idea plus everything this crate tracks about its entry order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: u64,
    pub pair: String,
    pub direction: Direction,
    pub level_price: f64,
    #[serde(default)]
    pub entry_price: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub status: SignalStatus,

    #[serde(default)]
    pub demo_status: Option<DemoStatus>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub tp_price: Option<f64>,
    #[serde(default)]
    pub sl_price: Option<f64>,

    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_deviation_pct: Option<f64>,
    #[serde(default)]
    pub hedge_order_id: Option<String>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl Signal {
    pub fn new(
        id: u64,
        pair: impl Into<String>,
        direction: Direction,
        level_price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            pair: pair.into(),
            direction,
            level_price,
            entry_price: None,
            timestamp,
            status: SignalStatus::Active,
            demo_status: None,
            order_id: None,
            filled_at: None,
            quantity: None,
            tp_price: None,
            sl_price: None,
            error: None,
            submitted_at: None,
            updated_at: None,
            max_deviation_pct: None,
            hedge_order_id: None,
            exit_price: None,
            exit_timestamp: None,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    /// Price the entry order is built around.
    pub fn reference_entry_price(&self) -> f64 {
        self.entry_price.unwrap_or(self.level_price)
    }

    /// Absolute distance of `price` from the level, in percent.
    pub fn level_deviation_pct(&self, price: f64) -> f64 {
        if self.level_price <= 0.0 {
            return f64::INFINITY;
        }
        (price / self.level_price - 1.0).abs() * 100.0
    }
}

/// Fields written together with a status change. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalUpdate {
    pub error: Option<String>,
    pub clear_error: bool,
    pub order_id: Option<String>,
    pub entry_price: Option<f64>,
    pub quantity: Option<f64>,
    pub tp_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub max_deviation_pct: Option<f64>,
    pub hedge_order_id: Option<String>,
}

impl SignalUpdate {
    pub fn with_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn apply(self, signal: &mut Signal, next: DemoStatus, at: DateTime<Utc>) {
        signal.demo_status = Some(next);
        if self.clear_error {
            signal.error = None;
        }
        if let Some(error) = self.error {
            signal.error = Some(truncate(&error, MAX_ERROR_LEN));
        }
        if let Some(v) = self.order_id {
            signal.order_id = Some(v);
        }
        if let Some(v) = self.entry_price {
            signal.entry_price = Some(v);
        }
        if let Some(v) = self.quantity {
            signal.quantity = Some(v);
        }
        if let Some(v) = self.tp_price {
            signal.tp_price = Some(v);
        }
        if let Some(v) = self.sl_price {
            signal.sl_price = Some(v);
        }
        if let Some(v) = self.submitted_at {
            signal.submitted_at = Some(v);
        }
        if let Some(v) = self.filled_at {
            signal.filled_at = Some(v);
        }
        if let Some(v) = self.max_deviation_pct {
            signal.max_deviation_pct = Some(v);
        }
        if let Some(v) = self.hedge_order_id {
            signal.hedge_order_id = Some(v);
        }
        signal.updated_at = Some(at);
        signal.version += 1;
    }
}

/// Journal entry describing one state change of a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub signal_id: u64,
    pub at: DateTime<Utc>,
    pub event_type: String,
    #[serde(default)]
    pub status: Option<DemoStatus>,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl SignalEvent {
    pub fn new(
        signal_id: u64,
        at: DateTime<Utc>,
        event_type: impl Into<String>,
        status: Option<DemoStatus>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            signal_id,
            at,
            event_type: event_type.into(),
            status,
            message: truncate(&message.into(), MAX_ERROR_LEN),
            details,
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Signal {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Signal::new(7, "BTC/USDT", Direction::Long, 100.0, ts)
    }

    #[test]
    fn reference_entry_defaults_to_level() {
        let mut s = sample();
        assert_eq!(s.reference_entry_price(), 100.0);
        s.entry_price = Some(101.0);
        assert_eq!(s.reference_entry_price(), 101.0);
    }

    #[test]
    fn level_deviation_is_absolute() {
        let s = sample();
        assert!((s.level_deviation_pct(102.0) - 2.0).abs() < 1e-9);
        assert!((s.level_deviation_pct(98.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn update_truncates_error_and_bumps_version() {
        let mut s = sample();
        let at = s.timestamp + Duration::seconds(5);
        SignalUpdate::with_error("x".repeat(800)).apply(&mut s, DemoStatus::Failed, at);
        assert_eq!(s.error.as_ref().map(|e| e.len()), Some(MAX_ERROR_LEN));
        assert_eq!(s.demo_status, Some(DemoStatus::Failed));
        assert_eq!(s.updated_at, Some(at));
        assert_eq!(s.version, 1);

        let clear = SignalUpdate {
            clear_error: true,
            order_id: Some("abc".into()),
            ..Default::default()
        };
        clear.apply(&mut s, DemoStatus::Placed, at);
        assert!(s.error.is_none());
        assert_eq!(s.order_id.as_deref(), Some("abc"));
        assert_eq!(s.version, 2);
    }

    #[test]
    fn deserializes_minimal_record() {
        let json = r#"{"id":1,"pair":"ETH/USDT","direction":"SHORT","level_price":2500.0,
            "timestamp":"2024-03-01T10:00:00Z","status":"ACTIVE","demo_status":"waiting_for_price"}"#;
        let s: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(s.direction, Direction::Short);
        assert_eq!(s.demo_status, Some(DemoStatus::WaitingForPrice));
        assert!(s.order_id.is_none());
    }
}
