use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order lifecycle of a signal.
///
/// Every variant is either retryable (a later attempt may still place an
/// order) or final (the signal never gets a new entry order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DemoStatus {
    WaitingForPrice,
    SignalTooOld,
    InvalidEntry,
    InvalidQuantity,
    InvalidMarketPrice,
    Failed,
    Cancelled,
    LiveDisabled,
    NotConfigured,
    Placed,
    Filled,
    New,
    Open,
    Submitting,
    OpenPosition,
    OrderCancelledPriceMoved,
    LevelBroken,
    SignalClosedNoOrder,
    SlToBreakeven,
    PositionAlreadyOpen,
    PriceDeviationTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Retryable,
    Final,
}

impl DemoStatus {
    pub const ALL: [DemoStatus; 21] = [
        DemoStatus::WaitingForPrice,
        DemoStatus::SignalTooOld,
        DemoStatus::InvalidEntry,
        DemoStatus::InvalidQuantity,
        DemoStatus::InvalidMarketPrice,
        DemoStatus::Failed,
        DemoStatus::Cancelled,
        DemoStatus::LiveDisabled,
        DemoStatus::NotConfigured,
        DemoStatus::Placed,
        DemoStatus::Filled,
        DemoStatus::New,
        DemoStatus::Open,
        DemoStatus::Submitting,
        DemoStatus::OpenPosition,
        DemoStatus::OrderCancelledPriceMoved,
        DemoStatus::LevelBroken,
        DemoStatus::SignalClosedNoOrder,
        DemoStatus::SlToBreakeven,
        DemoStatus::PositionAlreadyOpen,
        DemoStatus::PriceDeviationTooLarge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DemoStatus::WaitingForPrice => "WAITING_FOR_PRICE",
            DemoStatus::SignalTooOld => "SIGNAL_TOO_OLD",
            DemoStatus::InvalidEntry => "INVALID_ENTRY",
            DemoStatus::InvalidQuantity => "INVALID_QUANTITY",
            DemoStatus::InvalidMarketPrice => "INVALID_MARKET_PRICE",
            DemoStatus::Failed => "FAILED",
            DemoStatus::Cancelled => "CANCELLED",
            DemoStatus::LiveDisabled => "LIVE_DISABLED",
            DemoStatus::NotConfigured => "NOT_CONFIGURED",
            DemoStatus::Placed => "PLACED",
            DemoStatus::Filled => "FILLED",
            DemoStatus::New => "NEW",
            DemoStatus::Open => "OPEN",
            DemoStatus::Submitting => "SUBMITTING",
            DemoStatus::OpenPosition => "OPEN_POSITION",
            DemoStatus::OrderCancelledPriceMoved => "ORDER_CANCELLED_PRICE_MOVED",
            DemoStatus::LevelBroken => "LEVEL_BROKEN",
            DemoStatus::SignalClosedNoOrder => "SIGNAL_CLOSED_NO_ORDER",
            DemoStatus::SlToBreakeven => "SL_TO_BREAKEVEN",
            DemoStatus::PositionAlreadyOpen => "POSITION_ALREADY_OPEN",
            DemoStatus::PriceDeviationTooLarge => "PRICE_DEVIATION_TOO_LARGE",
        }
    }

    pub fn class(self) -> StatusClass {
        match self {
            DemoStatus::WaitingForPrice
            | DemoStatus::SignalTooOld
            | DemoStatus::InvalidEntry
            | DemoStatus::InvalidQuantity
            | DemoStatus::InvalidMarketPrice
            | DemoStatus::Failed
            | DemoStatus::Cancelled
            | DemoStatus::LiveDisabled
            | DemoStatus::NotConfigured => StatusClass::Retryable,
            DemoStatus::Placed
            | DemoStatus::Filled
            | DemoStatus::New
            | DemoStatus::Open
            | DemoStatus::Submitting
            | DemoStatus::OpenPosition
            | DemoStatus::OrderCancelledPriceMoved
            | DemoStatus::LevelBroken
            | DemoStatus::SignalClosedNoOrder
            | DemoStatus::SlToBreakeven
            | DemoStatus::PositionAlreadyOpen
            | DemoStatus::PriceDeviationTooLarge => StatusClass::Final,
        }
    }

    pub fn is_retryable(self) -> bool {
        self.class() == StatusClass::Retryable
    }

    pub fn is_final(self) -> bool {
        self.class() == StatusClass::Final
    }

    /// Statuses that mean an entry order may be resting on the exchange.
    pub fn is_live_order(self) -> bool {
        matches!(
            self,
            DemoStatus::New | DemoStatus::Open | DemoStatus::Placed | DemoStatus::Submitting
        )
    }

    /// Whether `self -> next` is a legal move.
    ///
    /// Retryable statuses may go anywhere. Final statuses only hand off
    /// between stages of the same order, and LEVEL_BROKEN may recover to
    /// WAITING_FOR_PRICE. Rewriting the current status is always allowed.
    pub fn can_transition_to(self, next: DemoStatus) -> bool {
        if self == next || self.is_retryable() {
            return true;
        }
        match self {
            DemoStatus::LevelBroken => next == DemoStatus::WaitingForPrice,
            DemoStatus::Submitting => matches!(
                next,
                DemoStatus::New
                    | DemoStatus::Open
                    | DemoStatus::Placed
                    | DemoStatus::Filled
                    | DemoStatus::OpenPosition
                    | DemoStatus::Failed
                    | DemoStatus::OrderCancelledPriceMoved
            ),
            DemoStatus::New | DemoStatus::Open | DemoStatus::Placed => matches!(
                next,
                DemoStatus::New
                    | DemoStatus::Open
                    | DemoStatus::Placed
                    | DemoStatus::Filled
                    | DemoStatus::OpenPosition
                    | DemoStatus::OrderCancelledPriceMoved
            ),
            DemoStatus::Filled => next == DemoStatus::OpenPosition,
            DemoStatus::OpenPosition => next == DemoStatus::SlToBreakeven,
            _ => false,
        }
    }

    /// Transition check that treats an unset status as the start state.
    pub fn transition_allowed(from: Option<DemoStatus>, to: DemoStatus) -> bool {
        match from {
            None => true,
            Some(current) => current.can_transition_to(to),
        }
    }
}

impl fmt::Display for DemoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown demo status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for DemoStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        DemoStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl TryFrom<String> for DemoStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DemoStatus> for String {
    fn from(status: DemoStatus) -> Self {
        status.as_str().to_string()
    }
}
