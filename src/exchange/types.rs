//! Order, fill and market data types shared by the brokerage and the engine.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Brokerage-assigned order identifier.
pub type OrderId = u64;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side implied by a signed order quantity (positive buys, negative sells).
    pub fn from_quantity(quantity: Decimal) -> Self {
        if quantity >= Decimal::ZERO {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }
}

/// Order status as reported by the brokerage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
    CancelPending,
    Invalid,
    /// No status reported (unknown to the brokerage).
    None,
}

impl OrderStatus {
    /// Filled, canceled and invalid orders never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Invalid
        )
    }

    /// Orders the brokerage may still fill or cancel.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderStatus::New
                | OrderStatus::Submitted
                | OrderStatus::PartiallyFilled
                | OrderStatus::CancelPending
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderStatus::New => "NEW",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::CancelPending => "CANCEL_PENDING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::None => "NONE",
        };
        f.write_str(name)
    }
}

/// Acknowledgement returned when an order is accepted for submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderTicket {
    pub order_id: OrderId,
    pub symbol: String,
    /// Signed quantity (negative = sell)
    pub quantity: Decimal,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
}

impl OrderTicket {
    pub fn side(&self) -> OrderSide {
        OrderSide::from_quantity(self.quantity)
    }
}

/// Status snapshot of a single order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderUpdate {
    pub order_id: OrderId,
    pub symbol: String,
    pub status: OrderStatus,
    /// Signed quantity filled so far
    pub filled_quantity: Decimal,
    /// Average fill price, zero until the first fill
    pub avg_fill_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Bar resolution used for history requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Minute,
    Hour,
    Daily,
}

impl Resolution {
    /// Nominal span of one bar.
    pub fn span(&self) -> Duration {
        match self {
            Resolution::Minute => Duration::minutes(1),
            Resolution::Hour => Duration::hours(1),
            Resolution::Daily => Duration::days(1),
        }
    }
}

/// OHLCV bar for one symbol. `timestamp` is the bar's end time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    /// Bar with every price set to `close` (useful when only closes are known).
    pub fn flat(symbol: &str, timestamp: DateTime<Utc>, close: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            timestamp,
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ZERO,
        }
    }
}
