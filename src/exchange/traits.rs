//! Host-facing interfaces consumed by the rotation engine.
//!
//! The engine never talks to a venue directly. It goes through:
//! - [`Brokerage`] for order submission, cancellation, status and portfolio state
//! - [`HistoryProvider`] for historical bars used to warm up scores
//!
//! [`PaperBroker`](super::PaperBroker) and
//! [`CsvBarLoader`](crate::backtest::CsvBarLoader) are the in-process implementations.

use super::types::{Bar, OrderId, OrderTicket, OrderUpdate, Resolution};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Order routing and portfolio snapshot API of the host brokerage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Brokerage: Send + Sync {
    /// Submit a market order for a signed quantity (negative = sell).
    async fn submit_order(&self, symbol: &str, quantity: Decimal) -> anyhow::Result<OrderTicket>;

    /// Request cancellation. Completion is observed through [`Brokerage::order_status`].
    async fn cancel_order(&self, order_id: OrderId) -> anyhow::Result<()>;

    /// Current status of an order.
    async fn order_status(&self, order_id: OrderId) -> anyhow::Result<OrderUpdate>;

    /// Current holdings: symbol -> signed quantity. Flat symbols may be omitted.
    async fn holdings(&self) -> anyhow::Result<HashMap<String, Decimal>>;

    /// Uninvested cash.
    async fn cash(&self) -> anyhow::Result<Decimal>;

    /// Last traded price, if the symbol has traded.
    async fn last_price(&self, symbol: &str) -> anyhow::Result<Option<Decimal>>;
}

/// Historical bar source, used only to warm up indicators.
pub trait HistoryProvider: Send + Sync {
    /// The last `lookback` bars per symbol strictly before `end`, oldest first.
    fn history(
        &self,
        symbols: &[String],
        lookback: usize,
        resolution: Resolution,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Bar>>;
}
