//! In-flight order tracking.
//!
//! At most one live order per symbol. Records are created on submission and
//! dropped at the first terminal status; later events for a dropped order are
//! ignored.

use crate::exchange::{OrderId, OrderStatus, OrderTicket, OrderUpdate};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("{symbol} already has live order {order_id}")]
    DuplicateLiveOrder { symbol: String, order_id: OrderId },
}

/// Lifecycle position of a symbol's order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderState {
    Unsubmitted,
    Pending(OrderId),
    PartiallyFilled(OrderId),
    /// Filled, Canceled or Invalid
    Terminal(OrderStatus),
}

impl OrderState {
    pub fn is_live(&self) -> bool {
        matches!(self, OrderState::Pending(_) | OrderState::PartiallyFilled(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRecord {
    pub symbol: String,
    pub order_id: OrderId,
    /// Signed quantity submitted
    pub submitted_quantity: Decimal,
    /// Signed quantity filled so far
    pub filled_quantity: Decimal,
    pub status: OrderStatus,
    pub last_event: DateTime<Utc>,
    /// Consecutive brokerage calls about this order that failed
    pub failures: u32,
}

impl OrderRecord {
    pub fn state(&self) -> OrderState {
        match self.status {
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Invalid => {
                OrderState::Terminal(self.status)
            }
            OrderStatus::PartiallyFilled => OrderState::PartiallyFilled(self.order_id),
            _ if self.filled_quantity != Decimal::ZERO => {
                OrderState::PartiallyFilled(self.order_id)
            }
            _ => OrderState::Pending(self.order_id),
        }
    }
}

#[derive(Debug, Default)]
pub struct OrderTracker {
    records: HashMap<String, OrderRecord>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a submitted order.
    ///
    /// Fails if the symbol already has a live order. Tickets that come back
    /// terminal (immediate fill or rejection) are not retained.
    pub fn record_submission(&mut self, ticket: &OrderTicket) -> Result<OrderState, TrackerError> {
        if let Some(existing) = self.records.get(&ticket.symbol) {
            return Err(TrackerError::DuplicateLiveOrder {
                symbol: ticket.symbol.clone(),
                order_id: existing.order_id,
            });
        }

        let record = OrderRecord {
            symbol: ticket.symbol.clone(),
            order_id: ticket.order_id,
            submitted_quantity: ticket.quantity,
            filled_quantity: if ticket.status == OrderStatus::Filled {
                ticket.quantity
            } else {
                Decimal::ZERO
            },
            status: ticket.status,
            last_event: ticket.submitted_at,
            failures: 0,
        };
        let state = record.state();

        debug!(
            symbol = %ticket.symbol,
            order_id = ticket.order_id,
            status = %ticket.status,
            "Order recorded"
        );

        if state.is_live() {
            self.records.insert(ticket.symbol.clone(), record);
        }
        Ok(state)
    }

    /// Apply a status update. Returns the new state, or `None` when the update
    /// concerns an order that is not tracked or carries no status.
    pub fn apply_update(&mut self, update: &OrderUpdate) -> Option<OrderState> {
        if update.status == OrderStatus::None {
            return None;
        }

        let record = self
            .records
            .get_mut(&update.symbol)
            .filter(|r| r.order_id == update.order_id)?;

        record.status = update.status;
        record.filled_quantity = update.filled_quantity;
        record.last_event = update.timestamp;
        record.failures = 0;
        let state = record.state();

        if let OrderState::Terminal(status) = state {
            debug!(
                symbol = %update.symbol,
                order_id = update.order_id,
                %status,
                filled = %update.filled_quantity,
                "Order reached terminal state"
            );
            self.records.remove(&update.symbol);
        }

        Some(state)
    }

    /// Mark a cancel request as sent.
    pub fn mark_cancel_pending(&mut self, symbol: &str) {
        if let Some(record) = self.records.get_mut(symbol) {
            record.status = OrderStatus::CancelPending;
        }
    }

    pub fn state(&self, symbol: &str) -> OrderState {
        self.records
            .get(symbol)
            .map(OrderRecord::state)
            .unwrap_or(OrderState::Unsubmitted)
    }

    pub fn live_order(&self, symbol: &str) -> Option<&OrderRecord> {
        self.records.get(symbol)
    }

    /// Symbols with a live order, sorted.
    pub fn live_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.records.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Count a failed brokerage call about the symbol's order. Returns the
    /// consecutive failure count, 0 when nothing is tracked.
    pub fn record_failure(&mut self, symbol: &str) -> u32 {
        match self.records.get_mut(symbol) {
            Some(record) => {
                record.failures += 1;
                record.failures
            }
            None => 0,
        }
    }

    /// Stop tracking a symbol without a terminal event (order vanished at the brokerage).
    pub fn forget(&mut self, symbol: &str) -> Option<OrderRecord> {
        self.records.remove(symbol)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
