//! Paper brokerage for backtesting and paper trading.

use super::traits::Brokerage;
use super::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// When submitted orders are matched against market prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillModel {
    /// Match at the current price during submission.
    Immediate,
    /// Leave orders working until the next price update.
    NextPrice,
}

/// Simulated position.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperPosition {
    pub symbol: String,
    /// Signed quantity (negative = short)
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

/// Simulated order book entry.
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub order_id: OrderId,
    pub symbol: String,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Decimal,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaperOrder {
    fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    fn to_update(&self) -> OrderUpdate {
        OrderUpdate {
            order_id: self.order_id,
            symbol: self.symbol.clone(),
            status: self.status,
            filled_quantity: self.filled_quantity,
            avg_fill_price: self.avg_fill_price,
            timestamp: self.updated_at,
        }
    }
}

/// Paper account state.
#[derive(Debug, Clone)]
pub struct PaperAccount {
    pub initial_cash: Decimal,
    pub cash: Decimal,
    pub positions: HashMap<String, PaperPosition>,
    pub orders: HashMap<OrderId, PaperOrder>,
    pub total_fees: Decimal,
    /// Number of fills (partial fills count individually)
    pub fill_count: u64,
    /// Simulated clock; wall clock when unset
    pub clock: Option<DateTime<Utc>>,
}

impl PaperAccount {
    fn new(initial_cash: Decimal) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            positions: HashMap::new(),
            orders: HashMap::new(),
            total_fees: Decimal::ZERO,
            fill_count: 0,
            clock: None,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }
}

/// In-memory brokerage that fills market orders against pushed prices.
pub struct PaperBroker {
    state: Arc<RwLock<PaperAccount>>,
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    order_id_counter: AtomicU64,
    /// Taker fee rate applied to fill notional
    fee_rate: Decimal,
    fill_model: FillModel,
    /// Fraction of the remaining quantity filled per match; `None` fills fully
    partial_fill_ratio: Option<Decimal>,
}

impl PaperBroker {
    /// Create a broker with immediate fills and a 0.1% fee.
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperAccount::new(initial_cash))),
            prices: Arc::new(RwLock::new(HashMap::new())),
            order_id_counter: AtomicU64::new(1),
            fee_rate: dec!(0.001),
            fill_model: FillModel::Immediate,
            partial_fill_ratio: None,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn with_fill_model(mut self, fill_model: FillModel) -> Self {
        self.fill_model = fill_model;
        self
    }

    /// Fill only this fraction of the remaining quantity per match.
    pub fn with_partial_fills(mut self, ratio: Decimal) -> Self {
        self.partial_fill_ratio = Some(ratio);
        self
    }

    /// Advance the simulated clock.
    pub async fn set_clock(&self, now: DateTime<Utc>) {
        self.state.write().await.clock = Some(now);
    }

    /// Push new market prices and match working orders against them.
    pub async fn set_prices(&self, prices: HashMap<String, Decimal>) {
        {
            let mut current = self.prices.write().await;
            current.extend(prices);
        }
        self.match_working_orders().await;
    }

    /// Snapshot of the account.
    pub async fn get_state(&self) -> PaperAccount {
        self.state.read().await.clone()
    }

    /// Cash plus marked-to-market position value.
    pub async fn equity(&self) -> Decimal {
        let state = self.state.read().await;
        let prices = self.prices.read().await;

        let positions_value: Decimal = state
            .positions
            .values()
            .map(|p| {
                let mark = prices.get(&p.symbol).copied().unwrap_or(p.avg_price);
                p.quantity * mark
            })
            .sum();

        state.cash + positions_value
    }

    fn next_order_id(&self) -> OrderId {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn fill_slice(&self, remaining: Decimal) -> Decimal {
        match self.partial_fill_ratio {
            Some(ratio) if ratio > Decimal::ZERO && ratio < Decimal::ONE => {
                let slice = (remaining * ratio).trunc();
                if slice == Decimal::ZERO {
                    remaining
                } else {
                    slice
                }
            }
            _ => remaining,
        }
    }

    async fn match_working_orders(&self) {
        let mut state = self.state.write().await;
        let prices = self.prices.read().await;

        let mut working: Vec<OrderId> = state
            .orders
            .values()
            .filter(|o| matches!(o.status, OrderStatus::Submitted | OrderStatus::PartiallyFilled))
            .map(|o| o.order_id)
            .collect();
        working.sort_unstable();

        for order_id in working {
            let Some((symbol, remaining)) = state
                .orders
                .get(&order_id)
                .map(|o| (o.symbol.clone(), o.remaining()))
            else {
                continue;
            };
            let Some(&price) = prices.get(&symbol) else {
                continue;
            };
            let slice = self.fill_slice(remaining);
            self.apply_fill(&mut state, order_id, slice, price);
        }
    }

    /// Apply a fill to the account, rejecting buys that cash cannot cover.
    fn apply_fill(
        &self,
        state: &mut PaperAccount,
        order_id: OrderId,
        fill_qty: Decimal,
        price: Decimal,
    ) {
        let now = state.now();
        let notional = fill_qty.abs() * price;
        let fee = notional * self.fee_rate;

        let Some(order) = state.orders.get(&order_id) else {
            return;
        };
        let symbol = order.symbol.clone();
        let already_filled = order.filled_quantity;

        if fill_qty > Decimal::ZERO && notional + fee > state.cash {
            let status = if already_filled == Decimal::ZERO {
                OrderStatus::Invalid
            } else {
                OrderStatus::Canceled
            };
            warn!(
                order_id,
                %symbol,
                required = %(notional + fee),
                cash = %state.cash,
                ?status,
                "Paper order not funded"
            );
            if let Some(order) = state.orders.get_mut(&order_id) {
                order.status = status;
                order.updated_at = now;
            }
            return;
        }

        // Cash moves opposite to quantity: buys spend, sells receive
        state.cash -= fill_qty * price + fee;
        state.total_fees += fee;
        state.fill_count += 1;

        let position = state
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| PaperPosition {
                symbol: symbol.clone(),
                quantity: Decimal::ZERO,
                avg_price: Decimal::ZERO,
            });

        let new_qty = position.quantity + fill_qty;
        let same_direction = position.quantity == Decimal::ZERO
            || position.quantity.is_sign_positive() == fill_qty.is_sign_positive();
        if same_direction && new_qty != Decimal::ZERO {
            position.avg_price =
                (position.quantity * position.avg_price + fill_qty * price) / new_qty;
        } else if new_qty != Decimal::ZERO
            && new_qty.is_sign_positive() != position.quantity.is_sign_positive()
        {
            // Crossed through flat: the remainder opens at the fill price
            position.avg_price = price;
        }
        position.quantity = new_qty;
        if new_qty == Decimal::ZERO {
            state.positions.remove(&symbol);
        }

        if let Some(order) = state.orders.get_mut(&order_id) {
            let total_filled = order.filled_quantity + fill_qty;
            order.avg_fill_price = if total_filled != Decimal::ZERO {
                (order.filled_quantity * order.avg_fill_price + fill_qty * price) / total_filled
            } else {
                Decimal::ZERO
            };
            order.filled_quantity = total_filled;
            order.status = if order.remaining() == Decimal::ZERO {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            order.updated_at = now;

            info!(
                order_id,
                %symbol,
                fill_qty = %fill_qty,
                price = %price,
                fee = %fee,
                status = %order.status,
                "Paper fill"
            );
        }
    }
}

#[async_trait]
impl Brokerage for PaperBroker {
    async fn submit_order(&self, symbol: &str, quantity: Decimal) -> Result<OrderTicket> {
        if quantity == Decimal::ZERO {
            return Err(anyhow!("Refusing zero-quantity order for {}", symbol));
        }

        let price = self.prices.read().await.get(symbol).copied();
        let mut state = self.state.write().await;
        let now = state.now();
        let order_id = self.next_order_id();

        state.orders.insert(
            order_id,
            PaperOrder {
                order_id,
                symbol: symbol.to_string(),
                quantity,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: Decimal::ZERO,
                status: OrderStatus::Submitted,
                submitted_at: now,
                updated_at: now,
            },
        );

        match (self.fill_model, price) {
            (_, None) => {
                warn!(order_id, %symbol, "No price for paper order - rejecting");
                if let Some(order) = state.orders.get_mut(&order_id) {
                    order.status = OrderStatus::Invalid;
                }
            }
            (FillModel::Immediate, Some(price)) => {
                let slice = self.fill_slice(quantity);
                self.apply_fill(&mut state, order_id, slice, price);
            }
            (FillModel::NextPrice, Some(_)) => {
                debug!(order_id, %symbol, %quantity, "Paper order working");
            }
        }

        let status = state
            .orders
            .get(&order_id)
            .map(|o| o.status)
            .unwrap_or(OrderStatus::None);

        Ok(OrderTicket {
            order_id,
            symbol: symbol.to_string(),
            quantity,
            status,
            submitted_at: now,
        })
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<()> {
        let mut state = self.state.write().await;
        let now = state.now();
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| anyhow!("Unknown paper order {}", order_id))?;

        if order.status.is_live() {
            order.status = OrderStatus::Canceled;
            order.updated_at = now;
            debug!(order_id, symbol = %order.symbol, filled = %order.filled_quantity, "Paper order canceled");
        }

        Ok(())
    }

    async fn order_status(&self, order_id: OrderId) -> Result<OrderUpdate> {
        let state = self.state.read().await;
        state
            .orders
            .get(&order_id)
            .map(PaperOrder::to_update)
            .ok_or_else(|| anyhow!("Unknown paper order {}", order_id))
    }

    async fn holdings(&self) -> Result<HashMap<String, Decimal>> {
        let state = self.state.read().await;
        Ok(state
            .positions
            .values()
            .filter(|p| p.quantity != Decimal::ZERO)
            .map(|p| (p.symbol.clone(), p.quantity))
            .collect())
    }

    async fn cash(&self) -> Result<Decimal> {
        Ok(self.state.read().await.cash)
    }

    async fn last_price(&self, symbol: &str) -> Result<Option<Decimal>> {
        Ok(self.prices.read().await.get(symbol).copied())
    }
}
