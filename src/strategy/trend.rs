//! Dual thrust trend following on a single symbol.

use super::reconciler::Target;
use crate::config::DualThrustConfig;
use crate::exchange::Bar;
use crate::signal::{DualThrust, ThrustSignal, Triggers};
use crate::utils::round_down_to_lot;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

/// Holds the session's breakout triggers and turns prices into position targets.
#[derive(Debug, Clone)]
pub struct DualThrustStrategy {
    thrust: DualThrust,
    symbol: String,
    /// Fraction of equity held long or short
    target_weight: Decimal,
    lot_size: Decimal,
    triggers: Option<Triggers>,
}

impl DualThrustStrategy {
    pub fn new(config: &DualThrustConfig, lot_size: Decimal) -> Self {
        Self {
            thrust: DualThrust::from_config(config),
            symbol: config.symbol.clone(),
            target_weight: config.target_weight,
            lot_size,
            triggers: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn lookback_days(&self) -> usize {
        self.thrust.lookback_days()
    }

    pub fn triggers(&self) -> Option<&Triggers> {
        self.triggers.as_ref()
    }

    /// Recompute triggers for the session opening at `open`.
    pub fn arm(&mut self, daily: &[Bar], open: Decimal, now: DateTime<Utc>) -> Option<&Triggers> {
        self.triggers = self.thrust.triggers(daily, open, now);

        if let Some(t) = &self.triggers {
            info!(
                symbol = %self.symbol,
                open = %t.open,
                range = %t.range,
                buy = %t.buy,
                sell = %t.sell,
                "Dual thrust triggers armed"
            );
        }
        self.triggers.as_ref()
    }

    /// Target implied by `price`, or `None` when no trade is needed.
    ///
    /// Trades only when the breakout direction differs from the current
    /// position's direction; a position already on the right side is kept.
    pub fn analyze(&self, price: Decimal, equity: Decimal, current: Decimal) -> Option<Target> {
        let triggers = self.triggers.as_ref()?;
        if price <= Decimal::ZERO {
            return None;
        }

        let signal = triggers.signal(price);
        let direction = match signal {
            ThrustSignal::Long => Decimal::ONE,
            ThrustSignal::Short => Decimal::NEGATIVE_ONE,
            ThrustSignal::Hold => return None,
        };

        let already_aligned =
            current != Decimal::ZERO && current.is_sign_positive() == direction.is_sign_positive();
        if already_aligned {
            return None;
        }

        let size = round_down_to_lot(self.target_weight * equity / price, self.lot_size);
        if size <= Decimal::ZERO {
            debug!(symbol = %self.symbol, %equity, %price, "Equity too small for one lot");
            return None;
        }

        debug!(
            symbol = %self.symbol,
            ?signal,
            %price,
            %current,
            target = %(direction * size),
            "Breakout"
        );
        Some(Target::acquire(&self.symbol, direction * size))
    }
}
