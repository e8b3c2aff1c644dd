//! Rolling momentum indicator.

use crate::config::MomentumKind;
use crate::utils::fractional_change;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Close-to-close momentum over a fixed number of bars.
///
/// Holds `lookback + 1` closes so the oldest one is exactly `lookback` bars
/// before the newest.
#[derive(Debug, Clone)]
pub struct Momentum {
    kind: MomentumKind,
    lookback: usize,
    closes: VecDeque<Decimal>,
    last_update: Option<DateTime<Utc>>,
}

impl Momentum {
    pub fn new(kind: MomentumKind, lookback: usize) -> Self {
        Self {
            kind,
            lookback,
            closes: VecDeque::with_capacity(lookback + 1),
            last_update: None,
        }
    }

    /// Push a new close. Bars not newer than the last update are ignored.
    pub fn update(&mut self, timestamp: DateTime<Utc>, close: Decimal) -> bool {
        if self.last_update.is_some_and(|last| timestamp <= last) {
            return false;
        }

        self.closes.push_back(close);
        while self.closes.len() > self.lookback + 1 {
            self.closes.pop_front();
        }
        self.last_update = Some(timestamp);
        true
    }

    pub fn is_ready(&self) -> bool {
        self.closes.len() > self.lookback
    }

    /// Current momentum, `None` until ready (or when the base close is zero in
    /// percent mode).
    pub fn value(&self) -> Option<Decimal> {
        if !self.is_ready() {
            return None;
        }
        let base = *self.closes.front()?;
        let last = *self.closes.back()?;

        match self.kind {
            MomentumKind::Percent => fractional_change(last, base),
            MomentumKind::Difference => Some(last - base),
        }
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }
}
