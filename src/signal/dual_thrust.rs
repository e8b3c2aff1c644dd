//! Dual thrust range breakout triggers.
//!
//! From the last N daily bars:
//! `range = max(HH - LC, HC - LL)`, `buy = open + k2 * range`,
//! `sell = open - k1 * range`.

use crate::config::DualThrustConfig;
use crate::exchange::Bar;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Direction implied by the latest price relative to the triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThrustSignal {
    Long,
    Short,
    Hold,
}

/// Breakout levels for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Triggers {
    pub open: Decimal,
    pub range: Decimal,
    pub buy: Decimal,
    pub sell: Decimal,
    pub computed_at: DateTime<Utc>,
}

impl Triggers {
    pub fn signal(&self, price: Decimal) -> ThrustSignal {
        if price >= self.buy {
            ThrustSignal::Long
        } else if price < self.sell {
            ThrustSignal::Short
        } else {
            ThrustSignal::Hold
        }
    }
}

#[derive(Debug, Clone)]
pub struct DualThrust {
    k1: Decimal,
    k2: Decimal,
    lookback_days: usize,
}

impl DualThrust {
    pub fn new(k1: Decimal, k2: Decimal, lookback_days: usize) -> Self {
        Self {
            k1,
            k2,
            lookback_days,
        }
    }

    pub fn from_config(config: &DualThrustConfig) -> Self {
        Self::new(config.k1, config.k2, config.lookback_days)
    }

    pub fn lookback_days(&self) -> usize {
        self.lookback_days
    }

    /// Triggers around `open` from the most recent `lookback_days` bars of `daily`.
    /// `None` without any daily history.
    pub fn triggers(
        &self,
        daily: &[Bar],
        open: Decimal,
        computed_at: DateTime<Utc>,
    ) -> Option<Triggers> {
        let start = daily.len().saturating_sub(self.lookback_days);
        let window = &daily[start..];
        let first = window.first()?;

        let (hh, hc, lc, ll) = window.iter().fold(
            (first.high, first.close, first.close, first.low),
            |(hh, hc, lc, ll), bar| {
                (
                    hh.max(bar.high),
                    hc.max(bar.close),
                    lc.min(bar.close),
                    ll.min(bar.low),
                )
            },
        );

        let range = (hh - lc).max(hc - ll);

        Some(Triggers {
            open,
            range,
            buy: open + self.k2 * range,
            sell: open - self.k1 * range,
            computed_at,
        })
    }
}
