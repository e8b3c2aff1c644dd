//! Per-symbol momentum state owned by the engine.

use super::{collect_candidates, Momentum, ScoreFeed, ScoreReading};
use crate::config::MomentumKind;
use crate::exchange::Bar;
use crate::strategy::Candidate;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct SymbolState {
    momentum: Momentum,
    tradable: bool,
    last_close: Option<Decimal>,
}

/// Momentum indicators for the active universe.
///
/// Symbols are created by [`ScoreBook::add_symbol`] and dropped by
/// [`ScoreBook::remove_symbol`]; bars for unknown symbols are ignored.
/// A score is fresh when its latest bar arrived after the last
/// [`ScoreBook::mark_evaluated`] and no later than the cycle time.
#[derive(Debug, Clone)]
pub struct ScoreBook {
    kind: MomentumKind,
    lookback: usize,
    /// Universe order, used as the selection tie-breaker
    order: Vec<String>,
    states: HashMap<String, SymbolState>,
    last_evaluated: Option<DateTime<Utc>>,
}

impl ScoreBook {
    pub fn new(kind: MomentumKind, lookback: usize) -> Self {
        Self {
            kind,
            lookback,
            order: Vec::new(),
            states: HashMap::new(),
            last_evaluated: None,
        }
    }

    /// Book with every symbol of `universe` added.
    pub fn with_universe(kind: MomentumKind, lookback: usize, universe: &[String]) -> Self {
        let mut book = Self::new(kind, lookback);
        for symbol in universe {
            book.add_symbol(symbol);
        }
        book
    }

    /// Start tracking a symbol. Adding a tracked symbol is a no-op.
    pub fn add_symbol(&mut self, symbol: &str) {
        if self.states.contains_key(symbol) {
            return;
        }
        self.order.push(symbol.to_string());
        self.states.insert(
            symbol.to_string(),
            SymbolState {
                momentum: Momentum::new(self.kind, self.lookback),
                tradable: true,
                last_close: None,
            },
        );
        debug!(%symbol, lookback = self.lookback, "Symbol added to score book");
    }

    /// Stop tracking a symbol and discard its history.
    pub fn remove_symbol(&mut self, symbol: &str) -> bool {
        if self.states.remove(symbol).is_none() {
            return false;
        }
        self.order.retain(|s| s != symbol);
        debug!(%symbol, "Symbol removed from score book");
        true
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.states.contains_key(symbol)
    }

    /// Mark a symbol as (un)tradable, e.g. halted or delisted.
    pub fn set_tradable(&mut self, symbol: &str, tradable: bool) {
        if let Some(state) = self.states.get_mut(symbol) {
            state.tradable = tradable;
        }
    }

    /// Feed one bar. Returns whether the indicator advanced.
    pub fn update(&mut self, bar: &Bar) -> bool {
        let Some(state) = self.states.get_mut(&bar.symbol) else {
            return false;
        };
        let advanced = state.momentum.update(bar.timestamp, bar.close);
        if advanced {
            state.last_close = Some(bar.close);
        }
        advanced
    }

    /// Replay historical bars, oldest first.
    pub fn warm_up(&mut self, bars: &[Bar]) -> usize {
        let mut sorted: Vec<&Bar> = bars.iter().collect();
        sorted.sort_by_key(|b| b.timestamp);

        let applied = sorted.into_iter().filter(|bar| self.update(bar)).count();
        debug!(
            bars = bars.len(),
            applied,
            ready = self.ready_count(),
            "Score book warmed up"
        );
        applied
    }

    /// True until at least one symbol has a full lookback window.
    pub fn is_warming_up(&self) -> bool {
        self.ready_count() == 0
    }

    pub fn ready_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| s.momentum.is_ready())
            .count()
    }

    /// Record that a cycle consumed the scores as of `as_of`.
    pub fn mark_evaluated(&mut self, as_of: DateTime<Utc>) {
        self.last_evaluated = Some(as_of);
    }

    pub fn last_close(&self, symbol: &str) -> Option<Decimal> {
        self.states.get(symbol).and_then(|s| s.last_close)
    }

    pub fn candidates(&self, as_of: DateTime<Utc>) -> Vec<Candidate> {
        collect_candidates(self, as_of)
    }
}

impl ScoreFeed for ScoreBook {
    fn symbols(&self) -> Vec<String> {
        self.order.clone()
    }

    fn score(&self, symbol: &str, as_of: DateTime<Utc>) -> ScoreReading {
        let Some(state) = self.states.get(symbol) else {
            return ScoreReading::Unavailable;
        };
        let Some(value) = state.momentum.value() else {
            return ScoreReading::Unavailable;
        };

        let refreshed = match (state.momentum.last_update(), self.last_evaluated) {
            (Some(updated), Some(evaluated)) => updated > evaluated && updated <= as_of,
            (Some(updated), None) => updated <= as_of,
            (None, _) => false,
        };

        if refreshed {
            ScoreReading::Fresh(value)
        } else {
            ScoreReading::Stale(value)
        }
    }

    fn is_tradable(&self, symbol: &str) -> bool {
        self.states.get(symbol).is_some_and(|s| s.tradable)
    }
}
