//! Score providers feeding the rotation.
//!
//! - [`Momentum`]: rolling close-to-close momentum for one symbol
//! - [`ScoreBook`]: per-symbol momentum state with universe add/remove hooks
//! - [`DualThrust`]: range breakout triggers for the trend strategy
//!
//! Selection only sees scores through [`ScoreFeed`], so any indicator source can
//! stand in for the score book.

mod book;
pub mod dual_thrust;
mod momentum;

pub use book::ScoreBook;
pub use dual_thrust::{DualThrust, ThrustSignal, Triggers};
pub use momentum::Momentum;

use crate::strategy::Candidate;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// A score as seen by the current cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreReading {
    /// Refreshed since the previous cycle
    Fresh(Decimal),
    /// Ready, but no new observation since the previous cycle
    Stale(Decimal),
    /// Not enough history yet
    Unavailable,
}

/// Source of per-symbol ranking scores.
pub trait ScoreFeed: Send + Sync {
    /// Symbols in universe order.
    fn symbols(&self) -> Vec<String>;

    fn score(&self, symbol: &str, as_of: DateTime<Utc>) -> ScoreReading;

    fn is_tradable(&self, symbol: &str) -> bool;
}

/// Snapshot every symbol of a feed as selection candidates, in universe order.
pub fn collect_candidates(feed: &dyn ScoreFeed, as_of: DateTime<Utc>) -> Vec<Candidate> {
    feed.symbols()
        .into_iter()
        .map(|symbol| {
            let tradable = feed.is_tradable(&symbol);
            match feed.score(&symbol, as_of) {
                ScoreReading::Fresh(score) => Candidate::new(&symbol, score, tradable, false),
                ScoreReading::Stale(score) => Candidate::new(&symbol, score, tradable, true),
                ScoreReading::Unavailable => {
                    Candidate::new(&symbol, Decimal::ZERO, tradable, true)
                }
            }
        })
        .collect()
}
