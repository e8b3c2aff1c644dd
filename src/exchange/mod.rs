//! Brokerage integration for the rotation engine.
//!
//! ## Interfaces
//! - [`Brokerage`]: order submission, cancellation, status, holdings and cash
//! - [`HistoryProvider`]: historical bars for indicator warm-up
//!
//! ## Paper trading
//! [`PaperBroker`] fills market orders in memory against pushed prices, with
//! optional deferred and partial fills for exercising the cancel-replace path.

pub mod paper;
mod traits;
mod types;

pub use paper::{FillModel, PaperAccount, PaperBroker, PaperPosition};
#[cfg(test)]
pub use traits::MockBrokerage;
pub use traits::{Brokerage, HistoryProvider};
pub use types::*;
