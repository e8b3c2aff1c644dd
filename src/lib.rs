//! # Momentum Rotator
//!
//! A scheduled rebalancing engine: rank a universe by momentum, hold the top K,
//! and reconcile holdings through cancel-and-replace orders.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Brokerage and history interfaces, plus the paper broker
//! - `signal`: Momentum score book and the dual thrust breakout indicator
//! - `strategy`: Selection, holdings reconciliation, order tracking and the engine
//! - `risk`: Cycle warnings and alert bookkeeping
//! - `schedule`: Date/time rules and the scheduled cycle driver
//! - `backtest`: Historical replay and performance metrics
//! - `utils`: Shared utilities and decimal arithmetic

pub mod backtest;
pub mod config;
pub mod exchange;
pub mod risk;
pub mod schedule;
pub mod signal;
pub mod strategy;
pub mod utils;

pub use config::Config;
