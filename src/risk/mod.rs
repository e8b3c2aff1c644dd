//! Cycle warnings and operator alerting.
//!
//! - [`CycleWarning`]: every non-fatal condition a rebalance cycle reports
//! - [`AlertMonitor`]: exclusion streaks and repeated order failures
//! - [`RiskAlert`]: structured alerts emitted under the `risk_alert` log target

mod alerts;

pub use alerts::{AlertMonitor, AlertSeverity, CycleWarning, ExclusionStatus, RiskAlert};
