//! Cycle warnings and operator alerts.
//!
//! Every problem a rebalance cycle can hit is a [`CycleWarning`]. Warnings are
//! handled inside the cycle and carried out in its report; the [`AlertMonitor`]
//! turns the ones that need an operator into structured [`RiskAlert`]s:
//! - every candidate excluded for longer than the configured streak (once per breach)
//! - repeated order failures on one symbol

use crate::config::{AlertConfig, DegeneratePolicy};
use crate::exchange::OrderId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Non-fatal conditions raised while running a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "type")]
pub enum CycleWarning {
    #[error("score for {symbol} was not refreshed this cycle")]
    DataStaleness { symbol: String },

    #[error("only {qualifying} of {requested} candidates qualify, applying {policy} policy")]
    InsufficientCandidates {
        qualifying: usize,
        requested: usize,
        policy: DegeneratePolicy,
    },

    #[error("acquire target for {symbol} dropped: {reason}")]
    UnfundedTarget { symbol: String, reason: String },

    #[error("order {order_id} for {symbol} not terminal after {timeout_ms}ms")]
    OrderTimeout {
        symbol: String,
        order_id: OrderId,
        timeout_ms: u64,
    },

    #[error("all {candidates} candidates excluded for {cycles} consecutive cycles")]
    AllCandidatesExcluded { candidates: usize, cycles: u32 },

    #[error("order for {symbol} failed: {reason}")]
    OrderFailed { symbol: String, reason: String },

    #[error("brokerage unavailable: {reason}")]
    BrokerageUnavailable { reason: String },
}

impl CycleWarning {
    pub fn severity(&self) -> AlertSeverity {
        match self {
            CycleWarning::DataStaleness { .. } => AlertSeverity::Info,
            CycleWarning::InsufficientCandidates { .. } | CycleWarning::UnfundedTarget { .. } => {
                AlertSeverity::Warning
            }
            CycleWarning::OrderTimeout { .. }
            | CycleWarning::OrderFailed { .. }
            | CycleWarning::BrokerageUnavailable { .. } => AlertSeverity::Error,
            CycleWarning::AllCandidatesExcluded { .. } => AlertSeverity::Critical,
        }
    }

    /// Symbol the warning concerns, if any.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            CycleWarning::DataStaleness { symbol }
            | CycleWarning::UnfundedTarget { symbol, .. }
            | CycleWarning::OrderTimeout { symbol, .. }
            | CycleWarning::OrderFailed { symbol, .. } => Some(symbol),
            _ => None,
        }
    }

    /// Log the warning at a level matching its severity.
    pub fn log(&self) {
        match self.severity() {
            AlertSeverity::Info => debug!(warning = %self, "Cycle warning"),
            AlertSeverity::Warning => warn!(warning = %self, "Cycle warning"),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(warning = %self, "Cycle warning")
            }
        }
    }
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// An operator-facing alert.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub warning: CycleWarning,
    pub message: String,
    pub suggested_action: String,
}

impl RiskAlert {
    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Error => error!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Critical => error!(target: "risk_alert", "RISK_ALERT: {}", json),
        }
    }
}

/// Outcome of recording a cycle in which every candidate was excluded.
#[derive(Debug, Clone)]
pub enum ExclusionStatus {
    /// Streak still within the threshold: keep the previous selection.
    Tolerated { streak: u32 },
    /// Streak beyond the threshold: flatten. `alert` is set only on the first
    /// cycle of the breach.
    Breached {
        streak: u32,
        alert: Option<RiskAlert>,
    },
}

/// Tracks warning streaks across cycles and raises alerts.
pub struct AlertMonitor {
    config: AlertConfig,
    /// Consecutive cycles with every candidate excluded
    exclusion_streak: u32,
    /// Whether the current breach has already been alerted
    breach_alerted: bool,
    /// Consecutive failure count per symbol
    failure_counts: HashMap<String, u32>,
    active_alerts: Vec<RiskAlert>,
    alert_seq: u64,
}

impl AlertMonitor {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            exclusion_streak: 0,
            breach_alerted: false,
            failure_counts: HashMap::new(),
            active_alerts: Vec::new(),
            alert_seq: 0,
        }
    }

    /// Record a cycle where no candidate could be evaluated.
    pub fn record_all_excluded(&mut self, candidates: usize, now: DateTime<Utc>) -> ExclusionStatus {
        self.exclusion_streak += 1;
        let streak = self.exclusion_streak;

        debug!(streak, threshold = self.config.exclusion_threshold, "All candidates excluded");

        if streak <= self.config.exclusion_threshold {
            return ExclusionStatus::Tolerated { streak };
        }

        if self.breach_alerted {
            return ExclusionStatus::Breached { streak, alert: None };
        }

        self.breach_alerted = true;
        let alert = self.raise(
            now,
            CycleWarning::AllCandidatesExcluded {
                candidates,
                cycles: streak,
            },
            "Check the market data feed; all holdings are being flattened".to_string(),
        );

        ExclusionStatus::Breached {
            streak,
            alert: Some(alert),
        }
    }

    /// At least one candidate was evaluated: the exclusion streak ends.
    pub fn reset_exclusion(&mut self) {
        if self.exclusion_streak > 0 {
            info!(
                previous_streak = self.exclusion_streak,
                "Candidates available again - exclusion streak reset"
            );
        }
        self.exclusion_streak = 0;
        self.breach_alerted = false;
    }

    /// Record an order submission failure or timeout.
    pub fn record_order_failure(
        &mut self,
        warning: &CycleWarning,
        now: DateTime<Utc>,
    ) -> Option<RiskAlert> {
        let symbol = warning.symbol()?.to_string();
        let count = {
            let count = self.failure_counts.entry(symbol.clone()).or_insert(0);
            *count += 1;
            *count
        };

        debug!(%symbol, consecutive_failures = count, "Recorded order failure");

        if count == self.config.max_consecutive_failures {
            let alert = self.raise(
                now,
                warning.clone(),
                format!("Investigate order routing for {} before the next cycle", symbol),
            );
            return Some(alert);
        }

        None
    }

    /// Record a successful order (resets failure counter).
    pub fn record_order_success(&mut self, symbol: &str) {
        if let Some(count) = self.failure_counts.get_mut(symbol) {
            if *count > 0 {
                debug!(%symbol, previous_failures = *count, "Order success - resetting failure counter");
            }
            *count = 0;
        }
    }

    pub fn exclusion_streak(&self) -> u32 {
        self.exclusion_streak
    }

    pub fn failure_count(&self, symbol: &str) -> u32 {
        self.failure_counts.get(symbol).copied().unwrap_or(0)
    }

    pub fn active_alerts(&self) -> &[RiskAlert] {
        &self.active_alerts
    }

    fn raise(
        &mut self,
        now: DateTime<Utc>,
        warning: CycleWarning,
        suggested_action: String,
    ) -> RiskAlert {
        self.alert_seq += 1;
        let severity = match warning.severity() {
            AlertSeverity::Critical => AlertSeverity::Critical,
            _ => AlertSeverity::Error,
        };
        let alert = RiskAlert {
            alert_id: format!("rotation-{}-{}", now.timestamp(), self.alert_seq),
            timestamp: now,
            severity,
            message: warning.to_string(),
            warning,
            suggested_action,
        };

        alert.emit();
        self.active_alerts.push(alert.clone());
        while self.active_alerts.len() > 100 {
            self.active_alerts.remove(0);
        }

        alert
    }
}
