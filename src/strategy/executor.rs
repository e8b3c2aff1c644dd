//! Target execution with cancel-and-replace.

use super::reconciler::{Target, TargetKind};
use super::tracker::{OrderState, OrderTracker, TrackerError};
use crate::config::ExecutionConfig;
use crate::exchange::{Brokerage, OrderId, OrderStatus};
use crate::risk::CycleWarning;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("order {order_id} for {symbol} not terminal after {timeout:?}")]
    CancelTimeout {
        symbol: String,
        order_id: OrderId,
        timeout: Duration,
    },

    #[error("brokerage call failed for {symbol}: {reason}")]
    Brokerage { symbol: String, reason: String },

    #[error("order for {symbol} rejected with status {status}")]
    Rejected { symbol: String, status: OrderStatus },

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

impl ExecutionError {
    fn brokerage(symbol: &str, err: anyhow::Error) -> Self {
        ExecutionError::Brokerage {
            symbol: symbol.to_string(),
            reason: format!("{:#}", err),
        }
    }

    /// Cycle warning reported for this failure.
    pub fn to_warning(&self) -> CycleWarning {
        match self {
            ExecutionError::CancelTimeout {
                symbol,
                order_id,
                timeout,
            } => CycleWarning::OrderTimeout {
                symbol: symbol.clone(),
                order_id: *order_id,
                timeout_ms: timeout.as_millis() as u64,
            },
            ExecutionError::Brokerage { symbol, .. } | ExecutionError::Rejected { symbol, .. } => {
                CycleWarning::OrderFailed {
                    symbol: symbol.clone(),
                    reason: self.to_string(),
                }
            }
            ExecutionError::Tracker(TrackerError::DuplicateLiveOrder { symbol, .. }) => {
                CycleWarning::OrderFailed {
                    symbol: symbol.clone(),
                    reason: self.to_string(),
                }
            }
        }
    }
}

/// Result of executing one target.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub symbol: String,
    pub kind: TargetKind,
    pub target_quantity: Decimal,
    /// Signed quantity submitted; zero when already on target
    pub order_quantity: Decimal,
    pub order_id: Option<OrderId>,
    pub status: Option<OrderStatus>,
    pub success: bool,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn failed(target: &Target, err: &ExecutionError) -> Self {
        Self {
            symbol: target.symbol.clone(),
            kind: target.kind,
            target_quantity: target.quantity,
            order_quantity: Decimal::ZERO,
            order_id: None,
            status: None,
            success: false,
            error: Some(err.to_string()),
        }
    }
}

/// Results and warnings of one execution pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub results: Vec<ExecutionResult>,
    pub warnings: Vec<CycleWarning>,
}

impl ExecutionReport {
    pub fn submitted(&self) -> usize {
        self.results.iter().filter(|r| r.order_id.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

/// Drives targets through the brokerage, one live order per symbol.
#[derive(Debug, Clone)]
pub struct OrderExecutor {
    cancel_timeout: Duration,
    poll_interval: Duration,
    max_status_failures: u32,
}

impl OrderExecutor {
    pub fn new(cancel_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            cancel_timeout,
            poll_interval,
            max_status_failures: 3,
        }
    }

    /// Drop an order from tracking after this many consecutive failed
    /// status or cancel calls.
    pub fn with_max_status_failures(mut self, max_status_failures: u32) -> Self {
        self.max_status_failures = max_status_failures.max(1);
        self
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.cancel_timeout(), config.poll_interval())
            .with_max_status_failures(config.max_status_failures)
    }

    /// Execute flatten targets, then acquire targets.
    ///
    /// A failing target is reported and skipped; it is not retried this pass.
    pub async fn execute<B>(
        &self,
        broker: &B,
        tracker: &mut OrderTracker,
        targets: &[Target],
    ) -> ExecutionReport
    where
        B: Brokerage + ?Sized,
    {
        let mut report = ExecutionReport::default();

        let ordered = targets
            .iter()
            .filter(|t| t.kind == TargetKind::Flatten)
            .chain(targets.iter().filter(|t| t.kind == TargetKind::Acquire));

        for target in ordered {
            match self.execute_target(broker, tracker, target).await {
                Ok(result) => report.results.push(result),
                Err(err) => {
                    let warning = err.to_warning();
                    warning.log();
                    report.results.push(ExecutionResult::failed(target, &err));
                    report.warnings.push(warning);
                }
            }
        }

        report
    }

    /// Bring one symbol to its target quantity.
    pub async fn execute_target<B>(
        &self,
        broker: &B,
        tracker: &mut OrderTracker,
        target: &Target,
    ) -> Result<ExecutionResult, ExecutionError>
    where
        B: Brokerage + ?Sized,
    {
        let symbol = target.symbol.as_str();

        if tracker.live_order(symbol).is_some() {
            self.cancel_and_wait(broker, tracker, symbol).await?;
        }

        // Read after any cancel so fills that raced the cancel are counted
        let holdings = broker
            .holdings()
            .await
            .map_err(|e| ExecutionError::brokerage(symbol, e))?;
        let current = holdings.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let delta = target.quantity - current;

        if delta == Decimal::ZERO {
            debug!(%symbol, quantity = %current, "Already on target");
            return Ok(ExecutionResult {
                symbol: symbol.to_string(),
                kind: target.kind,
                target_quantity: target.quantity,
                order_quantity: Decimal::ZERO,
                order_id: None,
                status: None,
                success: true,
                error: None,
            });
        }

        let ticket = broker
            .submit_order(symbol, delta)
            .await
            .map_err(|e| ExecutionError::brokerage(symbol, e))?;

        tracker.record_submission(&ticket)?;

        if ticket.status == OrderStatus::Invalid {
            return Err(ExecutionError::Rejected {
                symbol: symbol.to_string(),
                status: ticket.status,
            });
        }

        info!(
            %symbol,
            kind = ?target.kind,
            target = %target.quantity,
            current = %current,
            order_quantity = %delta,
            order_id = ticket.order_id,
            status = %ticket.status,
            "Order submitted"
        );

        Ok(ExecutionResult {
            symbol: symbol.to_string(),
            kind: target.kind,
            target_quantity: target.quantity,
            order_quantity: delta,
            order_id: Some(ticket.order_id),
            status: Some(ticket.status),
            success: true,
            error: None,
        })
    }

    /// Cancel the symbol's live order and wait, bounded, for a terminal status.
    pub async fn cancel_and_wait<B>(
        &self,
        broker: &B,
        tracker: &mut OrderTracker,
        symbol: &str,
    ) -> Result<(), ExecutionError>
    where
        B: Brokerage + ?Sized,
    {
        let Some(order_id) = tracker.live_order(symbol).map(|r| r.order_id) else {
            return Ok(());
        };

        info!(%symbol, order_id, "Cancelling live order before replacement");
        if let Err(e) = broker.cancel_order(order_id).await {
            self.note_failure(tracker, symbol, order_id);
            return Err(ExecutionError::brokerage(symbol, e));
        }
        tracker.mark_cancel_pending(symbol);

        let poll_interval = self.poll_interval;
        let wait = async {
            loop {
                let update = match broker.order_status(order_id).await {
                    Ok(update) => update,
                    Err(e) => return Err(ExecutionError::brokerage(symbol, e)),
                };

                match tracker.apply_update(&update) {
                    Some(OrderState::Terminal(status)) => {
                        debug!(%symbol, order_id, %status, filled = %update.filled_quantity, "Cancel settled");
                        return Ok(());
                    }
                    None if update.status.is_terminal() => return Ok(()),
                    _ => tokio::time::sleep(poll_interval).await,
                }
            }
        };

        let outcome = tokio::time::timeout(self.cancel_timeout, wait).await;
        match outcome {
            Ok(Err(err @ ExecutionError::Brokerage { .. })) => {
                self.note_failure(tracker, symbol, order_id);
                Err(err)
            }
            Ok(result) => result,
            Err(_) => {
                warn!(
                    %symbol,
                    order_id,
                    timeout_ms = self.cancel_timeout.as_millis() as u64,
                    "Cancel did not settle in time - skipping symbol"
                );
                Err(ExecutionError::CancelTimeout {
                    symbol: symbol.to_string(),
                    order_id,
                    timeout: self.cancel_timeout,
                })
            }
        }
    }

    /// Cancel live orders on every symbol outside `keep`, each with the bounded wait.
    ///
    /// Returns a warning per symbol whose order could not be settled.
    pub async fn cancel_outside<B>(
        &self,
        broker: &B,
        tracker: &mut OrderTracker,
        keep: &[String],
    ) -> Vec<CycleWarning>
    where
        B: Brokerage + ?Sized,
    {
        let mut warnings = Vec::new();

        for symbol in tracker.live_symbols() {
            if keep.contains(&symbol) {
                continue;
            }
            if let Err(err) = self.cancel_and_wait(broker, tracker, &symbol).await {
                let warning = err.to_warning();
                warning.log();
                warnings.push(warning);
            }
        }

        warnings
    }

    /// Poll every live order once and apply its status.
    pub async fn refresh<B>(&self, broker: &B, tracker: &mut OrderTracker)
    where
        B: Brokerage + ?Sized,
    {
        for symbol in tracker.live_symbols() {
            let Some(order_id) = tracker.live_order(&symbol).map(|r| r.order_id) else {
                continue;
            };
            match broker.order_status(order_id).await {
                Ok(update) => {
                    tracker.apply_update(&update);
                }
                Err(e) => {
                    error!(%symbol, order_id, error = %e, "Failed to refresh order status");
                    self.note_failure(tracker, &symbol, order_id);
                }
            }
        }
    }

    /// Count a failed brokerage call; past the limit the order is assumed gone
    /// and the symbol is freed for new orders.
    fn note_failure(&self, tracker: &mut OrderTracker, symbol: &str, order_id: OrderId) {
        let failures = tracker.record_failure(symbol);
        if failures >= self.max_status_failures {
            warn!(
                %symbol,
                order_id,
                failures,
                "Order unreachable at brokerage - no longer tracked"
            );
            tracker.forget(symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockBrokerage, OrderTicket, OrderUpdate};
    use chrono::Utc;
    use mockall::Sequence;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn executor() -> OrderExecutor {
        OrderExecutor::new(Duration::from_millis(100), Duration::from_millis(5))
    }

    fn ticket(order_id: OrderId, symbol: &str, quantity: Decimal, status: OrderStatus) -> OrderTicket {
        OrderTicket {
            order_id,
            symbol: symbol.to_string(),
            quantity,
            status,
            submitted_at: Utc::now(),
        }
    }

    fn status(order_id: OrderId, symbol: &str, status: OrderStatus, filled: Decimal) -> OrderUpdate {
        OrderUpdate {
            order_id,
            symbol: symbol.to_string(),
            status,
            filled_quantity: filled,
            avg_fill_price: dec!(50),
            timestamp: Utc::now(),
        }
    }

    fn holdings(entries: &[(&str, Decimal)]) -> HashMap<String, Decimal> {
        entries.iter().map(|(s, q)| (s.to_string(), *q)).collect()
    }

    /// Tracker holding a partially filled buy of 10 X (4 filled).
    fn tracker_with_partial() -> OrderTracker {
        let mut tracker = OrderTracker::new();
        tracker
            .record_submission(&ticket(1, "X", dec!(10), OrderStatus::Submitted))
            .unwrap();
        tracker.apply_update(&status(1, "X", OrderStatus::PartiallyFilled, dec!(4)));
        tracker
    }

    // =========================================================================
    // Cancel-replace
    // =========================================================================

    #[tokio::test]
    async fn test_cancel_precedes_replacement() {
        let mut broker = MockBrokerage::new();
        let mut seq = Sequence::new();

        broker
            .expect_cancel_order()
            .withf(|order_id| *order_id == 1)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        broker
            .expect_order_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| Ok(status(id, "X", OrderStatus::Canceled, dec!(4))));
        broker
            .expect_holdings()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(holdings(&[("X", dec!(14))])));
        broker
            .expect_submit_order()
            .withf(|symbol, quantity| symbol == "X" && *quantity == dec!(-14))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|symbol, quantity| Ok(ticket(2, symbol, quantity, OrderStatus::Filled)));

        let mut tracker = tracker_with_partial();
        let report = executor()
            .execute(&broker, &mut tracker, &[Target::flatten("X")])
            .await;

        assert!(report.warnings.is_empty());
        assert_eq!(report.results[0].order_quantity, dec!(-14));
        assert_eq!(report.results[0].order_id, Some(2));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_timeout_skips_symbol() {
        let mut broker = MockBrokerage::new();
        broker.expect_cancel_order().returning(|_| Ok(()));
        broker
            .expect_order_status()
            .returning(|id| Ok(status(id, "X", OrderStatus::CancelPending, dec!(4))));
        broker.expect_holdings().never();
        broker.expect_submit_order().never();

        let mut tracker = tracker_with_partial();
        let report = executor()
            .execute(&broker, &mut tracker, &[Target::flatten("X")])
            .await;

        assert!(!report.results[0].success);
        assert!(matches!(
            report.warnings[0],
            CycleWarning::OrderTimeout { order_id: 1, timeout_ms: 100, .. }
        ));
        // Still live: the next cycle retries the cancel
        assert!(tracker.live_order("X").is_some());
    }

    // =========================================================================
    // Submission
    // =========================================================================

    #[tokio::test]
    async fn test_flatten_runs_before_acquire() {
        let mut broker = MockBrokerage::new();
        let mut seq = Sequence::new();

        broker
            .expect_holdings()
            .returning(|| Ok(holdings(&[("OLD", dec!(3))])));
        broker
            .expect_submit_order()
            .withf(|symbol, _| symbol == "OLD")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|s, q| Ok(ticket(1, s, q, OrderStatus::Filled)));
        broker
            .expect_submit_order()
            .withf(|symbol, _| symbol == "NEW")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|s, q| Ok(ticket(2, s, q, OrderStatus::Filled)));

        let mut tracker = OrderTracker::new();
        let targets = vec![Target::acquire("NEW", dec!(5)), Target::flatten("OLD")];
        let report = executor().execute(&broker, &mut tracker, &targets).await;

        assert_eq!(report.submitted(), 2);
        assert_eq!(report.results[0].symbol, "OLD");
        assert_eq!(report.results[0].order_quantity, dec!(-3));
        assert_eq!(report.results[1].order_quantity, dec!(5));
    }

    #[tokio::test]
    async fn test_on_target_places_no_order() {
        let mut broker = MockBrokerage::new();
        broker
            .expect_holdings()
            .returning(|| Ok(holdings(&[("X", dec!(5))])));
        broker.expect_submit_order().never();

        let mut tracker = OrderTracker::new();
        let report = executor()
            .execute(&broker, &mut tracker, &[Target::acquire("X", dec!(5))])
            .await;

        assert!(report.results[0].success);
        assert_eq!(report.submitted(), 0);
    }

    #[tokio::test]
    async fn test_rejection_and_error_reported_without_retry() {
        let mut broker = MockBrokerage::new();
        broker.expect_holdings().returning(|| Ok(HashMap::new()));
        broker
            .expect_submit_order()
            .withf(|symbol, _| symbol == "A")
            .times(1)
            .returning(|s, q| Ok(ticket(1, s, q, OrderStatus::Invalid)));
        broker
            .expect_submit_order()
            .withf(|symbol, _| symbol == "B")
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("venue closed")));

        let mut tracker = OrderTracker::new();
        let targets = vec![Target::acquire("A", dec!(1)), Target::acquire("B", dec!(1))];
        let report = executor().execute(&broker, &mut tracker, &targets).await;

        assert_eq!(report.failed(), 2);
        assert_eq!(report.warnings.len(), 2);
        assert!(report
            .warnings
            .iter()
            .all(|w| matches!(w, CycleWarning::OrderFailed { .. })));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_applies_fills() {
        let mut broker = MockBrokerage::new();
        broker
            .expect_order_status()
            .returning(|id| Ok(status(id, "X", OrderStatus::Filled, dec!(10))));

        let mut tracker = tracker_with_partial();
        executor().refresh(&broker, &mut tracker).await;

        assert!(tracker.is_empty());
    }

    // =========================================================================
    // Unreachable orders
    // =========================================================================

    #[tokio::test]
    async fn test_refresh_forgets_order_after_repeated_failures() {
        let mut broker = MockBrokerage::new();
        broker
            .expect_order_status()
            .times(3)
            .returning(|id| Err(anyhow::anyhow!("Unknown paper order {}", id)));

        let mut tracker = tracker_with_partial();
        let executor = executor().with_max_status_failures(3);

        executor.refresh(&broker, &mut tracker).await;
        executor.refresh(&broker, &mut tracker).await;
        assert_eq!(tracker.live_order("X").unwrap().failures, 2);

        executor.refresh(&broker, &mut tracker).await;
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_failing_cancel_frees_symbol_after_limit() {
        let mut broker = MockBrokerage::new();
        broker
            .expect_cancel_order()
            .times(2)
            .returning(|id| Err(anyhow::anyhow!("Unknown paper order {}", id)));
        broker.expect_order_status().never();
        broker
            .expect_holdings()
            .times(1)
            .returning(|| Ok(holdings(&[("X", dec!(4))])));
        broker
            .expect_submit_order()
            .withf(|symbol, quantity| symbol == "X" && *quantity == dec!(-4))
            .times(1)
            .returning(|s, q| Ok(ticket(2, s, q, OrderStatus::Filled)));

        let mut tracker = tracker_with_partial();
        let executor = executor().with_max_status_failures(2);
        let targets = [Target::flatten("X")];

        let first = executor.execute(&broker, &mut tracker, &targets).await;
        assert!(matches!(first.warnings[0], CycleWarning::OrderFailed { .. }));
        assert!(tracker.live_order("X").is_some());

        let second = executor.execute(&broker, &mut tracker, &targets).await;
        assert_eq!(second.failed(), 1);
        assert!(tracker.is_empty());

        // Nothing tracked any more: the target goes straight to submission
        let third = executor.execute(&broker, &mut tracker, &targets).await;
        assert!(third.warnings.is_empty());
        assert_eq!(third.results[0].order_id, Some(2));
    }

    #[tokio::test]
    async fn test_cancel_outside_keeps_selected_orders() {
        let mut broker = MockBrokerage::new();
        broker
            .expect_cancel_order()
            .withf(|order_id| *order_id == 1)
            .times(1)
            .returning(|_| Ok(()));
        broker
            .expect_order_status()
            .withf(|order_id| *order_id == 1)
            .returning(|id| Ok(status(id, "X", OrderStatus::Canceled, dec!(4))));

        let mut tracker = tracker_with_partial();
        tracker
            .record_submission(&ticket(2, "Y", dec!(5), OrderStatus::Submitted))
            .unwrap();

        let warnings = executor().cancel_outside(&broker, &mut tracker, &["Y".to_string()]).await;

        assert!(warnings.is_empty());
        assert_eq!(tracker.live_symbols(), vec!["Y".to_string()]);
    }
}
