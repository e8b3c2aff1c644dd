//! End-to-end rebalance cycles against the paper broker.

use chrono::{DateTime, Duration, TimeZone, Utc};
use momentum_rotator::config::{Config, DegeneratePolicy};
use momentum_rotator::exchange::{Bar, Brokerage, FillModel, OrderStatus, PaperBroker};
use momentum_rotator::risk::{AlertSeverity, CycleWarning};
use momentum_rotator::strategy::{CycleStatus, RotationEngine, SelectionAction, Target, TargetKind};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_test::assert_ok;

// =========================================================================
// Test Helpers
// =========================================================================

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 14, 30, 0).unwrap() + Duration::days(n)
}

fn config(universe: &[&str], top_k: usize, policy: DegeneratePolicy) -> Config {
    let mut config = Config::default();
    config.strategy.universe = universe.iter().map(|s| s.to_string()).collect();
    config.selection.top_k = top_k;
    config.selection.lookback = 1;
    config.selection.degenerate_policy = policy;
    config.sizing.fee_buffer_per_order = dec!(1);
    config.execution.cancel_timeout_ms = 500;
    config.execution.poll_interval_ms = 10;
    config.alerts.exclusion_threshold = 2;
    config
}

fn zero_fee_broker(cash: Decimal) -> Arc<PaperBroker> {
    Arc::new(PaperBroker::new(cash).with_fee_rate(Decimal::ZERO))
}

async fn feed(engine: &RotationEngine<PaperBroker>, at: DateTime<Utc>, closes: &[(&str, Decimal)]) {
    let prices: HashMap<String, Decimal> = closes.iter().map(|(s, p)| (s.to_string(), *p)).collect();
    engine.broker().set_clock(at).await;
    engine.broker().set_prices(prices).await;
    for (symbol, close) in closes {
        engine.on_bar(&Bar::flat(symbol, at, *close)).await;
    }
}

// =========================================================================
// Scenario A: top-K by score
// =========================================================================

#[tokio::test]
async fn scenario_a_selects_top_two_positive_scores() {
    let broker = zero_fee_broker(dec!(10000));
    let engine = RotationEngine::new(
        config(&["X", "Y", "Z"], 2, DegeneratePolicy::Abort),
        broker.clone(),
    );

    feed(&engine, day(0), &[("X", dec!(100)), ("Y", dec!(100)), ("Z", dec!(100))]).await;
    // X +5%, Y +3%, Z -1%
    feed(&engine, day(1), &[("X", dec!(105)), ("Y", dec!(103)), ("Z", dec!(99))]).await;

    let report = engine.run_cycle(day(1)).await;

    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.action, Some(SelectionAction::Rebalance));
    assert_eq!(report.selection.symbols(), vec!["X", "Y"]);
    assert_eq!(report.targets.len(), 2);
    assert!(report.targets.iter().all(|t| t.kind == TargetKind::Acquire));

    let holdings = assert_ok!(broker.holdings().await);
    assert!(holdings["X"] > Decimal::ZERO);
    assert!(holdings["Y"] > Decimal::ZERO);
    assert!(!holdings.contains_key("Z"));
}

// =========================================================================
// Scenario B: degenerate selection policies
// =========================================================================

#[tokio::test]
async fn scenario_b_shrink_keeps_single_qualifier() {
    let broker = zero_fee_broker(dec!(10000));
    let engine = RotationEngine::new(config(&["X"], 2, DegeneratePolicy::Shrink), broker.clone());

    feed(&engine, day(0), &[("X", dec!(100))]).await;
    feed(&engine, day(1), &[("X", dec!(105))]).await;

    let report = engine.run_cycle(day(1)).await;

    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.selection.symbols(), vec!["X"]);
    assert!(report
        .warnings
        .iter()
        .any(|w| matches!(w, CycleWarning::InsufficientCandidates { qualifying: 1, requested: 2, .. })));
    assert!(assert_ok!(broker.holdings().await)["X"] > Decimal::ZERO);
}

#[tokio::test]
async fn scenario_b_abort_retains_previous_selection() {
    let broker = zero_fee_broker(dec!(10000));
    let engine = RotationEngine::new(config(&["X", "Y"], 2, DegeneratePolicy::Abort), broker.clone());

    feed(&engine, day(0), &[("X", dec!(100)), ("Y", dec!(100))]).await;
    feed(&engine, day(1), &[("X", dec!(105)), ("Y", dec!(103))]).await;
    let first = engine.run_cycle(day(1)).await;
    assert_eq!(first.selection.symbols(), vec!["X", "Y"]);

    let holdings_before = assert_ok!(broker.holdings().await);
    let orders_before = broker.get_state().await.orders.len();

    // Only X still qualifies
    feed(&engine, day(2), &[("X", dec!(110)), ("Y", dec!(100))]).await;
    let second = engine.run_cycle(day(2)).await;

    assert_eq!(second.status, CycleStatus::Retained);
    assert_eq!(second.action, Some(SelectionAction::Retain));
    assert_eq!(second.selection.symbols(), vec!["X", "Y"]);
    assert!(second.targets.is_empty());
    assert_eq!(broker.get_state().await.orders.len(), orders_before);
    assert_eq!(assert_ok!(broker.holdings().await), holdings_before);
    assert_eq!(engine.previous_selection().await.symbols(), vec!["X", "Y"]);
}

// =========================================================================
// Scenario C: flatten what left the selection
// =========================================================================

#[tokio::test]
async fn scenario_c_flattens_unselected_and_acquires_new() {
    let broker = zero_fee_broker(dec!(10000));
    let engine = RotationEngine::new(config(&["X", "Y"], 1, DegeneratePolicy::Abort), broker.clone());

    feed(&engine, day(0), &[("X", dec!(100)), ("Y", dec!(100))]).await;
    let ticket = assert_ok!(broker.submit_order("X", dec!(10)).await);
    assert_eq!(ticket.status, OrderStatus::Filled);

    feed(&engine, day(1), &[("X", dec!(95)), ("Y", dec!(110))]).await;
    let report = engine.run_cycle(day(1)).await;

    assert_eq!(report.selection.symbols(), vec!["Y"]);
    assert_eq!(report.targets.len(), 2);
    assert_eq!(report.targets[0], Target::flatten("X"));
    assert_eq!(report.targets[1].symbol, "Y");
    assert!(report.targets[1].quantity > Decimal::ZERO);

    let holdings = assert_ok!(broker.holdings().await);
    assert!(!holdings.contains_key("X"));
    assert_eq!(holdings["Y"], report.targets[1].quantity);
}

// =========================================================================
// Scenario D: cancel before replace
// =========================================================================

#[tokio::test]
async fn scenario_d_cancels_partial_order_before_new_submission() {
    let broker = Arc::new(
        PaperBroker::new(dec!(10000))
            .with_fee_rate(Decimal::ZERO)
            .with_fill_model(FillModel::NextPrice)
            .with_partial_fills(dec!(0.5)),
    );
    let engine = RotationEngine::new(config(&["X", "Y"], 1, DegeneratePolicy::Abort), broker.clone());

    feed(&engine, day(0), &[("X", dec!(100)), ("Y", dec!(100))]).await;
    feed(&engine, day(1), &[("X", dec!(110)), ("Y", dec!(101))]).await;
    let first = engine.run_cycle(day(1)).await;
    assert_eq!(first.selection.symbols(), vec!["X"]);
    assert_eq!(engine.live_orders().await, vec!["X"]);

    // Next price half-fills the X order, then Y takes the lead
    feed(&engine, day(2), &[("X", dec!(111)), ("Y", dec!(120))]).await;
    let state = broker.get_state().await;
    let first_order = state.orders.values().find(|o| o.symbol == "X").unwrap().clone();
    assert_eq!(first_order.status, OrderStatus::PartiallyFilled);

    let report = engine.run_cycle(day(2)).await;
    assert_eq!(report.targets[0], Target::flatten("X"));

    let state = broker.get_state().await;
    let mut x_orders: Vec<_> = state.orders.values().filter(|o| o.symbol == "X").collect();
    x_orders.sort_by_key(|o| o.order_id);

    assert_eq!(x_orders.len(), 2);
    assert_eq!(x_orders[0].order_id, first_order.order_id);
    assert_eq!(x_orders[0].status, OrderStatus::Canceled);
    // The replacement sells exactly what the partial fill left behind
    assert!(x_orders[1].order_id > x_orders[0].order_id);
    assert_eq!(x_orders[1].quantity, -x_orders[0].filled_quantity);

    let mut live = engine.live_orders().await;
    live.sort();
    assert_eq!(live, vec!["X", "Y"]);
}

#[tokio::test]
async fn deselected_working_order_is_cancelled_before_new_acquire() {
    let broker = Arc::new(
        PaperBroker::new(dec!(10000))
            .with_fee_rate(Decimal::ZERO)
            .with_fill_model(FillModel::NextPrice),
    );
    let engine = RotationEngine::new(config(&["X", "Y"], 1, DegeneratePolicy::Abort), broker.clone());

    feed(&engine, day(0), &[("X", dec!(100)), ("Y", dec!(100))]).await;
    feed(&engine, day(1), &[("X", dec!(110)), ("Y", dec!(101))]).await;
    let first = engine.run_cycle(day(1)).await;
    assert_eq!(first.selection.symbols(), vec!["X"]);
    assert_eq!(engine.live_orders().await, vec!["X"]);

    // Y takes the lead before the X order sees another price
    engine.on_bar(&Bar::flat("X", day(2), dec!(105))).await;
    engine.on_bar(&Bar::flat("Y", day(2), dec!(102))).await;
    let second = engine.run_cycle(day(2)).await;

    assert_eq!(second.selection.symbols(), vec!["Y"]);
    // Sized on the full balance: (10000 - 1) / 101
    assert_eq!(second.targets, vec![Target::acquire("Y", dec!(99))]);
    assert_eq!(engine.live_orders().await, vec!["Y"]);
    assert!(!second
        .warnings
        .iter()
        .any(|w| matches!(w, CycleWarning::OrderFailed { .. })));

    let state = broker.get_state().await;
    let x_order = state.orders.values().find(|o| o.symbol == "X").unwrap();
    assert_eq!(x_order.status, OrderStatus::Canceled);

    feed(&engine, day(3), &[("X", dec!(105)), ("Y", dec!(101))]).await;
    let holdings = assert_ok!(broker.holdings().await);
    assert_eq!(holdings.len(), 1);
    assert_eq!(holdings["Y"], dec!(99));
}

// =========================================================================
// Scenario E: prolonged staleness
// =========================================================================

#[tokio::test]
async fn scenario_e_flattens_and_alerts_once_per_breach() {
    let broker = zero_fee_broker(dec!(10000));
    let engine = RotationEngine::new(config(&["X", "Y"], 1, DegeneratePolicy::Abort), broker.clone());

    feed(&engine, day(0), &[("X", dec!(100)), ("Y", dec!(100))]).await;
    feed(&engine, day(1), &[("X", dec!(105)), ("Y", dec!(101))]).await;
    engine.run_cycle(day(1)).await;
    assert!(assert_ok!(broker.holdings().await).contains_key("X"));

    // No bars arrive: every score goes stale
    let mut statuses = Vec::new();
    let mut alerts = Vec::new();
    for n in 2..=5 {
        let report = engine.run_cycle(day(n)).await;
        statuses.push(report.status);
        alerts.extend(report.alerts);
    }

    // Threshold 2: two tolerated cycles, then flatten
    assert_eq!(statuses[0], CycleStatus::Retained);
    assert_eq!(statuses[1], CycleStatus::Retained);
    assert_eq!(statuses[2], CycleStatus::Completed);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    assert!(assert_ok!(broker.holdings().await).is_empty());
    assert!(engine.previous_selection().await.is_empty());

    // Fresh data ends the streak; a second breach alerts again
    feed(&engine, day(6), &[("X", dec!(110)), ("Y", dec!(102))]).await;
    let recovered = engine.run_cycle(day(6)).await;
    assert_eq!(recovered.selection.symbols(), vec!["X"]);

    let mut second_breach = Vec::new();
    for n in 7..=9 {
        second_breach.extend(engine.run_cycle(day(n)).await.alerts);
    }
    assert_eq!(second_breach.len(), 1);
}

// =========================================================================
// Re-entrancy
// =========================================================================

#[tokio::test]
async fn concurrent_cycles_do_not_overlap() {
    let broker = zero_fee_broker(dec!(10000));
    let engine = Arc::new(RotationEngine::new(
        config(&["X", "Y"], 1, DegeneratePolicy::Abort),
        broker.clone(),
    ));

    feed(&engine, day(0), &[("X", dec!(100)), ("Y", dec!(100))]).await;
    feed(&engine, day(1), &[("X", dec!(105)), ("Y", dec!(101))]).await;

    let (a, b) = tokio::join!(engine.run_cycle(day(1)), engine.run_cycle(day(1)));
    let statuses = [a.status, b.status];

    assert!(statuses.contains(&CycleStatus::Completed));
    // Either the second call found the guard taken or ran after the first finished
    assert!(
        statuses.contains(&CycleStatus::Skipped) || statuses.contains(&CycleStatus::Retained)
    );
    assert!(!engine.is_running());

    let x_orders = broker
        .get_state()
        .await
        .orders
        .values()
        .filter(|o| o.symbol == "X")
        .count();
    assert_eq!(x_orders, 1);
}
