//! Holdings reconciliation and acquire sizing.

use super::selector::Selection;
use crate::config::SizingConfig;
use crate::risk::CycleWarning;
use crate::utils::round_down_to_lot;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TargetKind {
    /// Reduce the position to zero
    Flatten,
    /// Open a new position
    Acquire,
}

/// Desired end-of-cycle position for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub symbol: String,
    /// Signed end-of-cycle quantity; zero for flatten targets
    pub quantity: Decimal,
    pub kind: TargetKind,
}

impl Target {
    pub fn flatten(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity: Decimal::ZERO,
            kind: TargetKind::Flatten,
        }
    }

    pub fn acquire(symbol: &str, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity,
            kind: TargetKind::Acquire,
        }
    }
}

/// Targets for one cycle, flatten targets first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcilePlan {
    pub targets: Vec<Target>,
    /// Capital available to acquire targets after the fee reserve
    pub allocable: Decimal,
    pub fee_reserve: Decimal,
    pub warnings: Vec<CycleWarning>,
}

impl ReconcilePlan {
    pub fn target(&self, symbol: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.symbol == symbol)
    }

    pub fn flatten_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.kind == TargetKind::Flatten)
            .count()
    }

    pub fn acquire_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.kind == TargetKind::Acquire)
            .count()
    }

    /// Sum of `quantity * price` over acquire targets.
    pub fn acquire_notional(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        self.targets
            .iter()
            .filter(|t| t.kind == TargetKind::Acquire)
            .filter_map(|t| prices.get(&t.symbol).map(|p| t.quantity * *p))
            .sum()
    }
}

/// Diffs a selection against holdings and sizes the new positions.
#[derive(Debug, Clone)]
pub struct HoldingsReconciler {
    fee_buffer_per_order: Decimal,
    lot_size: Decimal,
    shrink_on_unfunded: bool,
}

impl HoldingsReconciler {
    pub fn new(fee_buffer_per_order: Decimal, lot_size: Decimal, shrink_on_unfunded: bool) -> Self {
        Self {
            fee_buffer_per_order,
            lot_size,
            shrink_on_unfunded,
        }
    }

    pub fn from_config(config: &SizingConfig) -> Self {
        Self::new(
            config.fee_buffer_per_order,
            config.lot_size,
            config.shrink_on_unfunded,
        )
    }

    /// Build flatten/acquire targets.
    ///
    /// Every held symbol missing from the selection is flattened. Every selected
    /// symbol not held gets an equal share of
    /// `cash + liquidation value - fee reserve`, rounded down to the lot size.
    /// Symbols both held and selected are left alone.
    pub fn reconcile(
        &self,
        holdings: &HashMap<String, Decimal>,
        cash: Decimal,
        prices: &HashMap<String, Decimal>,
        selection: &Selection,
    ) -> ReconcilePlan {
        let mut plan = ReconcilePlan::default();

        let mut to_flatten: Vec<(&String, Decimal)> = holdings
            .iter()
            .filter(|(symbol, qty)| **qty != Decimal::ZERO && !selection.contains(symbol))
            .map(|(symbol, qty)| (symbol, *qty))
            .collect();
        to_flatten.sort_by(|a, b| a.0.cmp(b.0));

        let mut liquidation_value = Decimal::ZERO;
        for (symbol, qty) in &to_flatten {
            match prices.get(*symbol) {
                Some(price) => liquidation_value += *qty * *price,
                None => debug!(%symbol, "No price for flattened position - excluded from allocable"),
            }
            plan.targets.push(Target::flatten(symbol));
        }

        let mut slots: Vec<(String, Decimal)> = Vec::new();
        for member in selection.members() {
            let held = holdings.get(&member.symbol).copied().unwrap_or(Decimal::ZERO);
            if held != Decimal::ZERO {
                continue;
            }
            match prices.get(&member.symbol) {
                Some(price) if *price > Decimal::ZERO => slots.push((member.symbol.clone(), *price)),
                _ => plan.warnings.push(CycleWarning::UnfundedTarget {
                    symbol: member.symbol.clone(),
                    reason: "no positive last price".to_string(),
                }),
            }
        }

        loop {
            let orders = Decimal::from(to_flatten.len() + slots.len());
            plan.fee_reserve = self.fee_buffer_per_order * orders;
            plan.allocable = (cash + liquidation_value - plan.fee_reserve).max(Decimal::ZERO);

            if slots.is_empty() {
                break;
            }

            let per_slot = plan.allocable / Decimal::from(slots.len());
            let sized: Vec<(String, Decimal)> = slots
                .iter()
                .map(|(symbol, price)| {
                    (symbol.clone(), round_down_to_lot(per_slot / *price, self.lot_size))
                })
                .collect();

            let all_funded = sized.iter().all(|(_, qty)| *qty > Decimal::ZERO);
            if all_funded {
                plan.targets
                    .extend(sized.iter().map(|(symbol, qty)| Target::acquire(symbol, *qty)));
                break;
            }

            if self.shrink_on_unfunded {
                if let Some((symbol, _)) = slots.pop() {
                    warn!(%symbol, %per_slot, "Dropping lowest-ranked slot to fund the rest");
                    plan.warnings.push(CycleWarning::UnfundedTarget {
                        symbol,
                        reason: format!("dropped to fund higher-ranked slots ({} per slot)", per_slot),
                    });
                }
                continue;
            }

            for (symbol, qty) in sized {
                if qty > Decimal::ZERO {
                    plan.targets.push(Target::acquire(&symbol, qty));
                } else {
                    warn!(%symbol, %per_slot, "Acquire slot too small for one lot");
                    plan.warnings.push(CycleWarning::UnfundedTarget {
                        symbol,
                        reason: format!("{} per slot buys less than one lot", per_slot),
                    });
                }
            }
            break;
        }

        debug!(
            flatten = plan.flatten_count(),
            acquire = plan.acquire_count(),
            allocable = %plan.allocable,
            fee_reserve = %plan.fee_reserve,
            "Reconciled holdings"
        );

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Candidate;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    fn selection(symbols: &[&str]) -> Selection {
        Selection::new(
            symbols
                .iter()
                .map(|s| Candidate::new(s, dec!(0.1), true, false))
                .collect(),
        )
    }

    fn map(entries: &[(&str, Decimal)]) -> HashMap<String, Decimal> {
        entries.iter().map(|(s, v)| (s.to_string(), *v)).collect()
    }

    #[test]
    fn test_flatten_absent_and_acquire_new() {
        // holdings {X:10}, selection [Y]
        let reconciler = HoldingsReconciler::new(dec!(5), dec!(1), false);
        let plan = reconciler.reconcile(
            &map(&[("X", dec!(10))]),
            dec!(1000),
            &map(&[("X", dec!(50)), ("Y", dec!(20))]),
            &selection(&["Y"]),
        );

        assert_eq!(plan.targets[0], Target::flatten("X"));
        let y = plan.target("Y").unwrap();
        assert_eq!(y.kind, TargetKind::Acquire);
        assert!(y.quantity > Decimal::ZERO);
        // 1000 + 500 - 2 * 5 = 1490 -> 74 shares at 20
        assert_eq!(plan.allocable, dec!(1490));
        assert_eq!(y.quantity, dec!(74));
    }

    #[test]
    fn test_held_and_selected_untouched() {
        let reconciler = HoldingsReconciler::new(dec!(1), dec!(1), false);
        let plan = reconciler.reconcile(
            &map(&[("X", dec!(10)), ("Z", Decimal::ZERO)]),
            dec!(100),
            &map(&[("X", dec!(10)), ("Y", dec!(10)), ("Z", dec!(10))]),
            &selection(&["X", "Y"]),
        );

        assert!(plan.target("X").is_none());
        // Zero-quantity entries are not holdings
        assert!(plan.target("Z").is_none());
        assert_eq!(plan.acquire_count(), 1);
        assert_eq!(plan.flatten_count(), 0);
    }

    #[test]
    fn test_equal_split_within_allocable() {
        let reconciler = HoldingsReconciler::new(dec!(10), dec!(1), false);
        let prices = map(&[("A", dec!(33)), ("B", dec!(70)), ("C", dec!(101))]);
        let plan = reconciler.reconcile(
            &HashMap::new(),
            dec!(3030),
            &prices,
            &selection(&["A", "B", "C"]),
        );

        // 3030 - 30 = 3000 -> 1000 per slot
        assert_eq!(plan.allocable, dec!(3000));
        assert_eq!(plan.target("A").unwrap().quantity, dec!(30));
        assert_eq!(plan.target("B").unwrap().quantity, dec!(14));
        assert_eq!(plan.target("C").unwrap().quantity, dec!(9));
        assert!(plan.acquire_notional(&prices) <= plan.allocable);

        // Targets come out in rank order
        let order: Vec<&str> = plan.targets.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_unfunded_slot_dropped() {
        let reconciler = HoldingsReconciler::new(dec!(0), dec!(1), false);
        let plan = reconciler.reconcile(
            &HashMap::new(),
            dec!(200),
            &map(&[("CHEAP", dec!(10)), ("PRICEY", dec!(500))]),
            &selection(&["CHEAP", "PRICEY"]),
        );

        assert_eq!(plan.target("CHEAP").unwrap().quantity, dec!(10));
        assert!(plan.target("PRICEY").is_none());
        assert!(matches!(
            &plan.warnings[0],
            CycleWarning::UnfundedTarget { symbol, .. } if symbol == "PRICEY"
        ));
    }

    #[test]
    fn test_shrink_on_unfunded_resizes() {
        let reconciler = HoldingsReconciler::new(dec!(0), dec!(1), true);
        let plan = reconciler.reconcile(
            &HashMap::new(),
            dec!(600),
            &map(&[("A", dec!(400)), ("B", dec!(250))]),
            &selection(&["A", "B"]),
        );

        // 300 per slot cannot buy A; dropping B gives A the full 600
        assert_eq!(plan.target("A").unwrap().quantity, dec!(1));
        assert!(plan.target("B").is_none());
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn test_missing_price_reported() {
        let reconciler = HoldingsReconciler::new(dec!(1), dec!(1), false);
        let plan = reconciler.reconcile(
            &HashMap::new(),
            dec!(1000),
            &HashMap::new(),
            &selection(&["Y"]),
        );

        assert!(plan.targets.is_empty());
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn test_fee_reserve_larger_than_cash() {
        let reconciler = HoldingsReconciler::new(dec!(100), dec!(1), false);
        let plan = reconciler.reconcile(
            &HashMap::new(),
            dec!(50),
            &map(&[("Y", dec!(1))]),
            &selection(&["Y"]),
        );

        assert_eq!(plan.allocable, Decimal::ZERO);
        assert!(plan.target("Y").is_none());
    }

    #[test]
    fn test_unique_targets_and_idempotent() {
        let reconciler = HoldingsReconciler::new(dec!(2), dec!(0.5), false);
        let holdings = map(&[("A", dec!(3)), ("B", dec!(-2)), ("C", dec!(1))]);
        let prices = map(&[("A", dec!(10)), ("B", dec!(10)), ("C", dec!(10)), ("D", dec!(7))]);
        let sel = selection(&["C", "D"]);

        let first = reconciler.reconcile(&holdings, dec!(100), &prices, &sel);
        let second = reconciler.reconcile(&holdings, dec!(100), &prices, &sel);
        assert_eq!(first.targets, second.targets);

        let unique: HashSet<&str> = first.targets.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(unique.len(), first.targets.len());

        // Flattens sorted by symbol, the short included
        assert_eq!(first.targets[0], Target::flatten("A"));
        assert_eq!(first.targets[1], Target::flatten("B"));
        // 100 + 30 - 20 - 3 * 2 = 104 -> 14.5 lots of 0.5 at 7
        assert_eq!(first.target("D").unwrap().quantity, dec!(14.5));
    }
}
