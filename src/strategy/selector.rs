//! Top-K ranking and selection.

use crate::config::{DegeneratePolicy, SelectionConfig};
use crate::risk::CycleWarning;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

/// An instrument considered for selection this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub symbol: String,
    pub score: Decimal,
    /// Market open and instrument listed
    pub tradable: bool,
    /// Score not refreshed since the previous cycle (or not ready)
    pub stale: bool,
}

impl Candidate {
    pub fn new(symbol: &str, score: Decimal, tradable: bool, stale: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            score,
            tradable,
            stale,
        }
    }

    /// Fresh, tradable and strictly positive.
    pub fn qualifies(&self) -> bool {
        self.is_evaluable() && self.score > Decimal::ZERO
    }

    /// Fresh and tradable, regardless of sign.
    pub fn is_evaluable(&self) -> bool {
        !self.stale && self.tradable
    }
}

/// Ordered top-K members, best score first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Selection {
    members: Vec<Candidate>,
}

impl Selection {
    pub fn new(members: Vec<Candidate>) -> Self {
        Self { members }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.members.iter().map(|c| c.symbol.clone()).collect()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.members.iter().any(|c| c.symbol == symbol)
    }

    pub fn members(&self) -> &[Candidate] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// What the cycle should do with the selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SelectionAction {
    /// Reconcile holdings against the new selection
    Rebalance,
    /// Keep the previous selection and place no orders
    Retain,
    /// Empty selection: flatten every holding
    FlattenAll,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionOutcome {
    pub selection: Selection,
    pub action: SelectionAction,
    /// No candidate could be evaluated at all (stale, untradable or not ready)
    pub all_excluded: bool,
    pub warnings: Vec<CycleWarning>,
}

/// Ranks candidates and applies the degenerate-case policy.
#[derive(Debug, Clone)]
pub struct Selector {
    top_k: usize,
    policy: DegeneratePolicy,
}

impl Selector {
    pub fn new(top_k: usize, policy: DegeneratePolicy) -> Self {
        Self { top_k, policy }
    }

    pub fn from_config(config: &SelectionConfig) -> Self {
        Self::new(config.top_k, config.degenerate_policy)
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Select the top K qualifying candidates.
    ///
    /// Input order breaks score ties; a repeated symbol keeps its first occurrence.
    pub fn select(&self, candidates: &[Candidate], previous: &Selection) -> SelectionOutcome {
        let mut seen = HashSet::new();
        let unique: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| seen.insert(c.symbol.as_str()))
            .collect();

        let mut warnings: Vec<CycleWarning> = unique
            .iter()
            .filter(|c| c.stale)
            .map(|c| CycleWarning::DataStaleness {
                symbol: c.symbol.clone(),
            })
            .collect();

        let mut qualifying: Vec<Candidate> = unique
            .iter()
            .filter(|c| c.qualifies())
            .map(|c| (*c).clone())
            .collect();
        // sort_by is stable: equal scores keep input order
        qualifying.sort_by(|a, b| b.score.cmp(&a.score));

        debug!(
            candidates = unique.len(),
            qualifying = qualifying.len(),
            top_k = self.top_k,
            "Ranked candidates"
        );

        if qualifying.len() >= self.top_k {
            qualifying.truncate(self.top_k);
            return SelectionOutcome {
                selection: Selection::new(qualifying),
                action: SelectionAction::Rebalance,
                all_excluded: false,
                warnings,
            };
        }

        let evaluable = unique.iter().any(|c| c.is_evaluable());

        if qualifying.is_empty() && !evaluable {
            info!(
                candidates = unique.len(),
                "Every candidate excluded - retaining previous selection"
            );
            return SelectionOutcome {
                selection: previous.clone(),
                action: SelectionAction::Retain,
                all_excluded: true,
                warnings,
            };
        }

        warnings.push(CycleWarning::InsufficientCandidates {
            qualifying: qualifying.len(),
            requested: self.top_k,
            policy: self.policy,
        });

        if qualifying.is_empty() {
            info!("No positive scores - flattening all holdings");
            return SelectionOutcome {
                selection: Selection::empty(),
                action: SelectionAction::FlattenAll,
                all_excluded: false,
                warnings,
            };
        }

        let (selection, action) = match self.policy {
            DegeneratePolicy::Shrink => (Selection::new(qualifying), SelectionAction::Rebalance),
            DegeneratePolicy::Abort => (previous.clone(), SelectionAction::Retain),
            DegeneratePolicy::Liquidate => (Selection::empty(), SelectionAction::FlattenAll),
        };

        info!(
            policy = %self.policy,
            selected = selection.len(),
            ?action,
            "Fewer candidates than requested"
        );

        SelectionOutcome {
            selection,
            action,
            all_excluded: false,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn fresh(symbol: &str, score: Decimal) -> Candidate {
        Candidate::new(symbol, score, true, false)
    }

    fn stale(symbol: &str) -> Candidate {
        Candidate::new(symbol, dec!(0.5), true, true)
    }

    fn previous() -> Selection {
        Selection::new(vec![fresh("OLD", dec!(0.2))])
    }

    // =========================================================================
    // Ranking
    // =========================================================================

    #[test]
    fn test_top_k_by_score() {
        // X:0.05, Y:0.03, Z:-0.01 with K=2
        let selector = Selector::new(2, DegeneratePolicy::Abort);
        let candidates = vec![
            fresh("X", dec!(0.05)),
            fresh("Y", dec!(0.03)),
            fresh("Z", dec!(-0.01)),
        ];

        let outcome = selector.select(&candidates, &Selection::empty());
        assert_eq!(outcome.selection.symbols(), vec!["X", "Y"]);
        assert_eq!(outcome.action, SelectionAction::Rebalance);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_sorts_descending_and_breaks_ties_by_input_order() {
        let selector = Selector::new(3, DegeneratePolicy::Abort);
        let candidates = vec![
            fresh("A", dec!(0.01)),
            fresh("B", dec!(0.04)),
            fresh("C", dec!(0.04)),
            fresh("D", dec!(0.02)),
        ];

        let outcome = selector.select(&candidates, &Selection::empty());
        assert_eq!(outcome.selection.symbols(), vec!["B", "C", "D"]);
    }

    #[test]
    fn test_excludes_stale_untradable_and_non_positive() {
        let selector = Selector::new(1, DegeneratePolicy::Abort);
        let candidates = vec![
            Candidate::new("S", dec!(0.9), true, true),
            Candidate::new("U", dec!(0.8), false, false),
            fresh("Z", Decimal::ZERO),
            fresh("OK", dec!(0.01)),
        ];

        let outcome = selector.select(&candidates, &Selection::empty());
        assert_eq!(outcome.selection.symbols(), vec!["OK"]);
        assert_eq!(
            outcome.warnings,
            vec![CycleWarning::DataStaleness {
                symbol: "S".to_string()
            }]
        );
    }

    #[test]
    fn test_duplicate_symbols_keep_first() {
        let selector = Selector::new(2, DegeneratePolicy::Shrink);
        let candidates = vec![
            fresh("X", dec!(0.01)),
            fresh("X", dec!(0.99)),
            fresh("Y", dec!(0.02)),
        ];

        let outcome = selector.select(&candidates, &Selection::empty());
        assert_eq!(outcome.selection.symbols(), vec!["Y", "X"]);
        assert_eq!(outcome.selection.members()[1].score, dec!(0.01));
    }

    // =========================================================================
    // Degenerate cases
    // =========================================================================

    #[test]
    fn test_shrink_policy_selects_fewer() {
        let selector = Selector::new(2, DegeneratePolicy::Shrink);
        let outcome = selector.select(&[fresh("X", dec!(0.05))], &previous());

        assert_eq!(outcome.selection.symbols(), vec!["X"]);
        assert_eq!(outcome.action, SelectionAction::Rebalance);
        assert!(matches!(
            outcome.warnings[0],
            CycleWarning::InsufficientCandidates {
                qualifying: 1,
                requested: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_abort_policy_retains_previous() {
        let selector = Selector::new(2, DegeneratePolicy::Abort);
        let outcome = selector.select(&[fresh("X", dec!(0.05))], &previous());

        assert_eq!(outcome.selection, previous());
        assert_eq!(outcome.action, SelectionAction::Retain);
        assert!(!outcome.all_excluded);
    }

    #[test]
    fn test_liquidate_policy_empties_selection() {
        let selector = Selector::new(2, DegeneratePolicy::Liquidate);
        let outcome = selector.select(&[fresh("X", dec!(0.05))], &previous());

        assert!(outcome.selection.is_empty());
        assert_eq!(outcome.action, SelectionAction::FlattenAll);
    }

    #[test]
    fn test_all_non_positive_flattens_regardless_of_policy() {
        for policy in [
            DegeneratePolicy::Shrink,
            DegeneratePolicy::Abort,
            DegeneratePolicy::Liquidate,
        ] {
            let selector = Selector::new(2, policy);
            let candidates = vec![fresh("X", dec!(-0.05)), fresh("Y", Decimal::ZERO)];

            let outcome = selector.select(&candidates, &previous());
            assert!(outcome.selection.is_empty(), "{policy}");
            assert_eq!(outcome.action, SelectionAction::FlattenAll);
            assert!(!outcome.all_excluded);
        }
    }

    #[test]
    fn test_all_excluded_retains_and_flags() {
        let selector = Selector::new(2, DegeneratePolicy::Liquidate);
        let candidates = vec![stale("X"), Candidate::new("Y", dec!(0.3), false, false)];

        let outcome = selector.select(&candidates, &previous());
        assert!(outcome.all_excluded);
        assert_eq!(outcome.action, SelectionAction::Retain);
        assert_eq!(outcome.selection, previous());
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_selection_is_idempotent() {
        let selector = Selector::new(2, DegeneratePolicy::Shrink);
        let candidates = vec![
            fresh("A", dec!(0.03)),
            stale("B"),
            fresh("C", dec!(0.07)),
            fresh("D", dec!(0.03)),
        ];

        let first = selector.select(&candidates, &Selection::empty());
        let second = selector.select(&candidates, &Selection::empty());
        assert_eq!(first.selection, second.selection);
        assert_eq!(first.warnings, second.warnings);
    }
}
