//! Rebalancing strategy implementation.
//!
//! Contains the core logic for:
//! - Ranking candidates and selecting the top K
//! - Reconciling the selection against holdings into flatten/acquire targets
//! - Tracking in-flight orders and cancel-and-replace execution
//! - Dual thrust breakout targets on a single symbol
//! - The engine running one cycle per schedule fire

mod engine;
mod executor;
mod reconciler;
mod selector;
mod tracker;
mod trend;

pub use engine::{CycleReport, CycleStatus, RotationEngine};
pub use executor::{ExecutionError, ExecutionReport, ExecutionResult, OrderExecutor};
pub use reconciler::{HoldingsReconciler, ReconcilePlan, Target, TargetKind};
pub use selector::{Candidate, Selection, SelectionAction, SelectionOutcome, Selector};
pub use tracker::{OrderRecord, OrderState, OrderTracker, TrackerError};
pub use trend::DualThrustStrategy;
