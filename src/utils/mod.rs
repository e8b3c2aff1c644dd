pub mod decimal;

pub use decimal::{fractional_change, round_down_to_lot};
