//! Performance metrics calculation for backtesting.
//!
//! Provides Sharpe ratio, Sortino ratio, drawdown analysis, and cycle activity.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// A point on the equity curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub cash: Decimal,
    pub holdings_value: Decimal,
    pub total_equity: Decimal,
    pub drawdown: Decimal,
    pub position_count: usize,
}

impl EquityPoint {
    pub fn new(
        timestamp: DateTime<Utc>,
        cash: Decimal,
        holdings_value: Decimal,
        position_count: usize,
        peak_equity: Decimal,
    ) -> Self {
        let total_equity = cash + holdings_value;
        let drawdown = if peak_equity > Decimal::ZERO && total_equity < peak_equity {
            (peak_equity - total_equity) / peak_equity
        } else {
            Decimal::ZERO
        };

        Self {
            timestamp,
            cash,
            holdings_value,
            total_equity,
            drawdown,
            position_count,
        }
    }
}

/// Counters gathered while replaying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityStats {
    pub total_fees: Decimal,
    pub orders_submitted: u64,
    pub fills: u64,
    pub cycles_completed: u64,
    pub cycles_retained: u64,
    pub cycles_skipped: u64,
    pub cycles_warming_up: u64,
    pub alerts_raised: u64,
}

/// Comprehensive backtest performance metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    // Returns
    /// Total absolute return (final - initial)
    pub total_return: Decimal,
    /// Total return as percentage
    pub total_return_pct: Decimal,
    /// Annualized return percentage
    pub annualized_return: Decimal,

    // Risk
    /// Maximum drawdown as a fraction of the peak
    pub max_drawdown: Decimal,
    /// Duration of maximum drawdown in hours
    pub max_drawdown_duration_hours: i64,
    /// Annualized volatility (std dev of returns)
    pub volatility: Decimal,

    // Risk-adjusted
    /// Sharpe ratio (assuming 0 risk-free rate)
    pub sharpe_ratio: Decimal,
    /// Sortino ratio (downside deviation only)
    pub sortino_ratio: Decimal,
    /// Calmar ratio (return / max drawdown)
    pub calmar_ratio: Decimal,

    // Activity
    pub activity: ActivityStats,

    // Time
    /// Backtest duration in days
    pub duration_days: f64,
}

impl BacktestMetrics {
    /// Calculate metrics from the equity curve and replay counters.
    pub fn calculate(
        equity_curve: &[EquityPoint],
        initial_cash: Decimal,
        activity: ActivityStats,
    ) -> Self {
        let (Some(first), Some(last)) = (equity_curve.first(), equity_curve.last()) else {
            return Self {
                activity,
                ..Self::empty()
            };
        };

        let duration = last.timestamp - first.timestamp;
        let duration_days = duration.num_seconds() as f64 / 86400.0;
        let duration_years = duration_days / 365.0;

        let total_return = last.total_equity - initial_cash;
        let total_return_pct = if initial_cash > Decimal::ZERO {
            total_return / initial_cash * dec!(100)
        } else {
            Decimal::ZERO
        };

        let annualized_return = if duration_years > 0.0 {
            let factor = 1.0 + to_f64(total_return_pct) / 100.0;
            let annualized = factor.max(0.0).powf(1.0 / duration_years) - 1.0;
            from_f64(annualized * 100.0)
        } else {
            Decimal::ZERO
        };

        let (max_drawdown, max_dd_duration) = calculate_max_drawdown(equity_curve);

        let returns = calculate_period_returns(equity_curve);
        let volatility = calculate_volatility(&returns, duration_years);
        let sharpe_ratio = calculate_sharpe(&returns, duration_years);
        let sortino_ratio = calculate_sortino(&returns, duration_years);
        let calmar_ratio = if max_drawdown > Decimal::ZERO {
            annualized_return / (max_drawdown * dec!(100))
        } else {
            Decimal::ZERO
        };

        Self {
            total_return,
            total_return_pct,
            annualized_return,
            max_drawdown,
            max_drawdown_duration_hours: max_dd_duration,
            volatility,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            activity,
            duration_days,
        }
    }

    /// Create empty metrics (for error cases).
    pub fn empty() -> Self {
        Self {
            total_return: Decimal::ZERO,
            total_return_pct: Decimal::ZERO,
            annualized_return: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            max_drawdown_duration_hours: 0,
            volatility: Decimal::ZERO,
            sharpe_ratio: Decimal::ZERO,
            sortino_ratio: Decimal::ZERO,
            calmar_ratio: Decimal::ZERO,
            activity: ActivityStats::default(),
            duration_days: 0.0,
        }
    }

    /// Format metrics as a summary string.
    pub fn summary(&self) -> String {
        format!(
            r#"═══════════════════════════════════════════════
BACKTEST RESULTS ({:.1} days)
═══════════════════════════════════════════════
RETURNS
  Total Return:      ${:.2} ({:.2}%)
  Annualized:        {:.2}%

RISK
  Max Drawdown:      {:.2}%
  Volatility:        {:.2}%

RISK-ADJUSTED
  Sharpe Ratio:      {:.3}
  Sortino Ratio:     {:.3}
  Calmar Ratio:      {:.3}

ACTIVITY
  Orders Submitted:  {}
  Fills:             {}
  Trading Fees:      ${:.2}
  Alerts Raised:     {}

CYCLES
  Completed:         {}
  Retained:          {}
  Skipped:           {}
  Warming Up:        {}
═══════════════════════════════════════════════"#,
            self.duration_days,
            self.total_return,
            self.total_return_pct,
            self.annualized_return,
            self.max_drawdown * dec!(100),
            self.volatility * dec!(100),
            self.sharpe_ratio,
            self.sortino_ratio,
            self.calmar_ratio,
            self.activity.orders_submitted,
            self.activity.fills,
            self.activity.total_fees,
            self.activity.alerts_raised,
            self.activity.cycles_completed,
            self.activity.cycles_retained,
            self.activity.cycles_skipped,
            self.activity.cycles_warming_up,
        )
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn from_f64(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
}

/// Calculate period returns from equity curve.
fn calculate_period_returns(equity_curve: &[EquityPoint]) -> Vec<Decimal> {
    equity_curve
        .windows(2)
        .map(|w| {
            let (prev, curr) = (&w[0], &w[1]);
            if prev.total_equity > Decimal::ZERO {
                (curr.total_equity - prev.total_equity) / prev.total_equity
            } else {
                Decimal::ZERO
            }
        })
        .collect()
}

/// Calculate maximum drawdown and its duration.
fn calculate_max_drawdown(equity_curve: &[EquityPoint]) -> (Decimal, i64) {
    let Some(first) = equity_curve.first() else {
        return (Decimal::ZERO, 0);
    };

    let mut peak = first.total_equity;
    let mut max_dd = Decimal::ZERO;
    let mut max_dd_start: Option<DateTime<Utc>> = None;
    let mut max_dd_duration: i64 = 0;
    let mut current_dd_start: Option<DateTime<Utc>> = None;

    for point in equity_curve {
        if point.total_equity > peak {
            peak = point.total_equity;
            current_dd_start = None;
        } else if peak > Decimal::ZERO {
            let dd = (peak - point.total_equity) / peak;
            if dd > max_dd {
                max_dd = dd;
                if current_dd_start.is_none() {
                    current_dd_start = Some(point.timestamp);
                }
                max_dd_start = current_dd_start;
            }
        }

        if let Some(start) = max_dd_start {
            let duration = (point.timestamp - start).num_hours();
            if duration > max_dd_duration {
                max_dd_duration = duration;
            }
        }
    }

    (max_dd, max_dd_duration)
}

fn mean_and_std(returns: &[f64]) -> (f64, f64) {
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Calculate annualized volatility from returns.
fn calculate_volatility(returns: &[Decimal], duration_years: f64) -> Decimal {
    if returns.len() < 2 || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let returns_f64: Vec<f64> = returns.iter().copied().map(to_f64).collect();
    let (_, std_dev) = mean_and_std(&returns_f64);

    // Annualize by the observed sampling rate
    let periods_per_year = returns_f64.len() as f64 / duration_years;
    from_f64(std_dev * periods_per_year.sqrt())
}

/// Calculate Sharpe ratio (assuming 0 risk-free rate).
fn calculate_sharpe(returns: &[Decimal], duration_years: f64) -> Decimal {
    if returns.is_empty() || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let returns_f64: Vec<f64> = returns.iter().copied().map(to_f64).collect();
    let (mean, std_dev) = mean_and_std(&returns_f64);
    if std_dev < 1e-10 {
        return Decimal::ZERO;
    }

    let periods_per_year = returns_f64.len() as f64 / duration_years;
    let annualized_return = mean * periods_per_year;
    let annualized_std = std_dev * periods_per_year.sqrt();

    from_f64(annualized_return / annualized_std)
}

/// Calculate Sortino ratio (downside deviation only).
fn calculate_sortino(returns: &[Decimal], duration_years: f64) -> Decimal {
    if returns.is_empty() || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let returns_f64: Vec<f64> = returns.iter().copied().map(to_f64).collect();
    let (mean, _) = mean_and_std(&returns_f64);

    let downside: Vec<f64> = returns_f64.iter().filter(|&&r| r < 0.0).copied().collect();
    if downside.is_empty() {
        // No negative returns, cap instead of infinity
        return dec!(100);
    }

    let downside_variance = downside.iter().map(|r| r.powi(2)).sum::<f64>() / downside.len() as f64;
    let downside_deviation = downside_variance.sqrt();
    if downside_deviation < 1e-10 {
        return dec!(100);
    }

    let periods_per_year = returns_f64.len() as f64 / duration_years;
    let annualized_return = mean * periods_per_year;
    let annualized_dd = downside_deviation * periods_per_year.sqrt();

    from_f64(annualized_return / annualized_dd)
}
