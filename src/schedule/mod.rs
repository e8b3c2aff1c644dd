//! Calendar scheduling of rebalance cycles.
//!
//! A [`Schedule`] combines a date rule (every day, week start, month start) with
//! a time rule anchored on the session open or close. Only weekdays trade.
//! [`run_scheduled`] drives an engine in real time, spawning each cycle on its
//! own task and catching panics at that boundary.

use crate::config::{DateRule, ScheduleConfig, TimeAnchor};
use crate::exchange::Brokerage;
use crate::strategy::{CycleStatus, RotationEngine};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Days searched ahead before giving up on finding a fire time.
const MAX_SEARCH_DAYS: i64 = 400;

#[derive(Debug, Clone)]
pub struct Schedule {
    date_rule: DateRule,
    anchor: TimeAnchor,
    offset: Duration,
    market_open: NaiveTime,
    market_close: NaiveTime,
}

impl Schedule {
    pub fn new(
        date_rule: DateRule,
        anchor: TimeAnchor,
        offset_minutes: u32,
        market_open: NaiveTime,
        market_close: NaiveTime,
    ) -> Self {
        Self {
            date_rule,
            anchor,
            offset: Duration::minutes(offset_minutes as i64),
            market_open,
            market_close,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(
            config.date_rule,
            config.time_anchor,
            config.offset_minutes,
            config.market_open,
            config.market_close,
        )
    }

    pub fn is_trading_day(date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Whether the date rule selects `date`.
    pub fn fires_on(&self, date: NaiveDate) -> bool {
        if !Self::is_trading_day(date) {
            return false;
        }
        match self.date_rule {
            DateRule::EveryDay => true,
            DateRule::WeekStart => date.weekday() == Weekday::Mon,
            DateRule::MonthStart => {
                // First weekday of the month falls on day 1, 2 or 3
                (1..date.day()).all(|d| {
                    date.with_day(d)
                        .map(|earlier| !Self::is_trading_day(earlier))
                        .unwrap_or(true)
                })
            }
        }
    }

    /// Fire time on `date`, clamped to the session.
    pub fn fire_time(&self, date: NaiveDate) -> DateTime<Utc> {
        let open = date.and_time(self.market_open).and_utc();
        let close = date.and_time(self.market_close).and_utc();
        let at = match self.anchor {
            TimeAnchor::AfterMarketOpen => open + self.offset,
            TimeAnchor::BeforeMarketClose => close - self.offset,
        };
        at.clamp(open, close)
    }

    /// First fire time strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = t.date_naive();
        (0..MAX_SEARCH_DAYS)
            .filter_map(|offset| start.checked_add_signed(Duration::days(offset)))
            .filter(|date| self.fires_on(*date))
            .map(|date| self.fire_time(date))
            .find(|fire| *fire > t)
    }

    /// Fire times in `(from, to]`, oldest first.
    pub fn fires_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut fires = Vec::new();
        let mut cursor = from;
        while let Some(next) = self.next_after(cursor) {
            if next > to {
                break;
            }
            fires.push(next);
            cursor = next;
        }
        fires
    }
}

/// Run cycles on the schedule until `shutdown` is set.
///
/// Each fire spawns its cycle on a separate task so a slow cycle never delays
/// the next fire; the engine's guard turns overlaps into skipped cycles. A
/// panicking cycle is logged and the loop keeps going.
pub async fn run_scheduled<B>(
    engine: Arc<RotationEngine<B>>,
    schedule: Schedule,
    shutdown: Arc<AtomicBool>,
) where
    B: Brokerage + 'static,
{
    info!("⏰ Scheduler started");

    while !shutdown.load(Ordering::SeqCst) {
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            error!("No upcoming fire time - scheduler stopping");
            break;
        };
        debug!(%next, "Next cycle scheduled");

        // Sleep in bounded slices so shutdown is noticed promptly
        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("🛑 Scheduler stopped");
                return;
            }
            let remaining = next - Utc::now();
            if remaining <= Duration::zero() {
                break;
            }
            let slice = remaining
                .to_std()
                .unwrap_or_default()
                .min(std::time::Duration::from_secs(1));
            tokio::time::sleep(slice).await;
        }

        let engine = engine.clone();
        tokio::spawn(async move {
            run_guarded(engine.as_ref(), next).await;
        });
    }

    info!("🛑 Scheduler stopped");
}

/// Run one cycle, converting a panic into a logged error.
pub async fn run_guarded<B>(engine: &RotationEngine<B>, at: DateTime<Utc>) -> Option<CycleStatus>
where
    B: Brokerage,
{
    match AssertUnwindSafe(engine.run_cycle(at)).catch_unwind().await {
        Ok(report) => {
            if !report.warnings.is_empty() {
                warn!(
                    cycle = report.cycle,
                    warnings = report.warnings.len(),
                    status = ?report.status,
                    "Cycle finished with warnings"
                );
            }
            Some(report.status)
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%at, panic = %message, "Cycle panicked - keeping previous state");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn schedule(date_rule: DateRule, anchor: TimeAnchor, offset: u32) -> Schedule {
        Schedule::new(date_rule, anchor, offset, hm(14, 30), hm(21, 0))
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_every_day_skips_weekend() {
        let s = schedule(DateRule::EveryDay, TimeAnchor::AfterMarketOpen, 0);
        // Friday 2024-06-07 after the open
        let friday = Utc.with_ymd_and_hms(2024, 6, 7, 15, 0, 0).unwrap();

        let next = s.next_after(friday).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 10, 14, 30, 0).unwrap());
    }

    #[test]
    fn test_same_day_fire_when_before_time() {
        let s = schedule(DateRule::EveryDay, TimeAnchor::AfterMarketOpen, 10);
        let morning = Utc.with_ymd_and_hms(2024, 6, 4, 9, 0, 0).unwrap();

        assert_eq!(
            s.next_after(morning).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 4, 14, 40, 0).unwrap()
        );
    }

    #[test]
    fn test_before_close_anchor() {
        let s = schedule(DateRule::EveryDay, TimeAnchor::BeforeMarketClose, 15);
        assert_eq!(
            s.fire_time(date(2024, 6, 4)),
            Utc.with_ymd_and_hms(2024, 6, 4, 20, 45, 0).unwrap()
        );
    }

    #[test]
    fn test_offset_clamped_to_session() {
        let s = schedule(DateRule::EveryDay, TimeAnchor::AfterMarketOpen, 1_000);
        assert_eq!(
            s.fire_time(date(2024, 6, 4)),
            Utc.with_ymd_and_hms(2024, 6, 4, 21, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_week_start() {
        let s = schedule(DateRule::WeekStart, TimeAnchor::AfterMarketOpen, 0);
        assert!(s.fires_on(date(2024, 6, 3)));
        assert!(!s.fires_on(date(2024, 6, 4)));

        let wednesday = Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap();
        assert_eq!(
            s.next_after(wednesday).unwrap().date_naive(),
            date(2024, 6, 10)
        );
    }

    #[test]
    fn test_month_start_first_weekday() {
        let s = schedule(DateRule::MonthStart, TimeAnchor::AfterMarketOpen, 0);
        // June 2024 starts on a Saturday
        assert!(!s.fires_on(date(2024, 6, 1)));
        assert!(s.fires_on(date(2024, 6, 3)));
        assert!(!s.fires_on(date(2024, 6, 4)));
        // July 2024 starts on a Monday
        assert!(s.fires_on(date(2024, 7, 1)));
        assert!(!s.fires_on(date(2024, 7, 2)));
    }

    #[test]
    fn test_fires_between() {
        let s = schedule(DateRule::EveryDay, TimeAnchor::AfterMarketOpen, 0);
        let from = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 6, 10, 14, 30, 0).unwrap();

        let fires = s.fires_between(from, to);
        // Mon-Fri plus the following Monday
        assert_eq!(fires.len(), 6);
        assert!(fires.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*fires.last().unwrap(), to);
    }
}
