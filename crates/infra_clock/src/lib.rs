use std::time::Instant;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

/// Indian Standard Time, the default market timezone (UTC+05:30).
pub const IST_OFFSET_MINUTES: i32 = 330;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("invalid time of day: {0} (expected HH:MM)")]
    BadTimeOfDay(String),
    #[error("square-off window start {start} is after end {end}")]
    InvertedWindow { start: NaiveTime, end: NaiveTime },
    #[error("invalid utc offset minutes: {0}")]
    BadOffset(i32),
}

/// Closing window in market-local time. Both bounds are inclusive: a trade
/// square-off at exactly the start minute must fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SquareOffWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SquareOffWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ClockError> {
        if start > end {
            return Err(ClockError::InvertedWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, ClockError> {
        Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?)
    }

    pub fn contains(&self, local: NaiveTime) -> bool {
        local >= self.start && local <= self.end
    }
}

fn parse_time_of_day(raw: &str) -> Result<NaiveTime, ClockError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| ClockError::BadTimeOfDay(raw.to_string()))
}

/// Every time-dependent decision in the server goes through this trait so
/// tests can supply a manual clock.
pub trait MarketClock: Send + Sync {
    fn now_wall(&self) -> DateTime<Utc>;
    fn now_mono(&self) -> Instant;

    /// Calendar date of `wall` in the market timezone.
    fn market_day_for(&self, wall: DateTime<Utc>) -> NaiveDate;

    fn is_square_off_window(&self, wall: DateTime<Utc>) -> bool;

    fn market_today(&self) -> NaiveDate {
        self.market_day_for(self.now_wall())
    }

    fn in_square_off_now(&self) -> bool {
        self.is_square_off_window(self.now_wall())
    }
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    offset: FixedOffset,
    window: SquareOffWindow,
}

impl SystemClock {
    pub fn new(offset_minutes: i32, window: SquareOffWindow) -> Result<Self, ClockError> {
        let offset = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or(ClockError::BadOffset(offset_minutes))?;
        Ok(Self { offset, window })
    }

    pub fn ist(window: SquareOffWindow) -> Self {
        Self::new(IST_OFFSET_MINUTES, window).expect("IST offset is valid")
    }

    fn local_time(&self, wall: DateTime<Utc>) -> NaiveTime {
        wall.with_timezone(&self.offset).time()
    }
}

impl MarketClock for SystemClock {
    fn now_wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_mono(&self) -> Instant {
        Instant::now()
    }

    fn market_day_for(&self, wall: DateTime<Utc>) -> NaiveDate {
        wall.with_timezone(&self.offset).date_naive()
    }

    fn is_square_off_window(&self, wall: DateTime<Utc>) -> bool {
        self.window.contains(self.local_time(wall))
    }
}

/// Test clock with a settable wall time. Monotonic time stays real; only
/// wall-derived decisions are faked.
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
    offset: FixedOffset,
    window: SquareOffWindow,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>, window: SquareOffWindow) -> Self {
        Self {
            now: RwLock::new(start),
            offset: FixedOffset::east_opt(IST_OFFSET_MINUTES * 60).expect("IST offset is valid"),
            window,
        }
    }

    pub fn set(&self, wall: DateTime<Utc>) {
        *self.now.write() = wall;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.write();
        *now += delta;
    }
}

impl MarketClock for ManualClock {
    fn now_wall(&self) -> DateTime<Utc> {
        *self.now.read()
    }

    fn now_mono(&self) -> Instant {
        Instant::now()
    }

    fn market_day_for(&self, wall: DateTime<Utc>) -> NaiveDate {
        wall.with_timezone(&self.offset).date_naive()
    }

    fn is_square_off_window(&self, wall: DateTime<Utc>) -> bool {
        self.window.contains(wall.with_timezone(&self.offset).time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> SquareOffWindow {
        SquareOffWindow::parse("15:15", "15:30").expect("window")
    }

    #[test]
    fn market_day_rolls_over_at_local_midnight() {
        let clock = SystemClock::ist(window());
        // 18:40 UTC = 00:10 IST the next day.
        let wall = Utc.with_ymd_and_hms(2024, 3, 4, 18, 40, 0).unwrap();
        assert_eq!(
            clock.market_day_for(wall),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
        );
        // 18:20 UTC is still 23:50 IST of the same day.
        let wall = Utc.with_ymd_and_hms(2024, 3, 4, 18, 20, 0).unwrap();
        assert_eq!(
            clock.market_day_for(wall),
            NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
        );
    }

    #[test]
    fn square_off_window_bounds_are_inclusive() {
        let clock = SystemClock::ist(window());
        // 09:45 UTC = 15:15 IST, the exact window start.
        let at_start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 45, 0).unwrap();
        assert!(clock.is_square_off_window(at_start));
        // One second earlier must not fire.
        let before = Utc.with_ymd_and_hms(2024, 3, 4, 9, 44, 59).unwrap();
        assert!(!clock.is_square_off_window(before));
        // 10:00 UTC = 15:30 IST, the exact end.
        let at_end = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        assert!(clock.is_square_off_window(at_end));
        let after = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 1).unwrap();
        assert!(!clock.is_square_off_window(after));
    }

    #[test]
    fn manual_clock_is_settable() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 4, 0, 0).unwrap();
        let clock = ManualClock::new(start, window());
        assert!(!clock.in_square_off_now());
        clock.set(Utc.with_ymd_and_hms(2024, 3, 4, 9, 50, 0).unwrap());
        assert!(clock.in_square_off_now());
    }

    #[test]
    fn window_parse_rejects_garbage() {
        assert!(SquareOffWindow::parse("25:00", "15:30").is_err());
        assert!(SquareOffWindow::parse("15:30", "15:15").is_err());
    }
}
