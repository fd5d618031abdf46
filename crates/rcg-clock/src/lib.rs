//! Operator-timezone clock.
//!
//! All scheduling and day-boundary math in the engine runs in the operator
//! timezone (default `America/Mazatlan`), never in host-local time or UTC.
//! Device expiries are stored as unix seconds, so this crate is the single
//! place where civil dates and unix timestamps are converted.
//!
//! # Fixed-now support
//!
//! `OperatorClock::with_fixed_now` pins "now" to a given unix second. Tests
//! use this to exercise fixed-hour triggers and day-boundary edges
//! deterministically; production code never calls it.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Days, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

pub const DEFAULT_TIMEZONE: &str = "America/Mazatlan";

#[derive(Debug, Clone)]
pub struct OperatorClock {
    tz: Tz,
    fixed_now_unix: Option<i64>,
}

impl OperatorClock {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            fixed_now_unix: None,
        }
    }

    /// Build from an IANA timezone name (e.g. `"America/Mazatlan"`).
    pub fn from_name(name: &str) -> Result<Self> {
        let tz: Tz = name
            .parse()
            .map_err(|_| anyhow!("unknown timezone: {}", name))?;
        Ok(Self::new(tz))
    }

    /// Pin "now" to a fixed unix second. Test-only by convention.
    pub fn with_fixed_now(mut self, unix: i64) -> Self {
        self.fixed_now_unix = Some(unix);
        self
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn now_unix(&self) -> i64 {
        match self.fixed_now_unix {
            Some(u) => u,
            None => Utc::now().timestamp(),
        }
    }

    /// Current instant in the operator timezone.
    pub fn now(&self) -> DateTime<Tz> {
        self.at_unix(self.now_unix())
    }

    /// Convert a unix second to an operator-timezone datetime.
    pub fn at_unix(&self, unix: i64) -> DateTime<Tz> {
        DateTime::<Utc>::from_timestamp(unix, 0)
            .expect("unix seconds out of chrono range")
            .with_timezone(&self.tz)
    }

    /// Today's civil date in the operator timezone.
    pub fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    /// Today as `YYYY-MM-DD`, the format the eligibility SQL binds.
    pub fn today_str(&self) -> String {
        self.today().format("%Y-%m-%d").to_string()
    }

    /// Unix second of 23:59:59 on `date` in the operator timezone.
    pub fn end_of_day_unix(&self, date: NaiveDate) -> i64 {
        let naive = date
            .and_hms_opt(23, 59, 59)
            .expect("23:59:59 is a valid wall time");
        // 23:59:59 never lands inside a DST spring-forward gap; ambiguity
        // (fall-back) resolves to the earlier instant.
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt.timestamp(),
            LocalResult::Ambiguous(earlier, _) => earlier.timestamp(),
            LocalResult::None => naive.and_utc().timestamp(),
        }
    }

    pub fn end_of_today_unix(&self) -> i64 {
        self.end_of_day_unix(self.today())
    }

    pub fn end_of_tomorrow_unix(&self) -> i64 {
        let tomorrow = self
            .today()
            .checked_add_days(Days::new(1))
            .expect("date overflow");
        self.end_of_day_unix(tomorrow)
    }

    /// `end_of_today + days × 86400` — the GPS/ELIOT expiry rule: the new
    /// expiry is an exact number of days after the end of the current day.
    pub fn end_of_today_plus_days_unix(&self, days: i64) -> i64 {
        self.end_of_today_unix() + days * 86_400
    }

    /// `end_of_day(today + days)` — the VOZ expiry rule: the new expiry is
    /// 23:59:59 on the civil date `days` ahead.
    pub fn end_of_day_in_days_unix(&self, days: i64) -> i64 {
        let date = self
            .today()
            .checked_add_days(Days::new(days.max(0) as u64))
            .expect("date overflow");
        self.end_of_day_unix(date)
    }

    /// Operator-readable `DD/MM/YYYY` of a unix second.
    pub fn format_dd_mm_yyyy(&self, unix: i64) -> String {
        self.at_unix(unix).format("%d/%m/%Y").to_string()
    }

    /// Minutes elapsed since `unix`, clamped at zero for clock skew.
    pub fn minutes_since(&self, unix: i64) -> f64 {
        ((self.now_unix() - unix).max(0)) as f64 / 60.0
    }
}

/// Idle minutes expressed as fractional days, for uniform comparison against
/// the day-limit window.
pub fn minutes_to_days(minutes: f64) -> f64 {
    minutes / 1_440.0
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference instants (America/Mazatlan, UTC-7 year-round since 2022):
    //   2026-01-15 12:00:00 = 1768503600
    //   2026-01-15 23:59:59 = 1768546799
    //   2026-01-16 23:59:59 = 1768633199
    //   2026-01-23 23:59:59 = 1769237999
    const NOON_JAN_15: i64 = 1_768_503_600;
    const EOD_JAN_15: i64 = 1_768_546_799;
    const EOD_JAN_16: i64 = 1_768_633_199;
    const EOD_JAN_23: i64 = 1_769_237_999;

    fn clock() -> OperatorClock {
        OperatorClock::from_name(DEFAULT_TIMEZONE)
            .unwrap()
            .with_fixed_now(NOON_JAN_15)
    }

    #[test]
    fn end_of_today_is_2359_local() {
        assert_eq!(clock().end_of_today_unix(), EOD_JAN_15);
    }

    #[test]
    fn end_of_tomorrow_crosses_one_day() {
        assert_eq!(clock().end_of_tomorrow_unix(), EOD_JAN_16);
    }

    #[test]
    fn gps_expiry_rule_adds_whole_days_after_eod() {
        assert_eq!(clock().end_of_today_plus_days_unix(8), EOD_JAN_23);
    }

    #[test]
    fn voz_expiry_rule_lands_on_civil_eod() {
        // No DST in Mazatlan, so both rules agree on this range.
        assert_eq!(clock().end_of_day_in_days_unix(8), EOD_JAN_23);
    }

    #[test]
    fn today_str_is_iso_date() {
        assert_eq!(clock().today_str(), "2026-01-15");
    }

    #[test]
    fn dd_mm_yyyy_formats_in_operator_tz() {
        assert_eq!(clock().format_dd_mm_yyyy(EOD_JAN_15), "15/01/2026");
    }

    #[test]
    fn minutes_since_clamps_future_timestamps() {
        let c = clock();
        assert_eq!(c.minutes_since(NOON_JAN_15 + 600), 0.0);
        assert!((c.minutes_since(NOON_JAN_15 - 900) - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(OperatorClock::from_name("America/Nowhere").is_err());
    }

    #[test]
    fn minutes_to_days_uses_1440() {
        assert!((minutes_to_days(1_440.0) - 1.0).abs() < f64::EPSILON);
    }
}
