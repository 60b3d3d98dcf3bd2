//! US equity session calendar, evaluated in America/New_York.
use crate::config::CalendarConfig;
use crate::model::RejectReason;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const PREMARKET_OPEN_MIN: u32 = 4 * 60;
const REGULAR_OPEN_MIN: u32 = 9 * 60 + 30;
const REGULAR_CLOSE_MIN: u32 = 16 * 60;
const AFTERHOURS_CLOSE_MIN: u32 = 20 * 60;

/// Full-day NYSE closures.
const NYSE_HOLIDAYS: &[(i32, u32, u32)] = &[
    (2023, 1, 2),
    (2023, 1, 16),
    (2023, 2, 20),
    (2023, 4, 7),
    (2023, 5, 29),
    (2023, 6, 19),
    (2023, 7, 4),
    (2023, 9, 4),
    (2023, 11, 23),
    (2023, 12, 25),
    (2024, 1, 1),
    (2024, 1, 15),
    (2024, 2, 19),
    (2024, 3, 29),
    (2024, 5, 27),
    (2024, 6, 19),
    (2024, 7, 4),
    (2024, 9, 2),
    (2024, 11, 28),
    (2024, 12, 25),
    (2025, 1, 1),
    (2025, 1, 9),
    (2025, 1, 20),
    (2025, 2, 17),
    (2025, 4, 18),
    (2025, 5, 26),
    (2025, 6, 19),
    (2025, 7, 4),
    (2025, 9, 1),
    (2025, 11, 27),
    (2025, 12, 25),
    (2026, 1, 1),
    (2026, 1, 19),
    (2026, 2, 16),
    (2026, 4, 3),
    (2026, 5, 25),
    (2026, 6, 19),
    (2026, 7, 3),
    (2026, 9, 7),
    (2026, 11, 26),
    (2026, 12, 25),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketSession {
    Closed,
    PreMarket,
    Regular,
    AfterHours,
}

impl MarketSession {
    pub fn is_extended(&self) -> bool {
        matches!(self, MarketSession::PreMarket | MarketSession::AfterHours)
    }
}

#[derive(Debug, Clone)]
pub struct MarketCalendar {
    enforce: bool,
    holidays: HashSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn new(cfg: &CalendarConfig) -> Self {
        let mut holidays: HashSet<NaiveDate> = cfg.holidays.iter().copied().collect();
        if cfg.use_default_holidays {
            holidays.extend(
                NYSE_HOLIDAYS
                    .iter()
                    .filter_map(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            );
        }
        Self {
            enforce: cfg.enforce_market_hours,
            holidays,
        }
    }

    fn local(ts_ns: i64) -> DateTime<Tz> {
        Utc.timestamp_nanos(ts_ns).with_timezone(&New_York)
    }

    /// Calendar date in New York; the unit DAY orders and SSR are scoped to.
    pub fn trading_day(ts_ns: i64) -> NaiveDate {
        Self::local(ts_ns).date_naive()
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    pub fn session_at(&self, ts_ns: i64) -> MarketSession {
        if !self.enforce {
            return MarketSession::Regular;
        }
        let local = Self::local(ts_ns);
        if !self.is_trading_day(local.date_naive()) {
            return MarketSession::Closed;
        }
        let minute = local.hour() * 60 + local.minute();
        match minute {
            m if m < PREMARKET_OPEN_MIN => MarketSession::Closed,
            m if m < REGULAR_OPEN_MIN => MarketSession::PreMarket,
            m if m < REGULAR_CLOSE_MIN => MarketSession::Regular,
            m if m < AFTERHOURS_CLOSE_MIN => MarketSession::AfterHours,
            _ => MarketSession::Closed,
        }
    }

    /// Admission rule: regular hours take anything, extended hours only
    /// orders flagged for them.
    pub fn check_admission(&self, ts_ns: i64, extended_hours: bool) -> Result<(), RejectReason> {
        match self.session_at(ts_ns) {
            MarketSession::Regular => Ok(()),
            MarketSession::PreMarket | MarketSession::AfterHours if extended_hours => Ok(()),
            MarketSession::PreMarket | MarketSession::AfterHours => {
                Err(RejectReason::ExtendedHoursNotAllowed)
            }
            MarketSession::Closed => Err(RejectReason::MarketClosed),
        }
    }

    /// Whether a resting order may execute at `ts_ns`.
    pub fn can_execute(&self, ts_ns: i64, extended_hours: bool) -> bool {
        self.check_admission(ts_ns, extended_hours).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap()
    }

    #[test]
    fn test_sessions_on_a_trading_day() {
        let cal = MarketCalendar::new(&CalendarConfig::default());
        // 2024-03-12 is a Tuesday, EDT (UTC-4).
        assert_eq!(cal.session_at(ns(2024, 3, 12, 7, 59)), MarketSession::Closed);
        assert_eq!(cal.session_at(ns(2024, 3, 12, 8, 0)), MarketSession::PreMarket);
        assert_eq!(cal.session_at(ns(2024, 3, 12, 13, 30)), MarketSession::Regular);
        assert_eq!(cal.session_at(ns(2024, 3, 12, 20, 0)), MarketSession::AfterHours);
        assert_eq!(cal.session_at(ns(2024, 3, 13, 0, 0)), MarketSession::Closed);
    }

    #[test]
    fn test_standard_time_offset() {
        let cal = MarketCalendar::new(&CalendarConfig::default());
        // 2024-01-10, EST (UTC-5): 14:30 UTC is the open.
        assert_eq!(cal.session_at(ns(2024, 1, 10, 14, 29)), MarketSession::PreMarket);
        assert_eq!(cal.session_at(ns(2024, 1, 10, 14, 30)), MarketSession::Regular);
    }

    #[test]
    fn test_weekends_and_holidays_closed() {
        let cal = MarketCalendar::new(&CalendarConfig::default());
        assert_eq!(cal.session_at(ns(2024, 3, 16, 15, 0)), MarketSession::Closed);
        assert_eq!(cal.session_at(ns(2024, 7, 4, 15, 0)), MarketSession::Closed);

        let custom = CalendarConfig {
            use_default_holidays: false,
            holidays: vec![NaiveDate::from_ymd_opt(2024, 3, 12).unwrap()],
            ..Default::default()
        };
        let cal = MarketCalendar::new(&custom);
        assert_eq!(cal.session_at(ns(2024, 3, 12, 15, 0)), MarketSession::Closed);
        assert_eq!(cal.session_at(ns(2024, 7, 4, 15, 0)), MarketSession::Regular);
    }

    #[test]
    fn test_extended_hours_admission() {
        let cal = MarketCalendar::new(&CalendarConfig::default());
        let premarket = ns(2024, 3, 12, 12, 0);
        assert_eq!(
            cal.check_admission(premarket, false),
            Err(RejectReason::ExtendedHoursNotAllowed)
        );
        assert!(cal.check_admission(premarket, true).is_ok());
        assert_eq!(
            cal.check_admission(ns(2024, 3, 16, 15, 0), true),
            Err(RejectReason::MarketClosed)
        );
    }

    #[test]
    fn test_unenforced_calendar_is_always_open() {
        let cal = MarketCalendar::new(&CalendarConfig {
            enforce_market_hours: false,
            ..Default::default()
        });
        assert_eq!(cal.session_at(0), MarketSession::Regular);
    }

    #[test]
    fn test_trading_day_uses_new_york_date() {
        // 02:00 UTC on the 13th is still the 12th in New York.
        assert_eq!(
            MarketCalendar::trading_day(ns(2024, 3, 13, 2, 0)),
            NaiveDate::from_ymd_opt(2024, 3, 12).unwrap()
        );
    }
}
