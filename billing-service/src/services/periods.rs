//! Calendar arithmetic for billing periods.

use crate::models::BillingInterval;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};

/// Add whole calendar months, clamping to the last day of shorter months
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(at: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    at.checked_add_months(Months::new(months))
        .unwrap_or(at + Duration::days(30 * i64::from(months)))
}

/// Period bounds `[start, end)` for one interval starting at `start`.
pub fn period_bounds(start: DateTime<Utc>, interval: BillingInterval) -> (DateTime<Utc>, DateTime<Utc>) {
    (start, add_months(start, interval.months()))
}

/// Midnight UTC on the first day of the month containing `at`.
pub fn start_of_month(at: DateTime<Utc>) -> DateTime<Utc> {
    first_of(at.year(), at.month())
}

/// Last representable second of the month containing `at` (23:59:59 on its last day).
pub fn end_of_month(at: DateTime<Utc>) -> DateTime<Utc> {
    next_month_start(at) - Duration::seconds(1)
}

/// Midnight UTC on the first day of the month after the one containing `at`.
pub fn next_month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    if at.month() == 12 {
        first_of(at.year() + 1, 1)
    } else {
        first_of(at.year(), at.month() + 1)
    }
}

/// The calendar month containing `at`, as `(start, end)`.
pub fn calendar_month(at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (start_of_month(at), end_of_month(at))
}

fn first_of(year: i32, month: u32) -> DateTime<Utc> {
    let date = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN);
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 30, 0).unwrap()
    }

    #[test]
    fn add_months_clamps_to_month_end() {
        let jan31 = at(2024, 1, 31);
        assert_eq!(add_months(jan31, 1), at(2024, 2, 29));
        assert_eq!(add_months(jan31, 12), at(2025, 1, 31));
    }

    #[test]
    fn calendar_month_spans_first_to_last_second() {
        let (start, end) = calendar_month(at(2024, 2, 14));
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap());
    }

    #[test]
    fn next_month_wraps_year() {
        assert_eq!(
            next_month_start(at(2024, 12, 5)),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn yearly_period_is_twelve_months() {
        let start = at(2024, 3, 1);
        let (s, e) = period_bounds(start, BillingInterval::Yearly);
        assert_eq!(s, start);
        assert_eq!(e, at(2025, 3, 1));
    }
}
