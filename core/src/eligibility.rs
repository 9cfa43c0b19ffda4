//! Adult status computed at registration.
//!
//! Age is a year difference corrected by month only. The day of the month is
//! ignored, so someone whose birthday falls later in the current month already
//! counts as a year older. The flag is stored once and never refreshed.

use chrono::{Datelike, NaiveDate};

/// Minimum age for the adult flag
pub const ADULT_AGE: i32 = 18;

/// Whole years between `birth_date` and `as_of`, ignoring the day of month
#[must_use]
pub fn age_in_years(birth_date: NaiveDate, as_of: NaiveDate) -> i32 {
    let mut age = as_of.year() - birth_date.year();
    if as_of.month() < birth_date.month() {
        age -= 1;
    }
    age
}

/// Adult flag as stored on the user profile: `1` for adults, `0` otherwise
#[must_use]
pub fn adult_status(birth_date: NaiveDate, as_of: NaiveDate) -> u8 {
    u8::from(age_in_years(birth_date, as_of) >= ADULT_AGE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_exactly_eighteen_years_is_adult() {
        assert_eq!(adult_status(date(2007, 10, 17), date(2025, 10, 17)), 1);
    }

    #[test]
    fn test_day_of_month_is_ignored() {
        // Birthday is two weeks away but falls in the current month.
        assert_eq!(adult_status(date(2007, 10, 31), date(2025, 10, 17)), 1);
        assert_eq!(age_in_years(date(2007, 10, 31), date(2025, 10, 17)), 18);
    }

    #[test]
    fn test_birthday_next_month_is_minor() {
        assert_eq!(adult_status(date(2007, 11, 1), date(2025, 10, 17)), 0);
        assert_eq!(age_in_years(date(2007, 11, 1), date(2025, 10, 17)), 17);
    }

    #[test]
    fn test_older_users_are_adults() {
        assert_eq!(adult_status(date(1990, 12, 31), date(2025, 1, 1)), 1);
    }

    #[test]
    fn test_children_are_minors() {
        assert_eq!(adult_status(date(2015, 1, 1), date(2025, 6, 1)), 0);
    }
}
