use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use std::str::FromStr;

pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .checked_sub_days(Days::new(1))
        .unwrap()
}

pub fn first_day_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap()
}

/// Parses an amount in the exchange format's decimal-comma convention
/// ("1234,56", optionally with "." as thousands separator) to 2-decimal
/// precision. Plain decimal-point input is accepted as well.
pub fn parse_exchange_amount(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = if cleaned.contains(',') {
        // "." can only be a thousands separator when "," is the decimal mark
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };

    Decimal::from_str(&normalized).ok().map(|d| d.round_dp(2))
}

/// Whether an amount rounds to zero at the 2-decimal reporting precision.
pub fn is_zero_at_reporting_precision(amount: Decimal) -> bool {
    amount.round_dp(2).is_zero()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(
            last_day_of_month(2023, 2),
            NaiveDate::from_ymd_opt(2023, 2, 28).unwrap()
        );
        assert_eq!(
            last_day_of_month(2024, 2),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            last_day_of_month(2020, 12),
            NaiveDate::from_ymd_opt(2020, 12, 31).unwrap()
        );
    }

    #[test]
    fn test_parse_exchange_amount() {
        assert_eq!(parse_exchange_amount("1,00"), Some(Decimal::new(100, 2)));
        assert_eq!(
            parse_exchange_amount("1.234,56"),
            Some(Decimal::new(123456, 2))
        );
        assert_eq!(parse_exchange_amount("-5,25"), Some(Decimal::new(-525, 2)));
        assert_eq!(parse_exchange_amount("10"), Some(Decimal::new(1000, 2)));
        assert_eq!(parse_exchange_amount("2.50"), Some(Decimal::new(250, 2)));
        assert_eq!(parse_exchange_amount(""), None);
        assert_eq!(parse_exchange_amount("abc"), None);
    }

    #[test]
    fn test_parse_exchange_amount_rounds_to_two_decimals() {
        assert_eq!(parse_exchange_amount("1,006"), Some(Decimal::new(101, 2)));
        assert_eq!(parse_exchange_amount("1,004"), Some(Decimal::new(100, 2)));
    }

    #[test]
    fn test_zero_at_reporting_precision() {
        assert!(is_zero_at_reporting_precision(Decimal::ZERO));
        assert!(is_zero_at_reporting_precision(Decimal::new(4, 3)));
        assert!(!is_zero_at_reporting_precision(Decimal::new(1, 2)));
        assert!(!is_zero_at_reporting_precision(Decimal::new(-1, 2)));
    }
}
