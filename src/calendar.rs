// =============================================================================
// Exchange Calendar — trading-day checks and time-of-day conversion
// =============================================================================
//
// Pure functions over static holiday tables. NSE and BSE publish the same
// 2026 trading-holiday list; both are kept separately because they diverge in
// other years (muhurat sessions, exchange-specific closures).
// =============================================================================

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use thiserror::Error;

/// NSE trading holidays, 2026.
const NSE_HOLIDAYS: &[&str] = &[
    "2026-01-26", // Republic Day
    "2026-03-14", // Holi
    "2026-03-30", // Ram Navami
    "2026-04-02", // Mahavir Jayanti
    "2026-04-03", // Good Friday
    "2026-04-14", // Ambedkar Jayanti
    "2026-05-01", // Maharashtra Day
    "2026-08-15", // Independence Day
    "2026-08-31", // Ganesh Chaturthi
    "2026-10-02", // Gandhi Jayanti
    "2026-10-20", // Dussehra
    "2026-10-21", // Diwali Balipratipada
    "2026-11-04", // Diwali Laxmi Pujan
    "2026-11-16", // Gurunanak Jayanti
    "2026-12-25", // Christmas
];

/// BSE trading holidays, 2026.
const BSE_HOLIDAYS: &[&str] = &[
    "2026-01-26",
    "2026-03-14",
    "2026-03-30",
    "2026-04-02",
    "2026-04-03",
    "2026-04-14",
    "2026-05-01",
    "2026-08-15",
    "2026-08-31",
    "2026-10-02",
    "2026-10-20",
    "2026-10-21",
    "2026-11-04",
    "2026-11-16",
    "2026-12-25",
];

/// How many calendar days `next_business_day` scans before giving up. Hitting
/// this bound means the holiday table is misconfigured.
const MAX_SCAN_DAYS: i64 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("no trading day within 100 days after {0} on {1}")]
    NoTradingDay(NaiveDate, String),

    #[error("invalid time-of-day '{0}', expected HH:MM")]
    InvalidTimeOfDay(String),
}

fn holidays(exchange: &str) -> &'static [&'static str] {
    match exchange {
        "NSE" => NSE_HOLIDAYS,
        "BSE" => BSE_HOLIDAYS,
        _ => &[],
    }
}

/// Whether `date` is a trading day on `exchange`: not a weekend and not in
/// the exchange's holiday table. Unknown exchanges only observe weekends.
pub fn is_trading_day(date: NaiveDate, exchange: &str) -> bool {
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let key = date.format("%Y-%m-%d").to_string();
    !holidays(exchange).contains(&key.as_str())
}

/// The smallest trading day strictly greater than `date`.
pub fn next_business_day(date: NaiveDate, exchange: &str) -> Result<NaiveDate, CalendarError> {
    let mut current = date;
    for _ in 0..MAX_SCAN_DAYS {
        current += Duration::days(1);
        if is_trading_day(current, exchange) {
            return Ok(current);
        }
    }
    Err(CalendarError::NoTradingDay(date, exchange.to_string()))
}

/// Convert "HH:MM" to seconds since midnight (3600·H + 60·M).
pub fn seconds_since_midnight(hhmm: &str) -> Result<u32, CalendarError> {
    let invalid = || CalendarError::InvalidTimeOfDay(hhmm.to_string());
    let (hours, minutes) = hhmm.split_once(':').ok_or_else(invalid)?;
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if hours >= 24 || minutes >= 60 {
        return Err(invalid());
    }
    Ok(hours * 3600 + minutes * 60)
}
