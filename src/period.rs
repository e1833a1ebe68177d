//! Calendar-aligned usage windows.
//!
//! Every window is a half-open UTC interval `[start, end)`. Offsets are
//! computed by stepping the current window's boundaries back in whole
//! calendar units, never by shifting `now` and re-deriving.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, Duration, Month, OffsetDateTime, UtcOffset};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsagePeriod {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl UsagePeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Yearly => "YEARLY",
        }
    }
}

impl std::str::FromStr for UsagePeriod {
    type Err = PeriodError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            "YEARLY" => Ok(Self::Yearly),
            _ => Err(PeriodError::UnknownPeriod(raw.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum PeriodError {
    #[error("unknown usage period: {0}")]
    UnknownPeriod(String),
    #[error("period window out of range: {0}")]
    OutOfRange(#[from] time::error::ComponentRange),
    #[error("period window falls outside the supported calendar")]
    CalendarOverflow,
}

/// `end == None` marks the lifetime window used by standing limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeriodWindow {
    pub start: OffsetDateTime,
    pub end: Option<OffsetDateTime>,
}

impl PeriodWindow {
    pub fn lifetime() -> Self {
        Self {
            start: OffsetDateTime::UNIX_EPOCH,
            end: None,
        }
    }

    pub fn is_lifetime(&self) -> bool {
        self.end.is_none()
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        at >= self.start && self.end.is_none_or(|end| at < end)
    }
}

pub fn window(period: UsagePeriod, now: OffsetDateTime) -> Result<PeriodWindow, PeriodError> {
    window_with_offset(period, 0, now)
}

pub fn window_with_offset(
    period: UsagePeriod,
    periods_back: u32,
    now: OffsetDateTime,
) -> Result<PeriodWindow, PeriodError> {
    let today = now.to_offset(UtcOffset::UTC).date();
    let back = i64::from(periods_back);

    let (start, end) = match period {
        UsagePeriod::Daily => {
            let start = in_calendar(today.checked_sub(Duration::days(back)))?;
            (start, in_calendar(start.checked_add(Duration::DAY))?)
        }
        UsagePeriod::Weekly => {
            let since_monday = i64::from(today.weekday().number_days_from_monday());
            let monday = in_calendar(today.checked_sub(Duration::days(since_monday)))?;
            let start = in_calendar(monday.checked_sub(Duration::weeks(back)))?;
            (start, in_calendar(start.checked_add(Duration::WEEK))?)
        }
        UsagePeriod::Monthly => {
            let ordinal = month_ordinal(today) - back;
            (month_start(ordinal)?, month_start(ordinal + 1)?)
        }
        UsagePeriod::Yearly => {
            let year = i64::from(today.year()) - back;
            (year_start(year)?, year_start(year + 1)?)
        }
    };

    Ok(PeriodWindow {
        start: start.midnight().assume_utc(),
        end: Some(end.midnight().assume_utc()),
    })
}

/// Features without a period measure against a window that never resets.
pub fn window_for(
    period: Option<UsagePeriod>,
    now: OffsetDateTime,
) -> Result<PeriodWindow, PeriodError> {
    match period {
        Some(period) => window(period, now),
        None => Ok(PeriodWindow::lifetime()),
    }
}

fn in_calendar(date: Option<Date>) -> Result<Date, PeriodError> {
    date.ok_or(PeriodError::CalendarOverflow)
}

fn month_ordinal(date: Date) -> i64 {
    i64::from(date.year()) * 12 + i64::from(u8::from(date.month())) - 1
}

fn month_start(ordinal: i64) -> Result<Date, PeriodError> {
    let year = clamp_year(ordinal.div_euclid(12));
    let month = Month::try_from((ordinal.rem_euclid(12) + 1) as u8)?;
    Ok(Date::from_calendar_date(year, month, 1)?)
}

fn year_start(year: i64) -> Result<Date, PeriodError> {
    Ok(Date::from_calendar_date(clamp_year(year), Month::January, 1)?)
}

// Out-of-range years surface as ComponentRange from the date constructor.
fn clamp_year(year: i64) -> i32 {
    i32::try_from(year).unwrap_or(if year < 0 { i32::MIN } else { i32::MAX })
}
