use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static WEEK_LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})-W(\d{2})$").expect("week label regex")
});

/// One ISO week: `[period_start, period_end)` from Monday 00:00 UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekBucket {
    pub label: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl WeekBucket {
    pub fn containing(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        let monday = NaiveDate::from_isoywd_opt(iso.year(), iso.week(), Weekday::Mon).unwrap_or(date);
        let start = Utc.from_utc_datetime(&monday.and_time(chrono::NaiveTime::MIN));
        Self {
            label: format!("{}-W{:02}", iso.year(), iso.week()),
            period_start: start,
            period_end: start + Duration::days(7),
        }
    }

    pub fn from_label(label: &str) -> AppResult<Self> {
        let (year, week) = parse_week_label(label)?;
        let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
            .ok_or_else(|| AppError::Validation(format!("Week {} does not exist", label)))?;
        Ok(Self::containing(monday))
    }
}

/// Parses `YYYY-Www` into `(iso_year, week)`.
pub fn parse_week_label(label: &str) -> AppResult<(i32, u32)> {
    let captures = WEEK_LABEL_RE
        .captures(label)
        .ok_or_else(|| AppError::Validation(format!("'{}' is not an ISO week label (YYYY-Www)", label)))?;
    let year = captures[1]
        .parse::<i32>()
        .map_err(|err| AppError::Validation(err.to_string()))?;
    let week = captures[2]
        .parse::<u32>()
        .map_err(|err| AppError::Validation(err.to_string()))?;
    if NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).is_none() {
        return Err(AppError::Validation(format!("Week {} does not exist", label)));
    }
    Ok((year, week))
}

/// Longest window a caller may ask for: ten years of weeks.
pub const MAX_WEEKS: usize = 520;

/// The `n` weeks ending with the week that contains `today`, oldest first.
pub fn last_n_weeks(n: usize, today: NaiveDate) -> AppResult<Vec<WeekBucket>> {
    if n > MAX_WEEKS {
        return Err(AppError::Validation(format!(
            "Cannot calculate {} weeks; the limit is {}",
            n, MAX_WEEKS
        )));
    }
    let current = WeekBucket::containing(today);
    (0..n)
        .rev()
        .map(|back| {
            current
                .period_start
                .date_naive()
                .checked_sub_signed(Duration::weeks(back as i64))
                .map(WeekBucket::containing)
                .ok_or_else(|| AppError::Validation(format!("{} weeks before {} is out of range", back, today)))
        })
        .collect()
}
