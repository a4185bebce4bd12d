//! Time windows, bucket units and timezone handling.

use crate::error::{Result, ServiceError};
use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike,
    Utc,
};
use chrono_tz::Tz;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl TimeUnit {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "minute" => Ok(TimeUnit::Minute),
            "hour" => Ok(TimeUnit::Hour),
            "day" => Ok(TimeUnit::Day),
            "month" => Ok(TimeUnit::Month),
            "year" => Ok(TimeUnit::Year),
            _ => Err(ServiceError::InvalidTimeUnit(raw.to_string())),
        }
    }

    pub fn is_sub_day(self) -> bool {
        matches!(self, TimeUnit::Minute | TimeUnit::Hour)
    }

    /// chrono format of the canonical bucket label.
    pub fn label_format(self) -> &'static str {
        match self {
            TimeUnit::Minute => "%Y-%m-%d %H:%M:00",
            TimeUnit::Hour => "%Y-%m-%d %H:00:00",
            TimeUnit::Day => "%Y-%m-%d",
            TimeUnit::Month => "%Y-%m-01",
            TimeUnit::Year => "%Y-01-01",
        }
    }

    fn truncate(self, local: NaiveDateTime) -> NaiveDateTime {
        let date = local.date();
        let midnight = |d: NaiveDate| d.and_hms_opt(0, 0, 0).unwrap_or(local);
        match self {
            TimeUnit::Minute => local
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(local),
            TimeUnit::Hour => local
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(local),
            TimeUnit::Day => midnight(date),
            TimeUnit::Month => midnight(date.with_day(1).unwrap_or(date)),
            TimeUnit::Year => midnight(
                NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
            ),
        }
    }

    fn step(self, local: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            TimeUnit::Minute => local.checked_add_signed(Duration::minutes(1)),
            TimeUnit::Hour => local.checked_add_signed(Duration::hours(1)),
            TimeUnit::Day => local.checked_add_signed(Duration::days(1)),
            TimeUnit::Month => local.checked_add_months(Months::new(1)),
            TimeUnit::Year => local.checked_add_months(Months::new(12)),
        }
    }
}

/// Half-open `[start, end)` request window in a named timezone.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub unit: TimeUnit,
    pub timezone: Tz,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, unit: TimeUnit, timezone: Tz) -> Result<Self> {
        if start > end {
            return Err(ServiceError::invalid("time range start must be before end"));
        }
        Ok(Self {
            start,
            end,
            unit,
            timezone,
        })
    }

    pub fn spans_full_day(&self) -> bool {
        self.end.signed_duration_since(self.start) >= Duration::days(1)
    }

    /// Both bounds fall on local midnight.
    pub fn is_day_aligned(&self) -> bool {
        [self.start, self.end].iter().all(|instant| {
            let local = instant.with_timezone(&self.timezone);
            local.num_seconds_from_midnight() == 0 && local.nanosecond() == 0
        })
    }

    /// Fixed offset of the window start, used by stores without a timezone
    /// database.
    pub fn utc_offset_minutes(&self) -> i32 {
        self.timezone
            .offset_from_utc_datetime(&self.start.naive_utc())
            .fix()
            .local_minus_utc()
            / 60
    }

    /// Local calendar dates of the first and last instant in the window.
    pub fn local_date_bounds(&self) -> (NaiveDate, NaiveDate) {
        let first = self.start.with_timezone(&self.timezone).date_naive();
        let last_instant = if self.end > self.start {
            self.end - Duration::milliseconds(1)
        } else {
            self.end
        };
        let last = last_instant.with_timezone(&self.timezone).date_naive();
        (first, last)
    }

    /// Every bucket label the window covers, in order.
    pub fn bucket_labels(&self, max_buckets: usize) -> Result<Vec<String>> {
        if self.start == self.end {
            return Ok(Vec::new());
        }

        let format = self.unit.label_format();
        let first = self
            .unit
            .truncate(self.start.with_timezone(&self.timezone).naive_local());
        let last_instant = (self.end - Duration::milliseconds(1))
            .with_timezone(&self.timezone)
            .naive_local();

        let mut labels = Vec::new();
        let mut cursor = first;
        while cursor <= last_instant {
            if labels.len() >= max_buckets {
                return Err(ServiceError::invalid(format!(
                    "time range produces more than {max_buckets} buckets; use a coarser unit"
                )));
            }
            labels.push(cursor.format(format).to_string());
            cursor = match self.unit.step(cursor) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(labels)
    }
}

pub fn parse_timezone(raw: &str) -> Result<Tz> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Tz::UTC);
    }
    trimmed
        .parse::<Tz>()
        .map_err(|_| ServiceError::InvalidTimezone(raw.to_string()))
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD` (UTC midnight) and
/// epoch milliseconds.
pub fn parse_instant(value: &serde_json::Value) -> Result<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(number) => number
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| ServiceError::invalid(format!("invalid epoch milliseconds {number}"))),
        serde_json::Value::String(raw) => parse_instant_str(raw),
        other => Err(ServiceError::invalid(format!("expected a date value, got {other}"))),
    }
}

fn parse_instant_str(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
        }
    }
    Err(ServiceError::invalid(format!("invalid date literal '{raw}'")))
}
