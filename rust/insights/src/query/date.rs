//! Date bucketing: encoding-aware truncation to a bucket label, the time range
//! predicate, and the switch to a pre-computed date column.

use crate::{
    sql::{BindParam, Dialect, Fragment},
    time::{TimeUnit, TimeWindow},
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// How a source table stores its event time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimestampEncoding {
    /// Epoch seconds.
    Timestamp,
    /// Epoch milliseconds.
    TimestampMs,
    /// Calendar date string, already local.
    Date,
    /// Naive `YYYY-MM-DD HH:MM:SS` string in UTC.
    #[default]
    Datetime,
}

/// The event time column of a source, with its optional date-based twin.
/// `date_zone` is the zone whose calendar the twin's dates are in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateSource {
    pub column: String,
    pub encoding: TimestampEncoding,
    pub date_column: Option<String>,
    pub date_zone: Tz,
}

impl DateSource {
    pub fn new(column: String, encoding: TimestampEncoding, date_column: Option<String>) -> Self {
        Self {
            column,
            encoding,
            date_column,
            date_zone: Tz::UTC,
        }
    }

    pub fn with_date_zone(mut self, zone: Tz) -> Self {
        self.date_zone = zone;
        self
    }

    /// The date column is read only when it selects exactly the rows of the
    /// precise column: a window of whole local days in the column's own zone,
    /// bucketed by day, month or year.
    pub fn use_date_column(&self, window: &TimeWindow) -> bool {
        self.date_column.is_some()
            && !window.unit.is_sub_day()
            && window.spans_full_day()
            && window.timezone == self.date_zone
            && window.is_day_aligned()
    }

    /// Bucket label expression, without alias.
    pub fn bucket_expr(&self, dialect: Dialect, window: &TimeWindow) -> String {
        match (&self.date_column, self.use_date_column(window)) {
            (Some(date_column), true) => {
                bucket(dialect, date_column, window, TimestampEncoding::Date)
            }
            _ => bucket(dialect, &self.column, window, self.encoding),
        }
    }

    pub fn range(&self, dialect: Dialect, window: &TimeWindow) -> Fragment {
        match (&self.date_column, self.use_date_column(window)) {
            (Some(date_column), true) => {
                range_predicate(dialect, date_column, window, TimestampEncoding::Date)
            }
            _ => range_predicate(dialect, &self.column, window, self.encoding),
        }
    }
}

/// Converts `column` to the window's local time and formats the bucket label.
pub fn bucket(
    dialect: Dialect,
    column: &str,
    window: &TimeWindow,
    encoding: TimestampEncoding,
) -> String {
    match dialect {
        Dialect::Postgres => {
            let local = postgres_local(column, window, encoding);
            format!("to_char({local}, '{}')", postgres_label_format(window.unit))
        }
        Dialect::Sqlite => {
            let local = sqlite_local(column, window, encoding);
            format!("strftime('{}', {local})", window.unit.label_format())
        }
    }
}

fn postgres_local(column: &str, window: &TimeWindow, encoding: TimestampEncoding) -> String {
    let tz = window.timezone.name();
    match encoding {
        TimestampEncoding::Timestamp => format!("(to_timestamp({column}) AT TIME ZONE '{tz}')"),
        TimestampEncoding::TimestampMs => {
            format!("(to_timestamp({column} / 1000.0) AT TIME ZONE '{tz}')")
        }
        TimestampEncoding::Datetime => {
            format!("((CAST({column} AS timestamp) AT TIME ZONE 'UTC') AT TIME ZONE '{tz}')")
        }
        TimestampEncoding::Date => format!("CAST({column} AS date)"),
    }
}

fn sqlite_local(column: &str, window: &TimeWindow, encoding: TimestampEncoding) -> String {
    let shift = format!("'{:+} minutes'", window.utc_offset_minutes());
    match encoding {
        TimestampEncoding::Timestamp => format!("datetime({column}, 'unixepoch', {shift})"),
        TimestampEncoding::TimestampMs => {
            format!("datetime({column} / 1000, 'unixepoch', {shift})")
        }
        TimestampEncoding::Datetime => format!("datetime({column}, {shift})"),
        TimestampEncoding::Date => format!("date({column})"),
    }
}

fn postgres_label_format(unit: TimeUnit) -> &'static str {
    match unit {
        TimeUnit::Minute => "YYYY-MM-DD HH24:MI:00",
        TimeUnit::Hour => "YYYY-MM-DD HH24:00:00",
        TimeUnit::Day => "YYYY-MM-DD",
        TimeUnit::Month => "YYYY-MM-01",
        TimeUnit::Year => "YYYY-01-01",
    }
}

/// Half-open window predicate on `column`. Date columns compare inclusive
/// local calendar dates instead.
pub fn range_predicate(
    dialect: Dialect,
    column: &str,
    window: &TimeWindow,
    encoding: TimestampEncoding,
) -> Fragment {
    match encoding {
        TimestampEncoding::Timestamp => Fragment::bound(
            format!("{column} >= ? AND {column} < ?"),
            vec![
                BindParam::Int(window.start.timestamp()),
                BindParam::Int(ceil_seconds(window.end)),
            ],
        ),
        TimestampEncoding::TimestampMs => Fragment::bound(
            format!("{column} >= ? AND {column} < ?"),
            vec![
                BindParam::Int(window.start.timestamp_millis()),
                BindParam::Int(ceil_millis(window.end)),
            ],
        ),
        TimestampEncoding::Datetime => {
            let lhs = dialect.cast_timestamp(column);
            let rhs = dialect.cast_timestamp("?");
            Fragment::bound(
                format!("{lhs} >= {rhs} AND {lhs} < {rhs}"),
                vec![
                    BindParam::Text(naive_utc(window.start)),
                    BindParam::Text(naive_utc(window.end)),
                ],
            )
        }
        TimestampEncoding::Date => {
            let (first, last) = window.local_date_bounds();
            let lhs = dialect.cast_date(column);
            let rhs = dialect.cast_date("?");
            Fragment::bound(
                format!("{lhs} >= {rhs} AND {lhs} <= {rhs}"),
                vec![
                    BindParam::Text(first.format("%Y-%m-%d").to_string()),
                    BindParam::Text(last.format("%Y-%m-%d").to_string()),
                ],
            )
        }
    }
}

fn naive_utc(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn ceil_seconds(instant: DateTime<Utc>) -> i64 {
    let seconds = instant.timestamp();
    if instant.timestamp_subsec_nanos() > 0 {
        seconds + 1
    } else {
        seconds
    }
}

fn ceil_millis(instant: DateTime<Utc>) -> i64 {
    let millis = instant.timestamp_millis();
    if instant.timestamp_subsec_nanos() % 1_000_000 > 0 {
        millis + 1
    } else {
        millis
    }
}
