//! Inbound request shapes for the aggregation and listing paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, PickFirst, TimestampMilliSeconds};
use std::fmt;

/// Metric name meaning "count everything", never a real event name.
pub const ALL_EVENT: &str = "$all_event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InsightType {
    Internal,
    #[serde(alias = "longTable", alias = "warehouse_long")]
    WarehouseLong,
    #[serde(alias = "wideTable", alias = "warehouse_wide")]
    WarehouseWide,
}

impl InsightType {
    pub fn as_str(self) -> &'static str {
        match self {
            InsightType::Internal => "internal",
            InsightType::WarehouseLong => "warehouse-long",
            InsightType::WarehouseWide => "warehouse-wide",
        }
    }
}

impl fmt::Display for InsightType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightQuery {
    pub insight_id: String,
    pub insight_type: InsightType,
    pub time: TimeSpec,
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSpec {
    #[serde_as(as = "PickFirst<(_, TimestampMilliSeconds<i64>)>")]
    pub start_at: DateTime<Utc>,
    #[serde_as(as = "PickFirst<(_, TimestampMilliSeconds<i64>)>")]
    pub end_at: DateTime<Utc>,
    /// Kept as text so an unknown unit surfaces as `InvalidTimeUnit` at
    /// compile time rather than as a decode error.
    pub unit: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricMath {
    Events,
    Sessions,
}

impl MetricMath {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricMath::Events => "events",
            MetricMath::Sessions => "sessions",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    pub math: MetricMath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Date,
    #[serde(other)]
    Other,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Date => "date",
            ValueType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    pub value: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_groups: Vec<CustomGroupSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomGroupSpec {
    pub filter_operator: String,
    pub filter_value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTimeRange {
    #[serde_as(as = "PickFirst<(_, TimestampMilliSeconds<i64>)>")]
    pub start_at: DateTime<Utc>,
    #[serde_as(as = "PickFirst<(_, TimestampMilliSeconds<i64>)>")]
    pub end_at: DateTime<Utc>,
}

/// Raw event listing request for the internal event table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventListRequest {
    pub insight_id: String,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub time: Option<EventTimeRange>,
}

/// One dense time series in an aggregation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub data: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub items: Vec<serde_json::Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}
