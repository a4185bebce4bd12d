use super::{
    filter::FilterOperator,
    group::{self, GroupPlan},
};
use crate::{
    error::{Result, ServiceError},
    ident::{validate_component, SafeIdent},
    models::{InsightQuery, InsightType, MetricMath, ValueType, ALL_EVENT},
    time::{parse_timezone, TimeUnit, TimeWindow},
};
use serde_json::Value;
use std::collections::HashMap;

/// A validated aggregation request. Everything that can fail at compile time
/// fails while building this.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub insight_id: String,
    pub insight_type: InsightType,
    pub window: TimeWindow,
    pub buckets: Vec<String>,
    pub metrics: Vec<PlannedMetric>,
    pub filters: Vec<PlannedFilter>,
    pub groups: Vec<GroupPlan>,
}

impl QueryPlan {
    pub fn requests_all_events(&self) -> bool {
        self.metrics.iter().any(PlannedMetric::is_all_event)
    }

    /// Distinct event names of the non-sentinel metrics, in request order.
    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for metric in &self.metrics {
            if !metric.is_all_event() && !names.contains(&metric.name.as_str()) {
                names.push(&metric.name);
            }
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMetric {
    pub name: String,
    pub math: MetricMath,
    pub alias: SafeIdent,
}

impl PlannedMetric {
    pub fn is_all_event(&self) -> bool {
        self.name == ALL_EVENT
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFilter {
    pub field: String,
    pub value_type: ValueType,
    pub operator: FilterOperator,
    pub value: Value,
}

pub fn build_query_plan(query: &InsightQuery, max_buckets: usize) -> Result<QueryPlan> {
    let unit = TimeUnit::parse(&query.time.unit)?;
    let timezone = parse_timezone(&query.time.timezone)?;
    let window = TimeWindow::new(query.time.start_at, query.time.end_at, unit, timezone)?;
    let buckets = window.bucket_labels(max_buckets)?;

    let metrics = plan_metrics(query)?;

    let filters = query
        .filters
        .iter()
        .map(|filter| {
            validate_component(&filter.name)?;
            Ok(PlannedFilter {
                field: filter.name.clone(),
                value_type: filter.value_type,
                operator: FilterOperator::parse(&filter.operator, filter.value_type)?,
                value: filter.value.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let groups = query
        .groups
        .iter()
        .map(group::describe)
        .collect::<Result<Vec<_>>>()?;
    group::ensure_distinct(&groups)?;

    Ok(QueryPlan {
        insight_id: query.insight_id.clone(),
        insight_type: query.insight_type,
        window,
        buckets,
        metrics,
        filters,
        groups,
    })
}

fn plan_metrics(query: &InsightQuery) -> Result<Vec<PlannedMetric>> {
    if query.metrics.is_empty() {
        return Err(ServiceError::invalid("at least one metric is required"));
    }

    let mut maths: HashMap<&str, Vec<MetricMath>> = HashMap::new();
    for metric in &query.metrics {
        let seen = maths.entry(metric.name.as_str()).or_default();
        if seen.contains(&metric.math) {
            return Err(ServiceError::invalid(format!(
                "metric '{}' ({}) requested twice",
                metric.name,
                metric.math.as_str()
            )));
        }
        seen.push(metric.math);
    }

    query
        .metrics
        .iter()
        .map(|metric| {
            let label = if maths[metric.name.as_str()].len() > 1 {
                format!("{} ({})", metric.name, metric.math.as_str())
            } else {
                metric.name.clone()
            };
            if label.eq_ignore_ascii_case("date") {
                return Err(ServiceError::invalid("'date' cannot be used as a metric name"));
            }
            Ok(PlannedMetric {
                name: metric.name.clone(),
                math: metric.math,
                alias: SafeIdent::new(&label)?,
            })
        })
        .collect()
}
