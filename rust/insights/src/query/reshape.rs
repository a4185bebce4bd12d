//! Turns sparse aggregation rows into dense, ordered series.

use super::{
    group::{bucket_selections, GroupKey, GroupPlan, ProjectionExpr, GROUP_PREFIX},
    plan::QueryPlan,
};
use crate::{
    error::{Result, ServiceError},
    models::{Series, SeriesPoint},
    store::RawRow,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub const NULL_LABEL: &str = "(null)";

/// Sort key of one group value within a combination. Custom buckets keep
/// their declaration order, raw values sort lexically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Custom(usize),
    Raw(String),
}

struct Combination {
    labels: Vec<String>,
    /// Per metric: bucket date to summed value.
    values: Vec<HashMap<String, f64>>,
}

pub fn reshape(plan: &QueryPlan, rows: Vec<RawRow>) -> Result<Vec<Series>> {
    let null = Value::Null;
    let known_aliases: HashSet<&str> = plan
        .groups
        .iter()
        .flat_map(|group| &group.projections)
        .map(|projection| projection.alias.as_str())
        .collect();

    let mut dates: BTreeSet<String> = plan.buckets.iter().cloned().collect();
    let mut combinations: BTreeMap<Vec<KeyPart>, Combination> = BTreeMap::new();

    // Without raw groups every combination is known up front.
    if plan.groups.iter().all(GroupPlan::is_custom) {
        for selection in bucket_selections(&plan.groups) {
            let (key, labels): (Vec<KeyPart>, Vec<String>) = plan
                .groups
                .iter()
                .zip(selection)
                .filter_map(|(group, pinned)| {
                    let index = pinned?;
                    let label = group.projections.get(index)?.bucket_label()?;
                    Some((KeyPart::Custom(index), label))
                })
                .unzip();
            combinations.insert(
                key,
                Combination {
                    labels,
                    values: vec![HashMap::new(); plan.metrics.len()],
                },
            );
        }
    }

    for row in &rows {
        let Some(date) = row.get("date").and_then(label_of) else {
            continue;
        };

        for column in row.keys().filter(|key| key.starts_with(GROUP_PREFIX)) {
            let decodes = GroupKey::decode(column).is_some();
            if !decodes || !known_aliases.contains(column.as_str()) {
                return Err(ServiceError::Internal(anyhow::anyhow!(
                    "unexpected group column '{column}' in result"
                )));
            }
        }

        let per_group = plan
            .groups
            .iter()
            .map(|group| {
                group
                    .projections
                    .iter()
                    .enumerate()
                    .filter_map(|(index, projection)| {
                        let cell = row.get(projection.alias.as_str()).unwrap_or(&null);
                        match &projection.expr {
                            ProjectionExpr::Column => {
                                let label = label_of(cell).unwrap_or_else(|| NULL_LABEL.into());
                                Some((KeyPart::Raw(label.clone()), label))
                            }
                            ProjectionExpr::Bucket { .. } => is_flag_set(cell).then(|| {
                                (
                                    KeyPart::Custom(index),
                                    projection.bucket_label().unwrap_or_default(),
                                )
                            }),
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        for combo in cartesian(&per_group) {
            let (key, labels): (Vec<KeyPart>, Vec<String>) = combo.into_iter().unzip();
            let entry = combinations.entry(key).or_insert_with(|| Combination {
                labels,
                values: vec![HashMap::new(); plan.metrics.len()],
            });
            for (metric_index, metric) in plan.metrics.iter().enumerate() {
                let value = row.get(metric.alias.as_str()).map(number_of).unwrap_or(0.0);
                *entry.values[metric_index].entry(date.clone()).or_insert(0.0) += value;
            }
        }
        dates.insert(date);
    }

    let mut series = Vec::with_capacity(plan.metrics.len() * combinations.len());
    for (metric_index, metric) in plan.metrics.iter().enumerate() {
        for combination in combinations.values() {
            let mut name = metric.alias.as_str().to_string();
            for label in &combination.labels {
                name.push('-');
                name.push_str(label);
            }
            let values = &combination.values[metric_index];
            let data = dates
                .iter()
                .map(|date| SeriesPoint {
                    date: date.clone(),
                    value: values.get(date).copied().unwrap_or(0.0),
                })
                .collect();
            series.push(Series { name, data });
        }
    }
    Ok(series)
}

fn cartesian(groups: &[Vec<(KeyPart, String)>]) -> Vec<Vec<(KeyPart, String)>> {
    groups.iter().fold(vec![Vec::new()], |acc, options| {
        acc.iter()
            .flat_map(|prefix| {
                options.iter().map(move |option| {
                    let mut next = prefix.clone();
                    next.push(option.clone());
                    next
                })
            })
            .collect()
    })
}

fn label_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn number_of(value: &Value) -> f64 {
    match value {
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(text) => text.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn is_flag_set(value: &Value) -> bool {
    match value {
        Value::Number(number) => number.as_f64() == Some(1.0),
        Value::String(text) => text == "1",
        Value::Bool(flag) => *flag,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InsightQuery;
    use crate::query::plan::build_query_plan;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn plan(metrics: Value, groups: Value) -> QueryPlan {
        let query: InsightQuery = serde_json::from_value(json!({
            "insightId": "site",
            "insightType": "internal",
            "time": {
                "startAt": "2025-08-01T00:00:00Z",
                "endAt": "2025-08-04T00:00:00Z",
                "unit": "day",
                "timezone": "UTC"
            },
            "metrics": metrics,
            "groups": groups
        }))
        .unwrap();
        build_query_plan(&query, 100).unwrap()
    }

    fn rows(values: Value) -> Vec<RawRow> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row.as_object().cloned().unwrap())
            .collect()
    }

    fn points(series: &Series) -> Vec<(&str, f64)> {
        series
            .data
            .iter()
            .map(|point| (point.date.as_str(), point.value))
            .collect()
    }

    #[test]
    fn fills_missing_buckets_with_zero() {
        let plan = plan(json!([{"name": "$all_event", "math": "events"}]), json!([]));
        let series = reshape(&plan, rows(json!([{"date": "2025-08-02", "$all_event": 4}]))).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name, "$all_event");
        assert_eq!(
            points(&series[0]),
            vec![("2025-08-01", 0.0), ("2025-08-02", 4.0), ("2025-08-03", 0.0)]
        );
    }

    #[test]
    fn every_metric_has_a_series_without_rows() {
        let plan = plan(
            json!([{"name": "a", "math": "events"}, {"name": "b", "math": "sessions"}]),
            json!([]),
        );
        let series = reshape(&plan, Vec::new()).unwrap();
        let names: Vec<_> = series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(series.iter().all(|s| s.data.len() == 3));
    }

    #[test]
    fn raw_groups_split_and_sort_series() {
        let plan = plan(
            json!([{"name": "$all_event", "math": "events"}]),
            json!([{"value": "os", "type": "string"}, {"value": "country", "type": "string"}]),
        );
        let series = reshape(
            &plan,
            rows(json!([
                {"date": "2025-08-01", "$all_event": 2, "%os": "mac", "%country": "DE"},
                {"date": "2025-08-02", "$all_event": 1, "%os": "linux", "%country": null},
                {"date": "2025-08-03", "$all_event": 5, "%os": "mac", "%country": "DE"}
            ])),
        )
        .unwrap();
        let names: Vec<_> = series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["$all_event-linux-(null)", "$all_event-mac-DE"]);
        assert_eq!(
            points(&series[1]),
            vec![("2025-08-01", 2.0), ("2025-08-02", 0.0), ("2025-08-03", 5.0)]
        );
    }

    #[test]
    fn custom_buckets_follow_declaration_order() {
        let plan = plan(
            json!([{"name": "purchase", "math": "events"}]),
            json!([{
                "value": "amount",
                "type": "number",
                "customGroups": [
                    {"filterOperator": "less than", "filterValue": 10},
                    {"filterOperator": "greater than or equal", "filterValue": 10}
                ]
            }]),
        );
        let series = reshape(
            &plan,
            rows(json!([
                {"date": "2025-08-01", "purchase": 3, "%amount|less-than|10": 1, "%amount|greater-than-or-equal|10": 0},
                {"date": "2025-08-01", "purchase": 2, "%amount|less-than|10": 0, "%amount|greater-than-or-equal|10": 1},
                {"date": "2025-08-02", "purchase": 7, "%amount|less-than|10": 0, "%amount|greater-than-or-equal|10": 0}
            ])),
        )
        .unwrap();
        let names: Vec<_> = series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "purchase-less-than 10",
                "purchase-greater-than-or-equal 10"
            ]
        );
        assert_eq!(points(&series[0])[0], ("2025-08-01", 3.0));
        assert_eq!(points(&series[1])[0], ("2025-08-01", 2.0));
        assert_eq!(points(&series[1])[1], ("2025-08-02", 0.0));
    }

    #[test]
    fn custom_buckets_without_rows_still_have_series() {
        let plan = plan(
            json!([{"name": "$all_event", "math": "sessions"}]),
            json!([{
                "value": "url_path",
                "type": "string",
                "customGroups": [
                    {"filterOperator": "contains", "filterValue": "o"},
                    {"filterOperator": "contains", "filterValue": "c"}
                ]
            }]),
        );
        let series = reshape(&plan, Vec::new()).unwrap();
        let names: Vec<_> = series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["$all_event-contains o", "$all_event-contains c"]
        );
        assert!(series
            .iter()
            .all(|s| s.data.len() == 3 && s.data.iter().all(|p| p.value == 0.0)));
    }

    #[test]
    fn raw_groups_without_rows_have_no_series() {
        let plan = plan(
            json!([{"name": "$all_event", "math": "events"}]),
            json!([{"value": "os", "type": "string"}]),
        );
        assert!(reshape(&plan, Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn unknown_group_columns_are_rejected() {
        let plan = plan(json!([{"name": "$all_event", "math": "events"}]), json!([]));
        let result = reshape(
            &plan,
            rows(json!([{"date": "2025-08-01", "$all_event": 1, "%stray": "x"}])),
        );
        assert!(matches!(result, Err(ServiceError::Internal(_))));
    }
}
