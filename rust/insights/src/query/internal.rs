//! Builder for the internal long-format `website_event` table.

use super::{
    date::{DateSource, TimestampEncoding},
    event_name_predicate,
    filter::{self, ColumnExpr},
    group::GroupPlan,
    metric_select,
    plan::{PlannedFilter, QueryPlan},
    InsightsSqlBuilder, MetricColumns,
};
use crate::{
    error::{Result, ServiceError},
    ident::SafeIdent,
    models::{EventListRequest, InsightType},
    pagination::KeysetQuery,
    sql::{BindParam, Dialect, Fragment},
    store::Store,
    time::{TimeUnit, TimeWindow},
};
use chrono_tz::Tz;

pub const EVENT_TABLE: &str = "website_event";
const ALIAS: &str = "e";

const WEBSITE_ID: &str = "website_id";
const SESSION_ID: &str = "session_id";
const EVENT_NAME: &str = "event_name";
const CREATED_AT: &str = "created_at";
const CREATED_DATE: &str = "created_date";
const CURSOR: &str = "id";

/// Columns that filters and groups may reference.
pub const DIMENSIONS: &[&str] = &[
    "url_path",
    "url_query",
    "referrer_domain",
    "page_title",
    "hostname",
    "browser",
    "os",
    "device",
    "screen",
    "language",
    "country",
    "subdivision1",
    "city",
];

fn alias() -> SafeIdent {
    SafeIdent::trusted(ALIAS)
}

fn column(name: &str) -> String {
    SafeIdent::trusted(name).qualified(&alias())
}

fn relation() -> String {
    format!("{} AS {}", SafeIdent::trusted(EVENT_TABLE).quoted(), alias().quoted())
}

fn dimension(field: &str) -> Result<ColumnExpr> {
    let name = DIMENSIONS
        .iter()
        .find(|candidate| **candidate == field)
        .ok_or_else(|| ServiceError::invalid(format!("unknown field '{field}' for internal insights")))?;
    Ok(ColumnExpr::native(column(name)))
}

fn website_scope(insight_id: &str) -> Fragment {
    Fragment::bound(
        format!("{} = ?", column(WEBSITE_ID)),
        vec![BindParam::Text(insight_id.to_string())],
    )
}

fn filter_predicates(dialect: Dialect, filters: &[PlannedFilter]) -> Result<Vec<Fragment>> {
    filters
        .iter()
        .map(|f| {
            let column = dimension(&f.field)?;
            filter::compile(dialect, f.value_type, f.operator, &f.value, &column)
        })
        .collect()
}

pub struct InternalBuilder {
    plan: QueryPlan,
    store: Store,
    date: DateSource,
}

impl InternalBuilder {
    pub fn new(plan: QueryPlan, store: Store) -> Self {
        let date = DateSource::new(
            column(CREATED_AT),
            TimestampEncoding::Datetime,
            Some(column(CREATED_DATE)),
        );
        Self { plan, store, date }
    }
}

impl InsightsSqlBuilder for InternalBuilder {
    fn backend(&self) -> InsightType {
        InsightType::Internal
    }

    fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    fn store(&self) -> &Store {
        &self.store
    }

    fn build_select_clause(&self) -> Result<Fragment> {
        let event_name = column(EVENT_NAME);
        let session = column(SESSION_ID);
        metric_select(
            &self.plan,
            MetricColumns {
                event_name: Some(event_name.as_str()),
                session: Some(session.as_str()),
                event_id: None,
            },
        )
    }

    fn group_column(&self, _index: usize, group: &GroupPlan) -> Result<ColumnExpr> {
        dimension(&group.field)
    }

    fn build_from_clause(&self) -> Result<Fragment> {
        Ok(Fragment::raw(relation()))
    }

    fn build_where_clause(&self) -> Result<Fragment> {
        let mut predicates = vec![
            website_scope(&self.plan.insight_id),
            self.date.range(self.dialect(), &self.plan.window),
            event_name_predicate(&self.plan, Some(column(EVENT_NAME).as_str()))?,
        ];
        predicates.extend(filter_predicates(self.dialect(), &self.plan.filters)?);
        Ok(Fragment::and_all(predicates))
    }

    fn build_date_clause(&self) -> Fragment {
        Fragment::raw(format!(
            "{} AS \"date\"",
            self.date.bucket_expr(self.dialect(), &self.plan.window)
        ))
    }
}

/// Keyset listing of raw events for one website.
pub fn listing_query(dialect: Dialect, request: &EventListRequest, limit: i64) -> Result<KeysetQuery> {
    let mut predicates = vec![website_scope(&request.insight_id)];

    if let Some(range) = &request.time {
        let window = TimeWindow::new(range.start_at, range.end_at, TimeUnit::Day, Tz::UTC)?;
        predicates.push(super::date::range_predicate(
            dialect,
            &column(CREATED_AT),
            &window,
            TimestampEncoding::Datetime,
        ));
    }

    for spec in &request.filters {
        crate::ident::validate_component(&spec.name)?;
        let operator = filter::FilterOperator::parse(&spec.operator, spec.value_type)?;
        let column = dimension(&spec.name)?;
        predicates.push(filter::compile(
            dialect,
            spec.value_type,
            operator,
            &spec.value,
            &column,
        )?);
    }

    let mut columns = vec![
        column(CURSOR),
        column(WEBSITE_ID),
        column(SESSION_ID),
        column(EVENT_NAME),
        column(CREATED_AT),
    ];
    columns.extend(DIMENSIONS.iter().map(|name| column(name)));

    Ok(KeysetQuery {
        insight_id: request.insight_id.clone(),
        backend: InsightType::Internal,
        relation: relation(),
        columns: columns.join(", "),
        cursor_column: column(CURSOR),
        cursor_field: CURSOR.to_string(),
        filter: Fragment::and_all(predicates),
        order: request.order,
        limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::test_support::plan_for;
    use crate::sqlite::SqliteStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn builder(plan: QueryPlan) -> InternalBuilder {
        InternalBuilder::new(plan, Store::Sqlite(SqliteStore::in_memory().unwrap()))
    }

    #[test]
    fn builds_scoped_statement_with_date_column() {
        let plan = plan_for(
            "internal",
            json!([{"name": "$all_event", "math": "events"}]),
            json!([{"name": "country", "type": "string", "operator": "equals", "value": "DE"}]),
            json!([{"value": "browser", "type": "string"}]),
        );
        let statement = builder(plan).build().unwrap();
        assert_eq!(
            statement.sql,
            "SELECT strftime('%Y-%m-%d', date(\"e\".\"created_date\")) AS \"date\", COUNT(1) AS \"$all_event\", \"e\".\"browser\" AS \"%browser\" \
             FROM \"website_event\" AS \"e\" \
             WHERE (\"e\".\"website_id\" = ?) AND (date(\"e\".\"created_date\") >= date(?) AND date(\"e\".\"created_date\") <= date(?)) AND (1=1) AND (\"e\".\"country\" = ?) \
             GROUP BY 1, 3 ORDER BY 1 ASC"
        );
        assert_eq!(
            statement.params,
            vec![
                BindParam::Text("app".into()),
                BindParam::Text("2025-08-01".into()),
                BindParam::Text("2025-08-02".into()),
                BindParam::Text("DE".into()),
            ]
        );
    }

    #[test]
    fn custom_groups_run_one_branch_per_bucket() {
        let plan = plan_for(
            "internal",
            json!([{"name": "$all_event", "math": "sessions"}]),
            json!([]),
            json!([{
                "value": "url_path",
                "type": "string",
                "customGroups": [
                    {"filterOperator": "equals", "filterValue": "/home"},
                    {"filterOperator": "equals", "filterValue": "/pricing"}
                ]
            }]),
        );
        let statement = builder(plan).build().unwrap();
        let branches: Vec<&str> = statement
            .sql
            .trim_end_matches(" ORDER BY 1 ASC")
            .split(" UNION ALL ")
            .collect();
        assert_eq!(branches.len(), 2);
        assert!(branches[0].contains(
            "CASE WHEN \"e\".\"url_path\" = ? THEN 1 ELSE 0 END AS \"%url_path|equals|/home\", 0 AS \"%url_path|equals|/pricing\""
        ));
        assert!(branches[0].ends_with("GROUP BY 1, 3"));
        assert!(branches[1].contains(
            "0 AS \"%url_path|equals|/home\", CASE WHEN \"e\".\"url_path\" = ? THEN 1 ELSE 0 END AS \"%url_path|equals|/pricing\""
        ));
        assert!(branches[1].ends_with("GROUP BY 1, 4"));
        assert!(statement.params.contains(&BindParam::Text("/pricing".into())));
        assert!(statement.sql.ends_with(" ORDER BY 1 ASC"));
    }

    #[test]
    fn unknown_fields_are_rejected_at_build_time() {
        let plan = plan_for(
            "internal",
            json!([{"name": "$all_event", "math": "events"}]),
            json!([{"name": "password", "type": "string", "operator": "equals", "value": "x"}]),
            json!([]),
        );
        assert!(matches!(
            builder(plan).build(),
            Err(ServiceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn listing_query_filters_and_orders_by_id() {
        let request: EventListRequest = serde_json::from_value(json!({
            "insightId": "site",
            "filters": [{"name": "os", "type": "string", "operator": "in", "value": ["mac", "linux"]}],
            "order": "asc"
        }))
        .unwrap();
        let query = listing_query(Dialect::Sqlite, &request, 10).unwrap();
        let statement = query.statement(None);
        assert!(statement.sql.starts_with("SELECT \"e\".\"id\", \"e\".\"website_id\""));
        assert!(statement
            .sql
            .ends_with("WHERE ((\"e\".\"website_id\" = ?) AND (\"e\".\"os\" IN (?, ?))) ORDER BY \"e\".\"id\" ASC LIMIT ?"));
        assert_eq!(statement.params.len(), 4);
    }
}
