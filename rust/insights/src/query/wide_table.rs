//! Builder for warehouse applications with one row per event and one column
//! per field.

use super::{
    date::DateSource,
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
    models::{InsightType, ValueType},
    registry::WideTableApplication,
    sql::Fragment,
    store::Store,
};

const ALIAS: &str = "t";

pub struct WideTableBuilder {
    plan: QueryPlan,
    app: WideTableApplication,
    store: Store,
    date: DateSource,
}

fn alias() -> SafeIdent {
    SafeIdent::trusted(ALIAS)
}

fn column(field: &SafeIdent) -> String {
    field.qualified(&alias())
}

impl WideTableBuilder {
    pub fn new(plan: QueryPlan, app: WideTableApplication, store: Store) -> Self {
        let date = DateSource::new(
            column(&app.created_at_field),
            app.created_at_field_type,
            app.date_based_created_at_field.as_ref().map(column),
        )
        .with_date_zone(app.date_based_created_at_timezone);
        Self {
            plan,
            app,
            store,
            date,
        }
    }

    /// Resolves a request field against the declared columns.
    fn field(&self, name: &str) -> Result<ColumnExpr> {
        let field = self.app.field(name).ok_or_else(|| {
            ServiceError::invalid(format!(
                "unknown field '{name}' for application '{}'",
                self.app.name
            ))
        })?;
        Ok(match field.value_type {
            ValueType::Date => ColumnExpr::temporal(
                column(&field.name),
                field.encoding.unwrap_or_default(),
            ),
            _ => ColumnExpr::native(column(&field.name)),
        })
    }

    fn event_name_column(&self) -> Option<String> {
        self.app.event_name_field.as_ref().map(column)
    }

    fn filter_predicates(&self, filters: &[PlannedFilter]) -> Result<Vec<Fragment>> {
        filters
            .iter()
            .map(|f| {
                let column = self.field(&f.field)?;
                filter::compile(self.dialect(), f.value_type, f.operator, &f.value, &column)
            })
            .collect()
    }
}

impl InsightsSqlBuilder for WideTableBuilder {
    fn backend(&self) -> InsightType {
        InsightType::WarehouseWide
    }

    fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    fn store(&self) -> &Store {
        &self.store
    }

    fn build_select_clause(&self) -> Result<Fragment> {
        let event_name = self.event_name_column();
        let distinct = column(&self.app.distinct_field);
        metric_select(
            &self.plan,
            MetricColumns {
                event_name: event_name.as_deref(),
                session: Some(distinct.as_str()),
                event_id: None,
            },
        )
    }

    fn group_column(&self, _index: usize, group: &GroupPlan) -> Result<ColumnExpr> {
        self.field(&group.field)
    }

    fn build_from_clause(&self) -> Result<Fragment> {
        Ok(Fragment::raw(format!(
            "{} AS {}",
            self.app.table_name.quoted(),
            alias().quoted()
        )))
    }

    fn build_where_clause(&self) -> Result<Fragment> {
        let event_name = self.event_name_column();
        let mut predicates = vec![
            self.date.range(self.dialect(), &self.plan.window),
            event_name_predicate(&self.plan, event_name.as_deref())?,
        ];
        predicates.extend(self.filter_predicates(&self.plan.filters)?);
        Ok(Fragment::and_all(predicates))
    }

    fn build_date_clause(&self) -> Fragment {
        Fragment::raw(format!(
            "{} AS \"date\"",
            self.date.bucket_expr(self.dialect(), &self.plan.window)
        ))
    }
}
