//! Builder for warehouse applications stored as an event table plus a
//! key/value parameters table.
//!
//! The event name column is read directly; every other field is a parameter.
//! Parameter filters become correlated `EXISTS` subqueries so they never
//! multiply rows. Parameter groups need the value in the projection and are
//! joined with one `LEFT JOIN` per group.

use super::{
    date::{DateSource, TimestampEncoding},
    event_name_predicate,
    filter::{self, ColumnExpr},
    group::GroupPlan,
    metric_select,
    plan::QueryPlan,
    InsightsSqlBuilder, MetricColumns,
};
use crate::{
    error::Result,
    ident::SafeIdent,
    models::{InsightType, ValueType},
    registry::LongTableApplication,
    sql::{BindParam, Fragment},
    store::Store,
};

const EVENT_ALIAS: &str = "e";
const FILTER_ALIAS: &str = "p";

pub struct LongTableBuilder {
    plan: QueryPlan,
    app: LongTableApplication,
    store: Store,
    date: DateSource,
}

impl LongTableBuilder {
    pub fn new(plan: QueryPlan, app: LongTableApplication, store: Store) -> Self {
        let event = &app.event_table;
        let date = DateSource::new(
            event_column(&event.created_at_field),
            event.created_at_field_type,
            event
                .date_based_created_at_field
                .as_ref()
                .map(event_column),
        )
        .with_date_zone(event.date_based_created_at_timezone);
        Self {
            plan,
            app,
            store,
            date,
        }
    }

    fn is_event_name(&self, field: &str) -> bool {
        self.app.event_table.event_name_field.as_str() == field
    }

    /// The parameter value column of `params` to compare against for a
    /// value type, falling back to the generic text value.
    fn value_column(&self, params: &SafeIdent, value_type: ValueType) -> ColumnExpr {
        let table = &self.app.event_parameters_table;
        let generic = table.params_value_field.qualified(params);
        match value_type {
            ValueType::Number => match &table.params_value_number_field {
                Some(field) => ColumnExpr::native(field.qualified(params)),
                None => ColumnExpr::text(generic),
            },
            ValueType::Date => match &table.params_value_date_field {
                Some(field) => {
                    ColumnExpr::temporal(field.qualified(params), TimestampEncoding::Datetime)
                }
                None => ColumnExpr::text(generic),
            },
            ValueType::String | ValueType::Other => match &table.params_value_string_field {
                Some(field) => ColumnExpr::native(field.qualified(params)),
                None => ColumnExpr::text(generic),
            },
        }
    }

    /// `"p"."event_id" = "e"."id" AND "p"."name" = ?`
    fn parameter_link(&self, params: &SafeIdent, name: &str) -> Fragment {
        let table = &self.app.event_parameters_table;
        Fragment::bound(
            format!(
                "{} = {} AND {} = ?",
                table.event_id_field.qualified(params),
                event_column(&self.app.event_table.id_field),
                table.params_name_field.qualified(params),
            ),
            vec![BindParam::Text(name.to_string())],
        )
    }

    /// Whether any group joins the parameters table. Each join can repeat an
    /// event row.
    fn joins_parameters(&self) -> bool {
        self.plan
            .groups
            .iter()
            .any(|group| !self.is_event_name(&group.field))
    }

    fn group_alias(index: usize) -> SafeIdent {
        SafeIdent::trusted(&format!("g{index}"))
    }
}

fn event_alias() -> SafeIdent {
    SafeIdent::trusted(EVENT_ALIAS)
}

fn event_column(field: &SafeIdent) -> String {
    field.qualified(&event_alias())
}

impl InsightsSqlBuilder for LongTableBuilder {
    fn backend(&self) -> InsightType {
        InsightType::WarehouseLong
    }

    fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    fn store(&self) -> &Store {
        &self.store
    }

    fn build_select_clause(&self) -> Result<Fragment> {
        let event = &self.app.event_table;
        let event_name = event_column(&event.event_name_field);
        let session = event.session_id_field.as_ref().map(event_column);
        let event_id = self
            .joins_parameters()
            .then(|| event_column(&event.id_field));
        metric_select(
            &self.plan,
            MetricColumns {
                event_name: Some(event_name.as_str()),
                session: session.as_deref(),
                event_id: event_id.as_deref(),
            },
        )
    }

    fn group_column(&self, index: usize, group: &GroupPlan) -> Result<ColumnExpr> {
        Ok(if self.is_event_name(&group.field) {
            ColumnExpr::native(event_column(&self.app.event_table.event_name_field))
        } else {
            self.value_column(&Self::group_alias(index), group.value_type)
        })
    }

    fn build_from_clause(&self) -> Result<Fragment> {
        let mut from = Fragment::raw(format!(
            "{} AS {}",
            self.app.event_table.name.quoted(),
            event_alias().quoted()
        ));
        let params_table = self.app.event_parameters_table.name.quoted();
        for (index, group_plan) in self.plan.groups.iter().enumerate() {
            if self.is_event_name(&group_plan.field) {
                continue;
            }
            let alias = Self::group_alias(index);
            from.push_sql(&format!(" LEFT JOIN {params_table} AS {} ON ", alias.quoted()));
            from.push(self.parameter_link(&alias, &group_plan.field));
        }
        Ok(from)
    }

    fn build_where_clause(&self) -> Result<Fragment> {
        let event_name = event_column(&self.app.event_table.event_name_field);
        let mut predicates = vec![
            self.date.range(self.dialect(), &self.plan.window),
            event_name_predicate(&self.plan, Some(event_name.as_str()))?,
        ];

        let params = SafeIdent::trusted(FILTER_ALIAS);
        for planned in &self.plan.filters {
            if self.is_event_name(&planned.field) {
                predicates.push(filter::compile(
                    self.dialect(),
                    planned.value_type,
                    planned.operator,
                    &planned.value,
                    &ColumnExpr::native(event_name.clone()),
                )?);
                continue;
            }

            let column = self.value_column(&params, planned.value_type);
            let predicate = filter::compile(
                self.dialect(),
                planned.value_type,
                planned.operator,
                &planned.value,
                &column,
            )?;
            let mut exists = Fragment::raw(format!(
                "EXISTS (SELECT 1 FROM {} AS {} WHERE ",
                self.app.event_parameters_table.name.quoted(),
                params.quoted()
            ));
            exists.push(self.parameter_link(&params, &planned.field));
            exists.push_sql(" AND ");
            exists.push(predicate.wrap("(", ")"));
            exists.push_sql(")");
            predicates.push(exists);
        }

        Ok(Fragment::and_all(predicates))
    }

    fn build_date_clause(&self) -> Fragment {
        Fragment::raw(format!(
            "{} AS \"date\"",
            self.date.bucket_expr(self.dialect(), &self.plan.window)
        ))
    }
}
