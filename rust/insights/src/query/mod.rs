//! Query compilation and execution.
//!
//! A request is planned once ([`plan::build_query_plan`]), handed to the
//! builder for its backend, executed, and reshaped into series.

pub mod date;
pub mod filter;
pub mod group;
pub mod internal;
pub mod long_table;
pub mod plan;
pub mod reshape;
pub mod wide_table;

use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    models::{EventListRequest, EventPage, InsightQuery, InsightType, MetricMath, Series},
    pagination,
    registry::{ResolvedInsight, SchemaRegistry},
    sql::{BindParam, Dialect, Fragment, Statement},
    store::{RawRow, Store},
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use self::{
    filter::ColumnExpr,
    group::{GroupColumn, GroupPlan},
    internal::InternalBuilder,
    long_table::LongTableBuilder,
    plan::QueryPlan,
    wide_table::WideTableBuilder,
};

/// Compiles a [`QueryPlan`] into one statement for a specific backend.
///
/// Implementors supply the clause builders; [`build`](Self::build) assembles
/// `SELECT date, metrics, groups FROM .. WHERE .. GROUP BY ..` once per
/// custom bucket selection, joins the branches with `UNION ALL` and orders by
/// date. [`execute`](Self::execute) runs it on the resolved store.
#[async_trait]
pub trait InsightsSqlBuilder: Send + Sync {
    fn backend(&self) -> InsightType;
    fn plan(&self) -> &QueryPlan;
    fn store(&self) -> &Store;

    fn dialect(&self) -> Dialect {
        self.store().dialect()
    }

    /// Metric aggregates, in plan order.
    fn build_select_clause(&self) -> Result<Fragment>;

    /// The column group `index` of the plan reads.
    fn group_column(&self, index: usize, group: &GroupPlan) -> Result<ColumnExpr>;

    /// Group projections in plan order; empty without groups. Custom groups
    /// project only the bucket `selection` pins for them.
    fn build_group_select_clause(&self, selection: &[Option<usize>]) -> Result<Vec<GroupColumn>> {
        let mut columns = Vec::new();
        for (index, group_plan) in self.plan().groups.iter().enumerate() {
            let column = self.group_column(index, group_plan)?;
            let pinned = selection.get(index).copied().flatten();
            for (position, projection) in group_plan.projections.iter().enumerate() {
                columns.push(group::materialize(
                    self.dialect(),
                    group_plan.value_type,
                    projection,
                    &column,
                    pinned == Some(position),
                )?);
            }
        }
        Ok(columns)
    }

    fn build_from_clause(&self) -> Result<Fragment>;

    fn build_where_clause(&self) -> Result<Fragment>;

    /// Bucket label expression aliased as `date`.
    fn build_date_clause(&self) -> Fragment;

    fn build_branch(&self, selection: &[Option<usize>]) -> Result<Fragment> {
        let mut sql = Fragment::raw("SELECT ");
        sql.push(self.build_date_clause());
        sql.push_sql(", ");
        sql.push(self.build_select_clause()?);

        let first_group = self.plan().metrics.len() + 2;
        let columns = self.build_group_select_clause(selection)?;
        let positions: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, column)| column.grouped)
            .map(|(offset, _)| first_group + offset)
            .collect();
        if !columns.is_empty() {
            sql.push_sql(", ");
            sql.push(Fragment::join(
                columns.into_iter().map(|column| column.fragment),
                ", ",
            ));
        }

        sql.push_sql(" FROM ");
        sql.push(self.build_from_clause()?);
        sql.push_sql(" WHERE ");
        sql.push(self.build_where_clause()?);

        sql.push_sql(" GROUP BY 1");
        for position in positions {
            sql.push_sql(&format!(", {position}"));
        }
        Ok(sql)
    }

    fn build(&self) -> Result<Statement> {
        let branches = group::bucket_selections(&self.plan().groups)
            .iter()
            .map(|selection| self.build_branch(selection))
            .collect::<Result<Vec<_>>>()?;
        let mut sql = Fragment::join(branches, " UNION ALL ");
        sql.push_sql(" ORDER BY 1 ASC");

        let statement = sql.into_statement();
        debug!(
            backend = %self.backend(),
            sql = %statement.sql,
            binds = statement.params.len(),
            "compiled insights statement"
        );
        Ok(statement)
    }

    async fn execute(&self) -> Result<Vec<RawRow>> {
        let statement = self.build()?;
        let plan = self.plan();
        self.store().fetch(&statement).await.map_err(|err| {
            error!(
                insight_id = %plan.insight_id,
                backend = %self.backend(),
                error = %err,
                "insights statement failed"
            );
            err.into_service_error(&plan.insight_id, self.backend())
        })
    }
}

/// Columns the metric aggregates read, when the source has them.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MetricColumns<'a> {
    pub event_name: Option<&'a str>,
    pub session: Option<&'a str>,
    /// Set when joins can repeat an event row; `events` math then counts
    /// distinct ids.
    pub event_id: Option<&'a str>,
}

/// Metric projections shared by every backend.
pub(crate) fn metric_select(plan: &QueryPlan, columns: MetricColumns<'_>) -> Result<Fragment> {
    let parts = plan
        .metrics
        .iter()
        .map(|metric| {
            let alias = metric.alias.quoted();
            let event_column = || {
                columns.event_name.ok_or_else(|| {
                    ServiceError::invalid(format!(
                        "metric '{}' needs an event name column on this source",
                        metric.name
                    ))
                })
            };
            let session_column = || {
                columns.session.ok_or_else(|| {
                    ServiceError::invalid(format!(
                        "sessions math for '{}' needs a session column on this source",
                        metric.name
                    ))
                })
            };

            Ok(match (metric.math, metric.is_all_event(), columns.event_id) {
                (MetricMath::Events, true, None) => {
                    Fragment::raw(format!("COUNT(1) AS {alias}"))
                }
                (MetricMath::Events, true, Some(id)) => {
                    Fragment::raw(format!("COUNT(DISTINCT {id}) AS {alias}"))
                }
                (MetricMath::Events, false, None) => Fragment::bound(
                    format!("COUNT(CASE WHEN {} = ? THEN 1 END) AS {alias}", event_column()?),
                    vec![BindParam::Text(metric.name.clone())],
                ),
                (MetricMath::Events, false, Some(id)) => Fragment::bound(
                    format!(
                        "COUNT(DISTINCT CASE WHEN {} = ? THEN {id} END) AS {alias}",
                        event_column()?
                    ),
                    vec![BindParam::Text(metric.name.clone())],
                ),
                (MetricMath::Sessions, true, _) => {
                    Fragment::raw(format!("COUNT(DISTINCT {}) AS {alias}", session_column()?))
                }
                (MetricMath::Sessions, false, _) => Fragment::bound(
                    format!(
                        "COUNT(DISTINCT CASE WHEN {} = ? THEN {} END) AS {alias}",
                        event_column()?,
                        session_column()?
                    ),
                    vec![BindParam::Text(metric.name.clone())],
                ),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Fragment::join(parts, ", "))
}

/// `1=1` when the sentinel is requested, else an `IN` over the distinct
/// event names.
pub(crate) fn event_name_predicate(plan: &QueryPlan, event_name: Option<&str>) -> Result<Fragment> {
    if plan.requests_all_events() {
        return Ok(Fragment::always_true());
    }
    let column = event_name.ok_or_else(|| {
        ServiceError::invalid("named metrics need an event name column on this source")
    })?;
    let names = plan.event_names();
    let placeholders = vec!["?"; names.len()].join(", ");
    Ok(Fragment::bound(
        format!("{column} IN ({placeholders})"),
        names
            .into_iter()
            .map(|name| BindParam::Text(name.to_string()))
            .collect(),
    ))
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslateResponse {
    pub sql: String,
    pub params: Vec<BindParam>,
    pub backend: InsightType,
    pub dialect: Dialect,
}

#[derive(Clone)]
pub struct InsightsEngine {
    internal: Store,
    registry: Arc<SchemaRegistry>,
    config: Arc<AppConfig>,
}

impl InsightsEngine {
    pub fn new(internal: Store, registry: Arc<SchemaRegistry>, config: Arc<AppConfig>) -> Self {
        Self {
            internal,
            registry,
            config,
        }
    }

    /// Opens the internal store and an empty registry from configuration.
    /// Must run inside a Tokio runtime.
    pub fn from_config(config: Arc<AppConfig>) -> anyhow::Result<Self> {
        let internal = Store::connect_lazy(&config.database_url, config.max_pool_size, &config.tls)
            .map_err(|err| anyhow::anyhow!("failed to open internal store: {err}"))?;
        let registry = Arc::new(SchemaRegistry::new(
            config.warehouse.clone(),
            config.max_pool_size,
            config.tls.clone(),
        ));
        info!(dialect = ?internal.dialect(), "insights engine ready");
        Ok(Self::new(internal, registry, config))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn internal_store(&self) -> &Store {
        &self.internal
    }

    pub async fn query(&self, query: InsightQuery) -> Result<Vec<Series>> {
        let query_id = Uuid::new_v4();
        let span = info_span!(
            "insights_query",
            %query_id,
            insight_id = %query.insight_id,
            backend = %query.insight_type
        );

        async move {
            let plan = plan::build_query_plan(&query, self.config.max_buckets)?;
            let builder = self.builder(plan)?;
            let rows = builder.execute().await?;
            let row_count = rows.len();
            let series = reshape::reshape(builder.plan(), rows)?;
            info!(rows = row_count, series = series.len(), "insights query complete");
            Ok(series)
        }
        .instrument(span)
        .await
    }

    /// Compiles without executing.
    pub async fn translate(&self, query: InsightQuery) -> Result<TranslateResponse> {
        let plan = plan::build_query_plan(&query, self.config.max_buckets)?;
        let builder = self.builder(plan)?;
        let statement = builder.build()?;
        let dialect = builder.dialect();
        Ok(TranslateResponse {
            sql: dialect.render_placeholders(&statement.sql),
            params: statement.params,
            backend: builder.backend(),
            dialect,
        })
    }

    /// Raw event listing on the internal store.
    pub async fn list_events(&self, request: EventListRequest) -> Result<EventPage> {
        let limit = request
            .limit
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit);
        let query = internal::listing_query(self.internal.dialect(), &request, limit)?;
        pagination::page(&self.internal, &query, request.cursor.as_deref()).await
    }

    fn builder(&self, plan: QueryPlan) -> Result<Box<dyn InsightsSqlBuilder>> {
        Ok(match self.registry.resolve(&plan.insight_id, plan.insight_type)? {
            ResolvedInsight::Internal => Box::new(InternalBuilder::new(plan, self.internal.clone())),
            ResolvedInsight::LongTable { app, store } => {
                Box::new(LongTableBuilder::new(plan, app, store))
            }
            ResolvedInsight::WideTable { app, store } => {
                Box::new(WideTableBuilder::new(plan, app, store))
            }
        })
    }
}
