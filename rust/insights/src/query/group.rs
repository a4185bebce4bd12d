//! Group projections and the `%` alias scheme that carries them back through
//! the result rows.
//!
//! Raw groups alias as `%field`, custom buckets as `%field|operator|literal`.
//! Descriptors are planned first and only turned into SQL once a builder has
//! resolved the field to a column.

use super::filter::{self, ColumnExpr, FilterOperator};
use crate::{
    error::{Result, ServiceError},
    ident::{validate_component, SafeIdent},
    models::{GroupSpec, ValueType},
    sql::{Dialect, Fragment},
};
use serde_json::Value;

pub const GROUP_PREFIX: char = '%';
pub const GROUP_DELIMITER: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Raw {
        value: String,
    },
    Custom {
        value: String,
        operator: String,
        literal: String,
    },
}

impl GroupKey {
    pub fn encode(&self) -> String {
        match self {
            GroupKey::Raw { value } => format!("{GROUP_PREFIX}{value}"),
            GroupKey::Custom {
                value,
                operator,
                literal,
            } => format!(
                "{GROUP_PREFIX}{value}{GROUP_DELIMITER}{operator}{GROUP_DELIMITER}{literal}"
            ),
        }
    }

    /// Returns `None` for columns that are not group columns.
    pub fn decode(alias: &str) -> Option<GroupKey> {
        let body = alias.strip_prefix(GROUP_PREFIX)?;
        let mut parts = body.splitn(3, GROUP_DELIMITER);
        let value = parts.next()?.to_string();
        match (parts.next(), parts.next()) {
            (None, None) => Some(GroupKey::Raw { value }),
            (Some(operator), Some(literal)) => Some(GroupKey::Custom {
                value,
                operator: operator.to_string(),
                literal: literal.to_string(),
            }),
            _ => None,
        }
    }

    /// Validates every component, then the assembled alias.
    pub fn alias(&self) -> Result<SafeIdent> {
        match self {
            GroupKey::Raw { value } => validate_component(value)?,
            GroupKey::Custom {
                value,
                operator,
                literal,
            } => {
                validate_component(value)?;
                validate_component(operator)?;
                validate_component(literal)?;
            }
        }
        SafeIdent::group_alias(self.encode())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionExpr {
    /// The column value itself.
    Column,
    /// `1` when the bucket predicate holds, else `0`.
    Bucket {
        operator: FilterOperator,
        value: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupProjection {
    pub key: GroupKey,
    pub alias: SafeIdent,
    pub expr: ProjectionExpr,
}

impl GroupProjection {
    /// Display label for a bucket in series names.
    pub fn bucket_label(&self) -> Option<String> {
        match &self.key {
            GroupKey::Custom {
                operator, literal, ..
            } => Some(format!("{operator} {literal}")),
            GroupKey::Raw { .. } => None,
        }
    }
}

/// One requested group with its planned projections.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPlan {
    pub field: String,
    pub value_type: ValueType,
    pub projections: Vec<GroupProjection>,
}

impl GroupPlan {
    pub fn is_custom(&self) -> bool {
        self.projections
            .iter()
            .any(|projection| matches!(projection.expr, ProjectionExpr::Bucket { .. }))
    }

    /// Bucket choices for this group within a statement branch.
    fn choices(&self) -> Vec<Option<usize>> {
        if self.is_custom() {
            (0..self.projections.len()).map(Some).collect()
        } else {
            vec![None]
        }
    }
}

/// The bucket each group is pinned to in one statement branch, by plan
/// position. Raw groups are `None`.
pub type BucketSelection = Vec<Option<usize>>;

/// Every combination of one bucket per custom group. Without custom groups
/// there is a single selection.
///
/// Each combination runs as its own statement branch, so a row is aggregated
/// once in every bucket it matches.
pub fn bucket_selections(groups: &[GroupPlan]) -> Vec<BucketSelection> {
    groups.iter().fold(vec![Vec::new()], |acc, group| {
        let choices = group.choices();
        acc.iter()
            .flat_map(|prefix| {
                choices.iter().map(move |choice| {
                    let mut next = prefix.clone();
                    next.push(*choice);
                    next
                })
            })
            .collect()
    })
}

/// A materialized group projection and whether it is a grouping key.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupColumn {
    pub fragment: Fragment,
    pub grouped: bool,
}

pub fn describe(spec: &GroupSpec) -> Result<GroupPlan> {
    validate_component(&spec.value)?;

    let projections = if spec.custom_groups.is_empty() {
        let key = GroupKey::Raw {
            value: spec.value.clone(),
        };
        vec![GroupProjection {
            alias: key.alias()?,
            key,
            expr: ProjectionExpr::Column,
        }]
    } else {
        spec.custom_groups
            .iter()
            .map(|custom| {
                let operator = FilterOperator::parse(&custom.filter_operator, spec.value_type)?;
                let key = GroupKey::Custom {
                    value: spec.value.clone(),
                    operator: operator.as_str().to_string(),
                    literal: literal_text(&custom.filter_value),
                };
                Ok(GroupProjection {
                    alias: key.alias()?,
                    key,
                    expr: ProjectionExpr::Bucket {
                        operator,
                        value: custom.filter_value.clone(),
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?
    };

    Ok(GroupPlan {
        field: spec.value.clone(),
        value_type: spec.value_type,
        projections,
    })
}

/// Renders `<expr> AS "<alias>"` for a resolved column. A bucket that is not
/// `pinned` in the current branch projects a constant `0`.
pub fn materialize(
    dialect: Dialect,
    value_type: ValueType,
    projection: &GroupProjection,
    column: &ColumnExpr,
    pinned: bool,
) -> Result<GroupColumn> {
    let (mut fragment, grouped) = match &projection.expr {
        ProjectionExpr::Column => (Fragment::raw(column.sql.clone()), true),
        ProjectionExpr::Bucket { operator, value } if pinned => (
            filter::compile(dialect, value_type, *operator, value, column)?
                .wrap("CASE WHEN ", " THEN 1 ELSE 0 END"),
            true,
        ),
        ProjectionExpr::Bucket { .. } => (Fragment::raw("0"), false),
    };
    fragment.push_sql(&format!(" AS {}", projection.alias.quoted()));
    Ok(GroupColumn { fragment, grouped })
}

fn literal_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(literal_text)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

pub(crate) fn ensure_distinct(groups: &[GroupPlan]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for projection in groups.iter().flat_map(|group| &group.projections) {
        if !seen.insert(projection.alias.as_str()) {
            return Err(ServiceError::invalid(format!(
                "duplicate group column '{}'",
                projection.alias
            )));
        }
    }
    Ok(())
}
