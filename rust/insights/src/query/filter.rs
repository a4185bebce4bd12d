//! Filter operator compiler: `(type, operator, value, column)` to a predicate.
//!
//! The same predicates back top-level filters and custom group buckets.

use super::date::TimestampEncoding;
use crate::{
    error::{Result, ServiceError},
    models::ValueType,
    sql::{BindParam, Dialect, Fragment},
    time::parse_instant,
};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Between,
    IsNull,
    IsNotNull,
    In,
    NotIn,
}

impl FilterOperator {
    /// Parses an operator name and checks it belongs to the family of
    /// `value_type`. Spaced and underscored spellings are accepted.
    pub fn parse(raw: &str, value_type: ValueType) -> Result<Self> {
        let normalized = raw.trim().to_lowercase().replace([' ', '_'], "-");
        let op = match normalized.as_str() {
            "equals" | "eq" | "=" => FilterOperator::Equals,
            "not-equals" | "ne" | "!=" => FilterOperator::NotEquals,
            "contains" => FilterOperator::Contains,
            "not-contains" => FilterOperator::NotContains,
            "starts-with" => FilterOperator::StartsWith,
            "ends-with" => FilterOperator::EndsWith,
            "greater-than" | "gt" | ">" => FilterOperator::GreaterThan,
            "greater-than-or-equal" | "gte" | ">=" => FilterOperator::GreaterThanOrEqual,
            "less-than" | "lt" | "<" => FilterOperator::LessThan,
            "less-than-or-equal" | "lte" | "<=" => FilterOperator::LessThanOrEqual,
            "between" | "in-range" => FilterOperator::Between,
            "is-null" => FilterOperator::IsNull,
            "is-not-null" => FilterOperator::IsNotNull,
            "in" | "in-list" => FilterOperator::In,
            "not-in" | "not-in-list" => FilterOperator::NotIn,
            _ => return Err(unsupported(raw, value_type)),
        };

        if op.supports(value_type) {
            Ok(op)
        } else {
            Err(unsupported(raw, value_type))
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FilterOperator::Equals => "equals",
            FilterOperator::NotEquals => "not-equals",
            FilterOperator::Contains => "contains",
            FilterOperator::NotContains => "not-contains",
            FilterOperator::StartsWith => "starts-with",
            FilterOperator::EndsWith => "ends-with",
            FilterOperator::GreaterThan => "greater-than",
            FilterOperator::GreaterThanOrEqual => "greater-than-or-equal",
            FilterOperator::LessThan => "less-than",
            FilterOperator::LessThanOrEqual => "less-than-or-equal",
            FilterOperator::Between => "between",
            FilterOperator::IsNull => "is-null",
            FilterOperator::IsNotNull => "is-not-null",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    fn supports(self, value_type: ValueType) -> bool {
        use FilterOperator::*;
        match self {
            IsNull | IsNotNull | In | NotIn => true,
            Equals | NotEquals => !matches!(value_type, ValueType::Other),
            Contains | NotContains | StartsWith | EndsWith => {
                matches!(value_type, ValueType::String)
            }
            GreaterThan | GreaterThanOrEqual | LessThan | LessThanOrEqual | Between => {
                matches!(value_type, ValueType::Number | ValueType::Date)
            }
        }
    }
}

fn unsupported(raw: &str, value_type: ValueType) -> ServiceError {
    ServiceError::UnsupportedOperator {
        operator: raw.to_string(),
        value_type: value_type.as_str().to_string(),
    }
}

/// How the column stores its values, which decides casts and operand
/// normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Stored in the column's natural type.
    Native,
    /// A generic text value column; numbers and dates need casting.
    TextEncoded,
    /// A temporal column with a known encoding.
    Temporal(TimestampEncoding),
}

/// A rendered, already-validated column expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnExpr {
    pub sql: String,
    pub kind: ColumnKind,
}

impl ColumnExpr {
    pub fn native(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: ColumnKind::Native,
        }
    }

    pub fn text(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: ColumnKind::TextEncoded,
        }
    }

    pub fn temporal(sql: impl Into<String>, encoding: TimestampEncoding) -> Self {
        Self {
            sql: sql.into(),
            kind: ColumnKind::Temporal(encoding),
        }
    }
}

pub fn compile(
    dialect: Dialect,
    value_type: ValueType,
    operator: FilterOperator,
    value: &Value,
    column: &ColumnExpr,
) -> Result<Fragment> {
    let col = &column.sql;
    let operand = Operand::for_column(dialect, value_type, column);

    match operator {
        FilterOperator::IsNull => Ok(Fragment::raw(format!("{col} IS NULL"))),
        FilterOperator::IsNotNull => Ok(Fragment::raw(format!("{col} IS NOT NULL"))),
        FilterOperator::Equals => operand.compare(dialect, "=", value),
        FilterOperator::NotEquals => operand.compare(dialect, "<>", value),
        FilterOperator::GreaterThan => operand.compare(dialect, ">", value),
        FilterOperator::GreaterThanOrEqual => operand.compare(dialect, ">=", value),
        FilterOperator::LessThan => operand.compare(dialect, "<", value),
        FilterOperator::LessThanOrEqual => operand.compare(dialect, "<=", value),
        FilterOperator::Between => {
            let (low, high) = range_bounds(value)?;
            let lower = operand.compare(dialect, ">=", low)?;
            let upper = operand.compare(dialect, "<=", high)?;
            Ok(Fragment::join([lower, upper], " AND "))
        }
        FilterOperator::Contains => pattern(dialect, col, value, PatternShape::Contains, false),
        FilterOperator::NotContains => pattern(dialect, col, value, PatternShape::Contains, true),
        FilterOperator::StartsWith => pattern(dialect, col, value, PatternShape::Prefix, false),
        FilterOperator::EndsWith => pattern(dialect, col, value, PatternShape::Suffix, false),
        FilterOperator::In | FilterOperator::NotIn => {
            let items = list_items(value)?;
            if items.is_empty() {
                return Ok(if operator == FilterOperator::In {
                    Fragment::always_false()
                } else {
                    Fragment::always_true()
                });
            }
            let mut binds = Vec::with_capacity(items.len());
            let mut placeholders = Vec::with_capacity(items.len());
            for item in items {
                let (placeholder, bind) = operand.bind(dialect, item)?;
                placeholders.push(placeholder);
                binds.push(bind);
            }
            let keyword = if operator == FilterOperator::In {
                "IN"
            } else {
                "NOT IN"
            };
            Ok(Fragment::bound(
                format!("{} {keyword} ({})", operand.lhs, placeholders.join(", ")),
                binds,
            ))
        }
    }
}

/// Left-hand side of a comparison plus the way operands are bound against it.
struct Operand {
    lhs: String,
    binding: Binding,
}

#[derive(Clone, Copy)]
enum Binding {
    Text,
    Number,
    Temporal(TimestampEncoding),
}

impl Operand {
    fn for_column(dialect: Dialect, value_type: ValueType, column: &ColumnExpr) -> Self {
        let col = column.sql.as_str();
        match (value_type, column.kind) {
            (ValueType::Number, ColumnKind::TextEncoded) => Operand {
                lhs: dialect.cast_number(col),
                binding: Binding::Number,
            },
            (ValueType::Number, _) => Operand {
                lhs: col.to_string(),
                binding: Binding::Number,
            },
            (ValueType::Date, ColumnKind::Temporal(encoding)) => {
                Operand::temporal(dialect, col, encoding)
            }
            (ValueType::Date, _) => Operand::temporal(dialect, col, TimestampEncoding::Datetime),
            (ValueType::String | ValueType::Other, _) => Operand {
                lhs: col.to_string(),
                binding: Binding::Text,
            },
        }
    }

    fn temporal(dialect: Dialect, col: &str, encoding: TimestampEncoding) -> Self {
        let lhs = match encoding {
            TimestampEncoding::Timestamp | TimestampEncoding::TimestampMs => col.to_string(),
            TimestampEncoding::Datetime => dialect.cast_timestamp(col),
            TimestampEncoding::Date => dialect.cast_date(col),
        };
        Operand {
            lhs,
            binding: Binding::Temporal(encoding),
        }
    }

    fn compare(&self, dialect: Dialect, op: &str, value: &Value) -> Result<Fragment> {
        let (placeholder, bind) = self.bind(dialect, value)?;
        Ok(Fragment::bound(
            format!("{} {op} {placeholder}", self.lhs),
            vec![bind],
        ))
    }

    fn bind(&self, dialect: Dialect, value: &Value) -> Result<(String, BindParam)> {
        match self.binding {
            Binding::Text => Ok(("?".to_string(), BindParam::Text(scalar_text(value)?))),
            Binding::Number => Ok(("?".to_string(), BindParam::Float(scalar_number(value)?))),
            Binding::Temporal(encoding) => {
                let instant = parse_instant(value)?;
                Ok(match encoding {
                    TimestampEncoding::Timestamp => {
                        ("?".to_string(), BindParam::Int(instant.timestamp()))
                    }
                    TimestampEncoding::TimestampMs => {
                        ("?".to_string(), BindParam::Int(instant.timestamp_millis()))
                    }
                    TimestampEncoding::Datetime => (
                        dialect.cast_timestamp("?"),
                        BindParam::Text(instant.format("%Y-%m-%d %H:%M:%S").to_string()),
                    ),
                    TimestampEncoding::Date => (
                        dialect.cast_date("?"),
                        BindParam::Text(instant.format("%Y-%m-%d").to_string()),
                    ),
                })
            }
        }
    }
}

#[derive(Clone, Copy)]
enum PatternShape {
    Contains,
    Prefix,
    Suffix,
}

fn pattern(
    dialect: Dialect,
    col: &str,
    value: &Value,
    shape: PatternShape,
    negate: bool,
) -> Result<Fragment> {
    let escaped = escape_like_pattern(&scalar_text(value)?);
    let pattern = match shape {
        PatternShape::Contains => format!("%{escaped}%"),
        PatternShape::Prefix => format!("{escaped}%"),
        PatternShape::Suffix => format!("%{escaped}"),
    };
    let op = dialect.pattern_operator();
    let sql = if negate {
        format!("NOT ({col} {op} ? ESCAPE '\\')")
    } else {
        format!("{col} {op} ? ESCAPE '\\'")
    };
    Ok(Fragment::bound(sql, vec![BindParam::Text(pattern)]))
}

fn escape_like_pattern(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn scalar_text(value: &Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(ServiceError::invalid(format!(
            "expected a scalar filter value, got {other}"
        ))),
    }
}

fn scalar_number(value: &Value) -> Result<f64> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| ServiceError::invalid("invalid numeric value")),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| ServiceError::invalid(format!("invalid numeric value '{text}'"))),
        other => Err(ServiceError::invalid(format!(
            "expected a numeric filter value, got {other}"
        ))),
    }
}

fn range_bounds(value: &Value) -> Result<(&Value, &Value)> {
    match value.as_array().map(Vec::as_slice) {
        Some([low, high]) => Ok((low, high)),
        _ => Err(ServiceError::invalid(
            "between requires a two-element [low, high] value",
        )),
    }
}

fn list_items(value: &Value) -> Result<&[Value]> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| ServiceError::invalid("in/not-in requires a list value"))
}
