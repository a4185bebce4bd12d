//! SQL fragments with positional binds, and the dialect differences between
//! the supported stores.
//!
//! Builders always emit `?` placeholders; [`Dialect::render_placeholders`]
//! translates them right before execution.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum BindParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// A piece of SQL together with the binds for the placeholders it contains,
/// in textual order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    sql: String,
    binds: Vec<BindParam>,
}

impl Fragment {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }

    pub fn bound(sql: impl Into<String>, binds: Vec<BindParam>) -> Self {
        let sql = sql.into();
        debug_assert_eq!(
            sql.matches('?').count(),
            binds.len(),
            "placeholder/bind mismatch in {sql}"
        );
        Self { sql, binds }
    }

    pub fn always_true() -> Self {
        Self::raw("1=1")
    }

    pub fn always_false() -> Self {
        Self::raw("1=0")
    }

    pub fn push_sql(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    pub fn push(&mut self, other: Fragment) {
        self.sql.push_str(&other.sql);
        self.binds.extend(other.binds);
    }

    pub fn join<I>(parts: I, separator: &str) -> Fragment
    where
        I: IntoIterator<Item = Fragment>,
    {
        let mut joined = Fragment::default();
        for (index, part) in parts.into_iter().enumerate() {
            if index > 0 {
                joined.push_sql(separator);
            }
            joined.push(part);
        }
        joined
    }

    /// Joins predicates with `AND`, parenthesizing each one. An empty input
    /// yields `1=1`.
    pub fn and_all<I>(parts: I) -> Fragment
    where
        I: IntoIterator<Item = Fragment>,
    {
        let parts: Vec<_> = parts.into_iter().map(|part| part.wrap("(", ")")).collect();
        if parts.is_empty() {
            return Fragment::always_true();
        }
        Fragment::join(parts, " AND ")
    }

    pub fn wrap(self, prefix: &str, suffix: &str) -> Fragment {
        let mut wrapped = Fragment::raw(prefix);
        wrapped.push(self);
        wrapped.push_sql(suffix);
        wrapped
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn binds(&self) -> &[BindParam] {
        &self.binds
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn into_statement(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.binds,
        }
    }
}

/// A complete, self-contained read-only statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<BindParam>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn render_placeholders(self, sql: &str) -> String {
        match self {
            Dialect::Postgres => rewrite_placeholders(sql),
            Dialect::Sqlite => sql.to_string(),
        }
    }

    /// Case-insensitive pattern match operator.
    pub fn pattern_operator(self) -> &'static str {
        match self {
            Dialect::Postgres => "ILIKE",
            Dialect::Sqlite => "LIKE",
        }
    }

    pub fn cast_number(self, expr: &str) -> String {
        match self {
            Dialect::Postgres => format!("CAST({expr} AS double precision)"),
            Dialect::Sqlite => format!("CAST({expr} AS REAL)"),
        }
    }

    pub fn cast_timestamp(self, expr: &str) -> String {
        match self {
            Dialect::Postgres => format!("CAST({expr} AS timestamp)"),
            Dialect::Sqlite => format!("datetime({expr})"),
        }
    }

    pub fn cast_date(self, expr: &str) -> String {
        match self {
            Dialect::Postgres => format!("CAST({expr} AS date)"),
            Dialect::Sqlite => format!("date({expr})"),
        }
    }
}

fn rewrite_placeholders(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut index = 1;
    let mut in_literal = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                result.push(ch);
            }
            '?' if !in_literal => {
                result.push('$');
                result.push_str(&index.to_string());
                index += 1;
            }
            _ => result.push(ch),
        }
    }
    result
}
