//! Keyset pagination over a monotonic cursor column.

use crate::{
    error::{Result, ServiceError},
    models::{EventPage, InsightType, SortOrder},
    sql::{BindParam, Fragment, Statement},
    store::{RawRow, Store},
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    after: i64,
}

pub fn decode_cursor(cursor: &str) -> Result<i64> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim())
        .map_err(|_| ServiceError::InvalidRequest("invalid cursor".into()))?;
    let payload: CursorPayload = serde_json::from_slice(&bytes)
        .map_err(|_| ServiceError::InvalidRequest("invalid cursor payload".into()))?;
    Ok(payload.after)
}

pub fn encode_cursor(after: i64) -> String {
    let payload = CursorPayload { after };
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap_or_default())
}

/// A listing request already resolved to SQL pieces.
#[derive(Debug, Clone)]
pub struct KeysetQuery {
    pub insight_id: String,
    pub backend: InsightType,
    /// `FROM` target, e.g. `"website_event" AS "e"`.
    pub relation: String,
    pub columns: String,
    /// Qualified cursor column used in predicates and ordering.
    pub cursor_column: String,
    /// Name of the cursor column in the returned rows.
    pub cursor_field: String,
    pub filter: Fragment,
    pub order: SortOrder,
    pub limit: i64,
}

impl KeysetQuery {
    pub fn statement(&self, after: Option<i64>) -> Statement {
        let mut sql = Fragment::raw(format!(
            "SELECT {} FROM {} WHERE ",
            self.columns, self.relation
        ));
        let mut predicates = vec![self.filter.clone()];
        if let Some(after) = after {
            let op = match self.order {
                SortOrder::Asc => ">",
                SortOrder::Desc => "<",
            };
            predicates.push(Fragment::bound(
                format!("{} {op} ?", self.cursor_column),
                vec![BindParam::Int(after)],
            ));
        }
        sql.push(Fragment::and_all(predicates));

        let direction = match self.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        sql.push(Fragment::bound(
            format!(" ORDER BY {} {direction} LIMIT ?", self.cursor_column),
            vec![BindParam::Int(self.limit)],
        ));
        sql.into_statement()
    }

    fn next_cursor(&self, items: &[RawRow]) -> Result<Option<String>> {
        if (items.len() as i64) < self.limit {
            return Ok(None);
        }
        let Some(last) = items.last() else {
            return Ok(None);
        };
        let value = last.get(&self.cursor_field).and_then(cursor_value).ok_or_else(|| {
            ServiceError::Internal(anyhow::anyhow!(
                "cursor column '{}' missing from page",
                self.cursor_field
            ))
        })?;
        Ok(Some(encode_cursor(value)))
    }
}

fn cursor_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(number) => number.as_i64(),
        serde_json::Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

pub async fn page(store: &Store, query: &KeysetQuery, cursor: Option<&str>) -> Result<EventPage> {
    let after = cursor.map(decode_cursor).transpose()?;
    let statement = query.statement(after);
    debug!(sql = %statement.sql, binds = statement.params.len(), "listing statement");

    let items = store
        .fetch(&statement)
        .await
        .map_err(|err| err.into_service_error(&query.insight_id, query.backend))?;
    let next_cursor = query.next_cursor(&items)?;
    Ok(EventPage { items, next_cursor })
}
