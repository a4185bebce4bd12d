//! Embedded SQLite store used for single-node deployments and fixtures.

use crate::{
    sql::{BindParam, Statement},
    store::{RawRow, StoreError},
};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("failed to open sqlite database")?;
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs DDL or seed statements.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .execute_batch(&sql)
                .context("sqlite batch failed")
        })
        .await
        .context("sqlite worker panicked")?
    }

    pub async fn fetch(&self, statement: &Statement) -> std::result::Result<Vec<RawRow>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let statement = statement.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            query_rows(&conn, &statement).map_err(StoreError::Execution)
        })
        .await
        .map_err(|err| StoreError::Execution(err.into()))?
    }
}

fn query_rows(conn: &Connection, statement: &Statement) -> Result<Vec<RawRow>> {
    let mut prepared = conn
        .prepare(&statement.sql)
        .context("failed to prepare statement")?;
    let column_names = prepared
        .column_names()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let params = statement.params.iter().map(sql_value).collect::<Vec<_>>();
    let mut rows = prepared
        .query(params_from_iter(params.iter()))
        .context("failed to execute statement")?;

    let mut records = Vec::new();
    while let Some(row) = rows.next().context("failed to fetch row")? {
        let mut record = RawRow::new();
        for (index, name) in column_names.iter().enumerate() {
            let value = row
                .get::<usize, SqlValue>(index)
                .context("failed to decode column")?;
            record.insert(name.clone(), json_value(value));
        }
        records.push(record);
    }
    Ok(records)
}

fn sql_value(param: &BindParam) -> SqlValue {
    match param {
        BindParam::Text(value) => SqlValue::Text(value.clone()),
        BindParam::Int(value) => SqlValue::Integer(*value),
        BindParam::Float(value) => SqlValue::Real(*value),
        BindParam::Bool(value) => SqlValue::Integer(i64::from(*value)),
    }
}

fn json_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(value) => Value::from(value),
        SqlValue::Real(value) => serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(value) => Value::String(value),
        SqlValue::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}
