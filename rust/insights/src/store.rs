//! Storage handles. A [`Store`] is cheap to clone and is what builders run
//! their statements against.

use crate::{
    db::{self, PgPool, PgTlsSettings},
    error::ServiceError,
    models::InsightType,
    sql::{Dialect, Statement},
    sqlite::SqliteStore,
};
use thiserror::Error;
use tracing::warn;

/// One result row keyed by column name.
pub type RawRow = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Execution(anyhow::Error),
}

impl StoreError {
    pub fn into_service_error(self, insight_id: &str, backend: InsightType) -> ServiceError {
        match self {
            StoreError::Unavailable(reason) => ServiceError::BackendUnavailable {
                kind: backend.to_string(),
                reason,
            },
            StoreError::Execution(source) => ServiceError::StatementExecutionFailed {
                insight_id: insight_id.to_string(),
                backend: backend.to_string(),
                source,
            },
        }
    }
}

#[derive(Clone)]
pub enum Store {
    Postgres(PgPool),
    Sqlite(SqliteStore),
}

impl Store {
    /// Opens a handle for `url` without touching the network. Postgres pools
    /// connect on first use; SQLite files are opened immediately.
    pub fn connect_lazy(url: &str, max_pool_size: u32, tls: &PgTlsSettings) -> Result<Self, StoreError> {
        let url = url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return db::lazy_pool(url, max_pool_size, tls)
                .map(Store::Postgres)
                .map_err(|err| StoreError::Unavailable(format!("{err:#}")));
        }

        if url == "sqlite::memory:" {
            return SqliteStore::in_memory()
                .map(Store::Sqlite)
                .map_err(|err| StoreError::Unavailable(format!("{err:#}")));
        }

        if let Some(path) = url.strip_prefix("sqlite://") {
            // The driver's open error names the file.
            return SqliteStore::open(path).map(Store::Sqlite).map_err(|err| {
                warn!(error = ?err, "sqlite store unavailable");
                StoreError::Unavailable(err.to_string())
            });
        }

        Err(StoreError::Unavailable(
            "unsupported connection string scheme".to_string(),
        ))
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            Store::Postgres(_) => Dialect::Postgres,
            Store::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub async fn fetch(&self, statement: &Statement) -> Result<Vec<RawRow>, StoreError> {
        match self {
            Store::Postgres(pool) => db::fetch_json_rows(pool, statement).await,
            Store::Sqlite(store) => store.fetch(statement).await,
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Store::Postgres(_) => f.write_str("Store::Postgres"),
            Store::Sqlite(_) => f.write_str("Store::Sqlite"),
        }
    }
}
