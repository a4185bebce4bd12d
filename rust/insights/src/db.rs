//! PostgreSQL pools and row fetching for the internal store and warehouses.

use crate::{
    sql::{BindParam, Dialect, Statement},
    store::{RawRow, StoreError},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool, RunError};
use diesel::deserialize::QueryableByName;
use diesel::pg::Pg;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_query;
use diesel::sql_types::Text;
use diesel_async::{AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use tokio_postgres::{Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error};

pub type PgPool = Pool<PgConnectionManager>;

/// Optional `PGSSL*` material shared by every Postgres pool.
#[derive(Debug, Clone, Default)]
pub struct PgTlsSettings {
    pub root_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

/// Builds a pool without opening a connection; the first query connects.
pub fn lazy_pool(database_url: &str, max_size: u32, tls: &PgTlsSettings) -> Result<PgPool> {
    let manager = PgConnectionManager::new(
        database_url,
        tls.root_cert.as_deref(),
        tls.client_cert.as_deref(),
        tls.client_key.as_deref(),
    )?;
    Ok(Pool::builder()
        .max_size(max_size.max(1))
        .build_unchecked(manager))
}

#[derive(Debug, QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Text)]
    payload: String,
}

/// Runs a statement and returns each row as a column-name map. The statement
/// is wrapped in `row_to_json` so arbitrary result shapes decode through one
/// text column.
pub async fn fetch_json_rows(
    pool: &PgPool,
    statement: &Statement,
) -> std::result::Result<Vec<RawRow>, StoreError> {
    let mut conn = pool.get().await.map_err(|err| {
        error!(error = ?err, "failed to acquire warehouse connection");
        checkout_error(err)
    })?;

    let sql = format!(
        "SELECT row_to_json(t)::text AS payload FROM ({}) AS t",
        Dialect::Postgres.render_placeholders(&statement.sql)
    );
    let mut query = sql_query(sql).into_boxed::<Pg>();
    for param in &statement.params {
        query = apply_bind(query, param);
    }

    let rows: Vec<JsonRow> = query
        .load(&mut *conn)
        .await
        .map_err(|err| StoreError::Execution(err.into()))?;
    debug!(rows = rows.len(), "postgres statement returned");

    rows.into_iter()
        .map(|row| {
            serde_json::from_str::<RawRow>(&row.payload)
                .map_err(|err| StoreError::Execution(anyhow::anyhow!("invalid row payload: {err}")))
        })
        .collect()
}

fn checkout_error(err: RunError<anyhow::Error>) -> StoreError {
    StoreError::Unavailable(match err {
        RunError::User(source) => format!("{source:#}"),
        RunError::TimedOut => "timed out waiting for a connection".to_string(),
    })
}

fn apply_bind<'a>(
    query: BoxedSqlQuery<'a, Pg, SqlQuery>,
    param: &BindParam,
) -> BoxedSqlQuery<'a, Pg, SqlQuery> {
    use diesel::sql_types::{Bool, Float8, Int8};
    match param {
        BindParam::Text(value) => query.bind::<Text, _>(value.clone()),
        BindParam::Int(value) => query.bind::<Int8, _>(*value),
        BindParam::Float(value) => query.bind::<Float8, _>(*value),
        BindParam::Bool(value) => query.bind::<Bool, _>(*value),
    }
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: PgTls,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

impl PgConnectionManager {
    fn new(
        database_url: &str,
        root_cert: Option<&str>,
        client_cert: Option<&str>,
        client_key: Option<&str>,
    ) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid postgres connection string")?;
        let tls = if let Some(path) = root_cert {
            PgTls::Rustls(build_tls_connector(path, client_cert, client_key)?)
        } else {
            PgTls::None
        };
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let config = self.config.clone();
        match &self.tls {
            PgTls::None => {
                let (client, connection) = config.connect(NoTls).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection)
                    .await
                    .map_err(|err| anyhow::anyhow!(err))
            }
            PgTls::Rustls(connector) => {
                let (client, connection) = config.connect(connector.clone()).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection)
                    .await
                    .map_err(|err| anyhow::anyhow!(err))
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

fn build_tls_connector(
    root_cert: &str,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> Result<MakeRustlsConnect> {
    let mut reader = BufReader::new(File::open(root_cert).context("failed to open PGSSLROOTCERT")?);
    let mut root_store = RootCertStore::empty();
    for cert in certs(&mut reader) {
        let cert = cert.context("failed to parse PGSSLROOTCERT")?;
        root_store
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid certificate in PGSSLROOTCERT"))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let config = match (client_cert, client_key) {
        (None, None) => builder.with_no_client_auth(),
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_client_certs(cert)?, load_client_key(key)?)
            .with_context(|| format!("failed to build client TLS config for {root_cert}"))?,
        _ => anyhow::bail!("PGSSLCERT and PGSSLKEY must both be set (or neither)"),
    };

    Ok(MakeRustlsConnect::new(config))
}

fn load_client_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLCERT file '{path}'"))?,
    );

    let chain = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse PGSSLCERT")?;
    if chain.is_empty() {
        anyhow::bail!("PGSSLCERT contained no certificates");
    }

    Ok(chain)
}

fn load_client_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLKEY file '{path}'"))?,
    );

    rustls_pemfile::private_key(&mut reader)
        .context("failed to parse PGSSLKEY")?
        .context("PGSSLKEY contained no private keys")
}
