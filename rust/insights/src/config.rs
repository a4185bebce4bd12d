use crate::db::PgTlsSettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub max_pool_size: u32,
    pub tls: PgTlsSettings,
    pub warehouse: WarehouseConfig,
    pub default_limit: i64,
    pub max_limit: i64,
    pub max_buckets: usize,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct WarehouseConfig {
    pub enabled: bool,
    pub default_url: Option<String>,
    /// Raw JSON list; parsed by the registry on first resolution.
    pub applications: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    insights_listen_addr: Option<String>,
    #[serde(default)]
    insights_listen_host: Option<String>,
    #[serde(default)]
    insights_listen_port: Option<u16>,
    #[serde(default)]
    insights_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    insights_max_pool_size: u32,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default)]
    insights_warehouse_enabled: bool,
    #[serde(default)]
    insights_warehouse_url: Option<String>,
    #[serde(default)]
    insights_warehouse_applications: Option<String>,
    #[serde(default = "default_limit")]
    insights_default_limit: i64,
    #[serde(default = "default_max_limit")]
    insights_max_limit: i64,
    #[serde(default = "default_max_buckets")]
    insights_max_buckets: usize,
    #[serde(default = "default_timeout_secs")]
    insights_request_timeout_secs: u64,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_limit() -> i64 {
    20
}

const fn default_max_limit() -> i64 {
    100
}

const fn default_max_buckets() -> usize {
    5000
}

const fn default_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse INSIGHTS_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.insights_listen_addr,
            raw.insights_listen_host,
            raw.insights_listen_port,
        )?;

        let database_url = raw
            .insights_database_url
            .or(raw.database_url)
            .context("INSIGHTS_DATABASE_URL or DATABASE_URL must be set")?;

        let applications = raw
            .insights_warehouse_applications
            .filter(|json| !json.trim().is_empty())
            .unwrap_or_else(|| "[]".to_string());

        Ok(Self {
            listen_addr,
            database_url,
            max_pool_size: raw.insights_max_pool_size.max(1),
            tls: PgTlsSettings {
                root_cert: raw.pgsslrootcert,
                client_cert: raw.pgsslcert,
                client_key: raw.pgsslkey,
            },
            warehouse: WarehouseConfig {
                enabled: raw.insights_warehouse_enabled,
                default_url: raw.insights_warehouse_url.filter(|url| !url.trim().is_empty()),
                applications,
            },
            default_limit: raw.insights_default_limit.max(1),
            max_limit: raw.insights_max_limit.max(raw.insights_default_limit),
            max_buckets: raw.insights_max_buckets.max(1),
            request_timeout: Duration::from_secs(raw.insights_request_timeout_secs.max(1)),
        })
    }

    /// Configuration for an in-process engine over `database_url` with
    /// warehouses disabled.
    pub fn embedded(database_url: impl Into<String>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            database_url: database_url.into(),
            max_pool_size: default_pool_size(),
            tls: PgTlsSettings::default(),
            warehouse: WarehouseConfig {
                enabled: false,
                default_url: None,
                applications: "[]".to_string(),
            },
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            max_buckets: default_max_buckets(),
            request_timeout: Duration::from_secs(default_timeout_secs()),
        }
    }

    pub fn with_warehouse(mut self, default_url: Option<String>, applications: impl Into<String>) -> Self {
        self.warehouse = WarehouseConfig {
            enabled: true,
            default_url,
            applications: applications.into(),
        };
        self
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid INSIGHTS_LISTEN_ADDR value")?
            .next()
            .context("INSIGHTS_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    format!("{host}:{port}")
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
