//! Warehouse application mappings and the pools that serve them.
//!
//! The application list is parsed on first use and cached until
//! [`SchemaRegistry::reload`]. Pools are keyed by connection string and kept
//! for the life of the registry.

use crate::{
    config::WarehouseConfig,
    db::PgTlsSettings,
    error::{Result, ServiceError},
    ident::SafeIdent,
    models::{InsightType, ValueType},
    query::date::TimestampEncoding,
    store::Store,
};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WarehouseApplication {
    #[serde(rename = "longTable")]
    LongTable(LongTableApplication),
    #[serde(rename = "wideTable")]
    WideTable(WideTableApplication),
}

impl WarehouseApplication {
    pub fn name(&self) -> &str {
        match self {
            WarehouseApplication::LongTable(app) => &app.name,
            WarehouseApplication::WideTable(app) => &app.name,
        }
    }

    pub fn insight_type(&self) -> InsightType {
        match self {
            WarehouseApplication::LongTable(_) => InsightType::WarehouseLong,
            WarehouseApplication::WideTable(_) => InsightType::WarehouseWide,
        }
    }

    fn database_url(&self) -> Option<&str> {
        match self {
            WarehouseApplication::LongTable(app) => app.database_url.as_deref(),
            WarehouseApplication::WideTable(app) => app.database_url.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongTableApplication {
    pub name: String,
    #[serde(default, skip_serializing)]
    pub database_url: Option<String>,
    pub event_table: EventTable,
    pub event_parameters_table: EventParametersTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTable {
    pub name: SafeIdent,
    #[serde(default = "default_id_field")]
    pub id_field: SafeIdent,
    pub event_name_field: SafeIdent,
    #[serde(default)]
    pub session_id_field: Option<SafeIdent>,
    pub created_at_field: SafeIdent,
    #[serde(default)]
    pub created_at_field_type: TimestampEncoding,
    #[serde(default)]
    pub date_based_created_at_field: Option<SafeIdent>,
    /// Zone whose calendar `date_based_created_at_field` is stored in.
    #[serde(default = "default_date_zone")]
    pub date_based_created_at_timezone: Tz,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventParametersTable {
    pub name: SafeIdent,
    #[serde(default = "default_event_id_field")]
    pub event_id_field: SafeIdent,
    pub params_name_field: SafeIdent,
    pub params_value_field: SafeIdent,
    #[serde(default)]
    pub params_value_number_field: Option<SafeIdent>,
    #[serde(default)]
    pub params_value_string_field: Option<SafeIdent>,
    #[serde(default)]
    pub params_value_date_field: Option<SafeIdent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WideTableApplication {
    pub name: String,
    #[serde(default, skip_serializing)]
    pub database_url: Option<String>,
    pub table_name: SafeIdent,
    pub created_at_field: SafeIdent,
    #[serde(default)]
    pub created_at_field_type: TimestampEncoding,
    #[serde(default)]
    pub date_based_created_at_field: Option<SafeIdent>,
    /// Zone whose calendar `date_based_created_at_field` is stored in.
    #[serde(default = "default_date_zone")]
    pub date_based_created_at_timezone: Tz,
    pub distinct_field: SafeIdent,
    #[serde(default)]
    pub event_name_field: Option<SafeIdent>,
    #[serde(default)]
    pub fields: Vec<WideField>,
}

impl WideTableApplication {
    pub fn field(&self, name: &str) -> Option<&WideField> {
        self.fields.iter().find(|field| field.name.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideField {
    pub name: SafeIdent,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<TimestampEncoding>,
}

fn default_id_field() -> SafeIdent {
    SafeIdent::trusted("id")
}

fn default_event_id_field() -> SafeIdent {
    SafeIdent::trusted("event_id")
}

fn default_date_zone() -> Tz {
    Tz::UTC
}

/// What an insight resolves to. Internal insights run on the engine's own
/// store.
#[derive(Debug, Clone)]
pub enum ResolvedInsight {
    Internal,
    LongTable {
        app: LongTableApplication,
        store: Store,
    },
    WideTable {
        app: WideTableApplication,
        store: Store,
    },
}

pub struct SchemaRegistry {
    warehouse: WarehouseConfig,
    max_pool_size: u32,
    tls: PgTlsSettings,
    raw_applications: RwLock<String>,
    applications: RwLock<Option<Arc<Vec<WarehouseApplication>>>>,
    pools: Mutex<HashMap<String, Store>>,
}

impl SchemaRegistry {
    pub fn new(warehouse: WarehouseConfig, max_pool_size: u32, tls: PgTlsSettings) -> Self {
        let raw = warehouse.applications.clone();
        Self {
            warehouse,
            max_pool_size,
            tls,
            raw_applications: RwLock::new(raw),
            applications: RwLock::new(None),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, insight_id: &str, insight_type: InsightType) -> Result<ResolvedInsight> {
        if insight_type == InsightType::Internal {
            return Ok(ResolvedInsight::Internal);
        }

        if !self.warehouse.enabled {
            return Err(ServiceError::BackendUnavailable {
                kind: insight_type.to_string(),
                reason: "warehouse backends are disabled".to_string(),
            });
        }

        let applications = self.applications()?;
        let app = applications
            .iter()
            .find(|app| app.name() == insight_id && app.insight_type() == insight_type)
            .ok_or_else(|| ServiceError::ApplicationNotFound {
                insight_id: insight_id.to_string(),
                kind: insight_type.to_string(),
            })?;

        let url = app
            .database_url()
            .or(self.warehouse.default_url.as_deref())
            .ok_or_else(|| ServiceError::BackendUnavailable {
                kind: insight_type.to_string(),
                reason: "no warehouse connection configured".to_string(),
            })?;
        let store = self.store_for(url, insight_type)?;

        Ok(match app {
            WarehouseApplication::LongTable(app) => ResolvedInsight::LongTable {
                app: app.clone(),
                store,
            },
            WarehouseApplication::WideTable(app) => ResolvedInsight::WideTable {
                app: app.clone(),
                store,
            },
        })
    }

    /// The parsed application list. Parse failures are reported on every call
    /// and never cached.
    pub fn applications(&self) -> Result<Arc<Vec<WarehouseApplication>>> {
        if let Some(parsed) = self.applications.read().as_ref() {
            return Ok(Arc::clone(parsed));
        }

        let mut slot = self.applications.write();
        if let Some(parsed) = slot.as_ref() {
            return Ok(Arc::clone(parsed));
        }

        let parsed = Arc::new(parse_applications(&self.raw_applications.read())?);
        info!(count = parsed.len(), "loaded warehouse applications");
        *slot = Some(Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Replaces the application list. Existing pools are kept.
    pub fn reload(&self, raw: impl Into<String>) -> Result<usize> {
        let raw = raw.into();
        let parsed = Arc::new(parse_applications(&raw)?);
        let count = parsed.len();

        let mut slot = self.applications.write();
        *self.raw_applications.write() = raw;
        *slot = Some(parsed);
        info!(count, "reloaded warehouse applications");
        Ok(count)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    fn store_for(&self, url: &str, insight_type: InsightType) -> Result<Store> {
        let mut pools = self.pools.lock();
        if let Some(store) = pools.get(url) {
            return Ok(store.clone());
        }

        let store = Store::connect_lazy(url, self.max_pool_size, &self.tls).map_err(|err| {
            ServiceError::BackendUnavailable {
                kind: insight_type.to_string(),
                reason: err.to_string(),
            }
        })?;
        info!(
            backend = %insight_type,
            dialect = ?store.dialect(),
            pools = pools.len() + 1,
            "created warehouse pool"
        );
        pools.insert(url.to_string(), store.clone());
        Ok(store)
    }
}

fn parse_applications(raw: &str) -> Result<Vec<WarehouseApplication>> {
    let applications: Vec<WarehouseApplication> = serde_json::from_str(raw)
        .map_err(|err| ServiceError::ApplicationConfigInvalid(err.to_string()))?;

    let mut seen = HashSet::new();
    for app in &applications {
        if app.name().trim().is_empty() {
            return Err(ServiceError::ApplicationConfigInvalid(
                "application name must not be empty".to_string(),
            ));
        }
        if !seen.insert((app.name().to_string(), app.insight_type())) {
            return Err(ServiceError::ApplicationConfigInvalid(format!(
                "duplicate {} application '{}'",
                app.insight_type(),
                app.name()
            )));
        }
    }

    Ok(applications)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wide_app(name: &str, url: Option<&str>) -> serde_json::Value {
        json!({
            "type": "wideTable",
            "name": name,
            "databaseUrl": url,
            "tableName": "orders",
            "createdAtField": "ts",
            "createdAtFieldType": "timestampMs",
            "distinctField": "user_id",
            "fields": [{"name": "amount", "type": "number"}]
        })
    }

    fn registry(apps: serde_json::Value, enabled: bool) -> SchemaRegistry {
        SchemaRegistry::new(
            WarehouseConfig {
                enabled,
                default_url: Some("sqlite::memory:".into()),
                applications: apps.to_string(),
            },
            2,
            PgTlsSettings::default(),
        )
    }

    #[test]
    fn parses_long_table_defaults() {
        let apps = parse_applications(
            &json!([{
                "type": "longTable",
                "name": "game",
                "eventTable": {
                    "name": "events",
                    "eventNameField": "event",
                    "createdAtField": "created_at",
                    "createdAtFieldType": "timestamp"
                },
                "eventParametersTable": {
                    "name": "event_params",
                    "paramsNameField": "key",
                    "paramsValueField": "value"
                }
            }])
            .to_string(),
        )
        .unwrap();
        let WarehouseApplication::LongTable(app) = &apps[0] else {
            panic!("expected long table");
        };
        assert_eq!(app.event_table.id_field.as_str(), "id");
        assert_eq!(app.event_parameters_table.event_id_field.as_str(), "event_id");
        assert_eq!(app.event_table.created_at_field_type, TimestampEncoding::Timestamp);
        assert_eq!(app.event_table.date_based_created_at_timezone, Tz::UTC);
    }

    #[test]
    fn date_column_zone_is_configurable() {
        let mut app = wide_app("shop", None);
        app["dateBasedCreatedAtField"] = json!("created_date");
        app["dateBasedCreatedAtTimezone"] = json!("Asia/Shanghai");
        let apps = parse_applications(&json!([app]).to_string()).unwrap();
        let WarehouseApplication::WideTable(app) = &apps[0] else {
            panic!("expected wide table");
        };
        assert_eq!(app.date_based_created_at_timezone, Tz::Asia__Shanghai);

        let mut bad = wide_app("shop", None);
        bad["dateBasedCreatedAtTimezone"] = json!("Mars/Olympus");
        assert!(matches!(
            parse_applications(&json!([bad]).to_string()),
            Err(ServiceError::ApplicationConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_unsafe_identifiers_in_config() {
        let mut app = wide_app("shop", None);
        app["tableName"] = json!("orders; DROP TABLE users");
        let registry = registry(json!([app]), true);
        assert!(matches!(
            registry.resolve("shop", InsightType::WarehouseWide),
            Err(ServiceError::ApplicationConfigInvalid(_))
        ));
    }

    #[test]
    fn malformed_config_is_not_cached() {
        let registry = SchemaRegistry::new(
            WarehouseConfig {
                enabled: true,
                default_url: None,
                applications: "{not json".into(),
            },
            2,
            PgTlsSettings::default(),
        );
        for _ in 0..2 {
            assert!(matches!(
                registry.applications(),
                Err(ServiceError::ApplicationConfigInvalid(_))
            ));
        }
        assert_eq!(registry.reload(json!([wide_app("shop", None)]).to_string()).unwrap(), 1);
        assert_eq!(registry.applications().unwrap().len(), 1);
    }

    #[test]
    fn lookup_matches_name_and_sub_type() {
        let registry = registry(json!([wide_app("shop", None)]), true);
        assert!(matches!(
            registry.resolve("shop", InsightType::WarehouseLong),
            Err(ServiceError::ApplicationNotFound { .. })
        ));
        assert!(matches!(
            registry.resolve("other", InsightType::WarehouseWide),
            Err(ServiceError::ApplicationNotFound { insight_id, .. }) if insight_id == "other"
        ));
        assert!(matches!(
            registry.resolve("shop", InsightType::WarehouseWide),
            Ok(ResolvedInsight::WideTable { .. })
        ));
        assert!(matches!(
            registry.resolve("anything", InsightType::Internal),
            Ok(ResolvedInsight::Internal)
        ));
    }

    #[test]
    fn disabled_warehouse_is_unavailable() {
        let registry = registry(json!([wide_app("shop", None)]), false);
        assert!(matches!(
            registry.resolve("shop", InsightType::WarehouseWide),
            Err(ServiceError::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn pools_are_shared_per_connection_string() {
        let registry = registry(
            json!([
                wide_app("a", None),
                wide_app("b", None),
                wide_app("c", Some("sqlite://file:registry-c?mode=memory&cache=shared"))
            ]),
            true,
        );
        let first = registry.applications().unwrap();
        for name in ["a", "b", "a", "c"] {
            registry.resolve(name, InsightType::WarehouseWide).unwrap();
        }
        assert_eq!(registry.pool_count(), 2);
        assert!(Arc::ptr_eq(&first, &registry.applications().unwrap()));
    }

    #[test]
    fn unreachable_warehouses_hide_the_connection_string() {
        let registry = registry(
            json!([wide_app("shop", Some("sqlite:///nonexistent-dir/secret-creds.db"))]),
            true,
        );
        let Err(err) = registry.resolve("shop", InsightType::WarehouseWide) else {
            panic!("expected the warehouse to be unavailable");
        };
        assert!(matches!(err, ServiceError::BackendUnavailable { .. }));
        let rendered = err.to_string();
        assert!(!rendered.contains("secret-creds"), "{rendered}");
        assert!(!rendered.contains("nonexistent-dir"), "{rendered}");
        assert_eq!(registry.pool_count(), 0);
    }

    #[test]
    fn duplicate_applications_are_invalid() {
        let registry = registry(json!([wide_app("a", None), wide_app("a", None)]), true);
        assert!(matches!(
            registry.resolve("a", InsightType::WarehouseWide),
            Err(ServiceError::ApplicationConfigInvalid(_))
        ));
    }
}
