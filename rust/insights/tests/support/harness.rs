use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use insights::{
    config::AppConfig,
    models::{InsightQuery, Series},
    query::InsightsEngine,
    server::Server,
    sqlite::SqliteStore,
    store::Store,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Once};
use tower::ServiceExt;
use uuid::Uuid;

static TRACING_INIT: Once = Once::new();

pub const SITE: &str = "site-a";

/// Internal event rows: `(id, website, session, event, created_at, url_path, browser, os, country)`.
/// Rows 1-5 fall on 2025-08-01 UTC, row 6 the day before and row 7 on the
/// exclusive end of a one-day window.
#[allow(clippy::type_complexity)]
const WEBSITE_EVENTS: &[(i64, &str, &str, &str, &str, &str, &str, &str, Option<&str>)] = &[
    (1, SITE, "s1", "pageview", "2025-08-01 09:00:00", "/home", "chrome", "mac", Some("DE")),
    (2, SITE, "s1", "signup", "2025-08-01 09:05:00", "/signup", "chrome", "mac", Some("DE")),
    (3, SITE, "s2", "pageview", "2025-08-01 12:30:00", "/pricing", "firefox", "linux", Some("US")),
    (4, SITE, "s3", "pageview", "2025-08-01 18:45:00", "/Home_Page", "safari", "ios", None),
    (5, SITE, "s3", "purchase", "2025-08-01 23:59:59", "/checkout", "safari", "ios", Some("FR")),
    (6, SITE, "s4", "pageview", "2025-07-31 23:59:59", "/home", "chrome", "windows", Some("DE")),
    (7, SITE, "s5", "pageview", "2025-08-02 00:00:00", "/home", "edge", "windows", Some("US")),
    (8, "site-b", "s9", "pageview", "2025-08-01 10:00:00", "/home", "chrome", "mac", Some("DE")),
];

pub const SITE_EVENT_COUNT: usize = 7;

const INTERNAL_SCHEMA: &str = r#"
CREATE TABLE website_event (
    id INTEGER PRIMARY KEY,
    website_id TEXT NOT NULL,
    session_id TEXT,
    event_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    created_date TEXT NOT NULL,
    url_path TEXT,
    url_query TEXT,
    referrer_domain TEXT,
    page_title TEXT,
    hostname TEXT,
    browser TEXT,
    os TEXT,
    device TEXT,
    screen TEXT,
    language TEXT,
    country TEXT,
    subdivision1 TEXT,
    city TEXT
);
"#;

/// Wide rows keep `created_at` in epoch milliseconds and `shipped_at` in
/// epoch seconds. Row 5 lies past a 2025-08-01..03 window. Event 4 carries
/// its `plan` parameter twice.
const WAREHOUSE_SCHEMA: &str = r#"
CREATE TABLE orders_wide (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    amount REAL,
    channel TEXT,
    created_at INTEGER NOT NULL,
    created_date TEXT NOT NULL,
    shipped_at INTEGER
);
INSERT INTO orders_wide VALUES
    (1, 'u1', 'checkout', 5.0, 'web', 1754035200000, '2025-08-01', 1754049600),
    (2, 'u1', 'checkout', 10.0, 'web', 1754078400000, '2025-08-01', 1754125200),
    (3, 'u2', 'checkout', 20.0, 'mobile', 1754128800000, '2025-08-02', NULL),
    (4, 'u3', 'refund', 20.5, 'web', 1754177400000, '2025-08-02', 1754179200),
    (5, 'u2', 'checkout', 99.0, 'store', 1754182800000, '2025-08-03', 1754182800);

CREATE TABLE events (
    id INTEGER PRIMARY KEY,
    event_name TEXT NOT NULL,
    session_id TEXT,
    created_at TEXT NOT NULL
);
INSERT INTO events VALUES
    (1, 'view', 's1', '2025-08-01 10:00:00'),
    (2, 'purchase', 's1', '2025-08-01 10:05:00'),
    (3, 'purchase', 's2', '2025-08-01 11:00:00'),
    (4, 'purchase', 's2', '2025-08-02 09:00:00'),
    (5, 'view', 's3', '2025-08-02 15:00:00');

CREATE TABLE event_params (
    event_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    value TEXT
);
INSERT INTO event_params VALUES
    (2, 'plan', 'pro'), (2, 'amount', '30'),
    (3, 'plan', 'free'), (3, 'amount', '5'),
    (4, 'plan', 'pro'), (4, 'amount', '12'),
    (4, 'plan', 'pro');
"#;

fn applications() -> Value {
    let wide = |name: &str, date_column: Option<&str>, table: &str| {
        json!({
            "type": "wideTable",
            "name": name,
            "tableName": table,
            "createdAtField": "created_at",
            "createdAtFieldType": "timestampMs",
            "dateBasedCreatedAtField": date_column,
            "distinctField": "user_id",
            "eventNameField": "kind",
            "fields": [
                {"name": "amount", "type": "number"},
                {"name": "channel", "type": "string"},
                {"name": "shipped_at", "type": "date", "encoding": "timestamp"}
            ]
        })
    };
    json!([
        wide("orders", Some("created_date"), "orders_wide"),
        wide("orders_plain", None, "orders_wide"),
        wide("broken", None, "missing_table"),
        {
            "type": "longTable",
            "name": "shop",
            "eventTable": {
                "name": "events",
                "eventNameField": "event_name",
                "sessionIdField": "session_id",
                "createdAtField": "created_at",
                "createdAtFieldType": "datetime"
            },
            "eventParametersTable": {
                "name": "event_params",
                "paramsNameField": "name",
                "paramsValueField": "value"
            }
        }
    ])
}

/// An engine over a seeded in-memory internal store and, optionally, a
/// seeded shared-memory warehouse.
pub struct Fixture {
    pub engine: InsightsEngine,
    router: Router,
    pub warehouse_url: Option<String>,
    // Keeps the shared-memory warehouse alive.
    _warehouse: Option<SqliteStore>,
}

impl Fixture {
    pub async fn post<T>(&self, path: &str, payload: &T) -> http::Response<Body>
    where
        T: Serialize,
    {
        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("failed to build harness request");
        self.send(request).await
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("failed to build harness request");
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> http::Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn fixture() -> Fixture {
    let path = format!("file:warehouse-{}?mode=memory&cache=shared", Uuid::new_v4());
    let warehouse = SqliteStore::open(&path).expect("open warehouse");
    warehouse
        .execute_batch(WAREHOUSE_SCHEMA)
        .await
        .expect("seed warehouse");

    let url = format!("sqlite://{path}");
    let config = AppConfig::embedded("sqlite::memory:")
        .with_warehouse(Some(url.clone()), applications().to_string());
    build(config, Some(url), Some(warehouse)).await
}

pub async fn fixture_without_warehouse() -> Fixture {
    build(AppConfig::embedded("sqlite::memory:"), None, None).await
}

async fn build(
    config: AppConfig,
    warehouse_url: Option<String>,
    warehouse: Option<SqliteStore>,
) -> Fixture {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });

    let config = Arc::new(config);
    let engine = InsightsEngine::from_config(Arc::clone(&config)).expect("engine");
    let Store::Sqlite(internal) = engine.internal_store() else {
        panic!("fixture engine should run on sqlite");
    };
    internal
        .execute_batch(&internal_seed())
        .await
        .expect("seed internal store");

    let router = Server::with_engine(config, engine.clone()).router();
    Fixture {
        engine,
        router,
        warehouse_url,
        _warehouse: warehouse,
    }
}

fn internal_seed() -> String {
    let mut sql = INTERNAL_SCHEMA.to_string();
    for (id, website, session, event, created_at, path, browser, os, country) in WEBSITE_EVENTS {
        let country = country.map_or("NULL".to_string(), |c| format!("'{c}'"));
        let created_date = &created_at[..10];
        sql.push_str(&format!(
            "INSERT INTO website_event (id, website_id, session_id, event_name, created_at, created_date, url_path, browser, os, country) \
             VALUES ({id}, '{website}', '{session}', '{event}', '{created_at}', '{created_date}', '{path}', '{browser}', '{os}', {country});\n"
        ));
    }
    sql
}

pub fn insight_query(value: Value) -> InsightQuery {
    serde_json::from_value(value).expect("query fixture should deserialize")
}

/// A UTC `day` query over `[start, end)`.
pub fn day_query(
    insight_id: &str,
    insight_type: &str,
    start: &str,
    end: &str,
    metrics: Value,
    filters: Value,
    groups: Value,
) -> InsightQuery {
    insight_query(json!({
        "insightId": insight_id,
        "insightType": insight_type,
        "time": {"startAt": start, "endAt": end, "unit": "day", "timezone": "UTC"},
        "metrics": metrics,
        "filters": filters,
        "groups": groups
    }))
}

pub fn points(series: &Series) -> Vec<(String, f64)> {
    series
        .data
        .iter()
        .map(|point| (point.date.clone(), point.value))
        .collect()
}

pub fn total(series: &[Series]) -> f64 {
    series
        .iter()
        .flat_map(|s| s.data.iter())
        .map(|point| point.value)
        .sum()
}

pub fn names(series: &[Series]) -> Vec<&str> {
    series.iter().map(|s| s.name.as_str()).collect()
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
