mod support;

use axum::http::StatusCode;
use serde_json::json;
use support::{fixture, read_json, SITE};

fn e2e_query() -> serde_json::Value {
    json!({
        "insightId": SITE,
        "insightType": "internal",
        "time": {
            "startAt": "2025-08-01T00:00:00Z",
            "endAt": "2025-08-02T00:00:00Z",
            "unit": "day",
            "timezone": "UTC"
        },
        "metrics": [{"name": "$all_event", "math": "events"}],
        "filters": [],
        "groups": []
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let fx = fixture().await;
    let (status, body) = read_json(fx.get("/healthz").await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn query_returns_series() {
    let fx = fixture().await;
    let (status, body) = read_json(fx.post("/api/insights/query", &e2e_query()).await).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(
        body,
        json!([{"name": "$all_event", "data": [{"date": "2025-08-01", "value": 5.0}]}])
    );
}

#[tokio::test]
async fn translate_returns_sql_without_running_it() {
    let fx = fixture().await;
    let (status, body) = read_json(fx.post("/api/insights/translate", &e2e_query()).await).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["backend"], json!("internal"));
    assert_eq!(body["dialect"], json!("sqlite"));
    let sql = body["sql"].as_str().expect("sql should be a string");
    assert!(sql.starts_with("SELECT "));
    assert!(sql.contains("FROM \"website_event\" AS \"e\""));
    assert_eq!(body["params"][0], json!({"t": "text", "v": SITE}));
}

#[tokio::test]
async fn events_listing_pages_with_cursor() {
    let fx = fixture().await;
    let request = json!({"insightId": SITE, "limit": 4, "order": "asc"});
    let (status, first) = read_json(fx.post("/api/insights/events", &request).await).await;
    assert_eq!(status, StatusCode::OK, "body: {first}");
    assert_eq!(first["items"].as_array().map(Vec::len), Some(4));
    let cursor = first["nextCursor"].as_str().expect("first page should be full").to_string();

    let request = json!({"insightId": SITE, "limit": 4, "order": "asc", "cursor": cursor});
    let (status, second) = read_json(fx.post("/api/insights/events", &request).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["items"].as_array().map(Vec::len), Some(3));
    assert_eq!(second["items"][0]["id"], json!(5));
    assert!(second.get("nextCursor").is_none());
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let fx = fixture().await;

    let mut bad_unit = e2e_query();
    bad_unit["time"]["unit"] = json!("fortnight");
    let (status, body) = read_json(fx.post("/api/insights/query", &bad_unit).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("invalid time unit 'fortnight'"));

    let mut unknown_app = e2e_query();
    unknown_app["insightId"] = json!("nope");
    unknown_app["insightType"] = json!("warehouse_wide");
    let (status, _) = read_json(fx.post("/api/insights/query", &unknown_app).await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut broken = e2e_query();
    broken["insightId"] = json!("broken");
    broken["insightType"] = json!("warehouse_wide");
    let (status, body) = read_json(fx.post("/api/insights/query", &broken).await).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let message = body["error"].as_str().unwrap_or_default();
    assert!(message.contains("warehouse-wide insight 'broken'"));
    assert!(!message.contains("sqlite://"));

    let (status, _) = read_json(
        fx.post("/api/insights/events", &json!({"insightId": SITE, "cursor": "%%%"}))
            .await,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
