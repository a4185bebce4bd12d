use crate::{
    config::AppConfig,
    error::Result,
    models::{EventListRequest, EventPage, InsightQuery, Series},
    query::{InsightsEngine, TranslateResponse},
    state::AppState,
};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let engine = InsightsEngine::from_config(Arc::clone(&config))?;
        Ok(Self::with_engine(config, engine))
    }

    /// Serves an engine that was assembled by the caller.
    pub fn with_engine(config: Arc<AppConfig>, engine: InsightsEngine) -> Self {
        let state = AppState::new(engine);
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/insights/query", post(Self::query))
            .route("/api/insights/translate", post(Self::translate))
            .route("/api/insights/events", post(Self::events))
            .with_state(self.state.clone())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.config.request_timeout,
            ))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "insights listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn query(
        State(state): State<AppState>,
        Json(request): Json<InsightQuery>,
    ) -> Result<Json<Vec<Series>>> {
        let series = state.engine.query(request).await?;
        Ok(Json(series))
    }

    async fn translate(
        State(state): State<AppState>,
        Json(request): Json<InsightQuery>,
    ) -> Result<Json<TranslateResponse>> {
        let response = state.engine.translate(request).await?;
        Ok(Json(response))
    }

    async fn events(
        State(state): State<AppState>,
        Json(request): Json<EventListRequest>,
    ) -> Result<Json<EventPage>> {
        let page = state.engine.list_events(request).await?;
        Ok(Json(page))
    }
}
