use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::aggregator::Aggregator;
use crate::cache::Cache;
use crate::model::NewsItem;

pub struct AppState {
    pub cache: Cache<Aggregator>,
}

impl AppState {
    pub fn new(cache: Cache<Aggregator>) -> Self {
        Self { cache }
    }

    fn source_count(&self) -> usize {
        self.cache.refresher().sources().len()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/news", get(news))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct NewsQuery {
    /// Maximum number of items to return; zero or negative means all
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub force: bool,
}

#[derive(Serialize)]
struct NewsResponse<'a> {
    count: usize,
    items: &'a [NewsItem],
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sources: usize,
    pub cached_items: usize,
    pub cache_age_seconds: Option<f64>,
}

// Route handlers
pub async fn index(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "sources": state.source_count(),
        "usage": "GET /news?limit=<n>&force=<bool> for aggregated headlines, GET /health for cache status",
    }))
}

pub async fn news(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NewsQuery>,
) -> Response {
    let entry = state.cache.get(query.force).await;

    let items = match usize::try_from(query.limit) {
        Ok(limit) if limit > 0 => &entry.items[..limit.min(entry.items.len())],
        _ => &entry.items[..],
    };

    Json(NewsResponse {
        count: items.len(),
        items,
    })
    .into_response()
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let entry = state.cache.snapshot();

    Json(HealthResponse {
        status: "ok",
        sources: state.source_count(),
        cached_items: entry.items.len(),
        cache_age_seconds: entry.age().map(|age| age.as_secs_f64()),
    })
}
