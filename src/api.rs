// src/api.rs
//! Boundary HTTP interface: paginated listings of curated records, the
//! since-last-Friday listing, allow-listed partial updates, and liveness.
//! Validation failures map to 400, everything else internal to 500.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::error::HarvestError;
use crate::model::DiscussionRecord;
use crate::pipeline::last_friday;
use crate::store::{parse_updates, DiscussionStore};

#[derive(Clone)]
pub struct AppState {
    pub store: DiscussionStore,
    pub environment: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/data", get(get_data).put(update_data))
        .route("/latest", get(get_latest))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"status": "error", "detail": detail}))).into_response()
    }
}

impl From<HarvestError> for ApiError {
    fn from(e: HarvestError) -> Self {
        match e {
            HarvestError::Validation(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(serde::Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: u64,
    #[serde(default = "default_page_size")]
    page_size: u64,
}

fn default_page() -> u64 {
    1
}

fn default_page_size() -> u64 {
    10
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"status": "ok", "environment": state.environment}))
}

/// Storage keeps `is_deleted`; the API exposes it as `source_deleted`.
fn present(rows: Vec<DiscussionRecord>) -> Vec<Value> {
    rows.into_iter()
        .map(|row| {
            let mut value = serde_json::to_value(&row).unwrap_or(Value::Null);
            if let Some(obj) = value.as_object_mut() {
                if let Some(deleted) = obj.remove("is_deleted") {
                    obj.insert("source_deleted".to_string(), deleted);
                }
            }
            value
        })
        .collect()
}

async fn get_data(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let rows = state.store.fetch_page(q.page, q.page_size).await?;
    let total = state.store.total_count().await?;
    Ok(Json(json!({
        "status": "success",
        "data": present(rows),
        "total": total,
        "page": q.page,
        "page_size": q.page_size,
    })))
}

async fn get_latest(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let cutoff = last_friday(Utc::now());
    let rows = state.store.fetch_since(cutoff, q.page, q.page_size).await?;
    Ok(Json(json!({
        "status": "success",
        "data": present(rows),
        "since": cutoff,
        "page": q.page,
        "page_size": q.page_size,
    })))
}

async fn update_data(
    State(state): State<AppState>,
    Json(items): Json<Vec<Value>>,
) -> Result<Json<Value>, ApiError> {
    let updates = parse_updates(&items).map_err(ApiError::BadRequest)?;
    let affected = state.store.apply_updates(&updates).await?;
    Ok(Json(json!({"status": "success", "affected_rows": affected})))
}
