pub mod scene;

use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new().nest("/scene", scene::router())
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
