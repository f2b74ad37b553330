use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::{metrics, state::AppState};

pub async fn health(State(state): State<AppState>) -> Response {
    let store = state.gate.store();
    let settings = store.settings();

    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "rateLimit": {
            "limit": settings.limit,
            "windowSecs": settings.window.as_secs_f64(),
            "trackedClients": store.len(),
        },
    }))
    .into_response()
}

pub async fn metrics_handler() -> Response {
    match metrics::render() {
        Ok(body) => {
            let mut response = body.into_response();
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}
