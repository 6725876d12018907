//! Client-facing HTTP surface.

pub mod relay;

use crate::call::CallManager;
use crate::transport::CredentialIssuer;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub manager: CallManager,
    pub issuer: Arc<dyn CredentialIssuer>,
    pub media_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/realtime-token", post(issue_token))
        .route("/realtime", get(relay::relay_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "message": "Realtime relay is running" }))
}

/// Mint a credential for browsers that talk to the provider themselves.
async fn issue_token(State(state): State<AppState>) -> Response {
    match state.issuer.issue().await {
        Ok(credential) => Json(credential).into_response(),
        Err(err) => {
            tracing::error!("Failed to issue realtime credential: {err}");
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": err.to_string() }))).into_response()
        }
    }
}
