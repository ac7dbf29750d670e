//! Admin HTTP surface: health/stats/config/positions/DLQ/metrics endpoints
//! plus the direct ingestion path, with CORS, tracing, and bearer-token
//! auth layered around the router.

mod handlers;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::AppError;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/stats", get(handlers::stats))
        .route("/config", get(handlers::get_config))
        .route("/config/reload", post(handlers::reload_config))
        .route("/positions", get(handlers::positions))
        .route("/dlq/stats", get(handlers::dlq_stats))
        .route("/dlq/reprocess", post(handlers::dlq_reprocess))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/logs", post(handlers::ingest))
        .route("/debug/goroutines", get(handlers::debug_goroutines))
        .route("/debug/heap", get(handlers::debug_heap))
        .route("/debug/profile", get(handlers::debug_profile))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_token));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `/health` is exempt; every other admin route requires the configured
/// bearer token when one is set. No token configured means the admin
/// surface trusts network-level access control instead.
async fn require_admin_token(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, AppError> {
    let Some(expected) = &state.admin_auth_token else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(next.run(request).await),
        _ => Err(AppError::new(StatusCode::UNAUTHORIZED, "missing or invalid admin bearer token")),
    }
}
