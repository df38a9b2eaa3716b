//! Thin status/read API: signals, trackings, baselines, pair statistics.
//! No write endpoints — the pipeline is the only writer, the API is a
//! read-only window onto it, reusing the ambient request-logging and
//! rate-limit middleware.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app::Observatory;
use crate::middleware::rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitLayer};

pub fn router(state: Arc<Observatory>) -> Router {
    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());

    Router::new()
        .route("/health", get(health))
        .route("/api/signals", get(recent_signals))
        .route("/api/trackings/:signal_id", get(tracking))
        .route("/api/trackings/:signal_id/analysis", get(convergence_analysis))
        .route("/api/pair-stats/:base/:low/:high", get(pair_stats))
        .route("/api/baseline/:base/:low/:high", get(baseline))
        .route("/api/positions/:user_id", get(positions_for_user))
        .route_layer(axum::middleware::from_fn(crate::middleware::request_logging))
        .route_layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn recent_signals(State(state): State<Arc<Observatory>>) -> impl IntoResponse {
    match state.store.recent_signals(100).await {
        Ok(signals) => Json(signals).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn tracking(
    State(state): State<Arc<Observatory>>,
    Path(signal_id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get_tracking(signal_id).await {
        Ok(Some(tracking)) => Json(tracking).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn convergence_analysis(
    State(state): State<Arc<Observatory>>,
    Path(signal_id): Path<i64>,
) -> impl IntoResponse {
    match state.store.convergence_analysis_for(signal_id).await {
        Ok(Some(analysis)) => Json(analysis).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn pair_stats(
    State(state): State<Arc<Observatory>>,
    Path((base, low, high)): Path<(String, String, String)>,
) -> impl IntoResponse {
    match state.pair_stats.get(&base, &low, &high).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct BaselineQuery {
    current_spread_pct: Option<f64>,
}

async fn baseline(
    State(state): State<Arc<Observatory>>,
    Path((base, low, high)): Path<(String, String, String)>,
    Query(query): Query<BaselineQuery>,
) -> impl IntoResponse {
    match state
        .store
        .baseline_summary(&base, &low, &high, query.current_spread_pct)
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn positions_for_user(
    State(state): State<Arc<Observatory>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.store.positions_for_user(&user_id).await {
        Ok(positions) => Json(positions).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
