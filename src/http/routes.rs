//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::game::map::MapData;
use crate::http::middleware::rate_limit;
use crate::util::rate_limit::{create_limiter, API_RATE_LIMIT};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;
use crate::ws::protocol::{MatchStateKind, Scores};

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.client_origin);

    // JSON endpoints share one process-wide budget; the socket has its own
    let api_routes = Router::new()
        .route("/match", get(match_handler))
        .route("/map", get(map_handler))
        .layer(middleware::from_fn_with_state(
            create_limiter(API_RATE_LIMIT),
            rate_limit,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .merge(api_routes)
        .fallback(not_found_handler)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS from `CLIENT_ORIGIN`: `*` or a comma-separated origin list
fn cors_layer(client_origin: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if client_origin.trim() == "*" {
        return base.allow_origin(AllowOrigin::any());
    }

    let allowed_origins: Vec<header::HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();
    base.allow_origin(allowed_origins).allow_credentials(true)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    match_state: MatchStateKind,
    players: usize,
    connected_peers: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.match_handle.status();

    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        match_state: status.state,
        players: status.player_count,
        connected_peers: state.match_handle.connected_peers(),
    })
}

// ============================================================================
// Match endpoints
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchResponse {
    state: MatchStateKind,
    player_count: usize,
    max_players: usize,
    ready_count: usize,
    scores: Scores,
    map: String,
}

async fn match_handler(State(state): State<AppState>) -> Json<MatchResponse> {
    let status = state.match_handle.status();

    Json(MatchResponse {
        state: status.state,
        player_count: status.player_count,
        max_players: status.max_players,
        ready_count: status.ready_count,
        scores: status.scores,
        map: status.map.name.clone(),
    })
}

async fn map_handler(State(state): State<AppState>) -> Json<MapData> {
    let map = state.match_handle.status().map;
    Json((*map).clone())
}

async fn not_found_handler(uri: Uri) -> AppError {
    AppError::NotFound(uri.path().to_string())
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Too many requests")]
    TooManyRequests,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::TooManyRequests => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
