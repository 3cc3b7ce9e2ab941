use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers;
use crate::api::state::AppState;
use crate::config::Config;

pub fn create_router(state: AppState, config: &Config) -> Router {
    let origins: Vec<HeaderValue> = config
        .cors_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let lead_routes = Router::new()
        .route("/", post(handlers::leads::create_lead))
        .route(
            "/{id}",
            get(handlers::leads::get_lead).patch(handlers::leads::update_lead),
        )
        .route("/{id}/status", post(handlers::leads::change_status))
        .route("/{id}/archive", post(handlers::leads::archive_lead));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/health/live", get(handlers::liveness))
        .route("/api/board", get(handlers::board::get_board))
        .nest("/api/leads", lead_routes)
        .route("/ws/board", get(handlers::ws::ws_board_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
