pub mod auth;
pub mod config;
pub mod database;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;
pub mod streaming;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

use axum::{
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use std::time::Duration;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

pub use state::AppState;

/// HTTP surface. Request/response routes are bounded by the server timeout;
/// the SSE and websocket routes are long-lived and are not.
pub fn build_router(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.settings.server.request_timeout_seconds);

    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check));

    let api_routes = Router::new()
        .route(
            "/api/conversations",
            post(handlers::conversations::start_conversation)
                .get(handlers::conversations::list_conversations),
        )
        .route(
            "/api/conversations/history",
            post(handlers::conversations::conversation_history),
        )
        .route(
            "/api/conversations/{id}",
            get(handlers::conversations::get_conversation),
        )
        .route(
            "/api/conversations/{id}/settings",
            put(handlers::conversations::update_settings),
        )
        .route(
            "/api/conversations/{id}/pause",
            post(handlers::conversations::pause_conversation),
        )
        .route(
            "/api/conversations/{id}/resume",
            post(handlers::conversations::resume_conversation),
        )
        .route(
            "/api/conversations/{id}/end",
            post(handlers::conversations::end_conversation),
        )
        .route(
            "/api/conversations/{id}/messages",
            get(handlers::conversations::list_messages).post(handlers::chat::send_message),
        )
        .route(
            "/api/characters/{character_id}/statistics",
            get(handlers::conversations::conversation_statistics),
        )
        .route(
            "/api/characters/{character_id}/memories",
            get(handlers::memories::list_memories).post(handlers::memories::add_memories),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));

    let streaming_routes = Router::new()
        .route(
            "/api/conversations/{id}/messages/stream",
            post(handlers::chat::stream_message),
        )
        .route("/ws", get(handlers::ws::ws_handler));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .merge(streaming_routes)
        .with_state(state)
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
}
