use std::sync::Arc;

use axum::http::{header, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::server::handlers::{chat_history, health};
use crate::state::AppState;

/// Creates the main application router.
///
/// All chat-history resources live under the `/api/v1` prefix and speak the
/// `{success, data|errors}` envelope.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/api/v1/chat-history/",
            get(chat_history::list_chat_histories).post(chat_history::create_chat_history),
        )
        .route(
            "/api/v1/chat-history/thread/:thread_id",
            get(chat_history::get_chat_history_by_thread),
        )
        .route(
            "/api/v1/chat-history/thread/:thread_id/message",
            post(chat_history::append_message),
        )
        .route(
            "/api/v1/chat-history/thread/:thread_id/clear",
            delete(chat_history::clear_thread),
        )
        .route(
            "/api/v1/chat-history/:id",
            get(chat_history::get_chat_history)
                .put(chat_history::update_chat_history)
                .delete(chat_history::delete_chat_history),
        )
        .with_state(state)
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE])
}
