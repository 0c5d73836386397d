use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue},
    routing::{delete, get, options, post},
    Router,
};
use std::sync::Arc;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_size as usize;

    Router::new()
        // Upload protocol
        .route("/", get(handlers::dispatch_get))
        .route(
            "/",
            post(handlers::process).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/", delete(handlers::revert))
        .route("/", options(handlers::preflight))
        // Form submission
        .route(
            "/submit",
            post(handlers::submit).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/submit", options(handlers::preflight))
        // Internal
        .route("/_internal/health", get(handlers::health))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("OPTIONS, GET, DELETE, POST"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
