mod middleware;
mod render;
mod videos;

use std::sync::Arc;

use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};

use crate::application::pipeline::RenderPipeline;
use crate::infra::workspace::Workspace;

/// Shared state for every handler.
#[derive(Clone)]
pub struct HttpState {
    pub pipeline: Arc<RenderPipeline>,
    pub workspace: Arc<Workspace>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/api/render", post(render::submit))
        .route("/videos/{*path}", get(videos::serve_artifact))
        .route("/_health", get(health))
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::log_responses))
        .layer(axum::middleware::from_fn(middleware::set_request_context))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
