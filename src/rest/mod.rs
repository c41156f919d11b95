// rest/mod.rs — Public REST API server.
//
// Axum HTTP server translating the task endpoints to service calls and
// service errors to status codes.
//
// Endpoints:
//   GET    /tasks
//   POST   /tasks
//   PATCH  /tasks/{id}
//   DELETE /tasks/{id}
//   GET    /tasks/search?q=
//   GET    /health

pub mod routes;

use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::service::TaskError;
use crate::AppContext;

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let addr: SocketAddr =
        format!("{}:{}", ctx.config.bind_address, ctx.config.port).parse()?;

    let router = build_router(ctx);

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route(
            "/tasks",
            get(routes::tasks::list_tasks).post(routes::tasks::create_task),
        )
        // Registered alongside "/tasks/{id}"; the static segment wins.
        .route("/tasks/search", get(routes::tasks::search_tasks))
        .route(
            "/tasks/{id}",
            patch(routes::tasks::update_task).delete(routes::tasks::delete_task),
        )
        // Browser single-page clients call this API cross-origin.
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            TaskError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            TaskError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            TaskError::Store(e) => {
                // Full fault server-side only; callers get a generic message.
                error!("request failed: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
