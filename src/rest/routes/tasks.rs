// rest/routes/tasks.rs — Task REST routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::service::TaskError;
use crate::storage::TaskRow;
use crate::AppContext;

/// Body for `POST /tasks`. `title` is optional here so that a request
/// without one reaches the service and gets the 400 it deserves, instead of
/// being rejected mid-deserialization.
#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Body for `PATCH /tasks/{id}`. Absent fields are left unchanged.
#[derive(Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

pub async fn list_tasks(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Vec<TaskRow>>, TaskError> {
    Ok(Json(ctx.tasks.list().await?))
}

pub async fn create_task(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskRow>), TaskError> {
    let task = ctx.tasks.create(body.title, body.description).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn update_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateTaskRequest>,
) -> Result<Json<TaskRow>, TaskError> {
    let task = ctx.tasks.update(&id, body.title, body.description).await?;
    Ok(Json(task))
}

pub async fn delete_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<StatusCode, TaskError> {
    ctx.tasks.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn search_tasks(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<TaskRow>>, TaskError> {
    Ok(Json(ctx.tasks.search(&params.q).await?))
}
