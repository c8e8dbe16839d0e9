use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::error::AppError;
use crate::services::task_store::{Task, TaskOptions};

#[derive(Deserialize, ToSchema)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(rename = "aspectRatio")]
    pub aspect_ratio: Option<String>,
    #[serde(rename = "imageSize")]
    pub image_size: Option<String>,
    #[serde(default)]
    pub images: Vec<Value>,
}

#[utoipa::path(
    post,
    path = "/generate",
    request_body = GenerateRequest,
    responses(
        (status = 202, description = "Task accepted, poll /task/{id}"),
        (status = 400, description = "Empty prompt"),
        (status = 500, description = "Upstream preflight failed")
    ),
    security(("jwt" = []))
)]
pub async fn generate(
    State(state): State<crate::AppState>,
    Json(payload): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    // Both upstreams are verified before any billable work; the storage
    // check runs first so a broken bucket mints no OAuth token.
    if let Err(e) = state.object_store.preflight().await {
        tracing::error!("storage preflight failed: {e}");
        return Err(AppError::Preflight(
            "B2_PRECHECK_FAILED: see /__b2check".to_string(),
        ));
    }
    if let Err(e) = state.model.preflight().await {
        tracing::error!("model preflight failed: {e}");
        return Err(AppError::Preflight(
            "VERTEX_PRECHECK_FAILED: see /__vertexcheck".to_string(),
        ));
    }

    let prompt = payload.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(AppError::BadRequest("prompt 不能为空".to_string()));
    }

    let options = TaskOptions {
        aspect_ratio: payload
            .aspect_ratio
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "1:1".to_string()),
        image_size: payload
            .image_size
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "4K".to_string()),
    };

    let task = Task::pending(
        Uuid::new_v4().to_string(),
        prompt,
        options,
        Value::Array(payload.images),
    );

    state.tasks.insert(task.clone());
    state.executor.spawn(task.clone());

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "taskId": task.task_id,
            "status": task.status,
            "progress": task.progress,
        })),
    ))
}

#[utoipa::path(
    get,
    path = "/task/{id}",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task record", body = Task),
        (status = 404, description = "Unknown or expired task")
    )
)]
pub async fn get_task(
    State(state): State<crate::AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, AppError> {
    state
        .tasks
        .get(&task_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("task not found".to_string()))
}

#[utoipa::path(
    get,
    path = "/__b2check",
    responses((status = 200, description = "Storage plane diagnostic"))
)]
pub async fn b2_check(State(state): State<crate::AppState>) -> Json<Value> {
    match state.object_store.preflight().await {
        Ok(summary) => Json(summary),
        Err(e) => Json(json!({ "ok": false, "error": e.to_string() })),
    }
}

#[utoipa::path(
    get,
    path = "/__vertexcheck",
    responses((status = 200, description = "Model plane diagnostic"))
)]
pub async fn vertex_check(State(state): State<crate::AppState>) -> Json<Value> {
    match state.model.preflight().await {
        Ok(summary) => Json(summary),
        Err(e) => Json(json!({ "ok": false, "error": e.to_string() })),
    }
}
