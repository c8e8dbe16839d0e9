use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::api::error::AppError;
use crate::entities::{history_records, prelude::HistoryRecords};
use crate::utils::auth::Claims;

const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 100;

#[derive(Deserialize, ToSchema)]
pub struct HistoryQuery {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateHistoryRequest {
    pub prompt: String,
    pub image_url: String,
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub ref_images: Value,
}

#[derive(Serialize, ToSchema)]
pub struct HistoryEntry {
    pub id: i64,
    pub prompt: String,
    pub image_url: String,
    pub options: Value,
    pub ref_images: Value,
    pub created_at: DateTime<Utc>,
}

impl From<history_records::Model> for HistoryEntry {
    fn from(record: history_records::Model) -> Self {
        Self {
            id: record.id,
            prompt: record.prompt,
            image_url: record.image_url,
            options: serde_json::from_str(&record.options).unwrap_or(Value::Null),
            ref_images: serde_json::from_str(&record.ref_images).unwrap_or(Value::Null),
            created_at: record.created_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/history",
    params(
        ("limit" = Option<u64>, Query, description = "Page size, default 50, max 100"),
        ("offset" = Option<u64>, Query, description = "Rows to skip")
    ),
    responses(
        (status = 200, description = "The caller's history, newest first"),
        (status = 401, description = "Unauthorized")
    ),
    security(("jwt" = []))
)]
pub async fn list_history(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let user_id = claims
        .user_id()
        .ok_or_else(|| AppError::Unauthorized("invalid token subject".to_string()))?;

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let records = HistoryRecords::find()
        .filter(history_records::Column::UserId.eq(user_id))
        .order_by_desc(history_records::Column::CreatedAt)
        .offset(offset)
        .limit(limit)
        .all(&state.db)
        .await?;

    let total = HistoryRecords::find()
        .filter(history_records::Column::UserId.eq(user_id))
        .count(&state.db)
        .await?;

    let history: Vec<HistoryEntry> = records.into_iter().map(HistoryEntry::from).collect();

    Ok(Json(json!({ "history": history, "total": total })))
}

#[utoipa::path(
    post,
    path = "/api/history",
    request_body = CreateHistoryRequest,
    responses(
        (status = 200, description = "Record appended"),
        (status = 400, description = "Missing prompt or image URL"),
        (status = 401, description = "Unauthorized")
    ),
    security(("jwt" = []))
)]
pub async fn create_history(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateHistoryRequest>,
) -> Result<Json<Value>, AppError> {
    let user_id = claims
        .user_id()
        .ok_or_else(|| AppError::Unauthorized("invalid token subject".to_string()))?;

    if payload.prompt.trim().is_empty() || payload.image_url.trim().is_empty() {
        return Err(AppError::BadRequest(
            "prompt 和 image_url 不能为空".to_string(),
        ));
    }

    let record = history_records::ActiveModel {
        user_id: Set(user_id),
        prompt: Set(payload.prompt),
        image_url: Set(payload.image_url),
        options: Set(payload.options.to_string()),
        ref_images: Set(payload.ref_images.to_string()),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    record.insert(&state.db).await?;

    Ok(Json(json!({ "success": true })))
}

#[utoipa::path(
    delete,
    path = "/api/history/{id}",
    params(("id" = i64, Path, description = "History record id")),
    responses(
        (status = 200, description = "Record deleted"),
        (status = 404, description = "Not found or not the owner")
    ),
    security(("jwt" = []))
)]
pub async fn delete_history(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(record_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let user_id = claims
        .user_id()
        .ok_or_else(|| AppError::Unauthorized("invalid token subject".to_string()))?;

    // The owner filter doubles as the permission check
    let deleted = HistoryRecords::delete_many()
        .filter(history_records::Column::Id.eq(record_id))
        .filter(history_records::Column::UserId.eq(user_id))
        .exec(&state.db)
        .await?;

    if deleted.rows_affected == 0 {
        return Err(AppError::NotFound("记录不存在".to_string()));
    }

    Ok(Json(json!({ "success": true })))
}
