use axum::{extract::State, Extension, Json};
use chrono::Utc;
use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::api::error::AppError;
use crate::entities::{prelude::Users, users};
use crate::services::audit;
use crate::utils::auth::Claims;

const QUOTA_EXHAUSTED: &str = "配额不足";

#[derive(Serialize, ToSchema)]
pub struct QuotaResponse {
    pub quota: i64,
    pub used: i64,
    pub remaining: i64,
}

#[derive(Deserialize, ToSchema)]
pub struct ConsumeRequest {
    #[serde(default = "default_count")]
    pub count: i64,
}

fn default_count() -> i64 {
    1
}

#[utoipa::path(
    get,
    path = "/api/quota",
    responses(
        (status = 200, description = "Current balance", body = QuotaResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(("jwt" = []))
)]
pub async fn get_quota(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<QuotaResponse>, AppError> {
    let user = find_user(&state, &claims).await?;

    Ok(Json(QuotaResponse {
        quota: user.quota,
        used: user.used,
        remaining: user.quota - user.used,
    }))
}

#[utoipa::path(
    put,
    path = "/api/quota/consume",
    request_body = ConsumeRequest,
    responses(
        (status = 200, description = "Credits consumed"),
        (status = 400, description = "Insufficient quota"),
        (status = 401, description = "Unauthorized")
    ),
    security(("jwt" = []))
)]
pub async fn consume_quota(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<ConsumeRequest>,
) -> Result<Json<Value>, AppError> {
    let user_id = claims
        .user_id()
        .ok_or_else(|| AppError::Unauthorized("invalid token subject".to_string()))?;

    if payload.count < 0 {
        return Err(AppError::BadRequest("count 不能为负".to_string()));
    }

    if payload.count == 0 {
        let user = find_user(&state, &claims).await?;
        return Ok(Json(json!({
            "success": true,
            "remaining": user.quota - user.used,
        })));
    }

    // Check and increment in one statement so two concurrent consumers of
    // the last credit produce exactly one success.
    let result = Users::update_many()
        .col_expr(
            users::Column::Used,
            Expr::col(users::Column::Used).add(payload.count),
        )
        .col_expr(users::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(users::Column::Id.eq(user_id))
        .filter(Expr::col(users::Column::Quota).gte(Expr::col(users::Column::Used).add(payload.count)))
        .exec(&state.db)
        .await?;

    if result.rows_affected == 0 {
        return Err(AppError::BadRequest(QUOTA_EXHAUSTED.to_string()));
    }

    audit::record(
        &state.db,
        user_id,
        audit::ACTION_CONSUME_QUOTA,
        Some(format!("count={}", payload.count)),
    )
    .await;

    let user = find_user(&state, &claims).await?;
    Ok(Json(json!({
        "success": true,
        "remaining": user.quota - user.used,
    })))
}

async fn find_user(state: &crate::AppState, claims: &Claims) -> Result<users::Model, AppError> {
    let user_id = claims
        .user_id()
        .ok_or_else(|| AppError::Unauthorized("invalid token subject".to_string()))?;

    Users::find_by_id(user_id)
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::NotFound("用户不存在".to_string()))
}
