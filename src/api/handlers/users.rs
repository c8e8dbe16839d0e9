use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2,
};
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;
use validator::Validate;

use super::auth::UserResponse;
use crate::api::error::AppError;
use crate::api::middleware::auth::require_admin;
use crate::entities::{history_records, prelude::*, users};
use crate::utils::auth::Claims;

#[derive(Deserialize, ToSchema, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 64))]
    pub username: String,
    /// Client-side SHA-256 hex digest of the password
    #[validate(length(min = 1))]
    pub password: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub quota: i64,
}

fn default_role() -> String {
    users::ROLE_USER.to_string()
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateUserRequest {
    pub quota: Option<i64>,
    /// Client-side SHA-256 hex digest of the new password
    pub password: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct UserListResponse {
    pub users: Vec<UserResponse>,
}

#[utoipa::path(
    get,
    path = "/api/users",
    responses(
        (status = 200, description = "All accounts", body = UserListResponse),
        (status = 403, description = "Not an admin")
    ),
    security(("jwt" = []))
)]
pub async fn list_users(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UserListResponse>, AppError> {
    require_admin(&claims)?;

    let users = Users::find()
        .order_by_asc(users::Column::Id)
        .all(&state.db)
        .await?;

    Ok(Json(UserListResponse {
        users: users.into_iter().map(UserResponse::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/users",
    request_body = CreateUserRequest,
    responses(
        (status = 200, description = "Account created"),
        (status = 403, description = "Not an admin"),
        (status = 409, description = "Username already exists")
    ),
    security(("jwt" = []))
)]
pub async fn create_user(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<Json<Value>, AppError> {
    require_admin(&claims)?;
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    if payload.role != users::ROLE_ADMIN && payload.role != users::ROLE_USER {
        return Err(AppError::BadRequest("无效的角色".to_string()));
    }

    let password_hash = hash_digest(&payload.password)?;

    let now = Utc::now();
    let user = users::ActiveModel {
        username: Set(payload.username.clone()),
        password_hash: Set(password_hash),
        role: Set(payload.role),
        quota: Set(payload.quota),
        used: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };

    let inserted = match user.insert(&state.db).await {
        Ok(model) => model,
        Err(e) if is_unique_violation(&e) => {
            return Err(AppError::Conflict("用户名已存在".to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Json(json!({ "success": true, "id": inserted.id })))
}

#[utoipa::path(
    put,
    path = "/api/users/{id}",
    request_body = UpdateUserRequest,
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "Account updated"),
        (status = 403, description = "Not an admin"),
        (status = 404, description = "Unknown user")
    ),
    security(("jwt" = []))
)]
pub async fn update_user(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<i64>,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<Json<Value>, AppError> {
    require_admin(&claims)?;

    let user = Users::find_by_id(user_id)
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::NotFound("用户不存在".to_string()))?;

    if let Some(quota) = payload.quota {
        if quota < 0 {
            return Err(AppError::BadRequest("配额不能为负".to_string()));
        }
        if quota < user.used {
            return Err(AppError::BadRequest("配额不能低于已用量".to_string()));
        }
    }

    let mut active: users::ActiveModel = user.into();
    if let Some(quota) = payload.quota {
        active.quota = Set(quota);
    }
    if let Some(password) = payload.password {
        active.password_hash = Set(hash_digest(&password)?);
    }
    active.updated_at = Set(Utc::now());
    active.update(&state.db).await?;

    Ok(Json(json!({ "success": true })))
}

#[utoipa::path(
    delete,
    path = "/api/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "Account deleted"),
        (status = 403, description = "Not an admin"),
        (status = 404, description = "Unknown user")
    ),
    security(("jwt" = []))
)]
pub async fn delete_user(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    require_admin(&claims)?;

    // History rows go with the account; usage logs stay for audit
    let txn = state.db.begin().await?;

    HistoryRecords::delete_many()
        .filter(history_records::Column::UserId.eq(user_id))
        .exec(&txn)
        .await?;

    let deleted = Users::delete_by_id(user_id).exec(&txn).await?;
    if deleted.rows_affected == 0 {
        txn.rollback().await?;
        return Err(AppError::NotFound("用户不存在".to_string()));
    }

    txn.commit().await?;

    Ok(Json(json!({ "success": true })))
}

fn hash_digest(digest: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(digest.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AppError::Internal(format!("password hash failed: {e}")))
}

fn is_unique_violation(err: &sea_orm::DbErr) -> bool {
    matches!(
        err.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    )
}
