use argon2::{password_hash::PasswordHash, Argon2, PasswordVerifier};
use axum::{extract::State, Extension, Json};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::AppError;
use crate::entities::{prelude::Users, users};
use crate::services::audit;
use crate::utils::auth::{create_jwt, Claims};

const BAD_CREDENTIALS: &str = "用户名或密码错误";

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    /// Client-side SHA-256 hex digest of the password
    pub password: String,
}

#[derive(Serialize, ToSchema)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserResponse,
}

#[derive(Serialize, ToSchema)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub role: String,
    pub quota: i64,
    pub used: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<users::Model> for UserResponse {
    fn from(user: users::Model) -> Self {
        Self {
            id: user.id,
            username: user.username,
            role: user.role,
            quota: user.quota,
            used: user.used,
            created_at: user.created_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct MeResponse {
    pub user: UserResponse,
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    State(state): State<crate::AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let user = Users::find()
        .filter(users::Column::Username.eq(&payload.username))
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::Unauthorized(BAD_CREDENTIALS.to_string()))?;

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| AppError::Internal(format!("stored hash unreadable: {e}")))?;

    Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed_hash)
        .map_err(|_| AppError::Unauthorized(BAD_CREDENTIALS.to_string()))?;

    let token = create_jwt(&user, &state.config.jwt_secret)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    audit::record(&state.db, user.id, audit::ACTION_LOGIN, None).await;

    Ok(Json(LoginResponse {
        token,
        user: user.into(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "Current account", body = MeResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(("jwt" = []))
)]
pub async fn me(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MeResponse>, AppError> {
    let user_id = claims
        .user_id()
        .ok_or_else(|| AppError::Unauthorized("invalid token subject".to_string()))?;

    let user = Users::find_by_id(user_id)
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::NotFound("用户不存在".to_string()))?;

    Ok(Json(MeResponse { user: user.into() }))
}
