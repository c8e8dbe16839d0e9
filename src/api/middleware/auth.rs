use crate::api::error::AppError;
use crate::utils::auth::{validate_jwt, Claims};
use crate::{entities::prelude::Users, AppState};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use sea_orm::EntityTrait;

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    if let Some(token) = token {
        let secret = &state.config.jwt_secret;

        if let Ok(claims) = validate_jwt(&token, secret) {
            // The account may have been deleted since the token was issued
            let user_exists = match claims.user_id() {
                Some(id) => Users::find_by_id(id).one(&state.db).await?.is_some(),
                None => false,
            };

            if user_exists {
                req.extensions_mut().insert(claims);
                return Ok(next.run(req).await);
            }
        }
    }

    Err(AppError::Unauthorized("未授权".to_string()))
}

/// Gate for admin-only handlers.
pub fn require_admin(claims: &Claims) -> Result<(), AppError> {
    if claims.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden("需要管理员权限".to_string()))
    }
}
