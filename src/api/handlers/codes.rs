use axum::{extract::State, Extension, Json};
use chrono::Utc;
use rand::Rng;
use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::api::error::AppError;
use crate::api::middleware::auth::require_admin;
use crate::entities::{prelude::*, redeem_codes, users};
use crate::services::audit;
use crate::utils::auth::Claims;

const CODE_INVALID: &str = "兑换码无效或已使用";

/// Codes avoid the look-alikes 0/O and 1/I.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_CHARS: usize = 16;
const CODE_GROUP: usize = 4;

/// Retries per code before giving up on the unique index.
const MAX_COLLISION_RETRIES: usize = 5;

#[derive(Deserialize, ToSchema)]
pub struct CreateCodesRequest {
    pub count: u32,
    pub quota: i64,
}

#[derive(Deserialize, ToSchema)]
pub struct RedeemRequest {
    pub code: String,
}

/// `XXXX-XXXX-XXXX-XXXX` from the restricted alphabet.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let raw: Vec<u8> = (0..CODE_CHARS)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())])
        .collect();

    raw.chunks(CODE_GROUP)
        .map(|chunk| std::str::from_utf8(chunk).expect("alphabet is ascii"))
        .collect::<Vec<_>>()
        .join("-")
}

#[utoipa::path(
    get,
    path = "/api/codes",
    responses(
        (status = 200, description = "All redemption codes"),
        (status = 403, description = "Not an admin")
    ),
    security(("jwt" = []))
)]
pub async fn list_codes(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, AppError> {
    require_admin(&claims)?;

    let codes = RedeemCodes::find()
        .order_by_desc(redeem_codes::Column::CreatedAt)
        .all(&state.db)
        .await?;

    Ok(Json(json!({ "codes": codes })))
}

#[utoipa::path(
    post,
    path = "/api/codes",
    request_body = CreateCodesRequest,
    responses(
        (status = 200, description = "Codes generated"),
        (status = 400, description = "Invalid count or quota"),
        (status = 403, description = "Not an admin")
    ),
    security(("jwt" = []))
)]
pub async fn create_codes(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateCodesRequest>,
) -> Result<Json<Value>, AppError> {
    require_admin(&claims)?;

    if payload.count == 0 || payload.count > 100 {
        return Err(AppError::BadRequest("count 必须在 1-100 之间".to_string()));
    }
    if payload.quota < 1 {
        return Err(AppError::BadRequest("quota 必须大于 0".to_string()));
    }

    let mut codes = Vec::with_capacity(payload.count as usize);
    for _ in 0..payload.count {
        let code = insert_unique_code(&state, payload.quota).await?;
        codes.push(code);
    }

    Ok(Json(json!({ "success": true, "codes": codes })))
}

async fn insert_unique_code(state: &crate::AppState, quota: i64) -> Result<String, AppError> {
    for _ in 0..MAX_COLLISION_RETRIES {
        let code = generate_code();
        let model = redeem_codes::ActiveModel {
            code: Set(code.clone()),
            quota: Set(quota),
            used: Set(false),
            used_by: Set(None),
            used_at: Set(None),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        match model.insert(&state.db).await {
            Ok(_) => return Ok(code),
            Err(e)
                if matches!(
                    e.sql_err(),
                    Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
                ) =>
            {
                tracing::debug!(code, "code collision, retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(AppError::Internal(
        "could not generate a unique code".to_string(),
    ))
}

#[utoipa::path(
    post,
    path = "/api/redeem",
    request_body = RedeemRequest,
    responses(
        (status = 200, description = "Code redeemed"),
        (status = 400, description = "Invalid or used code"),
        (status = 401, description = "Unauthorized")
    ),
    security(("jwt" = []))
)]
pub async fn redeem(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<RedeemRequest>,
) -> Result<Json<Value>, AppError> {
    let user_id = claims
        .user_id()
        .ok_or_else(|| AppError::Unauthorized("invalid token subject".to_string()))?;

    let code = payload.code.trim().to_uppercase();
    if code.is_empty() {
        return Err(AppError::BadRequest(CODE_INVALID.to_string()));
    }

    let txn = state.db.begin().await?;

    let row = RedeemCodes::find()
        .filter(redeem_codes::Column::Code.eq(&code))
        .one(&txn)
        .await?
        .ok_or_else(|| AppError::BadRequest(CODE_INVALID.to_string()))?;

    // The conditional update arbitrates concurrent redemptions: exactly
    // one caller flips the flag, everyone else sees zero rows affected.
    let claimed = RedeemCodes::update_many()
        .col_expr(redeem_codes::Column::Used, Expr::value(true))
        .col_expr(
            redeem_codes::Column::UsedBy,
            Expr::value(claims.username.clone()),
        )
        .col_expr(redeem_codes::Column::UsedAt, Expr::value(Utc::now()))
        .filter(redeem_codes::Column::Id.eq(row.id))
        .filter(redeem_codes::Column::Used.eq(false))
        .exec(&txn)
        .await?;

    if claimed.rows_affected == 0 {
        txn.rollback().await?;
        return Err(AppError::BadRequest(CODE_INVALID.to_string()));
    }

    Users::update_many()
        .col_expr(
            users::Column::Quota,
            Expr::col(users::Column::Quota).add(row.quota),
        )
        .col_expr(users::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(users::Column::Id.eq(user_id))
        .exec(&txn)
        .await?;

    txn.commit().await?;

    audit::record(
        &state.db,
        user_id,
        audit::ACTION_REDEEM_CODE,
        Some(format!("code={} quota={}", code, row.quota)),
    )
    .await;

    Ok(Json(json!({ "success": true, "quota": row.quota })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_shape() {
        let code = generate_code();
        assert_eq!(code.len(), 19);
        let groups: Vec<&str> = code.split('-').collect();
        assert_eq!(groups.len(), 4);
        for group in groups {
            assert_eq!(group.len(), 4);
            assert!(group
                .bytes()
                .all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_code_avoids_lookalikes() {
        for _ in 0..50 {
            let code = generate_code();
            assert!(!code.contains('0'));
            assert!(!code.contains('O'));
            assert!(!code.contains('1'));
            assert!(!code.contains('I'));
        }
    }
}
