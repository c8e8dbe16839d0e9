use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::api::error::AppError;
use crate::services::reference::decode_image_payload;
use crate::utils::auth::Claims;
use crate::utils::hash::sha1_hex;
use crate::utils::keys::date_prefixed_key;

/// Reference images live under their own prefix, apart from results.
const REF_IMAGE_PREFIX: &str = "cankaotu/";

#[derive(Deserialize, ToSchema)]
pub struct UploadImageRequest {
    /// Base64 payload, with or without a `data:` prefix
    pub image: String,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/upload/image",
    request_body = UploadImageRequest,
    responses(
        (status = 200, description = "Image stored, public URL returned"),
        (status = 400, description = "Payload is not a decodable image"),
        (status = 401, description = "Unauthorized")
    ),
    security(("jwt" = []))
)]
pub async fn upload_image(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<UploadImageRequest>,
) -> Result<Json<Value>, AppError> {
    if payload.image.trim().is_empty() {
        return Err(AppError::BadRequest("image 不能为空".to_string()));
    }

    let (mime, bytes) = decode_image_payload(&payload.image, payload.mime_type.as_deref())
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let sha1 = sha1_hex(&bytes);
    let key = date_prefixed_key(REF_IMAGE_PREFIX, &mime);
    let size = bytes.len();

    state
        .object_store
        .upload(&key, &mime, bytes, &sha1)
        .await
        .map_err(|e| AppError::Internal(format!("reference upload failed: {e}")))?;

    tracing::info!(user = %claims.username, key = %key, size, "reference image stored");

    Ok(Json(json!({
        "success": true,
        "url": state.config.public_url(&key),
        "fileName": key,
        "size": size,
    })))
}
