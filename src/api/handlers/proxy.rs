use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
};

use crate::api::error::AppError;
use crate::services::object_store::OriginResponse;
use crate::utils::keys::is_valid_key;

const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
const EXPOSED_HEADERS: &str = "Content-Length, Content-Range, Accept-Ranges";

/// Public download path: an edge-cached proxy in front of the object
/// store. Cache key is the object path only; range requests bypass the
/// cache in both directions.
#[utoipa::path(
    get,
    path = "/i/{key}",
    params(("key" = String, Path, description = "Object key")),
    responses(
        (status = 200, description = "Object bytes, long-TTL cacheable"),
        (status = 400, description = "Malformed key"),
        (status = 404, description = "Unknown object")
    )
)]
pub async fn proxy_object(
    State(state): State<crate::AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !is_valid_key(&key) {
        return Err(AppError::BadRequest("invalid key".to_string()));
    }

    let cors_origin = request_origin(&headers);
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    if range.is_none() {
        if let Some(hit) = state.edge_cache.get(&key) {
            return Ok(build_response(
                StatusCode::OK,
                hit.content_type.as_deref(),
                Some(IMMUTABLE_CACHE_CONTROL),
                None,
                hit.body,
                &cors_origin,
                "HIT",
            ));
        }
    }

    let origin = state
        .object_store
        .download(&key, range.as_deref())
        .await
        .map_err(|e| AppError::Internal(format!("origin fetch failed: {e}")))?;

    let status =
        StatusCode::from_u16(origin.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if origin.is_ok() && range.is_none() {
        // Populate the cache off the request path
        let cache = state.edge_cache.clone();
        let cache_key = key.clone();
        let content_type = origin.content_type.clone();
        let body = origin.body.clone();
        tokio::spawn(async move {
            cache.insert(cache_key, content_type, body);
        });
    }

    Ok(origin_to_response(origin, status, range.as_deref(), &cors_origin))
}

/// CORS preflight for the download path.
pub async fn preflight(headers: HeaderMap) -> Response {
    let cors_origin = request_origin(&headers);

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, cors_origin)
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, HEAD, OPTIONS")
        .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "Range")
        .header(header::VARY, "Origin")
        .body(Body::empty())
        .expect("static preflight response")
}

fn request_origin(headers: &HeaderMap) -> String {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*")
        .to_string()
}

fn origin_to_response(
    origin: OriginResponse,
    status: StatusCode,
    range: Option<&str>,
    cors_origin: &str,
) -> Response {
    // OK answers to plain requests get the immutable policy; range
    // answers and origin errors keep whatever the origin sent.
    let cache_control = if origin.is_ok() && range.is_none() {
        Some(IMMUTABLE_CACHE_CONTROL.to_string())
    } else {
        origin.cache_control.clone()
    };

    build_response(
        status,
        origin.content_type.as_deref(),
        cache_control.as_deref(),
        origin.content_range.as_deref(),
        origin.body,
        cors_origin,
        "MISS",
    )
}

#[allow(clippy::too_many_arguments)]
fn build_response(
    status: StatusCode,
    content_type: Option<&str>,
    cache_control: Option<&str>,
    content_range: Option<&str>,
    body: bytes::Bytes,
    cors_origin: &str,
    cache_status: &str,
) -> Response {
    let mut builder = Response::builder().status(status);

    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    if let Some(cache_control) = cache_control {
        builder = builder.header(header::CACHE_CONTROL, cache_control);
    }
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    builder = builder
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, cors_origin)
        .header(header::ACCESS_CONTROL_EXPOSE_HEADERS, EXPOSED_HEADERS)
        .header(header::VARY, "Origin")
        .header("x-edge-cache", cache_status);

    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_request_origin_echo() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_origin(&headers), "*");

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.example"));
        assert_eq!(request_origin(&headers), "https://app.example");
    }

    #[test]
    fn test_range_responses_keep_origin_cache_policy() {
        let origin = OriginResponse {
            status: 206,
            content_type: Some("image/png".to_string()),
            content_length: Some(4),
            content_range: Some("bytes 0-3/10".to_string()),
            cache_control: None,
            body: bytes::Bytes::from_static(b"1234"),
        };

        let response = origin_to_response(
            origin,
            StatusCode::PARTIAL_CONTENT,
            Some("bytes=0-3"),
            "*",
        );
        assert!(response.headers().get(header::CACHE_CONTROL).is_none());
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 0-3/10"
        );
    }

    #[test]
    fn test_plain_ok_gets_immutable_policy() {
        let origin = OriginResponse {
            status: 200,
            content_type: Some("image/png".to_string()),
            content_length: Some(4),
            content_range: None,
            cache_control: Some("no-store".to_string()),
            body: bytes::Bytes::from_static(b"1234"),
        };

        let response = origin_to_response(origin, StatusCode::OK, None, "*");
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            IMMUTABLE_CACHE_CONTROL
        );
    }
}
