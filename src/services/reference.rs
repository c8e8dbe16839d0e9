use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::AppConfig;
use crate::services::vertex::InlineImage;

/// Guard rails for fetching caller-supplied reference URLs.
#[derive(Debug, Clone)]
pub struct ReferencePolicy {
    /// Empty list disables host filtering
    pub allow_hosts: Vec<String>,
    pub allow_http: bool,
    /// <= 0 means unlimited
    pub max_bytes: i64,
}

impl ReferencePolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            allow_hosts: config.allow_ref_image_hosts.clone(),
            allow_http: config.allow_ref_image_http,
            max_bytes: config.max_ref_image_bytes,
        }
    }
}

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("REF_IMAGE_HOST_NOT_ALLOWED: {0}")]
    HostNotAllowed(String),

    #[error("REF_IMAGE_HTTP_NOT_ALLOWED: {0}")]
    HttpNotAllowed(String),

    #[error("REF_IMAGE_TOO_LARGE: {0} bytes")]
    TooLarge(u64),

    #[error("REF_IMAGE_FETCH_FAILED: {0}")]
    Fetch(String),

    #[error("REF_IMAGE_BAD_BASE64")]
    BadBase64,

    #[error("REF_IMAGE_BAD_URL: {0}")]
    BadUrl(String),

    #[error("REF_IMAGE_BAD_ENTRY: {0}")]
    BadEntry(String),
}

/// Funnel for the polymorphic reference-image input: a bare string
/// (data URL or http URL), an object naming a URL under `uri`/`url`/
/// `href`, or an object carrying inline base64 under `data`. Everything
/// normalizes to an inline `{mime_type, base64}` pair.
pub async fn normalize_reference(
    http: &reqwest::Client,
    policy: &ReferencePolicy,
    entry: &Value,
) -> Result<InlineImage, ReferenceError> {
    match entry {
        Value::String(raw) => normalize_string(http, policy, raw, None).await,
        Value::Object(map) => {
            if let Some(data) = map.get("data").and_then(Value::as_str) {
                let mime_override = map.get("mimeType").and_then(Value::as_str);
                return normalize_inline(data, mime_override);
            }

            let url = map
                .get("uri")
                .or_else(|| map.get("url"))
                .or_else(|| map.get("href"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ReferenceError::BadEntry("object has no uri/url/href or data".to_string())
                })?;
            let mime_override = map.get("mimeType").and_then(Value::as_str);
            normalize_string(http, policy, url, mime_override).await
        }
        other => Err(ReferenceError::BadEntry(format!(
            "unsupported entry type: {}",
            type_name(other)
        ))),
    }
}

async fn normalize_string(
    http: &reqwest::Client,
    policy: &ReferencePolicy,
    raw: &str,
    mime_override: Option<&str>,
) -> Result<InlineImage, ReferenceError> {
    let trimmed = raw.trim();
    if trimmed.starts_with("data:") {
        return parse_data_url(trimmed);
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return fetch_url(http, policy, trimmed, mime_override).await;
    }
    Err(ReferenceError::BadEntry(
        "string entry is neither a data URL nor an http(s) URL".to_string(),
    ))
}

/// Inline `data` must be base64, not a smuggled URL.
fn normalize_inline(data: &str, mime_override: Option<&str>) -> Result<InlineImage, ReferenceError> {
    let trimmed = data.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Err(ReferenceError::BadEntry(
            "data field holds a URL, expected base64".to_string(),
        ));
    }
    if trimmed.starts_with("data:") {
        return parse_data_url(trimmed);
    }

    let payload: String = trimmed.split_whitespace().collect();
    BASE64
        .decode(payload.as_bytes())
        .map_err(|_| ReferenceError::BadBase64)?;

    Ok(InlineImage {
        mime_type: mime_override.unwrap_or("image/png").to_string(),
        data: payload,
    })
}

/// Decode an intake payload (a data URL or bare base64) to raw bytes.
/// Used by the reference-image upload endpoint, where a bare base64 body
/// is legal (unlike generation entries, which must be URLs or objects).
pub fn decode_image_payload(
    raw: &str,
    mime_override: Option<&str>,
) -> Result<(String, Vec<u8>), ReferenceError> {
    let trimmed = raw.trim();

    let image = if trimmed.starts_with("data:") {
        parse_data_url(trimmed)?
    } else {
        InlineImage {
            mime_type: "image/png".to_string(),
            data: trimmed.split_whitespace().collect(),
        }
    };

    let bytes = BASE64
        .decode(image.data.as_bytes())
        .map_err(|_| ReferenceError::BadBase64)?;
    let mime = mime_override
        .map(|m| m.to_string())
        .unwrap_or(image.mime_type);

    Ok((mime, bytes))
}

fn parse_data_url(raw: &str) -> Result<InlineImage, ReferenceError> {
    let rest = raw
        .strip_prefix("data:")
        .ok_or_else(|| ReferenceError::BadEntry("not a data URL".to_string()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| ReferenceError::BadEntry("data URL has no payload".to_string()))?;

    if !meta.ends_with(";base64") {
        return Err(ReferenceError::BadEntry(
            "data URL is not base64 encoded".to_string(),
        ));
    }
    let mime = meta.trim_end_matches(";base64");
    let mime = if mime.is_empty() { "image/png" } else { mime };

    let payload: String = payload.split_whitespace().collect();
    BASE64
        .decode(payload.as_bytes())
        .map_err(|_| ReferenceError::BadBase64)?;

    Ok(InlineImage {
        mime_type: mime.to_string(),
        data: payload,
    })
}

/// Scheme and host checks shared by every URL-shaped entry.
fn check_url(raw: &str, policy: &ReferencePolicy) -> Result<Url, ReferenceError> {
    let url = Url::parse(raw).map_err(|e| ReferenceError::BadUrl(format!("{raw}: {e}")))?;

    match url.scheme() {
        "https" => {}
        "http" if policy.allow_http => {}
        "http" => return Err(ReferenceError::HttpNotAllowed(raw.to_string())),
        other => return Err(ReferenceError::BadUrl(format!("unsupported scheme {other}"))),
    }

    let host = url
        .host_str()
        .ok_or_else(|| ReferenceError::BadUrl(format!("{raw}: no host")))?
        .to_ascii_lowercase();

    if !policy.allow_hosts.is_empty()
        && !policy
            .allow_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&host))
    {
        return Err(ReferenceError::HostNotAllowed(host));
    }

    Ok(url)
}

async fn fetch_url(
    http: &reqwest::Client,
    policy: &ReferencePolicy,
    raw: &str,
    mime_override: Option<&str>,
) -> Result<InlineImage, ReferenceError> {
    let url = check_url(raw, policy)?;

    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| ReferenceError::Fetch(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ReferenceError::Fetch(format!(
            "{} returned {}",
            raw,
            response.status().as_u16()
        )));
    }

    if policy.max_bytes > 0 {
        if let Some(length) = response.content_length() {
            if length > policy.max_bytes as u64 {
                return Err(ReferenceError::TooLarge(length));
            }
        }
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

    let body = response
        .bytes()
        .await
        .map_err(|e| ReferenceError::Fetch(e.to_string()))?;

    if policy.max_bytes > 0 && body.len() as u64 > policy.max_bytes as u64 {
        return Err(ReferenceError::TooLarge(body.len() as u64));
    }

    let mime_type = mime_override
        .map(|m| m.to_string())
        .or(content_type)
        .unwrap_or_else(|| "image/png".to_string());

    Ok(InlineImage {
        mime_type,
        data: BASE64.encode(&body),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_policy() -> ReferencePolicy {
        ReferencePolicy {
            allow_hosts: vec![],
            allow_http: false,
            max_bytes: 0,
        }
    }

    #[tokio::test]
    async fn test_data_url_string() {
        let client = reqwest::Client::new();
        let entry = json!("data:image/jpeg;base64,aGVsbG8=");
        let image = normalize_reference(&client, &open_policy(), &entry)
            .await
            .unwrap();
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.data, "aGVsbG8=");
    }

    #[tokio::test]
    async fn test_inline_data_object() {
        let client = reqwest::Client::new();
        let entry = json!({ "data": "aGVsbG8=", "mimeType": "image/webp" });
        let image = normalize_reference(&client, &open_policy(), &entry)
            .await
            .unwrap();
        assert_eq!(image.mime_type, "image/webp");
    }

    #[tokio::test]
    async fn test_inline_data_defaults_to_png() {
        let client = reqwest::Client::new();
        let entry = json!({ "data": "aGVsbG8=" });
        let image = normalize_reference(&client, &open_policy(), &entry)
            .await
            .unwrap();
        assert_eq!(image.mime_type, "image/png");
    }

    #[tokio::test]
    async fn test_url_smuggled_in_data_field() {
        let client = reqwest::Client::new();
        let entry = json!({ "data": "https://evil.example/x.png" });
        let err = normalize_reference(&client, &open_policy(), &entry)
            .await
            .unwrap_err();
        assert!(matches!(err, ReferenceError::BadEntry(_)));
    }

    #[tokio::test]
    async fn test_invalid_base64_rejected() {
        let client = reqwest::Client::new();
        let entry = json!({ "data": "!!not-base64!!" });
        let err = normalize_reference(&client, &open_policy(), &entry)
            .await
            .unwrap_err();
        assert!(matches!(err, ReferenceError::BadBase64));
    }

    #[tokio::test]
    async fn test_bare_string_rejected() {
        let client = reqwest::Client::new();
        let entry = json!("just-some-text");
        let err = normalize_reference(&client, &open_policy(), &entry)
            .await
            .unwrap_err();
        assert!(matches!(err, ReferenceError::BadEntry(_)));
    }

    #[test]
    fn test_host_allow_list() {
        let policy = ReferencePolicy {
            allow_hosts: vec!["trusted.example".to_string()],
            allow_http: false,
            max_bytes: 0,
        };

        assert!(check_url("https://trusted.example/x.png", &policy).is_ok());
        assert!(check_url("https://TRUSTED.example/x.png", &policy).is_ok());

        let err = check_url("https://evil.example/x.png", &policy).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("REF_IMAGE_HOST_NOT_ALLOWED: evil.example"));
    }

    #[test]
    fn test_plain_http_gated() {
        let mut policy = open_policy();
        let err = check_url("http://trusted.example/x.png", &policy).unwrap_err();
        assert!(matches!(err, ReferenceError::HttpNotAllowed(_)));

        policy.allow_http = true;
        assert!(check_url("http://trusted.example/x.png", &policy).is_ok());
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = check_url("ftp://trusted.example/x.png", &open_policy()).unwrap_err();
        assert!(matches!(err, ReferenceError::BadUrl(_)));
    }

    #[test]
    fn test_decode_image_payload() {
        let (mime, bytes) = decode_image_payload("aGVsbG8=", None).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"hello");

        let (mime, bytes) =
            decode_image_payload("data:image/webp;base64,aGVsbG8=", None).unwrap();
        assert_eq!(mime, "image/webp");
        assert_eq!(bytes, b"hello");

        let (mime, _) = decode_image_payload("aGVsbG8=", Some("image/jpeg")).unwrap();
        assert_eq!(mime, "image/jpeg");

        assert!(decode_image_payload("%%%", None).is_err());
    }

    #[test]
    fn test_data_url_without_base64_marker() {
        let err = parse_data_url("data:image/png,rawbytes").unwrap_err();
        assert!(matches!(err, ReferenceError::BadEntry(_)));
    }
}
