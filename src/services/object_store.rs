use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use reqwest::header;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::utils::keys::encode_key;

const DEFAULT_AUTHORIZE_URL: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";

/// Account authorizations are valid for 24h upstream; refresh an hour early.
const AUTH_TTL_SECONDS: i64 = 23 * 3600;
/// Upload URLs go stale quickly under rotation; keep them for 30 minutes.
const UPLOAD_URL_TTL_SECONDS: i64 = 30 * 60;

/// Origin reply from the object store's download endpoint. Non-OK
/// responses are passed through to the client verbatim.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub cache_control: Option<String>,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Seam between the gateway and the object store. The production
/// implementation speaks the store's native authorize/upload protocol;
/// tests substitute an in-memory implementation.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Verify credentials end-to-end without writing anything.
    async fn preflight(&self) -> Result<Value>;

    /// Store `data` under `key` with its content SHA-1.
    async fn upload(&self, key: &str, mime: &str, data: Vec<u8>, sha1_hex: &str) -> Result<()>;

    /// Fetch `key`, optionally with a byte-range passthrough.
    async fn download(&self, key: &str, range: Option<&str>) -> Result<OriginResponse>;
}

#[derive(Debug, Clone)]
struct CachedAuth {
    account_id: String,
    token: String,
    api_url: String,
    download_url: String,
    allowed_bucket_id: Option<String>,
    allowed_bucket_name: Option<String>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CachedUpload {
    upload_url: String,
    upload_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct AuthorizeResponse {
    #[serde(rename = "accountId")]
    account_id: String,
    #[serde(rename = "authorizationToken")]
    authorization_token: String,
    #[serde(rename = "apiUrl")]
    api_url: String,
    #[serde(rename = "downloadUrl")]
    download_url: String,
    #[serde(default)]
    allowed: Option<AllowedBucket>,
}

#[derive(Deserialize)]
struct AllowedBucket {
    #[serde(rename = "bucketId")]
    bucket_id: Option<String>,
    #[serde(rename = "bucketName")]
    bucket_name: Option<String>,
}

#[derive(Deserialize)]
struct ListBucketsResponse {
    buckets: Vec<BucketEntry>,
}

#[derive(Deserialize)]
struct BucketEntry {
    #[serde(rename = "bucketId")]
    bucket_id: String,
    #[serde(rename = "bucketName")]
    bucket_name: String,
}

#[derive(Deserialize)]
struct UploadUrlResponse {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
    #[serde(rename = "authorizationToken")]
    authorization_token: String,
}

/// Native-protocol client for a B2-style object store. Each protocol leg
/// is cached independently: authorization 23h, bucket id for the process
/// lifetime, upload URL 30min with a single invalidate-and-retry on
/// upload failure.
pub struct B2Store {
    http: reqwest::Client,
    authorize_url: String,
    key_id: String,
    app_key: String,
    bucket_name: String,
    auth: RwLock<Option<CachedAuth>>,
    bucket_id: RwLock<Option<String>>,
    upload_url: RwLock<Option<CachedUpload>>,
}

impl B2Store {
    pub fn new(key_id: String, app_key: String, bucket_name: String) -> Self {
        Self::with_authorize_url(key_id, app_key, bucket_name, DEFAULT_AUTHORIZE_URL.to_string())
    }

    pub fn with_authorize_url(
        key_id: String,
        app_key: String,
        bucket_name: String,
        authorize_url: String,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            authorize_url,
            key_id,
            app_key,
            bucket_name,
            auth: RwLock::new(None),
            bucket_id: RwLock::new(None),
            upload_url: RwLock::new(None),
        }
    }

    async fn authorize(&self) -> Result<CachedAuth> {
        if let Some(auth) = self.auth.read().await.as_ref() {
            if auth.expires_at > Utc::now() {
                return Ok(auth.clone());
            }
        }

        if self.key_id.is_empty() || self.app_key.is_empty() || self.bucket_name.is_empty() {
            return Err(anyhow!("object store credentials are not configured"));
        }

        let response = self
            .http
            .post(&self.authorize_url)
            .basic_auth(&self.key_id, Some(&self.app_key))
            .send()
            .await
            .context("authorize request failed")?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!(
                "authorize rejected: {} {}",
                status.as_u16(),
                preview(&body)
            ));
        }

        let parsed: AuthorizeResponse =
            serde_json::from_str(&body).context("authorize response was not JSON")?;

        let auth = CachedAuth {
            account_id: parsed.account_id,
            token: parsed.authorization_token,
            api_url: parsed.api_url,
            download_url: parsed.download_url,
            allowed_bucket_id: parsed.allowed.as_ref().and_then(|a| a.bucket_id.clone()),
            allowed_bucket_name: parsed.allowed.as_ref().and_then(|a| a.bucket_name.clone()),
            expires_at: Utc::now() + Duration::seconds(AUTH_TTL_SECONDS),
        };

        tracing::debug!(api_url = %auth.api_url, "object store authorized");
        *self.auth.write().await = Some(auth.clone());
        Ok(auth)
    }

    async fn resolve_bucket_id(&self, auth: &CachedAuth) -> Result<String> {
        if let Some(id) = self.bucket_id.read().await.as_ref() {
            return Ok(id.clone());
        }

        // Keys scoped to a single bucket carry it in the authorize reply
        let resolved = if auth.allowed_bucket_name.as_deref() == Some(self.bucket_name.as_str()) {
            auth.allowed_bucket_id.clone()
        } else {
            None
        };

        let bucket_id = match resolved {
            Some(id) => id,
            None => {
                let response = self
                    .http
                    .post(format!("{}/b2api/v2/b2_list_buckets", auth.api_url))
                    .header(header::AUTHORIZATION, &auth.token)
                    .json(&json!({
                        "accountId": auth.account_id,
                        "bucketName": self.bucket_name,
                    }))
                    .send()
                    .await
                    .context("list_buckets request failed")?;

                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if !status.is_success() {
                    return Err(anyhow!(
                        "list_buckets rejected: {} {}",
                        status.as_u16(),
                        preview(&body)
                    ));
                }

                let parsed: ListBucketsResponse =
                    serde_json::from_str(&body).context("list_buckets response was not JSON")?;
                parsed
                    .buckets
                    .into_iter()
                    .find(|b| b.bucket_name == self.bucket_name)
                    .map(|b| b.bucket_id)
                    .ok_or_else(|| anyhow!("bucket {} not found", self.bucket_name))?
            }
        };

        *self.bucket_id.write().await = Some(bucket_id.clone());
        Ok(bucket_id)
    }

    async fn get_upload_url(&self, auth: &CachedAuth, bucket_id: &str) -> Result<CachedUpload> {
        if let Some(upload) = self.upload_url.read().await.as_ref() {
            if upload.expires_at > Utc::now() {
                return Ok(upload.clone());
            }
        }

        let response = self
            .http
            .post(format!("{}/b2api/v2/b2_get_upload_url", auth.api_url))
            .header(header::AUTHORIZATION, &auth.token)
            .json(&json!({ "bucketId": bucket_id }))
            .send()
            .await
            .context("get_upload_url request failed")?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!(
                "get_upload_url rejected: {} {}",
                status.as_u16(),
                preview(&body)
            ));
        }

        let parsed: UploadUrlResponse =
            serde_json::from_str(&body).context("get_upload_url response was not JSON")?;

        let upload = CachedUpload {
            upload_url: parsed.upload_url,
            upload_token: parsed.authorization_token,
            expires_at: Utc::now() + Duration::seconds(UPLOAD_URL_TTL_SECONDS),
        };

        *self.upload_url.write().await = Some(upload.clone());
        Ok(upload)
    }

    async fn invalidate_upload_url(&self) {
        *self.upload_url.write().await = None;
    }

    async fn upload_once(
        &self,
        key: &str,
        mime: &str,
        data: Vec<u8>,
        sha1_hex: &str,
    ) -> Result<()> {
        let auth = self.authorize().await?;
        let bucket_id = self.resolve_bucket_id(&auth).await?;
        let upload = self.get_upload_url(&auth, &bucket_id).await?;

        let content_type = if mime.is_empty() { "b2/x-auto" } else { mime };

        let response = self
            .http
            .post(&upload.upload_url)
            .header(header::AUTHORIZATION, &upload.upload_token)
            .header("X-Bz-File-Name", encode_key(key))
            .header(header::CONTENT_TYPE, content_type)
            .header("X-Bz-Content-Sha1", sha1_hex)
            .body(data)
            .send()
            .await
            .context("upload request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "upload rejected: {} {}",
                status.as_u16(),
                preview(&body)
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for B2Store {
    async fn preflight(&self) -> Result<Value> {
        let auth = self.authorize().await?;
        let bucket_id = self.resolve_bucket_id(&auth).await?;
        let upload = self.get_upload_url(&auth, &bucket_id).await?;

        Ok(json!({
            "ok": true,
            "apiUrl": auth.api_url,
            "downloadUrl": auth.download_url,
            "bucketName": self.bucket_name,
            "bucketId": bucket_id,
            "uploadUrlExpiresAt": upload.expires_at.to_rfc3339(),
        }))
    }

    async fn upload(&self, key: &str, mime: &str, data: Vec<u8>, sha1_hex: &str) -> Result<()> {
        match self.upload_once(key, mime, data.clone(), sha1_hex).await {
            Ok(()) => Ok(()),
            Err(first) => {
                // Upload URLs expire out from under us; one fresh URL, one retry
                tracing::warn!(key, error = %first, "upload failed, refreshing upload URL");
                self.invalidate_upload_url().await;
                self.upload_once(key, mime, data, sha1_hex)
                    .await
                    .with_context(|| format!("upload retry for {key} failed (first: {first})"))
            }
        }
    }

    async fn download(&self, key: &str, range: Option<&str>) -> Result<OriginResponse> {
        let auth = self.authorize().await?;

        let url = format!(
            "{}/file/{}/{}",
            auth.download_url,
            self.bucket_name,
            encode_key(key)
        );

        let mut request = self.http.get(&url).header(header::AUTHORIZATION, &auth.token);
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }

        let response = request.send().await.context("download request failed")?;

        let status = response.status().as_u16();
        let header_str = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        let content_type = header_str(header::CONTENT_TYPE);
        let content_range = header_str(header::CONTENT_RANGE);
        let cache_control = header_str(header::CACHE_CONTROL);
        let content_length = response.content_length();

        let body = response.bytes().await.context("download body failed")?;

        Ok(OriginResponse {
            status,
            content_type,
            content_length,
            content_range,
            cache_control,
            body,
        })
    }
}

fn preview(body: &str) -> String {
    const LIMIT: usize = 200;
    let compact: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() > LIMIT {
        format!("{}...", compact.chars().take(LIMIT).collect::<String>())
    } else {
        compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(500);
        let short = preview(&long);
        assert_eq!(short.chars().count(), 203);
        assert!(short.ends_with("..."));
        assert_eq!(preview("tiny body"), "tiny body");
    }

    #[tokio::test]
    async fn test_unconfigured_store_fails_preflight() {
        let store = B2Store::new(String::new(), String::new(), String::new());
        let err = store.preflight().await.unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn test_upload_url_cache_invalidation() {
        let store = B2Store::new("k".into(), "a".into(), "b".into());
        *store.upload_url.write().await = Some(CachedUpload {
            upload_url: "https://pod.example/upload".to_string(),
            upload_token: "tok".to_string(),
            expires_at: Utc::now() + Duration::seconds(60),
        });
        store.invalidate_upload_url().await;
        assert!(store.upload_url.read().await.is_none());
    }

    #[tokio::test]
    async fn test_expired_upload_url_is_not_served() {
        let store = B2Store::new("k".into(), "a".into(), "b".into());
        *store.upload_url.write().await = Some(CachedUpload {
            upload_url: "https://pod.example/upload".to_string(),
            upload_token: "tok".to_string(),
            expires_at: Utc::now() - Duration::seconds(1),
        });
        // A stale entry must not short-circuit get_upload_url; the fetch
        // path then fails on missing credentials rather than reusing it.
        let auth = CachedAuth {
            account_id: "acc".to_string(),
            token: "tok".to_string(),
            api_url: "http://127.0.0.1:9".to_string(),
            download_url: "http://127.0.0.1:9".to_string(),
            allowed_bucket_id: None,
            allowed_bucket_name: None,
            expires_at: Utc::now() + Duration::seconds(60),
        };
        assert!(store.get_upload_url(&auth, "bucket").await.is_err());
    }
}
