use std::env;

/// Runtime configuration for the gateway, loaded from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HMAC key for user bearer tokens (Required in production)
    pub jwt_secret: String,

    /// Object store application key id
    pub b2_key_id: String,
    /// Object store application key
    pub b2_app_key: String,
    /// Object store bucket name
    pub b2_bucket_name: String,

    /// Public base for returned image URLs, e.g. `https://img.example.com`
    pub img_return_base: String,

    /// Upstream billing projects, round-robined per call
    pub vertex_project_ids: Vec<String>,
    /// Upstream location (default: "global")
    pub vertex_location: String,
    /// Upstream model name
    pub vertex_model: String,
    /// Force the global endpoint host when set to "global"
    pub vertex_endpoint_mode: Option<String>,

    /// Service-account credential as one JSON blob...
    pub gcp_service_account_json: Option<String>,
    /// ...or as three split fields
    pub gcp_sa_client_email: Option<String>,
    pub gcp_sa_private_key: Option<String>,
    pub gcp_token_uri: Option<String>,

    /// Key prefix for generated results (default: "gemini/")
    pub key_prefix: String,

    /// Cap on images taken from one model response (default: 1)
    pub max_images_per_response: usize,

    /// Hosts a reference image may be fetched from; empty disables filtering
    pub allow_ref_image_hosts: Vec<String>,
    /// Permit plain-http reference fetches
    pub allow_ref_image_http: bool,
    /// Reference image size cap in bytes; <= 0 means unlimited
    pub max_ref_image_bytes: i64,

    /// Allowed CORS origins for the API surface (comma separated)
    pub allowed_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "secret".to_string(),
            b2_key_id: String::new(),
            b2_app_key: String::new(),
            b2_bucket_name: String::new(),
            img_return_base: "https://localhost".to_string(),
            vertex_project_ids: Vec::new(),
            vertex_location: "global".to_string(),
            vertex_model: "gemini-2.5-flash-image".to_string(),
            vertex_endpoint_mode: None,
            gcp_service_account_json: None,
            gcp_sa_client_email: None,
            gcp_sa_private_key: None,
            gcp_token_uri: None,
            key_prefix: "gemini/".to_string(),
            max_images_per_response: 1,
            allow_ref_image_hosts: Vec::new(),
            allow_ref_image_http: false,
            max_ref_image_bytes: 0,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            jwt_secret: env::var("JWT_SECRET").unwrap_or(default.jwt_secret),

            b2_key_id: env::var("B2_KEY_ID").unwrap_or_default(),
            b2_app_key: env::var("B2_APP_KEY").unwrap_or_default(),
            b2_bucket_name: env::var("B2_BUCKET_NAME").unwrap_or_default(),

            img_return_base: env::var("IMG_RETURN_BASE")
                .map(|v| normalize_return_base(&v))
                .unwrap_or(default.img_return_base),

            vertex_project_ids: env::var("VERTEX_PROJECT_IDS")
                .map(|v| split_list(&v, '|'))
                .unwrap_or_default(),

            vertex_location: env::var("VERTEX_LOCATION").unwrap_or(default.vertex_location),

            vertex_model: env::var("VERTEX_MODEL").unwrap_or(default.vertex_model),

            vertex_endpoint_mode: env::var("VERTEX_ENDPOINT_MODE").ok(),

            gcp_service_account_json: env::var("GCP_SERVICE_ACCOUNT_JSON").ok(),
            gcp_sa_client_email: env::var("GCP_SA_CLIENT_EMAIL").ok(),
            gcp_sa_private_key: env::var("GCP_SA_PRIVATE_KEY").ok(),
            gcp_token_uri: env::var("GCP_TOKEN_URI").ok(),

            key_prefix: env::var("KEY_PREFIX").unwrap_or(default.key_prefix),

            max_images_per_response: env::var("MAX_IMAGES_PER_RESPONSE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n >= 1)
                .unwrap_or(default.max_images_per_response),

            allow_ref_image_hosts: env::var("ALLOW_REF_IMAGE_HOSTS")
                .map(|v| split_list(&v, '|'))
                .unwrap_or_default(),

            allow_ref_image_http: env::var("ALLOW_REF_IMAGE_HTTP")
                .map(|v| v == "1")
                .unwrap_or(false),

            max_ref_image_bytes: env::var("MAX_REF_IMAGE_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_ref_image_bytes),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| split_list(&v, ','))
                .unwrap_or(default.allowed_origins),
        }
    }

    /// Stable public URL for a stored object key.
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/i/{}", self.img_return_base, key)
    }
}

/// `img.example.com/` and `http://img.example.com` both normalize to a
/// scheme-qualified base with no trailing slash.
pub fn normalize_return_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
