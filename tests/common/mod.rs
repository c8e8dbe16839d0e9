#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use dashmap::DashMap;
use http_body_util::BodyExt;
use image_gateway::config::AppConfig;
use image_gateway::infrastructure::{database, seed};
use image_gateway::services::edge_cache::EdgeCache;
use image_gateway::services::executor::{GenerationExecutor, GenerationSettings};
use image_gateway::services::object_store::{ObjectStore, OriginResponse};
use image_gateway::services::task_store::TaskStore;
use image_gateway::services::vertex::{ImageModel, InlineImage, ModelError, ModelRequest};
use image_gateway::{create_app, AppState};
use sea_orm::{ConnectOptions, Database};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

/// In-memory stand-in for the object store, instrumented for cache and
/// preflight assertions.
pub struct MockObjectStore {
    pub objects: DashMap<String, (String, Vec<u8>)>,
    pub downloads: AtomicUsize,
    pub uploads: AtomicUsize,
    pub fail_preflight: AtomicBool,
    pub fail_uploads: AtomicBool,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            downloads: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            fail_preflight: AtomicBool::new(false),
            fail_uploads: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn preflight(&self) -> anyhow::Result<Value> {
        if self.fail_preflight.load(Ordering::SeqCst) {
            return Err(anyhow!("authorize rejected: 401"));
        }
        Ok(json!({ "ok": true, "bucketName": "test-bucket" }))
    }

    async fn upload(
        &self,
        key: &str,
        mime: &str,
        data: Vec<u8>,
        sha1_hex: &str,
    ) -> anyhow::Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(anyhow!("upload rejected: 503"));
        }
        // The store would reject a bad content hash; so does the mock
        assert_eq!(
            sha1_hex,
            image_gateway::utils::hash::sha1_hex(&data),
            "declared SHA-1 must match the payload"
        );
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.objects
            .insert(key.to_string(), (mime.to_string(), data));
        Ok(())
    }

    async fn download(&self, key: &str, range: Option<&str>) -> anyhow::Result<OriginResponse> {
        self.downloads.fetch_add(1, Ordering::SeqCst);

        let Some(entry) = self.objects.get(key) else {
            return Ok(OriginResponse {
                status: 404,
                content_type: None,
                content_length: None,
                content_range: None,
                cache_control: None,
                body: bytes::Bytes::from_static(b"not found"),
            });
        };
        let (mime, data) = entry.value().clone();

        if let Some(range) = range {
            // Only the simple "bytes=a-b" shape appears in tests
            let spec = range.trim_start_matches("bytes=");
            let (start, end) = spec.split_once('-').unwrap_or(("0", ""));
            let start: usize = start.parse().unwrap_or(0);
            let end: usize = end.parse().unwrap_or(data.len() - 1);
            let end = end.min(data.len() - 1);
            let slice = data[start..=end].to_vec();

            return Ok(OriginResponse {
                status: 206,
                content_type: Some(mime),
                content_length: Some(slice.len() as u64),
                content_range: Some(format!("bytes {}-{}/{}", start, end, data.len())),
                cache_control: None,
                body: bytes::Bytes::from(slice),
            });
        }

        Ok(OriginResponse {
            status: 200,
            content_type: Some(mime),
            content_length: Some(data.len() as u64),
            content_range: None,
            cache_control: None,
            body: bytes::Bytes::from(data),
        })
    }
}

/// Canned model that returns a fixed set of inline images.
pub struct MockImageModel {
    pub images: Vec<InlineImage>,
    pub preflight_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub fail_preflight: AtomicBool,
}

impl MockImageModel {
    pub fn returning(images: Vec<InlineImage>) -> Self {
        Self {
            images,
            preflight_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            fail_preflight: AtomicBool::new(false),
        }
    }

    pub fn single_png(bytes: &[u8]) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        Self::returning(vec![InlineImage {
            mime_type: "image/png".to_string(),
            data: STANDARD.encode(bytes),
        }])
    }
}

#[async_trait]
impl ImageModel for MockImageModel {
    async fn preflight(&self) -> Result<Value, ModelError> {
        self.preflight_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_preflight.load(Ordering::SeqCst) {
            return Err(ModelError::Config("no projects".to_string()));
        }
        Ok(json!({ "ok": true }))
    }

    async fn generate(&self, _request: &ModelRequest) -> Result<Vec<InlineImage>, ModelError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.images.clone())
    }
}

pub struct TestHarness {
    pub app: Router,
    pub state: AppState,
    pub store: Arc<MockObjectStore>,
    pub model: Arc<MockImageModel>,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        jwt_secret: "test_secret".to_string(),
        img_return_base: "https://img.example.com".to_string(),
        allow_ref_image_hosts: vec!["trusted.example".to_string()],
        ..AppConfig::default()
    }
}

pub async fn setup(config: AppConfig, model: MockImageModel) -> TestHarness {
    // One pooled connection, or every checkout would see a fresh
    // in-memory database
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await.unwrap();
    database::run_migrations(&db).await.unwrap();
    seed::seed_initial_admin(&db).await.unwrap();

    let store = Arc::new(MockObjectStore::new());
    let model = Arc::new(model);
    let tasks = Arc::new(TaskStore::new());
    let edge_cache = Arc::new(EdgeCache::new());

    let executor = Arc::new(GenerationExecutor::new(
        tasks.clone(),
        store.clone(),
        model.clone(),
        GenerationSettings::from_config(&config),
    ));

    let state = AppState {
        db,
        object_store: store.clone(),
        model: model.clone(),
        tasks,
        edge_cache,
        executor,
        config,
    };

    TestHarness {
        app: create_app(state.clone()),
        state,
        store,
        model,
    }
}

pub async fn setup_default() -> TestHarness {
    setup(test_config(), MockImageModel::single_png(b"png-artifact")).await
}

pub async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }

    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    app.clone().oneshot(request).await.unwrap()
}

pub async fn read_json(response: Response<Body>) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

pub async fn read_bytes(response: Response<Body>) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

/// Log in and return the bearer token. The password is the client-side
/// SHA-256 hex digest, exactly as the wire protocol expects.
pub async fn login(app: &Router, username: &str, password_plain: &str) -> String {
    let digest = image_gateway::utils::hash::sha256_hex(password_plain.as_bytes());
    let response = send_json(
        app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "username": username, "password": digest })),
    )
    .await;
    assert_eq!(response.status(), 200, "login should succeed");

    let body = read_json(response).await;
    body["token"].as_str().unwrap().to_string()
}
