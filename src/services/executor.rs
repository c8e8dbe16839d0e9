use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::object_store::ObjectStore;
use crate::services::reference::{normalize_reference, ReferencePolicy};
use crate::services::task_store::{Task, TaskResult, TaskStatus, TaskStore};
use crate::services::vertex::{ImageModel, InlineImage, ModelRequest};
use crate::utils::hash::sha1_hex;
use crate::utils::keys::date_prefixed_key;

/// At most this many reference images are honored; extras are dropped.
const MAX_REFERENCE_IMAGES: usize = 2;

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub key_prefix: String,
    pub img_return_base: String,
    pub max_images_per_response: usize,
    pub policy: ReferencePolicy,
}

impl GenerationSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            img_return_base: config.img_return_base.clone(),
            max_images_per_response: config.max_images_per_response,
            policy: ReferencePolicy::from_config(config),
        }
    }
}

/// Runs one generation job end to end as a detached task. The four
/// visible progress levels are 25 (normalizing references), 50 (request
/// built), 75 (model answered), 100 (artifacts stored).
pub struct GenerationExecutor {
    tasks: Arc<TaskStore>,
    store: Arc<dyn ObjectStore>,
    model: Arc<dyn ImageModel>,
    http: reqwest::Client,
    settings: GenerationSettings,
}

impl GenerationExecutor {
    pub fn new(
        tasks: Arc<TaskStore>,
        store: Arc<dyn ObjectStore>,
        model: Arc<dyn ImageModel>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            tasks,
            store,
            model,
            http: reqwest::Client::new(),
            settings,
        }
    }

    /// Detach the job. All inputs are copied out of the request scope
    /// before the handler returns.
    pub fn spawn(self: &Arc<Self>, task: Task) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.run(task).await;
        });
    }

    async fn run(&self, task: Task) {
        let task_id = task.task_id.clone();
        self.tasks
            .apply(&task_id, |t| t.status = TaskStatus::Processing);

        // Stage 1: normalize up to two reference entries to inline base64
        let entries: Vec<Value> = match &task.ref_images {
            Value::Array(items) => items.iter().take(MAX_REFERENCE_IMAGES).cloned().collect(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };

        let mut references: Vec<InlineImage> = Vec::new();
        for entry in &entries {
            match normalize_reference(&self.http, &self.settings.policy, entry).await {
                Ok(image) => references.push(image),
                Err(e) => {
                    self.fail(&task_id, format!("REF_IMAGE_INVALID: {e}"));
                    return;
                }
            }
        }

        // Stage 2: request assembled
        let request = ModelRequest {
            prompt: task.prompt.clone(),
            aspect_ratio: task.options.aspect_ratio.clone(),
            image_size: task.options.image_size.clone(),
            references,
        };
        self.tasks.apply(&task_id, |t| t.progress = 50);

        // Stage 3: model call
        let images = match self.model.generate(&request).await {
            Ok(images) => images,
            Err(e) => {
                self.fail(&task_id, e.to_string());
                return;
            }
        };
        self.tasks.apply(&task_id, |t| t.progress = 75);

        // Stage 4: persist artifacts
        if images.is_empty() {
            self.fail(&task_id, "NO_IMAGE_IN_RESPONSE".to_string());
            return;
        }

        let mut urls: Vec<String> = Vec::new();
        for image in images
            .into_iter()
            .take(self.settings.max_images_per_response)
        {
            match self.store_image(&image).await {
                Ok(url) => urls.push(url),
                Err(e) => {
                    tracing::warn!(task_id = %task_id, "artifact upload failed: {e}");
                }
            }
        }

        if urls.is_empty() {
            self.fail(&task_id, "UPLOAD_FAILED".to_string());
            return;
        }

        self.tasks.apply(&task_id, |t| {
            t.status = TaskStatus::Completed;
            t.progress = 100;
            t.result = Some(TaskResult {
                url: urls[0].clone(),
                urls: if urls.len() > 1 {
                    Some(urls.clone())
                } else {
                    None
                },
            });
        });
        tracing::info!(task_id = %task_id, "generation completed");
    }

    async fn store_image(&self, image: &InlineImage) -> anyhow::Result<String> {
        let payload = strip_data_prefix(&image.data);
        let bytes = BASE64.decode(payload.as_bytes())?;
        let sha1 = sha1_hex(&bytes);
        let key = date_prefixed_key(&self.settings.key_prefix, &image.mime_type);

        self.store
            .upload(&key, &image.mime_type, bytes, &sha1)
            .await?;

        Ok(format!("{}/i/{}", self.settings.img_return_base, key))
    }

    fn fail(&self, task_id: &str, error: String) {
        tracing::warn!(task_id = %task_id, error = %error, "generation failed");
        self.tasks.apply(task_id, |t| {
            t.status = TaskStatus::Failed;
            t.error = Some(error);
        });
    }
}

/// Model output occasionally arrives as a full data URL.
fn strip_data_prefix(data: &str) -> &str {
    if data.starts_with("data:") {
        data.split_once(',').map(|(_, rest)| rest).unwrap_or(data)
    } else {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::object_store::OriginResponse;
    use crate::services::task_store::TaskOptions;
    use crate::services::vertex::ModelError;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MemoryStore {
        objects: DashMap<String, Vec<u8>>,
        fail_uploads: AtomicBool,
    }

    impl MemoryStore {
        fn new() -> Self {
            Self {
                objects: DashMap::new(),
                fail_uploads: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn preflight(&self) -> anyhow::Result<Value> {
            Ok(json!({ "ok": true }))
        }

        async fn upload(
            &self,
            key: &str,
            _mime: &str,
            data: Vec<u8>,
            _sha1_hex: &str,
        ) -> anyhow::Result<()> {
            if self.fail_uploads.load(Ordering::SeqCst) {
                return Err(anyhow!("upload rejected: 503"));
            }
            self.objects.insert(key.to_string(), data);
            Ok(())
        }

        async fn download(&self, key: &str, _range: Option<&str>) -> anyhow::Result<OriginResponse> {
            match self.objects.get(key) {
                Some(data) => Ok(OriginResponse {
                    status: 200,
                    content_type: Some("image/png".to_string()),
                    content_length: Some(data.len() as u64),
                    content_range: None,
                    cache_control: None,
                    body: bytes::Bytes::copy_from_slice(&data),
                }),
                None => Ok(OriginResponse {
                    status: 404,
                    content_type: None,
                    content_length: None,
                    content_range: None,
                    cache_control: None,
                    body: bytes::Bytes::new(),
                }),
            }
        }
    }

    struct CannedModel {
        images: Vec<InlineImage>,
    }

    #[async_trait]
    impl ImageModel for CannedModel {
        async fn preflight(&self) -> Result<Value, ModelError> {
            Ok(json!({ "ok": true }))
        }

        async fn generate(&self, _request: &ModelRequest) -> Result<Vec<InlineImage>, ModelError> {
            Ok(self.images.clone())
        }
    }

    fn settings() -> GenerationSettings {
        GenerationSettings {
            key_prefix: "gemini/".to_string(),
            img_return_base: "https://img.example.com".to_string(),
            max_images_per_response: 1,
            policy: ReferencePolicy {
                allow_hosts: vec!["trusted.example".to_string()],
                allow_http: false,
                max_bytes: 0,
            },
        }
    }

    fn pending_task(ref_images: Value) -> Task {
        Task::pending(
            uuid::Uuid::new_v4().to_string(),
            "a red cube".to_string(),
            TaskOptions {
                aspect_ratio: "1:1".to_string(),
                image_size: "1K".to_string(),
            },
            ref_images,
        )
    }

    fn harness(
        model_images: Vec<InlineImage>,
    ) -> (Arc<TaskStore>, Arc<MemoryStore>, Arc<GenerationExecutor>) {
        let tasks = Arc::new(TaskStore::new());
        let store = Arc::new(MemoryStore::new());
        let model = Arc::new(CannedModel {
            images: model_images,
        });
        let executor = Arc::new(GenerationExecutor::new(
            tasks.clone(),
            store.clone(),
            model,
            settings(),
        ));
        (tasks, store, executor)
    }

    fn png_inline() -> InlineImage {
        InlineImage {
            mime_type: "image/png".to_string(),
            data: BASE64.encode(b"not-really-a-png"),
        }
    }

    #[tokio::test]
    async fn test_happy_path_completes_with_public_url() {
        let (tasks, store, executor) = harness(vec![png_inline()]);
        let task = pending_task(json!([]));
        let id = task.task_id.clone();
        tasks.insert(task.clone());

        executor.run(task).await;

        let done = tasks.get(&id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        let url = done.result.unwrap().url;
        assert!(url.starts_with("https://img.example.com/i/gemini/"));
        assert!(url.ends_with(".png"));

        let key = url.strip_prefix("https://img.example.com/i/").unwrap();
        assert!(store.objects.contains_key(key));
    }

    #[tokio::test]
    async fn test_disallowed_reference_host_fails_at_25() {
        let (tasks, _store, executor) = harness(vec![png_inline()]);
        let task = pending_task(json!([{ "uri": "https://evil.example/x.png" }]));
        let id = task.task_id.clone();
        tasks.insert(task.clone());

        executor.run(task).await;

        let failed = tasks.get(&id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.progress, 25);
        assert!(failed
            .error
            .unwrap()
            .starts_with("REF_IMAGE_INVALID: REF_IMAGE_HOST_NOT_ALLOWED"));
    }

    #[tokio::test]
    async fn test_empty_model_response() {
        let (tasks, _store, executor) = harness(vec![]);
        let task = pending_task(json!([]));
        let id = task.task_id.clone();
        tasks.insert(task.clone());

        executor.run(task).await;

        let failed = tasks.get(&id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("NO_IMAGE_IN_RESPONSE"));
        assert_eq!(failed.progress, 75);
    }

    #[tokio::test]
    async fn test_upload_failure_marks_task_failed() {
        let (tasks, store, executor) = harness(vec![png_inline()]);
        store.fail_uploads.store(true, Ordering::SeqCst);
        let task = pending_task(json!([]));
        let id = task.task_id.clone();
        tasks.insert(task.clone());

        executor.run(task).await;

        let failed = tasks.get(&id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("UPLOAD_FAILED"));
    }

    #[tokio::test]
    async fn test_extra_reference_entries_are_dropped() {
        let (tasks, _store, executor) = harness(vec![png_inline()]);
        // Third entry is invalid but must be ignored
        let task = pending_task(json!([
            { "data": "aGVsbG8=" },
            { "data": "d29ybGQ=" },
            { "uri": "https://evil.example/x.png" },
        ]));
        let id = task.task_id.clone();
        tasks.insert(task.clone());

        executor.run(task).await;

        assert_eq!(tasks.get(&id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_strip_data_prefix() {
        assert_eq!(strip_data_prefix("AAAA"), "AAAA");
        assert_eq!(strip_data_prefix("data:image/png;base64,AAAA"), "AAAA");
    }
}
