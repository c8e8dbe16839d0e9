use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Task records live for 24 hours regardless of status.
pub const TASK_TTL_SECONDS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    pub aspect_ratio: String,
    pub image_size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

/// One generation job as exposed through `GET /task/:id`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    /// One of the four visible levels: 25, 50, 75, 100
    pub progress: u8,
    pub prompt: String,
    pub options: TaskOptions,
    pub ref_images: Value,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn pending(task_id: String, prompt: String, options: TaskOptions, ref_images: Value) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            status: TaskStatus::Pending,
            progress: 25,
            prompt,
            options,
            ref_images,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

struct StoredTask {
    task: Task,
    expires_at: DateTime<Utc>,
}

/// In-process KV namespace for task records with per-entry expiry.
///
/// The executor is the sole writer of a given task and its updates are
/// strictly sequential, which keeps progress monotone without CAS.
/// `apply` still refuses to regress progress or leave a terminal state,
/// so a misbehaving second writer cannot violate the observable model.
pub struct TaskStore {
    tasks: DashMap<String, StoredTask>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    pub fn insert(&self, task: Task) {
        let expires_at = Utc::now() + Duration::seconds(TASK_TTL_SECONDS);
        self.tasks
            .insert(task.task_id.clone(), StoredTask { task, expires_at });
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        let entry = self.tasks.get(task_id)?;
        if entry.expires_at < Utc::now() {
            return None;
        }
        Some(entry.task.clone())
    }

    /// Mutate a live task. Terminal states stick and progress never
    /// decreases; offending updates are dropped.
    pub fn apply<F>(&self, task_id: &str, mutate: F)
    where
        F: FnOnce(&mut Task),
    {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            if entry.task.status.is_terminal() {
                return;
            }
            let before_progress = entry.task.progress;
            let mut candidate = entry.task.clone();
            mutate(&mut candidate);
            if candidate.progress < before_progress {
                candidate.progress = before_progress;
            }
            candidate.updated_at = Utc::now();
            entry.task = candidate;
        }
    }

    /// Drop expired records. Called from the background worker.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.tasks.len();
        self.tasks.retain(|_, stored| stored.expires_at > now);
        before - self.tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[cfg(test)]
    fn force_expire(&self, task_id: &str) {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            entry.expires_at = Utc::now() - Duration::seconds(1);
        }
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}
