//! Asynchronous task ledger: lifecycle, billing and user callbacks for
//! provider jobs that complete after the relay request returns.

pub mod callback;
pub mod ledger;
pub mod poller;
pub mod pricing;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub use callback::CallbackDispatcher;
pub use ledger::{IngestOutcome, NewTask, TaskLedger};
pub use poller::TaskPoller;
pub use pricing::Pricing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Submitted,
    Processing,
    Succeed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Processing => "processing",
            TaskStatus::Succeed => "succeed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(TaskStatus::Pending),
            "submitted" => Some(TaskStatus::Submitted),
            "processing" => Some(TaskStatus::Processing),
            "succeed" | "succeeded" | "success" => Some(TaskStatus::Succeed),
            "failed" | "failure" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeed | TaskStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Submitted => 1,
            TaskStatus::Processing => 2,
            TaskStatus::Succeed | TaskStatus::Failed => 3,
        }
    }

    /// Forward-only transitions; terminal states accept nothing.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    None,
    Pending,
    Success,
    Failed,
}

impl CallbackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallbackStatus::None => "none",
            CallbackStatus::Pending => "pending",
            CallbackStatus::Success => "success",
            CallbackStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => CallbackStatus::Pending,
            "success" => CallbackStatus::Success,
            "failed" => CallbackStatus::Failed,
            _ => CallbackStatus::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Video,
    Image,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Video => "video",
            TaskKind::Image => "image",
        }
    }
}

/// Fields every task kind carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCore {
    pub id: i64,
    /// Provider task id; empty until the provider accepts the job.
    pub task_id: String,
    pub user_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub provider: String,
    pub request_type: String,
    pub prompt: String,
    pub quota: i64,
    pub status: TaskStatus,
    pub fail_reason: Option<String>,
    pub result: Option<Value>,
    pub callback_url: Option<String>,
    pub callback_status: CallbackStatus,
    pub callback_error: Option<String>,
    pub callback_time: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoParams {
    pub mode: String,
    pub duration: u32,
    pub aspect_ratio: String,
    pub resolution: String,
    pub actual_duration: Option<f64>,
    pub video_id: Option<String>,
    pub video_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageParams {
    pub n: u32,
    pub resolution: String,
    pub image_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoTask {
    pub core: TaskCore,
    pub params: VideoParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageTask {
    pub core: TaskCore,
    pub params: ImageParams,
}

/// One video in a provider result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultVideo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub duration: Option<String>,
}

/// One image in a provider result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultImage {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub url: String,
}

/// Provider-reported progress for one task, from a webhook or a poll.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub task_id: String,
    pub external_task_id: Option<String>,
    pub status: TaskStatus,
    pub status_message: Option<String>,
    pub videos: Vec<ResultVideo>,
    pub images: Vec<ResultImage>,
    /// Provider-side charge in CNY, when reported.
    pub final_unit_deduction: Option<String>,
    pub raw: Value,
}

impl TaskUpdate {
    /// Reported duration of the first video, in seconds.
    pub fn actual_duration(&self) -> Option<f64> {
        self.videos
            .first()
            .and_then(|v| v.duration.as_deref())
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| *d > 0.0)
    }
}

/// Lifecycle operations the ledger drives, written once for every task kind.
pub trait TaskRecord {
    fn core(&self) -> &TaskCore;
    fn core_mut(&mut self) -> &mut TaskCore;
    fn kind(&self) -> TaskKind;
    fn params_json(&self) -> Result<String>;
    /// Kind-specific fields from a provider update.
    fn absorb(&mut self, update: &TaskUpdate);

    /// Advances the status if the move is forward. Returns whether it moved.
    fn set_status(&mut self, status: TaskStatus) -> bool {
        let core = self.core_mut();
        if core.status == status || !core.status.can_advance_to(status) {
            return false;
        }
        core.status = status;
        core.updated_at = Utc::now().timestamp();
        true
    }

    fn set_result(&mut self, result: Value) {
        let core = self.core_mut();
        core.result = Some(result);
        core.updated_at = Utc::now().timestamp();
    }

    /// Applies a provider update: provider id, status, payload and kind fields.
    fn update(&mut self, update: &TaskUpdate) -> bool {
        if self.core().task_id.is_empty() && !update.task_id.is_empty() {
            self.core_mut().task_id = update.task_id.clone();
        }
        let moved = self.set_status(update.status);
        if moved {
            self.set_result(update.raw.clone());
            self.absorb(update);
        }
        moved
    }

    fn mark_failed(&mut self, reason: &str) {
        let core = self.core_mut();
        core.status = TaskStatus::Failed;
        core.fail_reason = Some(reason.to_string());
        core.updated_at = Utc::now().timestamp();
    }

    /// Records a confirmed success billed at `quota`.
    fn mark_success(&mut self, quota: i64) {
        let core = self.core_mut();
        core.status = TaskStatus::Succeed;
        core.quota = quota;
        core.fail_reason = None;
        core.updated_at = Utc::now().timestamp();
    }
}

impl TaskRecord for VideoTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Video
    }

    fn params_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.params)?)
    }

    fn absorb(&mut self, update: &TaskUpdate) {
        if let Some(duration) = update.actual_duration() {
            self.params.actual_duration = Some(duration);
        }
        if let Some(video) = update.videos.first() {
            if !video.id.is_empty() {
                self.params.video_id = Some(video.id.clone());
            }
            if !video.url.is_empty() {
                self.params.video_url = Some(video.url.clone());
            }
        }
        if update.status == TaskStatus::Failed {
            self.core.fail_reason = update.status_message.clone();
        }
    }
}

impl TaskRecord for ImageTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Image
    }

    fn params_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.params)?)
    }

    fn absorb(&mut self, update: &TaskUpdate) {
        if !update.images.is_empty() {
            self.params.image_urls = update
                .images
                .iter()
                .filter(|i| !i.url.is_empty())
                .map(|i| i.url.clone())
                .collect();
        }
        if update.status == TaskStatus::Failed {
            self.core.fail_reason = update.status_message.clone();
        }
    }
}

/// A ledger task of either kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Video(VideoTask),
    Image(ImageTask),
}

impl Task {
    pub fn from_parts(kind: &str, core: TaskCore, params: &str) -> Result<Self> {
        match kind {
            "video" => Ok(Task::Video(VideoTask {
                core,
                params: serde_json::from_str(params)?,
            })),
            "image" => Ok(Task::Image(ImageTask {
                core,
                params: serde_json::from_str(params)?,
            })),
            other => Err(Error::Database(sqlx::Error::Decode(
                format!("Unknown task kind: {}", other).into(),
            ))),
        }
    }

    pub fn id(&self) -> i64 {
        self.core().id
    }

    pub fn status(&self) -> TaskStatus {
        self.core().status
    }
}

impl TaskRecord for Task {
    fn core(&self) -> &TaskCore {
        match self {
            Task::Video(t) => t.core(),
            Task::Image(t) => t.core(),
        }
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        match self {
            Task::Video(t) => t.core_mut(),
            Task::Image(t) => t.core_mut(),
        }
    }

    fn kind(&self) -> TaskKind {
        match self {
            Task::Video(t) => t.kind(),
            Task::Image(t) => t.kind(),
        }
    }

    fn params_json(&self) -> Result<String> {
        match self {
            Task::Video(t) => t.params_json(),
            Task::Image(t) => t.params_json(),
        }
    }

    fn absorb(&mut self, update: &TaskUpdate) {
        match self {
            Task::Video(t) => t.absorb(update),
            Task::Image(t) => t.absorb(update),
        }
    }
}
