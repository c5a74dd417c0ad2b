use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::storage::{QuotaStore, TaskRepository};
use crate::tasks::pricing::PricingInput;
use crate::tasks::{
    CallbackDispatcher, CallbackStatus, ImageParams, ImageTask, Pricing, Task, TaskCore, TaskRecord, TaskStatus,
    TaskUpdate, VideoParams, VideoTask,
};

/// Conditional writes lost to a concurrent writer are retried this many times.
const MAX_COMMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// The task had already settled; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskParams {
    Video(VideoParams),
    Image(ImageParams),
}

/// A task about to be submitted to a provider.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub provider: String,
    pub request_type: String,
    pub prompt: String,
    pub estimated_quota: i64,
    pub callback_url: Option<String>,
    pub params: TaskParams,
}

/// Lifecycle and post-paid billing of asynchronous provider jobs.
pub struct TaskLedger {
    repo: TaskRepository,
    quota: Arc<dyn QuotaStore>,
    pricing: Pricing,
    callbacks: Arc<CallbackDispatcher>,
}

impl TaskLedger {
    pub fn new(
        repo: TaskRepository,
        quota: Arc<dyn QuotaStore>,
        pricing: Pricing,
        callbacks: Arc<CallbackDispatcher>,
    ) -> Self {
        Self {
            repo,
            quota,
            pricing,
            callbacks,
        }
    }

    pub fn repository(&self) -> &TaskRepository {
        &self.repo
    }

    /// Quota a task is expected to cost before the provider reports actuals.
    pub fn estimate_quota(&self, model: &str, request_type: &str, params: &TaskParams) -> i64 {
        match params {
            TaskParams::Video(video) => self.pricing.video_quota(&PricingInput {
                model,
                request_type,
                mode: &video.mode,
                duration_secs: video.duration,
                resolution: &video.resolution,
            }),
            TaskParams::Image(image) => self.pricing.image_quota(model, image.n),
        }
    }

    /// Post-paid pre-flight: the balance must cover the estimate. Nothing is debited.
    pub async fn preflight(&self, user_id: i64, estimated_quota: i64) -> Result<()> {
        let available = self.quota.get_quota(user_id).await?;
        if available < estimated_quota {
            warn!(
                "Insufficient quota for user {}: required {}, available {}",
                user_id, estimated_quota, available
            );
            return Err(Error::InsufficientQuota {
                required: estimated_quota,
                available,
            });
        }
        Ok(())
    }

    /// Record the task before the provider is called so a webhook can always find it.
    pub async fn create_pending(&self, new_task: NewTask) -> Result<Task> {
        let now = Utc::now().timestamp();
        let core = TaskCore {
            id: 0,
            task_id: String::new(),
            user_id: new_task.user_id,
            channel_id: new_task.channel_id,
            model: new_task.model,
            provider: new_task.provider,
            request_type: new_task.request_type,
            prompt: new_task.prompt,
            quota: new_task.estimated_quota,
            status: TaskStatus::Pending,
            fail_reason: None,
            result: None,
            callback_status: if new_task.callback_url.is_some() {
                CallbackStatus::Pending
            } else {
                CallbackStatus::None
            },
            callback_url: new_task.callback_url,
            callback_error: None,
            callback_time: None,
            created_at: now,
            updated_at: now,
        };

        let mut task = match new_task.params {
            TaskParams::Video(params) => Task::Video(VideoTask { core, params }),
            TaskParams::Image(params) => Task::Image(ImageTask { core, params }),
        };
        let id = self.repo.insert(&task).await?;
        task.core_mut().id = id;

        info!(
            "Created pending {} task {} for user {} on channel {}",
            task.kind().as_str(),
            id,
            task.core().user_id,
            task.core().channel_id
        );
        Ok(task)
    }

    /// Provider accepted the job.
    pub async fn mark_submitted(&self, id: i64, provider_task_id: &str) -> Result<()> {
        let mut task = self.load(id).await?;
        if task.status() != TaskStatus::Pending {
            debug!("Task {} already moved to {:?}; skip submit", id, task.status());
            return Ok(());
        }
        task.core_mut().task_id = provider_task_id.to_string();
        task.set_status(TaskStatus::Submitted);
        if !self.repo.compare_and_update(&task, TaskStatus::Pending).await? {
            // a webhook beat the submit response; it already carries the provider id
            debug!("Task {} was advanced concurrently during submit", id);
        }
        info!("Task {} submitted as provider task {}", id, provider_task_id);
        Ok(())
    }

    /// Provider rejected the job or could not be reached. Never billed.
    pub async fn mark_submit_failed(&self, id: i64, reason: &str) -> Result<()> {
        let mut task = self.load(id).await?;
        let expected = task.status();
        if expected.is_terminal() {
            return Ok(());
        }
        task.mark_failed(reason);
        self.repo.compare_and_update(&task, expected).await?;
        warn!("Task {} failed at submission: {}", id, reason);
        Ok(())
    }

    pub async fn get_task(&self, id: i64) -> Result<Task> {
        self.load(id).await
    }

    /// Looks a task up by internal id or provider task id, scoped to one user.
    pub async fn get_user_task(&self, user_id: i64, id: &str) -> Result<Task> {
        let task = match id.parse::<i64>() {
            Ok(internal) => self.repo.get(internal).await?,
            Err(_) => None,
        };
        let task = match task {
            Some(task) => Some(task),
            None => self.repo.find_by_task_id(id).await?,
        };
        task.filter(|t| t.core().user_id == user_id)
            .ok_or_else(|| Error::task_not_found(format!("task {} not found", id)))
    }

    pub async fn stale_in_flight(&self, updated_before: i64, limit: i64) -> Result<Vec<Task>> {
        self.repo.list_stale_in_flight(updated_before, limit).await
    }

    /// Applies a provider notification. Resolves by provider task id first,
    /// then by the internal id echoed back as `external_task_id`.
    pub async fn ingest_callback(&self, update: TaskUpdate) -> Result<IngestOutcome> {
        let mut task = self.repo.find_by_task_id(&update.task_id).await?;
        if task.is_none() {
            if let Some(internal) = update
                .external_task_id
                .as_deref()
                .and_then(|id| id.trim().parse::<i64>().ok())
            {
                task = self.repo.get(internal).await?;
            }
        }

        let task = task.ok_or_else(|| Error::task_not_found(format!("task {} not found", update.task_id)))?;
        self.apply_update(task, &update).await
    }

    /// Drives one task forward from a provider update. A terminal success
    /// debits the user exactly once: the debit commits with the conditional
    /// status write, so only the writer whose update lands pays, and a failed
    /// write leaves the task open for the provider's retry.
    pub async fn apply_update(&self, task: Task, update: &TaskUpdate) -> Result<IngestOutcome> {
        let id = task.id();
        let mut current = task;

        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let expected = current.status();
            if expected.is_terminal() {
                debug!("Task {} already {:?}; duplicate update ignored", id, expected);
                return Ok(IngestOutcome::Duplicate);
            }

            let mut next = current.clone();
            let learned_task_id = next.core().task_id.is_empty() && !update.task_id.is_empty();
            let moved = next.update(update);

            match update.status {
                TaskStatus::Succeed => {
                    let quota = self.actual_quota(&next, update);
                    next.mark_success(quota);
                }
                TaskStatus::Failed => {
                    let reason = next
                        .core()
                        .fail_reason
                        .clone()
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "task failed".to_string());
                    next.mark_failed(&reason);
                }
                _ if !moved && !learned_task_id => return Ok(IngestOutcome::Applied),
                _ => {}
            }

            let committed = if next.status() == TaskStatus::Succeed {
                self.repo.commit_success(&next, expected).await?
            } else {
                self.repo.compare_and_update(&next, expected).await?
            };
            if committed {
                self.settle(&next, update);
                return Ok(IngestOutcome::Applied);
            }

            debug!("Task {} changed concurrently; reloading", id);
            current = self.load(id).await?;
        }

        Err(Error::unknown(format!("task {} kept changing during update", id)))
    }

    /// Side effects of a committed transition. Charges were written with it.
    fn settle(&self, task: &Task, update: &TaskUpdate) {
        let core = task.core();
        match core.status {
            TaskStatus::Succeed => {
                info!("Task {} succeeded; billed {} quota to user {}", core.id, core.quota, core.user_id);
            }
            TaskStatus::Failed => {
                info!(
                    "Task {} failed: {}",
                    core.id,
                    core.fail_reason.as_deref().unwrap_or("unknown reason")
                );
            }
            _ => {
                debug!("Task {} advanced to {:?}", core.id, core.status);
                return;
            }
        }

        if let Some(url) = core.callback_url.clone().filter(|u| !u.is_empty()) {
            self.callbacks.dispatch(core.id, url, update.raw.clone());
        }
    }

    /// Quota from what the provider actually produced. A positive CNY
    /// deduction wins over unit-based pricing.
    fn actual_quota(&self, task: &Task, update: &TaskUpdate) -> i64 {
        if let Some(quota) = update
            .final_unit_deduction
            .as_deref()
            .and_then(|amount| self.pricing.quota_from_cny(amount))
        {
            return quota;
        }

        let core = task.core();
        match task {
            Task::Video(video) => {
                let duration = video
                    .params
                    .actual_duration
                    .map(|d| d.round() as u32)
                    .filter(|d| *d > 0)
                    .unwrap_or(video.params.duration);
                self.pricing.video_quota(&PricingInput {
                    model: &core.model,
                    request_type: &core.request_type,
                    mode: &video.params.mode,
                    duration_secs: duration,
                    resolution: &video.params.resolution,
                })
            }
            Task::Image(image) => {
                let count = if update.images.is_empty() {
                    image.params.n
                } else {
                    update.images.len() as u32
                };
                self.pricing.image_quota(&core.model, count)
            }
        }
    }

    async fn load(&self, id: i64) -> Result<Task> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| Error::task_not_found(format!("task {} not found", id)))
    }
}
