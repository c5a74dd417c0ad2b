//! Kling video and image generation. Jobs are accepted synchronously and
//! settled later through the webhook, so every submission is recorded in the
//! task ledger before the provider is called.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, FailureKind, RelayError, Result};
use crate::relay::adaptor::{
    send_with_bearer, AdaptorDeps, AdaptorOutcome, ProviderAdaptor, ProviderRequest, RawResponse, RelayMeta,
    RelayRequest,
};
use crate::tasks::ledger::{NewTask, TaskParams};
use crate::tasks::pricing::DEFAULT_VIDEO_DURATION_SECS;
use crate::tasks::{ImageParams, ResultImage, ResultVideo, TaskLedger, TaskStatus, TaskUpdate, VideoParams};

pub const REQUEST_TYPE_TEXT2VIDEO: &str = "text2video";
pub const REQUEST_TYPE_IMAGE2VIDEO: &str = "image2video";
pub const REQUEST_TYPE_OMNI_VIDEO: &str = "omni-video";
pub const REQUEST_TYPE_MULTI_IMAGE2VIDEO: &str = "multi-image2video";
pub const REQUEST_TYPE_IMAGE_GENERATION: &str = "image-generation";

pub const SUPPORTED_REQUEST_TYPES: &[&str] = &[
    REQUEST_TYPE_TEXT2VIDEO,
    REQUEST_TYPE_IMAGE2VIDEO,
    REQUEST_TYPE_OMNI_VIDEO,
    REQUEST_TYPE_MULTI_IMAGE2VIDEO,
    REQUEST_TYPE_IMAGE_GENERATION,
];

const MODELS: &[&str] = &["kling-v1", "kling-v1-5", "kling-v1-6", "kling-v2-master", "kling-image"];

pub fn is_supported_request_type(request_type: &str) -> bool {
    SUPPORTED_REQUEST_TYPES.contains(&request_type)
}

pub fn is_image_request_type(request_type: &str) -> bool {
    request_type == REQUEST_TYPE_IMAGE_GENERATION
}

fn path_prefix(request_type: &str) -> &'static str {
    if is_image_request_type(request_type) {
        "/v1/images"
    } else {
        "/v1/videos"
    }
}

pub struct KlingAdaptor {
    client: Client,
    ledger: Arc<TaskLedger>,
    webhook_url: String,
    /// Ledger id of the task submitted by this attempt.
    pending_task: Option<i64>,
}

impl KlingAdaptor {
    pub fn new(deps: &AdaptorDeps) -> Self {
        Self {
            client: deps.client.clone(),
            ledger: Arc::clone(&deps.ledger),
            webhook_url: deps.webhook_url.clone(),
            pending_task: None,
        }
    }

    /// Pre-flight, pending ledger record and webhook wiring for one submission.
    /// Returns the ledger id embedded in the request as `external_task_id`.
    async fn prepare_submission(&mut self, meta: &RelayMeta, request: &mut ProviderRequest) -> Result<i64> {
        let body = request
            .body
            .as_mut()
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::validation("request body must be a JSON object"))?;
        let request_type = request
            .url
            .rsplit('/')
            .next()
            .unwrap_or(REQUEST_TYPE_TEXT2VIDEO)
            .to_string();

        let params = task_params(&request_type, body);
        let estimated_quota = self.ledger.estimate_quota(&meta.original_model, &request_type, &params);
        self.ledger.preflight(meta.user_id, estimated_quota).await?;

        let task = self
            .ledger
            .create_pending(NewTask {
                user_id: meta.user_id,
                channel_id: meta.channel_id,
                model: meta.original_model.clone(),
                provider: self.name().to_string(),
                request_type,
                prompt: body.get("prompt").and_then(Value::as_str).unwrap_or_default().to_string(),
                estimated_quota,
                callback_url: meta.user_callback_url.clone(),
                params,
            })
            .await?;

        body.insert("external_task_id".to_string(), Value::String(task.id().to_string()));
        body.insert("callback_url".to_string(), Value::String(self.webhook_url.clone()));
        self.pending_task = Some(task.id());
        Ok(task.id())
    }

    async fn fail_pending(&mut self, reason: &str) {
        if let Some(id) = self.pending_task.take() {
            if let Err(e) = self.ledger.mark_submit_failed(id, reason).await {
                warn!("Failed to mark task {} as failed: {}", id, e);
            }
        }
    }
}

#[async_trait]
impl ProviderAdaptor for KlingAdaptor {
    fn init(&mut self, meta: &RelayMeta) {
        self.pending_task = None;
        debug!(request_id = %meta.correlation_id, "Kling adaptor ready for channel {}", meta.channel_id);
    }

    fn name(&self) -> &'static str {
        "kling"
    }

    fn model_list(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }

    fn convert_request(&self, meta: &RelayMeta, request: &RelayRequest) -> std::result::Result<ProviderRequest, RelayError> {
        let request_type = request
            .request_type()
            .filter(|t| is_supported_request_type(t))
            .ok_or_else(|| {
                RelayError::new(400, "unsupported request type", "invalid_request_error")
                    .with_code("invalid_request_type")
                    .with_kind(FailureKind::Caller)
            })?;

        let mut body: Map<String, Value> = request
            .body
            .as_object()
            .cloned()
            .ok_or_else(|| {
                RelayError::new(400, "request body must be a JSON object", "invalid_request_error")
                    .with_kind(FailureKind::Caller)
            })?;
        body.remove("model");
        body.remove("callback_url");
        body.remove("external_task_id");
        body.insert("model_name".to_string(), Value::String(meta.upstream_model.clone()));

        Ok(ProviderRequest {
            method: Method::POST,
            url: format!("{}{}/{}", meta.base_url, path_prefix(request_type), request_type),
            body: Some(Value::Object(body)),
        })
    }

    async fn do_request(&mut self, meta: &RelayMeta, mut request: ProviderRequest) -> std::result::Result<RawResponse, RelayError> {
        let task_id = self.prepare_submission(meta, &mut request).await.map_err(RelayError::from)?;
        debug!(request_id = %meta.correlation_id, "Submitting Kling task {} to {}", task_id, request.url);

        match send_with_bearer(&self.client, meta, request).await {
            Ok(raw) => Ok(raw),
            Err(err) => {
                self.fail_pending(&err.message).await;
                Err(err)
            }
        }
    }

    async fn do_response(&mut self, meta: &RelayMeta, raw: RawResponse) -> std::result::Result<AdaptorOutcome, RelayError> {
        if !raw.is_success() {
            let err = RelayError::upstream(raw.status, &raw.body);
            self.fail_pending(&err.message).await;
            return Err(err);
        }

        let response: KlingResponse = match serde_json::from_slice(&raw.body) {
            Ok(response) => response,
            Err(e) => {
                let err = RelayError::internal(format!("Failed to parse Kling response: {}", e), "unmarshal_response_body_failed");
                self.fail_pending(&err.message).await;
                return Err(err);
            }
        };

        debug!(
            request_id = %meta.correlation_id,
            "Kling response: code={}, task_id={}, status={}, message={}",
            response.code,
            response.data.as_ref().map(|d| d.task_id.as_str()).unwrap_or_default(),
            response.data.as_ref().map(|d| d.task_status.as_str()).unwrap_or_default(),
            response.message
        );

        let provider_task_id = response
            .data
            .as_ref()
            .map(|d| d.task_id.clone())
            .filter(|id| !id.is_empty());
        let provider_task_id = match (response.code, provider_task_id) {
            (0, Some(id)) => id,
            (code, _) => {
                let err = RelayError::new(400, response.message.clone(), "kling_api_error").with_code(code.to_string());
                self.fail_pending(&err.message).await;
                return Err(err);
            }
        };

        // accepted upstream, so this must not surface as a retryable failure
        if let Some(id) = self.pending_task.take() {
            match self.ledger.mark_submitted(id, &provider_task_id).await {
                Ok(()) => {
                    info!(request_id = %meta.correlation_id, "Kling task {} accepted as {}", id, provider_task_id)
                }
                Err(e) => error!(
                    request_id = %meta.correlation_id,
                    "Kling accepted task {} as {} but the ledger update failed: {}",
                    id,
                    provider_task_id,
                    e
                ),
            }
        }

        let body = serde_json::from_slice(&raw.body).unwrap_or(Value::Null);
        Ok(AdaptorOutcome { usage: None, body })
    }

    fn probe_request(&self, _model: &str) -> Option<RelayRequest> {
        // every submission is billable work
        None
    }

    async fn fetch_task(&self, meta: &RelayMeta, request_type: &str, task_id: &str) -> Result<Option<TaskUpdate>> {
        let request = ProviderRequest {
            method: Method::GET,
            url: format!("{}{}/{}/{}", meta.base_url, path_prefix(request_type), request_type, task_id),
            body: None,
        };
        let raw = send_with_bearer(&self.client, meta, request).await?;
        if !raw.is_success() {
            return Err(RelayError::upstream(raw.status, &raw.body).into());
        }

        let response: KlingResponse = serde_json::from_slice(&raw.body)?;
        if response.code != 0 {
            return Err(Error::model_provider(format!("Kling query failed: {}", response.message)));
        }
        let raw_data = serde_json::from_slice::<Value>(&raw.body)?
            .get("data")
            .cloned()
            .unwrap_or(Value::Null);
        Ok(response.data.and_then(|data| data.into_update(raw_data)))
    }
}

/// Modality parameters recorded on the ledger task.
fn task_params(request_type: &str, body: &Map<String, Value>) -> TaskParams {
    let text = |field: &str| body.get(field).and_then(Value::as_str).unwrap_or_default().to_string();

    if is_image_request_type(request_type) {
        TaskParams::Image(ImageParams {
            n: body.get("n").and_then(number_field).map(|n| n as u32).unwrap_or(1).max(1),
            resolution: text("resolution"),
            image_urls: Vec::new(),
        })
    } else {
        TaskParams::Video(VideoParams {
            mode: Some(text("mode")).filter(|m| !m.is_empty()).unwrap_or_else(|| "std".to_string()),
            duration: body
                .get("duration")
                .and_then(number_field)
                .map(|d| d as u32)
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_VIDEO_DURATION_SECS),
            aspect_ratio: Some(text("aspect_ratio")).filter(|a| !a.is_empty()).unwrap_or_else(|| "16:9".to_string()),
            resolution: text("resolution"),
            ..Default::default()
        })
    }
}

/// Accepts `5`, `5.0` or `"5"`.
fn number_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('s').parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct KlingResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<KlingTaskData>,
}

/// Task state as returned by queries and posted to the webhook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KlingTaskData {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub task_status: String,
    #[serde(default)]
    pub task_status_msg: Option<String>,
    #[serde(default)]
    pub task_info: Option<KlingTaskInfo>,
    #[serde(default)]
    pub task_result: Option<KlingTaskResult>,
    #[serde(default)]
    pub external_task_id: Option<String>,
    #[serde(default)]
    pub final_unit_deduction: Option<Value>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KlingTaskInfo {
    #[serde(default)]
    pub external_task_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KlingTaskResult {
    #[serde(default)]
    pub videos: Vec<ResultVideo>,
    #[serde(default)]
    pub images: Vec<ResultImage>,
}

impl KlingTaskData {
    /// `None` when the status is not one the ledger understands.
    pub fn into_update(self, raw: Value) -> Option<TaskUpdate> {
        let status = TaskStatus::parse(&self.task_status)?;
        let external_task_id = self
            .external_task_id
            .filter(|id| !id.is_empty())
            .or_else(|| self.task_info.and_then(|info| info.external_task_id))
            .filter(|id| !id.is_empty());
        let result = self.task_result.unwrap_or_default();
        let final_unit_deduction = self.final_unit_deduction.and_then(|value| match value {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        Some(TaskUpdate {
            task_id: self.task_id,
            external_task_id,
            status,
            status_message: self.task_status_msg,
            videos: result
                .videos
                .into_iter()
                .map(|mut v| {
                    v.duration = v.duration.map(|d| d.trim_end_matches('s').to_string());
                    v
                })
                .collect(),
            images: result.images,
            final_unit_deduction,
            raw,
        })
    }
}

/// Parses a webhook body into a ledger update.
pub fn parse_notification(body: &[u8]) -> Result<TaskUpdate> {
    let raw: Value = serde_json::from_slice(body)?;
    let data: KlingTaskData = serde_json::from_value(raw.clone())?;
    if data.task_id.is_empty() && data.external_task_id.is_none() && data.task_info.is_none() {
        return Err(Error::validation("notification carries no task id"));
    }
    data.into_update(raw)
        .ok_or_else(|| Error::validation("notification carries an unknown task status"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Channel;
    use crate::storage::{ChannelRepository, UserRepository, ROLE_COMMON};
    use crate::testing::{create_test_database, test_ledger};
    use reqwest::Client;
    use crate::tasks::TaskRecord;
    use serde_json::json;

    struct Fixture {
        adaptor: KlingAdaptor,
        ledger: Arc<TaskLedger>,
        meta: RelayMeta,
        pool: sqlx::SqlitePool,
        _temp_dir: tempfile::TempDir,
    }

    async fn fixture(balance: i64) -> Fixture {
        let (db, temp_dir) = create_test_database().await;
        let users = UserRepository::new(db.get_pool());
        let user_id = users.create_user("dave", "tok-dave", "default", ROLE_COMMON, balance).await.unwrap();
        let channel_id = ChannelRepository::new(db.get_pool())
            .insert(&Channel::new(50, "kling", "ak-1").with_models(&["kling-v1"]))
            .await
            .unwrap();
        let ledger = Arc::new(test_ledger(&db));
        let deps = AdaptorDeps {
            client: Client::new(),
            ledger: Arc::clone(&ledger),
            webhook_url: "https://relay.example.com/kling/webhook".to_string(),
        };

        let mut meta = RelayMeta::new("req-9", user_id, "default", "kling-v1");
        meta.channel_id = channel_id;
        meta.base_url = "https://api-beijing.klingai.com".to_string();
        meta.user_callback_url = Some("https://hooks.example.com/done".to_string());

        Fixture {
            adaptor: KlingAdaptor::new(&deps),
            ledger,
            meta,
            pool: db.get_pool(),
            _temp_dir: temp_dir,
        }
    }

    fn text2video() -> RelayRequest {
        RelayRequest::task(
            REQUEST_TYPE_TEXT2VIDEO,
            json!({"model": "kling-v1", "prompt": "a cat", "duration": "10", "mode": "std", "callback_url": "https://hooks.example.com/done"}),
        )
    }

    #[tokio::test]
    async fn test_convert_request() {
        let f = fixture(1_000_000).await;
        let converted = f.adaptor.convert_request(&f.meta, &text2video()).unwrap();
        assert_eq!(converted.url, "https://api-beijing.klingai.com/v1/videos/text2video");
        let body = converted.body.unwrap();
        assert_eq!(body["model_name"], "kling-v1");
        assert!(body.get("model").is_none());
        assert!(body.get("callback_url").is_none());

        let image = RelayRequest::task(REQUEST_TYPE_IMAGE_GENERATION, json!({"prompt": "x"}));
        let converted = f.adaptor.convert_request(&f.meta, &image).unwrap();
        assert_eq!(converted.url, "https://api-beijing.klingai.com/v1/images/image-generation");

        let unknown = RelayRequest::task("lip-sync", json!({}));
        assert_eq!(f.adaptor.convert_request(&f.meta, &unknown).unwrap_err().status, 400);
    }

    #[tokio::test]
    async fn test_submission_records_pending_task_then_submitted() {
        let mut f = fixture(1_000_000).await;
        let mut request = f.adaptor.convert_request(&f.meta, &text2video()).unwrap();

        let id = f.adaptor.prepare_submission(&f.meta, &mut request).await.unwrap();
        let body = request.body.as_ref().unwrap();
        assert_eq!(body["external_task_id"], id.to_string());
        assert_eq!(body["callback_url"], "https://relay.example.com/kling/webhook");

        let pending = f.ledger.get_task(id).await.unwrap();
        assert_eq!(pending.status(), TaskStatus::Pending);
        assert_eq!(pending.core().quota, 140_000);
        assert_eq!(pending.core().callback_url.as_deref(), Some("https://hooks.example.com/done"));

        let raw = RawResponse {
            status: 200,
            body: br#"{"code":0,"message":"SUCCEED","request_id":"r1","data":{"task_id":"kt-77","task_status":"submitted"}}"#.to_vec(),
        };
        let outcome = f.adaptor.do_response(&f.meta, raw).await.unwrap();
        assert_eq!(outcome.body["data"]["task_id"], "kt-77");

        let submitted = f.ledger.get_task(id).await.unwrap();
        assert_eq!(submitted.status(), TaskStatus::Submitted);
        assert_eq!(submitted.core().task_id, "kt-77");
    }

    #[tokio::test]
    async fn test_accepted_submission_succeeds_when_ledger_write_fails() {
        let mut f = fixture(1_000_000).await;
        let mut request = f.adaptor.convert_request(&f.meta, &text2video()).unwrap();
        let id = f.adaptor.prepare_submission(&f.meta, &mut request).await.unwrap();
        sqlx::query("DELETE FROM tasks WHERE id = ?").bind(id).execute(&f.pool).await.unwrap();

        let raw = RawResponse {
            status: 200,
            body: br#"{"code":0,"message":"SUCCEED","request_id":"r3","data":{"task_id":"kt-78","task_status":"submitted"}}"#.to_vec(),
        };
        let outcome = f.adaptor.do_response(&f.meta, raw).await.unwrap();
        assert_eq!(outcome.body["data"]["task_id"], "kt-78");
    }

    #[tokio::test]
    async fn test_rejection_marks_task_failed() {
        let mut f = fixture(1_000_000).await;
        let mut request = f.adaptor.convert_request(&f.meta, &text2video()).unwrap();
        let id = f.adaptor.prepare_submission(&f.meta, &mut request).await.unwrap();

        let raw = RawResponse {
            status: 200,
            body: br#"{"code":1201,"message":"invalid prompt","request_id":"r2"}"#.to_vec(),
        };
        let err = f.adaptor.do_response(&f.meta, raw).await.unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.code.as_deref(), Some("1201"));

        let failed = f.ledger.get_task(id).await.unwrap();
        assert_eq!(failed.status(), TaskStatus::Failed);
        assert_eq!(failed.core().fail_reason.as_deref(), Some("invalid prompt"));
    }

    #[tokio::test]
    async fn test_preflight_rejects_low_balance() {
        let mut f = fixture(10).await;
        let mut request = f.adaptor.convert_request(&f.meta, &text2video()).unwrap();
        let err = f.adaptor.prepare_submission(&f.meta, &mut request).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientQuota { .. }));
        let relay: RelayError = err.into();
        assert_eq!(relay.status, 402);
        assert_eq!(relay.error_type, "insufficient_quota");
    }

    #[test]
    fn test_parse_notification() {
        let body = br#"{
            "task_id": "kt-1",
            "task_status": "succeed",
            "task_info": {"external_task_id": "42"},
            "final_unit_deduction": 1.5,
            "task_result": {"videos": [{"id": "v1", "url": "https://cdn/v1.mp4", "duration": "5.1s"}]}
        }"#;
        let update = parse_notification(body).unwrap();
        assert_eq!(update.status, TaskStatus::Succeed);
        assert_eq!(update.external_task_id.as_deref(), Some("42"));
        assert_eq!(update.final_unit_deduction.as_deref(), Some("1.5"));
        assert_eq!(update.actual_duration(), Some(5.1));

        assert!(parse_notification(b"not json").is_err());
        assert!(parse_notification(br#"{"task_id":"kt-1","task_status":"exploded"}"#).is_err());
        assert!(parse_notification(br#"{"task_status":"succeed"}"#).is_err());
    }

    #[test]
    fn test_task_params_extraction() {
        let body = json!({"duration": 10, "mode": "pro", "aspect_ratio": "9:16"});
        match task_params(REQUEST_TYPE_TEXT2VIDEO, body.as_object().unwrap()) {
            TaskParams::Video(v) => {
                assert_eq!(v.duration, 10);
                assert_eq!(v.mode, "pro");
                assert_eq!(v.aspect_ratio, "9:16");
            }
            TaskParams::Image(_) => panic!("expected video params"),
        }
        match task_params(REQUEST_TYPE_IMAGE_GENERATION, json!({"n": 3}).as_object().unwrap()) {
            TaskParams::Image(i) => assert_eq!(i.n, 3),
            TaskParams::Video(_) => panic!("expected image params"),
        }
    }
}
