//! Shared fixtures for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::app::config::{AppConfig, BillingConfig};
use crate::app::AppState;
use crate::channels::Channel;
use crate::error::RelayError;
use crate::monitor::{HealthSignal, Notifier};
use crate::relay::{
    AdaptorDeps, AdaptorOutcome, ProviderAdaptor, ProviderRequest, RawResponse, RelayMeta, RelayRequest,
};
use crate::storage::{ChannelRepository, Database, TaskRepository, UserRepository, ROLE_ADMIN, ROLE_COMMON};
use crate::tasks::ledger::{NewTask, TaskParams};
use crate::tasks::{
    CallbackDispatcher, Pricing, ResultVideo, TaskLedger, TaskStatus, TaskUpdate, VideoParams,
};

pub(crate) async fn create_test_database() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(&db_path).await.unwrap();
    (db, temp_dir)
}

pub(crate) fn test_ledger(db: &Database) -> TaskLedger {
    let pool = db.get_pool();
    let tasks = TaskRepository::new(pool.clone());
    let callbacks = Arc::new(CallbackDispatcher::new(tasks.clone(), Duration::from_secs(5)).unwrap());
    TaskLedger::new(
        tasks,
        Arc::new(UserRepository::new(pool)),
        Pricing::from_config(&BillingConfig::default()),
        callbacks,
    )
}

pub(crate) async fn test_deps() -> (AdaptorDeps, TempDir) {
    let (db, temp_dir) = create_test_database().await;
    let deps = AdaptorDeps {
        client: Client::new(),
        ledger: Arc::new(test_ledger(&db)),
        webhook_url: "http://localhost:3000/kling/webhook".to_string(),
    };
    (deps, temp_dir)
}

pub(crate) fn video_update(task_id: &str, status: TaskStatus, duration: &str) -> TaskUpdate {
    TaskUpdate {
        task_id: task_id.to_string(),
        external_task_id: None,
        status,
        status_message: None,
        videos: vec![ResultVideo {
            id: format!("{}-video", task_id),
            url: format!("https://cdn.example.com/{}.mp4", task_id),
            duration: Some(duration.to_string()),
        }],
        images: Vec::new(),
        final_unit_deduction: None,
        raw: json!({"task_id": task_id, "task_status": status.as_str()}),
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub(crate) fn subjects(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(subject, _)| subject.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, subject: &str, content: &str) {
        self.sent.lock().push((subject.to_string(), content.to_string()));
    }
}

/// Canned upstream behavior per channel. Channels without a script answer 200.
#[derive(Default)]
pub(crate) struct Script {
    responses: Mutex<HashMap<i64, (u16, String)>>,
    delays: Mutex<HashMap<i64, Duration>>,
    calls: Mutex<Vec<i64>>,
    fetched: Mutex<Vec<String>>,
    task_updates: Mutex<HashMap<String, TaskUpdate>>,
}

impl Script {
    /// Status 0 simulates a transport failure.
    pub(crate) fn respond(&self, channel_id: i64, status: u16, body: &str) {
        self.responses.lock().insert(channel_id, (status, body.to_string()));
    }

    pub(crate) fn delay(&self, channel_id: i64, delay: Duration) {
        self.delays.lock().insert(channel_id, delay);
    }

    pub(crate) fn calls(&self) -> Vec<i64> {
        self.calls.lock().clone()
    }

    /// Provider task ids asked about, in order.
    pub(crate) fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    pub(crate) fn set_task_update(&self, provider_task_id: &str, update: TaskUpdate) {
        self.task_updates.lock().insert(provider_task_id.to_string(), update);
    }
}

pub(crate) struct ScriptedAdaptor {
    script: Arc<Script>,
}

impl ScriptedAdaptor {
    pub(crate) fn new(script: Arc<Script>) -> Self {
        Self { script }
    }
}

#[async_trait]
impl ProviderAdaptor for ScriptedAdaptor {
    fn init(&mut self, _meta: &RelayMeta) {}

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn model_list(&self) -> Vec<String> {
        vec!["gpt-4o".to_string()]
    }

    fn convert_request(&self, meta: &RelayMeta, request: &RelayRequest) -> Result<ProviderRequest, RelayError> {
        let mut body = request.body.clone();
        body["model"] = Value::String(meta.upstream_model.clone());
        Ok(ProviderRequest {
            method: Method::POST,
            url: format!("{}/v1/chat/completions", meta.base_url),
            body: Some(body),
        })
    }

    async fn do_request(&mut self, meta: &RelayMeta, _request: ProviderRequest) -> Result<RawResponse, RelayError> {
        self.script.calls.lock().push(meta.channel_id);
        let delay = self.script.delays.lock().get(&meta.channel_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.responses.lock().get(&meta.channel_id).cloned();
        match scripted {
            Some((0, _)) => Err(RelayError::transport("connection refused")),
            Some((status, body)) => Ok(RawResponse {
                status,
                body: body.into_bytes(),
            }),
            None => Ok(RawResponse {
                status: 200,
                body: json!({
                    "channel": meta.channel_id,
                    "model": meta.upstream_model,
                    "key_index": meta.key_index,
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}}],
                })
                .to_string()
                .into_bytes(),
            }),
        }
    }

    async fn do_response(&mut self, _meta: &RelayMeta, raw: RawResponse) -> Result<AdaptorOutcome, RelayError> {
        if !raw.is_success() {
            return Err(RelayError::upstream(raw.status, &raw.body));
        }
        let body: Value = serde_json::from_slice(&raw.body)
            .map_err(|e| RelayError::internal(e.to_string(), "bad_response_body"))?;
        Ok(AdaptorOutcome { usage: None, body })
    }

    fn probe_request(&self, model: &str) -> Option<RelayRequest> {
        RelayRequest::chat(json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
        }))
        .ok()
    }

    async fn fetch_task(
        &self,
        _meta: &RelayMeta,
        _request_type: &str,
        task_id: &str,
    ) -> crate::error::Result<Option<TaskUpdate>> {
        self.script.fetched.lock().push(task_id.to_string());
        Ok(self.script.task_updates.lock().get(task_id).cloned())
    }
}

/// Fully wired state over a temp database. Channel type 1 is scripted.
pub(crate) struct TestApp {
    pub state: AppState,
    pub signals: mpsc::Receiver<HealthSignal>,
    pub script: Arc<Script>,
    pub notifier: Arc<RecordingNotifier>,
    pub users: UserRepository,
    pub channels: ChannelRepository,
    _temp_dir: TempDir,
}

pub(crate) async fn test_app() -> TestApp {
    test_app_with(AppConfig::default()).await
}

pub(crate) async fn test_app_with(mut config: AppConfig) -> TestApp {
    let (db, temp_dir) = create_test_database().await;
    config.database.path = temp_dir.path().join("test.db");

    let script = Arc::new(Script::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let scripted = Arc::clone(&script);
    let (state, signals) = AppState::build(config, &db, notifier.clone(), move |registry| {
        registry.register(
            1,
            Arc::new(move |_deps: &AdaptorDeps| {
                Box::new(ScriptedAdaptor::new(Arc::clone(&scripted))) as Box<dyn ProviderAdaptor>
            }),
        );
    })
    .unwrap();

    TestApp {
        state,
        signals,
        script,
        notifier,
        users: UserRepository::new(db.get_pool()),
        channels: ChannelRepository::new(db.get_pool()),
        _temp_dir: temp_dir,
    }
}

impl TestApp {
    pub(crate) async fn insert_channel(&self, channel: Channel) -> i64 {
        let id = self.channels.insert(&channel).await.unwrap();
        self.state.store.refresh().await.unwrap();
        id
    }

    pub(crate) async fn add_channel(&self, channel_type: i32, name: &str, models: &[&str]) -> i64 {
        let channel = Channel::new(channel_type, name, format!("sk-{}", name)).with_models(models);
        self.insert_channel(channel).await
    }

    /// Changes the cached priority only.
    pub(crate) async fn set_priority(&self, channel_id: i64, priority: i64) {
        let channel = self.state.store.get_channel_by_id(channel_id, true).unwrap();
        self.state.store.upsert(Channel {
            priority,
            ..Channel::clone(&channel)
        });
    }

    pub(crate) async fn add_user(&self, name: &str, quota: i64) -> i64 {
        self.users
            .create_user(name, &format!("tok-{}", name), "default", ROLE_COMMON, quota)
            .await
            .unwrap()
    }

    pub(crate) async fn add_admin(&self, name: &str) -> i64 {
        self.users
            .create_user(name, &format!("tok-{}", name), "default", ROLE_ADMIN, 0)
            .await
            .unwrap()
    }

    /// A 5 second std video task already accepted by the provider.
    pub(crate) async fn submitted_task(&self, user_id: i64, channel_id: i64, provider_task_id: &str) -> i64 {
        let task = self
            .state
            .ledger
            .create_pending(NewTask {
                user_id,
                channel_id,
                model: "kling-v1".to_string(),
                provider: "kling".to_string(),
                request_type: "text2video".to_string(),
                prompt: "a cat surfing".to_string(),
                estimated_quota: 70_000,
                callback_url: None,
                params: TaskParams::Video(VideoParams {
                    mode: "std".to_string(),
                    duration: 5,
                    aspect_ratio: "16:9".to_string(),
                    ..Default::default()
                }),
            })
            .await
            .unwrap();
        self.state.ledger.mark_submitted(task.id(), provider_task_id).await.unwrap();
        task.id()
    }
}
