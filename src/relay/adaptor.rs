use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::channels::{Channel, SelectedKey};
use crate::error::{RelayError, Result};
use crate::relay::kling::KlingAdaptor;
use crate::relay::openai::OpenAIAdaptor;
use crate::tasks::{TaskLedger, TaskUpdate};

/// What an inbound relay call asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMode {
    ChatCompletions,
    /// Asynchronous job such as `text2video` or `image-generation`.
    Task { request_type: String },
}

#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub mode: RelayMode,
    pub model: String,
    pub body: Value,
}

impl RelayRequest {
    pub fn chat(body: Value) -> std::result::Result<Self, RelayError> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| RelayError::new(400, "model is required", "invalid_request_error").with_code("model_required"))?
            .to_string();
        Ok(Self {
            mode: RelayMode::ChatCompletions,
            model,
            body,
        })
    }

    /// Task requests accept `model` or `model_name` and default to `kling-v1`.
    pub fn task(request_type: impl Into<String>, body: Value) -> Self {
        let model = ["model", "model_name"]
            .iter()
            .find_map(|field| body.get(*field).and_then(Value::as_str).filter(|m| !m.is_empty()))
            .unwrap_or("kling-v1")
            .to_string();
        Self {
            mode: RelayMode::Task {
                request_type: request_type.into(),
            },
            model,
            body,
        }
    }

    pub fn request_type(&self) -> Option<&str> {
        match &self.mode {
            RelayMode::ChatCompletions => None,
            RelayMode::Task { request_type } => Some(request_type),
        }
    }
}

/// Per-request context shared by every attempt.
#[derive(Debug, Clone, Default)]
pub struct RelayMeta {
    pub correlation_id: String,
    pub user_id: i64,
    pub group: String,
    pub original_model: String,
    pub upstream_model: String,
    pub channel_id: i64,
    pub channel_type: i32,
    pub channel_name: String,
    pub base_url: String,
    pub api_key: String,
    pub key_index: Option<usize>,
    pub is_multi_key: bool,
    pub pinned: bool,
    /// Caller-supplied URL notified when an async task settles.
    pub user_callback_url: Option<String>,
}

impl RelayMeta {
    pub fn new(correlation_id: impl Into<String>, user_id: i64, group: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            correlation_id: correlation_id.into(),
            user_id,
            group: group.into(),
            upstream_model: model.clone(),
            original_model: model,
            ..Default::default()
        }
    }

    /// Bind a channel and key for the next attempt. The model mapping is
    /// always applied to the original model, never to a previous mapping.
    pub fn bind_channel(&mut self, channel: &Channel, key: SelectedKey) {
        self.channel_id = channel.id;
        self.channel_type = channel.channel_type;
        self.channel_name = channel.name.clone();
        self.base_url = channel
            .base_url
            .clone()
            .filter(|url| !url.is_empty())
            .or_else(|| AdaptorKind::from_channel_type(channel.channel_type).map(|k| k.default_base_url().to_string()))
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();
        self.upstream_model = channel.map_model(&self.original_model);
        self.api_key = key.key;
        self.key_index = key.index;
        self.is_multi_key = channel.is_multi_key();
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A successful provider response ready to hand back to the caller.
#[derive(Debug, Clone)]
pub struct AdaptorOutcome {
    pub usage: Option<Usage>,
    pub body: Value,
}

#[async_trait]
pub trait ProviderAdaptor: Send + Sync {
    fn init(&mut self, meta: &RelayMeta);
    fn name(&self) -> &'static str;
    fn model_list(&self) -> Vec<String>;
    /// Builds the upstream request. Has no side effects.
    fn convert_request(&self, meta: &RelayMeta, request: &RelayRequest) -> std::result::Result<ProviderRequest, RelayError>;
    async fn do_request(&mut self, meta: &RelayMeta, request: ProviderRequest) -> std::result::Result<RawResponse, RelayError>;
    /// Turns the raw response into an outcome. Non-success statuses become errors here.
    async fn do_response(&mut self, meta: &RelayMeta, raw: RawResponse) -> std::result::Result<AdaptorOutcome, RelayError>;
    /// Cheap request used by channel tests, if the provider supports one.
    fn probe_request(&self, model: &str) -> Option<RelayRequest>;

    async fn fetch_task(&self, _meta: &RelayMeta, _request_type: &str, _task_id: &str) -> Result<Option<TaskUpdate>> {
        Ok(None)
    }
}

/// Closed set of provider families the registry knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptorKind {
    OpenAi,
    Kling,
}

impl AdaptorKind {
    pub const ALL: [AdaptorKind; 2] = [AdaptorKind::OpenAi, AdaptorKind::Kling];

    pub fn channel_type(self) -> i32 {
        match self {
            AdaptorKind::OpenAi => 1,
            AdaptorKind::Kling => 50,
        }
    }

    pub fn from_channel_type(channel_type: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.channel_type() == channel_type)
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            AdaptorKind::OpenAi => "https://api.openai.com",
            AdaptorKind::Kling => "https://api-beijing.klingai.com",
        }
    }
}

/// Shared collaborators handed to adaptor constructors.
#[derive(Clone)]
pub struct AdaptorDeps {
    pub client: Client,
    pub ledger: Arc<TaskLedger>,
    pub webhook_url: String,
}

pub type AdaptorConstructor = Arc<dyn Fn(&AdaptorDeps) -> Box<dyn ProviderAdaptor> + Send + Sync>;

/// Maps channel type codes to adaptor constructors. Built once at startup.
pub struct AdaptorRegistry {
    deps: AdaptorDeps,
    constructors: HashMap<i32, AdaptorConstructor>,
}

impl AdaptorRegistry {
    pub fn new(deps: AdaptorDeps) -> Self {
        Self {
            deps,
            constructors: HashMap::new(),
        }
    }

    pub fn with_defaults(deps: AdaptorDeps) -> Self {
        let mut registry = Self::new(deps);
        for kind in AdaptorKind::ALL {
            let constructor: AdaptorConstructor = match kind {
                AdaptorKind::OpenAi => Arc::new(|deps: &AdaptorDeps| Box::new(OpenAIAdaptor::new(deps)) as Box<dyn ProviderAdaptor>),
                AdaptorKind::Kling => Arc::new(|deps: &AdaptorDeps| Box::new(KlingAdaptor::new(deps)) as Box<dyn ProviderAdaptor>),
            };
            registry.register(kind.channel_type(), constructor);
        }
        registry
    }

    pub fn register(&mut self, channel_type: i32, constructor: AdaptorConstructor) {
        self.constructors.insert(channel_type, constructor);
    }

    pub fn supports(&self, channel_type: i32) -> bool {
        self.constructors.contains_key(&channel_type)
    }

    /// Fresh adaptor instance for one attempt.
    pub fn create(&self, channel_type: i32) -> std::result::Result<Box<dyn ProviderAdaptor>, RelayError> {
        self.constructors
            .get(&channel_type)
            .map(|constructor| constructor(&self.deps))
            .ok_or_else(|| {
                RelayError::internal(format!("unsupported channel type {}", channel_type), "invalid_api_type")
            })
    }
}

fn bearer_headers(api_key: &str) -> std::result::Result<HeaderMap, RelayError> {
    let mut headers = HeaderMap::new();
    let auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
        .map_err(|e| RelayError::internal(format!("Invalid API key format: {}", e), "invalid_api_key_format"))?;
    headers.insert(AUTHORIZATION, auth_value);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// Sends a provider request with bearer auth and reads the whole body.
pub(crate) async fn send_with_bearer(
    client: &Client,
    meta: &RelayMeta,
    request: ProviderRequest,
) -> std::result::Result<RawResponse, RelayError> {
    let headers = bearer_headers(&meta.api_key)?;
    let mut builder = client.request(request.method, &request.url).headers(headers);
    if let Some(body) = &request.body {
        builder = builder.json(body);
    }

    let start_time = Instant::now();
    let response = builder
        .send()
        .await
        .map_err(|e| RelayError::transport(format!("HTTP request failed: {}", e)))?;
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|e| RelayError::transport(format!("Failed to read response body: {}", e)))?;

    debug!(
        request_id = %meta.correlation_id,
        channel_id = meta.channel_id,
        "Upstream {} answered {} in {:?}",
        request.url,
        status,
        start_time.elapsed()
    );
    Ok(RawResponse {
        status,
        body: body.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bind_channel_maps_from_original_model() {
        let mut channel = Channel::new(1, "primary", "sk-1").with_models(&["gpt-4o"]);
        channel.id = 4;
        channel
            .model_mapping
            .insert("gpt-4o".to_string(), "gpt-4o-2024-08-06".to_string());

        let mut meta = RelayMeta::new("req-1", 7, "default", "gpt-4o");
        meta.bind_channel(&channel, SelectedKey { key: "sk-1".to_string(), index: None });
        assert_eq!(meta.upstream_model, "gpt-4o-2024-08-06");
        assert_eq!(meta.base_url, "https://api.openai.com");

        let mut plain = Channel::new(1, "plain", "sk-2").with_base_url("https://proxy.local/");
        plain.id = 5;
        meta.bind_channel(&plain, SelectedKey { key: "sk-2".to_string(), index: Some(1) });
        assert_eq!(meta.upstream_model, "gpt-4o");
        assert_eq!(meta.base_url, "https://proxy.local");
        assert_eq!(meta.key_index, Some(1));
        assert_eq!(meta.channel_id, 5);
    }

    #[test]
    fn test_relay_request_model_resolution() {
        assert!(RelayRequest::chat(json!({"messages": []})).is_err());
        let chat = RelayRequest::chat(json!({"model": "gpt-4o"})).unwrap();
        assert_eq!(chat.mode, RelayMode::ChatCompletions);

        let task = RelayRequest::task("text2video", json!({"model_name": "kling-v1-6"}));
        assert_eq!(task.model, "kling-v1-6");
        assert_eq!(task.request_type(), Some("text2video"));
        assert_eq!(RelayRequest::task("text2video", json!({})).model, "kling-v1");
    }

    #[test]
    fn test_adaptor_kind_codes() {
        assert_eq!(AdaptorKind::from_channel_type(1), Some(AdaptorKind::OpenAi));
        assert_eq!(AdaptorKind::from_channel_type(50), Some(AdaptorKind::Kling));
        assert_eq!(AdaptorKind::from_channel_type(999), None);
    }
}
