use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::RelayError;
use crate::relay::adaptor::{
    send_with_bearer, AdaptorDeps, AdaptorOutcome, ProviderAdaptor, ProviderRequest, RawResponse, RelayMeta,
    RelayRequest, Usage,
};

const MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo"];

/// Synchronous OpenAI-compatible chat completions.
pub struct OpenAIAdaptor {
    client: Client,
}

impl OpenAIAdaptor {
    pub fn new(deps: &AdaptorDeps) -> Self {
        Self {
            client: deps.client.clone(),
        }
    }
}

#[async_trait]
impl ProviderAdaptor for OpenAIAdaptor {
    fn init(&mut self, meta: &RelayMeta) {
        debug!(request_id = %meta.correlation_id, "OpenAI adaptor ready for channel {}", meta.channel_id);
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    fn model_list(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }

    fn convert_request(&self, meta: &RelayMeta, request: &RelayRequest) -> Result<ProviderRequest, RelayError> {
        let mut body = request.body.clone();
        let object = body
            .as_object_mut()
            .ok_or_else(|| RelayError::new(400, "request body must be a JSON object", "invalid_request_error"))?;
        object.insert("model".to_string(), Value::String(meta.upstream_model.clone()));
        object.insert("stream".to_string(), Value::Bool(false));

        Ok(ProviderRequest {
            method: Method::POST,
            url: format!("{}/v1/chat/completions", meta.base_url),
            body: Some(body),
        })
    }

    async fn do_request(&mut self, meta: &RelayMeta, request: ProviderRequest) -> Result<RawResponse, RelayError> {
        debug!(
            request_id = %meta.correlation_id,
            "Sending request to OpenAI: model={}",
            meta.upstream_model
        );
        send_with_bearer(&self.client, meta, request).await
    }

    async fn do_response(&mut self, meta: &RelayMeta, raw: RawResponse) -> Result<AdaptorOutcome, RelayError> {
        if !raw.is_success() {
            let err = RelayError::upstream(raw.status, &raw.body);
            error!(request_id = %meta.correlation_id, "OpenAI API error: {} - {}", raw.status, err.message);
            return Err(err);
        }

        let body: Value = serde_json::from_slice(&raw.body).map_err(|e| {
            RelayError::internal(format!("Failed to parse response: {}", e), "unmarshal_response_body_failed")
        })?;
        let usage = body
            .get("usage")
            .cloned()
            .and_then(|u| serde_json::from_value::<OpenAIUsage>(u).ok())
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            });

        Ok(AdaptorOutcome { usage, body })
    }

    fn probe_request(&self, model: &str) -> Option<RelayRequest> {
        let probe = OpenAIRequest {
            model: model.to_string(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            max_tokens: Some(1),
        };
        let body = serde_json::to_value(probe).ok()?;
        RelayRequest::chat(body).ok()
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_deps;
    use serde_json::json;

    fn meta() -> RelayMeta {
        let mut meta = RelayMeta::new("req-1", 1, "default", "gpt-4o");
        meta.upstream_model = "gpt-4o-2024-08-06".to_string();
        meta.base_url = "https://api.openai.com".to_string();
        meta
    }

    #[tokio::test]
    async fn test_convert_request_applies_mapping() {
        let (deps, _tmp) = test_deps().await;
        let adaptor = OpenAIAdaptor::new(&deps);
        let request = RelayRequest::chat(json!({"model": "gpt-4o", "messages": [], "stream": true})).unwrap();

        let converted = adaptor.convert_request(&meta(), &request).unwrap();
        assert_eq!(converted.method, Method::POST);
        assert_eq!(converted.url, "https://api.openai.com/v1/chat/completions");
        let body = converted.body.unwrap();
        assert_eq!(body["model"], "gpt-4o-2024-08-06");
        assert_eq!(body["stream"], false);
    }

    #[tokio::test]
    async fn test_do_response_extracts_usage_and_errors() {
        let (deps, _tmp) = test_deps().await;
        let mut adaptor = OpenAIAdaptor::new(&deps);

        let ok = RawResponse {
            status: 200,
            body: br#"{"id":"x","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#.to_vec(),
        };
        let outcome = adaptor.do_response(&meta(), ok).await.unwrap();
        assert_eq!(outcome.usage.unwrap().total_tokens, 5);

        let denied = RawResponse {
            status: 401,
            body: br#"{"error":{"message":"bad key","type":"invalid_request_error","code":"invalid_api_key"}}"#.to_vec(),
        };
        let err = adaptor.do_response(&meta(), denied).await.unwrap_err();
        assert_eq!(err.status, 401);
        assert_eq!(err.code.as_deref(), Some("invalid_api_key"));
    }

    #[tokio::test]
    async fn test_probe_request() {
        let (deps, _tmp) = test_deps().await;
        let adaptor = OpenAIAdaptor::new(&deps);
        let probe = adaptor.probe_request("gpt-4o-mini").unwrap();
        assert_eq!(probe.model, "gpt-4o-mini");
        assert_eq!(probe.body["max_tokens"], 1);
        assert!(adaptor.model_list().contains(&"gpt-4o".to_string()));
    }
}
