use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::app::AppState;
use crate::channels::BatchImportMode;
use crate::error::{Error, RelayError};
use crate::monitor::SweepScope;
use crate::relay::kling::{is_supported_request_type, parse_notification};
use crate::relay::{RelayMeta, RelayRequest};
use crate::server::{RequestId, CHANNEL_ID_HEADER};
use crate::storage::Identity;
use crate::tasks::callback::validate_callback_url;
use crate::tasks::IngestOutcome;

/// Fields of an async task submission checked before dispatch. The body is
/// otherwise forwarded to the provider untouched.
#[derive(Debug, Deserialize, Validate)]
pub struct TaskSubmission {
    #[validate(length(max = 2500))]
    pub prompt: Option<String>,
    #[validate(length(max = 2500))]
    pub negative_prompt: Option<String>,
    #[validate(url)]
    pub callback_url: Option<String>,
    #[validate(range(min = 1, max = 9))]
    pub n: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ImportKeysRequest {
    #[validate(length(min = 1))]
    pub keys: String,
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TestQuery {
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SweepQuery {
    pub scope: Option<String>,
    pub notify: Option<bool>,
}

fn bad_request(message: impl Into<String>, correlation_id: &str) -> RelayError {
    RelayError::new(400, message, "invalid_request_error").with_correlation(correlation_id)
}

fn parse_body(body: &Bytes, correlation_id: &str) -> Result<Value, RelayError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid request body: {}", e), correlation_id))?;
    if !value.is_object() {
        return Err(bad_request("request body must be a JSON object", correlation_id));
    }
    Ok(value)
}

/// Channel pin from the admin-only header; ignored for everyone else.
fn pinned_channel(headers: &HeaderMap, identity: &Identity, correlation_id: &str) -> Result<Option<i64>, RelayError> {
    let Some(raw) = headers.get(CHANNEL_ID_HEADER).and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    if !identity.is_admin {
        debug!(request_id = %correlation_id, "Ignoring channel pin from non-admin user {}", identity.user_id);
        return Ok(None);
    }
    raw.trim()
        .parse::<i64>()
        .map(Some)
        .map_err(|_| bad_request(format!("invalid channel id: {}", raw), correlation_id))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(RequestId(correlation_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        let body = parse_body(&body, &correlation_id)?;
        let request = RelayRequest::chat(body).map_err(|e| e.with_correlation(&correlation_id))?;
        let pinned = pinned_channel(&headers, &identity, &correlation_id)?;

        let meta = RelayMeta::new(
            correlation_id.clone(),
            identity.user_id,
            identity.group.clone(),
            request.model.clone(),
        );
        state.dispatcher.relay(meta, pinned, &request).await
    }
    .await;

    match result {
        Ok(outcome) => (StatusCode::OK, Json(outcome.body)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn submit_task(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(RequestId(correlation_id)): Extension<RequestId>,
    Path(request_type): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        if !is_supported_request_type(&request_type) {
            return Err(bad_request(format!("unsupported request type: {}", request_type), &correlation_id));
        }
        let body = parse_body(&body, &correlation_id)?;
        let submission: TaskSubmission = serde_json::from_value(body.clone())
            .map_err(|e| bad_request(format!("invalid request body: {}", e), &correlation_id))?;
        submission
            .validate()
            .map_err(|e| bad_request(e.to_string(), &correlation_id))?;

        let callback_url = match submission.callback_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => Some(
                validate_callback_url(url)
                    .await
                    .map_err(|e| e.into_relay_error(&correlation_id))?
                    .to_string(),
            ),
            None => None,
        };
        let pinned = pinned_channel(&headers, &identity, &correlation_id)?;

        let request = RelayRequest::task(request_type.clone(), body);
        let mut meta = RelayMeta::new(
            correlation_id.clone(),
            identity.user_id,
            identity.group.clone(),
            request.model.clone(),
        );
        meta.user_callback_url = callback_url;
        state.dispatcher.relay(meta, pinned, &request).await
    }
    .await;

    match result {
        Ok(outcome) => (StatusCode::OK, Json(outcome.body)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(RequestId(correlation_id)): Extension<RequestId>,
    Path(id): Path<String>,
) -> Response {
    match state.ledger.get_user_task(identity.user_id, &id).await {
        Ok(task) => (StatusCode::OK, Json(json!({"success": true, "data": task}))).into_response(),
        Err(e) => e.into_relay_error(&correlation_id).into_response(),
    }
}

pub async fn test_channel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<TestQuery>,
) -> Response {
    match state.tester.test_channel(id, query.model.as_deref()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            warn!("Channel {} test could not run: {}", id, e);
            (
                StatusCode::OK,
                Json(json!({"success": false, "message": e.to_string(), "channel_id": id})),
            )
                .into_response()
        }
    }
}

pub async fn test_all_channels(State(state): State<AppState>, Query(query): Query<SweepQuery>) -> Response {
    let scope = match query.scope.as_deref().unwrap_or("all").parse::<SweepScope>() {
        Ok(scope) => scope,
        Err(e) => {
            return (StatusCode::OK, Json(json!({"success": false, "message": e.to_string()}))).into_response();
        }
    };

    match state.tester.start_sweep(scope, query.notify.unwrap_or(false)) {
        Ok(_) => {
            info!("Channel test sweep triggered ({:?})", scope);
            (StatusCode::OK, Json(json!({"success": true, "message": ""}))).into_response()
        }
        Err(Error::SweepAlreadyRunning) => (
            StatusCode::OK,
            Json(json!({"success": false, "message": "channel test sweep already running"})),
        )
            .into_response(),
        Err(e) => (StatusCode::OK, Json(json!({"success": false, "message": e.to_string()}))).into_response(),
    }
}

pub async fn import_keys(
    State(state): State<AppState>,
    Extension(RequestId(correlation_id)): Extension<RequestId>,
    Path(id): Path<i64>,
    body: Bytes,
) -> Response {
    let result = async {
        let request: ImportKeysRequest = serde_json::from_slice(&body)
            .map_err(|e| bad_request(format!("invalid request body: {}", e), &correlation_id))?;
        request
            .validate()
            .map_err(|e| bad_request(e.to_string(), &correlation_id))?;
        let mode = match request.mode.as_deref() {
            Some(mode) => mode
                .parse::<BatchImportMode>()
                .map_err(|e| e.into_relay_error(&correlation_id))?,
            None => BatchImportMode::default(),
        };

        state
            .keys
            .import_keys(id, &request.keys, mode)
            .await
            .map_err(|e| e.into_relay_error(&correlation_id))
    }
    .await;

    match result {
        Ok(channel) => {
            let info = channel.multi_key.as_ref();
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "data": {
                        "channel_id": channel.id,
                        "key_count": info.map(|i| i.key_count).unwrap_or(0),
                        "enabled_keys": info.map(|i| i.enabled_key_count()).unwrap_or(0),
                    }
                })),
            )
                .into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// Provider task notifications. Always answers quickly; duplicates are 200.
pub async fn kling_webhook(State(state): State<AppState>, body: Bytes) -> Response {
    let update = match parse_notification(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("Rejected Kling notification: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid payload"}))).into_response();
        }
    };
    let task_id = update.task_id.clone();

    match state.ledger.ingest_callback(update).await {
        Ok(outcome) => {
            if outcome == IngestOutcome::Duplicate {
                debug!("Duplicate notification for task {}", task_id);
            }
            (StatusCode::OK, Json(json!({"message": "success"}))).into_response()
        }
        Err(Error::TaskNotFound(_)) => {
            warn!("Notification for unknown task {}", task_id);
            (StatusCode::NOT_FOUND, Json(json!({"error": "task not found"}))).into_response()
        }
        Err(e) => {
            error!("Failed to apply notification for task {}: {}", task_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "internal error"}))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::router;
    use crate::tasks::{TaskRecord, TaskStatus};
    use crate::testing::{test_app, TestApp};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    fn chat_body() -> Value {
        json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]})
    }

    #[tokio::test]
    async fn test_chat_requires_token() {
        let app = test_app().await;
        let (status, headers, body) = send(&app, post("/v1/chat/completions", None, chat_body())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["type"], "authentication_error");
        assert!(headers.contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_chat_relays_and_echoes_request_id() {
        let app = test_app().await;
        let channel = app.add_channel(1, "a", &["gpt-4o"]).await;
        app.add_user("alice", 0).await;

        let mut request = post("/v1/chat/completions", Some("tok-alice"), chat_body());
        request.headers_mut().insert("x-request-id", "trace-123".parse().unwrap());
        let (status, headers, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["channel"], channel);
        assert_eq!(headers["x-request-id"], "trace-123");
    }

    #[tokio::test]
    async fn test_chat_error_carries_request_id() {
        let app = test_app().await;
        app.add_user("alice", 0).await;

        let mut request = post("/v1/chat/completions", Some("tok-alice"), chat_body());
        request.headers_mut().insert("x-request-id", "trace-9".parse().unwrap());
        let (status, headers, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(headers["x-request-id"], "trace-9");
        assert!(body["error"]["message"].as_str().unwrap().ends_with("(request id: trace-9)"));
        assert_eq!(body["error"]["param"], "");
    }

    #[tokio::test]
    async fn test_channel_pin_is_admin_only() {
        let app = test_app().await;
        let a = app.add_channel(1, "a", &["gpt-4o"]).await;
        let b = app.add_channel(1, "b", &["gpt-4o"]).await;
        app.script.respond(a, 500, "boom");
        app.add_admin("root").await;

        let mut request = post("/v1/chat/completions", Some("tok-root"), chat_body());
        request.headers_mut().insert("x-channel-id", a.to_string().parse().unwrap());
        let (status, _, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(app.script.calls(), vec![a]);

        let mut request = post("/v1/chat/completions", Some("tok-root"), chat_body());
        request.headers_mut().insert("x-channel-id", b.to_string().parse().unwrap());
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["channel"], b);
    }

    #[tokio::test]
    async fn test_task_submission_rejects_private_callback() {
        let app = test_app().await;
        app.add_user("alice", 1_000_000).await;

        let (status, _, body) = send(
            &app,
            post(
                "/v1/videos/text2video",
                Some("tok-alice"),
                json!({"prompt": "a cat", "callback_url": "http://169.254.169.254/latest"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_callback_url");

        let (status, _, _) = send(
            &app,
            post("/v1/videos/text2audio", Some("tok-alice"), json!({"prompt": "a cat"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = send(
            &app,
            post("/v1/videos/image-generation", Some("tok-alice"), json!({"prompt": "a cat", "n": 50})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_statuses() {
        let app = test_app().await;
        let channel = app.add_channel(1, "k", &["kling-v1"]).await;
        let user = app.add_user("bob", 1_000_000).await;
        let task_id = app.submitted_task(user, channel, "kt-hook").await;

        let (status, _, body) = send(&app, post("/kling/webhook", None, json!({"nonsense": true}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid payload");

        let unknown = json!({"task_id": "kt-missing", "task_status": "succeed"});
        let (status, _, _) = send(&app, post("/kling/webhook", None, unknown)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let done = json!({
            "task_id": "kt-hook",
            "task_status": "succeed",
            "task_result": {"videos": [{"id": "v1", "url": "https://cdn.example.com/v1.mp4", "duration": "5"}]}
        });
        for _ in 0..2 {
            let (status, _, body) = send(&app, post("/kling/webhook", None, done.clone())).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["message"], "success");
        }

        let task = app.state.ledger.get_task(task_id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Succeed);
        assert_eq!(task.core().quota, 70_000);
    }

    #[tokio::test]
    async fn test_get_task_is_scoped_to_owner() {
        let app = test_app().await;
        let channel = app.add_channel(1, "k", &["kling-v1"]).await;
        let owner = app.add_user("carol", 1_000_000).await;
        app.add_user("dave", 1_000_000).await;
        app.submitted_task(owner, channel, "kt-owned").await;

        let (status, _, body) = send(&app, get("/v1/videos/tasks/kt-owned", "tok-carol")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["core"]["task_id"], "kt-owned");

        let (status, _, _) = send(&app, get("/v1/videos/tasks/kt-owned", "tok-dave")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_endpoints() {
        let app = test_app().await;
        let channel = app.add_channel(1, "a", &["gpt-4o"]).await;
        app.add_user("alice", 0).await;
        app.add_admin("root").await;

        let (status, _, _) = send(&app, get(&format!("/api/channel/test/{}", channel), "tok-alice")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _, body) = send(&app, get(&format!("/api/channel/test/{}", channel), "tok-root")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["channel_id"], channel);
        assert_eq!(body["model"], "gpt-4o");

        let mut request = post(
            &format!("/api/channel/{}/keys", channel),
            Some("tok-root"),
            json!({"keys": "sk-1\nsk-2", "mode": "append"}),
        );
        request.headers_mut().insert("x-request-id", "imp-1".parse().unwrap());
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["key_count"], 3);
    }

    #[tokio::test]
    async fn test_sweep_trigger_reports_running_sweep() {
        let mut config = crate::app::config::AppConfig::default();
        config.health.test_request_interval_ms = 200;
        let app = crate::testing::test_app_with(config).await;
        app.add_channel(1, "a", &["gpt-4o"]).await;
        app.add_channel(1, "b", &["gpt-4o"]).await;
        app.add_admin("root").await;

        let (_, _, first) = send(&app, get("/api/channel/test?scope=all", "tok-root")).await;
        let (_, _, second) = send(&app, get("/api/channel/test?scope=all", "tok-root")).await;
        assert_eq!(first["success"], true);
        assert_eq!(second["success"], false);
        assert_eq!(second["message"], "channel test sweep already running");
    }
}
