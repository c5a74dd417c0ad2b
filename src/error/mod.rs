use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("No available key: {0}")]
    NoAvailableKey(String),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Model provider error: {0}")]
    ModelProvider(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Insufficient quota: required {required}, available {available}")]
    InsufficientQuota { required: i64, available: i64 },

    #[error("Invalid callback URL: {0}")]
    InvalidCallbackUrl(String),

    #[error("Channel test sweep already running")]
    SweepAlreadyRunning,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn channel_not_found(msg: impl Into<String>) -> Self {
        Error::ChannelNotFound(msg.into())
    }

    pub fn no_available_key(msg: impl Into<String>) -> Self {
        Error::NoAvailableKey(msg.into())
    }

    pub fn model_provider(msg: impl Into<String>) -> Self {
        Error::ModelProvider(msg.into())
    }

    pub fn task_not_found(msg: impl Into<String>) -> Self {
        Error::TaskNotFound(msg.into())
    }

    pub fn invalid_callback_url(msg: impl Into<String>) -> Self {
        Error::InvalidCallbackUrl(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }

    /// HTTP status this error maps to when it reaches a caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Relay(e) => StatusCode::from_u16(e.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Error::ChannelNotFound(_) | Error::NoAvailableKey(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::TaskNotFound(_) => StatusCode::NOT_FOUND,
            Error::InsufficientQuota { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::InvalidCallbackUrl(_) | Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::SweepAlreadyRunning => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error `type` reported in the JSON error body.
    pub fn error_type(&self) -> &str {
        match self {
            Error::Relay(e) => &e.error_type,
            Error::ChannelNotFound(_) | Error::NoAvailableKey(_) => "no_available_channel",
            Error::TaskNotFound(_) => "task_not_found",
            Error::InsufficientQuota { .. } => "insufficient_quota",
            Error::InvalidCallbackUrl(_) => "invalid_callback_url",
            Error::Validation(_) | Error::Json(_) => "invalid_request_error",
            Error::Unauthorized(_) => "authentication_error",
            Error::SweepAlreadyRunning => "sweep_already_running",
            Error::Database(_) => "database_error",
            _ => "api_error",
        }
    }

    /// Converts into the wire-visible relay error carrying a correlation id.
    pub fn into_relay_error(self, correlation_id: &str) -> RelayError {
        RelayError::from(self).with_correlation(correlation_id)
    }
}

impl From<Error> for RelayError {
    fn from(err: Error) -> Self {
        match err {
            Error::Relay(e) => e,
            other => {
                let status = other.status_code().as_u16();
                let error_type = other.error_type().to_string();
                let kind = match other {
                    Error::ChannelNotFound(_) => FailureKind::Selection,
                    Error::NoAvailableKey(_) => FailureKind::KeyUnavailable,
                    Error::Http(_) => FailureKind::Transport,
                    Error::InsufficientQuota { .. }
                    | Error::Validation(_)
                    | Error::InvalidCallbackUrl(_)
                    | Error::Unauthorized(_) => FailureKind::Caller,
                    _ => FailureKind::Internal,
                };
                RelayError::new(status, other.to_string(), error_type).with_kind(kind)
            }
        }
    }
}

/// How a failed attempt failed. Drives retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Upstream answered with a non-success status.
    Upstream,
    /// Timeout, connection refused, broken body.
    Transport,
    /// Multi-key channel with no enabled key.
    KeyUnavailable,
    /// No eligible channel or a bad pin.
    Selection,
    /// Request could not be converted or the response could not be parsed.
    Internal,
    /// The caller's own request or account was rejected before reaching upstream.
    Caller,
}

/// Error returned to relay callers as `{error: {message, type, param, code}}`.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{status} {error_type}: {message}")]
pub struct RelayError {
    pub status: u16,
    pub message: String,
    pub error_type: String,
    pub code: Option<String>,
    pub kind: FailureKind,
    pub correlation_id: Option<String>,
}

impl RelayError {
    pub fn new(status: u16, message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error_type: error_type.into(),
            code: None,
            kind: FailureKind::Upstream,
            correlation_id: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = kind;
        self
    }

    /// Builds an error from an upstream non-success response, pulling
    /// `error.message`, `error.type` and `error.code` out of the body when present.
    pub fn upstream(status: u16, body: &[u8]) -> Self {
        let parsed: Option<UpstreamErrorEnvelope> = serde_json::from_slice(body).ok();
        match parsed.and_then(|envelope| envelope.into_parts()) {
            Some((message, error_type, code)) => {
                let mut err = Self::new(status, message, error_type.unwrap_or_else(|| "upstream_error".to_string()));
                err.code = code;
                err
            }
            None => {
                let text = String::from_utf8_lossy(body);
                let message = if text.trim().is_empty() {
                    format!("bad response status code {}", status)
                } else {
                    text.trim().to_string()
                };
                Self::new(status, message, "upstream_error").with_code(format!("bad_response_status_code_{}", status))
            }
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(500, message, "api_error")
            .with_code("do_request_failed")
            .with_kind(FailureKind::Transport)
    }

    pub fn key_unavailable(message: impl Into<String>) -> Self {
        Self::new(503, message, "api_error")
            .with_code("no_available_key")
            .with_kind(FailureKind::KeyUnavailable)
    }

    pub fn selection(message: impl Into<String>) -> Self {
        Self::new(503, message, "api_error")
            .with_code("no_available_channel")
            .with_kind(FailureKind::Selection)
    }

    pub fn internal(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(500, message, "api_error")
            .with_code(code)
            .with_kind(FailureKind::Internal)
    }

    /// Attaches the correlation id, appending it to the message once.
    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        if self.correlation_id.as_deref() != Some(correlation_id) {
            self.message = format!("{} (request id: {})", self.message, correlation_id);
            self.correlation_id = Some(correlation_id.to_string());
        }
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.message,
                "type": self.error_type,
                "param": "",
                "code": self.code,
            }
        })
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = self.to_json();
        let mut response = (status, Json(body)).into_response();
        if let Some(id) = self.correlation_id.as_deref() {
            if let Ok(value) = id.parse() {
                response.headers_mut().insert("x-request-id", value);
            }
        }
        response
    }
}

#[derive(Deserialize)]
struct UpstreamErrorEnvelope {
    error: Option<UpstreamErrorBody>,
    message: Option<String>,
    code: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct UpstreamErrorBody {
    message: Option<String>,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<serde_json::Value>,
}

impl UpstreamErrorEnvelope {
    fn into_parts(self) -> Option<(String, Option<String>, Option<String>)> {
        if let Some(body) = self.error {
            let message = body.message?;
            return Some((message, body.error_type, body.code.map(code_to_string)));
        }
        let message = self.message?;
        Some((message, None, self.code.map(code_to_string)))
    }
}

fn code_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}
