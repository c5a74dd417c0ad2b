//! HTTP surface: relay entrypoints, channel administration and provider webhooks.

pub mod handlers;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::{Error, Result};
use crate::storage::Identity;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CHANNEL_ID_HEADER: &str = "x-channel-id";

/// Correlation id of the current request.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/api/channel/test", get(handlers::test_all_channels))
        .route("/api/channel/test/:id", get(handlers::test_channel))
        .route("/api/channel/:id/keys", post(handlers::import_keys))
        .route_layer(middleware::from_fn(require_admin));

    let authenticated = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/videos/tasks/:id", get(handlers::get_task))
        .route("/v1/videos/:request_type", post(handlers::submit_task))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let body_limit = state.config.server.max_body_bytes;

    Router::new()
        .route("/kling/webhook", post(handlers::kling_webhook))
        .merge(authenticated)
        .layer(middleware::from_fn(assign_request_id))
        .layer(TimeoutLayer::new(timeout))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> Result<()> {
    let address = state.config.bind_address();
    let listener = TcpListener::bind(&address).await?;
    info!("Relay server listening on {}", address);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn request_id(request: &Request) -> String {
    request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default()
}

async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let correlation_id = request_id(&request);
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim().to_string())
        .filter(|t| !t.is_empty());

    let Some(token) = token else {
        return Error::unauthorized("missing access token")
            .into_relay_error(&correlation_id)
            .into_response();
    };

    match state.users.resolve_token(&token).await {
        Ok(Some(identity)) => {
            debug!(request_id = %correlation_id, "Authenticated user {}", identity.user_id);
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Ok(None) => Error::unauthorized("invalid access token")
            .into_relay_error(&correlation_id)
            .into_response(),
        Err(e) => {
            warn!(request_id = %correlation_id, "Token lookup failed: {}", e);
            e.into_relay_error(&correlation_id).into_response()
        }
    }
}

async fn require_admin(request: Request, next: Next) -> Response {
    let is_admin = request
        .extensions()
        .get::<Identity>()
        .map(|identity| identity.is_admin)
        .unwrap_or(false);
    if !is_admin {
        let correlation_id = request_id(&request);
        let mut err = Error::unauthorized("admin access required").into_relay_error(&correlation_id);
        err.status = 403;
        return err.into_response();
    }
    next.run(request).await
}
