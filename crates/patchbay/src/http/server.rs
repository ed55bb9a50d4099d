//! HTTP Router
//!
//! Webhook endpoint for HTTP plugins plus a small read-only status API.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use patchbay_core::{
    Envelope, HubHandle, InboundError, InboundSender, PluginRecord, PluginRegistry, Publish,
    PublishReport, Router as MessageRouter, TransportAddress,
};

/// Source given to webhook messages that carry no usable sender address
const UNKNOWN_SENDER: &str = "http://unknown";

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct ApiState {
    inbound: InboundSender,
    registry: Arc<PluginRegistry>,
    router: MessageRouter,
}

impl ApiState {
    pub fn new(inbound: InboundSender, registry: Arc<PluginRegistry>, router: MessageRouter) -> Self {
        Self {
            inbound,
            registry,
            router,
        }
    }

    pub fn from_hub(handle: &HubHandle) -> Self {
        Self::new(
            handle.inbound(),
            Arc::clone(handle.registry()),
            handle.router().clone(),
        )
    }
}

/// Create the application router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        // Plugins post their messages here
        .route("/webhook", post(webhook))
        .route("/health", get(health_check))
        .route("/api/plugins", get(list_plugins))
        .route("/api/plugins/:name", get(get_plugin))
        .route("/api/messages", post(send_message))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn rejected(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(json!({ "received": false, "error": error.to_string() })),
    )
        .into_response()
}

/// Where a webhook message came from
///
/// Plugins may name their own callback base with `transportUrl`; otherwise
/// the request's `Host` is used.
fn source_address(body: &Value, headers: &HeaderMap) -> Option<TransportAddress> {
    if let Some(url) = body.get("transportUrl").and_then(Value::as_str) {
        return Some(TransportAddress::http(url));
    }
    headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .map(|host| TransportAddress::http(format!("http://{}", host)))
}

async fn webhook(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => return rejected(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)),
    };

    let source = match source_address(&value, &headers) {
        Some(source) => source,
        // Only registration records the sender's address
        None if value.get("type").and_then(Value::as_str) != Some("register") => {
            TransportAddress::http(UNKNOWN_SENDER)
        }
        None => return rejected(StatusCode::BAD_REQUEST, "cannot determine sender address"),
    };

    let envelope = match Envelope::from_value(value, source) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!("Rejected webhook message: {}", e);
            return rejected(StatusCode::BAD_REQUEST, e);
        }
    };

    match state.inbound.try_send(envelope) {
        Ok(()) => Json(json!({ "received": true })).into_response(),
        Err(e @ InboundError::Full) => {
            tracing::warn!("Webhook message dropped: {}", e);
            rejected(StatusCode::SERVICE_UNAVAILABLE, e)
        }
        Err(e @ InboundError::Closed) => rejected(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    plugins: usize,
    connected: usize,
}

async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let stats = state.registry.stats();
    Json(HealthResponse {
        status: "ok",
        service: "orchestrator",
        version: env!("CARGO_PKG_VERSION"),
        plugins: stats.total,
        connected: stats.connected,
    })
}

async fn list_plugins(State(state): State<ApiState>) -> Json<Vec<PluginRecord>> {
    Json(state.registry.list())
}

async fn get_plugin(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.registry.get(&name) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Plugin not found: {}", name) })),
        )
            .into_response(),
    }
}

/// Deliver a message from outside the plugin network
async fn send_message(
    State(state): State<ApiState>,
    Json(message): Json<Publish>,
) -> Json<PublishReport> {
    Json(state.router.publish(&message.targets, &message.body).await)
}
