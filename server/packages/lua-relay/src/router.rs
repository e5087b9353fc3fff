use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use lua_relay_completion::CompletionBackend;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument, Span};

use crate::config::RelayConfig;
use crate::relay::{next_connection_id, ChatRelay, RelaySettings};
use crate::ui;

/// Largest client message accepted on `/chat`; full transcripts are resent every turn.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    settings: RelaySettings,
    backend: Arc<dyn CompletionBackend>,
}

impl AppState {
    pub fn new(config: &RelayConfig, backend: Arc<dyn CompletionBackend>) -> Self {
        let settings = config.relay_settings();
        Self { settings, backend }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
}

/// RFC 9457 problem details body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            type_: "about:blank".to_string(),
            title: status
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
            status: status.as_u16(),
            detail: Some(detail.into()),
            instance: None,
        }
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(self),
        )
            .into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/chat", get(chat_ws))
        .with_state(shared.clone())
        .merge(ui::router())
        .fallback(not_found);

    let http_logging = match std::env::var("LUA_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn not_found(uri: Uri) -> ProblemDetails {
    let mut problem = ProblemDetails::new(
        StatusCode::NOT_FOUND,
        "available endpoints: GET / (browser client), GET /health, GET /chat (websocket)",
    );
    problem.instance = Some(uri.path().to_string());
    problem
}

async fn chat_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_chat_socket(socket, state))
}

async fn handle_chat_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = next_connection_id();
    let span = tracing::info_span!("chat.connection", connection_id);
    async move {
        info!(wire_format = %state.settings.wire_format, "chat connection opened");
        let (sender, receiver) = socket.split();
        let relay = ChatRelay::new(
            state.settings.clone(),
            Arc::clone(&state.backend),
            sender,
            receiver,
        );
        match relay.run().await {
            Ok(usage) => info!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "chat connection closed"
            ),
            Err(err) => warn!(error = %err, "chat connection ended"),
        }
    }
    .instrument(span)
    .await
}
