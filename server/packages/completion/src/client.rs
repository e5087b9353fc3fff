use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::{decode_sse, ChatMessage, CompletionBackend, CompletionError, Prompt, TokenStream};

const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionConfig {
    /// Sent as a bearer token when present.
    pub api_key: Option<String>,
    /// API root, e.g. `https://api.deepinfra.com/v1/openai`.
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TextCompletionRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

/// HTTP client for an OpenAI-compatible API. Stateless apart from its
/// connection pool, so one instance is shared by every connection.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    http: Client,
    config: CompletionConfig,
}

impl CompletionClient {
    pub fn new(config: CompletionConfig) -> Result<Self, CompletionError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Sends `prompt` and returns the token stream once the upstream accepted it.
    pub async fn stream(&self, prompt: Prompt) -> Result<TokenStream, CompletionError> {
        let model = self.config.model.clone();
        let request = match prompt {
            Prompt::Chat { messages, stop } => self
                .http
                .post(self.url("chat/completions"))
                .json(&ChatCompletionRequest {
                    model,
                    messages,
                    stream: true,
                    stop,
                }),
            Prompt::Text { prompt, stop } => self
                .http
                .post(self.url("completions"))
                .json(&TextCompletionRequest {
                    model,
                    prompt,
                    stream: true,
                    stop,
                }),
        };
        let request = match &self.config.api_key {
            Some(api_key) => request.bearer_auth(api_key),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status { status, body });
        }
        debug!(status = %status, model = %self.config.model, "completion stream opened");

        Ok(decode_sse(response.bytes_stream()))
    }
}

impl CompletionBackend for CompletionClient {
    fn open_stream(&self, prompt: Prompt) -> BoxFuture<'_, Result<TokenStream, CompletionError>> {
        self.stream(prompt).boxed()
    }
}
