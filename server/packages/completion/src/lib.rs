//! Streaming client for OpenAI-compatible completion APIs.
//!
//! Two request shapes are supported: chat completions (`/chat/completions`,
//! role-tagged messages) and raw text completions (`/completions`, a single
//! prompt string). Both are streamed as server-sent events and surfaced as a
//! [`TokenStream`] of [`StreamChunk`]s.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

mod client;
mod sse;

pub use client::{CompletionClient, CompletionConfig};
pub use sse::decode_sse;

/// Incremental model output, ended by the upstream `[DONE]` marker.
pub type TokenStream = BoxStream<'static, Result<StreamChunk, CompletionError>>;

/// Anything that can open a token stream for a prompt.
pub trait CompletionBackend: Send + Sync {
    fn open_stream(&self, prompt: Prompt) -> BoxFuture<'_, Result<TokenStream, CompletionError>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Input for one streamed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Chat {
        messages: Vec<ChatMessage>,
        stop: Vec<String>,
    },
    Text {
        prompt: String,
        stop: Vec<String>,
    },
}

/// Token accounting reported by the upstream API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("SSE stream error: {0}")]
    Stream(String),
    #[error("SSE API error: {0}")]
    Api(String),
    #[error("SSE parsing error: {0}")]
    Decode(String),
}
