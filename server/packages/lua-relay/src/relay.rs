//! Per-connection chat relay.
//!
//! Each WebSocket runs one [`ChatRelay`] loop: read a user message, echo the
//! encoded transcript, stream the model's continuation token by token, run the
//! first Lua block it wrote in a fresh sandbox, append the result as a tool turn
//! and hand the floor back to the user. Requests on one connection are strictly
//! sequential.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use lua_relay_completion::{ChatMessage, CompletionBackend, Prompt, Usage};
use lua_relay_sandbox::{ExecutionResult, Sandbox};
use lua_relay_transcript::{Role, Transcript, Turn, WireFormat};
use tracing::{debug, error, info, warn};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Prefix for inline errors shown inside a tool turn.
pub const ERROR_PREFIX: &str = "Got error: ";

/// Chat APIs reserve the `tool` role for function calls, so tool turns travel as
/// assistant messages carrying this prefix.
pub const TOOL_PREFIX: &str = "tool:\n";

/// Stop sequences for raw completions; the second one swallows the closing
/// fence, which the relay then appends itself.
const MARKUP_STOP_SEQUENCES: [&str; 2] = ["<|im_end|>", "\n```\n"];

/// Close frame reasons are limited to 123 bytes by the WebSocket protocol.
const MAX_CLOSE_REASON: usize = 123;

pub fn next_connection_id() -> u64 {
    CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Read-only settings shared by every connection.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub wire_format: WireFormat,
    pub system_prompt: String,
    pub sandbox: Sandbox,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to open completion stream: {0}")]
    StreamOpen(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    AwaitingUserInput,
    Streaming,
    ExecutingScript,
    EmittingToolTurn,
    Closed,
}

impl RelayState {
    fn as_str(&self) -> &'static str {
        match self {
            RelayState::AwaitingUserInput => "awaiting_user_input",
            RelayState::Streaming => "streaming",
            RelayState::ExecutingScript => "executing_script",
            RelayState::EmittingToolTurn => "emitting_tool_turn",
            RelayState::Closed => "closed",
        }
    }
}

/// Replies mirror the frame type of the last client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Text,
    Binary,
}

pub struct ChatRelay<S, R> {
    settings: RelaySettings,
    backend: Arc<dyn CompletionBackend>,
    sender: S,
    receiver: R,
    frame_kind: FrameKind,
    state: RelayState,
    usage: Usage,
}

impl<S, R, E> ChatRelay<S, R>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    pub fn new(
        settings: RelaySettings,
        backend: Arc<dyn CompletionBackend>,
        sender: S,
        receiver: R,
    ) -> Self {
        Self {
            settings,
            backend,
            sender,
            receiver,
            frame_kind: FrameKind::Text,
            state: RelayState::AwaitingUserInput,
            usage: Usage::default(),
        }
    }

    /// Serves the connection until the client leaves or the transport fails.
    ///
    /// Returns the token usage accumulated over the connection.
    pub async fn run(mut self) -> Result<Usage, RelayError> {
        let result = self.serve().await;
        self.transition(RelayState::Closed);
        result.map(|()| self.usage)
    }

    async fn serve(&mut self) -> Result<(), RelayError> {
        loop {
            self.transition(RelayState::AwaitingUserInput);
            let Some(message) = self.next_message().await? else {
                return Ok(());
            };
            self.handle_message(&message).await?;
        }
    }

    async fn handle_message(&mut self, raw: &str) -> Result<(), RelayError> {
        let format = self.settings.wire_format;
        let transcript = match format.decode_or_start(raw, &self.settings.system_prompt) {
            Ok(transcript) => transcript,
            Err(err) => {
                warn!(error = %err, "rejected client message");
                self.emit_tool_turn(ExecutionResult::Error(err.to_string()))
                    .await?;
                return self.emit_user_marker().await;
            }
        };

        let blob = format.encode(&transcript);
        self.send(blob.clone()).await?;
        debug!(
            turns = transcript.turns().len(),
            last_role = %transcript.last().role,
            "prompt built"
        );

        self.transition(RelayState::Streaming);
        let prompt = build_prompt(format, &transcript, blob);
        let mut tokens = match self.backend.open_stream(prompt).await {
            Ok(tokens) => tokens,
            Err(err) => {
                error!(error = %err, "completion stream failed to open");
                self.close_with_error(&err.to_string()).await;
                return Err(RelayError::StreamOpen(err.to_string()));
            }
        };

        let mut reply = String::new();
        let mut reported = None;
        let mut completed = true;
        while let Some(item) = tokens.next().await {
            match item {
                Ok(chunk) => {
                    if chunk.usage.is_some() {
                        reported = chunk.usage;
                    }
                    if chunk.text.is_empty() {
                        continue;
                    }
                    reply.push_str(&chunk.text);
                    self.send(chunk.text).await?;
                }
                Err(err) => {
                    warn!(error = %err, "completion stream failed");
                    completed = false;
                    break;
                }
            }
        }
        drop(tokens);
        self.record_usage(reported);

        if completed {
            let syntax = format.script_syntax();
            if let Some(suffix) = syntax.dangling_suffix(&reply) {
                reply.push_str(&suffix);
                self.send(suffix).await?;
            }
            if let Some(block) = syntax.extract(&reply) {
                self.transition(RelayState::ExecutingScript);
                let result = self.settings.sandbox.execute(block.raw_code()).await;
                let result = screen_output(format, result);
                self.emit_tool_turn(result).await?;
            }
        }

        self.emit_user_marker().await
    }

    async fn next_message(&mut self) -> Result<Option<String>, RelayError> {
        while let Some(message) = self.receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    self.frame_kind = FrameKind::Text;
                    return Ok(Some(text));
                }
                Ok(Message::Binary(data)) => {
                    self.frame_kind = FrameKind::Binary;
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
                }
                Ok(Message::Close(_)) => return Ok(None),
                // Ping/pong
                Ok(_) => continue,
                Err(err) => return Err(RelayError::Transport(err.to_string())),
            }
        }
        Ok(None)
    }

    async fn emit_tool_turn(&mut self, result: ExecutionResult) -> Result<(), RelayError> {
        self.transition(RelayState::EmittingToolTurn);
        let mut frame = self.settings.wire_format.turn_header(Role::Tool);
        match result {
            ExecutionResult::Output(output) => frame.push_str(&output),
            ExecutionResult::Error(err) => {
                frame.push_str(ERROR_PREFIX);
                frame.push_str(&err);
            }
        }
        self.send(frame).await
    }

    async fn emit_user_marker(&mut self) -> Result<(), RelayError> {
        let marker = self.settings.wire_format.turn_header(Role::User);
        self.send(marker).await
    }

    async fn send(&mut self, text: String) -> Result<(), RelayError> {
        let message = match self.frame_kind {
            FrameKind::Text => Message::Text(text),
            FrameKind::Binary => Message::Binary(text.into_bytes()),
        };
        self.sender
            .send(message)
            .await
            .map_err(|err| RelayError::Transport(err.to_string()))
    }

    async fn close_with_error(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: close_code::ERROR,
            reason: Cow::Owned(truncate_at_boundary(reason, MAX_CLOSE_REASON).to_string()),
        };
        if let Err(err) = self.sender.send(Message::Close(Some(frame))).await {
            debug!(error = %err, "failed to send close frame");
        }
    }

    fn record_usage(&mut self, reported: Option<Usage>) {
        let Some(usage) = reported else {
            return;
        };
        self.usage.add(&usage);
        info!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = self.usage.total_tokens,
            "token usage"
        );
    }

    fn transition(&mut self, next: RelayState) {
        if self.state != next {
            debug!(from = self.state.as_str(), to = next.as_str(), "relay state");
            self.state = next;
        }
    }
}

/// Builds the upstream request for `transcript`; `blob` is its encoding.
pub fn build_prompt(format: WireFormat, transcript: &Transcript, blob: String) -> Prompt {
    match format {
        WireFormat::HeaderId => Prompt::Chat {
            messages: transcript.turns().iter().map(chat_message).collect(),
            stop: Vec::new(),
        },
        WireFormat::ChatMarkup => Prompt::Text {
            prompt: blob,
            stop: MARKUP_STOP_SEQUENCES
                .iter()
                .map(|sequence| sequence.to_string())
                .collect(),
        },
    }
}

fn chat_message(turn: &Turn) -> ChatMessage {
    match turn.role {
        Role::Tool => ChatMessage::new(
            Role::Assistant.as_str(),
            format!("{TOOL_PREFIX}{}", turn.content),
        ),
        role => ChatMessage::new(role.as_str(), turn.content.clone()),
    }
}

/// Script output may not contain wire markers; it is echoed back inside the next
/// transcript.
fn screen_output(format: WireFormat, result: ExecutionResult) -> ExecutionResult {
    match result {
        ExecutionResult::Output(output) => match format.check_content(&output) {
            Ok(()) => ExecutionResult::Output(output),
            Err(err) => ExecutionResult::Error(format!("script output rejected: {err}")),
        },
        error => error,
    }
}

fn truncate_at_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}
