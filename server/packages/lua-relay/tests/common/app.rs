use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream;
use futures::{FutureExt, StreamExt};
use lua_relay::config::{RawConfig, RelayConfig};
use lua_relay::router::{build_router, AppState};
use lua_relay_completion::{
    CompletionBackend, CompletionError, Prompt, StreamChunk, TokenStream,
};
use lua_relay_transcript::WireFormat;

type Responder = Box<dyn Fn(&Prompt) -> Result<Vec<String>, CompletionError> + Send + Sync>;

/// Completion backend that answers from a closure and records every prompt.
struct ScriptedBackend {
    respond: Responder,
    token_delay: Duration,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedBackend {
    fn new(
        respond: impl Fn(&Prompt) -> Result<Vec<String>, CompletionError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::with_delay(Duration::ZERO, respond)
    }

    fn with_delay(
        token_delay: Duration,
        respond: impl Fn(&Prompt) -> Result<Vec<String>, CompletionError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            token_delay,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }
}

impl CompletionBackend for ScriptedBackend {
    fn open_stream(&self, prompt: Prompt) -> BoxFuture<'_, Result<TokenStream, CompletionError>> {
        let reply = (self.respond)(&prompt);
        self.prompts.lock().unwrap().push(prompt);
        let delay = self.token_delay;
        async move {
            let tokens = reply?;
            let stream = stream::iter(tokens).then(move |text| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(StreamChunk { text, usage: None })
            });
            Ok(stream.boxed())
        }
        .boxed()
    }
}

/// Content of the last message in a chat prompt, or the whole prompt text.
fn last_message(prompt: &Prompt) -> String {
    match prompt {
        Prompt::Chat { messages, .. } => messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default(),
        Prompt::Text { prompt, .. } => prompt.clone(),
    }
}

fn test_config(wire_format: WireFormat) -> RelayConfig {
    RelayConfig::from_raw(RawConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        model: Some("test-model".to_string()),
        wire_format,
        script_timeout_ms: 2_000,
        script_instruction_limit: 10_000_000,
        script_memory_limit: 64 * 1024 * 1024,
        ..RawConfig::default()
    })
    .expect("test config")
}

fn test_router(backend: Arc<ScriptedBackend>) -> axum::Router {
    build_router(AppState::new(&test_config(WireFormat::HeaderId), backend))
}

/// Serves the relay on an ephemeral port and returns the `/chat` URL.
async fn spawn_relay(wire_format: WireFormat, backend: Arc<ScriptedBackend>) -> String {
    let app = build_router(AppState::new(&test_config(wire_format), backend));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve relay");
    });
    format!("ws://{addr}/chat")
}
