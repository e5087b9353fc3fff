use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use lua_relay_completion::{CompletionClient, CompletionError};
use lua_relay_sandbox::{DEFAULT_INSTRUCTION_LIMIT, DEFAULT_MEMORY_LIMIT, DEFAULT_TIMEOUT_MS};
use lua_relay_transcript::WireFormat;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, RawConfig, RelayConfig};
use crate::router::{build_router, AppState};
use crate::telemetry::init_logging;

#[derive(Parser, Debug)]
#[command(name = "lua-relay")]
#[command(about = "WebSocket chat relay that runs model-written Lua in a sandbox", version)]
pub struct Cli {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Bearer token for the completion API.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Root of an OpenAI-compatible API.
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "MODEL")]
    model: Option<String>,

    /// `header-id` (chat completions) or `chat-markup` (raw completions).
    #[arg(long, env = "WIRE_FORMAT", default_value = "header-id")]
    wire_format: WireFormat,

    #[arg(long, env = "SYSTEM_PROMPT_FILE")]
    system_prompt_file: Option<PathBuf>,

    #[arg(long, env = "SCRIPT_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    script_timeout_ms: u64,

    #[arg(long, env = "SCRIPT_INSTRUCTION_LIMIT", default_value_t = DEFAULT_INSTRUCTION_LIMIT)]
    script_instruction_limit: u64,

    #[arg(long, env = "SCRIPT_MEMORY_LIMIT", default_value_t = DEFAULT_MEMORY_LIMIT)]
    script_memory_limit: usize,
}

impl Cli {
    fn into_raw(self) -> RawConfig {
        RawConfig {
            host: self.host,
            port: self.port,
            api_key: self.api_key,
            base_url: self.base_url,
            model: self.model,
            wire_format: self.wire_format,
            system_prompt_file: self.system_prompt_file,
            script_timeout_ms: self.script_timeout_ms,
            script_instruction_limit: self.script_instruction_limit,
            script_memory_limit: self.script_memory_limit,
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("completion client error: {0}")]
    Completion(#[from] CompletionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_lua_relay() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging();
    let config = RelayConfig::from_raw(cli.into_raw())?;
    run_server(config)
}

fn run_server(config: RelayConfig) -> Result<(), CliError> {
    let client = CompletionClient::new(config.completion.clone())?;
    let addr = config.bind_addr();
    info!(
        addr = %addr,
        model = %config.completion.model,
        base_url = %config.completion.base_url,
        wire_format = %config.wire_format,
        "starting lua-relay"
    );
    let router = build_router(AppState::new(&config, Arc::new(client)));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr = %addr, "listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_map_onto_raw_config() {
        let cli = Cli::try_parse_from([
            "lua-relay",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--model",
            "llama3",
            "--wire-format",
            "chat-markup",
            "--script-timeout-ms",
            "250",
        ])
        .expect("parse");
        let raw = cli.into_raw();
        assert_eq!(raw.host, "127.0.0.1");
        assert_eq!(raw.port, 9000);
        assert_eq!(raw.model.as_deref(), Some("llama3"));
        assert_eq!(raw.wire_format, WireFormat::ChatMarkup);
        assert_eq!(raw.script_timeout_ms, 250);
    }

    #[test]
    fn unknown_wire_format_is_rejected() {
        let result = Cli::try_parse_from(["lua-relay", "--wire-format", "xml"]);
        assert!(result.is_err());
    }
}
