use std::path::PathBuf;
use std::time::Duration;

use lua_relay_completion::CompletionConfig;
use lua_relay_sandbox::{Sandbox, SandboxLimits};
use lua_relay_transcript::WireFormat;
use thiserror::Error;
use url::Url;

use crate::relay::RelaySettings;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const HEADER_ID_PROMPT: &str = "\
If you are doing math, use a lua sandbox, which can be accessed by writing lua code in between \
two lua XML blocks. The code will directly be loaded into a lua sandbox. Here is an example of \
running a math problem in a sandbox:
user: What is 8+8?
assistant: <lua>
print(8+8)
</lua>
tool: 16
Only use Lua when performing calculations. When using lua, make sure to enclose the lua with lua \
XML. For non-mathematical queries, respond normally without Lua code. Always be concise.";

const CHAT_MARKUP_PROMPT: &str = "\
If you are doing math, use a lua sandbox, which can be accessed by writing lua code in a fenced \
```lua code block. The code will directly be loaded into a lua sandbox. Here is an example of \
running a math problem in a sandbox:
user: What is 8+8?
assistant: ```lua
print(8+8)
```
tool: 16
Only use Lua when performing calculations. When using lua, make sure to enclose the lua in a \
```lua fence. For non-mathematical queries, respond normally without Lua code. Always be concise.";

/// System prompt used when no prompt file is configured.
pub fn default_system_prompt(format: WireFormat) -> &'static str {
    match format {
        WireFormat::HeaderId => HEADER_ID_PROMPT,
        WireFormat::ChatMarkup => CHAT_MARKUP_PROMPT,
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing model: pass --model or set MODEL")]
    MissingModel,
    #[error("invalid base url {url}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported base url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("failed to read system prompt {}: {source}", .path.display())]
    SystemPrompt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("system prompt {} contains the reserved marker {marker}", .path.display())]
    ReservedMarker { path: PathBuf, marker: &'static str },
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

/// Unvalidated settings as they come from flags and the environment.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub wire_format: WireFormat,
    pub system_prompt_file: Option<PathBuf>,
    pub script_timeout_ms: u64,
    pub script_instruction_limit: u64,
    pub script_memory_limit: usize,
}

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub completion: CompletionConfig,
    pub wire_format: WireFormat,
    pub system_prompt: String,
    pub limits: SandboxLimits,
}

impl RelayConfig {
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let model = non_empty(raw.model).ok_or(ConfigError::MissingModel)?;
        let base_url = validate_base_url(
            non_empty(raw.base_url)
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL),
        )?;

        let system_prompt = match raw.system_prompt_file {
            Some(path) => {
                let prompt = std::fs::read_to_string(&path).map_err(|source| {
                    ConfigError::SystemPrompt {
                        path: path.clone(),
                        source,
                    }
                })?;
                if let Some(marker) = raw.wire_format.find_sentinel(&prompt) {
                    return Err(ConfigError::ReservedMarker { path, marker });
                }
                prompt.trim().to_string()
            }
            None => default_system_prompt(raw.wire_format).to_string(),
        };

        if raw.script_timeout_ms == 0 {
            return Err(ConfigError::ZeroLimit("script timeout"));
        }
        if raw.script_instruction_limit == 0 {
            return Err(ConfigError::ZeroLimit("script instruction limit"));
        }
        if raw.script_memory_limit == 0 {
            return Err(ConfigError::ZeroLimit("script memory limit"));
        }
        let limits = SandboxLimits {
            timeout: Duration::from_millis(raw.script_timeout_ms),
            instruction_limit: raw.script_instruction_limit,
            memory_limit: raw.script_memory_limit,
            ..SandboxLimits::default()
        };

        Ok(Self {
            host: raw.host,
            port: raw.port,
            completion: CompletionConfig {
                api_key: non_empty(raw.api_key),
                base_url,
                model,
            },
            wire_format: raw.wire_format,
            system_prompt,
            limits,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            wire_format: self.wire_format,
            system_prompt: self.system_prompt.clone(),
            sandbox: Sandbox::new(self.limits),
        }
    }
}

/// Empty values count as unset, matching an exported-but-blank env var.
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn validate_base_url(raw: &str) -> Result<String, ConfigError> {
    let url = Url::parse(raw).map_err(|source| ConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        source,
    })?;
    match url.scheme() {
        "http" | "https" => Ok(raw.trim_end_matches('/').to_string()),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}
