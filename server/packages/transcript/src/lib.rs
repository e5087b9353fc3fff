//! Conversation transcripts and their plain-text wire encodings.
//!
//! A [`Transcript`] is an ordered list of role-tagged [`Turn`]s. The remote model
//! consumes it as a single "wire blob" where roles and turn boundaries are marked
//! with literal sentinel tokens. Two encodings are supported, selected with
//! [`WireFormat`]:
//!
//! - `header-id` - `<|begin_of_text|>`, `<|start_header_id|>role<|end_header_id|>`, `<|eot_id|>`
//! - `chat-markup` - `<|im_start|>role`, `<|im_end|>`
//!
//! Decoding is permissive (malformed fragments are skipped), encoding is canonical
//! and always ends with an open assistant header so the model continues as the
//! assistant.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod chat_markup;
mod header_id;
mod script;

pub use script::{ScriptBlock, ScriptSyntax, LUA_FENCE, LUA_TAGS};

/// Speaker of a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TranscriptError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(TranscriptError::UnknownRole(other.to_string())),
        }
    }
}

/// One role-attributed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }
}

/// Non-empty, ordered conversation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new(turns: Vec<Turn>) -> Result<Self, TranscriptError> {
        if turns.is_empty() {
            return Err(TranscriptError::Empty);
        }
        Ok(Self { turns })
    }

    /// Starts a conversation: the system instruction followed by the first user message.
    pub fn fresh(system_prompt: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(system_prompt), Turn::user(message)],
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> &Turn {
        // Non-empty by construction.
        &self.turns[self.turns.len() - 1]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript contains no decodable turns")]
    Empty,
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("unknown wire format: {0}")]
    UnknownWireFormat(String),
    #[error("text contains the reserved marker {marker}")]
    ReservedMarker { marker: &'static str },
}

/// Selects the sentinel vocabulary used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    /// Llama-3 style header ids, served through a chat-completions API.
    #[default]
    HeaderId,
    /// ChatML style markup, served through a raw text-completions API.
    ChatMarkup,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::HeaderId => "header-id",
            WireFormat::ChatMarkup => "chat-markup",
        }
    }

    /// Every literal marker this format reserves.
    pub fn sentinels(&self) -> &'static [&'static str] {
        match self {
            WireFormat::HeaderId => &header_id::SENTINELS,
            WireFormat::ChatMarkup => &chat_markup::SENTINELS,
        }
    }

    /// Whether `raw` is a full transcript resent by the client rather than a bare message.
    pub fn is_transcript(&self, raw: &str) -> bool {
        match self {
            WireFormat::HeaderId => header_id::is_transcript(raw),
            WireFormat::ChatMarkup => chat_markup::is_transcript(raw),
        }
    }

    /// Decodes a full wire blob, skipping fragments without a recognizable role
    /// header or with empty content.
    pub fn decode(&self, blob: &str) -> Result<Transcript, TranscriptError> {
        let turns = match self {
            WireFormat::HeaderId => header_id::decode(blob),
            WireFormat::ChatMarkup => chat_markup::decode(blob),
        };
        Transcript::new(turns)
    }

    /// Decodes `raw` when it is a full transcript, otherwise starts a fresh
    /// conversation with `raw` as the first user message.
    ///
    /// Bare messages that contain a reserved marker are rejected; accepting them
    /// would desynchronise the next round trip.
    pub fn decode_or_start(
        &self,
        raw: &str,
        system_prompt: &str,
    ) -> Result<Transcript, TranscriptError> {
        if self.is_transcript(raw) {
            return self.decode(raw);
        }
        self.check_content(raw)?;
        Ok(Transcript::fresh(system_prompt, raw))
    }

    /// Encodes `transcript`, ending with an open assistant header.
    pub fn encode(&self, transcript: &Transcript) -> String {
        match self {
            WireFormat::HeaderId => header_id::encode(transcript.turns()),
            WireFormat::ChatMarkup => chat_markup::encode(transcript.turns()),
        }
    }

    /// Text that ends the current turn and opens a turn for `role`.
    pub fn turn_header(&self, role: Role) -> String {
        match self {
            WireFormat::HeaderId => header_id::turn_header(role),
            WireFormat::ChatMarkup => chat_markup::turn_header(role),
        }
    }

    /// Delimiters the model is asked to wrap Lua code in.
    pub fn script_syntax(&self) -> ScriptSyntax {
        match self {
            WireFormat::HeaderId => LUA_TAGS,
            WireFormat::ChatMarkup => LUA_FENCE,
        }
    }

    pub fn find_sentinel(&self, text: &str) -> Option<&'static str> {
        self.sentinels()
            .iter()
            .copied()
            .find(|sentinel| text.contains(sentinel))
    }

    pub fn check_content(&self, text: &str) -> Result<(), TranscriptError> {
        match self.find_sentinel(text) {
            Some(marker) => Err(TranscriptError::ReservedMarker { marker }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = TranscriptError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "header-id" | "llama3" => Ok(WireFormat::HeaderId),
            "chat-markup" | "chatml" => Ok(WireFormat::ChatMarkup),
            other => Err(TranscriptError::UnknownWireFormat(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMATS: [WireFormat; 2] = [WireFormat::HeaderId, WireFormat::ChatMarkup];

    fn conversation() -> Transcript {
        Transcript::new(vec![
            Turn::system("Be concise."),
            Turn::user("What is 8+8?"),
            Turn::assistant("<lua>\nprint(8+8)\n</lua>"),
            Turn::tool("16"),
            Turn::user("And 2*3?"),
        ])
        .expect("non-empty transcript")
    }

    #[test]
    fn round_trip_for_every_format() {
        for format in FORMATS {
            let transcript = conversation();
            let blob = format.encode(&transcript);
            let decoded = format.decode(&blob).expect("decode");
            assert_eq!(decoded, transcript, "{format}");
        }
    }

    #[test]
    fn round_trip_single_turn() {
        for format in FORMATS {
            let transcript = Transcript::new(vec![Turn::user("hi")]).unwrap();
            let decoded = format.decode(&format.encode(&transcript)).unwrap();
            assert_eq!(decoded, transcript, "{format}");
        }
    }

    #[test]
    fn decode_or_start_builds_fresh_conversation() {
        for format in FORMATS {
            let transcript = format
                .decode_or_start("What is 8+8?", "system prompt")
                .expect("fresh");
            assert_eq!(
                transcript.turns(),
                &[Turn::system("system prompt"), Turn::user("What is 8+8?")]
            );
        }
    }

    #[test]
    fn decode_or_start_reuses_resent_transcript() {
        for format in FORMATS {
            let mut blob = format.encode(&conversation());
            blob.push_str("Sure: <lua>print(6)</lua>");
            blob.push_str(&format.turn_header(Role::Tool));
            blob.push_str("6");
            blob.push_str(&format.turn_header(Role::User));
            blob.push_str("thanks");

            let transcript = format.decode_or_start(&blob, "ignored").unwrap();
            let turns = transcript.turns();
            assert_eq!(turns.len(), 8, "{format}");
            assert_eq!(turns[5], Turn::assistant("Sure: <lua>print(6)</lua>"));
            assert_eq!(turns[6], Turn::tool("6"));
            assert_eq!(transcript.last(), &Turn::user("thanks"));
        }
    }

    #[test]
    fn bare_message_with_reserved_marker_is_rejected() {
        let err = WireFormat::HeaderId
            .decode_or_start("hello <|eot_id|> there", "sys")
            .unwrap_err();
        assert_eq!(err, TranscriptError::ReservedMarker { marker: "<|eot_id|>" });

        let err = WireFormat::ChatMarkup
            .decode_or_start("hello <|im_end|>", "sys")
            .unwrap_err();
        assert_eq!(err, TranscriptError::ReservedMarker { marker: "<|im_end|>" });
    }

    #[test]
    fn markers_of_the_other_format_are_plain_text() {
        let transcript = WireFormat::ChatMarkup
            .decode_or_start("what does <|eot_id|> mean?", "sys")
            .unwrap();
        assert_eq!(transcript.last().content, "what does <|eot_id|> mean?");
    }

    #[test]
    fn transcript_of_only_malformed_fragments_is_empty() {
        let err = WireFormat::HeaderId
            .decode("<|begin_of_text|>garbage<|eot_id|>more garbage")
            .unwrap_err();
        assert_eq!(err, TranscriptError::Empty);
        assert_eq!(Transcript::new(Vec::new()).unwrap_err(), TranscriptError::Empty);
    }

    #[test]
    fn wire_format_parses_names_and_aliases() {
        assert_eq!("header-id".parse::<WireFormat>().unwrap(), WireFormat::HeaderId);
        assert_eq!("LLAMA3".parse::<WireFormat>().unwrap(), WireFormat::HeaderId);
        assert_eq!("chatml".parse::<WireFormat>().unwrap(), WireFormat::ChatMarkup);
        assert!(matches!(
            "xml".parse::<WireFormat>(),
            Err(TranscriptError::UnknownWireFormat(name)) if name == "xml"
        ));
    }

    #[test]
    fn role_serialization() {
        let json = serde_json::to_string(&Turn::tool("16")).unwrap();
        assert_eq!(json, r#"{"role":"tool","content":"16"}"#);
        assert!("ipython".parse::<Role>().is_err());
    }
}
