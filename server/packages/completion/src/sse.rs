use std::fmt;

use eventsource_stream::Eventsource;
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use crate::{CompletionError, StreamChunk, TokenStream, Usage};

const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChoicePayload>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChoicePayload {
    /// Chat completions.
    #[serde(default)]
    delta: Option<DeltaPayload>,
    /// Raw text completions.
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaPayload {
    #[serde(default)]
    content: Option<String>,
}

/// Turns an SSE byte stream into a [`TokenStream`].
///
/// The stream ends at `[DONE]` or when the body ends. The first transport,
/// decode or API error is yielded once and ends the stream.
pub fn decode_sse<S, B, E>(bytes: S) -> TokenStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let events = Box::pin(bytes.eventsource());
    stream::unfold(Some(events), |state| async move {
        let mut events = state?;
        loop {
            let event = match events.next().await {
                None => return None,
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    return Some((Err(CompletionError::Stream(err.to_string())), None));
                }
            };

            trace!(data = %event.data, "completion SSE");
            let data = event.data.trim();
            if data == DONE_MARKER {
                return None;
            }
            if data.is_empty() {
                continue;
            }

            match parse_chunk(data) {
                Ok(Some(chunk)) => return Some((Ok(chunk), Some(events))),
                Ok(None) => continue,
                Err(err) => return Some((Err(err), None)),
            }
        }
    })
    .boxed()
}

/// Parses one event payload; `None` for keepalive chunks with neither text nor usage.
fn parse_chunk(data: &str) -> Result<Option<StreamChunk>, CompletionError> {
    let payload: ChunkPayload = serde_json::from_str(data)
        .map_err(|err| CompletionError::Decode(format!("{err}, data: {data}")))?;

    if let Some(error) = payload.error.as_ref().filter(|error| !error.is_null()) {
        return Err(CompletionError::Api(api_error_message(error)));
    }

    let text = payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| {
            choice
                .delta
                .and_then(|delta| delta.content)
                .or(choice.text)
        })
        .unwrap_or_default();

    if text.is_empty() && payload.usage.is_none() {
        return Ok(None);
    }
    Ok(Some(StreamChunk {
        text,
        usage: payload.usage,
    }))
}

fn api_error_message(error: &Value) -> String {
    if let Some(message) = error.get("message").and_then(Value::as_str) {
        return message.to_string();
    }
    if let Some(message) = error.as_str() {
        return message.to_string();
    }
    "An error occurred during streaming".to_string()
}
