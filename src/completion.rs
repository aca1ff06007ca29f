//! Streaming client for OpenAI-compatible chat completions.
//!
//! [`stream_chat`] POSTs `{base_url}/chat/completions` with `stream: true`
//! and feeds each content delta to the caller. The callback returning
//! `false` aborts the upstream request, which is how a disconnected client
//! cancels generation. SSE framing is handled by [`DeltaParser`] so the
//! wire protocol can be tested without a network.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::CompletionConfig;
use crate::error::{ChatError, Result};

/// One message in the completion request, OpenAI wire shape.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// How a completion stream ended.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The model finished the response.
    Done,
    /// The caller's callback requested cancellation.
    Cancelled,
}

/// Backend that streams a chat completion. The chat turn driver talks to
/// this trait rather than the HTTP client directly, so turns can run
/// against a scripted stream in tests.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Stream one completion, invoking `on_delta` for every content
    /// fragment in arrival order. The callback returning `false` cancels
    /// generation. Returns the accumulated text and how the stream ended.
    async fn stream_chat(
        &self,
        config: &CompletionConfig,
        messages: &[ChatMessage],
        on_delta: &mut (dyn for<'a> FnMut(&'a str) -> bool + Send),
    ) -> Result<(String, StreamEnd)>;
}

/// [`CompletionClient`] backed by the OpenAI-compatible HTTP endpoint.
pub struct OpenAICompletionClient;

#[async_trait]
impl CompletionClient for OpenAICompletionClient {
    async fn stream_chat(
        &self,
        config: &CompletionConfig,
        messages: &[ChatMessage],
        on_delta: &mut (dyn for<'a> FnMut(&'a str) -> bool + Send),
    ) -> Result<(String, StreamEnd)> {
        stream_chat(config, messages, on_delta).await
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// A parsed event from the SSE stream.
#[derive(Debug, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Finished,
}

/// Incremental parser for the `data: ` line protocol of streaming chat
/// completions. Bytes may arrive split at arbitrary boundaries; lines are
/// only interpreted once the newline lands.
#[derive(Default)]
pub struct DeltaParser {
    buffer: String,
}

impl DeltaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes, returning any complete events.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim().to_string();
            self.buffer.drain(..=pos);

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };

            if data == "[DONE]" {
                events.push(StreamEvent::Finished);
                continue;
            }

            if let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) {
                if let Some(choice) = parsed.choices.first() {
                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty() {
                            events.push(StreamEvent::Delta(content.clone()));
                        }
                    }
                    if choice.finish_reason.is_some() {
                        events.push(StreamEvent::Finished);
                    }
                }
            }
        }

        events
    }
}

/// Stream a chat completion, invoking `on_delta` for every content
/// fragment in arrival order. Returns the full accumulated text along
/// with how the stream ended.
pub async fn stream_chat(
    config: &CompletionConfig,
    messages: &[ChatMessage],
    on_delta: &mut (dyn FnMut(&str) -> bool + Send),
) -> Result<(String, StreamEnd)> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| ChatError::Internal(anyhow!("OPENAI_API_KEY not set")))?;

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .read_timeout(Duration::from_secs(config.read_timeout_secs))
        .build()
        .map_err(|e| ChatError::Internal(e.into()))?;

    let body = CompletionRequest {
        model: &config.model,
        messages,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        stream: true,
    };

    let url = format!(
        "{}/chat/completions",
        config.base_url.trim_end_matches('/')
    );
    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| ChatError::upstream(e))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(ChatError::upstream(anyhow!(
            "completions API error {}: {}",
            status,
            text
        )));
    }

    let mut full = String::new();
    let mut parser = DeltaParser::new();
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ChatError::upstream(e))?;
        for event in parser.push(&chunk) {
            match event {
                StreamEvent::Delta(delta) => {
                    full.push_str(&delta);
                    if !on_delta(&delta) {
                        // Dropping the stream aborts the HTTP request
                        return Ok((full, StreamEnd::Cancelled));
                    }
                }
                StreamEvent::Finished => return Ok((full, StreamEnd::Done)),
            }
        }
    }

    // Upstream closed without [DONE]; treat what arrived as complete
    Ok((full, StreamEnd::Done))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_json(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}},\"finish_reason\":null}}]}}\n"
        )
    }

    #[test]
    fn parses_deltas_in_order() {
        let mut parser = DeltaParser::new();
        let mut input = delta_json("Hello");
        input.push_str(&delta_json(" world"));
        input.push_str("data: [DONE]\n");

        let events = parser.push(input.as_bytes());
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Hello".to_string()),
                StreamEvent::Delta(" world".to_string()),
                StreamEvent::Finished,
            ]
        );
    }

    #[test]
    fn handles_chunks_split_mid_line() {
        let mut parser = DeltaParser::new();
        let line = delta_json("split");
        let (a, b) = line.split_at(line.len() / 2);

        assert!(parser.push(a.as_bytes()).is_empty());
        let events = parser.push(b.as_bytes());
        assert_eq!(events, vec![StreamEvent::Delta("split".to_string())]);
    }

    #[test]
    fn finish_reason_terminates_stream() {
        let mut parser = DeltaParser::new();
        let input = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n";
        let events = parser.push(input.as_bytes());
        assert_eq!(events, vec![StreamEvent::Finished]);
    }

    #[test]
    fn ignores_non_data_lines_and_keepalives() {
        let mut parser = DeltaParser::new();
        let events = parser.push(b": keepalive\n\nevent: ping\n");
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_json_is_skipped() {
        let mut parser = DeltaParser::new();
        let mut input = String::from("data: {not json}\n");
        input.push_str(&delta_json("ok"));
        let events = parser.push(input.as_bytes());
        assert_eq!(events, vec![StreamEvent::Delta("ok".to_string())]);
    }

    #[test]
    fn empty_content_deltas_are_dropped() {
        let mut parser = DeltaParser::new();
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"\"},\"finish_reason\":null}]}\n";
        assert!(parser.push(input.as_bytes()).is_empty());
    }
}
