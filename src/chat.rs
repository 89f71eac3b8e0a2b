use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::Provider;
use crate::session::{ChatMessage, Role};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const MAX_TURN_TOKENS: u32 = 4096;

/// One typed piece of a multi-part message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { mime: String, data: String },
}

/// What the user sends in one turn: plain text, or an ordered set of typed
/// blocks (text and inline images).
#[derive(Debug, Clone, PartialEq)]
pub enum TurnContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl TurnContent {
    /// Parse untyped content handed over the UI boundary. Unrecognized block
    /// tags fall back to their stringified form rather than being dropped.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => TurnContent::Text(text),
            Value::Array(items) => {
                let blocks = items
                    .into_iter()
                    .map(|item| match serde_json::from_value::<ContentBlock>(item.clone()) {
                        Ok(block) => block,
                        Err(_) => ContentBlock::Text {
                            text: item.to_string(),
                        },
                    })
                    .collect();
                TurnContent::Blocks(blocks)
            }
            other => TurnContent::Text(other.to_string()),
        }
    }

    /// Flatten to plain text (used for history rebuilt from stored
    /// transcripts and for providers fed a text-only turn).
    pub fn as_text(&self) -> String {
        match self {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One prior turn in the linear conversation history.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: TurnContent,
}

/// Stream items delivered while a turn is in flight. `Done` always fires,
/// also after a mid-stream failure, so the consumer never hangs waiting for
/// termination.
#[derive(Debug, PartialEq)]
pub enum StreamEvent {
    Chunk { text: String },
    Done,
}

/// Categorized provider failure, reported separately from the chunk stream.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid or rejected API credentials")]
    InvalidCredentials,
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    Other(String),
}

fn error_for_status(provider: Provider, status: reqwest::StatusCode, body: &str) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::InvalidCredentials,
        429 => ProviderError::RateLimited,
        _ => {
            let snippet: String = body.chars().take(200).collect();
            ProviderError::Other(format!("{provider:?} returned {status}: {snippet}"))
        }
    }
}

fn api_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "assistant",
        _ => "user",
    }
}

// ── Per-provider request shapes ─────────────────────────────────────────

/// Anthropic takes the block list verbatim.
fn anthropic_content(content: &TurnContent) -> Value {
    match content {
        TurnContent::Text(text) => json!(text),
        TurnContent::Blocks(blocks) => {
            let parts: Vec<Value> = blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::Image { mime, data } => json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": mime, "data": data},
                    }),
                })
                .collect();
            json!(parts)
        }
    }
}

fn anthropic_messages(history: &[ChatTurn]) -> Value {
    let messages: Vec<Value> = history
        .iter()
        .map(|turn| {
            json!({
                "role": api_role(turn.role),
                "content": anthropic_content(&turn.content),
            })
        })
        .collect();
    json!(messages)
}

/// OpenAI wants images embedded as data URLs.
fn openai_content(content: &TurnContent) -> Value {
    match content {
        TurnContent::Text(text) => json!(text),
        TurnContent::Blocks(blocks) => {
            let parts: Vec<Value> = blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::Image { mime, data } => json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{mime};base64,{data}")},
                    }),
                })
                .collect();
            json!(parts)
        }
    }
}

fn openai_messages(history: &[ChatTurn]) -> Value {
    let messages: Vec<Value> = history
        .iter()
        .map(|turn| {
            json!({
                "role": api_role(turn.role),
                "content": openai_content(&turn.content),
            })
        })
        .collect();
    json!(messages)
}

/// Gemini wants inline-data parts, and names the assistant role "model".
fn gemini_parts(content: &TurnContent) -> Value {
    match content {
        TurnContent::Text(text) => json!([{"text": text}]),
        TurnContent::Blocks(blocks) => {
            let parts: Vec<Value> = blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({"text": text}),
                    ContentBlock::Image { mime, data } => json!({
                        "inline_data": {"mime_type": mime, "data": data},
                    }),
                })
                .collect();
            json!(parts)
        }
    }
}

fn gemini_contents(history: &[ChatTurn]) -> Value {
    let contents: Vec<Value> = history
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::Assistant => "model",
                _ => "user",
            };
            json!({"role": role, "parts": gemini_parts(&turn.content)})
        })
        .collect();
    json!(contents)
}

// ── Per-provider chunk extraction ───────────────────────────────────────

fn anthropic_chunk(data: &str) -> Option<String> {
    let event: Value = serde_json::from_str(data).ok()?;
    if event.get("type")?.as_str()? != "content_block_delta" {
        return None;
    }
    event
        .get("delta")?
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn openai_chunk(data: &str) -> Option<String> {
    let event: Value = serde_json::from_str(data).ok()?;
    event
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn gemini_chunk(data: &str) -> Option<String> {
    let event: Value = serde_json::from_str(data).ok()?;
    let parts = event
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Collect the `data:` field(s) of one SSE message.
fn extract_sse_data(message: &str) -> Option<String> {
    let mut data_parts = Vec::new();
    for line in message.lines() {
        if let Some(stripped) = line.strip_prefix("data:") {
            data_parts.push(stripped.trim().to_string());
        }
    }
    if data_parts.is_empty() {
        None
    } else {
        Some(data_parts.join("\n"))
    }
}

/// Uniform "send one turn, stream text back" adapter over the three API
/// provider protocols.
///
/// The adapter owns the linear conversation history. A turn is appended
/// before each call; a failed turn appends no assistant entry. There is no
/// mid-stream cancellation: a turn runs to completion or failure.
pub struct ChatClient {
    http: reqwest::Client,
    history: Vec<ChatTurn>,
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    /// Rebuild history from a stored transcript (user/assistant turns only;
    /// error and system entries are presentation, not conversation).
    pub fn load_history(&mut self, messages: &[ChatMessage]) {
        self.history = messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| ChatTurn {
                role: m.role,
                content: TurnContent::Text(m.text.clone()),
            })
            .collect();
    }

    /// Send one turn and stream the reply.
    ///
    /// Chunks are forwarded over `events` as they arrive; `Done` is emitted
    /// unconditionally, also after a failure, so the consumer never hangs.
    /// Returns the full assistant text, or a categorized error. Partial
    /// output already emitted is never retracted here; what the caller does
    /// with it is the caller's decision.
    pub async fn send_turn(
        &mut self,
        provider: Provider,
        model: &str,
        api_key: &str,
        content: TurnContent,
        events: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<String, ProviderError> {
        if provider.is_cli() {
            let _ = events.send(StreamEvent::Done);
            return Err(ProviderError::Other(format!(
                "{provider:?} is a CLI provider, turns go through its PTY"
            )));
        }

        self.history.push(ChatTurn {
            role: Role::User,
            content,
        });

        let result = self.stream_turn(provider, model, api_key, events).await;
        let _ = events.send(StreamEvent::Done);

        match result {
            Ok(text) => {
                self.history.push(ChatTurn {
                    role: Role::Assistant,
                    content: TurnContent::Text(text.clone()),
                });
                Ok(text)
            }
            Err(e) => {
                warn!(?provider, error = %e, "Chat turn failed");
                Err(e)
            }
        }
    }

    async fn stream_turn(
        &self,
        provider: Provider,
        model: &str,
        api_key: &str,
        events: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<String, ProviderError> {
        let request = match provider {
            Provider::Anthropic => self
                .http
                .post(ANTHROPIC_URL)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&json!({
                    "model": model,
                    "max_tokens": MAX_TURN_TOKENS,
                    "stream": true,
                    "messages": anthropic_messages(&self.history),
                })),
            Provider::OpenAi => self
                .http
                .post(OPENAI_URL)
                .bearer_auth(api_key)
                .json(&json!({
                    "model": model,
                    "stream": true,
                    "messages": openai_messages(&self.history),
                })),
            Provider::Gemini => self
                .http
                .post(format!(
                    "{GEMINI_BASE}/{model}:streamGenerateContent?alt=sse&key={api_key}"
                ))
                .json(&json!({
                    "contents": gemini_contents(&self.history),
                })),
            Provider::ClaudeCli | Provider::GeminiCli => {
                return Err(ProviderError::Other("not an API provider".into()))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Other(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(provider, status, &body));
        }

        let parse: fn(&str) -> Option<String> = match provider {
            Provider::Anthropic => anthropic_chunk,
            Provider::OpenAi => openai_chunk,
            Provider::Gemini => gemini_chunk,
            _ => unreachable!(),
        };

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut full_text = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| ProviderError::Other(format!("stream interrupted: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE messages (separated by a blank line).
            while let Some(boundary) = buffer.find("\n\n") {
                let message = buffer[..boundary].to_string();
                buffer = buffer[boundary + 2..].to_string();

                let Some(data) = extract_sse_data(&message) else {
                    continue;
                };
                if data == "[DONE]" {
                    debug!(?provider, "Stream completion marker received");
                    return Ok(full_text);
                }
                if let Some(text) = parse(&data) {
                    full_text.push_str(&text);
                    let _ = events.send(StreamEvent::Chunk { text });
                }
            }
        }

        Ok(full_text)
    }

    /// One-shot low-token probe validating a provider/model/key combination.
    ///
    /// Callers persist the config as active only after this succeeds; a probe
    /// failure must leave the currently-active config untouched.
    pub async fn verify_config(
        &self,
        provider: Provider,
        model: &str,
        api_key: &str,
    ) -> Result<(), ProviderError> {
        let probe: Vec<ChatTurn> = vec![ChatTurn {
            role: Role::User,
            content: TurnContent::Text("hi".into()),
        }];

        let request = match provider {
            Provider::Anthropic => self
                .http
                .post(ANTHROPIC_URL)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&json!({
                    "model": model,
                    "max_tokens": 1,
                    "messages": anthropic_messages(&probe),
                })),
            Provider::OpenAi => self.http.post(OPENAI_URL).bearer_auth(api_key).json(&json!({
                "model": model,
                "max_completion_tokens": 1,
                "messages": openai_messages(&probe),
            })),
            Provider::Gemini => self
                .http
                .post(format!("{GEMINI_BASE}/{model}:generateContent?key={api_key}"))
                .json(&json!({
                    "contents": gemini_contents(&probe),
                    "generationConfig": {"maxOutputTokens": 1},
                })),
            Provider::ClaudeCli | Provider::GeminiCli => {
                // CLI providers have no credentials to validate.
                return Ok(());
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Other(format!("probe failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(error_for_status(provider, status, &body))
        }
    }
}
