//! Completion dispatch: system directive injection, one streaming provider
//! call with an ordered fallback model list, and the upstream SSE body turned
//! into a lazy stream of [`StreamChunk`]s.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{RelayError, Result};
use crate::message::{ChatMessage, Role};
use crate::providers::{CompletionRequest, StreamChunk};

/// Lazy, pull-based sequence of upstream chunks. An `Err` item ends the stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Opens one streaming completion call.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn open_stream(&self, request: CompletionRequest) -> Result<EventStream>;
}

/// Working copy of `messages` with `directive` first unless a system message
/// is already present.
pub fn with_system_directive(messages: &[ChatMessage], directive: &str) -> Vec<ChatMessage> {
    let mut working = Vec::with_capacity(messages.len() + 1);
    if !messages.iter().any(|m| m.role == Role::System) {
        working.push(ChatMessage::system(directive));
    }
    working.extend_from_slice(messages);
    working
}

pub struct Dispatcher {
    backend: Arc<dyn CompletionBackend>,
    models: Vec<String>,
    system_prompt: String,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn CompletionBackend>, models: Vec<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            backend,
            models,
            system_prompt: system_prompt.into(),
        }
    }

    /// Issue the single streaming call. Fallback across `models` is left to
    /// the provider; nothing is retried here.
    pub async fn dispatch(&self, messages: &[ChatMessage]) -> Result<EventStream> {
        let request = CompletionRequest {
            models: self.models.clone(),
            messages: with_system_directive(messages, &self.system_prompt),
            stream: true,
        };
        info!(
            models = ?request.models,
            message_count = request.messages.len(),
            "dispatching completion"
        );
        self.backend.open_stream(request).await
    }
}

// ---------------------------------------------------------------------------
// OpenRouter backend
// ---------------------------------------------------------------------------

pub struct OpenRouterBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl OpenRouterBackend {
    pub fn new(client: reqwest::Client, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenRouterBackend {
    async fn open_stream(&self, request: CompletionRequest) -> Result<EventStream> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::dispatch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::dispatch(format_failure(status.as_u16(), &body)));
        }

        Ok(chunk_stream(response.bytes_stream()))
    }
}

/// Human-readable description of a failed upstream call.
///
/// Prefers `error.message`, then an `error` string, then any other JSON
/// `error` value serialized, then the raw body, then the status line.
pub fn format_failure(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = error_message(&value) {
            return msg;
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {status}")
    } else {
        trimmed.to_string()
    }
}

fn error_message(value: &Value) -> Option<String> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    if let Some(msg) = error.get("message").and_then(Value::as_str) {
        return Some(msg.to_string());
    }
    if let Some(msg) = error.as_str() {
        return Some(msg.to_string());
    }
    Some(error.to_string())
}

// ---------------------------------------------------------------------------
// Upstream SSE parsing
// ---------------------------------------------------------------------------

enum SseLine {
    Skip,
    Done,
    Chunk(StreamChunk),
    Error(String),
}

fn parse_sse_line(raw: &[u8]) -> SseLine {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    // Blank separators and `: keep-alive` comments.
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "skipping unparseable upstream line");
            return SseLine::Skip;
        }
    };
    if let Some(msg) = error_message(&value) {
        return SseLine::Error(msg);
    }
    match serde_json::from_value::<StreamChunk>(value) {
        Ok(chunk) => SseLine::Chunk(chunk),
        Err(e) => {
            debug!(error = %e, "skipping upstream event with unexpected shape");
            SseLine::Skip
        }
    }
}

struct SseState {
    body: Pin<Box<dyn Stream<Item = std::result::Result<Vec<u8>, String>> + Send>>,
    buffer: Vec<u8>,
    finished: bool,
}

/// Turn an upstream SSE byte stream into chunks. Ends at `data: [DONE]` or
/// end of body; a transport error or in-band error event ends it with `Err`.
pub fn chunk_stream<S, B, E>(body: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + 'static,
    E: std::fmt::Display + 'static,
{
    let body = body.map(|item| item.map(|b| b.as_ref().to_vec()).map_err(|e| e.to_string()));
    let state = SseState {
        body: Box::pin(body),
        buffer: Vec::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            if let Some(pos) = st.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = st.buffer.drain(..=pos).collect();
                match parse_sse_line(&line) {
                    SseLine::Skip => continue,
                    SseLine::Done => return None,
                    SseLine::Chunk(chunk) => return Some((Ok(chunk), st)),
                    SseLine::Error(msg) => {
                        st.finished = true;
                        return Some((Err(RelayError::dispatch(msg)), st));
                    }
                }
            }

            match st.body.next().await {
                Some(Ok(bytes)) => st.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(RelayError::dispatch(e)), st));
                }
                None => {
                    st.finished = true;
                    let tail = std::mem::take(&mut st.buffer);
                    return match parse_sse_line(&tail) {
                        SseLine::Chunk(chunk) => Some((Ok(chunk), st)),
                        SseLine::Error(msg) => Some((Err(RelayError::dispatch(msg)), st)),
                        SseLine::Skip | SseLine::Done => None,
                    };
                }
            }
        }
    }))
}
