use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;

// -- Completion (OpenRouter-style) types -------------------------------------

/// Streaming chat-completions request with an ordered fallback model list.
#[derive(Debug, Serialize)]
pub struct CompletionRequest {
    pub models: Vec<String>,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One incremental chunk: both the upstream event shape and the payload of
/// every data frame on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

impl StreamChunk {
    /// A chunk carrying a single content delta.
    pub fn delta(content: impl Into<String>) -> Self {
        StreamChunk {
            choices: vec![StreamChoice {
                delta: StreamDelta {
                    content: Some(content.into()),
                },
                finish_reason: None,
            }],
        }
    }

    /// `choices[0].delta.content`, if present.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.delta.content.as_deref())
    }
}

// -- Moderation (chat-completions-shaped classifier) types -------------------

#[derive(Debug, Serialize)]
pub struct ModerationRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ModerationMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModerationChoice {
    #[serde(default)]
    pub message: Option<ModerationMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ModerationResponse {
    #[serde(default)]
    pub choices: Option<Vec<ModerationChoice>>,
}

impl ModerationResponse {
    /// `choices[0].message.content`, or `""` when any level is absent.
    pub fn first_content(&self) -> &str {
        self.choices
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.as_deref())
            .unwrap_or("")
    }
}

// -- Challenge verification types --------------------------------------------

#[derive(Debug, Serialize)]
pub struct SiteVerifyRequest {
    pub secret: String,
    pub response: String,
}

#[derive(Debug, Deserialize)]
pub struct SiteVerifyResponse {
    pub success: bool,
    #[serde(default, rename = "error-codes")]
    pub error_codes: Vec<String>,
}
