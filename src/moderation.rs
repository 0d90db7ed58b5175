//! Advisory moderation of the latest user message.
//!
//! The gate is fail-open: if the classifier cannot be reached, answers with a
//! non-2xx status, or returns a body that is not chat-completions shaped, the
//! message is treated as safe so a classifier outage does not block chat.
//! A well-formed answer whose first word is not `safe` is unsafe.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{RelayError, Result};
use crate::message::{ChatMessage, Role};
use crate::providers::{ModerationRequest, ModerationResponse};

#[async_trait]
pub trait Classifier: Send + Sync {
    /// `true` when `text` is safe.
    async fn classify(&self, text: &str) -> bool;
}

/// Most recent message with role `user`.
pub fn last_user_message(messages: &[ChatMessage]) -> Option<&ChatMessage> {
    messages.iter().rev().find(|m| m.role == Role::User)
}

/// Safe iff the first whitespace-delimited word, lower-cased, is `safe`.
pub fn parse_verdict(content: &str) -> bool {
    content
        .split_whitespace()
        .next()
        .is_some_and(|w| w.to_lowercase() == "safe")
}

/// Classifier backed by a chat-completions endpoint running a safety model.
pub struct ChatClassifier {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl ChatClassifier {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Classifier for ChatClassifier {
    async fn classify(&self, text: &str) -> bool {
        let request = ModerationRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(text)],
        };

        let resp = match self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "moderation check failed, allowing message");
                return true;
            }
        };

        if !resp.status().is_success() {
            warn!(status = resp.status().as_u16(), "moderation endpoint error, allowing message");
            return true;
        }

        match resp.json::<ModerationResponse>().await {
            Ok(parsed) => parse_verdict(parsed.first_content()),
            Err(e) => {
                warn!(error = %e, "moderation response unparseable, allowing message");
                true
            }
        }
    }
}

/// Run the gate over a conversation. Skipped when there is no user turn.
pub async fn moderate(messages: &[ChatMessage], classifier: &dyn Classifier) -> Result<()> {
    let Some(last) = last_user_message(messages) else {
        return Ok(());
    };
    if classifier.classify(&last.content).await {
        Ok(())
    } else {
        info!("message rejected by moderation");
        Err(RelayError::ContentPolicyViolation)
    }
}
