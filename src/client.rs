//! Terminal-side chat adapter: history, one turn at a time.

use thiserror::Error;
use tracing::{info, warn};

use crate::decoder::{read_turn, Renderer};
use crate::error::ABORTED_MESSAGE;
use crate::message::{ChatMessage, ChatRequest, ErrorBody};
use crate::token_source::TokenProvider;

pub const WELCOME_MESSAGE: &str =
    "Hello! I'm an assistant created by Abhinav Pola. How can I help you today?";
pub const GENERIC_FAILURE: &str = "Failed to get response";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Verification unavailable. Please try again.")]
    VerificationUnavailable,

    /// The relay answered with a non-success status.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The stream ended without the sentinel; `partial` is what was shown.
    #[error("{}", ABORTED_MESSAGE)]
    Aborted { partial: String },
}

pub struct ChatClient {
    http: reqwest::Client,
    url: String,
    history: Vec<ChatMessage>,
}

impl ChatClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            history: vec![ChatMessage::assistant(WELCOME_MESSAGE)],
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Send `text` as the next user turn, rendering the reply as it grows.
    ///
    /// Blank input is ignored (`Ok(None)`). The token provider is reset after
    /// every attempted turn, successful or not. History only grows when the
    /// turn completes.
    pub async fn send_turn<R>(
        &mut self,
        text: &str,
        tokens: &dyn TokenProvider,
        renderer: &mut R,
    ) -> Result<Option<String>, ClientError>
    where
        R: Renderer + ?Sized,
    {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let result = self.run_turn(text, tokens, renderer).await;
        tokens.reset();
        result.map(Some)
    }

    async fn run_turn<R>(
        &mut self,
        text: &str,
        tokens: &dyn TokenProvider,
        renderer: &mut R,
    ) -> Result<String, ClientError>
    where
        R: Renderer + ?Sized,
    {
        let token = tokens
            .acquire_token()
            .await
            .filter(|t| !t.is_empty())
            .ok_or(ClientError::VerificationUnavailable)?;

        let user = ChatMessage::user(text);
        let mut messages = self.history.clone();
        messages.push(user.clone());
        let request = ChatRequest { messages, token };

        let response = self.http.post(&self.url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.error)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| GENERIC_FAILURE.to_string());
            warn!(status = status.as_u16(), error = %message, "chat request rejected");
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let outcome = read_turn(response.bytes_stream(), renderer).await;
        if !outcome.is_complete() {
            warn!(chars = outcome.text.len(), "turn ended without completion");
            return Err(ClientError::Aborted {
                partial: outcome.text,
            });
        }

        info!(chars = outcome.text.len(), "turn complete");
        self.history.push(user);
        self.history.push(ChatMessage::assistant(outcome.text.clone()));
        Ok(outcome.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{encode_frame, StreamFrame, DONE_FRAME};
    use crate::message::Role;
    use crate::test_support::spawn_stub;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTokens {
        token: Option<String>,
        acquired: AtomicUsize,
        resets: AtomicUsize,
    }

    impl CountingTokens {
        fn new(token: Option<&str>) -> Self {
            Self {
                token: token.map(str::to_string),
                acquired: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenProvider for CountingTokens {
        async fn acquire_token(&self) -> Option<String> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            self.token.clone()
        }

        fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sse(parts: &[&str], done: bool) -> String {
        let mut body: String = parts
            .iter()
            .map(|p| encode_frame(&StreamFrame::Delta(p.to_string())))
            .collect();
        if done {
            body.push_str(DONE_FRAME);
        }
        body
    }

    #[test]
    fn test_history_starts_with_welcome() {
        let client = ChatClient::new(reqwest::Client::new(), "http://127.0.0.1:1/");
        assert_eq!(client.history().len(), 1);
        assert_eq!(client.history()[0].role, Role::Assistant);
        assert_eq!(client.history()[0].content, WELCOME_MESSAGE);
    }

    #[tokio::test]
    async fn test_completed_turn_extends_history() {
        let stub = spawn_stub(200, "text/event-stream", &sse(&["Hello", " world"], true)).await;
        let mut client = ChatClient::new(reqwest::Client::new(), &stub.url);
        let tokens = CountingTokens::new(Some("tok-1"));
        let mut renders = Vec::new();

        let reply = client
            .send_turn("hi", &tokens, &mut |t: &str| renders.push(t.to_string()))
            .await
            .unwrap();

        assert_eq!(reply.as_deref(), Some("Hello world"));
        assert_eq!(renders.last().map(String::as_str), Some("Hello world"));
        assert_eq!(client.history().len(), 3);
        assert_eq!(client.history()[1], ChatMessage::user("hi"));
        assert_eq!(client.history()[2], ChatMessage::assistant("Hello world"));
        assert_eq!(tokens.resets.load(Ordering::SeqCst), 1);

        let sent: ChatRequest = serde_json::from_str(&stub.bodies()[0]).unwrap();
        assert_eq!(sent.token, "tok-1");
        assert_eq!(sent.messages.len(), 2);
        assert_eq!(sent.messages[0].content, WELCOME_MESSAGE);
        assert_eq!(sent.messages[1], ChatMessage::user("hi"));
    }

    #[tokio::test]
    async fn test_aborted_turn_keeps_partial_and_history() {
        let stub = spawn_stub(200, "text/event-stream", &sse(&["a", "b"], false)).await;
        let mut client = ChatClient::new(reqwest::Client::new(), &stub.url);
        let tokens = CountingTokens::new(Some("tok"));
        let mut last = String::new();

        let err = client
            .send_turn("hi", &tokens, &mut |t: &str| last = t.to_string())
            .await
            .unwrap_err();

        match err {
            ClientError::Aborted { partial } => assert_eq!(partial, "ab"),
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(last, "ab");
        assert_eq!(client.history().len(), 1);
        assert_eq!(tokens.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_surfaces_server_message() {
        let stub = spawn_stub(400, "application/json", r#"{"error":"Verification failed"}"#).await;
        let mut client = ChatClient::new(reqwest::Client::new(), &stub.url);
        let tokens = CountingTokens::new(Some("bad"));

        let err = client.send_turn("hi", &tokens, &mut |_: &str| {}).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { status: 400, .. }));
        assert_eq!(err.to_string(), "Verification failed");
        assert_eq!(tokens.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_without_json_uses_generic_message() {
        let stub = spawn_stub(502, "text/html", "<html>bad gateway</html>").await;
        let mut client = ChatClient::new(reqwest::Client::new(), &stub.url);
        let tokens = CountingTokens::new(Some("tok"));

        let err = client.send_turn("hi", &tokens, &mut |_: &str| {}).await.unwrap_err();
        assert_eq!(err.to_string(), GENERIC_FAILURE);
    }

    #[tokio::test]
    async fn test_missing_token_sends_nothing() {
        let stub = spawn_stub(200, "text/event-stream", &sse(&["x"], true)).await;
        let mut client = ChatClient::new(reqwest::Client::new(), &stub.url);
        let tokens = CountingTokens::new(None);

        let err = client.send_turn("hi", &tokens, &mut |_: &str| {}).await.unwrap_err();
        assert!(matches!(err, ClientError::VerificationUnavailable));
        assert!(stub.bodies().is_empty());
        assert_eq!(tokens.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let mut client = ChatClient::new(reqwest::Client::new(), "http://127.0.0.1:1/");
        let tokens = CountingTokens::new(Some("tok"));
        let out = client.send_turn("   ", &tokens, &mut |_: &str| {}).await.unwrap();
        assert!(out.is_none());
        assert_eq!(tokens.acquired.load(Ordering::SeqCst), 0);
        assert_eq!(tokens.resets.load(Ordering::SeqCst), 0);
    }
}
