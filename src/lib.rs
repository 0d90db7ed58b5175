//! Moderated streaming chat relay.
//!
//! The server side accepts a conversation plus a single-use challenge token,
//! verifies the token, screens the latest user message, forwards the
//! conversation to a completion provider and re-frames the provider's
//! stream as `data: <json>\n\n` frames ending with `data: [DONE]\n\n`. The
//! client side acquires tokens, posts turns and decodes the frames back into
//! progressively rendered text.

pub mod cli;
pub mod client;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod message;
pub mod moderation;
pub mod providers;
pub mod server;
pub mod simulate;
pub mod token_source;
pub mod validator;

#[cfg(test)]
mod test_support;

pub use client::{ChatClient, ClientError};
pub use config::Config;
pub use decoder::{read_turn, FrameDecoder, Renderer, TurnOutcome, TurnStatus};
pub use dispatcher::{CompletionBackend, Dispatcher, EventStream};
pub use encoder::{encode, encode_frame, StreamFrame, DONE_FRAME};
pub use error::{RelayError, Result};
pub use message::{ChatMessage, ChatRequest, Role};
pub use moderation::Classifier;
pub use server::Relay;
pub use token_source::{StaticToken, TokenProvider, TokenSource};
pub use validator::ChallengeVerifier;
